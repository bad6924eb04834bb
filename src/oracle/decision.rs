//! 规划 oracle
//!
//! 根据感知结果产出计划节点、下一步 ID，以及每个步骤至多三个代码变体（`CODE_<id>A/B/C`）。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::action::runner::utc_now;
use crate::llm::LlmClient;
use crate::oracle::{decode_llm_json, render_messages, Decoded, PerceptionOutput, Planner};
use crate::plan::{GraphData, PlanGraph, StepNode};
use crate::tools::ToolRouter;

const REQUIRED_KEYS: &[&str] = &["plan_graph", "next_step_id", "code_variants"];

const GLOBALS_PREVIEW_CHARS: usize = 500;

pub const BUILTIN_PROMPT: &str = "You are the decision module of an autonomous agent. \
Given the perception and the current plan graph, produce plan_graph.nodes (each with id and description), \
the next_step_id to execute, and code_variants: up to three alternative tool scripts per step keyed \
CODE_<step_id>A, CODE_<step_id>B, CODE_<step_id>C. A tool script has one statement per line, either \
`name = tool(arg, ...)` or a bare `tool(arg, ...)` whose value is bound to `result`. Arguments are JSON \
literals or names bound by earlier lines or listed in globals_schema. Never reuse the id of a completed or failed step.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    Initial,
    MidSession,
    /// 步骤耗尽重试预算后从 ROOT 重新规划
    Replan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanNodeSpec {
    #[serde(deserialize_with = "id_from_any")]
    #[schemars(with = "String")]
    pub id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanGraphSpec {
    #[serde(default)]
    pub nodes: Vec<PlanNodeSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanOutput {
    pub plan_graph: PlanGraphSpec,
    #[serde(deserialize_with = "id_from_any")]
    #[schemars(with = "String")]
    pub next_step_id: String,
    /// `CODE_<step_id><A|B|C>` -> 工具脚本
    pub code_variants: BTreeMap<String, String>,
}

/// 步骤 ID 兼容数字写法
fn id_from_any<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// 规划输入
#[derive(Debug, Clone, Serialize)]
pub struct PlannerInput {
    pub current_time: String,
    pub plan_mode: PlanMode,
    pub planning_strategy: String,
    pub original_query: String,
    pub perception: PerceptionOutput,
    pub plan_graph: GraphData,
    pub completed_steps: Vec<StepNode>,
    pub failed_steps: Vec<StepNode>,
    pub globals_schema: Map<String, Value>,
}

impl PlannerInput {
    pub fn from_graph(
        graph: &PlanGraph,
        perception: &PerceptionOutput,
        plan_mode: PlanMode,
        planning_strategy: &str,
    ) -> Self {
        Self {
            current_time: utc_now(),
            plan_mode,
            planning_strategy: planning_strategy.to_string(),
            original_query: graph.original_query().to_string(),
            perception: perception.clone(),
            plan_graph: graph.graph_data(),
            completed_steps: graph.completed_steps().into_iter().cloned().collect(),
            failed_steps: graph.failed_steps().into_iter().cloned().collect(),
            globals_schema: graph.globals_schema(GLOBALS_PREVIEW_CHARS),
        }
    }
}

/// 由 LLM 支撑的 Planner；提示词中附带当前可用工具列表
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    template: String,
    tools: Arc<ToolRouter>,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, template: impl Into<String>, tools: Arc<ToolRouter>) -> Self {
        Self {
            llm,
            template: template.into(),
            tools,
        }
    }

    fn tool_section(&self) -> String {
        let lines: Vec<String> = self
            .tools
            .describe_all()
            .lines()
            .map(|l| format!("- `{}`", l.trim()))
            .collect();
        format!("### The ONLY Available Tools\n\n---\n\n{}", lines.join("\n"))
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, input: &PlannerInput) -> Decoded<PlanOutput> {
        let tools = self.tool_section();
        let messages = render_messages::<PlanOutput, _>(&self.template, Some(&tools), input);
        let text = match self.llm.complete(&messages).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "decision LLM unavailable");
                return Decoded::Fallback {
                    value: PlanOutput::default(),
                    reason: format!("Decision LLM unavailable: {e}"),
                };
            }
        };
        match decode_llm_json::<PlanOutput>(&text, REQUIRED_KEYS) {
            Ok(out) => Decoded::Parsed(out),
            Err(e) => {
                tracing::warn!(error = %e, "decision output malformed");
                Decoded::Fallback {
                    value: PlanOutput::default(),
                    reason: format!("Decision failed due to malformed response: {e}"),
                }
            }
        }
    }
}
