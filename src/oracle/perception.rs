//! 感知 oracle
//!
//! 判断原始目标 / 当前步骤目标是否达成，并给出路由（继续规划或进入汇总）。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::action::runner::utc_now;
use crate::llm::LlmClient;
use crate::oracle::{decode_llm_json, render_messages, Decoded, Perceiver};
use crate::plan::{GraphData, PlanGraph, StepNode};

const REQUIRED_KEYS: &[&str] = &[
    "entities",
    "result_requirement",
    "original_goal_achieved",
    "reasoning",
    "local_goal_achieved",
    "local_reasoning",
    "last_tooluse_summary",
    "solution_summary",
    "confidence",
    "route",
];

/// 路由为 summarize 且未给出汇总指令时补上的默认值
pub const DEFAULT_SUMMARIZE_INSTRUCTION: &str =
    "Summarize the final results clearly. Format as plain text.";

/// globals_schema 预览长度
const GLOBALS_PREVIEW_CHARS: usize = 120;

pub const BUILTIN_PROMPT: &str = "You are the perception module of an autonomous agent. \
Read the JSON input describing the user's query, the current plan graph and the globals produced so far. \
Decide whether the original goal is achieved (original_goal_achieved) and whether the latest step achieved its local goal \
(local_goal_achieved). Set route to \"summarize\" when the collected globals are enough to answer, otherwise \"decision\".";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Decision,
    Summarize,
    /// 任何其他取值；编排器视为致命错误
    #[serde(other)]
    #[schemars(skip)]
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PerceptionOutput {
    #[serde(default)]
    pub entities: Vec<String>,
    pub result_requirement: String,
    pub original_goal_achieved: bool,
    pub reasoning: String,
    pub local_goal_achieved: bool,
    pub local_reasoning: String,
    pub last_tooluse_summary: String,
    pub solution_summary: String,
    /// 数值以字符串保存（兼容模型直接给出数字）
    #[serde(deserialize_with = "string_or_number")]
    #[schemars(with = "String")]
    pub confidence: String,
    pub route: Route,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_to_summarize: Option<String>,
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Null => "0.0".to_string(),
        other => other.to_string(),
    })
}

impl PerceptionOutput {
    /// 模型不可达时的安全默认值
    pub fn unavailable() -> Self {
        Self {
            result_requirement: "Unavailable due to model error.".to_string(),
            reasoning: "Model was not reachable.".to_string(),
            local_reasoning: "N/A".to_string(),
            solution_summary: "Model unavailable.".to_string(),
            ..Self::default()
        }
    }

    /// 模型输出无法解析时的安全默认值
    pub fn malformed() -> Self {
        Self::default()
    }

    /// 目标已达成或路由为 summarize
    pub fn should_summarize(&self) -> bool {
        self.original_goal_achieved || self.route == Route::Summarize
    }

    fn fill_summarize_instruction(&mut self) {
        if self.route == Route::Summarize && self.instruction_to_summarize.is_none() {
            self.instruction_to_summarize = Some(DEFAULT_SUMMARIZE_INSTRUCTION.to_string());
        }
    }
}

impl Default for PerceptionOutput {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            result_requirement: "N/A".to_string(),
            original_goal_achieved: false,
            reasoning: "Perception failed to parse model output as JSON.".to_string(),
            local_goal_achieved: false,
            local_reasoning: "Could not extract structured information.".to_string(),
            last_tooluse_summary: "None".to_string(),
            solution_summary: "Not ready yet".to_string(),
            confidence: "0.0".to_string(),
            route: Route::Decision,
            instruction_to_summarize: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotType {
    UserQuery,
    StepResult,
}

/// 感知输入：查询、记忆摘录与计划图派生的上下文
#[derive(Debug, Clone, Serialize)]
pub struct PerceiverInput {
    pub current_time: String,
    pub run_id: String,
    pub snapshot_type: SnapshotType,
    pub original_query: String,
    pub raw_input: String,
    pub memory_excerpt: Value,
    pub current_plan: GraphData,
    pub completed_steps: Vec<StepNode>,
    pub failed_steps: Vec<StepNode>,
    pub globals_schema: Map<String, Value>,
    pub timestamp: String,
}

impl PerceiverInput {
    pub fn from_graph(graph: &PlanGraph, memory: &Value, snapshot_type: SnapshotType) -> Self {
        let raw_input = match snapshot_type {
            SnapshotType::UserQuery => graph.original_query().to_string(),
            SnapshotType::StepResult => Value::Object(graph.globals().clone()).to_string(),
        };
        let now = utc_now();
        Self {
            current_time: now.clone(),
            run_id: format!("{}-P", graph.session_id()),
            snapshot_type,
            original_query: graph.original_query().to_string(),
            raw_input,
            memory_excerpt: memory.clone(),
            current_plan: graph.graph_data(),
            completed_steps: graph.completed_steps().into_iter().cloned().collect(),
            failed_steps: graph.failed_steps().into_iter().cloned().collect(),
            globals_schema: graph.globals_schema(GLOBALS_PREVIEW_CHARS),
            timestamp: now,
        }
    }
}

/// 由 LLM 支撑的 Perceiver
pub struct LlmPerceiver {
    llm: Arc<dyn LlmClient>,
    template: String,
}

impl LlmPerceiver {
    pub fn new(llm: Arc<dyn LlmClient>, template: impl Into<String>) -> Self {
        Self {
            llm,
            template: template.into(),
        }
    }
}

#[async_trait]
impl Perceiver for LlmPerceiver {
    async fn perceive(&self, input: &PerceiverInput) -> Decoded<PerceptionOutput> {
        let messages = render_messages::<PerceptionOutput, _>(&self.template, None, input);
        let text = match self.llm.complete(&messages).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(run_id = %input.run_id, error = %e, "perception LLM unavailable");
                return Decoded::Fallback {
                    value: PerceptionOutput::unavailable(),
                    reason: format!("LLM unavailable: {e}"),
                };
            }
        };
        match decode_llm_json::<PerceptionOutput>(&text, REQUIRED_KEYS) {
            Ok(mut out) => {
                out.fill_summarize_instruction();
                Decoded::Parsed(out)
            }
            Err(e) => {
                tracing::warn!(run_id = %input.run_id, error = %e, "perception output malformed");
                Decoded::Fallback {
                    value: PerceptionOutput::malformed(),
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use serde_json::json;

    fn input() -> PerceiverInput {
        let graph = PlanGraph::new("s1", "What is 2+3?");
        PerceiverInput::from_graph(&graph, &json!([]), SnapshotType::UserQuery)
    }

    fn full_output(route: &str) -> String {
        json!({
            "entities": ["2", "3"],
            "result_requirement": "A number",
            "original_goal_achieved": false,
            "reasoning": "Need to add",
            "local_goal_achieved": false,
            "local_reasoning": "Nothing executed yet",
            "last_tooluse_summary": "None",
            "solution_summary": "Not ready yet",
            "confidence": 0.8,
            "route": route
        })
        .to_string()
    }

    #[test]
    fn test_input_carries_query_context() {
        let inp = input();
        assert_eq!(inp.run_id, "s1-P");
        assert_eq!(inp.raw_input, "What is 2+3?");
        assert_eq!(inp.current_plan.nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_parses_numeric_confidence() {
        let llm = Arc::new(ScriptedLlmClient::new([format!("```json\n{}\n```", full_output("decision"))]));
        let out = LlmPerceiver::new(llm, BUILTIN_PROMPT).perceive(&input()).await;
        let Decoded::Parsed(p) = out else {
            panic!("expected parsed output");
        };
        assert_eq!(p.confidence, "0.8");
        assert_eq!(p.route, Route::Decision);
        assert!(p.instruction_to_summarize.is_none());
    }

    #[tokio::test]
    async fn test_summarize_route_gets_default_instruction() {
        let llm = Arc::new(ScriptedLlmClient::new([full_output("summarize")]));
        let out = LlmPerceiver::new(llm, BUILTIN_PROMPT).perceive(&input()).await.into_value();
        assert!(out.should_summarize());
        assert_eq!(
            out.instruction_to_summarize.as_deref(),
            Some(DEFAULT_SUMMARIZE_INSTRUCTION)
        );
    }

    #[tokio::test]
    async fn test_unknown_route_is_invalid() {
        let llm = Arc::new(ScriptedLlmClient::new([full_output("conclude")]));
        let out = LlmPerceiver::new(llm, BUILTIN_PROMPT).perceive(&input()).await;
        assert!(!out.is_fallback());
        assert_eq!(out.value().route, Route::Invalid);
    }

    #[tokio::test]
    async fn test_missing_keys_and_outage_degrade_to_decision() {
        let llm = Arc::new(ScriptedLlmClient::new([r#"{"route": "summarize"}"#]));
        let perceiver = LlmPerceiver::new(llm, BUILTIN_PROMPT);
        let malformed = perceiver.perceive(&input()).await;
        assert!(malformed.is_fallback());
        assert_eq!(malformed.value().route, Route::Decision);
        assert!(!malformed.value().original_goal_achieved);

        // 脚本已耗尽：等同于后端不可达
        let outage = perceiver.perceive(&input()).await;
        assert!(outage.fallback_reason().unwrap().contains("LLM unavailable"));
        assert_eq!(outage.value().route, Route::Decision);
    }

    #[tokio::test]
    async fn test_prompt_includes_schema() {
        let llm = Arc::new(ScriptedLlmClient::new([full_output("decision")]));
        LlmPerceiver::new(llm.clone(), BUILTIN_PROMPT).perceive(&input()).await;
        let sent = &llm.requests()[0];
        assert!(sent[0].content.contains("local_goal_achieved"));
        assert!(sent[1].content.contains("What is 2+3?"));
    }
}
