//! 步骤执行器
//!
//! 对一个步骤的至多三个代码变体（`CODE_<id>A/B/C`）执行竞速（parallel）或回退（fallback）：
//! - parallel：变体作为独立任务提交到共享的 VariantPool（容量 3），等待全部结束；
//!   按完成顺序第一个成功者胜出，落败变体不会被取消，其快照照常记录。
//!   只有胜出者写入计划图，保证每步每轮至多一次成功写入。
//! - fallback：按 A、B、C 顺序依次尝试，首个成功即停止，之后的变体不执行也不产生快照。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::runner::{utc_now, CodeRunOutcome, CodeRunner, ExecutionContext, RunStatus};
use crate::core::VariantPool;
use crate::memory::{AgentSession, ExecutionSnapshot};
use crate::plan::PlanGraph;
use crate::tools::ToolRouter;

pub const VARIANT_LETTERS: [char; 3] = ['A', 'B', 'C'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Parallel,
    #[default]
    Fallback,
}

pub fn variant_key(step_id: &str, letter: char) -> String {
    format!("CODE_{step_id}{letter}")
}

/// 单个变体的结果，按变体标签标记
#[derive(Debug, Clone, Serialize)]
pub struct VariantResult {
    pub variant: String,
    pub status: RunStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl VariantResult {
    fn new(variant: &str, outcome: &CodeRunOutcome) -> Self {
        Self {
            variant: variant.to_string(),
            status: outcome.status,
            result: outcome.result.clone(),
            error: outcome.error.clone(),
        }
    }
}

/// 一个步骤的执行结果
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub status: RunStatus,
    /// 胜出变体
    pub variant: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub results: Vec<VariantResult>,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    fn failed(error: String, results: Vec<VariantResult>) -> Self {
        Self {
            status: RunStatus::Error,
            variant: None,
            result: None,
            error: Some(error),
            results,
        }
    }
}

pub struct StepExecutor {
    runner: Arc<dyn CodeRunner>,
    tools: Arc<ToolRouter>,
    pool: VariantPool,
}

/// 执行一个变体；执行器故障被包装为 error 结果
async fn run_variant(
    runner: &dyn CodeRunner,
    code: &str,
    ctx: &ExecutionContext,
    tools: Arc<ToolRouter>,
) -> CodeRunOutcome {
    let started = utc_now();
    let clock = Instant::now();
    match runner.run(code, ctx, tools, &ctx.session_id).await {
        Ok(outcome) => outcome,
        Err(e) => CodeRunOutcome::failure(e.to_string(), &started, clock.elapsed().as_secs_f64()),
    }
}

impl StepExecutor {
    pub fn new(runner: Arc<dyn CodeRunner>, tools: Arc<ToolRouter>, pool: VariantPool) -> Self {
        Self {
            runner,
            tools,
            pool,
        }
    }

    pub fn tools(&self) -> &Arc<ToolRouter> {
        &self.tools
    }

    /// 执行步骤 `step_id` 的变体。`label` 为带重试后缀的 ID（如 `3F2`），只用于快照与日志
    pub async fn execute(
        &self,
        step_id: &str,
        label: &str,
        variants: &BTreeMap<String, String>,
        graph: &mut PlanGraph,
        session: &mut AgentSession,
        mode: ExecutionMode,
    ) -> StepOutcome {
        let present: Vec<(String, String)> = VARIANT_LETTERS
            .iter()
            .map(|l| variant_key(step_id, *l))
            .filter_map(|key| variants.get(&key).map(|code| (key, code.clone())))
            .collect();

        if present.is_empty() {
            let error = format!("No valid variants to run for step {step_id}.");
            tracing::warn!(step_id = %label, "{}", error);
            if let Err(e) = graph.mark_failed(step_id, &error) {
                tracing::debug!(step_id = %step_id, error = %e, "mark_failed on unknown step");
            }
            return StepOutcome::failed(error, Vec::new());
        }

        let ctx = ExecutionContext {
            session_id: graph.session_id().to_string(),
            step_id: label.to_string(),
            globals: graph.globals().clone(),
        };

        match mode {
            ExecutionMode::Fallback => self.run_fallback(step_id, label, present, &ctx, graph, session).await,
            ExecutionMode::Parallel => self.run_parallel(step_id, label, present, &ctx, graph, session).await,
        }
    }

    async fn run_fallback(
        &self,
        step_id: &str,
        label: &str,
        present: Vec<(String, String)>,
        ctx: &ExecutionContext,
        graph: &mut PlanGraph,
        session: &mut AgentSession,
    ) -> StepOutcome {
        let mut results = Vec::new();
        for (variant, code) in present {
            let outcome = run_variant(self.runner.as_ref(), &code, ctx, self.tools.clone()).await;
            record_snapshot(session, label, &variant, &code, &outcome);
            results.push(VariantResult::new(&variant, &outcome));

            if outcome.is_success() {
                tracing::info!(step_id = %label, variant = %variant, "variant succeeded");
                let result = outcome.result.unwrap_or(Value::Object(Default::default()));
                commit_success(graph, step_id, result.clone());
                return StepOutcome {
                    status: RunStatus::Success,
                    variant: Some(variant),
                    result: Some(result),
                    error: None,
                    results,
                };
            }
            let error = outcome.error.unwrap_or_else(|| "Unknown error".to_string());
            tracing::warn!(step_id = %label, variant = %variant, error = %error, "variant failed");
            if let Err(e) = graph.mark_failed(step_id, &error) {
                tracing::debug!(step_id = %step_id, error = %e, "mark_failed on unknown step");
            }
        }
        tracing::error!(step_id = %label, "all fallback variants failed");
        StepOutcome::failed(aggregate_error("All fallback variants failed", &results), results)
    }

    async fn run_parallel(
        &self,
        step_id: &str,
        label: &str,
        present: Vec<(String, String)>,
        ctx: &ExecutionContext,
        graph: &mut PlanGraph,
        session: &mut AgentSession,
    ) -> StepOutcome {
        let mut tasks = FuturesUnordered::new();
        for (variant, code) in present {
            let runner = self.runner.clone();
            let tools = self.tools.clone();
            let pool = self.pool.clone();
            let task_ctx = ctx.clone();
            let task_code = code.clone();
            let handle = tokio::spawn(async move {
                let started = utc_now();
                match pool.acquire().await {
                    Ok(_permit) => run_variant(runner.as_ref(), &task_code, &task_ctx, tools).await,
                    Err(e) => CodeRunOutcome::failure(e.to_string(), &started, 0.0),
                }
            });
            tasks.push(async move { (variant, code, handle.await) });
        }

        // 按完成顺序收集；第一个成功者胜出，其余变体仍等待结束
        let mut finished: Vec<(String, String, CodeRunOutcome)> = Vec::new();
        let mut winner: Option<usize> = None;
        while let Some((variant, code, joined)) = tasks.next().await {
            let outcome = joined.unwrap_or_else(|e| {
                CodeRunOutcome::failure(format!("variant task aborted: {e}"), &utc_now(), 0.0)
            });
            if winner.is_none() && outcome.is_success() {
                tracing::info!(step_id = %label, variant = %variant, "variant won the race");
                winner = Some(finished.len());
            }
            finished.push((variant, code, outcome));
        }

        for (variant, code, outcome) in &finished {
            record_snapshot(session, label, variant, code, outcome);
        }
        let mut results: Vec<VariantResult> = finished
            .iter()
            .map(|(variant, _, outcome)| VariantResult::new(variant, outcome))
            .collect();
        results.sort_by(|a, b| a.variant.cmp(&b.variant));

        match winner {
            Some(idx) => {
                let (variant, _, outcome) = &finished[idx];
                let result = outcome
                    .result
                    .clone()
                    .unwrap_or(Value::Object(Default::default()));
                commit_success(graph, step_id, result.clone());
                StepOutcome {
                    status: RunStatus::Success,
                    variant: Some(variant.clone()),
                    result: Some(result),
                    error: None,
                    results,
                }
            }
            None => {
                let error = aggregate_error("All variants failed", &results);
                tracing::error!(step_id = %label, "{}", error);
                if let Err(e) = graph.mark_failed(step_id, &error) {
                    tracing::debug!(step_id = %step_id, error = %e, "mark_failed on unknown step");
                }
                StepOutcome::failed(error, results)
            }
        }
    }
}

fn record_snapshot(session: &mut AgentSession, label: &str, variant: &str, code: &str, outcome: &CodeRunOutcome) {
    let run_id = uuid::Uuid::new_v4().to_string();
    session.add_execution_snapshot(ExecutionSnapshot::new(&run_id, label, variant, code, outcome));
}

fn commit_success(graph: &mut PlanGraph, step_id: &str, result: Value) {
    let written = graph
        .update_result(step_id, result)
        .and_then(|_| graph.mark_completed(step_id));
    if let Err(e) = written {
        tracing::warn!(step_id = %step_id, error = %e, "could not record step result");
    }
}

fn aggregate_error(head: &str, results: &[VariantResult]) -> String {
    let details: Vec<String> = results
        .iter()
        .map(|r| format!("{}: {}", r.variant, r.error.as_deref().unwrap_or("unknown error")))
        .collect();
    format!("{head}. {}", details.join("; "))
}
