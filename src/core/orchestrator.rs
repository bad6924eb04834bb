//! Agent 编排器：主控循环
//!
//! 驱动 感知 → 规划 → 执行 → 感知 … → 汇总 的状态机。控制流严格串行，同一时刻至多一个 oracle 调用；
//! 唯一的并发在 StepExecutor 的 parallel 模式内部。任何组件故障都被吸收为图或会话状态，
//! `run` 永不返回错误。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::action::runner::utc_now;
use crate::action::StepExecutor;
use crate::config::{AgentSection, ReplanPolicy};
use crate::core::{PhaseTracker, RecoveryAction, RecoveryEngine, RetryTracker, RunPhase};
use crate::memory::{
    AgentSession, DecisionSnapshot, MemorySearch, PerceptionSnapshot, RecordStatus,
    SessionLogStore, SessionRecord, SummarizerSnapshot,
};
use crate::observability::log_json_block;
use crate::oracle::{
    Perceiver, PerceiverInput, PerceptionOutput, PlanMode, PlanOutput, Planner, PlannerInput,
    Route, SnapshotType, Summarizer, SummarizerInput,
};
use crate::plan::{PlanGraph, StepType, ROOT_ID};

pub const INITIAL_INVALID_ROUTE_MESSAGE: &str = "Summary generation failed.";
pub const INVALID_ROUTE_MESSAGE: &str = "Invalid route from perception.";
pub const HALT_MESSAGE: &str = "Agent halted after max iterations.";
pub const ROOT_HALT_MESSAGE: &str = "ROOT failed too many times.";

const HALT_REASON: &str = "Agent halted after max iterations or step failures.";
const SUCCESS_REASON: &str = "Summarized successfully";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Halted,
    InvalidRoute,
}

/// 一次运行的结果：成功时 message 为汇总文本，否则为简短的人类可读说明
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub status: OutcomeStatus,
    pub message: String,
    pub session_id: String,
    /// 持久化记录的路径（未写入时为 None）
    pub record_path: Option<PathBuf>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// 单次运行的可变状态，仅由编排循环持有
struct RunState {
    graph: PlanGraph,
    session: AgentSession,
    tracker: RetryTracker,
    phase: PhaseTracker,
    memory: Value,
    perception: PerceptionOutput,
    target: String,
    variants: BTreeMap<String, String>,
    /// 目标因重试耗尽被强制回到 ROOT，下一轮执行重新规划
    replan_pending: bool,
    archived: usize,
}

pub struct AgentLoop {
    perceiver: Arc<dyn Perceiver>,
    planner: Arc<dyn Planner>,
    summarizer: Arc<dyn Summarizer>,
    executor: StepExecutor,
    memory: Arc<dyn MemorySearch>,
    store: SessionLogStore,
    settings: AgentSection,
    memory_top_k: usize,
    recovery: RecoveryEngine,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        perceiver: Arc<dyn Perceiver>,
        planner: Arc<dyn Planner>,
        summarizer: Arc<dyn Summarizer>,
        executor: StepExecutor,
        memory: Arc<dyn MemorySearch>,
        store: SessionLogStore,
        settings: AgentSection,
        memory_top_k: usize,
    ) -> Self {
        Self {
            perceiver,
            planner,
            summarizer,
            executor,
            memory,
            store,
            settings,
            memory_top_k,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn settings(&self) -> &AgentSection {
        &self.settings
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub async fn run(&self, query: &str) -> RunOutcome {
        let mut st = self.init(query);
        st.phase.transition(RunPhase::PerceiveInitial);
        self.perceive(&mut st, ROOT_ID, SnapshotType::UserQuery).await;

        if st.perception.should_summarize() {
            st.phase.transition(RunPhase::EarlyExit);
            return self.summarize(st).await;
        }
        if st.perception.route != Route::Decision {
            tracing::error!(session_id = %st.graph.session_id(), "invalid perception route, exiting");
            st.phase.transition(RunPhase::InvalidRouteAbort);
            return Self::outcome(&st, OutcomeStatus::InvalidRoute, INITIAL_INVALID_ROUTE_MESSAGE, None);
        }

        st.phase.transition(RunPhase::Plan);
        let input = PlannerInput::from_graph(
            &st.graph,
            &st.perception,
            PlanMode::Initial,
            &self.settings.planning_strategy,
        );
        let plan = self.plan(&mut st, &input).await;
        merge_plan(&mut st.graph, &plan, ROOT_ID, "normal");
        adopt_plan(&mut st, plan);

        st.phase.transition(RunPhase::ExecuteLoop);
        self.execute_loop(st).await
    }

    /// INIT：新建计划图，检索历史记忆并写入全局变量区
    fn init(&self, query: &str) -> RunState {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut graph = PlanGraph::new(&session_id, query);
        let hits = self.memory.search(query, self.memory_top_k);
        tracing::info!(session_id = %session_id, hits = hits.len(), "memory search");
        let memory = serde_json::to_value(&hits).unwrap_or(Value::Array(Vec::new()));
        graph.write_global("memory", memory.clone(), ROOT_ID);

        RunState {
            session: AgentSession::new(&session_id, query),
            phase: PhaseTracker::new(&session_id),
            tracker: RetryTracker::new(self.settings.max_steps, self.settings.max_retries),
            graph,
            memory,
            perception: PerceptionOutput::default(),
            target: ROOT_ID.to_string(),
            variants: BTreeMap::new(),
            replan_pending: false,
            archived: 0,
        }
    }

    async fn execute_loop(&self, mut st: RunState) -> RunOutcome {
        let mode = self.settings.execution_mode;
        while st.tracker.should_continue() {
            st.tracker.increment();
            tracing::info!(
                session_id = %st.graph.session_id(),
                iteration = st.tracker.tries(),
                step_id = %st.target,
                "loop iteration"
            );

            if st.replan_pending {
                if self.replan(&mut st).await {
                    st.replan_pending = false;
                } else if self.recovery.on_step_failure(&mut st.tracker, ROOT_ID) == RecoveryAction::Halt {
                    tracing::error!(session_id = %st.graph.session_id(), "ROOT failed too many times, halting");
                    return self.halt(st, ROOT_HALT_MESSAGE);
                }
                continue;
            }

            if st.graph.is_completed(&st.target) {
                tracing::debug!(step_id = %st.target, "step already completed, advancing");
                st.target = st.graph.first_pending();
                continue;
            }

            let step_id = st.target.clone();
            if !st.graph.contains(&step_id) {
                st.graph
                    .add_step(&step_id, "Step requested by planner", StepType::Code, Some(ROOT_ID), "normal");
            }
            let label = st.tracker.retry_step_id(&step_id);
            let outcome = self
                .executor
                .execute(&step_id, &label, &st.variants, &mut st.graph, &mut st.session, mode)
                .await;

            if !outcome.is_success() {
                match self.recovery.on_step_failure(&mut st.tracker, &step_id) {
                    RecoveryAction::RetryStep => {}
                    RecoveryAction::ReplanFromRoot => {
                        tracing::warn!(step_id = %step_id, "step failed too many times, forcing replan");
                        if self.settings.replan_policy == ReplanPolicy::ArchiveSubtree {
                            st.archived += 1;
                            let suffix = format!("X{}", st.archived);
                            for (old, new) in st.graph.rename_subtree_from(&step_id, &suffix) {
                                st.tracker.rename_step(&old, &new);
                            }
                        }
                        st.target = ROOT_ID.to_string();
                        st.replan_pending = true;
                    }
                    RecoveryAction::Halt => return self.halt(st, ROOT_HALT_MESSAGE),
                }
                continue;
            }

            self.perceive(&mut st, &step_id, SnapshotType::StepResult).await;
            if st.perception.should_summarize() {
                st.phase.transition(RunPhase::Success);
                return self.summarize(st).await;
            }
            if st.perception.route != Route::Decision {
                tracing::error!(step_id = %step_id, "invalid route from perception, exiting");
                st.phase.transition(RunPhase::InvalidRouteAbort);
                st.session.mark_failed();
                let path = self.persist(&st, RecordStatus::Failed, INVALID_ROUTE_MESSAGE, None);
                return Self::outcome(&st, OutcomeStatus::InvalidRoute, INVALID_ROUTE_MESSAGE, path);
            }

            let input = PlannerInput::from_graph(
                &st.graph,
                &st.perception,
                PlanMode::MidSession,
                &self.settings.planning_strategy,
            );
            let plan = self.plan(&mut st, &input).await;
            merge_plan(&mut st.graph, &plan, &step_id, "normal");
            adopt_plan(&mut st, plan);
        }
        tracing::error!(session_id = %st.graph.session_id(), step_id = %st.target, "max steps reached");
        self.halt(st, HALT_MESSAGE)
    }

    /// 从 ROOT 重新规划；返回是否得到了可执行的目标
    async fn replan(&self, st: &mut RunState) -> bool {
        let input = PlannerInput::from_graph(
            &st.graph,
            &st.perception,
            PlanMode::Replan,
            &self.settings.planning_strategy,
        );
        let plan = self.plan(st, &input).await;
        merge_plan(&mut st.graph, &plan, ROOT_ID, "replan");
        adopt_plan(st, plan)
    }

    async fn perceive(&self, st: &mut RunState, step_id: &str, snapshot_type: SnapshotType) {
        let input = PerceiverInput::from_graph(&st.graph, &st.memory, snapshot_type);
        let decoded = self.perceiver.perceive(&input).await;
        if let Some(reason) = decoded.fallback_reason() {
            tracing::warn!(step_id = %step_id, reason = %reason, "perception fell back to defaults");
        }
        let output = decoded.into_value();
        st.session.add_perception_snapshot(PerceptionSnapshot {
            run_id: input.run_id.clone(),
            snapshot_type,
            output: output.clone(),
            timestamp: utc_now(),
        });
        let value = serde_json::to_value(&output).unwrap_or(Value::Null);
        log_json_block(&format!("Perception output ({step_id})"), &value);
        st.graph.attach_perception(step_id, value);
        st.perception = output;
    }

    async fn plan(&self, st: &mut RunState, input: &PlannerInput) -> PlanOutput {
        let decoded = self.planner.plan(input).await;
        if let Some(reason) = decoded.fallback_reason() {
            tracing::warn!(reason = %reason, "planner fell back to an empty plan");
        }
        let plan = decoded.into_value();
        let output = serde_json::to_value(&plan).unwrap_or(Value::Null);
        log_json_block("Decision output", &output);
        st.session.add_decision_snapshot(DecisionSnapshot {
            run_id: uuid::Uuid::new_v4().to_string(),
            input: serde_json::to_value(input).unwrap_or(Value::Null),
            plan_graph: serde_json::to_value(&plan.plan_graph).unwrap_or(Value::Null),
            next_step_id: plan.next_step_id.clone(),
            code_variants: plan.code_variants.clone(),
            output,
            timestamp: utc_now(),
        });
        plan
    }

    /// 汇总并以成功结束：pending 节点标为 skipped，摘要写入图记忆，会话完成并持久化
    async fn summarize(&self, mut st: RunState) -> RunOutcome {
        st.graph.skip_pending();
        let input = SummarizerInput::from_graph(&st.graph, &st.perception);
        let decoded = self.summarizer.summarize(&input).await;
        let success = !decoded.is_fallback();
        let error = decoded.fallback_reason().map(str::to_string);
        let summary = decoded.into_value();

        st.session.add_summarizer_snapshot(SummarizerSnapshot {
            run_id: uuid::Uuid::new_v4().to_string(),
            input: serde_json::to_value(&input).unwrap_or(Value::Null),
            summary_output: summary.clone(),
            success,
            error,
            timestamp: utc_now(),
        });
        st.graph.attach_summary(&summary);
        let perception = st.perception.clone();
        st.session.mark_complete(&perception, Some(summary.clone()));
        let path = self.persist(&st, RecordStatus::Success, SUCCESS_REASON, Some(summary.clone()));
        tracing::info!(session_id = %st.graph.session_id(), "run finished with summary");
        Self::outcome(&st, OutcomeStatus::Success, &summary, path)
    }

    fn halt(&self, mut st: RunState, message: &str) -> RunOutcome {
        st.phase.transition(RunPhase::Halted);
        st.session.mark_failed();
        let path = self.persist(&st, RecordStatus::Failed, HALT_REASON, None);
        Self::outcome(&st, OutcomeStatus::Halted, message, path)
    }

    /// 写入诊断记录；写入失败只记录日志
    fn persist(
        &self,
        st: &RunState,
        status: RecordStatus,
        reason: &str,
        final_summary: Option<String>,
    ) -> Option<PathBuf> {
        let record = SessionRecord {
            context: st.graph.snapshot(),
            session: st.session.clone(),
            status,
            final_step_id: st.graph.latest_node().map(str::to_string),
            reason: reason.to_string(),
            timestamp: utc_now(),
            original_query: st.graph.original_query().to_string(),
            final_summary,
        };
        match self.store.save(&record) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(session_id = %st.graph.session_id(), error = %e, "failed to persist session record");
                None
            }
        }
    }

    fn outcome(st: &RunState, status: OutcomeStatus, message: &str, record_path: Option<PathBuf>) -> RunOutcome {
        RunOutcome {
            status,
            message: message.to_string(),
            session_id: st.graph.session_id().to_string(),
            record_path,
        }
    }
}

/// 把规划出的节点并入计划图；已存在且非 pending 的 ID 跳过，避免覆盖已完成或已失败的步骤
fn merge_plan(graph: &mut PlanGraph, plan: &PlanOutput, parent: &str, edge_type: &str) {
    for node in &plan.plan_graph.nodes {
        let id = node.id.trim();
        if id.is_empty() || id == ROOT_ID {
            continue;
        }
        if graph.node(id).is_some_and(|n| !n.is_pending()) {
            tracing::debug!(step_id = %id, "plan node already settled, skipping");
            continue;
        }
        graph.add_step(id, &node.description, StepType::Code, Some(parent), edge_type);
    }
}

/// 采用规划结果作为下一目标；next_step_id 缺失时退回第一个 pending 节点。返回目标是否为非 ROOT 步骤
fn adopt_plan(st: &mut RunState, plan: PlanOutput) -> bool {
    st.variants = plan.code_variants;
    let next = plan.next_step_id.trim();
    st.target = if next.is_empty() {
        tracing::warn!("plan has no next_step_id, picking first pending step");
        st.graph.first_pending()
    } else {
        next.to_string()
    };
    st.target != ROOT_ID
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{PlanNodeSpec, PlanGraphSpec};
    use crate::plan::StepStatus;

    fn plan_with(ids: &[&str], next: &str) -> PlanOutput {
        PlanOutput {
            plan_graph: PlanGraphSpec {
                nodes: ids
                    .iter()
                    .map(|id| PlanNodeSpec {
                        id: id.to_string(),
                        description: format!("step {id}"),
                    })
                    .collect(),
            },
            next_step_id: next.to_string(),
            code_variants: BTreeMap::new(),
        }
    }

    #[test]
    fn test_merge_skips_settled_nodes() {
        let mut graph = PlanGraph::new("s1", "q");
        graph.add_step("0", "old", StepType::Code, Some(ROOT_ID), "normal");
        graph.update_result("0", serde_json::json!({"a": 1})).unwrap();
        graph.add_step("1", "pending", StepType::Code, Some(ROOT_ID), "normal");

        merge_plan(&mut graph, &plan_with(&["0", "1", "2", "ROOT"], "2"), ROOT_ID, "replan");

        assert_eq!(graph.node("0").unwrap().description, "old");
        assert_eq!(graph.node("0").unwrap().status, StepStatus::Completed);
        assert_eq!(graph.node("1").unwrap().description, "step 1");
        assert!(graph.contains("2"));
        assert_eq!(graph.nodes().count(), 4);
    }
}
