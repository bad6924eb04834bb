//! 会话历史
//!
//! 一次运行中所有 oracle 调用与变体执行的不可变审计记录，成功或停止时随上下文快照一起持久化。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::runner::utc_now;
use crate::action::{CodeRunOutcome, RunStatus};
use crate::oracle::{PerceptionOutput, SnapshotType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerceptionSnapshot {
    pub run_id: String,
    pub snapshot_type: SnapshotType,
    #[serde(flatten)]
    pub output: PerceptionOutput,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionSnapshot {
    pub run_id: String,
    pub input: Value,
    pub output: Value,
    pub next_step_id: String,
    pub plan_graph: Value,
    pub code_variants: BTreeMap<String, String>,
    pub timestamp: String,
}

/// 单个变体的一次执行；无论成败都会追加
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub run_id: String,
    pub step_id: String,
    pub variant_used: String,
    pub code: String,
    pub status: RunStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time: String,
    pub total_time: String,
}

impl ExecutionSnapshot {
    pub fn new(run_id: &str, step_id: &str, variant: &str, code: &str, outcome: &CodeRunOutcome) -> Self {
        Self {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            variant_used: variant.to_string(),
            code: code.to_string(),
            status: outcome.status,
            result: outcome.result.clone(),
            error: outcome.error.clone(),
            execution_time: outcome.execution_time.clone(),
            total_time: outcome.total_time.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerSnapshot {
    pub run_id: String,
    pub input: Value,
    pub summary_output: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Success,
    Failed,
}

/// 完成时从最后一次感知提取的结论
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub original_goal_achieved: bool,
    pub final_answer: Option<String>,
    pub confidence: String,
    pub reasoning_note: String,
    pub solution_summary: String,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            original_goal_achieved: false,
            final_answer: None,
            confidence: "0.0".to_string(),
            reasoning_note: String::new(),
            solution_summary: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: String,
    pub original_query: String,
    pub perception_snapshots: Vec<PerceptionSnapshot>,
    pub decision_snapshots: Vec<DecisionSnapshot>,
    pub execution_snapshots: Vec<ExecutionSnapshot>,
    pub summarizer_snapshots: Vec<SummarizerSnapshot>,
    pub final_summary: Option<String>,
    pub status: SessionStatus,
    pub completed_at: Option<String>,
    pub state: SessionState,
}

impl AgentSession {
    pub fn new(session_id: impl Into<String>, original_query: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            original_query: original_query.into(),
            perception_snapshots: Vec::new(),
            decision_snapshots: Vec::new(),
            execution_snapshots: Vec::new(),
            summarizer_snapshots: Vec::new(),
            final_summary: None,
            status: SessionStatus::InProgress,
            completed_at: None,
            state: SessionState::default(),
        }
    }

    pub fn add_perception_snapshot(&mut self, snapshot: PerceptionSnapshot) {
        self.perception_snapshots.push(snapshot);
    }

    pub fn add_decision_snapshot(&mut self, snapshot: DecisionSnapshot) {
        self.decision_snapshots.push(snapshot);
    }

    pub fn add_execution_snapshot(&mut self, snapshot: ExecutionSnapshot) {
        self.execution_snapshots.push(snapshot);
    }

    pub fn add_summarizer_snapshot(&mut self, snapshot: SummarizerSnapshot) {
        self.summarizer_snapshots.push(snapshot);
    }

    /// 以最后一次感知与最终答复结束会话
    pub fn mark_complete(&mut self, perception: &PerceptionOutput, final_answer: Option<String>) {
        let answer = final_answer.unwrap_or_else(|| perception.solution_summary.clone());
        self.state = SessionState {
            original_goal_achieved: perception.original_goal_achieved,
            final_answer: Some(answer.clone()),
            confidence: perception.confidence.clone(),
            reasoning_note: perception.reasoning.clone(),
            solution_summary: perception.solution_summary.clone(),
        };
        self.final_summary = Some(answer);
        self.status = SessionStatus::Success;
        self.completed_at = Some(utc_now());
    }

    pub fn mark_failed(&mut self) {
        self.status = SessionStatus::Failed;
        self.completed_at = Some(utc_now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_complete_prefers_final_answer() {
        let mut session = AgentSession::new("s1", "What is 2+3?");
        let perception = PerceptionOutput {
            solution_summary: "5".to_string(),
            confidence: "0.9".to_string(),
            ..PerceptionOutput::default()
        };
        session.mark_complete(&perception, Some("The answer is 5.".to_string()));
        assert_eq!(session.status, SessionStatus::Success);
        assert_eq!(session.final_summary.as_deref(), Some("The answer is 5."));
        assert_eq!(session.state.confidence, "0.9");
        assert!(session.completed_at.is_some());

        let mut other = AgentSession::new("s2", "q");
        other.mark_complete(&perception, None);
        assert_eq!(other.final_summary.as_deref(), Some("5"));
    }

    #[test]
    fn test_perception_snapshot_flattens_output() {
        let snap = PerceptionSnapshot {
            run_id: "s1-P".into(),
            snapshot_type: SnapshotType::StepResult,
            output: PerceptionOutput::default(),
            timestamp: "t".into(),
        };
        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["snapshot_type"], "step_result");
        assert_eq!(v["route"], "decision");
        assert_eq!(v["confidence"], "0.0");
    }
}
