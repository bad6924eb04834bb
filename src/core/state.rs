//! 运行阶段
//!
//! AgentLoop 的状态机：每次转移都会输出日志，便于从日志还原一次运行的轨迹。

use std::fmt;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    Init,
    PerceiveInitial,
    EarlyExit,
    InvalidRouteAbort,
    Plan,
    ExecuteLoop,
    Success,
    Halted,
}

impl RunPhase {
    /// 是否为终止状态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::EarlyExit | Self::InvalidRouteAbort | Self::Success | Self::Halted
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::PerceiveInitial => "PERCEIVE_INITIAL",
            Self::EarlyExit => "EARLY_EXIT",
            Self::InvalidRouteAbort => "INVALID_ROUTE_ABORT",
            Self::Plan => "PLAN",
            Self::ExecuteLoop => "EXECUTE_LOOP",
            Self::Success => "SUCCESS",
            Self::Halted => "HALTED",
        };
        f.write_str(s)
    }
}

/// 记录当前阶段并在变化时输出日志
#[derive(Debug)]
pub struct PhaseTracker {
    session_id: String,
    phase: RunPhase,
}

impl PhaseTracker {
    pub fn new(session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        tracing::info!(session_id = %session_id, phase = %RunPhase::Init, "run phase");
        Self {
            session_id,
            phase: RunPhase::Init,
        }
    }

    pub fn current(&self) -> RunPhase {
        self.phase
    }

    /// 终止状态之后不再转移
    pub fn transition(&mut self, next: RunPhase) {
        if self.phase.is_terminal() {
            tracing::warn!(session_id = %self.session_id, phase = %self.phase, ignored = %next, "run already finished");
            return;
        }
        if next != self.phase {
            tracing::info!(session_id = %self.session_id, from = %self.phase, to = %next, "run phase");
            self.phase = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases() {
        assert!(RunPhase::Halted.is_terminal());
        assert!(RunPhase::EarlyExit.is_terminal());
        assert!(!RunPhase::ExecuteLoop.is_terminal());
        assert_eq!(RunPhase::PerceiveInitial.to_string(), "PERCEIVE_INITIAL");
    }

    #[test]
    fn test_transition_updates_phase() {
        let mut tracker = PhaseTracker::new("s1");
        tracker.transition(RunPhase::PerceiveInitial);
        tracker.transition(RunPhase::Plan);
        assert_eq!(tracker.current(), RunPhase::Plan);
    }

    #[test]
    fn test_terminal_phase_is_final() {
        let mut tracker = PhaseTracker::new("s1");
        tracker.transition(RunPhase::PerceiveInitial);
        tracker.transition(RunPhase::EarlyExit);
        tracker.transition(RunPhase::Success);
        assert_eq!(tracker.current(), RunPhase::EarlyExit);
    }
}
