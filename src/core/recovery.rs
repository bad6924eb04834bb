//! 错误恢复引擎
//!
//! 步骤的全部变体执行失败后，根据 RetryTracker 的预算返回 RecoveryAction，
//! 供编排循环决定继续重试、强制回到 ROOT 重新规划，还是硬停止。

use crate::core::{RecoveryAction, RetryTracker};
use crate::plan::ROOT_ID;

/// 语义化失败恢复：记录失败并把预算状态映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 记录 step_id 的一次失败；预算未耗尽时 RetryStep，
    /// 耗尽时 ROOT 计入根失败（第二次 Halt，否则 RetryStep），其它步骤 ReplanFromRoot
    pub fn on_step_failure(&self, tracker: &mut RetryTracker, step_id: &str) -> RecoveryAction {
        tracker.record_failure(step_id);
        if !tracker.has_exceeded_retries(step_id) {
            return RecoveryAction::RetryStep;
        }
        if step_id == ROOT_ID {
            if tracker.register_root_failure() {
                RecoveryAction::Halt
            } else {
                RecoveryAction::RetryStep
            }
        } else {
            RecoveryAction::ReplanFromRoot
        }
    }
}
