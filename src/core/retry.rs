//! 迭代与重试预算
//!
//! RetryTracker 限制编排循环的总迭代次数（max_steps）与单步骤重试次数（max_retries），
//! ROOT 没有父节点可回退，其失败次数单独计数，达到 2 次即硬停止。

use std::collections::HashMap;

pub const DEFAULT_MAX_STEPS: usize = 12;
pub const DEFAULT_MAX_RETRIES: usize = 5;
/// ROOT 失败达到此次数时停止运行
const ROOT_FAILURE_LIMIT: usize = 2;

#[derive(Debug, Clone)]
pub struct RetryTracker {
    max_steps: usize,
    max_retries: usize,
    attempts: HashMap<String, usize>,
    tries: usize,
    root_failures: usize,
}

impl RetryTracker {
    pub fn new(max_steps: usize, max_retries: usize) -> Self {
        Self {
            max_steps,
            max_retries,
            attempts: HashMap::new(),
            tries: 0,
            root_failures: 0,
        }
    }

    /// 每轮编排循环调用一次
    pub fn increment(&mut self) {
        self.tries += 1;
    }

    pub fn tries(&self) -> usize {
        self.tries
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn should_continue(&self) -> bool {
        self.tries < self.max_steps
    }

    pub fn record_failure(&mut self, step_id: &str) {
        *self.attempts.entry(step_id.to_string()).or_insert(0) += 1;
    }

    pub fn attempts(&self, step_id: &str) -> usize {
        self.attempts.get(step_id).copied().unwrap_or(0)
    }

    /// 步骤被重命名（归档）后，把尝试次数移到新 ID 下；旧 ID 重新从零计数
    pub fn rename_step(&mut self, old: &str, new: &str) {
        if let Some(count) = self.attempts.remove(old) {
            *self.attempts.entry(new.to_string()).or_insert(0) += count;
        }
    }

    /// 重试别名：未失败过时原样返回，否则为 `<id>F<attempts>`，用于日志与快照关联
    pub fn retry_step_id(&self, step_id: &str) -> String {
        match self.attempts(step_id) {
            0 => step_id.to_string(),
            n => format!("{step_id}F{n}"),
        }
    }

    pub fn has_exceeded_retries(&self, step_id: &str) -> bool {
        self.attempts(step_id) >= self.max_retries
    }

    /// 记录一次 ROOT 失败；累计达到上限时返回 true
    pub fn register_root_failure(&mut self) -> bool {
        self.root_failures += 1;
        self.root_failures >= ROOT_FAILURE_LIMIT
    }
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STEPS, DEFAULT_MAX_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let mut tracker = RetryTracker::default();
        assert_eq!(tracker.max_steps(), 12);
        for _ in 0..4 {
            tracker.record_failure("1");
        }
        assert!(!tracker.has_exceeded_retries("1"));
        tracker.record_failure("1");
        assert!(tracker.has_exceeded_retries("1"));
    }

    #[test]
    fn test_retry_alias_and_budget() {
        let mut tracker = RetryTracker::new(12, 2);
        assert_eq!(tracker.retry_step_id("S1"), "S1");
        tracker.record_failure("S1");
        assert_eq!(tracker.retry_step_id("S1"), "S1F1");
        assert!(!tracker.has_exceeded_retries("S1"));
        tracker.record_failure("S1");
        assert!(tracker.has_exceeded_retries("S1"));
        assert_eq!(tracker.retry_step_id("S1"), "S1F2");
        assert_eq!(tracker.retry_step_id("S2"), "S2");
    }

    #[test]
    fn test_rename_moves_attempts() {
        let mut tracker = RetryTracker::new(12, 2);
        tracker.record_failure("0");
        tracker.record_failure("0");
        tracker.rename_step("0", "0X1");
        assert_eq!(tracker.attempts("0"), 0);
        assert_eq!(tracker.retry_step_id("0"), "0");
        assert!(tracker.has_exceeded_retries("0X1"));
        tracker.rename_step("missing", "missingX1");
        assert_eq!(tracker.attempts("missingX1"), 0);
    }

    #[test]
    fn test_should_continue_bounded() {
        let mut tracker = RetryTracker::new(3, 5);
        let mut loops = 0;
        while tracker.should_continue() {
            tracker.increment();
            loops += 1;
        }
        assert_eq!(loops, 3);
        assert_eq!(tracker.tries(), 3);
    }

    #[test]
    fn test_root_failure_halts_on_second() {
        let mut tracker = RetryTracker::default();
        assert!(!tracker.register_root_failure());
        assert!(tracker.register_root_failure());
    }
}
