//! 变体执行池
//!
//! 进程内共享的固定容量 Semaphore：并行模式下同一时刻最多 3 个变体在执行，
//! 多出的变体排队等待许可。许可随任务结束释放，不做提前取消。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::AgentError;

/// 默认并发上限
pub const VARIANT_POOL_CAPACITY: usize = 3;

#[derive(Clone, Debug)]
pub struct VariantPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl VariantPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前空闲许可数
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// 获取执行许可；池被关闭时返回 CodeRunner 错误
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AgentError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::CodeRunner("variant pool closed".to_string()))
    }
}

impl Default for VariantPool {
    fn default() -> Self {
        Self::new(VARIANT_POOL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_caps_concurrency() {
        let pool = VariantPool::default();
        assert_eq!(pool.capacity(), 3);
        let p1 = pool.acquire().await.unwrap();
        let _p2 = pool.acquire().await.unwrap();
        let _p3 = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);
        drop(p1);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(VariantPool::new(0).capacity(), 1);
    }
}
