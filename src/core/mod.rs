//! 核心编排层：错误与恢复、重试预算、运行阶段、变体执行池、主控循环与构建器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod retry;
pub mod state;
pub mod task_scheduler;

pub use builder::{create_agent_builder, AgentBuilder, AgentComponents};
pub use error::{AgentError, RecoveryAction};
pub use orchestrator::{AgentLoop, OutcomeStatus, RunOutcome};
pub use recovery::RecoveryEngine;
pub use retry::RetryTracker;
pub use state::{PhaseTracker, RunPhase};
pub use task_scheduler::{VariantPool, VARIANT_POOL_CAPACITY};
