//! 执行层：代码执行器接口与步骤的多变体执行

pub mod executor;
pub mod runner;

pub use executor::{variant_key, ExecutionMode, StepExecutor, StepOutcome, VariantResult, VARIANT_LETTERS};
pub use runner::{CodeRunOutcome, CodeRunner, ExecutionContext, RunStatus, ToolScriptRunner};
