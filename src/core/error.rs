//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：步骤重试预算耗尽时决定 RetryStep / ReplanFromRoot / Halt。
//! 所有错误在跨组件边界前都会被转换为结构化的状态字段，不会让单个故障中止整次运行。

use thiserror::Error;

/// Agent 运行过程中可能出现的错误（工具路由、后端传输、Oracle 解码、计划图、持久化等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Tool '{0}' not found on any server")]
    ToolNotFound(String),

    #[error("Tool dispatch failed ({tool}): {message}")]
    ToolDispatch { tool: String, message: String },

    #[error("{tool} expects {expected} args, got {got}")]
    ToolArity {
        tool: String,
        expected: usize,
        got: usize,
    },

    #[error("Failed to parse tool expression '{0}'")]
    InvalidToolExpression(String),

    /// 后端传输层故障（子进程 IO、HTTP 请求失败等）
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON-RPC 协议层错误（响应缺字段、error 对象等）
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Missing required keys: {0:?}")]
    MissingKeys(Vec<String>),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Code runner failed: {0}")]
    CodeRunner(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// 步骤重试预算耗尽后恢复引擎给出的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 预算未耗尽，下一轮继续尝试同一步骤
    RetryStep,
    /// 非 ROOT 步骤耗尽预算：目标强制回到 ROOT，触发重新规划
    ReplanFromRoot,
    /// ROOT 累计失败两次：硬停止
    Halt,
}
