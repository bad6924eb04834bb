//! 工具后端抽象
//!
//! 每个独立启动的工具服务（本地子进程或远程流式端点）实现 ToolBackend；
//! BackendConnector 负责按配置建立会话（传输层握手），ToolRouter 只依赖这两个 trait。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::McpServerConfig;
use crate::core::AgentError;
use crate::tools::ToolDescriptor;

/// 工具后端：列出工具目录、转发调用、关闭会话
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, AgentError>;

    /// 返回原始响应信封（`{"content": [{"type": "text", "text": ...}], ...}`）
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, AgentError>;

    /// 关闭会话与传输层
    async fn shutdown(&self) -> Result<(), AgentError>;
}

/// 按服务器配置建立后端会话
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, config: &McpServerConfig) -> Result<Arc<dyn ToolBackend>, AgentError>;
}
