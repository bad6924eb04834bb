//! MCP 客户端
//!
//! 在 Transport 之上完成 initialize 握手、`tools/list`（含分页）与 `tools/call`，
//! 并实现 ToolBackend 供 ToolRouter 使用。

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{McpServerConfig, TransportKind};
use crate::core::AgentError;
use crate::tools::backend::{BackendConnector, ToolBackend};
use crate::tools::transport::{HttpTransport, StdioTransport, Transport};
use crate::tools::ToolDescriptor;

const PROTOCOL_VERSION: &str = "2025-03-26";

pub struct McpClient {
    server_id: String,
    transport: Box<dyn Transport>,
    next_id: AtomicI64,
}

impl McpClient {
    /// 建立会话：initialize 请求 + initialized 通知
    pub async fn connect(
        server_id: impl Into<String>,
        transport: Box<dyn Transport>,
    ) -> Result<Self, AgentError> {
        let client = Self {
            server_id: server_id.into(),
            transport,
            next_id: AtomicI64::new(1),
        };
        let info = client
            .rpc(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "hive", "version": env!("CARGO_PKG_VERSION")}
                }),
            )
            .await?;
        tracing::debug!(
            server = %client.server_id,
            server_info = %info.get("serverInfo").cloned().unwrap_or(serde_json::Value::Null),
            "MCP session initialized"
        );
        client
            .transport
            .notify(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await?;
        Ok(client)
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, AgentError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .transport
            .request(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await?;
        if let Some(err) = response.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(AgentError::Protocol(format!(
                "{} {method}: {message}",
                self.server_id
            )));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| AgentError::Protocol(format!("{} {method}: missing result", self.server_id)))
    }
}

/// 信封中第一段文本内容
pub(crate) fn first_text(envelope: &Value) -> Option<&str> {
    envelope
        .get("content")
        .and_then(Value::as_array)?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some("text"))
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
}

#[async_trait]
impl ToolBackend for McpClient {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, AgentError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self.rpc("tools/list", params).await?;
            let page: Vec<ToolDescriptor> = result
                .get("tools")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| AgentError::Protocol(format!("invalid tools/list payload: {e}")))?
                .unwrap_or_default();
            tools.extend(page);
            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(String::from);
            if cursor.is_none() {
                return Ok(tools);
            }
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, AgentError> {
        let envelope = self
            .rpc("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        if envelope.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(AgentError::ToolDispatch {
                tool: name.to_string(),
                message: first_text(&envelope).unwrap_or("tool reported an error").to_string(),
            });
        }
        Ok(envelope)
    }

    async fn shutdown(&self) -> Result<(), AgentError> {
        self.transport.close().await
    }
}

/// 按配置选择传输并建立 MCP 会话
#[derive(Debug, Default, Clone, Copy)]
pub struct McpConnector;

#[async_trait]
impl BackendConnector for McpConnector {
    async fn connect(&self, config: &McpServerConfig) -> Result<Arc<dyn ToolBackend>, AgentError> {
        let transport: Box<dyn Transport> = match config.transport {
            TransportKind::Stdio => {
                let command = config.command.as_deref().ok_or_else(|| {
                    AgentError::ConfigError(format!("server {} needs a command", config.id))
                })?;
                Box::new(StdioTransport::spawn(
                    command,
                    &config.args,
                    config.cwd.as_deref(),
                )?)
            }
            TransportKind::Http => {
                let url = config.url.as_deref().ok_or_else(|| {
                    AgentError::ConfigError(format!("server {} needs a url", config.id))
                })?;
                Box::new(HttpTransport::new(url))
            }
        };
        let client = McpClient::connect(config.id.clone(), transport).await?;
        Ok(Arc::new(client))
    }
}
