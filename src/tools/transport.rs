//! MCP 传输层：本地子进程（stdio）与远程流式 HTTP 端点
//!
//! 两种传输都以 JSON-RPC 2.0 消息为单位：request 发送一条带 id 的请求并等待同 id 的响应，
//! notify 发送不需要响应的通知，close 释放底层资源。

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::core::AgentError;

const SESSION_HEADER: &str = "mcp-session-id";

#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, message: Value) -> Result<Value, AgentError>;

    async fn notify(&self, message: Value) -> Result<(), AgentError>;

    async fn close(&self) -> Result<(), AgentError>;
}

/// 是否为对 id 的响应（带 result 或 error）
pub(crate) fn is_response_to(message: &Value, id: &Value) -> bool {
    message.get("id") == Some(id)
        && (message.get("result").is_some() || message.get("error").is_some())
}

struct StdioPipes {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// 本地子进程传输：逐行读写 JSON；同一后端上的请求串行
pub struct StdioTransport {
    child: Mutex<Option<Child>>,
    pipes: Mutex<Option<StdioPipes>>,
    label: String,
}

impl StdioTransport {
    pub fn spawn(command: &str, args: &[String], cwd: Option<&Path>) -> Result<Self, AgentError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::Transport(format!("spawn {command} failed: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Transport(format!("{command} stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Transport(format!("{command} stdout unavailable")))?;

        Ok(Self {
            child: Mutex::new(Some(child)),
            pipes: Mutex::new(Some(StdioPipes {
                stdin,
                stdout: BufReader::new(stdout).lines(),
            })),
            label: command.to_string(),
        })
    }

    async fn write_line(pipes: &mut StdioPipes, message: &Value) -> Result<(), AgentError> {
        let mut line = message.to_string();
        line.push('\n');
        pipes
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Transport(format!("write request failed: {e}")))?;
        pipes
            .stdin
            .flush()
            .await
            .map_err(|e| AgentError::Transport(format!("flush failed: {e}")))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, message: Value) -> Result<Value, AgentError> {
        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let mut guard = self.pipes.lock().await;
        let pipes = guard
            .as_mut()
            .ok_or_else(|| AgentError::Transport(format!("{} transport closed", self.label)))?;
        Self::write_line(pipes, &message).await?;

        loop {
            let line = pipes
                .stdout
                .next_line()
                .await
                .map_err(|e| AgentError::Transport(format!("read response failed: {e}")))?
                .ok_or_else(|| {
                    AgentError::Transport(format!("{} closed its stdout", self.label))
                })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(msg) if is_response_to(&msg, &id) => return Ok(msg),
                Ok(_) => tracing::debug!(server = %self.label, "skipping unrelated message"),
                Err(_) => tracing::debug!(server = %self.label, line = %line, "skipping non-JSON line"),
            }
        }
    }

    async fn notify(&self, message: Value) -> Result<(), AgentError> {
        let mut guard = self.pipes.lock().await;
        let pipes = guard
            .as_mut()
            .ok_or_else(|| AgentError::Transport(format!("{} transport closed", self.label)))?;
        Self::write_line(pipes, &message).await
    }

    /// 关闭 stdin 后结束子进程
    async fn close(&self) -> Result<(), AgentError> {
        self.pipes.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            child
                .kill()
                .await
                .map_err(|e| AgentError::Transport(format!("kill {} failed: {e}", self.label)))?;
        }
        Ok(())
    }
}

/// 远程流式端点：每条消息一次 POST，响应可能是 JSON 或 SSE 流
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    session_id: Mutex<Option<String>>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            session_id: Mutex::new(None),
        }
    }

    async fn post(&self, message: &Value) -> Result<reqwest::Response, AgentError> {
        let mut req = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(sid) = self.session_id.lock().await.as_ref() {
            req = req.header(SESSION_HEADER, sid);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("POST {} failed: {e}", self.url)))?;
        if let Some(sid) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(sid.to_string());
        }
        resp.error_for_status()
            .map_err(|e| AgentError::Transport(format!("{} returned error: {e}", self.url)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, message: Value) -> Result<Value, AgentError> {
        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let resp = self.post(&message).await?;
        let is_stream = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));
        let body = resp
            .text()
            .await
            .map_err(|e| AgentError::Transport(format!("read body failed: {e}")))?;
        if is_stream {
            find_sse_response(&body, &id).ok_or_else(|| {
                AgentError::Protocol(format!("no response for id {id} in event stream"))
            })
        } else {
            serde_json::from_str(&body)
                .map_err(|e| AgentError::Protocol(format!("invalid JSON response: {e}")))
        }
    }

    async fn notify(&self, message: Value) -> Result<(), AgentError> {
        self.post(&message).await.map(|_| ())
    }

    /// 有会话 ID 时发送 DELETE 结束服务端会话
    async fn close(&self) -> Result<(), AgentError> {
        let Some(sid) = self.session_id.lock().await.take() else {
            return Ok(());
        };
        self.client
            .delete(&self.url)
            .header(SESSION_HEADER, sid)
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("DELETE {} failed: {e}", self.url)))?;
        Ok(())
    }
}

/// 在 SSE 文本中查找对 id 的响应：事件以空行分隔，每个事件的 `data:` 行拼接为一条 JSON
pub(crate) fn find_sse_response(body: &str, id: &Value) -> Option<Value> {
    let normalized = body.replace("\r\n", "\n");
    normalized.split("\n\n").find_map(|event| {
        let data: Vec<&str> = event
            .lines()
            .filter_map(|l| l.strip_prefix("data:"))
            .map(str::trim_start)
            .collect();
        if data.is_empty() {
            return None;
        }
        serde_json::from_str::<Value>(&data.join("\n"))
            .ok()
            .filter(|msg| is_response_to(msg, id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_find_sse_response_skips_other_events() {
        let body = "event: message\r\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\r\n\r\n\
                    event: message\r\ndata: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"ok\":true}}\r\n\r\n";
        let msg = find_sse_response(body, &json!(7)).unwrap();
        assert_eq!(msg["result"]["ok"], json!(true));
        assert!(find_sse_response(body, &json!(8)).is_none());
    }

    #[test]
    fn test_is_response_to() {
        assert!(is_response_to(&json!({"id": 1, "result": {}}), &json!(1)));
        assert!(is_response_to(&json!({"id": 1, "error": {"message": "x"}}), &json!(1)));
        assert!(!is_response_to(&json!({"id": 1, "method": "ping"}), &json!(1)));
        assert!(!is_response_to(&json!({"id": 2, "result": {}}), &json!(1)));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let err = StdioTransport::spawn("definitely-not-a-real-mcp-server", &[], None)
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Transport(_)));
    }
}
