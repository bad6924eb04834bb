//! 工具路由
//!
//! 把 N 个独立启动的工具后端汇总为一个逻辑命名空间：启动时按配置顺序逐个握手并合并目录，
//! 之后只读；call 按名称找到所属后端转发，invoke 额外支持 `name(a, b)` 表达式与响应解包。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::config::McpServerConfig;
use crate::core::AgentError;
use crate::tools::backend::{BackendConnector, ToolBackend};
use crate::tools::expr::{parse_call, Arg};
use crate::tools::mcp::first_text;
use crate::tools::schema::{signature_line, ParamShape};
use crate::tools::{ToolCatalog, ToolDescriptor};

#[derive(Default)]
pub struct ToolRouter {
    backends: HashMap<String, Arc<dyn ToolBackend>>,
    backend_order: Vec<String>,
    per_backend: HashMap<String, Vec<ToolDescriptor>>,
    catalog: ToolCatalog,
}

impl ToolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按配置顺序逐个建立会话并合并目录；失败的后端记录日志后跳过
    pub async fn initialize(&mut self, configs: &[McpServerConfig], connector: &dyn BackendConnector) {
        for config in configs {
            let backend = match connector.connect(config).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(backend = %config.id, error = %e, "tool backend failed to start, skipping");
                    continue;
                }
            };
            match backend.list_tools().await {
                Ok(tools) => {
                    tracing::info!(backend = %config.id, tools = tools.len(), "tool backend ready");
                    self.register_backend(&config.id, backend, tools);
                }
                Err(e) => {
                    tracing::warn!(backend = %config.id, error = %e, "tools/list failed, skipping backend");
                    if let Err(e) = backend.shutdown().await {
                        tracing::debug!(backend = %config.id, error = %e, "shutdown after failed listing");
                    }
                }
            }
        }
    }

    /// 注册一个已连接的后端及其工具；重名工具由后注册者接管
    pub fn register_backend(
        &mut self,
        backend_id: &str,
        backend: Arc<dyn ToolBackend>,
        tools: Vec<ToolDescriptor>,
    ) {
        for tool in &tools {
            if let Some(previous) = self.catalog.insert(backend_id, tool.clone()) {
                if previous != backend_id {
                    tracing::warn!(tool = %tool.name, from = %previous, to = %backend_id, "tool name collision, last backend wins");
                }
            }
        }
        if !self.backends.contains_key(backend_id) {
            self.backend_order.push(backend_id.to_string());
        }
        self.backends.insert(backend_id.to_string(), backend);
        self.per_backend.insert(backend_id.to_string(), tools);
    }

    /// 转发调用并返回原始响应信封；输出一条 tool_audit 审计日志
    pub async fn call(&self, name: &str, args: Value) -> Result<Value, AgentError> {
        let entry = self
            .catalog
            .get(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;
        let backend = self
            .backends
            .get(&entry.backend_id)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;

        let start = Instant::now();
        let preview = args_preview(&args);
        let result = backend.call_tool(name, args).await;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "backend": entry.backend_id,
            "ok": result.is_ok(),
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");
        result
    }

    /// 解析 `name(arg1, arg2)` 并调用；参数必须全部是字面量
    pub async fn invoke(&self, expr: &str) -> Result<Value, AgentError> {
        let call = parse_call(expr)?;
        let args = call
            .args
            .into_iter()
            .map(|a| match a {
                Arg::Literal(v) => Ok(v),
                Arg::Ident(id) => Err(AgentError::InvalidToolExpression(format!(
                    "{expr}: unbound identifier {id}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.invoke_with(&call.name, args).await
    }

    /// 按声明的 schema 形状绑定位置参数，调用后解包响应
    pub async fn invoke_with(&self, name: &str, args: Vec<Value>) -> Result<Value, AgentError> {
        let entry = self
            .catalog
            .get(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;
        let bound = ParamShape::from_schema(&entry.tool.input_schema).bind(name, args)?;
        let envelope = self.call(name, bound).await?;
        Ok(unwrap_response(envelope))
    }

    /// 每个工具一行 `name(type1, type2) # description`
    pub fn describe_all(&self) -> String {
        self.catalog
            .entries()
            .map(|e| signature_line(&e.tool))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.catalog.tool_names()
    }

    pub fn backend_of(&self, tool: &str) -> Option<&str> {
        self.catalog.get(tool).map(|e| e.backend_id.as_str())
    }

    /// 指定后端声明的工具（按后端 ID 顺序拼接）
    pub fn tools_for_backends(&self, ids: &[&str]) -> Vec<ToolDescriptor> {
        ids.iter()
            .filter_map(|id| self.per_backend.get(*id))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn backend_ids(&self) -> &[String] {
        &self.backend_order
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    /// 逐个关闭后端；单个失败只记录日志，不影响其余后端
    pub async fn shutdown(&self) {
        for id in &self.backend_order {
            let Some(backend) = self.backends.get(id) else {
                continue;
            };
            match backend.shutdown().await {
                Ok(()) => tracing::debug!(backend = %id, "tool backend closed"),
                Err(e) => tracing::warn!(backend = %id, error = %e, "tool backend shutdown failed"),
            }
        }
    }
}

/// 响应解包：取第一段文本并尝试按 JSON 解析；对象含 `result` 键取其值，只有一个键取该值，
/// 否则返回整个对象；非 JSON 文本原样返回
pub fn unwrap_response(envelope: Value) -> Value {
    let Some(text) = first_text(&envelope) else {
        return envelope
            .get("structuredContent")
            .cloned()
            .unwrap_or(envelope);
    };
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(mut map)) => {
            if let Some(v) = map.remove("result") {
                v
            } else if map.len() == 1 {
                map.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null)
            } else {
                Value::Object(map)
            }
        }
        Ok(other) => other,
        Err(_) => Value::String(text.to_string()),
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Handler = Box<dyn Fn(&str, &Value) -> Result<Value, AgentError> + Send + Sync>;

    struct FakeBackend {
        tools: Vec<ToolDescriptor>,
        handler: Handler,
        calls: Mutex<Vec<(String, Value)>>,
        fail_shutdown: bool,
        shutdowns: Arc<AtomicUsize>,
    }

    impl FakeBackend {
        fn new(tools: Vec<ToolDescriptor>, handler: Handler) -> Self {
            Self {
                tools,
                handler,
                calls: Mutex::new(Vec::new()),
                fail_shutdown: false,
                shutdowns: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ToolBackend for FakeBackend {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, AgentError> {
            Ok(self.tools.clone())
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, AgentError> {
            self.calls.lock().unwrap().push((name.to_string(), arguments.clone()));
            (self.handler)(name, &arguments)
        }

        async fn shutdown(&self) -> Result<(), AgentError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            if self.fail_shutdown {
                Err(AgentError::Transport("already gone".into()))
            } else {
                Ok(())
            }
        }
    }

    fn text_envelope(text: &str) -> Value {
        json!({"content": [{"type": "text", "text": text}]})
    }

    fn nested_add_tool() -> ToolDescriptor {
        ToolDescriptor::new(
            "add",
            "Add two numbers",
            json!({
                "type": "object",
                "properties": {"input": {"$ref": "#/$defs/AddInput"}},
                "$defs": {"AddInput": {"type": "object", "properties": {
                    "a": {"type": "integer"}, "b": {"type": "integer"}
                }}}
            }),
        )
    }

    fn add_backend() -> Arc<FakeBackend> {
        Arc::new(FakeBackend::new(
            vec![nested_add_tool()],
            Box::new(|_, args| {
                let a = args["input"]["a"].as_i64().unwrap_or(0);
                let b = args["input"]["b"].as_i64().unwrap_or(0);
                Ok(text_envelope(&json!({ "result": a + b }).to_string()))
            }),
        ))
    }

    #[tokio::test]
    async fn test_invoke_expression_binds_nested_shape_and_unwraps() {
        let backend = add_backend();
        let mut router = ToolRouter::new();
        router.register_backend("math", backend.clone(), backend.tools.clone());

        let value = router.invoke("add(2,3)").await.unwrap();
        assert_eq!(value, json!(5));

        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "add");
        assert_eq!(calls[0].1, json!({"input": {"a": 2, "b": 3}}));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_arity() {
        let backend = add_backend();
        let mut router = ToolRouter::new();
        router.register_backend("math", backend.clone(), backend.tools.clone());

        assert!(matches!(
            router.call("sub", json!({})).await.unwrap_err(),
            AgentError::ToolNotFound(name) if name == "sub"
        ));
        assert!(matches!(
            router.invoke("add(1)").await.unwrap_err(),
            AgentError::ToolArity { expected: 2, got: 1, .. }
        ));
        assert!(matches!(
            router.invoke("add(x, 1)").await.unwrap_err(),
            AgentError::InvalidToolExpression(_)
        ));
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unwrap_response_rules() {
        assert_eq!(unwrap_response(text_envelope(r#"{"result": [1, 2]}"#)), json!([1, 2]));
        assert_eq!(unwrap_response(text_envelope(r#"{"sum": 7}"#)), json!(7));
        assert_eq!(
            unwrap_response(text_envelope(r#"{"a": 1, "b": 2}"#)),
            json!({"a": 1, "b": 2})
        );
        assert_eq!(unwrap_response(text_envelope("plain words")), json!("plain words"));
        assert_eq!(unwrap_response(text_envelope("42")), json!(42));
    }

    struct MapConnector {
        backends: HashMap<String, Arc<FakeBackend>>,
    }

    #[async_trait]
    impl BackendConnector for MapConnector {
        async fn connect(&self, config: &McpServerConfig) -> Result<Arc<dyn ToolBackend>, AgentError> {
            self.backends
                .get(&config.id)
                .cloned()
                .map(|b| b as Arc<dyn ToolBackend>)
                .ok_or_else(|| AgentError::Transport(format!("cannot reach {}", config.id)))
        }
    }

    fn server(id: &str) -> McpServerConfig {
        McpServerConfig {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_initialize_skips_failed_backend_and_last_wins() {
        let search = Arc::new(FakeBackend::new(
            vec![
                ToolDescriptor::new("web_search", "Search the web", json!({
                    "type": "object", "properties": {"query": {"type": "string"}}
                })),
                ToolDescriptor::new("add", "Legacy add", json!({"type": "object"})),
            ],
            Box::new(|_, _| Ok(text_envelope("[]"))),
        ));
        let mut backends = HashMap::new();
        backends.insert("search".to_string(), search);
        backends.insert("math".to_string(), add_backend());
        let connector = MapConnector { backends };

        let mut router = ToolRouter::new();
        router
            .initialize(&[server("search"), server("offline"), server("math")], &connector)
            .await;

        assert_eq!(router.backend_ids(), &["search".to_string(), "math".to_string()]);
        assert_eq!(router.backend_of("add"), Some("math"));
        assert_eq!(router.backend_of("web_search"), Some("search"));
        assert_eq!(router.tools_for_backends(&["search"]).len(), 2);
        assert_eq!(
            router.describe_all(),
            "web_search(string) # Search the web\nadd(integer, integer) # Add two numbers"
        );
    }

    #[tokio::test]
    async fn test_shutdown_is_best_effort() {
        let mut failing = FakeBackend::new(vec![], Box::new(|_, _| Ok(Value::Null)));
        failing.fail_shutdown = true;
        let failing = Arc::new(failing);
        let healthy = add_backend();

        let mut router = ToolRouter::new();
        router.register_backend("broken", failing.clone(), vec![]);
        router.register_backend("math", healthy.clone(), healthy.tools.clone());
        router.shutdown().await;

        assert_eq!(failing.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.shutdowns.load(Ordering::SeqCst), 1);
    }
}
