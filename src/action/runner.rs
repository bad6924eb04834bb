//! 代码执行器接口与内置工具脚本执行器
//!
//! CodeRunner 接收一段变体代码、执行上下文、工具路由句柄与会话 ID，返回结构化结果；
//! ToolScriptRunner 是内置实现，逐行执行「工具脚本」：
//!
//! ```text
//! # 注释
//! total = add(2, 3)
//! doubled = mul(total, 2)
//! search('rust async')        # 裸调用绑定到 result
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::AgentError;
use crate::tools::expr::{parse_expr, Arg, Expr};
use crate::tools::ToolRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

/// 单次变体执行的上下文
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub session_id: String,
    /// 带重试后缀的步骤标签，仅用于日志与快照关联
    pub step_id: String,
    pub globals: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRunOutcome {
    pub status: RunStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// 开始执行的 UTC 时间
    pub execution_time: String,
    /// 耗时（秒）
    pub total_time: String,
}

impl CodeRunOutcome {
    pub fn success(result: Value, started: &str, elapsed_secs: f64) -> Self {
        Self {
            status: RunStatus::Success,
            result: Some(result),
            error: None,
            execution_time: started.to_string(),
            total_time: format!("{elapsed_secs:.3}"),
        }
    }

    pub fn failure(error: impl Into<String>, started: &str, elapsed_secs: f64) -> Self {
        Self {
            status: RunStatus::Error,
            result: None,
            error: Some(error.into()),
            execution_time: started.to_string(),
            total_time: format!("{elapsed_secs:.3}"),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

pub(crate) fn utc_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// 代码执行协作者；沙箱与安全策略由实现方负责
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(
        &self,
        code: &str,
        ctx: &ExecutionContext,
        tools: Arc<ToolRouter>,
        session_id: &str,
    ) -> Result<CodeRunOutcome, AgentError>;
}

fn assign_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)^([A-Za-z_][A-Za-z0-9_]*)\s*=([^=].*)$").expect("valid assignment regex")
    })
}

/// 工具脚本执行器：每行 `name = expr` 或裸 `expr`；首个失败行即返回 error
#[derive(Debug, Default, Clone, Copy)]
pub struct ToolScriptRunner;

impl ToolScriptRunner {
    pub fn new() -> Self {
        Self
    }

    async fn eval(
        expr: Expr,
        bindings: &Map<String, Value>,
        ctx: &ExecutionContext,
        tools: &ToolRouter,
    ) -> Result<Value, AgentError> {
        let resolve = |arg: Arg| match arg {
            Arg::Literal(v) => Ok(v),
            Arg::Ident(name) => bindings
                .get(&name)
                .or_else(|| ctx.globals.get(&name))
                .cloned()
                .ok_or_else(|| AgentError::CodeRunner(format!("name '{name}' is not defined"))),
        };
        match expr {
            Expr::Value(arg) => resolve(arg),
            Expr::Call(call) => {
                let args = call
                    .args
                    .into_iter()
                    .map(resolve)
                    .collect::<Result<Vec<_>, _>>()?;
                tools.invoke_with(&call.name, args).await
            }
        }
    }
}

#[async_trait]
impl CodeRunner for ToolScriptRunner {
    async fn run(
        &self,
        code: &str,
        ctx: &ExecutionContext,
        tools: Arc<ToolRouter>,
        session_id: &str,
    ) -> Result<CodeRunOutcome, AgentError> {
        let started = utc_now();
        let clock = Instant::now();
        let mut bindings = Map::new();

        for (lineno, raw) in code.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (target, rhs) = match assign_re().captures(line) {
                Some(caps) => (caps[1].to_string(), caps[2].trim().to_string()),
                None => ("result".to_string(), line.to_string()),
            };
            let value = match parse_expr(&rhs) {
                Ok(expr) => Self::eval(expr, &bindings, ctx, &tools).await,
                Err(e) => Err(e),
            };
            match value {
                Ok(v) => {
                    bindings.insert(target, v);
                }
                Err(e) => {
                    tracing::debug!(session_id = %session_id, step_id = %ctx.step_id, line = lineno + 1, error = %e, "tool script failed");
                    return Ok(CodeRunOutcome::failure(
                        format!("line {}: {e}", lineno + 1),
                        &started,
                        clock.elapsed().as_secs_f64(),
                    ));
                }
            }
        }

        Ok(CodeRunOutcome::success(
            Value::Object(bindings),
            &started,
            clock.elapsed().as_secs_f64(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolBackend, ToolDescriptor};
    use serde_json::json;

    struct Arithmetic;

    #[async_trait]
    impl ToolBackend for Arithmetic {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, AgentError> {
            Ok(Vec::new())
        }

        async fn call_tool(&self, name: &str, args: Value) -> Result<Value, AgentError> {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            let out = match name {
                "add" => a + b,
                "mul" => a * b,
                _ => return Err(AgentError::ToolNotFound(name.to_string())),
            };
            Ok(json!({"content": [{"type": "text", "text": json!({"result": out}).to_string()}]}))
        }

        async fn shutdown(&self) -> Result<(), AgentError> {
            Ok(())
        }
    }

    fn router() -> Arc<ToolRouter> {
        let schema = json!({"type": "object", "properties": {
            "a": {"type": "integer"}, "b": {"type": "integer"}
        }});
        let mut router = ToolRouter::new();
        router.register_backend(
            "math",
            Arc::new(Arithmetic),
            vec![
                ToolDescriptor::new("add", "Add", schema.clone()),
                ToolDescriptor::new("mul", "Multiply", schema),
            ],
        );
        Arc::new(router)
    }

    fn ctx() -> ExecutionContext {
        let mut globals = Map::new();
        globals.insert("base".to_string(), json!(10));
        ExecutionContext {
            session_id: "s1".into(),
            step_id: "1".into(),
            globals,
        }
    }

    #[tokio::test]
    async fn test_script_binds_results_and_globals() {
        let code = "# compute\ntotal = add(base, 5)\n\nmul(total, 2)\nlabel = 'done'";
        let out = ToolScriptRunner.run(code, &ctx(), router(), "s1").await.unwrap();
        assert!(out.is_success());
        assert_eq!(
            out.result.unwrap(),
            json!({"total": 15, "result": 30, "label": "done"})
        );
    }

    #[tokio::test]
    async fn test_first_failing_line_reports_error() {
        let code = "x = add(1, 2)\ny = mul(missing, 2)\nz = add(1, 1)";
        let out = ToolScriptRunner.run(code, &ctx(), router(), "s1").await.unwrap();
        assert_eq!(out.status, RunStatus::Error);
        let err = out.error.unwrap();
        assert!(err.starts_with("line 2:"), "{err}");
        assert!(err.contains("missing"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_outcome() {
        let out = ToolScriptRunner
            .run("divide(1, 0)", &ctx(), router(), "s1")
            .await
            .unwrap();
        assert_eq!(out.status, RunStatus::Error);
        assert!(out.error.unwrap().contains("divide"));
    }
}
