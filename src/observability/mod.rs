//! 可观测性：tracing 订阅器初始化与 oracle 输出日志

use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogFormat;

/// oracle 输出中每个顶层字段的日志预览长度
const FIELD_PREVIEW_CHARS: usize = 150;

/// 安装全局订阅器；`RUST_LOG` 覆盖默认的 info 级别
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Pretty => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

fn preview(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= FIELD_PREVIEW_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(FIELD_PREVIEW_CHARS).collect();
    cut.push_str("...");
    cut
}

/// 把一块 JSON 压成一行 `key: value` 摘要
pub fn format_json_block(block: &Value) -> String {
    match block {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{k}: {}", preview(v)))
            .collect::<Vec<_>>()
            .join(" | "),
        other => preview(other),
    }
}

/// 以一条 info 事件输出 oracle 结果
pub fn log_json_block(title: &str, block: &Value) {
    tracing::info!(block = %title, "{}", format_json_block(block));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_truncates_fields() {
        let long = "x".repeat(400);
        let line = format_json_block(&json!({"route": "decision", "reasoning": long}));
        assert!(line.starts_with("route: decision | reasoning: "));
        assert!(line.ends_with("..."));
        assert_eq!(line.len(), "route: decision | reasoning: ".len() + 150 + 3);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(LogFormat::Pretty);
        init(LogFormat::Json);
    }
}
