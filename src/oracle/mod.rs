//! Oracle 层：感知（Perceiver）、规划（Planner）、汇总（Summarizer）
//!
//! 三者都是由语言模型支撑的不透明决策函数。对调用方的契约是「永不失败」：
//! 传输故障或输出缺键时降级为安全默认值，并通过 `Decoded::Fallback` 标记原因。

pub mod decision;
pub mod parse;
pub mod perception;
pub mod summarizer;

use std::path::Path;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Serialize;

use crate::llm::Message;

pub use decision::{LlmPlanner, PlanGraphSpec, PlanMode, PlanNodeSpec, PlanOutput, PlannerInput};
pub use parse::{decode_llm_json, extract_json_block, parse_llm_json};
pub use perception::{LlmPerceiver, PerceiverInput, PerceptionOutput, Route, SnapshotType};
pub use summarizer::{LlmSummarizer, SummarizerInput};

/// 严格解码的结果：解析成功，或带原因的安全默认值
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Parsed(T),
    Fallback { value: T, reason: String },
}

impl<T> Decoded<T> {
    pub fn value(&self) -> &T {
        match self {
            Self::Parsed(v) | Self::Fallback { value: v, .. } => v,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Self::Parsed(v) | Self::Fallback { value: v, .. } => v,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Fallback { reason, .. } => Some(reason),
            Self::Parsed(_) => None,
        }
    }
}

#[async_trait]
pub trait Perceiver: Send + Sync {
    async fn perceive(&self, input: &PerceiverInput) -> Decoded<PerceptionOutput>;
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, input: &PlannerInput) -> Decoded<PlanOutput>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, input: &SummarizerInput) -> Decoded<String>;
}

/// 读取提示词模板；文件不存在或不可读时使用内置模板
pub fn load_prompt(path: &Path, builtin: &str) -> String {
    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) | Err(_) => {
            tracing::debug!(path = %path.display(), "prompt file unavailable, using built-in template");
            builtin.to_string()
        }
    }
}

/// 组装 oracle 请求：system = 模板 + 额外段落 + 输出 schema，user = JSON 输入
pub(crate) fn render_messages<O: JsonSchema, I: Serialize>(
    template: &str,
    extra: Option<&str>,
    input: &I,
) -> Vec<Message> {
    let schema = schemars::schema_for!(O);
    let schema_text = serde_json::to_string_pretty(&schema).unwrap_or_default();
    let mut system = template.trim().to_string();
    if let Some(extra) = extra {
        system.push_str("\n\n");
        system.push_str(extra.trim());
    }
    system.push_str(
        "\n\nRespond with a single JSON object that matches this schema:\n```json\n",
    );
    system.push_str(&schema_text);
    system.push_str("\n```");

    let input_text = serde_json::to_string_pretty(input).unwrap_or_else(|_| "{}".to_string());
    vec![
        Message::system(system),
        Message::user(format!("```json\n{input_text}\n```")),
    ]
}
