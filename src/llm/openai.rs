//! OpenAI 兼容 API 客户端
//!
//! 三个 oracle 共用一个客户端；每次调用记录模型、耗时与 token 用量。
//! base_url 可指向 DeepSeek、OpenAI 或任何兼容代理。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 累计 token 用量
#[derive(Debug, Default)]
pub struct TokenUsage {
    prompt: AtomicU64,
    completion: AtomicU64,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt.fetch_add(prompt, Ordering::Relaxed);
        self.completion.fetch_add(completion, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn get(&self) -> (u64, u64, u64) {
        let prompt = self.prompt.load(Ordering::Relaxed);
        let completion = self.completion.load(Ordering::Relaxed);
        (prompt, completion, prompt + completion)
    }
}

fn to_request_message(message: &Message) -> Result<ChatCompletionRequestMessage, String> {
    let content = message.content.clone();
    let built = match message.role {
        Role::System => ChatCompletionRequestSystemMessageArgs::default()
            .content(content)
            .build()
            .map(ChatCompletionRequestMessage::System),
        Role::User => ChatCompletionRequestUserMessageArgs::default()
            .content(content)
            .build()
            .map(ChatCompletionRequestMessage::User),
        Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content)
            .build()
            .map(ChatCompletionRequestMessage::Assistant),
    };
    built.map_err(|e| format!("invalid {:?} message: {e}", message.role))
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: Option<f32>,
    usage: TokenUsage,
}

impl OpenAiClient {
    /// api_key 缺省时读取 `OPENAI_API_KEY`
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature: None,
            usage: TokenUsage::default(),
        }
    }

    /// DeepSeek 预设：优先 `DEEPSEEK_API_KEY`，模型缺省为 deepseek-chat
    pub fn deepseek(model: Option<&str>) -> Self {
        let api_key = std::env::var("DEEPSEEK_API_KEY")
            .ok()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        Self::new(
            Some(DEEPSEEK_BASE_URL),
            model.unwrap_or(DEEPSEEK_CHAT),
            api_key.as_deref(),
        )
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let converted = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>, _>>()?;
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(converted);
        if let Some(t) = self.temperature {
            args.temperature(t);
        }
        let request = args.build().map_err(|e| e.to_string())?;

        let started = Instant::now();
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;

        let (prompt, completion) = response
            .usage
            .as_ref()
            .map(|u| (u.prompt_tokens as u64, u.completion_tokens as u64))
            .unwrap_or((0, 0));
        self.usage.add(prompt, completion);
        tracing::debug!(
            model = %self.model,
            prompt_tokens = prompt,
            completion_tokens = completion,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "llm completion"
        );

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| "completion returned no content".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_conversion_keeps_roles() {
        let msgs = [Message::system("s"), Message::user("u"), Message::assistant("a")];
        let converted: Vec<_> = msgs.iter().map(|m| to_request_message(m).unwrap()).collect();
        assert!(matches!(converted[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(converted[1], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(converted[2], ChatCompletionRequestMessage::Assistant(_)));
    }

    #[test]
    fn test_usage_accumulates() {
        let usage = TokenUsage::default();
        usage.add(10, 5);
        usage.add(1, 1);
        assert_eq!(usage.get(), (11, 6, 17));
    }
}
