//! 汇总 oracle：根据全局变量与计划图生成最终的纯文本答复

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::action::runner::utc_now;
use crate::llm::{LlmClient, Message};
use crate::oracle::{Decoded, PerceptionOutput, Summarizer};
use crate::plan::{GraphData, PlanGraph};

pub const UNAVAILABLE_SUMMARY: &str = "Summary unavailable due to model error.";
pub const FAILED_SUMMARY: &str = "Summary generation failed due to internal error.";

pub const BUILTIN_PROMPT: &str = "You are the summarizer of an autonomous agent. \
Using the original query, the globals and the executed plan graph below, write the final answer for the user. \
Follow instruction_to_summarize from the perception when present. Answer in plain text.";

#[derive(Debug, Clone, Serialize)]
pub struct SummarizerInput {
    pub original_query: String,
    pub globals_schema: Map<String, Value>,
    pub plan_graph: GraphData,
    pub perception: PerceptionOutput,
}

impl SummarizerInput {
    pub fn from_graph(graph: &PlanGraph, perception: &PerceptionOutput) -> Self {
        Self {
            original_query: graph.original_query().to_string(),
            globals_schema: graph.globals().clone(),
            plan_graph: graph.graph_data(),
            perception: perception.clone(),
        }
    }
}

pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
    template: String,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>, template: impl Into<String>) -> Self {
        Self {
            llm,
            template: template.into(),
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, input: &SummarizerInput) -> Decoded<String> {
        let body = serde_json::to_string_pretty(input).unwrap_or_else(|_| "{}".to_string());
        let messages = [
            Message::system(format!("Current Time: {}\n\n{}", utc_now(), self.template.trim())),
            Message::user(body),
        ];
        match self.llm.complete(&messages).await {
            Ok(text) if !text.trim().is_empty() => Decoded::Parsed(text.trim().to_string()),
            Ok(_) => Decoded::Fallback {
                value: FAILED_SUMMARY.to_string(),
                reason: "empty summary".to_string(),
            },
            Err(e) => {
                tracing::warn!(error = %e, "summarizer LLM unavailable");
                Decoded::Fallback {
                    value: UNAVAILABLE_SUMMARY.to_string(),
                    reason: e,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[tokio::test]
    async fn test_summary_text_and_outage() {
        let graph = PlanGraph::new("s1", "What is 2+3?");
        let input = SummarizerInput::from_graph(&graph, &PerceptionOutput::default());
        let llm = Arc::new(ScriptedLlmClient::new(["  The answer is 5.  ", ""]));
        let summarizer = LlmSummarizer::new(llm, BUILTIN_PROMPT);

        assert_eq!(
            summarizer.summarize(&input).await,
            Decoded::Parsed("The answer is 5.".to_string())
        );
        assert_eq!(summarizer.summarize(&input).await.into_value(), FAILED_SUMMARY);
        assert_eq!(summarizer.summarize(&input).await.into_value(), UNAVAILABLE_SUMMARY);
    }
}
