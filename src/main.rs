//! Hive - 交互式查询助手
//!
//! 入口：初始化日志、按配置连接工具后端并组装 AgentLoop，然后逐行读取用户查询。
//! 每次运行都是无状态的，之前的问答以 `Query n / Response n` 前缀拼进新查询。

use std::path::PathBuf;

use anyhow::Context;
use hive::core::create_agent_builder;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const BANNER: &str = "\
──────────────────────────────────────────────────────
  Hive Query Assistant
  Type your question and press Enter.
  Type 'exit' or 'quit' to leave.
──────────────────────────────────────────────────────";

/// 把历史问答拼到新查询前面
fn compose_query(history: &[(String, String)], query: &str) -> String {
    let mut full = String::new();
    for (idx, (q, r)) in history.iter().enumerate() {
        full.push_str(&format!("Query {}: {q}\nResponse {}: {r}\n", idx + 1, idx + 1));
    }
    full.push_str(&format!("Query {}: {query}", history.len() + 1));
    full
}

fn is_exit(line: &str) -> bool {
    matches!(line.to_lowercase().as_str(), "exit" | "quit")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let builder = create_agent_builder(config_path);
    hive::observability::init(builder.config().app.log_format);

    println!("{BANNER}");
    tracing::info!(servers = builder.config().mcp_servers.len(), "loading tool backends");
    let components = builder.build().await;

    let mut history: Vec<(String, String)> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"\nYou: ").await.context("stdout closed")?;
        stdout.flush().await.context("stdout closed")?;
        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if is_exit(query) {
            println!("Goodbye!");
            break;
        }

        let outcome = components.agent.run(&compose_query(&history, query)).await;
        println!("\n{}", outcome.message);
        tracing::info!(session_id = %outcome.session_id, status = ?outcome.status, "agent resting");
        history.push((query.to_string(), outcome.message.trim().to_string()));
    }

    components.tools.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_query_numbers_history() {
        let history = vec![("2+3?".to_string(), "5".to_string())];
        assert_eq!(
            compose_query(&history, "times 4?"),
            "Query 1: 2+3?\nResponse 1: 5\nQuery 2: times 4?"
        );
        assert_eq!(compose_query(&[], "hi"), "Query 1: hi");
        assert!(is_exit("QUIT"));
    }
}
