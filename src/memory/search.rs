//! 历史会话检索
//!
//! 启动一次运行前，按查询相似度取回过去成功会话的最终汇总，作为 `memory` 写入全局变量区。
//! SessionMemoryIndex 扫描会话日志目录（walkdir），对归一化后的查询做词集重叠打分。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use walkdir::WalkDir;

/// 一条检索结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub score: f64,
    pub session_id: String,
    pub original_query: String,
    pub summary_output: String,
    pub timestamp: String,
}

/// 历史会话检索（外部相似度搜索协作者）
pub trait MemorySearch: Send + Sync {
    fn search(&self, query: &str, top_k: usize) -> Vec<MemoryHit>;
}

/// 不返回任何记忆
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMemory;

impl MemorySearch for NoopMemory {
    fn search(&self, _query: &str, _top_k: usize) -> Vec<MemoryHit> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
struct IndexEntry {
    hit: MemoryHit,
    tokens: HashSet<String>,
}

/// 基于会话日志目录的检索；每次 search 重新扫描，本进程刚写入的记录也能被检索到
#[derive(Debug, Clone)]
pub struct SessionMemoryIndex {
    root: PathBuf,
}

fn query_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)query\s*\d+:\s*").expect("valid prefix regex"))
}

/// 去掉 "Query 3:" 前缀与标点，转小写并压缩空白
pub fn normalize_query(text: &str) -> String {
    let stripped = query_prefix_re().replace_all(text, "");
    let cleaned: String = stripped
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect();
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn token_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_string).collect()
}

impl SessionMemoryIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 扫描目录下所有 .json 会话记录；无法解析的文件记录日志后跳过
    fn scan(&self) -> Vec<IndexEntry> {
        let mut entries = Vec::new();
        if !self.root.exists() {
            return entries;
        }
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
        {
            let parsed = std::fs::read_to_string(entry.path())
                .ok()
                .and_then(|s| serde_json::from_str::<Value>(&s).ok());
            match parsed {
                Some(record) => entries.extend(Self::entries_from_record(&record)),
                None => tracing::debug!(path = %entry.path().display(), "skipping unreadable session log"),
            }
        }
        tracing::debug!(root = %self.root.display(), entries = entries.len(), "memory index scanned");
        entries
    }

    /// 每个有内容的汇总快照生成一条索引
    fn entries_from_record(record: &Value) -> Vec<IndexEntry> {
        let session = &record["session"];
        let session_id = session["session_id"].as_str().unwrap_or_default();
        let original_query = session["original_query"].as_str().unwrap_or_default();
        let tokens = token_set(&normalize_query(original_query));
        session["summarizer_snapshots"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|snap| {
                let summary = snap["summary_output"].as_str().filter(|s| !s.is_empty())?;
                Some(IndexEntry {
                    hit: MemoryHit {
                        score: 0.0,
                        session_id: session_id.to_string(),
                        original_query: original_query.to_string(),
                        summary_output: summary.to_string(),
                        timestamp: snap["timestamp"].as_str().unwrap_or("unknown").to_string(),
                    },
                    tokens: tokens.clone(),
                })
            })
            .collect()
    }

    /// 当前可检索的条目数
    pub fn len(&self) -> usize {
        self.scan().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MemorySearch for SessionMemoryIndex {
    /// 词集重叠得分 `100 * 2|A∩B| / (|A|+|B|)`；零分不返回
    fn search(&self, query: &str, top_k: usize) -> Vec<MemoryHit> {
        let query_tokens = token_set(&normalize_query(query));
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<MemoryHit> = self
            .scan()
            .iter()
            .filter_map(|e| {
                let common = e.tokens.intersection(&query_tokens).count();
                if common == 0 {
                    return None;
                }
                let score = 200.0 * common as f64 / (e.tokens.len() + query_tokens.len()) as f64;
                Some(MemoryHit {
                    score,
                    ..e.hit.clone()
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        scored
    }
}
