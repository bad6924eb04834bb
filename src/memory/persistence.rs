//! 会话记录持久化
//!
//! 运行成功或停止时，将上下文快照 + 会话历史写成一份 JSON：
//! `<session_log_dir>/YYYY/MM/DD/<session_id>.json`（UTC 日期），目录不存在时自动创建。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::AgentSession;
use crate::plan::ContextSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Success,
    Failed,
}

/// 持久化记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub context: ContextSnapshot,
    pub session: AgentSession,
    pub status: RecordStatus,
    pub final_step_id: Option<String>,
    pub reason: String,
    pub timestamp: String,
    pub original_query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_summary: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionLogStore {
    root: PathBuf,
}

impl SessionLogStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, session_id: &str, at: DateTime<Utc>) -> PathBuf {
        self.root
            .join(format!("{:04}", at.year()))
            .join(format!("{:02}", at.month()))
            .join(format!("{:02}", at.day()))
            .join(format!("{session_id}.json"))
    }

    /// 写入记录并返回文件路径
    pub fn save(&self, record: &SessionRecord) -> Result<PathBuf, AgentError> {
        let path = self.path_for(&record.session.session_id, Utc::now());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::Persistence(format!("{}: {e}", parent.display())))?;
        }
        let body = serde_json::to_string_pretty(record)
            .map_err(|e| AgentError::Persistence(e.to_string()))?;
        std::fs::write(&path, body)
            .map_err(|e| AgentError::Persistence(format!("{}: {e}", path.display())))?;
        tracing::info!(session_id = %record.session.session_id, path = %path.display(), "session record saved");
        Ok(path)
    }

    pub fn load(&self, path: &Path) -> Result<SessionRecord, AgentError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Persistence(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&data).map_err(|e| AgentError::Persistence(e.to_string()))
    }
}
