//! 记忆层：会话历史快照、会话记录持久化、历史会话检索

pub mod persistence;
pub mod search;
pub mod session;

pub use persistence::{RecordStatus, SessionLogStore, SessionRecord};
pub use search::{normalize_query, MemoryHit, MemorySearch, NoopMemory, SessionMemoryIndex};
pub use session::{
    AgentSession, DecisionSnapshot, ExecutionSnapshot, PerceptionSnapshot, SessionState,
    SessionStatus, SummarizerSnapshot,
};
