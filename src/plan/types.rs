//! 计划图类型定义
//!
//! 定义步骤节点、步骤类型/状态、谱系边与可持久化的上下文快照

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type StepId = String;

/// ROOT 节点 ID：每张计划图都有，创建即 completed，没有 from_step
pub const ROOT_ID: &str = "ROOT";

/// 步骤类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepType {
    /// 原始查询
    Root,
    /// 由 Planner 生成、需要执行代码变体的步骤
    Code,
    /// 仅挂载感知结果的占位节点
    Perception,
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
    /// 汇总时仍未执行的步骤
    Skipped,
}

/// 计划图中的步骤节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepNode {
    pub id: StepId,
    pub description: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub conclusion: Option<String>,
    pub error: Option<String>,
    /// 该步骤执行后的感知输出
    pub perception: Option<Value>,
    /// 谱系指针：一旦设置不再改变（子树重命名时仅重新标号）
    pub(crate) from_step: Option<StepId>,
}

impl StepNode {
    pub(crate) fn new(
        id: impl Into<StepId>,
        description: impl Into<String>,
        step_type: StepType,
        from_step: Option<StepId>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            step_type,
            status: StepStatus::Pending,
            result: None,
            conclusion: None,
            error: None,
            perception: None,
            from_step,
        }
    }

    pub fn from_step(&self) -> Option<&str> {
        self.from_step.as_deref()
    }

    pub fn is_pending(&self) -> bool {
        self.status == StepStatus::Pending
    }
}

/// 谱系/因果边
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: StepId,
    pub target: StepId,
    #[serde(rename = "type")]
    pub edge_type: String,
}

/// 节点 + 边（node-link 形式）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphData {
    pub nodes: Vec<StepNode>,
    pub links: Vec<Edge>,
}

/// 计划图的完整快照：图、全局变量、记忆条目，用于持久化与调试
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub session_id: String,
    pub original_query: String,
    pub globals: Map<String, Value>,
    pub memory: Vec<Value>,
    pub graph: GraphData,
}
