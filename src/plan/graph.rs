//! 计划图
//!
//! 显式的节点表 + 边列表实现的步骤 DAG；子树重命名通过邻接遍历求可达后代。
//! 全局变量区只追加：已存在的键不会被覆盖，而是写入 `key__<step_id>` 保留来源。

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::{json, Map, Value};

use crate::core::AgentError;
use crate::plan::types::*;

/// 失败记忆中错误信息的最大字符数
const FAILURE_MEMORY_CHARS: usize = 300;

/// 单次运行（会话）的计划图
#[derive(Debug, Clone)]
pub struct PlanGraph {
    session_id: String,
    original_query: String,
    /// 节点插入顺序（选取「第一个 pending 节点」时按此顺序）
    order: Vec<StepId>,
    nodes: HashMap<StepId, StepNode>,
    edges: Vec<Edge>,
    globals: Map<String, Value>,
    failed_nodes: Vec<StepId>,
    memory: Vec<Value>,
    latest: Option<StepId>,
}

impl PlanGraph {
    /// 创建计划图并种下已完成的 ROOT 节点（描述为原始查询）
    pub fn new(session_id: impl Into<String>, original_query: impl Into<String>) -> Self {
        let original_query = original_query.into();
        let mut root = StepNode::new(ROOT_ID, original_query.clone(), StepType::Root, None);
        root.status = StepStatus::Completed;
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID.to_string(), root);
        Self {
            session_id: session_id.into(),
            original_query,
            order: vec![ROOT_ID.to_string()],
            nodes,
            edges: Vec::new(),
            globals: Map::new(),
            failed_nodes: Vec::new(),
            memory: Vec::new(),
            latest: Some(ROOT_ID.to_string()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn original_query(&self) -> &str {
        &self.original_query
    }

    /// 添加步骤；给出 from_id 时同时添加一条边。已存在的节点只更新描述，谱系保持不变
    pub fn add_step(
        &mut self,
        step_id: &str,
        description: &str,
        step_type: StepType,
        from_id: Option<&str>,
        edge_type: &str,
    ) -> StepId {
        match self.nodes.get_mut(step_id) {
            Some(existing) => {
                existing.description = description.to_string();
            }
            None => {
                let node = StepNode::new(
                    step_id,
                    description,
                    step_type,
                    from_id.map(str::to_string),
                );
                self.nodes.insert(step_id.to_string(), node);
                self.order.push(step_id.to_string());
            }
        }
        if let Some(from) = from_id {
            self.add_edge(from, step_id, edge_type);
        }
        self.latest = Some(step_id.to_string());
        step_id.to_string()
    }

    /// 同一对端点的边已存在时保留原边
    fn add_edge(&mut self, source: &str, target: &str, edge_type: &str) {
        let exists = self
            .edges
            .iter()
            .any(|e| e.source == source && e.target == target);
        if !exists {
            self.edges.push(Edge {
                source: source.to_string(),
                target: target.to_string(),
                edge_type: edge_type.to_string(),
            });
        }
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.nodes.contains_key(step_id)
    }

    pub fn node(&self, step_id: &str) -> Option<&StepNode> {
        self.nodes.get(step_id)
    }

    /// 按插入顺序遍历节点
    pub fn nodes(&self) -> impl Iterator<Item = &StepNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn globals(&self) -> &Map<String, Value> {
        &self.globals
    }

    pub fn failed_nodes(&self) -> &[StepId] {
        &self.failed_nodes
    }

    pub fn memory(&self) -> &[Value] {
        &self.memory
    }

    pub fn latest_node(&self) -> Option<&str> {
        self.latest.as_deref()
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.nodes
            .get(step_id)
            .is_some_and(|n| n.status == StepStatus::Completed)
    }

    fn node_mut(&mut self, step_id: &str) -> Result<&mut StepNode, AgentError> {
        self.nodes
            .get_mut(step_id)
            .ok_or_else(|| AgentError::StepNotFound(step_id.to_string()))
    }

    /// 写入步骤结果并标记完成；结果中的每个键按全局写规则写入全局变量区
    /// （非对象结果以 `result` 为键）
    pub fn update_result(&mut self, step_id: &str, result: Value) -> Result<(), AgentError> {
        let node = self.node_mut(step_id)?;
        node.result = Some(result.clone());
        node.status = StepStatus::Completed;
        match result {
            Value::Object(map) => {
                for (key, value) in map {
                    self.write_global(&key, value, step_id);
                }
            }
            other => self.write_global("result", other, step_id),
        }
        Ok(())
    }

    /// 全局写规则：键不存在则直接写入，否则写入 `key__<step_id>`，原绑定保持不变
    pub fn write_global(&mut self, key: &str, value: Value, step_id: &str) {
        if self.globals.contains_key(key) {
            self.globals.insert(format!("{key}__{step_id}"), value);
        } else {
            self.globals.insert(key.to_string(), value);
        }
    }

    pub fn mark_completed(&mut self, step_id: &str) -> Result<(), AgentError> {
        self.node_mut(step_id)?.status = StepStatus::Completed;
        Ok(())
    }

    /// 标记失败：记录错误、加入失败列表，并追加一条轻量记忆（查询、"Tool failed"、截断的错误）
    pub fn mark_failed(&mut self, step_id: &str, error_msg: &str) -> Result<(), AgentError> {
        let node = self.node_mut(step_id)?;
        node.status = StepStatus::Failed;
        node.error = Some(error_msg.to_string());
        let description = node.description.clone();
        self.push_failed(step_id);
        self.memory.push(json!({
            "query": description,
            "result_requirement": "Tool failed",
            "solution_summary": truncate_chars(error_msg, FAILURE_MEMORY_CHARS),
        }));
        Ok(())
    }

    fn push_failed(&mut self, step_id: &str) {
        if !self.failed_nodes.iter().any(|id| id == step_id) {
            self.failed_nodes.push(step_id.to_string());
        }
    }

    /// 挂载感知结果；未知 ID 会创建 PERCEPTION 占位节点。局部目标未达成时该节点计入失败列表
    pub fn attach_perception(&mut self, step_id: &str, perception: Value) {
        if !self.nodes.contains_key(step_id) {
            let node = StepNode::new(
                step_id,
                "Perception-only node",
                StepType::Perception,
                None,
            );
            self.nodes.insert(step_id.to_string(), node);
            self.order.push(step_id.to_string());
        }
        let local_goal_achieved = perception
            .get("local_goal_achieved")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if let Some(node) = self.nodes.get_mut(step_id) {
            node.perception = Some(perception);
        }
        if !local_goal_achieved {
            self.push_failed(step_id);
        }
    }

    pub fn conclude(&mut self, step_id: &str, conclusion: &str) -> Result<(), AgentError> {
        let node = self.node_mut(step_id)?;
        node.status = StepStatus::Completed;
        node.conclusion = Some(conclusion.to_string());
        Ok(())
    }

    /// 将 step_id 及其全部可达后代重命名为 `旧 ID + suffix`：
    /// 重连涉及的边、移除旧节点、重映射失败列表。节点位置与谱系语义保持不变。
    /// 返回按遍历顺序排列的 (旧 ID, 新 ID)
    pub fn rename_subtree_from(&mut self, step_id: &str, suffix: &str) -> Vec<(StepId, StepId)> {
        if !self.nodes.contains_key(step_id) {
            return Vec::new();
        }
        let renamed: Vec<(StepId, StepId)> = self
            .descendants_inclusive(step_id)
            .into_iter()
            .map(|old| {
                let new = format!("{old}{suffix}");
                (old, new)
            })
            .collect();
        let mapping: HashMap<StepId, StepId> = renamed.iter().cloned().collect();

        for (old, new) in &mapping {
            if let Some(mut node) = self.nodes.remove(old) {
                node.id = new.clone();
                if let Some(from) = node.from_step.as_ref().and_then(|f| mapping.get(f)) {
                    node.from_step = Some(from.clone());
                }
                self.nodes.insert(new.clone(), node);
            }
        }
        for id in self.order.iter_mut() {
            if let Some(new) = mapping.get(id) {
                *id = new.clone();
            }
        }
        for edge in self.edges.iter_mut() {
            if let Some(new) = mapping.get(&edge.source) {
                edge.source = new.clone();
            }
            if let Some(new) = mapping.get(&edge.target) {
                edge.target = new.clone();
            }
        }
        for id in self.failed_nodes.iter_mut() {
            if let Some(new) = mapping.get(id) {
                *id = new.clone();
            }
        }
        if let Some(new) = self.latest.as_ref().and_then(|l| mapping.get(l)) {
            self.latest = Some(new.clone());
        }
        renamed
    }

    /// 广度优先求 start 及其所有可达后代
    fn descendants_inclusive(&self, start: &str) -> Vec<StepId> {
        let mut seen: HashSet<StepId> = HashSet::new();
        let mut queue = VecDeque::from([start.to_string()]);
        let mut out = Vec::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            for edge in self.edges.iter().filter(|e| e.source == id) {
                queue.push_back(edge.target.clone());
            }
            out.push(id);
        }
        out
    }

    /// 按节点顺序返回第一个 pending 节点，没有则回到 ROOT
    pub fn first_pending(&self) -> StepId {
        self.nodes()
            .find(|n| n.is_pending())
            .map(|n| n.id.clone())
            .unwrap_or_else(|| ROOT_ID.to_string())
    }

    /// 将所有仍为 pending 的节点标记为 skipped（汇总前调用）
    pub fn skip_pending(&mut self) {
        for node in self.nodes.values_mut() {
            if node.is_pending() {
                node.status = StepStatus::Skipped;
            }
        }
    }

    pub fn completed_steps(&self) -> Vec<&StepNode> {
        self.nodes()
            .filter(|n| n.status == StepStatus::Completed)
            .collect()
    }

    pub fn failed_steps(&self) -> Vec<&StepNode> {
        self.failed_nodes
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .collect()
    }

    /// 全局变量概要：键 -> {type, preview}，preview 截断到 preview_chars
    pub fn globals_schema(&self, preview_chars: usize) -> Map<String, Value> {
        self.globals
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let mut preview = truncate_chars(&text, preview_chars);
                if text.chars().count() > preview_chars {
                    preview.push('…');
                }
                (
                    k.clone(),
                    json!({ "type": json_type_name(v), "preview": preview }),
                )
            })
            .collect()
    }

    /// 汇总结果写入会话记忆
    pub fn attach_summary(&mut self, summary: &str) {
        self.memory.push(json!({
            "original_query": self.original_query,
            "result_requirement": "Final summary",
            "summarizer_summary": summary,
            "confidence": 0.95,
            "original_goal_achieved": true,
            "route": "summarize",
        }));
    }

    pub fn graph_data(&self) -> GraphData {
        GraphData {
            nodes: self.nodes().cloned().collect(),
            links: self.edges.clone(),
        }
    }

    /// 序列化完整图（节点 + 边）、全局变量区与记忆条目
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            session_id: self.session_id.clone(),
            original_query: self.original_query.clone(),
            globals: self.globals.clone(),
            memory: self.memory.clone(),
            graph: self.graph_data(),
        }
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_graph() -> PlanGraph {
        let mut g = PlanGraph::new("s1", "what is 2+3");
        g.add_step("3", "step three", StepType::Code, Some(ROOT_ID), "normal");
        g.add_step("5", "step five", StepType::Code, Some("3"), "normal");
        g.add_step("7", "step seven", StepType::Code, Some("5"), "normal");
        g
    }

    #[test]
    fn test_root_seeded_completed() {
        let g = PlanGraph::new("s1", "query");
        let root = g.node(ROOT_ID).unwrap();
        assert_eq!(root.step_type, StepType::Root);
        assert_eq!(root.status, StepStatus::Completed);
        assert!(root.from_step().is_none());
        assert!(g.is_completed(ROOT_ID));
    }

    #[test]
    fn test_add_step_links_and_latest() {
        let mut g = PlanGraph::new("s1", "query");
        let id = g.add_step("0", "first", StepType::Code, Some(ROOT_ID), "normal");
        assert_eq!(id, "0");
        assert_eq!(g.latest_node(), Some("0"));
        assert_eq!(g.edges().len(), 1);
        assert_eq!(g.node("0").unwrap().from_step(), Some(ROOT_ID));
        assert!(!g.is_completed("0"));
    }

    #[test]
    fn test_from_step_never_changes_on_readd() {
        let mut g = PlanGraph::new("s1", "query");
        g.add_step("0", "first", StepType::Code, Some(ROOT_ID), "normal");
        g.add_step("1", "second", StepType::Code, Some(ROOT_ID), "normal");
        g.add_step("0", "first again", StepType::Code, Some("1"), "replan");
        let node = g.node("0").unwrap();
        assert_eq!(node.from_step(), Some(ROOT_ID));
        assert_eq!(node.description, "first again");
        assert_eq!(g.nodes().count(), 3);
    }

    #[test]
    fn test_global_write_rule_versions_existing_keys() {
        let mut g = PlanGraph::new("s1", "query");
        g.add_step("S1", "a", StepType::Code, Some(ROOT_ID), "normal");
        g.add_step("S2", "b", StepType::Code, Some(ROOT_ID), "normal");
        g.update_result("S1", json!({"x": 1})).unwrap();
        g.update_result("S2", json!({"x": 2})).unwrap();
        assert_eq!(g.globals().len(), 2);
        assert_eq!(g.globals()["x"], json!(1));
        assert_eq!(g.globals()["x__S2"], json!(2));
        assert!(g.is_completed("S2"));
    }

    #[test]
    fn test_update_result_unknown_step() {
        let mut g = PlanGraph::new("s1", "query");
        let err = g.update_result("nope", json!({})).unwrap_err();
        assert!(matches!(err, AgentError::StepNotFound(_)));
    }

    #[test]
    fn test_mark_failed_records_memory() {
        let mut g = PlanGraph::new("s1", "query");
        g.add_step("0", "fetch page", StepType::Code, Some(ROOT_ID), "normal");
        let long_error = "e".repeat(500);
        g.mark_failed("0", &long_error).unwrap();
        assert_eq!(g.failed_nodes(), ["0".to_string()]);
        assert_eq!(g.node("0").unwrap().status, StepStatus::Failed);
        let entry = &g.memory()[0];
        assert_eq!(entry["query"], json!("fetch page"));
        assert_eq!(entry["result_requirement"], json!("Tool failed"));
        assert_eq!(entry["solution_summary"].as_str().unwrap().len(), 300);

        g.mark_failed("0", "again").unwrap();
        assert_eq!(g.failed_nodes().len(), 1);
        assert_eq!(g.memory().len(), 2);
    }

    #[test]
    fn test_attach_perception_creates_placeholder_and_flags_failure() {
        let mut g = PlanGraph::new("s1", "query");
        g.attach_perception("9", json!({"local_goal_achieved": false}));
        let node = g.node("9").unwrap();
        assert_eq!(node.step_type, StepType::Perception);
        assert_eq!(g.failed_nodes(), ["9".to_string()]);

        g.attach_perception(ROOT_ID, json!({"local_goal_achieved": true}));
        assert_eq!(g.failed_nodes().len(), 1);
        assert!(g.node(ROOT_ID).unwrap().perception.is_some());
    }

    #[test]
    fn test_conclude() {
        let mut g = PlanGraph::new("s1", "query");
        g.add_step("0", "answer", StepType::Code, Some(ROOT_ID), "normal");
        g.conclude("0", "it is 5").unwrap();
        let node = g.node("0").unwrap();
        assert_eq!(node.status, StepStatus::Completed);
        assert_eq!(node.conclusion.as_deref(), Some("it is 5"));
    }

    #[test]
    fn test_rename_subtree_relinks_edges() {
        let mut g = chain_graph();
        g.mark_failed("5", "boom").unwrap();
        let renamed = g.rename_subtree_from("3", "X");
        assert_eq!(renamed[0], ("3".to_string(), "3X".to_string()));
        assert_eq!(renamed.len(), 3);

        for id in ["3X", "5X", "7X"] {
            assert!(g.contains(id), "{id} should exist");
        }
        for id in ["3", "5", "7"] {
            assert!(!g.contains(id), "{id} should be gone");
        }
        let pairs: Vec<(&str, &str)> = g
            .edges()
            .iter()
            .map(|e| (e.source.as_str(), e.target.as_str()))
            .collect();
        assert_eq!(pairs, vec![(ROOT_ID, "3X"), ("3X", "5X"), ("5X", "7X")]);
        assert_eq!(g.failed_nodes(), ["5X".to_string()]);
        assert_eq!(g.node("5X").unwrap().from_step(), Some("3X"));
        assert_eq!(g.node("3X").unwrap().from_step(), Some(ROOT_ID));
        assert_eq!(g.latest_node(), Some("7X"));
    }

    #[test]
    fn test_rename_unknown_is_noop() {
        let mut g = chain_graph();
        assert!(g.rename_subtree_from("42", "X").is_empty());
        assert_eq!(g.nodes().count(), 4);
    }

    #[test]
    fn test_first_pending_and_skip() {
        let mut g = chain_graph();
        g.update_result("3", json!({"a": 1})).unwrap();
        assert_eq!(g.first_pending(), "5");
        g.skip_pending();
        assert_eq!(g.first_pending(), ROOT_ID);
        assert_eq!(g.node("7").unwrap().status, StepStatus::Skipped);
    }

    #[test]
    fn test_globals_schema_preview() {
        let mut g = PlanGraph::new("s1", "query");
        g.write_global("text", json!("abcdef"), ROOT_ID);
        g.write_global("n", json!(3), ROOT_ID);
        let schema = g.globals_schema(3);
        assert_eq!(schema["text"]["type"], json!("string"));
        assert_eq!(schema["text"]["preview"], json!("abc…"));
        assert_eq!(schema["n"]["type"], json!("integer"));
    }

    #[test]
    fn test_snapshot_serializes_graph() {
        let mut g = chain_graph();
        g.update_result("3", json!({"sum": 5})).unwrap();
        let snap = serde_json::to_value(g.snapshot()).unwrap();
        assert_eq!(snap["graph"]["nodes"].as_array().unwrap().len(), 4);
        assert_eq!(snap["graph"]["links"].as_array().unwrap().len(), 3);
        assert_eq!(snap["globals"]["sum"], json!(5));
        assert_eq!(snap["graph"]["nodes"][0]["type"], json!("ROOT"));
    }
}
