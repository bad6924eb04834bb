//! 工具目录
//!
//! 汇总所有后端 `tools/list` 返回的工具描述：名称 -> (所属后端, 输入 schema, 描述)。
//! 初始化后只读；跨后端重名时按配置顺序「后注册者胜出」。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 后端声明的单个工具（与 MCP `tools/list` 的条目一致）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// 目录条目：工具归属的后端与其声明
#[derive(Debug, Clone)]
pub struct ToolCatalogEntry {
    pub backend_id: String,
    pub tool: ToolDescriptor,
}

/// 名称 -> 条目；保留首次出现的顺序，供 describe_all 稳定输出
#[derive(Debug, Default)]
pub struct ToolCatalog {
    entries: HashMap<String, ToolCatalogEntry>,
    order: Vec<String>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名已存在时覆盖（后注册者胜出），位置不变。返回被覆盖的后端 ID
    pub fn insert(&mut self, backend_id: &str, tool: ToolDescriptor) -> Option<String> {
        let name = tool.name.clone();
        let entry = ToolCatalogEntry {
            backend_id: backend_id.to_string(),
            tool,
        };
        match self.entries.insert(name.clone(), entry) {
            Some(previous) => Some(previous.backend_id),
            None => {
                self.order.push(name);
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolCatalogEntry> {
        self.entries.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ToolCatalogEntry> {
        self.order.iter().filter_map(|n| self.entries.get(n))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_backend_wins_on_collision() {
        let mut catalog = ToolCatalog::new();
        assert!(catalog
            .insert("math", ToolDescriptor::new("add", "v1", empty_schema()))
            .is_none());
        catalog.insert("docs", ToolDescriptor::new("search", "", empty_schema()));
        let replaced = catalog.insert("math2", ToolDescriptor::new("add", "v2", empty_schema()));
        assert_eq!(replaced.as_deref(), Some("math"));

        let entry = catalog.get("add").unwrap();
        assert_eq!(entry.backend_id, "math2");
        assert_eq!(entry.tool.description, "v2");
        assert_eq!(catalog.tool_names(), vec!["add", "search"]);
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_descriptor_deserializes_mcp_shape() {
        let raw = serde_json::json!({
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {"type": "object", "properties": {"a": {"type": "integer"}}}
        });
        let tool: ToolDescriptor = serde_json::from_value(raw).unwrap();
        assert_eq!(tool.name, "add");
        assert_eq!(tool.input_schema["properties"]["a"]["type"], "integer");
    }
}
