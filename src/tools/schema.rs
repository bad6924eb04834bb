//! 工具输入 schema 归一化
//!
//! 后端声明参数有两种形状：平铺在 `properties` 下，或嵌套在唯一的 `input` 属性下
//! （其结构在 `$defs` 中声明）。位置参数绑定与 describe_all 的签名都从这里派生。

use serde_json::{Map, Value};

use crate::core::AgentError;
use crate::tools::ToolDescriptor;

/// 归一化后的参数形状
#[derive(Debug, Clone, PartialEq)]
pub struct ParamShape {
    /// 参数是否嵌套在 `input` 对象下
    pub nested: bool,
    /// (参数名, 类型)，按声明顺序
    pub params: Vec<(String, String)>,
}

impl ParamShape {
    pub fn from_schema(schema: &Value) -> Self {
        let has_input = schema
            .get("properties")
            .and_then(Value::as_object)
            .is_some_and(|p| p.contains_key("input"));
        if has_input {
            if let Some(props) = nested_properties(schema) {
                return Self {
                    nested: true,
                    params: collect_params(props),
                };
            }
        }
        let params = schema
            .get("properties")
            .and_then(Value::as_object)
            .map(collect_params)
            .unwrap_or_default();
        Self {
            nested: false,
            params,
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// 按声明顺序把位置参数绑定为调用参数；数量不一致时返回 ToolArity
    pub fn bind(&self, tool: &str, args: Vec<Value>) -> Result<Value, AgentError> {
        if args.len() != self.arity() {
            return Err(AgentError::ToolArity {
                tool: tool.to_string(),
                expected: self.arity(),
                got: args.len(),
            });
        }
        let bound: Map<String, Value> = self
            .params
            .iter()
            .map(|(name, _)| name.clone())
            .zip(args)
            .collect();
        if self.nested {
            let mut outer = Map::new();
            outer.insert("input".to_string(), Value::Object(bound));
            Ok(Value::Object(outer))
        } else {
            Ok(Value::Object(bound))
        }
    }
}

/// 解析 `input` 属性的定义：优先跟随 `$ref`，否则取 `$defs`（或 `definitions`）中的第一项
fn nested_properties(schema: &Value) -> Option<&Map<String, Value>> {
    let defs = schema
        .get("$defs")
        .or_else(|| schema.get("definitions"))
        .and_then(Value::as_object)?;
    let input = schema.get("properties").and_then(|p| p.get("input"));
    let by_ref = input
        .and_then(|i| i.get("$ref"))
        .and_then(Value::as_str)
        .and_then(|r| r.rsplit('/').next())
        .and_then(|key| defs.get(key));
    by_ref
        .or_else(|| defs.values().next())
        .and_then(|d| d.get("properties"))
        .and_then(Value::as_object)
}

fn collect_params(props: &Map<String, Value>) -> Vec<(String, String)> {
    props
        .iter()
        .map(|(name, spec)| {
            let ty = spec
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("any")
                .to_string();
            (name.clone(), ty)
        })
        .collect()
}

/// 供 Planner prompt 使用的一行签名：`name(type1, type2) # description`
pub fn signature_line(tool: &ToolDescriptor) -> String {
    let shape = ParamShape::from_schema(&tool.input_schema);
    let types: Vec<&str> = shape.params.iter().map(|(_, t)| t.as_str()).collect();
    format!("{}({}) # {}", tool.name, types.join(", "), tool.description)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flat_add() -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "integer"}
            },
            "required": ["a", "b"]
        })
    }

    fn nested_add() -> Value {
        json!({
            "type": "object",
            "properties": {"input": {"$ref": "#/$defs/AddInput"}},
            "$defs": {
                "AddInput": {
                    "type": "object",
                    "properties": {
                        "a": {"type": "integer"},
                        "b": {"type": "integer"}
                    }
                }
            }
        })
    }

    #[test]
    fn test_flat_shape_binds_positionally() {
        let shape = ParamShape::from_schema(&flat_add());
        assert!(!shape.nested);
        let args = shape.bind("add", vec![json!(2), json!(3)]).unwrap();
        assert_eq!(args, json!({"a": 2, "b": 3}));
    }

    #[test]
    fn test_nested_shape_wraps_input() {
        let shape = ParamShape::from_schema(&nested_add());
        assert!(shape.nested);
        let args = shape.bind("add", vec![json!(2), json!(3)]).unwrap();
        assert_eq!(args, json!({"input": {"a": 2, "b": 3}}));
    }

    #[test]
    fn test_arity_mismatch() {
        let shape = ParamShape::from_schema(&flat_add());
        let err = shape.bind("add", vec![json!(1)]).unwrap_err();
        assert!(matches!(err, AgentError::ToolArity { expected: 2, got: 1, .. }));
    }

    #[test]
    fn test_signature_line() {
        let tool = ToolDescriptor::new("add", "Add two numbers", nested_add());
        assert_eq!(signature_line(&tool), "add(integer, integer) # Add two numbers");
        let bare = ToolDescriptor::new("ping", "Health check", json!({"type": "object"}));
        assert_eq!(signature_line(&bare), "ping() # Health check");
    }
}
