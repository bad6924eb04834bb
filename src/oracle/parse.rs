//! LLM 输出解析
//!
//! 从模型回复中提取 JSON 对象（```json 代码块优先，否则取最外层花括号），
//! 并检查必需键；缺键或无法解析时返回错误，由调用方降级为安全默认值。

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::core::AgentError;

/// 提取 JSON 文本：```json 块 > ``` 块 > 第一个 `{` 到最后一个 `}`
pub fn extract_json_block(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        if let Some(end) = rest.find("```") {
            let inner = rest[..end].trim();
            if inner.starts_with('{') {
                return Some(inner);
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析为 JSON 对象并校验必需键
pub fn parse_llm_json(output: &str, required_keys: &[&str]) -> Result<Map<String, Value>, AgentError> {
    let json_str = extract_json_block(output)
        .ok_or_else(|| AgentError::JsonParseError("no JSON object in model output".to_string()))?;
    let value: Value = serde_json::from_str(json_str)
        .map_err(|e| AgentError::JsonParseError(format!("{e}: {}", preview(json_str))))?;
    let Value::Object(map) = value else {
        return Err(AgentError::JsonParseError("model output is not a JSON object".to_string()));
    };
    let missing: Vec<String> = required_keys
        .iter()
        .filter(|k| !map.contains_key(**k))
        .map(|k| k.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(AgentError::MissingKeys(missing));
    }
    Ok(map)
}

/// parse_llm_json 后再反序列化为目标类型
pub fn decode_llm_json<T: DeserializeOwned>(output: &str, required_keys: &[&str]) -> Result<T, AgentError> {
    let map = parse_llm_json(output, required_keys)?;
    serde_json::from_value(Value::Object(map)).map_err(|e| AgentError::JsonParseError(e.to_string()))
}

fn preview(s: &str) -> String {
    let head: String = s.chars().take(120).collect();
    if s.chars().count() > 120 {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_fenced_block() {
        let text = "Here you go:\n```json\n{\"a\": 1, \"b\": {\"c\": 2}}\n```\nanything else";
        let map = parse_llm_json(text, &["a", "b"]).unwrap();
        assert_eq!(map["b"]["c"], 2);
    }

    #[test]
    fn test_extracts_bare_object() {
        let text = "Sure. {\"route\": \"decision\"} Hope that helps.";
        assert_eq!(extract_json_block(text), Some("{\"route\": \"decision\"}"));
    }

    #[test]
    fn test_missing_keys_reported() {
        let err = parse_llm_json("{\"a\": 1}", &["a", "b", "c"]).unwrap_err();
        match err {
            AgentError::MissingKeys(keys) => assert_eq!(keys, vec!["b", "c"]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_non_json() {
        assert!(matches!(
            parse_llm_json("I could not decide.", &[]).unwrap_err(),
            AgentError::JsonParseError(_)
        ));
        assert!(matches!(
            parse_llm_json("{not json}", &[]).unwrap_err(),
            AgentError::JsonParseError(_)
        ));
    }
}
