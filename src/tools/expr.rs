//! 工具调用表达式解析
//!
//! 将 `name(arg1, arg2)` 形式的字符串解析为调用名与位置参数。参数为字面量
//! （数字、字符串、布尔、null、JSON 列表/对象，兼容单引号字符串与 True/False/None）
//! 或标识符（由调用方在作用域中解析）。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::core::AgentError;

/// 位置参数：字面量或待解析的标识符
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Literal(Value),
    Ident(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub name: String,
    pub args: Vec<Arg>,
}

/// 脚本中的右值：工具调用或单个参数
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Call(CallExpr),
    Value(Arg),
}

fn call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)\s*$").expect("valid call regex")
    })
}

fn ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid ident regex"))
}

/// 是否形如一次调用（以 `)` 结尾且含 `(`）
pub fn looks_like_call(s: &str) -> bool {
    let s = s.trim();
    s.ends_with(')') && s.contains('(')
}

pub fn is_ident(s: &str) -> bool {
    ident_re().is_match(s)
}

pub fn parse_call(expr: &str) -> Result<CallExpr, AgentError> {
    let invalid = || AgentError::InvalidToolExpression(expr.to_string());
    let caps = call_re().captures(expr).ok_or_else(invalid)?;
    let name = caps[1].to_string();
    let inner = caps[2].trim();
    let args = if inner.is_empty() {
        Vec::new()
    } else {
        split_top_level(inner)
            .ok_or_else(invalid)?
            .iter()
            .map(|tok| parse_arg(tok).ok_or_else(invalid))
            .collect::<Result<Vec<_>, _>>()?
    };
    Ok(CallExpr { name, args })
}

pub fn parse_expr(expr: &str) -> Result<Expr, AgentError> {
    if looks_like_call(expr) && !expr.trim_start().starts_with(['[', '{', '"', '\'']) {
        return parse_call(expr).map(Expr::Call);
    }
    parse_arg(expr)
        .map(Expr::Value)
        .ok_or_else(|| AgentError::InvalidToolExpression(expr.to_string()))
}

/// 按顶层逗号切分（忽略括号与引号内的逗号）；括号或引号不配对时返回 None
fn split_top_level(s: &str) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in s.chars() {
        if let Some(q) = quote {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                current.push(ch);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
                current.push(ch);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if depth != 0 || quote.is_some() {
        return None;
    }
    parts.push(current.trim().to_string());
    Some(parts)
}

fn parse_arg(token: &str) -> Option<Arg> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    match token {
        "True" | "true" => return Some(Arg::Literal(Value::Bool(true))),
        "False" | "false" => return Some(Arg::Literal(Value::Bool(false))),
        "None" | "null" => return Some(Arg::Literal(Value::Null)),
        _ => {}
    }
    if is_ident(token) {
        return Some(Arg::Ident(token.to_string()));
    }
    if token.len() >= 2 && token.starts_with('\'') && token.ends_with('\'') {
        let inner = &token[1..token.len() - 1];
        return Some(Arg::Literal(Value::String(unescape_single(inner))));
    }
    serde_json::from_str(token).ok().map(Arg::Literal)
}

fn unescape_single(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}
