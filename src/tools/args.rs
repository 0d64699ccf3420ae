//! 参数表达式绑定
//!
//! 规划器给出的是自由文本参数（如 `2, 3`、`a=2, b=3`、`{"a": 2}`），MCP tools/call 需要具名 JSON 对象。
//! 规则：JSON 对象原样使用；否则按顶层逗号切分，`name=value` 先按名绑定，位置参数再按
//! schema 的 required 顺序、再按 properties 顺序填入尚未绑定的名字；值优先按 JSON 字面量解析，失败则作字符串。

use serde_json::{Map, Value};

/// 按顶层逗号切分（忽略引号与括号内的逗号）
pub fn split_top_level(expr: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut current = String::new();

    for c in expr.chars() {
        if let Some(q) = quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                quote = Some(c);
                current.push(c);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() || !parts.is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// 解析单个值：JSON 字面量 > 单引号字符串 > 原文字符串
pub fn parse_value(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return v;
    }
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    Value::String(raw.to_string())
}

/// schema 中参数名的绑定顺序：required 在前，其余 properties 在后
fn parameter_order(schema: &Value) -> Vec<String> {
    let mut names: Vec<String> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for key in props.keys() {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
    }
    names
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// `name=value` 形式：返回 (name, value 原文)
fn split_named(part: &str) -> Option<(&str, &str)> {
    let idx = part.find('=')?;
    let (name, rest) = part.split_at(idx);
    let name = name.trim();
    // `==` 或值以 `=` 开头都不是具名参数
    if rest.starts_with("==") || !is_identifier(name) {
        return None;
    }
    Some((name, &rest[1..]))
}

/// 将参数表达式绑定为 tools/call 的 arguments 对象
pub fn bind_arguments(expr: &str, schema: &Value) -> Value {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Value::Object(Map::new());
    }
    if trimmed.starts_with('{') {
        if let Ok(obj @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
            return obj;
        }
    }

    let parts = split_top_level(trimmed);
    let mut out = Map::new();
    // 先收具名参数，位置参数只填剩下的名字
    let mut positional = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        match split_named(part) {
            Some((name, value)) => {
                out.insert(name.to_string(), parse_value(value));
            }
            None => positional.push((i, part)),
        }
    }

    let mut free = parameter_order(schema)
        .into_iter()
        .filter(|n| !out.contains_key(n))
        .collect::<Vec<_>>()
        .into_iter();
    for (i, part) in positional {
        let name = free.next().unwrap_or_else(|| format!("arg{}", i));
        out.insert(name, parse_value(part));
    }
    Value::Object(out)
}
