//! 关键结果累积器与事实构造
//!
//! 每步工具结果按工具类型写入累积器，下一步上下文追加 `Previous results: k: v, ...`：
//! 算术工具原样保存；检索类工具只保存简短摘要；其它工具截断保存，限制上下文长度。

use crate::memory::{Fact, FactKind};
use crate::tools::executor::preview;

/// 原样保存结果的算术工具
const ARITHMETIC_TOOLS: &[&str] = &[
    "add", "subtract", "multiply", "divide", "power", "sqrt", "cbrt", "factorial", "log",
    "remainder", "sin", "cos", "tan", "mine", "int_list_to_exponential_sum",
];

/// 名称包含这些片段的工具视为检索类
const RETRIEVAL_MARKERS: &[&str] = &["search", "retrieve", "fetch", "get_", "list", "query", "lookup"];

const SUMMARY_CHARS: usize = 80;
const OTHER_CHARS: usize = 200;

/// 工具结果的保存方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Arithmetic,
    Retrieval,
    Other,
}

pub fn classify(tool: &str) -> ResultClass {
    let name = tool.to_lowercase();
    if ARITHMETIC_TOOLS.contains(&name.as_str()) {
        ResultClass::Arithmetic
    } else if RETRIEVAL_MARKERS.iter().any(|m| name.contains(m)) {
        ResultClass::Retrieval
    } else {
        ResultClass::Other
    }
}

/// 跨步骤的关键结果（插入顺序）
#[derive(Debug, Default, Clone)]
pub struct KeyResults {
    entries: Vec<(String, String)>,
}

impl KeyResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一步的结果；同名 key 覆盖
    pub fn record(&mut self, step: usize, tool: &str, result: &str) {
        let (key, value) = match classify(tool) {
            ResultClass::Arithmetic => (format!("step_{}_{}", step, tool), result.trim().to_string()),
            ResultClass::Retrieval => {
                let lines = result.lines().filter(|l| !l.trim().is_empty()).count();
                let first = result.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
                (
                    format!("step_{}_{}", step, tool),
                    format!("{} ({} lines)", preview(first, SUMMARY_CHARS), lines),
                )
            }
            ResultClass::Other => (format!("step_{}_{}", step, tool), preview(result.trim(), OTHER_CHARS)),
        };
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// `Previous results: k: v, k: v`；为空时返回 None
    pub fn summary(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let body = self
            .entries
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!("Previous results: {}", body))
    }

    /// 当前上下文：原始问题，加上已有的结果摘要
    pub fn context(&self, query: &str) -> String {
        match self.summary() {
            Some(s) => format!("{}\n\n{}", query, s),
            None => query.to_string(),
        }
    }
}

/// 描述一次工具调用及其结果的事实，带工具名标签
pub fn tool_call_fact(expression: &str, tool: &str, result: &str, query: &str, session_key: &str) -> Fact {
    Fact::new(
        format!("Tool call: {}, result: {}", expression, result),
        FactKind::ToolOutput,
        query,
        session_key,
    )
    .with_tool(tool)
    .with_tag(tool)
}
