//! 事实记录：会话内追加、按相关度检索的不可变记忆条目

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;

/// 事实类型标签
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    Fact,
    ToolOutput,
}

/// 一条记忆：文本、类型、来源工具、来源查询、标签、会话分组键
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub text: String,
    pub kind: FactKind,
    pub tool_name: Option<String>,
    pub user_query: String,
    pub tags: BTreeSet<String>,
    pub session_key: String,
    pub created_at: DateTime<Utc>,
}

impl Fact {
    pub fn new(
        text: impl Into<String>,
        kind: FactKind,
        user_query: impl Into<String>,
        session_key: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            kind,
            tool_name: None,
            user_query: user_query.into(),
            tags: BTreeSet::new(),
            session_key: session_key.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool_name = Some(tool.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// 记忆存储：追加与检索（排序方式由实现决定）
pub trait MemoryStore: Send + Sync {
    /// 追加一条事实
    fn add(&self, fact: Fact) -> Result<(), AgentError>;

    /// 按 query 检索最多 top_k 条；session_filter 为 Some 时只返回该分组键下的事实
    fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        session_filter: Option<&str>,
    ) -> Result<Vec<Fact>, AgentError>;
}
