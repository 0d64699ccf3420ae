//! 会话状态模型：Session / StepRecord 及其状态枚举
//!
//! Session 由唯一持有它的编排器写入，轮询方只读取快照（见 registry）。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// StepRecord 在工具返回前的占位结果
pub const PENDING_RESULT: &str = "Processing...";

/// 步数耗尽时的最终回复（与正常回复、Error 均可区分）
pub const STEP_LIMIT_ANSWER: &str = "Agent reached maximum number of steps without a final answer";

/// 会话 ID（不透明 token）
pub type SessionId = String;

/// 会话生命周期：Initializing -> Running -> {Completed | Error}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Running,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Error)
    }
}

/// 单步工具调用状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Finished,
    Error,
}

/// 一次循环迭代的工具调用记录
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepRecord {
    pub tool: String,
    pub args: String,
    pub result: String,
    pub status: StepStatus,
}

impl StepRecord {
    /// 占位记录：在真正调用工具之前发布，供轮询方看到进度
    pub fn pending(tool: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: args.into(),
            result: PENDING_RESULT.to_string(),
            status: StepStatus::Running,
        }
    }
}

/// 会话：状态、按序号排列的步骤记录、最终回复或错误
#[derive(Clone, Debug, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub query: String,
    pub status: SessionStatus,
    pub steps: BTreeMap<usize, StepRecord>,
    pub final_answer: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            query: query.into(),
            status: SessionStatus::Initializing,
            steps: BTreeMap::new(),
            final_answer: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 轮询接口返回的视图
    pub fn view(&self) -> SessionView {
        SessionView {
            status: self.status,
            steps: self.steps.clone(),
            final_answer: self.final_answer.clone(),
            error: self.error.clone(),
        }
    }
}

/// `{status, steps, final_answer, error}` 时间点快照
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionView {
    pub status: SessionStatus,
    pub steps: BTreeMap<usize, StepRecord>,
    pub final_answer: Option<String>,
    pub error: Option<String>,
}
