//! 会话过程事件：用于 SSE 推送状态变化、工具调用与最终回复
//!
//! 编排器只通过 SessionHandle 写事件，Web 层订阅 SessionRegistry 的广播读取。

use serde::Serialize;

use crate::core::{SessionId, SessionStatus};

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// 会话状态迁移
    StatusChanged { status: SessionStatus },
    /// 循环步数更新（当前第几步）
    StepUpdate { step: usize, max_steps: usize },
    /// 感知结果（只用于展示，不影响控制流）
    Perception {
        step: usize,
        intent: String,
        tool_hint: Option<String>,
    },
    /// 开始调用工具（占位记录已发布）
    ToolCall {
        step: usize,
        tool: String,
        args: String,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        step: usize,
        tool: String,
        preview: String,
    },
    /// 工具失败
    ToolFailure {
        step: usize,
        tool: String,
        reason: String,
    },
    /// 恢复引擎决定重试
    Retry {
        step: usize,
        tool: String,
        attempt: u32,
    },
    /// 最终回复
    FinalAnswer { text: String },
    /// 会话错误
    Error { text: String },
}

/// 广播信封：带上所属会话 ID
#[derive(Debug, Clone, Serialize)]
pub struct SessionEventEnvelope {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub event: SessionEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_flattens_tag() {
        let env = SessionEventEnvelope {
            session_id: "abc".into(),
            event: SessionEvent::ToolCall {
                step: 0,
                tool: "add".into(),
                args: "2,2".into(),
            },
        };
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["session_id"], "abc");
        assert_eq!(v["type"], "tool_call");
        assert_eq!(v["tool"], "add");
    }
}
