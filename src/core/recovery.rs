//! 错误恢复引擎
//!
//! 根据 AgentError 与已重试次数返回 RecoveryAction，供编排循环决定重试工具调用还是终止会话。
//! 默认不重试：任一工具失败即让会话进入 Error。

use crate::core::{AgentError, RecoveryAction, ToolFailureKind};

/// 有界重试策略：仅远端报错与超时可重试，通道断开与其它错误一律终止
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine {
    max_tool_retries: u32,
}

impl RecoveryEngine {
    pub fn new(max_tool_retries: u32) -> Self {
        Self { max_tool_retries }
    }

    /// retries_so_far：本步已经重试过的次数（首次失败时为 0）
    pub fn handle(&self, err: &AgentError, retries_so_far: u32) -> RecoveryAction {
        match err {
            AgentError::ToolExecution { kind, .. } => match kind {
                ToolFailureKind::Reported | ToolFailureKind::Timeout
                    if retries_so_far < self.max_tool_retries =>
                {
                    RecoveryAction::Retry {
                        attempt: retries_so_far + 1,
                    }
                }
                _ => RecoveryAction::Abort,
            },
            _ => RecoveryAction::Abort,
        }
    }
}
