//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 与已尝试次数决定 Retry / Abort。

use thiserror::Error;

/// 工具调用失败的细分原因（决定是否可重试）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFailureKind {
    /// 远端明确返回错误（isError / JSON-RPC error）
    Reported,
    /// 在超时时间内未返回
    Timeout,
    /// 通道在调用过程中断开
    Disconnected,
}

impl std::fmt::Display for ToolFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolFailureKind::Reported => "reported",
            ToolFailureKind::Timeout => "timeout",
            ToolFailureKind::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// 编排过程中可能出现的错误（通道、协议、工具、规划、存储等）
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// 外部工具进程无法启动或启动后立即退出
    #[error("Tool channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// 握手 / tools/list 响应格式错误
    #[error("Tool channel protocol error: {0}")]
    ChannelProtocol(String),

    #[error("Tool execution failed: {tool}({args}): {reason}")]
    ToolExecution {
        tool: String,
        args: String,
        kind: ToolFailureKind,
        reason: String,
    },

    #[error("Perception error: {0}")]
    Perception(String),

    #[error("Planner error: {0}")]
    Planner(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Memory storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("cancelled")]
    Cancelled,

    /// 循环内未预期的故障（含 panic），在编排器边界统一转换
    #[error("Unexpected failure: {0}")]
    Internal(String),
}

impl AgentError {
    /// 构造工具调用错误（携带工具名与参数表达式）
    pub fn tool(
        tool: impl Into<String>,
        args: impl Into<String>,
        kind: ToolFailureKind,
        reason: impl Into<String>,
    ) -> Self {
        AgentError::ToolExecution {
            tool: tool.into(),
            args: args.into(),
            kind,
            reason: reason.into(),
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 重新发起同一次工具调用（attempt 从 1 开始计数）
    Retry { attempt: u32 },
    /// 终止当前会话
    Abort,
}
