//! 工具执行器
//!
//! 持有一个已连接的 ToolChannel 与单次调用超时，execute(tool, args) 经 channel.invoke_within 调用，
//! 超时从通道实际开始处理本次调用时起算，转为 ToolExecution(Timeout)；每次调用输出结构化审计日志（JSON）。能力清单首次查询后缓存。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::OnceCell;

use crate::core::{AgentError, ToolFailureKind};
use crate::tools::{ToolCapability, ToolChannel, ToolResult};

/// 工具执行器：对每次调用施加超时并记录审计日志
pub struct ToolExecutor {
    channel: Arc<dyn ToolChannel>,
    timeout: Duration,
    capabilities: OnceCell<Vec<ToolCapability>>,
}

impl ToolExecutor {
    pub fn new(channel: Arc<dyn ToolChannel>, timeout: Duration) -> Self {
        Self {
            channel,
            timeout,
            capabilities: OnceCell::new(),
        }
    }

    /// 远端工具清单（仅在首次调用时向通道查询）
    pub async fn capabilities(&self) -> Result<&[ToolCapability], AgentError> {
        let caps = self
            .capabilities
            .get_or_try_init(|| async { self.channel.list_capabilities().await })
            .await?;
        Ok(caps.as_slice())
    }

    /// 供规划器使用的工具描述，每行一个
    pub async fn tool_descriptions(&self) -> Result<String, AgentError> {
        let caps = self.capabilities().await?;
        Ok(caps
            .iter()
            .map(|c| {
                let params = c
                    .input_schema
                    .get("properties")
                    .and_then(|p| p.as_object())
                    .map(|p| p.keys().cloned().collect::<Vec<_>>().join(", "))
                    .unwrap_or_default();
                format!("- {}({}): {}", c.name, params, c.description)
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// 执行指定工具；超时返回 Timeout 类失败，通道错误原样上抛
    pub async fn execute(&self, tool: &str, args: &str) -> Result<ToolResult, AgentError> {
        let start = Instant::now();
        let result = self.channel.invoke_within(tool, args, self.timeout).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(_) => (true, "ok"),
            Err(AgentError::ToolExecution {
                kind: ToolFailureKind::Timeout,
                ..
            }) => (false, "timeout"),
            Err(_) => (false, "error"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview(args, 200),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }

    /// 释放底层通道；幂等
    pub async fn close(&self) {
        self.channel.close().await;
    }
}

/// 按字符截断，超出部分以 ... 结尾
pub fn preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}
