//! 工具通道抽象
//!
//! ToolConnector 负责建立通道（启动或复用外部工具进程），ToolChannel 负责列出能力、单次调用与释放。
//! 编排器只依赖这两个 trait，测试可用进程内实现替换 MCP 子进程。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::{AgentError, ToolFailureKind};

/// 远端声明的一个工具
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCapability {
    pub name: String,
    pub description: String,
    /// 参数 JSON Schema（用于把参数表达式绑定为具名参数）
    pub input_schema: Value,
}

impl ToolCapability {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// 单次工具调用结果：raw 结构不定（字符串 / 列表 / 对象）
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool: String,
    pub args: String,
    pub raw: Value,
}

impl ToolResult {
    pub fn new(tool: impl Into<String>, args: impl Into<String>, raw: Value) -> Self {
        Self {
            tool: tool.into(),
            args: args.into(),
            raw,
        }
    }

    /// 字符串化结果：字符串原样返回，其它值序列化为紧凑 JSON
    pub fn text(&self) -> String {
        match &self.raw {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// 已连接的双工通道；同一通道上的调用由实现串行化
#[async_trait]
pub trait ToolChannel: Send + Sync {
    /// 列出远端工具（连接后调用一次并缓存）
    async fn list_capabilities(&self) -> Result<Vec<ToolCapability>, AgentError>;

    /// 发起一次工具调用并等待结果
    async fn invoke(&self, tool: &str, args: &str) -> Result<ToolResult, AgentError>;

    /// 限时调用：limit 从本次调用占用通道后开始计算，排队等待不计入
    async fn invoke_within(
        &self,
        tool: &str,
        args: &str,
        limit: Duration,
    ) -> Result<ToolResult, AgentError> {
        match tokio::time::timeout(limit, self.invoke(tool, args)).await {
            Ok(r) => r,
            Err(_) => Err(timeout_error(tool, args, limit)),
        }
    }

    /// 释放通道；幂等
    async fn close(&self);
}

/// 调用超时对应的错误
pub fn timeout_error(tool: &str, args: &str, limit: Duration) -> AgentError {
    AgentError::tool(
        tool,
        args,
        ToolFailureKind::Timeout,
        format!("no response within {:?}", limit),
    )
}

/// 通道工厂
#[async_trait]
pub trait ToolConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ToolChannel>, AgentError>;
}
