//! 感知：把上下文文本转为结构化意图
//!
//! KeywordPerception 不依赖 LLM；LlmPerception 让模型输出 {"intent", "tool_hint"} JSON，解析失败时回退到关键词感知。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::llm::{LlmClient, Message};

/// 感知结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerceptionResult {
    pub intent: String,
    #[serde(default)]
    pub tool_hint: Option<String>,
}

impl PerceptionResult {
    pub fn new(intent: impl Into<String>, tool_hint: Option<String>) -> Self {
        Self {
            intent: intent.into(),
            tool_hint,
        }
    }
}

/// 感知接口；对编排器而言是无副作用的纯函数，重试安全
#[async_trait]
pub trait Perception: Send + Sync {
    async fn perceive(&self, context: &str, tools: &[String]) -> Result<PerceptionResult, AgentError>;
}

/// 关键词感知：首句为意图，上下文中第一个出现的已知工具名为提示
#[derive(Debug, Default, Clone)]
pub struct KeywordPerception;

impl KeywordPerception {
    pub fn extract(context: &str, tools: &[String]) -> PerceptionResult {
        let first_line = context.lines().next().unwrap_or("").trim();
        let intent = first_line
            .split_inclusive(['.', '?', '!', '。', '？', '！'])
            .next()
            .unwrap_or(first_line)
            .trim()
            .to_string();

        let lower = context.to_lowercase();
        let tool_hint = tools
            .iter()
            .filter_map(|t| lower.find(&t.to_lowercase()).map(|pos| (pos, t)))
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, t)| t.clone());

        PerceptionResult { intent, tool_hint }
    }
}

#[async_trait]
impl Perception for KeywordPerception {
    async fn perceive(&self, context: &str, tools: &[String]) -> Result<PerceptionResult, AgentError> {
        Ok(Self::extract(context, tools))
    }
}

/// LLM 感知
pub struct LlmPerception {
    llm: Arc<dyn LlmClient>,
}

impl LlmPerception {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

/// 从模型输出中截取 JSON 对象（兼容 ```json 代码块）
fn parse_perception(output: &str) -> Option<PerceptionResult> {
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end < start {
        return None;
    }
    let parsed: PerceptionResult = serde_json::from_str(&output[start..=end]).ok()?;
    if parsed.intent.trim().is_empty() {
        return None;
    }
    Some(parsed)
}

#[async_trait]
impl Perception for LlmPerception {
    async fn perceive(&self, context: &str, tools: &[String]) -> Result<PerceptionResult, AgentError> {
        let system = format!(
            "Extract the user's intent. Reply with JSON only: {{\"intent\": string, \"tool_hint\": string or null}}. Known tools: {}",
            tools.join(", ")
        );
        let output = self
            .llm
            .complete(&[Message::system(system), Message::user(context)])
            .await
            .map_err(AgentError::Perception)?;

        Ok(parse_perception(&output).unwrap_or_else(|| {
            tracing::warn!(output = %output, "malformed perception output, falling back to keywords");
            KeywordPerception::extract(context, tools)
        }))
    }
}
