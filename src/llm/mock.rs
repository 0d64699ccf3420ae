//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 按脚本依次返回预置回复；脚本耗尽后把最后一条 User 消息的首行（去掉 `Task:` 前缀）作为最终答案返回。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// Mock 客户端：脚本化回复
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(responses.into_iter().map(Into::into).collect()),
        }
    }

    /// 剩余未消费的脚本条数
    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let scripted = self
            .script
            .lock()
            .map_err(|_| "mock script poisoned".to_string())?
            .pop_front();
        if let Some(reply) = scripted {
            return Ok(reply);
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.content.lines().next())
            .map(|l| l.strip_prefix("Task:").unwrap_or(l).trim())
            .unwrap_or("(no input)");
        Ok(format!("FINAL_ANSWER: {}", last_user))
    }
}
