//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, Message, Role};

use crate::config::{LlmProvider, LlmSection};

/// 按配置创建客户端
pub fn create_client(section: &LlmSection) -> Arc<dyn LlmClient> {
    match section.provider {
        LlmProvider::Mock => Arc::new(MockLlmClient::new()),
        LlmProvider::Openai => {
            tracing::info!(model = %section.model, base_url = ?section.base_url, "using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(
                section.base_url.as_deref(),
                &section.model,
                section.api_key.as_deref(),
            ))
        }
    }
}
