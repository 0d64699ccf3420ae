//! 单会话主循环
//!
//! Perceive -> Retrieve -> Plan -> Act，逐步严格串行；上限 max_steps 保证终止。
//! 每步在调用工具前先发布 Running 占位记录（轮询方可见），延迟 step_delay 后再真正调用。
//! 返回 Ok(最终回复) 或 Err(导致会话失败的错误)；终态由编排器写入。

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::state::STEP_LIMIT_ANSWER;
use crate::core::{AgentError, RecoveryAction, RecoveryEngine, SessionHandle};
use crate::memory::MemoryStore;
use crate::react::facts::{tool_call_fact, KeyResults};
use crate::react::perception::Perception;
use crate::react::planner::{arguments, tool_name, PlanRequest, Planner, ToolInvocationPlan};
use crate::react::SessionEvent;
use crate::tools::executor::preview;
use crate::tools::ToolExecutor;

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 循环参数
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_steps: usize,
    pub memory_top_k: usize,
    pub step_delay: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_steps: 30,
            memory_top_k: 5,
            step_delay: Duration::from_millis(500),
        }
    }
}

/// 一次会话运行所需的协作者
pub struct StepLoop<'a> {
    pub handle: &'a SessionHandle,
    pub executor: &'a ToolExecutor,
    pub perception: &'a dyn Perception,
    pub planner: &'a dyn Planner,
    pub memory: &'a dyn MemoryStore,
    pub recovery: &'a RecoveryEngine,
    pub settings: &'a LoopSettings,
    pub cancel: CancellationToken,
}

impl<'a> StepLoop<'a> {
    pub async fn run(&self, query: &str) -> Result<String, AgentError> {
        let session_id = self.handle.id();
        let tools = self.executor.tool_descriptions().await?;
        let tool_names: Vec<String> = self
            .executor
            .capabilities()
            .await?
            .iter()
            .map(|c| c.name.clone())
            .collect();

        let mut key_results = KeyResults::new();

        for iteration in 0..self.settings.max_steps {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            self.handle.emit(SessionEvent::StepUpdate {
                step: iteration,
                max_steps: self.settings.max_steps,
            });

            let context = key_results.context(query);

            let perception = self.perception.perceive(&context, &tool_names).await?;
            tracing::debug!(session_id, iteration, intent = %perception.intent, hint = ?perception.tool_hint, "perceived");
            self.handle.emit(SessionEvent::Perception {
                step: iteration,
                intent: perception.intent.clone(),
                tool_hint: perception.tool_hint.clone(),
            });

            let facts = self
                .memory
                .retrieve(&context, self.settings.memory_top_k, Some(session_id))?;

            let plan = self
                .planner
                .plan(PlanRequest {
                    perception: &perception,
                    facts: &facts,
                    tools: &tools,
                    context: &context,
                })
                .await?;

            let expression = match plan {
                ToolInvocationPlan::Final(answer) => {
                    tracing::info!(session_id, iteration, "final answer reached");
                    return Ok(answer);
                }
                ToolInvocationPlan::Call { expression } => expression,
            };

            let tool = tool_name(&expression).to_string();
            let args = arguments(&expression).to_string();
            let Some(step) = self.handle.begin_step(&tool, &args) else {
                // 会话已被外部置为终态
                return Err(AgentError::Cancelled);
            };
            tracing::info!(session_id, step, tool = %tool, args = %args, "tool step started");

            if !self.settings.step_delay.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.handle.fail_step(step, "cancelled");
                        return Err(AgentError::Cancelled);
                    }
                    _ = tokio::time::sleep(self.settings.step_delay) => {}
                }
            }

            let result = match self.invoke_with_recovery(step, &tool, &args).await {
                Ok(r) => r,
                Err(e) => {
                    self.handle.fail_step(step, &e.to_string());
                    self.handle.emit(SessionEvent::ToolFailure {
                        step,
                        tool: tool.clone(),
                        reason: e.to_string(),
                    });
                    tracing::warn!(session_id, step, tool = %tool, error = %e, "tool step failed");
                    return Err(e);
                }
            };

            let text = result.text();
            self.handle.finish_step(step, &text);
            self.handle.emit(SessionEvent::Observation {
                step,
                tool: tool.clone(),
                preview: preview(&text, OBSERVATION_PREVIEW_CHARS),
            });

            self.memory
                .add(tool_call_fact(&expression, &tool, &text, query, session_id))?;
            key_results.record(step, &tool, &text);
        }

        tracing::warn!(session_id, max_steps = self.settings.max_steps, "step budget exhausted");
        Ok(STEP_LIMIT_ANSWER.to_string())
    }

    /// 调用工具；失败时交给 RecoveryEngine 决定是否在同一步内重试。调用与取消竞争
    async fn invoke_with_recovery(
        &self,
        step: usize,
        tool: &str,
        args: &str,
    ) -> Result<crate::tools::ToolResult, AgentError> {
        let mut retries = 0u32;
        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
                r = self.executor.execute(tool, args) => r,
            };
            let err = match outcome {
                Ok(r) => return Ok(r),
                Err(e) => e,
            };
            match self.recovery.handle(&err, retries) {
                RecoveryAction::Retry { attempt } => {
                    tracing::warn!(session_id = self.handle.id(), step, tool, attempt, error = %err, "retrying tool call");
                    self.handle.emit(SessionEvent::Retry {
                        step,
                        tool: tool.to_string(),
                        attempt,
                    });
                    retries += 1;
                }
                RecoveryAction::Abort => return Err(err),
            }
        }
    }
}
