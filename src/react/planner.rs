//! Planner：下一步动作规划与输出解码
//!
//! 规划器输出在边界处解码一次为 ToolInvocationPlan：`FINAL_ANSWER:` 前缀为终止指令，
//! 其余（`FUNCTION_CALL: name(args)` 或裸 `name(args)`）为工具调用。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::llm::{LlmClient, Message};
use crate::memory::Fact;
use crate::react::perception::PerceptionResult;

const FINAL_PREFIX: &str = "FINAL_ANSWER:";
const CALL_PREFIX: &str = "FUNCTION_CALL:";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a task-solving agent. Decide the single next action.\n\
Reply with exactly one line, either\n\
FUNCTION_CALL: tool_name(arg1, arg2, ...)\n\
or, once the task is solved,\n\
FINAL_ANSWER: <answer>";

/// 规划结果：终止指令或一次工具调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolInvocationPlan {
    Final(String),
    /// 调用表达式的文本形式，如 `add(2, 2)`
    Call { expression: String },
}

impl ToolInvocationPlan {
    pub fn call(expression: impl Into<String>) -> Self {
        ToolInvocationPlan::Call {
            expression: expression.into(),
        }
    }

    pub fn final_answer(answer: impl Into<String>) -> Self {
        ToolInvocationPlan::Final(answer.into())
    }
}

/// 工具名：第一个 `(` 之前的部分；没有 `(` 时整个文本即工具名
pub fn tool_name(expression: &str) -> &str {
    match expression.find('(') {
        Some(idx) => expression[..idx].trim(),
        None => expression.trim(),
    }
}

/// 参数表达式：第一个 `(` 与最后一个 `)` 之间的文本
pub fn arguments(expression: &str) -> &str {
    let Some(open) = expression.find('(') else {
        return "";
    };
    let rest = &expression[open + 1..];
    match rest.rfind(')') {
        Some(close) => rest[..close].trim(),
        None => rest.trim(),
    }
}

/// 解码规划器原始文本
pub fn parse_plan(output: &str) -> Result<ToolInvocationPlan, AgentError> {
    // 只看第一行非空内容；模型偶尔会在动作后附带解释
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| AgentError::Planner("empty planner output".to_string()))?;
    let line = line.trim_matches('`').trim();

    if let Some(answer) = line.strip_prefix(FINAL_PREFIX) {
        // 答案可能跨多行
        let answer = std::iter::once(answer.trim())
            .chain(output.trim().lines().skip(1).map(str::trim_end))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();
        if answer.is_empty() {
            return Err(AgentError::Planner(
                "final answer directive without an answer".to_string(),
            ));
        }
        return Ok(ToolInvocationPlan::final_answer(answer));
    }

    let expression = line.strip_prefix(CALL_PREFIX).unwrap_or(line).trim();
    if tool_name(expression).is_empty() {
        return Err(AgentError::Planner(format!(
            "no tool name in planner output: {}",
            line
        )));
    }
    Ok(ToolInvocationPlan::call(expression))
}

/// 规划器上下文：感知结果、检索到的事实、工具描述与当前上下文文本
pub struct PlanRequest<'a> {
    pub perception: &'a PerceptionResult,
    pub facts: &'a [Fact],
    pub tools: &'a str,
    pub context: &'a str,
}

/// 规划器接口
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: PlanRequest<'_>) -> Result<ToolInvocationPlan, AgentError>;
}

/// LLM 规划器：拼装 system + user 消息后调用 LLM，再解码
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn build_messages(&self, request: &PlanRequest<'_>) -> Vec<Message> {
        let system = format!("{}\n\nAvailable tools:\n{}", self.system_prompt, request.tools);

        let mut user = format!("Task: {}\n", request.context);
        user.push_str(&format!("Intent: {}\n", request.perception.intent));
        if let Some(hint) = &request.perception.tool_hint {
            user.push_str(&format!("Suggested tool: {}\n", hint));
        }
        if !request.facts.is_empty() {
            user.push_str("Relevant memory:\n");
            for f in request.facts {
                user.push_str(&format!("- {}\n", f.text));
            }
        }
        vec![Message::system(system), Message::user(user)]
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, request: PlanRequest<'_>) -> Result<ToolInvocationPlan, AgentError> {
        let messages = self.build_messages(&request);
        let output = self
            .llm
            .complete(&messages)
            .await
            .map_err(AgentError::Llm)?;
        tracing::debug!(output = %output, "planner output");
        parse_plan(&output)
    }
}
