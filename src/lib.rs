//! taskpilot - 任务编排智能体
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话状态与注册表、编排器、错误与恢复、会话监管、准入调度、优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 会话内事实存储与检索
//! - **react**: 感知、规划、关键结果累积与单会话主循环
//! - **tools**: 工具通道抽象、MCP 客户端、外部进程管理与执行器
//! - **scheme**: 建筑方案抽取（边界适配器）
//! - **web**: HTTP 接口（feature = "web"）

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod scheme;
pub mod tools;
#[cfg(feature = "web")]
pub mod web;
