//! 编排器构建器：CLI 与 Web 共用同一套初始化逻辑
//!
//! 从 AppConfig 创建 LLM、感知、规划器、记忆、工具进程管理器与编排器；测试可替换连接器与 LLM。

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{AppConfig, LlmProvider};
use crate::core::{Orchestrator, OrchestratorParts, RecoveryEngine, SessionRegistry, SessionSupervisor};
use crate::llm::{create_client, LlmClient};
use crate::memory::{InMemoryFactStore, MemoryStore};
use crate::react::{KeywordPerception, LlmPerception, LlmPlanner, LoopSettings, Perception};
use crate::tools::{ServerParams, ToolConnector, ToolServerManager};

/// 构建器
pub struct AgentBuilder {
    config: AppConfig,
    system_prompt: Option<String>,
    llm: Option<Arc<dyn LlmClient>>,
    connector: Option<Arc<dyn ToolConnector>>,
    memory: Option<Arc<dyn MemoryStore>>,
}

/// 构建产物
pub struct AgentComponents {
    pub orchestrator: Orchestrator,
    /// 使用默认连接器时的进程管理器（关闭时需要 terminate）
    pub tool_server: Option<ToolServerManager>,
    pub llm: Arc<dyn LlmClient>,
    pub config: AppConfig,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            system_prompt: None,
            llm: None,
            connector: None,
            memory: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = Some(prompt.to_string());
        self
    }

    /// 从 config/prompts/planner.md 读取规划器提示词（不存在时用配置或内置默认值）
    pub fn with_system_prompt_from_file(mut self) -> Self {
        if let Some(p) = ["config/prompts/planner.md", "../config/prompts/planner.md"]
            .into_iter()
            .find_map(|p| std::fs::read_to_string(p).ok())
        {
            self.system_prompt = Some(p);
        }
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn ToolConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn build(self) -> AgentComponents {
        let cfg = self.config;
        let llm = self.llm.unwrap_or_else(|| create_client(&cfg.llm));

        let perception: Arc<dyn Perception> = match cfg.llm.provider {
            LlmProvider::Openai => Arc::new(LlmPerception::new(Arc::clone(&llm))),
            LlmProvider::Mock => Arc::new(KeywordPerception),
        };

        let mut planner = LlmPlanner::new(Arc::clone(&llm));
        if let Some(p) = self.system_prompt.or_else(|| cfg.agent.system_prompt.clone()) {
            planner = planner.with_system_prompt(p);
        }

        let (connector, tool_server): (Arc<dyn ToolConnector>, Option<ToolServerManager>) =
            match self.connector {
                Some(c) => (c, None),
                None => {
                    let manager = ToolServerManager::new(ServerParams::from_config(&cfg.tool_server));
                    (Arc::new(manager.clone()), Some(manager))
                }
            };

        let orchestrator = Orchestrator::new(OrchestratorParts {
            registry: Arc::new(SessionRegistry::new()),
            connector,
            perception,
            planner: Arc::new(planner),
            memory: self
                .memory
                .unwrap_or_else(|| Arc::new(InMemoryFactStore::default())),
            recovery: RecoveryEngine::new(cfg.agent.tool_retries),
            settings: LoopSettings {
                max_steps: cfg.agent.max_steps,
                memory_top_k: cfg.agent.memory_top_k,
                step_delay: cfg.agent.step_delay(),
            },
            call_timeout: cfg.tool_server.call_timeout(),
            supervisor: Arc::new(SessionSupervisor::new()),
            max_concurrent_sessions: cfg.agent.max_concurrent_sessions,
        });

        AgentComponents {
            orchestrator,
            tool_server,
            llm,
            config: cfg,
        }
    }
}

/// 便捷函数：加载配置并创建构建器
pub fn create_agent_builder(config_path: Option<PathBuf>) -> AgentBuilder {
    AgentBuilder::new(crate::config::load_or_default(config_path)).with_system_prompt_from_file()
}
