//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TASKPILOT__*` 覆盖（双下划线表示嵌套，如 `TASKPILOT__AGENT__MAX_STEPS=10`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub tool_server: ToolServerSection,
    pub llm: LlmSection,
    pub sessions: SessionsSection,
    pub web: WebSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [agent] 段：循环上限、检索条数、占位延迟、重试与并发
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 单会话最大步数（必须存在以保证终止）
    pub max_steps: usize,
    pub memory_top_k: usize,
    /// 写入 Running 占位与真正调用之间的延迟；0 表示不等待
    pub step_delay_ms: u64,
    /// 单步工具失败的重试次数（0 = 失败即终止会话）
    pub tool_retries: u32,
    pub max_concurrent_sessions: usize,
    pub system_prompt: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: 30,
            memory_top_k: 5,
            step_delay_ms: 500,
            tool_retries: 0,
            max_concurrent_sessions: 8,
            system_prompt: None,
        }
    }
}

impl AgentSection {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

/// [tool_server] 段：外部 MCP 工具进程
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolServerSection {
    /// 日志中使用的名字
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// 追加到继承环境之上的变量
    pub env: HashMap<String, String>,
    pub startup_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub grace_period_secs: u64,
    /// 最后一个会话结束后是否保留进程
    pub keep_alive: bool,
}

impl Default for ToolServerSection {
    fn default() -> Self {
        Self {
            name: "tools".to_string(),
            command: "python".to_string(),
            args: vec!["mcp-server.py".to_string()],
            cwd: None,
            env: HashMap::new(),
            startup_timeout_secs: 10,
            call_timeout_secs: 60,
            grace_period_secs: 5,
            keep_alive: false,
        }
    }
}

impl ToolServerSection {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// LLM 后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Openai,
    #[default]
    Mock,
}

/// [llm] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: LlmProvider,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Mock,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
        }
    }
}

/// [sessions] 段：终态会话保留时长与回收周期
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    pub ttl_secs: u64,
    pub gc_interval_secs: u64,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            gc_interval_secs: 300,
        }
    }
}

/// [web] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

/// 从 config 目录加载配置，环境变量 TASKPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TASKPILOT__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignored");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TASKPILOT")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 加载失败时记录警告并回退到默认值
pub fn load_or_default(config_path: Option<PathBuf>) -> AppConfig {
    match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_steps, 30);
        assert_eq!(cfg.agent.memory_top_k, 5);
        assert_eq!(cfg.agent.tool_retries, 0);
        assert_eq!(cfg.tool_server.grace_period_secs, 5);
        assert_eq!(cfg.sessions.ttl_secs, 3600);
        assert_eq!(cfg.web.port, 8000);
        assert_eq!(cfg.llm.provider, LlmProvider::Mock);
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[agent]
max_steps = 7
step_delay_ms = 0

[tool_server]
command = "node"
args = ["server.js", "--stdio"]
keep_alive = true

[tool_server.env]
tools_mode = "test"

[llm]
provider = "openai"
model = "deepseek-chat"
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.max_steps, 7);
        assert_eq!(cfg.agent.step_delay(), Duration::ZERO);
        // 未写出的键保持默认
        assert_eq!(cfg.agent.memory_top_k, 5);
        assert_eq!(cfg.tool_server.command, "node");
        assert_eq!(cfg.tool_server.args, vec!["server.js", "--stdio"]);
        assert!(cfg.tool_server.keep_alive);
        assert_eq!(cfg.tool_server.env.get("tools_mode").map(String::as_str), Some("test"));
        assert_eq!(cfg.llm.provider, LlmProvider::Openai);
        assert_eq!(cfg.llm.model, "deepseek-chat");
    }

    #[test]
    fn test_missing_file_falls_back() {
        let cfg = load_or_default(Some(PathBuf::from("/nonexistent/taskpilot.toml")));
        assert_eq!(cfg.agent.max_steps, 30);
    }
}
