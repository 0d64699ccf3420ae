//! 外部工具进程管理
//!
//! 任意时刻至多一个 MCP 服务端子进程：connect 先检查已有进程是否存活，存活则复用，否则重新拉起。
//! 每次 connect 返回一个 ChannelLease，close 幂等；最后一个租约释放且未配置 keep_alive 时终止进程。
//! 终止流程：关闭 stdin（优雅退出信号）-> 等待宽限期 -> 仍存活则强杀。

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::ToolServerSection;
use crate::core::{AgentError, ToolFailureKind};
use crate::tools::mcp::McpClient;
use crate::tools::{ToolCapability, ToolChannel, ToolConnector, ToolResult};

/// 启动进程后判断「立即退出」的观察窗口
const EXIT_PROBE: Duration = Duration::from_millis(200);

/// 启动参数：命令、参数、工作目录、附加环境变量（在继承的环境之上）
#[derive(Debug, Clone)]
pub struct ServerParams {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub startup_timeout: Duration,
    pub grace_period: Duration,
    pub keep_alive: bool,
}

impl ServerParams {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: "tools".to_string(),
            command: command.into(),
            args,
            cwd: None,
            env: HashMap::new(),
            startup_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(5),
            keep_alive: false,
        }
    }

    pub fn from_config(section: &ToolServerSection) -> Self {
        Self {
            name: section.name.clone(),
            command: section.command.clone(),
            args: section.args.clone(),
            cwd: section.cwd.clone(),
            env: section.env.clone(),
            startup_timeout: Duration::from_secs(section.startup_timeout_secs),
            grace_period: Duration::from_secs(section.grace_period_secs),
            keep_alive: section.keep_alive,
        }
    }

    fn display(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

struct RunningServer {
    child: Child,
    client: Arc<McpClient>,
}

#[derive(Default)]
struct ServerState {
    running: Option<RunningServer>,
    leases: usize,
}

struct ManagerInner {
    params: ServerParams,
    state: Mutex<ServerState>,
    spawned: AtomicUsize,
}

/// 工具通道管理器（可 Clone，共享同一状态）
#[derive(Clone)]
pub struct ToolServerManager {
    inner: Arc<ManagerInner>,
}

impl ToolServerManager {
    pub fn new(params: ServerParams) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                params,
                state: Mutex::new(ServerState::default()),
                spawned: AtomicUsize::new(0),
            }),
        }
    }

    /// 建立（或复用）通道并返回一个租约
    pub async fn connect_lease(&self) -> Result<ChannelLease, AgentError> {
        let mut state = self.inner.state.lock().await;

        let alive = match state.running.as_mut() {
            Some(running) => {
                matches!(running.child.try_wait(), Ok(None)) && !running.client.is_disconnected()
            }
            None => false,
        };
        if !alive {
            if let Some(dead) = state.running.take() {
                tracing::warn!(server = %self.inner.params.name, "tool server no longer alive, respawning");
                Self::stop(dead, self.inner.params.grace_period).await;
            }
            state.running = Some(self.spawn().await?);
        }

        let client = match state.running.as_ref() {
            Some(running) => Arc::clone(&running.client),
            None => {
                return Err(AgentError::ChannelUnavailable(
                    "tool server state lost".to_string(),
                ))
            }
        };
        state.leases += 1;
        tracing::debug!(server = %self.inner.params.name, leases = state.leases, "tool channel leased");
        Ok(ChannelLease {
            client,
            manager: self.clone(),
            released: AtomicBool::new(false),
        })
    }

    async fn spawn(&self) -> Result<RunningServer, AgentError> {
        let p = &self.inner.params;
        let mut cmd = Command::new(&p.command);
        cmd.args(&p.args)
            .envs(&p.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &p.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::ChannelUnavailable(format!("failed to spawn '{}': {}", p.display(), e))
        })?;
        self.inner.spawned.fetch_add(1, Ordering::SeqCst);
        tracing::info!(server = %p.name, pid = ?child.id(), command = %p.display(), "tool server started");

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(i), Some(o)) => (i, o),
            _ => {
                let _ = child.kill().await;
                return Err(AgentError::ChannelUnavailable(format!(
                    "'{}': stdio not captured",
                    p.display()
                )));
            }
        };

        match McpClient::connect(&p.name, stdout, stdin, p.startup_timeout).await {
            Ok(client) => Ok(RunningServer {
                child,
                client: Arc::new(client),
            }),
            Err(e) => {
                let exited = tokio::time::timeout(EXIT_PROBE, child.wait()).await;
                let _ = child.kill().await;
                match exited {
                    Ok(Ok(status)) => Err(AgentError::ChannelUnavailable(format!(
                        "'{}' exited immediately ({})",
                        p.display(),
                        status
                    ))),
                    _ => Err(e),
                }
            }
        }
    }

    /// 关闭 stdin，宽限期内等待退出，超时强杀
    async fn stop(mut running: RunningServer, grace: Duration) {
        running.client.shutdown().await;
        match tokio::time::timeout(grace, running.child.wait()).await {
            Ok(Ok(status)) => tracing::info!(%status, "tool server stopped"),
            Ok(Err(e)) => tracing::warn!(error = %e, "waiting for tool server failed"),
            Err(_) => {
                tracing::warn!(grace = ?grace, "tool server ignored stop request, killing");
                if let Err(e) = running.child.kill().await {
                    tracing::warn!(error = %e, "failed to kill tool server");
                }
            }
        }
    }

    /// 终止外部进程；幂等，没有进程时直接返回
    pub async fn terminate(&self) {
        let running = self.inner.state.lock().await.running.take();
        if let Some(running) = running {
            Self::stop(running, self.inner.params.grace_period).await;
        }
    }

    async fn release(&self) {
        let mut state = self.inner.state.lock().await;
        state.leases = state.leases.saturating_sub(1);
        tracing::debug!(server = %self.inner.params.name, leases = state.leases, "tool channel released");
        if state.leases == 0 && !self.inner.params.keep_alive {
            if let Some(running) = state.running.take() {
                Self::stop(running, self.inner.params.grace_period).await;
            }
        }
    }

    /// 进程是否存活
    pub async fn is_running(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.running.as_mut() {
            Some(r) => matches!(r.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// 当前进程的 pid
    pub async fn pid(&self) -> Option<u32> {
        self.inner
            .state
            .lock()
            .await
            .running
            .as_ref()
            .and_then(|r| r.child.id())
    }

    /// 累计拉起过的进程数
    pub fn spawn_count(&self) -> usize {
        self.inner.spawned.load(Ordering::SeqCst)
    }

    pub async fn active_leases(&self) -> usize {
        self.inner.state.lock().await.leases
    }
}

#[async_trait]
impl ToolConnector for ToolServerManager {
    async fn connect(&self) -> Result<Arc<dyn ToolChannel>, AgentError> {
        Ok(Arc::new(self.connect_lease().await?))
    }
}

/// 一个会话对共享通道的使用权
pub struct ChannelLease {
    client: Arc<McpClient>,
    manager: ToolServerManager,
    released: AtomicBool,
}

impl ChannelLease {
    fn ensure_open(&self, tool: &str, args: &str) -> Result<(), AgentError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(AgentError::tool(
                tool,
                args,
                ToolFailureKind::Disconnected,
                "channel already closed",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ToolChannel for ChannelLease {
    async fn list_capabilities(&self) -> Result<Vec<ToolCapability>, AgentError> {
        Ok(self.client.tools())
    }

    async fn invoke(&self, tool: &str, args: &str) -> Result<ToolResult, AgentError> {
        self.ensure_open(tool, args)?;
        self.client.invoke(tool, args).await
    }

    async fn invoke_within(
        &self,
        tool: &str,
        args: &str,
        limit: Duration,
    ) -> Result<ToolResult, AgentError> {
        self.ensure_open(tool, args)?;
        self.client.invoke_within(tool, args, limit).await
    }

    async fn close(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.manager.release().await;
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let manager = self.manager.clone();
                handle.spawn(async move { manager.release().await });
            }
        }
    }
}
