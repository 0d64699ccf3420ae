//! 优雅关闭
//!
//! 监听 Ctrl+C / SIGTERM，触发后：取消所有会话（根 token），再在超时内依次执行清理任务，
//! 其中 ToolServerCleanup 终止外部工具进程，保证不留下子进程。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::SessionSupervisor;
use crate::tools::ToolServerManager;

/// 关闭原因
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(?reason, "shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 日志中的名字
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务，每个任务有独立超时
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) {
        tracing::info!(tasks = self.cleanup_tasks.len(), "running cleanup tasks");
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!(task = name, "cleanup completed"),
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "cleanup failed"),
                Err(_) => tracing::warn!(task = name, timeout = ?self.timeout, "cleanup timed out"),
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 取消所有仍在运行的会话
pub struct SessionCancelCleanup {
    supervisor: Arc<SessionSupervisor>,
}

impl SessionCancelCleanup {
    pub fn new(supervisor: Arc<SessionSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SessionCancelCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.supervisor.cancel_all();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Sessions"
    }
}

/// 终止外部工具进程
pub struct ToolServerCleanup {
    manager: ToolServerManager,
}

impl ToolServerCleanup {
    pub fn new(manager: ToolServerManager) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for ToolServerCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.manager.terminate().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ToolServer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_shutdown_manager_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
    }

    struct FlagCleanup(Arc<AtomicBool>);

    #[async_trait::async_trait]
    impl ShutdownCleanup for FlagCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Flag"
        }
    }

    struct HangingCleanup;

    #[async_trait::async_trait]
    impl ShutdownCleanup for HangingCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Hanging"
        }
    }

    #[tokio::test]
    async fn test_coordinator_survives_hanging_task() {
        let called = Arc::new(AtomicBool::new(false));
        let mut coordinator = ShutdownCoordinator::new().with_timeout(Duration::from_millis(20));
        coordinator.register(HangingCleanup);
        coordinator.register(FlagCleanup(called.clone()));
        coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_session_cancel_cleanup() {
        let supervisor = Arc::new(SessionSupervisor::new());
        let child = supervisor.child_token();
        SessionCancelCleanup::new(supervisor).cleanup().await.unwrap();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_tool_server_cleanup_without_process() {
        let manager = ToolServerManager::new(crate::tools::ServerParams::new("true", vec![]));
        ToolServerCleanup::new(manager.clone()).cleanup().await.unwrap();
        assert!(!manager.is_running().await);
    }
}
