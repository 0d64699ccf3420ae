//! taskpilot HTTP 服务
//!
//! 启动: cargo run --bin taskpilot-web --features web
//! 端口取 TASKPILOT_WEB_PORT 或配置 [web].port；定时回收过期会话；收到 Ctrl+C / SIGTERM 后取消会话并终止工具进程。

#![cfg(feature = "web")]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use taskpilot::core::{
    create_agent_builder, SessionCancelCleanup, ShutdownCoordinator, ShutdownManager,
    ToolServerCleanup,
};
use taskpilot::web::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskpilot::observability::init();

    let components = create_agent_builder(None).build();
    let cfg = components.config.clone();
    let orchestrator = components.orchestrator.clone();

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    // 过期会话回收
    {
        let registry = Arc::clone(orchestrator.registry());
        let ttl = Duration::from_secs(cfg.sessions.ttl_secs);
        let interval = Duration::from_secs(cfg.sessions.gc_interval_secs.max(1));
        let token = shutdown.token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.gc(ttl);
                        if removed > 0 {
                            tracing::info!(removed, remaining = registry.len(), "expired sessions collected");
                        }
                    }
                }
            }
        });
    }

    let app = router(AppState {
        orchestrator: orchestrator.clone(),
    });

    let port = std::env::var("TASKPILOT_WEB_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(cfg.web.port);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("taskpilot API: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    let wait = Arc::clone(&shutdown);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { wait.wait_for_shutdown().await })
        .await?;

    let mut coordinator = ShutdownCoordinator::new()
        .with_timeout(Duration::from_secs(cfg.tool_server.grace_period_secs + 5));
    coordinator.register(SessionCancelCleanup::new(Arc::clone(orchestrator.supervisor())));
    if let Some(server) = components.tool_server {
        coordinator.register(ToolServerCleanup::new(server));
    }
    coordinator.run_cleanup().await;

    Ok(())
}
