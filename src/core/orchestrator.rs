//! 任务编排器
//!
//! submit(query) 创建 Initializing 会话并立即返回 token，后台任务依次：等待准入 -> 连接工具通道 -> Running ->
//! 主循环 -> 关闭通道 -> 写入终态。任何路径（含 panic）都会关闭通道，会话不会停留在 Running。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::core::state::{Session, SessionId};
use crate::core::{
    AgentError, RecoveryEngine, SessionHandle, SessionRegistry, SessionSupervisor, TaskScheduler,
};
use crate::memory::MemoryStore;
use crate::react::{LoopSettings, Perception, Planner, StepLoop};
use crate::tools::{ToolConnector, ToolExecutor};

struct Inner {
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn ToolConnector>,
    perception: Arc<dyn Perception>,
    planner: Arc<dyn Planner>,
    memory: Arc<dyn MemoryStore>,
    recovery: RecoveryEngine,
    settings: LoopSettings,
    call_timeout: Duration,
    supervisor: Arc<SessionSupervisor>,
    scheduler: TaskScheduler,
}

/// 编排器（可 Clone，共享协作者）
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// 已调度的会话：token 与后台任务句柄
pub struct SessionTask {
    pub id: SessionId,
    pub join: JoinHandle<()>,
}

/// 编排器的协作者与参数
pub struct OrchestratorParts {
    pub registry: Arc<SessionRegistry>,
    pub connector: Arc<dyn ToolConnector>,
    pub perception: Arc<dyn Perception>,
    pub planner: Arc<dyn Planner>,
    pub memory: Arc<dyn MemoryStore>,
    pub recovery: RecoveryEngine,
    pub settings: LoopSettings,
    pub call_timeout: Duration,
    pub supervisor: Arc<SessionSupervisor>,
    pub max_concurrent_sessions: usize,
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: parts.registry,
                connector: parts.connector,
                perception: parts.perception,
                planner: parts.planner,
                memory: parts.memory,
                recovery: parts.recovery,
                settings: parts.settings,
                call_timeout: parts.call_timeout,
                supervisor: parts.supervisor,
                scheduler: TaskScheduler::new(parts.max_concurrent_sessions),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.inner.supervisor
    }

    /// 创建会话并调度后台运行，立即返回
    pub fn start(&self, query: &str) -> SessionTask {
        let handle = self
            .inner
            .registry
            .create(query, self.inner.supervisor.child_token());
        let id = handle.id().to_string();
        tracing::info!(session_id = %id, query, "session submitted");

        let inner = Arc::clone(&self.inner);
        let query = query.to_string();
        let span = tracing::info_span!("session", session_id = %id);
        let join = tokio::spawn(async move { run_session(inner, handle, query).await }.instrument(span));
        SessionTask { id, join }
    }

    /// 提交查询（fire-and-forget），返回会话 token
    pub fn submit(&self, query: &str) -> SessionId {
        self.start(query).id
    }

    /// 提交并等待会话结束，返回终态快照
    pub async fn run(&self, query: &str) -> Result<Session, AgentError> {
        let task = self.start(query);
        if let Err(e) = task.join.await {
            tracing::error!(session_id = %task.id, error = %e, "session task aborted");
        }
        self.inner
            .registry
            .get(&task.id)
            .ok_or(AgentError::SessionNotFound(task.id))
    }

    /// 取消会话；会话不存在时返回 false
    pub fn cancel(&self, id: &str) -> bool {
        self.inner.registry.cancel(id)
    }
}

async fn run_session(inner: Arc<Inner>, handle: SessionHandle, query: String) {
    let cancel = handle.cancel_token();

    let _permit = match inner.scheduler.admit(&cancel).await {
        Ok(p) => p,
        Err(e) => {
            handle.fail(&e.to_string());
            return;
        }
    };
    tracing::debug!(
        running = inner.scheduler.running(),
        capacity = inner.scheduler.capacity(),
        "session admitted"
    );

    let connected = tokio::select! {
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        c = inner.connector.connect() => c,
    };
    let channel = match connected {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "tool channel unavailable");
            handle.fail(&e.to_string());
            return;
        }
    };

    handle.set_running();
    let executor = ToolExecutor::new(channel, inner.call_timeout);
    let step_loop = StepLoop {
        handle: &handle,
        executor: &executor,
        perception: &*inner.perception,
        planner: &*inner.planner,
        memory: &*inner.memory,
        recovery: &inner.recovery,
        settings: &inner.settings,
        cancel,
    };
    let outcome = AssertUnwindSafe(step_loop.run(&query)).catch_unwind().await;

    executor.close().await;

    match outcome {
        Ok(Ok(answer)) => {
            tracing::info!("session completed");
            handle.complete(&answer);
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "session failed");
            handle.fail(&e.to_string());
        }
        Err(panic) => {
            let err = AgentError::Internal(panic_message(panic.as_ref()));
            tracing::error!(error = %err, "session loop panicked");
            handle.fail(&err.to_string());
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in session loop".to_string()
    }
}
