//! 任务调度：会话准入
//!
//! Semaphore 限制同时运行的会话数；排队中的会话保持 Initializing，直到拿到许可。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

pub struct TaskScheduler {
    sessions: Arc<Semaphore>,
    capacity: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        let capacity = max_concurrent_sessions.max(1);
        Self {
            sessions: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// 等待会话运行许可；等待期间被取消则返回 Cancelled
    pub async fn admit(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, AgentError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            permit = Arc::clone(&self.sessions).acquire_owned() => {
                permit.map_err(|_| AgentError::Internal("session scheduler closed".to_string()))
            }
        }
    }

    /// 当前正在运行的会话数
    pub fn running(&self) -> usize {
        self.capacity - self.sessions.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(8)
    }
}
