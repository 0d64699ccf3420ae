//! 会话注册表：session_id -> Session 的并发映射
//!
//! 每个会话只有一个写者（create 返回的 SessionHandle，不可 Clone），读者任意多；
//! 每次更新在单个写锁内完成，读者拿到的快照永远不会是半更新的 StepRecord。

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::state::{Session, SessionId, SessionStatus, SessionView, StepRecord, StepStatus};
use crate::react::{SessionEvent, SessionEventEnvelope};

/// 事件广播缓冲区大小
const EVENT_BUFFER: usize = 256;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

struct Entry {
    session: Arc<RwLock<Session>>,
    cancel: CancellationToken,
}

/// 会话注册表：编排器对外可观测性的唯一事实来源
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Entry>>,
    events: broadcast::Sender<SessionEventEnvelope>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// 分配新 token 并创建 Initializing 会话；返回唯一写句柄
    pub fn create(&self, query: &str, cancel: CancellationToken) -> SessionHandle {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(RwLock::new(Session::new(id.clone(), query)));
        write(&self.sessions).insert(
            id.clone(),
            Entry {
                session: Arc::clone(&session),
                cancel: cancel.clone(),
            },
        );
        tracing::debug!(session_id = %id, "session created");
        SessionHandle {
            id,
            session,
            cancel,
            events: self.events.clone(),
        }
    }

    /// 完整会话快照（含 query 与时间戳）
    pub fn get(&self, id: &str) -> Option<Session> {
        let sessions = read(&self.sessions);
        sessions.get(id).map(|e| read(&e.session).clone())
    }

    /// 轮询视图 `{status, steps, final_answer, error}`
    pub fn view(&self, id: &str) -> Option<SessionView> {
        let sessions = read(&self.sessions);
        sessions.get(id).map(|e| read(&e.session).view())
    }

    /// 请求取消会话；会话不存在时返回 false
    pub fn cancel(&self, id: &str) -> bool {
        match read(&self.sessions).get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// 回收已终止且超过 ttl 未更新的会话，返回回收数量
    pub fn gc(&self, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - ttl;
        let mut sessions = write(&self.sessions);
        let before = sessions.len();
        sessions.retain(|_, entry| {
            let s = read(&entry.session);
            !(s.is_terminal() && s.updated_at <= cutoff)
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        read(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 订阅全部会话的过程事件
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEventEnvelope> {
        self.events.subscribe()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 会话写句柄：只由拥有该会话的编排器持有
///
/// 到达终态后所有写操作变为 no-op；句柄在未终止时被丢弃（如任务 panic），会话被标记为 Error。
pub struct SessionHandle {
    id: SessionId,
    session: Arc<RwLock<Session>>,
    cancel: CancellationToken,
    events: broadcast::Sender<SessionEventEnvelope>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn status(&self) -> SessionStatus {
        read(&self.session).status
    }

    pub fn snapshot(&self) -> Session {
        read(&self.session).clone()
    }

    /// 发布过程事件（没有订阅者时静默丢弃）
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(SessionEventEnvelope {
            session_id: self.id.clone(),
            event,
        });
    }

    /// 在单个写锁内修改会话；终态后拒绝修改
    fn update(&self, f: impl FnOnce(&mut Session)) -> bool {
        let mut s = write(&self.session);
        if s.is_terminal() {
            tracing::warn!(session_id = %self.id, status = ?s.status, "ignoring write to terminal session");
            return false;
        }
        f(&mut s);
        s.updated_at = Utc::now();
        true
    }

    pub fn set_running(&self) {
        if self.update(|s| s.status = SessionStatus::Running) {
            self.emit(SessionEvent::StatusChanged {
                status: SessionStatus::Running,
            });
        }
    }

    /// 写入占位记录并返回其序号（序号即当前记录数，保证连续）
    pub fn begin_step(&self, tool: &str, args: &str) -> Option<usize> {
        let mut index = None;
        self.update(|s| {
            let i = s.steps.len();
            s.steps.insert(i, StepRecord::pending(tool, args));
            index = Some(i);
        });
        if let Some(step) = index {
            self.emit(SessionEvent::ToolCall {
                step,
                tool: tool.to_string(),
                args: args.to_string(),
            });
        }
        index
    }

    pub fn finish_step(&self, index: usize, result: &str) {
        self.settle_step(index, StepStatus::Finished, result);
    }

    pub fn fail_step(&self, index: usize, reason: &str) {
        self.settle_step(index, StepStatus::Error, reason);
    }

    fn settle_step(&self, index: usize, status: StepStatus, result: &str) {
        self.update(|s| {
            if let Some(rec) = s.steps.get_mut(&index) {
                rec.status = status;
                rec.result = result.to_string();
            }
        });
    }

    /// 进入 Completed 终态
    pub fn complete(&self, answer: &str) {
        if self.update(|s| {
            s.status = SessionStatus::Completed;
            s.final_answer = Some(answer.to_string());
        }) {
            self.emit(SessionEvent::FinalAnswer {
                text: answer.to_string(),
            });
            self.emit(SessionEvent::StatusChanged {
                status: SessionStatus::Completed,
            });
        }
    }

    /// 进入 Error 终态；仍在 Running 的步骤一并标记为 Error
    pub fn fail(&self, error: &str) {
        if self.update(|s| {
            for rec in s.steps.values_mut() {
                if rec.status == StepStatus::Running {
                    rec.status = StepStatus::Error;
                    rec.result = error.to_string();
                }
            }
            s.status = SessionStatus::Error;
            s.error = Some(error.to_string());
        }) {
            self.emit(SessionEvent::Error {
                text: error.to_string(),
            });
            self.emit(SessionEvent::StatusChanged {
                status: SessionStatus::Error,
            });
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.status().is_terminal() {
            tracing::error!(session_id = %self.id, "session handle dropped before a terminal state");
            self.fail("session aborted unexpectedly");
        }
    }
}
