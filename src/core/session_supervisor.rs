//! 会话监管：取消令牌树
//!
//! 持有根 CancellationToken；每个会话拿一个子 token，单独取消某个会话不影响其它会话，
//! 关闭服务时取消根 token 即取消全部会话。

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct SessionSupervisor {
    root: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为新会话创建子 token
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// 取消全部会话（关闭服务时）
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }
}
