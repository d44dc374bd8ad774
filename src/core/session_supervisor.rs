//! 会话监管：生命周期与取消
//!
//! 持有根 CancellationToken，用户中断时取消当前回合；子系统（调度器、子代理）使用 child_token，
//! 单任务取消不影响会话级令牌。

use tokio_util::sync::CancellationToken;

/// 会话级生命周期管理：根取消令牌与子令牌派发
#[derive(Debug)]
pub struct SessionSupervisor {
    /// 用户 Cancel / Ctrl+C 时触发
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消（用户中断）
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于单个回合或子代理，取消子任务不影响会话）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
