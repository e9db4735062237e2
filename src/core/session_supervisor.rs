//! 会话监管：取消令牌与 Ctrl+C
//!
//! 持有 CancellationToken，用户 Ctrl+C 时取消当前会话；编排器在每个挂起点观察该令牌。

use tokio_util::sync::CancellationToken;

/// 会话级生命周期管理
#[derive(Debug, Clone, Default)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于单个任务，取消子 token 不影响会话）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 后台监听 Ctrl+C，收到后取消会话
    pub fn cancel_on_ctrl_c(&self) {
        let token = self.cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                r = tokio::signal::ctrl_c() => {
                    match r {
                        Ok(()) => {
                            tracing::warn!("Ctrl+C received, cancelling session");
                            token.cancel();
                        }
                        Err(e) => tracing::warn!(error = %e, "failed to listen for Ctrl+C"),
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_cancel_is_isolated() {
        let supervisor = SessionSupervisor::new();
        let child = supervisor.child_token();
        child.cancel();
        assert!(!supervisor.is_cancelled());

        let other = supervisor.child_token();
        supervisor.cancel();
        assert!(other.is_cancelled());
    }
}
