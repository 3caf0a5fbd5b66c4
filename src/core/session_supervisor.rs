//! 会话监管：生命周期、中断管理
//!
//! 根 token 对应整个操作员进程（关闭时取消）；每个语音会话持有其子 token，插话时只取消当前会话。

use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct SessionSupervisor {
    root: CancellationToken,
    current: Mutex<Option<CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为新会话创建子 token 并记为当前会话
    pub fn begin_session(&self) -> CancellationToken {
        let token = self.root.child_token();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        token
    }

    /// 会话结束后清除
    pub fn end_session(&self) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// 取消当前会话（插话）；返回是否有会话被取消
    pub fn cancel_current(&self) -> bool {
        match self.current.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(t) if !t.is_cancelled() => {
                t.cancel();
                true
            }
            _ => false,
        }
    }

    /// 进程关闭：取消根 token（连带所有会话）
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }
}
