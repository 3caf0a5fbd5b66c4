//! 优雅关闭
//!
//! 统一的关闭信号监听和清理逻辑：
//! - 操作员进程：停止接收唤醒，取消当前会话，等待记忆进程退出
//! - 记忆进程：停止读取请求，等待后台传播完成，保存记忆快照

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::process::Child;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::memory::MemoryController;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C 或输入结束
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 对端进程退出
    PeerExited,
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(4);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 触发关闭（重复调用只有第一次的原因会被广播）
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.shutdown_token.is_cancelled() {
            return;
        }
        tracing::info!(?reason, "Shutdown requested");
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

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理任务，每个任务有统一超时
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行所有清理任务；返回成功完成的数量
    pub async fn run_cleanup(&self) -> usize {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());
        let mut ok = 0;
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed", name);
                    ok += 1;
                }
                Ok(Err(e)) => tracing::warn!("Cleanup task '{}' failed: {}", name, e),
                Err(_) => tracing::warn!(
                    "Cleanup task '{}' timed out after {}ms",
                    name,
                    self.timeout.as_millis()
                ),
            }
        }
        ok
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 记忆进程：等待后台传播排空，随后保存快照（排空超时也照常保存）
pub struct PropagationDrain {
    controller: Arc<MemoryController>,
    timeout: Duration,
    snapshot: Option<PathBuf>,
}

impl PropagationDrain {
    pub fn new(controller: Arc<MemoryController>, timeout: Duration) -> Self {
        Self {
            controller,
            timeout,
            snapshot: None,
        }
    }

    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot = Some(path.into());
        self
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for PropagationDrain {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let drained = self.controller.wait_for_propagation(self.timeout).await;
        if let Some(path) = &self.snapshot {
            self.controller
                .save_to(path)
                .await
                .with_context(|| format!("Failed to save memory snapshot to {}", path.display()))?;
        }
        if !drained {
            anyhow::bail!(
                "{} records still pending propagation",
                self.controller.pending_propagation()
            )
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "PropagationDrain"
    }
}

/// 操作员进程：等待记忆子进程退出（stdin 关闭后它会自行退出），超时则强制结束
pub struct MemdProcessCleanup {
    child: Mutex<Child>,
    grace: Duration,
}

impl MemdProcessCleanup {
    pub fn new(child: Child, grace: Duration) -> Self {
        Self {
            child: Mutex::new(child),
            grace,
        }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for MemdProcessCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let mut child = self.child.lock().await;
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => {
                tracing::info!("hive-memd exited: {}", status?);
                Ok(())
            }
            Err(_) => {
                tracing::warn!("hive-memd did not exit in time, killing");
                child.kill().await?;
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "MemdProcess"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Slow {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Slow"
        }
    }

    struct Quick;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Quick {
        async fn cleanup(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Quick"
        }
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let m = ShutdownManager::new();
        let mut rx = m.subscribe();
        m.shutdown(ShutdownReason::PeerExited);
        m.shutdown(ShutdownReason::Signal);
        assert!(m.is_shutdown());
        assert_eq!(rx.recv().await.unwrap(), ShutdownReason::PeerExited);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drain_saves_snapshot() {
        use crate::config::AppConfig;
        use crate::memory::{MemoryRecord, MemorySnapshot};
        use crate::observability::Metrics;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        let metrics = Arc::new(Metrics::new().unwrap());
        let controller = Arc::new(MemoryController::from_config(&AppConfig::default(), metrics).unwrap());
        let ack = controller.write(MemoryRecord::new("k", "v"));

        let mut c = ShutdownCoordinator::new().with_timeout(Duration::from_secs(2));
        c.register(PropagationDrain::new(controller, Duration::from_secs(1)).with_snapshot(&path));
        assert_eq!(c.run_cleanup().await, 1);

        let saved = MemorySnapshot::load(&path).await.unwrap().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved.records[0].id, ack.id);
    }

    #[tokio::test]
    async fn test_coordinator_times_out_slow_tasks() {
        let mut c = ShutdownCoordinator::new().with_timeout(Duration::from_millis(20));
        c.register(Slow);
        c.register(Quick);
        assert_eq!(c.run_cleanup().await, 1);
    }
}
