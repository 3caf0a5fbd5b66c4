//! 后台传播：写入热层后，把记录异步推送到索引层与关系层
//!
//! 有界 worker 池（Semaphore 限制并发），每条记录依次写入各层；
//! 单层失败按指数退避重试，最终失败只记日志与指标，从不回传给写入方。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify, Semaphore};

use super::lookup::TierStore;
use super::record::MemoryRecord;
use crate::core::HiveError;
use crate::observability::Metrics;

/// 传播参数
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            backoff: Duration::from_millis(50),
            backoff_max: Duration::from_secs(1),
        }
    }
}

impl PropagationConfig {
    /// 第 attempt 次失败后的等待时间（从 1 开始计）
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(self.backoff_max)
    }
}

/// 待传播计数，归零时唤醒等待者
#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    settled: Notify,
}

impl Pending {
    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.settled.notify_waiters();
        }
    }
}

/// 传播池句柄
pub struct PropagationPool {
    tx: mpsc::UnboundedSender<MemoryRecord>,
    pending: Arc<Pending>,
}

impl PropagationPool {
    /// 启动分发任务（需在 tokio runtime 内调用）
    pub fn start(
        stores: Vec<Arc<dyn TierStore>>,
        config: PropagationConfig,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<MemoryRecord>();
        let pending = Arc::new(Pending::default());
        let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
        let stores = Arc::new(stores);
        let config = Arc::new(config);

        let pending_bg = pending.clone();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let stores = stores.clone();
                let config = config.clone();
                let metrics = metrics.clone();
                let pending = pending_bg.clone();
                tokio::spawn(async move {
                    for store in stores.iter() {
                        propagate_one(store.as_ref(), &record, &config, metrics.as_deref()).await;
                    }
                    drop(permit);
                    pending.done();
                });
            }
            tracing::debug!("Propagation dispatcher stopped");
        });

        Self { tx, pending }
    }

    /// 入队（不阻塞，不失败；池已关闭时仅记日志）
    pub fn enqueue(&self, record: MemoryRecord) {
        self.pending.count.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.tx.send(record) {
            tracing::warn!(id = %e.0.id, "Propagation pool closed, record stays hot-only");
            self.pending.done();
        }
    }

    /// 尚未完成传播的记录数
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }

    /// 等待所有已入队记录传播完成
    pub async fn settled(&self) {
        loop {
            let notified = self.pending.settled.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// 带超时等待；返回是否在超时前全部完成
    pub async fn wait_settled(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.settled()).await.is_ok()
    }
}

async fn propagate_one(
    store: &dyn TierStore,
    record: &MemoryRecord,
    config: &PropagationConfig,
    metrics: Option<&Metrics>,
) {
    let tier = store.tier();
    let attempts = config.max_retries + 1;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match store.put(record).await {
            Ok(()) => {
                if let Some(m) = metrics {
                    m.propagation(tier, "ok");
                }
                if attempt > 1 {
                    tracing::debug!(%tier, id = %record.id, attempt, "Propagation succeeded after retry");
                }
                return;
            }
            Err(e) => {
                last_error = e;
                if let Some(m) = metrics {
                    m.propagation(tier, "retry");
                }
                if attempt < attempts {
                    tokio::time::sleep(config.backoff_for(attempt)).await;
                }
            }
        }
    }

    let err = HiveError::MemoryWritePropagationFailure {
        tier,
        attempts,
        reason: last_error,
    };
    tracing::error!(id = %record.id, key = %record.key, "{}", err);
    if let Some(m) = metrics {
        m.propagation(tier, "failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::record::Tier;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// 前 fail_first 次写入失败的存储
    struct Flaky {
        fail_first: u32,
        calls: AtomicU32,
        stored: Mutex<Vec<String>>,
    }

    impl Flaky {
        fn new(fail_first: u32) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
                stored: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TierStore for Flaky {
        fn tier(&self) -> Tier {
            Tier::Indexed
        }

        async fn put(&self, record: &MemoryRecord) -> Result<(), String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err("unavailable".into());
            }
            self.stored.lock().unwrap().push(record.id.clone());
            Ok(())
        }

        async fn contains(&self, id: &str) -> bool {
            self.stored.lock().unwrap().iter().any(|s| s == id)
        }

        async fn len(&self) -> usize {
            self.stored.lock().unwrap().len()
        }
    }

    fn fast_config(max_retries: u32) -> PropagationConfig {
        PropagationConfig {
            workers: 2,
            max_retries,
            backoff: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let c = PropagationConfig {
            backoff: Duration::from_millis(10),
            backoff_max: Duration::from_millis(35),
            ..Default::default()
        };
        assert_eq!(c.backoff_for(1), Duration::from_millis(10));
        assert_eq!(c.backoff_for(2), Duration::from_millis(20));
        assert_eq!(c.backoff_for(3), Duration::from_millis(35));
        assert_eq!(c.backoff_for(40), Duration::from_millis(35));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let store = Arc::new(Flaky::new(2));
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = PropagationPool::start(vec![store.clone()], fast_config(3), Some(metrics.clone()));

        let r = MemoryRecord::new("k", "v");
        pool.enqueue(r.clone());
        assert!(pool.wait_settled(Duration::from_secs(2)).await);
        assert!(store.contains(&r.id).await);
        assert_eq!(metrics.propagation_count(Tier::Indexed, "ok"), 1);
        assert_eq!(metrics.propagation_count(Tier::Indexed, "retry"), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_counted_not_raised() {
        let store = Arc::new(Flaky::new(u32::MAX));
        let metrics = Arc::new(Metrics::new().unwrap());
        let pool = PropagationPool::start(vec![store.clone()], fast_config(2), Some(metrics.clone()));

        pool.enqueue(MemoryRecord::new("k", "v"));
        assert!(pool.wait_settled(Duration::from_secs(2)).await);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.propagation_count(Tier::Indexed, "failed"), 1);
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn test_settled_with_nothing_pending() {
        let pool = PropagationPool::start(Vec::new(), PropagationConfig::default(), None);
        assert!(pool.wait_settled(Duration::from_millis(10)).await);
    }
}
