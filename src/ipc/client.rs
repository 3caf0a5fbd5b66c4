//! IPC 客户端（操作员进程一侧）
//!
//! - 未完成请求数受 Semaphore 限制，满时 `request` 立即返回 ChannelSaturated
//! - 读任务按 correlation_id 把信封路由到对应请求；未知 id 的迟到信封直接丢弃
//! - 每个请求一个计时任务，到期合成 Timeout 终止信封
//! - 每个请求恰好收到一个终止信封（Result / Error / Cancel / Timeout）
//! - 读写任务只持有弱引用；最后一个 `IpcClient` 释放后写端随之关闭，对端读到 EOF

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::envelope::{EnvelopeKind, IpcEnvelope};
use super::transport::Transport;
use crate::core::HiveError;
use crate::memory::{MemoryRecord, QueryRequest, RankedResults, WriteAck, WriteRequest};
use crate::observability::Metrics;

/// 客户端参数
#[derive(Debug, Clone)]
pub struct IpcClientConfig {
    pub max_outstanding: usize,
    pub request_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for IpcClientConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 32,
            request_timeout: Duration::from_millis(800),
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

struct Pending {
    kind: EnvelopeKind,
    tx: mpsc::UnboundedSender<IpcEnvelope>,
    _permit: OwnedSemaphorePermit,
}

struct ClientInner {
    pending: Mutex<HashMap<String, Pending>>,
    outbound: mpsc::Sender<IpcEnvelope>,
    permits: Arc<Semaphore>,
    closed: CancellationToken,
    config: IpcClientConfig,
    metrics: Option<Arc<Metrics>>,
}

impl ClientInner {
    fn take(&self, correlation_id: &str) -> Option<Pending> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id)
    }

    fn record(&self, kind: EnvelopeKind, outcome: &str) {
        if let Some(m) = &self.metrics {
            m.ipc_request(kind.as_str(), outcome);
        }
    }

    /// 路由对端发来的信封
    fn route(&self, envelope: IpcEnvelope) {
        let corr = envelope.correlation_id.clone();
        if envelope.kind.is_terminal() {
            match self.take(&corr) {
                Some(p) => {
                    self.record(p.kind, envelope.kind.as_str());
                    let _ = p.tx.send(envelope);
                }
                None => tracing::debug!(correlation_id = %corr, kind = envelope.kind.as_str(), "Dropping late envelope"),
            }
            return;
        }
        if envelope.kind == EnvelopeKind::PartialResult {
            let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            match pending.get(&corr) {
                Some(p) => {
                    let _ = p.tx.send(envelope);
                }
                None => tracing::debug!(correlation_id = %corr, "Dropping late partial"),
            }
            return;
        }
        tracing::warn!(kind = envelope.kind.as_str(), "Unexpected request envelope on client side");
    }

    /// 通道关闭：所有未完成请求收到合成的 Error 终止信封
    fn fail_all(&self) {
        self.closed.cancel();
        let drained: Vec<(String, Pending)> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (corr, p) in drained {
            self.record(p.kind, "closed");
            let _ = p.tx.send(IpcEnvelope::error(&corr, &HiveError::ChannelClosed));
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// 一个请求的回复流：零或多个 PartialResult，随后恰好一个终止信封
pub struct ResponseStream {
    correlation_id: String,
    rx: mpsc::UnboundedReceiver<IpcEnvelope>,
    finished: bool,
}

impl ResponseStream {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// 下一个信封；终止信封之后返回 None
    pub async fn next(&mut self) -> Option<IpcEnvelope> {
        if self.finished {
            return None;
        }
        let env = self.rx.recv().await?;
        if env.kind.is_terminal() {
            self.finished = true;
        }
        Some(env)
    }
}

/// 通道关闭：客户端仍在时让所有未完成请求失败，否则只标记关闭
fn shut(inner: &Weak<ClientInner>, closed: &CancellationToken) {
    match inner.upgrade() {
        Some(inner) => inner.fail_all(),
        None => closed.cancel(),
    }
}

#[derive(Clone)]
pub struct IpcClient {
    inner: Arc<ClientInner>,
}

impl IpcClient {
    /// 接入传输并启动读写任务（需在 tokio runtime 内调用）
    pub fn connect(transport: Transport, config: IpcClientConfig, metrics: Option<Arc<Metrics>>) -> Self {
        let (mut reader, mut writer) = transport.split(config.max_frame_bytes);
        let (outbound, mut outbound_rx) = mpsc::channel::<IpcEnvelope>(config.max_outstanding.max(1) * 2);
        let inner = Arc::new(ClientInner {
            pending: Mutex::new(HashMap::new()),
            outbound,
            permits: Arc::new(Semaphore::new(config.max_outstanding.max(1))),
            closed: CancellationToken::new(),
            config,
            metrics,
        });

        let w_closed = inner.closed.clone();
        let w_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = w_closed.cancelled() => break,
                    env = outbound_rx.recv() => {
                        let Some(env) = env else { break };
                        if let Err(e) = writer.send(&env).await {
                            tracing::error!("IPC write failed: {}", e);
                            shut(&w_inner, &w_closed);
                            break;
                        }
                    }
                }
            }
            tracing::debug!("IPC writer stopped");
        });

        let r_closed = inner.closed.clone();
        let r_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = r_closed.cancelled() => break,
                    next = reader.next() => next,
                };
                let Some(next) = next else {
                    tracing::info!("IPC channel closed by peer");
                    break;
                };
                let Some(inner) = r_inner.upgrade() else { break };
                match next {
                    Ok(env) => inner.route(env),
                    Err(e) => tracing::warn!("Discarding malformed envelope: {}", e),
                }
            }
            shut(&r_inner, &r_closed);
        });

        Self { inner }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// 等待通道关闭（对端退出或写失败）
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// 当前未完成请求数
    pub fn outstanding(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 发送请求并返回回复流
    pub async fn request<T: Serialize>(
        &self,
        kind: EnvelopeKind,
        body: &T,
    ) -> Result<ResponseStream, HiveError> {
        if self.is_closed() {
            return Err(HiveError::ChannelClosed);
        }
        let permit = self.inner.permits.clone().try_acquire_owned().map_err(|_| {
            self.inner.record(kind, "saturated");
            HiveError::ChannelSaturated
        })?;

        let envelope = IpcEnvelope::request(kind, body)?;
        let corr = envelope.correlation_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                corr.clone(),
                Pending {
                    kind,
                    tx,
                    _permit: permit,
                },
            );

        if self.inner.outbound.send(envelope).await.is_err() {
            self.inner.take(&corr);
            return Err(HiveError::ChannelClosed);
        }

        let timer_inner = Arc::downgrade(&self.inner);
        let timer_corr = corr.clone();
        let timeout = self.inner.config.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(timer_inner) = timer_inner.upgrade() else {
                return;
            };
            if let Some(p) = timer_inner.take(&timer_corr) {
                tracing::warn!(correlation_id = %timer_corr, "IPC request timed out");
                timer_inner.record(p.kind, "timeout");
                let _ = p.tx.send(IpcEnvelope::timeout(&timer_corr));
                // 通知对端放弃该请求
                let _ = timer_inner.outbound.try_send(IpcEnvelope::cancel(&timer_corr));
            }
        });

        Ok(ResponseStream {
            correlation_id: corr,
            rx,
            finished: false,
        })
    }

    /// 取消请求：本地立即投递 Cancel 终止信封，并通知对端
    pub async fn cancel(&self, correlation_id: &str) {
        if let Some(p) = self.inner.take(correlation_id) {
            self.inner.record(p.kind, "cancel");
            let _ = p.tx.send(IpcEnvelope::cancel(correlation_id));
            let _ = self.inner.outbound.send(IpcEnvelope::cancel(correlation_id)).await;
        }
    }

    /// 查询；每收到一个 partial 调用 `on_partial`
    ///
    /// 超时时若已有 partial 则返回最后一个 partial（complete = false），否则返回 RequestTimeout。
    pub async fn query<F>(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
        mut on_partial: F,
    ) -> Result<RankedResults, HiveError>
    where
        F: FnMut(&RankedResults),
    {
        let mut stream = self.request(EnvelopeKind::Query, request).await?;
        let mut last_partial: Option<RankedResults> = None;

        loop {
            let env = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel(stream.correlation_id()).await;
                    return Err(HiveError::Cancelled);
                }
                env = stream.next() => env,
            };
            let Some(env) = env else {
                return Err(HiveError::ChannelClosed);
            };
            match env.kind {
                EnvelopeKind::PartialResult => {
                    let partial: RankedResults = env.decode()?;
                    on_partial(&partial);
                    last_partial = Some(partial);
                }
                EnvelopeKind::Result => return env.decode(),
                EnvelopeKind::Timeout => {
                    return last_partial
                        .map(|mut p| {
                            p.complete = false;
                            p
                        })
                        .ok_or(HiveError::RequestTimeout)
                }
                EnvelopeKind::Cancel => return Err(HiveError::Cancelled),
                EnvelopeKind::Error => return Err(env.to_error()),
                other => {
                    return Err(HiveError::Protocol(format!(
                        "unexpected {} in reply stream",
                        other.as_str()
                    )))
                }
            }
        }
    }

    /// 写入；返回时记录已在热层可读
    pub async fn write(&self, record: MemoryRecord) -> Result<WriteAck, HiveError> {
        let mut stream = self
            .request(EnvelopeKind::Write, &WriteRequest { record })
            .await?;
        while let Some(env) = stream.next().await {
            match env.kind {
                EnvelopeKind::Result => return env.decode(),
                EnvelopeKind::Timeout => return Err(HiveError::RequestTimeout),
                EnvelopeKind::Cancel => return Err(HiveError::Cancelled),
                EnvelopeKind::Error => return Err(env.to_error()),
                _ => continue,
            }
        }
        Err(HiveError::ChannelClosed)
    }
}
