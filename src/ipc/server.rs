//! IPC 服务端（记忆进程一侧）
//!
//! Write 在读循环内同步处理（热层写入后立即回 Result），因此同一连接上后续的 Query 一定能读到它；
//! Query 每个请求一个任务，可被 Cancel 信封取消。未完成请求数满时直接回 channel_saturated。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use super::envelope::{EnvelopeKind, IpcEnvelope};
use super::transport::Transport;
use crate::core::HiveError;
use crate::memory::{MemoryController, QueryRequest, RankedResults, WriteRequest};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_outstanding: usize,
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 32,
            max_frame_bytes: 4 * 1024 * 1024,
        }
    }
}

type InFlight = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// 服务一个连接，直到对端关闭或 shutdown 被触发
pub async fn serve(
    controller: Arc<MemoryController>,
    transport: Transport,
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<(), HiveError> {
    let (mut reader, mut writer) = transport.split(config.max_frame_bytes);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<IpcEnvelope>();

    let writer_task = tokio::spawn(async move {
        while let Some(env) = out_rx.recv().await {
            if let Err(e) = writer.send(&env).await {
                tracing::error!("IPC write failed: {}", e);
                return Err(e);
            }
        }
        Ok(())
    });

    let permits = Arc::new(Semaphore::new(config.max_outstanding.max(1)));
    let inflight: InFlight = Arc::new(Mutex::new(HashMap::new()));

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Memory server shutting down");
                break;
            }
            next = reader.next() => next,
        };
        let envelope = match next {
            None => {
                tracing::info!("Peer closed IPC channel");
                break;
            }
            Some(Err(e)) => {
                tracing::warn!("Discarding malformed envelope: {}", e);
                continue;
            }
            Some(Ok(env)) => env,
        };
        let corr = envelope.correlation_id.clone();

        match envelope.kind {
            EnvelopeKind::Cancel => {
                let token = inflight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&corr)
                    .cloned();
                match token {
                    Some(t) => t.cancel(),
                    None => tracing::debug!(correlation_id = %corr, "Cancel for unknown request"),
                }
            }
            EnvelopeKind::Write => {
                let reply = match envelope.decode::<WriteRequest>() {
                    Ok(req) => {
                        let ack = controller.write(req.record);
                        IpcEnvelope::reply(&corr, EnvelopeKind::Result, &ack)
                            .unwrap_or_else(|e| IpcEnvelope::error(&corr, &e))
                    }
                    Err(e) => IpcEnvelope::error(&corr, &e),
                };
                let _ = out_tx.send(reply);
            }
            EnvelopeKind::Query => {
                let request = match envelope.decode::<QueryRequest>() {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = out_tx.send(IpcEnvelope::error(&corr, &e));
                        continue;
                    }
                };
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    tracing::warn!(correlation_id = %corr, "Server saturated, rejecting query");
                    let _ = out_tx.send(IpcEnvelope::error(&corr, &HiveError::ChannelSaturated));
                    continue;
                };

                let token = shutdown.child_token();
                inflight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(corr.clone(), token.clone());

                let controller = controller.clone();
                let out_tx = out_tx.clone();
                let inflight = inflight.clone();
                tokio::spawn(async move {
                    run_query(&controller, request, &corr, &token, &out_tx).await;
                    inflight
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&corr);
                    drop(permit);
                });
            }
            other => {
                tracing::warn!(kind = other.as_str(), "Unexpected envelope kind on server side");
                let _ = out_tx.send(IpcEnvelope::error(
                    &corr,
                    &HiveError::Protocol(format!("server does not accept {}", other.as_str())),
                ));
            }
        }
    }

    for token in inflight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .values()
    {
        token.cancel();
    }
    drop(out_tx);
    match writer_task.await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("IPC writer task panicked: {}", e);
            Err(HiveError::ChannelClosed)
        }
    }
}

async fn run_query(
    controller: &MemoryController,
    request: QueryRequest,
    corr: &str,
    cancel: &CancellationToken,
    out: &mpsc::UnboundedSender<IpcEnvelope>,
) {
    let (partial_tx, mut partial_rx) = mpsc::unbounded_channel::<RankedResults>();
    let forward_out = out.clone();
    let forward_corr = corr.to_string();
    let forwarder = tokio::spawn(async move {
        while let Some(partial) = partial_rx.recv().await {
            match IpcEnvelope::reply(&forward_corr, EnvelopeKind::PartialResult, &partial) {
                Ok(env) => {
                    let _ = forward_out.send(env);
                }
                Err(e) => tracing::warn!("Failed to encode partial: {}", e),
            }
        }
    });

    let result = controller.query(request, cancel, Some(&partial_tx)).await;
    drop(partial_tx);
    // partial 必须先于终止信封发出
    let _ = forwarder.await;

    let terminal = match result {
        Ok(ranked) => IpcEnvelope::reply(corr, EnvelopeKind::Result, &ranked)
            .unwrap_or_else(|e| IpcEnvelope::error(corr, &e)),
        Err(HiveError::Cancelled) => IpcEnvelope::cancel(corr),
        Err(e) => IpcEnvelope::error(corr, &e),
    };
    let _ = out.send(terminal);
}
