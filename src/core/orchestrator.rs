//! 操作员主控循环
//!
//! 每次唤醒创建一个 VoiceSession，依次经过：
//! Capturing → Transcribing → Classifying → AwaitingMemory → Dispatching → Synthesizing → Speaking → Idle。
//!
//! - 每个等待点都受会话 CancellationToken 约束
//! - Synthesizing / Speaking 阶段再次唤醒即插话：取消当前会话（Cancelled），立刻以新唤醒开始新会话
//! - 其他阶段的唤醒被忽略
//! - 阶段变化通过 broadcast 推送事件，并投影到 watch 中的 OperatorSnapshot

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::recovery::{bounded, RecoveryEngine};
use super::session::{Command, ExecutionTarget, Utterance, VoiceSession};
use super::session_supervisor::SessionSupervisor;
use super::state::{OperatorSnapshot, SessionPhase};
use super::{HiveError, RecoveryAction};
use crate::ipc::IpcClient;
use crate::memory::{MemoryRecord, QueryRequest, RankedResults};
use crate::observability::Metrics;
use crate::router::{CommandRouter, DispatchOutcome};
use crate::voice::{AudioBuffer, Classification, IntentClassifier, Synthesizer, Transcriber, CHAT_INTENT};

/// 对话轮次之间的关系标签
pub const FOLLOWS: &str = "follows";

/// 唤醒信号（携带已采集的音频）
#[derive(Debug, Clone)]
pub struct WakeSignal {
    pub audio: AudioBuffer,
}

impl WakeSignal {
    pub fn new(audio: AudioBuffer) -> Self {
        Self { audio }
    }
}

/// 会话结束方式
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed {
        reply: String,
        target: ExecutionTarget,
        fell_back: bool,
        cloud_calls: u32,
    },
    Failed {
        error: HiveError,
        apology: Option<String>,
    },
    Cancelled,
}

impl SessionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::Completed { .. } => "completed",
            SessionOutcome::Failed { .. } => "failed",
            SessionOutcome::Cancelled => "cancelled",
        }
    }
}

/// 推送给订阅者的事件
#[derive(Debug, Clone)]
pub enum OperatorEvent {
    PhaseChanged {
        session_id: String,
        from: SessionPhase,
        to: SessionPhase,
    },
    SessionFinished {
        session_id: String,
        utterance: Option<String>,
        outcome: SessionOutcome,
    },
    WakeIgnored {
        phase: SessionPhase,
    },
}

/// 协作方
pub struct OperatorDeps {
    pub transcriber: Arc<dyn Transcriber>,
    pub classifier: Arc<dyn IntentClassifier>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub router: CommandRouter,
    pub memory: IpcClient,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Clone, Default)]
pub struct OperatorOptions {
    /// 查询记忆时附带的关系提示
    pub relation_hint: Option<String>,
}

pub struct Operator {
    deps: OperatorDeps,
    options: OperatorOptions,
    supervisor: SessionSupervisor,
    recovery: RecoveryEngine,
    events: broadcast::Sender<OperatorEvent>,
    snapshot: watch::Sender<OperatorSnapshot>,
    /// 上一轮对话记录的 id（下一轮记录以 follows 边指向它）
    last_record: Mutex<Option<String>>,
}

async fn or_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, HiveError>
where
    F: Future<Output = Result<T, HiveError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HiveError::Cancelled),
        r = fut => r,
    }
}

impl Operator {
    pub fn new(deps: OperatorDeps, options: OperatorOptions) -> Self {
        let (events, _) = broadcast::channel(256);
        let (snapshot, _) = watch::channel(OperatorSnapshot::default());
        Self {
            deps,
            options,
            supervisor: SessionSupervisor::new(),
            recovery: RecoveryEngine::new(),
            events,
            snapshot,
            last_record: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperatorEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> watch::Receiver<OperatorSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        self.snapshot.borrow().phase
    }

    /// 取消当前会话并停止主循环
    pub fn shutdown(&self) {
        self.supervisor.shutdown();
    }

    /// 主循环：唤醒通道关闭或 shutdown 后返回（当前会话先跑完）
    pub async fn run(&self, mut wakes: mpsc::Receiver<WakeSignal>) {
        let root = self.supervisor.root_token();
        let mut queued: Option<WakeSignal> = None;
        let mut wakes_open = true;

        loop {
            let wake = match queued.take() {
                Some(w) => w,
                None if !wakes_open => break,
                None => tokio::select! {
                    _ = root.cancelled() => break,
                    w = wakes.recv() => match w {
                        Some(w) => w,
                        None => break,
                    },
                },
            };
            if root.is_cancelled() {
                break;
            }

            let mut session = VoiceSession::begin(self.supervisor.begin_session());
            self.publish_phase(&session.id, SessionPhase::Idle, SessionPhase::Capturing);
            tracing::info!(session = %session.id, "Wake word detected, session started");

            let outcome = {
                let fut = self.run_session(&mut session, wake.audio);
                tokio::pin!(fut);
                loop {
                    tokio::select! {
                        outcome = &mut fut => break outcome,
                        w = wakes.recv(), if wakes_open && queued.is_none() => match w {
                            None => wakes_open = false,
                            Some(w) => {
                                let phase = self.phase();
                                if phase.accepts_barge_in() {
                                    tracing::info!(%phase, "Barge-in, cancelling current session");
                                    self.supervisor.cancel_current();
                                    queued = Some(w);
                                } else {
                                    tracing::debug!(%phase, "Wake ignored while session is busy");
                                    let _ = self.events.send(OperatorEvent::WakeIgnored { phase });
                                }
                            }
                        },
                    }
                }
            };

            self.finish(&session, outcome);
        }

        tracing::info!("Operator loop stopped");
    }

    /// 单次会话；所有错误在此收敛为 SessionOutcome
    async fn run_session(&self, session: &mut VoiceSession, audio: AudioBuffer) -> SessionOutcome {
        let cancel = session.cancel.clone();
        match self.drive(session, &cancel, audio).await {
            Ok(outcome) => outcome,
            Err(HiveError::Cancelled) => {
                self.enter(session, SessionPhase::Cancelled);
                SessionOutcome::Cancelled
            }
            Err(e) => self.fail(session, e).await,
        }
    }

    async fn drive(
        &self,
        session: &mut VoiceSession,
        cancel: &CancellationToken,
        audio: AudioBuffer,
    ) -> Result<SessionOutcome, HiveError> {
        self.enter(session, SessionPhase::Transcribing);
        let transcript = or_cancel(cancel, self.deps.transcriber.transcribe(&audio)).await?;
        let utterance = Utterance::new(transcript.text, transcript.confidence, session.id.clone());
        tracing::info!(
            session = %session.id,
            seq = utterance.sequence,
            confidence = utterance.confidence,
            "Heard: {}",
            utterance.text
        );
        session.utterance = Some(utterance.clone());

        self.enter(session, SessionPhase::Classifying);
        let classification = match or_cancel(cancel, self.deps.classifier.classify(&utterance)).await {
            Ok(c) => c,
            Err(HiveError::Cancelled) => return Err(HiveError::Cancelled),
            Err(e) => {
                tracing::warn!("Classification failed, routing as unknown: {}", e);
                Classification {
                    intent: CHAT_INTENT.to_string(),
                    arguments: utterance.text.clone(),
                    confidence: 0.0,
                }
            }
        };
        let command = self.deps.router.route(classification, utterance.clone());
        session.command = Some(command.clone());

        self.enter(session, SessionPhase::AwaitingMemory);
        let mut notice = None;
        let context = match self.recall(&utterance, cancel).await {
            Ok(r) => r,
            Err(HiveError::Cancelled) => return Err(HiveError::Cancelled),
            Err(e) if e.is_session_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!("Memory recall degraded: {}", e);
                if let RecoveryAction::Degrade(n) = self.recovery.handle(&e) {
                    notice = n;
                }
                RankedResults::default()
            }
        };
        if !context.skipped.is_empty() {
            tracing::debug!(skipped = ?context.skipped, "Recall skipped slow tiers");
        }

        self.enter(session, SessionPhase::Dispatching);
        let dispatched = or_cancel(cancel, async {
            Ok::<_, HiveError>(self.deps.router.dispatch(&command, &context).await)
        })
        .await?;
        self.remember(&command, &dispatched, cancel).await?;

        let reply = match notice {
            Some(n) => bounded(&format!("{} {}", dispatched.reply, n)),
            None => dispatched.reply.clone(),
        };
        session.reply = Some(reply.clone());

        self.enter(session, SessionPhase::Synthesizing);
        let speech = or_cancel(cancel, self.deps.synthesizer.synthesize(&reply)).await?;
        self.enter(session, SessionPhase::Speaking);
        or_cancel(cancel, self.deps.synthesizer.play(&speech, cancel)).await?;
        self.enter(session, SessionPhase::Idle);

        Ok(SessionOutcome::Completed {
            reply,
            target: dispatched.target,
            fell_back: dispatched.fell_back,
            cloud_calls: dispatched.cloud_calls,
        })
    }

    async fn recall(&self, utterance: &Utterance, cancel: &CancellationToken) -> Result<RankedResults, HiveError> {
        let mut request = QueryRequest::by_key(utterance.normalized());
        if let Some(hint) = &self.options.relation_hint {
            request = request.with_relation(hint.clone());
        }
        self.deps
            .memory
            .query(&request, cancel, |partial| {
                tracing::debug!(hits = partial.records.len(), "Early partial recall");
            })
            .await
    }

    /// 把本轮对话写入记忆；只有通道致命错误会中断会话
    async fn remember(
        &self,
        command: &Command,
        outcome: &DispatchOutcome,
        cancel: &CancellationToken,
    ) -> Result<(), HiveError> {
        let payload = serde_json::json!({
            "utterance": command.utterance.text,
            "intent": command.intent,
            "arguments": command.arguments,
            "target": outcome.target.as_str(),
            "reply": outcome.reply,
            "session_id": command.utterance.session_id,
        })
        .to_string();
        let mut record = MemoryRecord::new(command.utterance.normalized(), payload)
            .with_tag(command.intent.clone())
            .with_tag(outcome.target.as_str());
        let previous = self
            .last_record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(prev) = previous {
            record = record.with_relation(FOLLOWS, prev);
        }

        match or_cancel(cancel, self.deps.memory.write(record)).await {
            Ok(ack) => {
                tracing::debug!(id = %ack.id, "Interaction recorded");
                *self.last_record.lock().unwrap_or_else(PoisonError::into_inner) = Some(ack.id);
                Ok(())
            }
            Err(HiveError::Cancelled) => Err(HiveError::Cancelled),
            Err(e) if e.is_session_fatal() => Err(e),
            Err(e) => {
                tracing::warn!("Failed to record interaction: {}", e);
                Ok(())
            }
        }
    }

    async fn fail(&self, session: &mut VoiceSession, error: HiveError) -> SessionOutcome {
        tracing::error!(session = %session.id, code = error.code(), "Session failed: {}", error);
        self.enter(session, SessionPhase::Error);
        self.snapshot
            .send_modify(|s| s.error_message = Some(error.to_string()));

        let apology = match self.recovery.handle(&error) {
            RecoveryAction::Apologize(text) => Some(bounded(&text)),
            _ => None,
        };
        if let Some(text) = &apology {
            let spoken = async {
                let audio = self.deps.synthesizer.synthesize(text).await?;
                self.deps.synthesizer.play(&audio, &session.cancel).await
            };
            if let Err(e) = spoken.await {
                tracing::warn!("Could not speak apology: {}", e);
            }
        }
        self.enter(session, SessionPhase::Idle);
        SessionOutcome::Failed { error, apology }
    }

    fn enter(&self, session: &mut VoiceSession, next: SessionPhase) {
        let from = session.phase;
        if !from.can_transition_to(next) {
            tracing::warn!(session = %session.id, "Illegal phase transition {} -> {}", from, next);
            return;
        }
        session.phase = next;
        self.publish_phase(&session.id, from, next);
    }

    fn publish_phase(&self, session_id: &str, from: SessionPhase, to: SessionPhase) {
        tracing::debug!(session = %session_id, "{} -> {}", from, to);
        self.snapshot.send_modify(|s| {
            s.phase = to;
            s.session_id = Some(session_id.to_string());
        });
        let _ = self.events.send(OperatorEvent::PhaseChanged {
            session_id: session_id.to_string(),
            from,
            to,
        });
    }

    fn finish(&self, session: &VoiceSession, outcome: SessionOutcome) {
        self.supervisor.end_session();
        self.deps.metrics.session_finished(outcome.label());
        tracing::info!(
            session = %session.id,
            outcome = outcome.label(),
            elapsed_ms = session.started_at.elapsed().as_millis() as u64,
            "Session finished"
        );

        self.snapshot.send_modify(|s| {
            s.phase = SessionPhase::Idle;
            s.session_id = None;
            if let SessionOutcome::Completed { reply, .. } = &outcome {
                s.last_reply = Some(reply.clone());
                s.error_message = None;
            }
        });
        let _ = self.events.send(OperatorEvent::SessionFinished {
            session_id: session.id.clone(),
            utterance: session.utterance.as_ref().map(|u| u.text.clone()),
            outcome,
        });
    }
}
