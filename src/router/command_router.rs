//! 命令路由：按置信度阈值与本地处理器决定执行目标，并执行
//!
//! - 置信度 >= high 且有本地处理器：本地
//! - low <= 置信度 < high 且有本地处理器：本地，标记 low_confidence（回复前加确认语）
//! - 置信度 < low 或无本地处理器：云端
//!
//! 云端最多调用一次（不重试）；失败或超时回退为固定的本地回复。

use std::sync::Arc;
use std::time::Duration;

use crate::config::RouterSection;
use crate::core::recovery::bounded;
use crate::core::session::{clamp_confidence, Command, ExecutionTarget, Utterance};
use crate::core::HiveError;
use crate::memory::RankedResults;
use crate::observability::Metrics;
use crate::voice::Classification;

use super::cloud::{CloudDelegate, HttpCloudDelegate};
use super::handlers::HandlerRegistry;

/// 云端不可用时的本地回复
pub const COULD_NOT_PROCESS: &str = "Sorry, I could not process that.";

/// 执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub reply: String,
    pub target: ExecutionTarget,
    /// 是否使用了回退回复
    pub fell_back: bool,
    pub cloud_calls: u32,
}

pub struct CommandRouter {
    low: f32,
    high: f32,
    handlers: HandlerRegistry,
    cloud: Option<Arc<dyn CloudDelegate>>,
    cloud_timeout: Duration,
    escalate_low_confidence: bool,
    metrics: Option<Arc<Metrics>>,
}

impl CommandRouter {
    pub fn new(low: f32, high: f32, handlers: HandlerRegistry) -> Self {
        Self {
            low,
            high,
            handlers,
            cloud: None,
            cloud_timeout: Duration::from_secs(3),
            escalate_low_confidence: false,
            metrics: None,
        }
    }

    /// 按 [router] 配置组装；配置了 cloud_endpoint 时启用 HTTP 云端委托
    pub fn from_config(cfg: &RouterSection, handlers: HandlerRegistry) -> Result<Self, HiveError> {
        let timeout = Duration::from_millis(cfg.cloud_timeout_ms);
        let mut router = Self::new(cfg.low_threshold, cfg.high_threshold, handlers)
            .with_cloud_timeout(timeout)
            .with_escalation(cfg.escalate_low_confidence);
        if let Some(endpoint) = &cfg.cloud_endpoint {
            router = router.with_cloud(Arc::new(HttpCloudDelegate::new(endpoint.clone(), timeout)?));
        }
        Ok(router)
    }

    pub fn with_cloud(mut self, cloud: Arc<dyn CloudDelegate>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_cloud_timeout(mut self, timeout: Duration) -> Self {
        self.cloud_timeout = timeout;
        self
    }

    pub fn with_escalation(mut self, escalate: bool) -> Self {
        self.escalate_low_confidence = escalate;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 决定执行目标
    pub fn route(&self, classification: Classification, utterance: Utterance) -> Command {
        let c = clamp_confidence(classification.confidence);
        let has_handler = self.handlers.contains(&classification.intent);
        let low_confidence = c < self.high;

        let mut target = if c < self.low || !has_handler {
            ExecutionTarget::Cloud
        } else {
            ExecutionTarget::Local
        };
        if target == ExecutionTarget::Local
            && low_confidence
            && self.escalate_low_confidence
            && self.cloud.is_some()
        {
            target = ExecutionTarget::Cloud;
        }

        if low_confidence {
            tracing::debug!(
                intent = %classification.intent,
                "{}",
                HiveError::ClassificationLowConfidence { confidence: c }
            );
        }
        tracing::info!(intent = %classification.intent, confidence = c, target = target.as_str(), "Routed command");

        Command {
            intent: classification.intent,
            arguments: classification.arguments,
            target,
            confidence: c,
            low_confidence,
            utterance,
        }
    }

    /// 执行命令；永不返回错误，失败时给出回退回复
    pub async fn dispatch(&self, command: &Command, context: &RankedResults) -> DispatchOutcome {
        match command.target {
            ExecutionTarget::Local => self.dispatch_local(command, context).await,
            ExecutionTarget::Cloud => self.dispatch_cloud(command, context).await,
        }
    }

    async fn dispatch_local(&self, command: &Command, context: &RankedResults) -> DispatchOutcome {
        let result = match self.handlers.get(&command.intent) {
            Some(h) => h.handle(command, context).await,
            None => Err(HiveError::ClassificationError(format!(
                "no local handler for '{}'",
                command.intent
            ))),
        };
        match result {
            Ok(reply) => {
                let reply = if command.low_confidence {
                    format!("I think you asked me to {}. {}", command.intent, reply)
                } else {
                    reply
                };
                DispatchOutcome {
                    reply: bounded(&reply),
                    target: ExecutionTarget::Local,
                    fell_back: false,
                    cloud_calls: 0,
                }
            }
            Err(e) => {
                tracing::warn!(intent = %command.intent, "Local handler failed: {}", e);
                self.fallback(ExecutionTarget::Local, 0)
            }
        }
    }

    async fn dispatch_cloud(&self, command: &Command, context: &RankedResults) -> DispatchOutcome {
        let Some(cloud) = &self.cloud else {
            tracing::warn!(intent = %command.intent, "No cloud delegate configured");
            self.record_cloud("unconfigured");
            return self.fallback(ExecutionTarget::Cloud, 0);
        };

        match tokio::time::timeout(self.cloud_timeout, cloud.delegate(command, context)).await {
            Ok(Ok(reply)) => {
                self.record_cloud("ok");
                DispatchOutcome {
                    reply: bounded(&reply),
                    target: ExecutionTarget::Cloud,
                    fell_back: false,
                    cloud_calls: 1,
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Cloud delegation failed: {}", e);
                self.record_cloud("error");
                self.fallback(ExecutionTarget::Cloud, 1)
            }
            Err(_) => {
                let err = HiveError::CloudUnavailable(format!(
                    "no reply within {} ms",
                    self.cloud_timeout.as_millis()
                ));
                tracing::warn!("{}", err);
                self.record_cloud("timeout");
                self.fallback(ExecutionTarget::Cloud, 1)
            }
        }
    }

    fn fallback(&self, target: ExecutionTarget, cloud_calls: u32) -> DispatchOutcome {
        DispatchOutcome {
            reply: COULD_NOT_PROCESS.to_string(),
            target,
            fell_back: true,
            cloud_calls,
        }
    }

    fn record_cloud(&self, outcome: &str) {
        if let Some(m) = &self.metrics {
            m.cloud_call(outcome);
        }
    }
}
