//! 健康报告
//!
//! - liveness：进程能响应即为 true
//! - readiness：未在关闭中、传播积压低于上限、IPC 通道仍打开

use serde::Serialize;

/// 传播积压上限，超过即视为未就绪
pub const PROPAGATION_BACKLOG_LIMIT: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub component: &'static str,
    pub live: bool,
    pub ready: bool,
    pub shutting_down: bool,
    pub channel_open: bool,
    pub pending_propagation: usize,
    /// 未就绪的原因
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

impl HealthReport {
    pub fn evaluate(
        component: &'static str,
        shutting_down: bool,
        channel_open: bool,
        pending_propagation: usize,
    ) -> Self {
        let mut reasons = Vec::new();
        if shutting_down {
            reasons.push("shutting down".to_string());
        }
        if !channel_open {
            reasons.push("ipc channel closed".to_string());
        }
        if pending_propagation >= PROPAGATION_BACKLOG_LIMIT {
            reasons.push(format!(
                "propagation backlog {pending_propagation} >= {PROPAGATION_BACKLOG_LIMIT}"
            ));
        }
        Self {
            component,
            live: true,
            ready: reasons.is_empty(),
            shutting_down,
            channel_open,
            pending_propagation,
            reasons,
        }
    }

    /// 以一条结构化日志输出
    pub fn log(&self) {
        if self.ready {
            tracing::info!(
                component = self.component,
                live = self.live,
                ready = self.ready,
                pending_propagation = self.pending_propagation,
                "Health check"
            );
        } else {
            tracing::warn!(
                component = self.component,
                live = self.live,
                ready = self.ready,
                reasons = ?self.reasons,
                "Health check: not ready"
            );
        }
    }
}
