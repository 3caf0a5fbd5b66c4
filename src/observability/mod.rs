//! 可观测性：日志初始化、Prometheus 指标、健康报告

pub mod health;
pub mod metrics;

pub use health::{HealthReport, PROPAGATION_BACKLOG_LIMIT};
pub use metrics::Metrics;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化日志：默认 info，可通过 RUST_LOG 覆盖
///
/// hive-memd 的 stdout 是 IPC 通道，日志必须写到 stderr。
pub fn init<W>(writer: W)
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer))
        .try_init();
}
