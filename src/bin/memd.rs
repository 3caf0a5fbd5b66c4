//! hive-memd - 记忆进程
//!
//! stdin/stdout 为 IPC 通道（JSON 行信封），日志只写 stderr。
//! 启动时导入记忆快照；对端关闭或收到 Ctrl+C / SIGTERM 时停止读取、取消在途查询，
//! 等待后台传播完成并保存快照。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hive::config::load_config;
use hive::core::shutdown::PropagationDrain;
use hive::core::{ShutdownCoordinator, ShutdownManager};
use hive::ipc::{serve, ServerConfig, Transport};
use hive::memory::MemoryController;
use hive::observability::{self, HealthReport, Metrics};

#[derive(Parser, Debug)]
#[command(name = "hive-memd", about = "Tiered memory process for hive")]
struct Args {
    #[arg(short, long, env = "HIVE_CONFIG")]
    config: Option<PathBuf>,

    /// 退出前等待后台传播的最长时间（毫秒）
    #[arg(long, default_value_t = 3000)]
    drain_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init(std::io::stderr);
    let args = Args::parse();
    let cfg = load_config(args.config).context("Failed to load config")?;
    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);

    let controller = Arc::new(
        MemoryController::from_config(&cfg, metrics.clone()).context("Failed to build memory controller")?,
    );

    // 快照无法读取时从空记忆启动，且退出时不覆盖原文件
    let snapshot = match cfg.memory.snapshot_path() {
        Some(path) => match controller.load_from(path).await {
            Ok(_) => Some(path.to_path_buf()),
            Err(e) => {
                tracing::error!(path = %path.display(), "Failed to load memory snapshot, persistence disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    HealthReport::evaluate(
        "memd",
        shutdown.is_shutdown(),
        true,
        controller.pending_propagation(),
    )
    .log();
    tracing::info!(
        hot_capacity = cfg.memory.hot_capacity,
        indexed = cfg.endpoints.indexed.as_deref().unwrap_or("in-process"),
        graphed = cfg.endpoints.graphed.as_deref().unwrap_or("in-process"),
        "hive-memd ready"
    );

    let server = ServerConfig {
        max_outstanding: cfg.ipc.max_outstanding,
        max_frame_bytes: cfg.ipc.max_frame_bytes,
    };
    if let Err(e) = serve(controller.clone(), Transport::stdio(), server, shutdown.token()).await {
        tracing::error!("IPC server stopped with error: {}", e);
    }

    let mut coordinator = ShutdownCoordinator::new().with_timeout(Duration::from_millis(args.drain_ms + 500));
    let mut drain = PropagationDrain::new(controller.clone(), Duration::from_millis(args.drain_ms));
    if let Some(path) = snapshot {
        drain = drain.with_snapshot(path);
    }
    coordinator.register(drain);
    coordinator.run_cleanup().await;

    let stats = controller.stats().await;
    tracing::info!(
        hot = stats.hot_entries,
        indexed = stats.indexed_records,
        graph_nodes = stats.graph_nodes,
        graph_edges = stats.graph_edges,
        evictions = stats.hot_evictions,
        "hive-memd stopped"
    );
    tracing::debug!("Final metrics:\n{}", metrics.render());
    Ok(())
}
