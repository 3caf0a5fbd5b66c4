//! hive - 前台操作员进程
//!
//! 启动记忆子进程，每行标准输入视为一次唤醒（行内容即“音频”），回复打印到标准输出。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hive::config::{load_config, AppConfig};
use hive::core::shutdown::MemdProcessCleanup;
use hive::core::{
    Operator, OperatorDeps, OperatorOptions, ShutdownCoordinator, ShutdownManager, ShutdownReason,
    WakeSignal,
};
use hive::ipc::{spawn_memd, IpcClient, IpcClientConfig};
use hive::observability::{self, HealthReport, Metrics};
use hive::router::{CommandRouter, HandlerRegistry};
use hive::voice::{ConsoleSynthesizer, KeywordClassifier, TextTranscriber, VoiceOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// 文本替身的默认转写置信度
const TEXT_CONFIDENCE: f32 = 0.9;
const SAMPLE_RATE: u32 = 16_000;

#[derive(Parser, Debug)]
#[command(name = "hive", about = "Voice operator with tiered memory")]
struct Args {
    /// 额外配置文件（覆盖 config/default.toml）
    #[arg(short, long, env = "HIVE_CONFIG")]
    config: Option<PathBuf>,

    /// hive-memd 可执行文件路径（覆盖 ipc.memd_path）
    #[arg(long)]
    memd: Option<PathBuf>,
}

fn memd_path(args: &Args, cfg: &AppConfig) -> anyhow::Result<PathBuf> {
    if let Some(p) = args.memd.clone().or_else(|| cfg.ipc.memd_path.clone()) {
        return Ok(p);
    }
    let exe = std::env::current_exe().context("Failed to locate current executable")?;
    let dir = exe
        .parent()
        .context("Current executable has no parent directory")?;
    Ok(dir.join(format!("hive-memd{}", std::env::consts::EXE_SUFFIX)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout 用于播报，日志写到 stderr
    observability::init(std::io::stderr);
    let args = Args::parse();
    let cfg = load_config(args.config.clone()).context("Failed to load config")?;
    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);

    let path = memd_path(&args, &cfg)?;
    let mut memd_args = Vec::new();
    if let Some(c) = &args.config {
        memd_args.push("--config".to_string());
        memd_args.push(c.display().to_string());
    }
    let (child, transport) = spawn_memd(&path, &memd_args)
        .with_context(|| format!("Failed to spawn {}", path.display()))?;
    tracing::info!(path = %path.display(), pid = ?child.id(), "hive-memd started");

    let client = IpcClient::connect(
        transport,
        IpcClientConfig {
            max_outstanding: cfg.ipc.max_outstanding,
            request_timeout: cfg.timeouts.request(),
            max_frame_bytes: cfg.ipc.max_frame_bytes,
        },
        Some(metrics.clone()),
    );

    let router = CommandRouter::from_config(&cfg.router, HandlerRegistry::with_builtin_verbs())
        .context("Failed to build command router")?
        .with_metrics(metrics.clone());
    let voice = VoiceOptions {
        gpu_enabled: cfg.acceleration.gpu_enabled,
    };

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    HealthReport::evaluate("operator", shutdown.is_shutdown(), !client.is_closed(), 0).log();

    // 记忆进程意外退出时整体关闭
    {
        let watcher = client.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watcher.closed() => shutdown.shutdown(ShutdownReason::PeerExited),
                _ = shutdown.wait_for_shutdown() => {}
            }
        });
    }

    let operator = Arc::new(Operator::new(
        OperatorDeps {
            transcriber: Arc::new(TextTranscriber::new(TEXT_CONFIDENCE, voice)),
            classifier: Arc::new(KeywordClassifier),
            synthesizer: Arc::new(ConsoleSynthesizer::new(
                Duration::from_millis(cfg.operator.speak_ms_per_char),
                voice,
            )),
            router,
            memory: client,
            metrics: metrics.clone(),
        },
        OperatorOptions {
            relation_hint: cfg.operator.relation_hint.clone(),
        },
    ));

    let (wake_tx, wake_rx) = mpsc::channel::<WakeSignal>(8);
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = tokio::select! {
                    _ = shutdown.wait_for_shutdown() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => {
                        let wake = WakeSignal::new(hive::voice::AudioBuffer::new(line, SAMPLE_RATE));
                        if wake_tx.send(wake).await.is_err() {
                            break;
                        }
                    }
                    // 输入结束：不再唤醒，当前会话跑完后主循环自行退出
                    Ok(None) => break,
                    Err(e) => {
                        shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
                        break;
                    }
                }
            }
        });
    }

    let mut run = {
        let operator = operator.clone();
        tokio::spawn(async move { operator.run(wake_rx).await })
    };

    let joined = tokio::select! {
        r = &mut run => r,
        _ = shutdown.wait_for_shutdown() => {
            operator.shutdown();
            run.await
        }
    };
    if let Err(e) = joined {
        tracing::error!("Operator loop panicked: {}", e);
    }
    shutdown.shutdown(ShutdownReason::UserInitiated);

    // 释放客户端，子进程 stdin 随之关闭
    drop(operator);

    let mut coordinator = ShutdownCoordinator::new().with_timeout(Duration::from_secs(5));
    coordinator.register(MemdProcessCleanup::new(child, Duration::from_secs(3)));
    coordinator.run_cleanup().await;

    tracing::debug!("Final metrics:\n{}", metrics.render());
    tracing::info!(completed = metrics.sessions("completed"), "hive stopped");
    Ok(())
}
