#![forbid(unsafe_code)]

//! `session-monitor`: session monitoring daemon.
//!
//! Loads configuration, builds the monitoring context over the JSONL
//! transcript source, starts the configured projects and serves the
//! HTTP API until ctrl-c / SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use session_monitor::config::GlobalConfig;
use session_monitor::monitor::{spawn_event_logger, MonitoringContext};
use session_monitor::source::jsonl::JsonlHealthSource;
use session_monitor::{http, AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "session-monitor", about = "Session monitoring and control daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the HTTP port from the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Override the directory holding per-project session transcripts.
    #[arg(long)]
    projects_root: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("session-monitor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(root) = args.projects_root {
        config.set_projects_root(root)?;
    }
    if let Some(port) = args.port {
        config.http_port = port;
    }
    info!(
        projects_root = %config.projects_root.display(),
        poll_interval = config.monitoring.poll_interval,
        "configuration loaded"
    );

    // ── Build monitoring context ────────────────────────
    let source = Arc::new(JsonlHealthSource::new(config.projects_root.clone()));
    let ctx = Arc::new(MonitoringContext::new(
        source,
        config.monitoring.clone(),
        config.detection.clone(),
    ));

    let ct = CancellationToken::new();
    let events_handle = spawn_event_logger(ctx.subscribe_events(), ct.clone());

    // ── Autostart configured projects ───────────────────
    for project_id in &config.autostart_projects {
        match ctx.start_monitoring(project_id, None).await {
            Ok(snapshot) => info!(
                %project_id,
                sessions = snapshot.map_or(0, |data| data.sessions.len()),
                "autostarted monitoring"
            ),
            Err(err) => warn!(%project_id, %err, "autostart failed"),
        }
    }

    // ── Start HTTP server ───────────────────────────────
    let bind = config.bind_address();
    let http_ct = ct.clone();
    let http_ctx = Arc::clone(&ctx);
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http::serve(http_ctx, &bind, http_ct).await {
            error!(%err, "http server failed");
        }
    });

    info!("session-monitor ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    ctx.shutdown().await;
    let _ = tokio::join!(http_handle, events_handle);
    info!("session-monitor shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
