//! Tracker server
//!
//! Serves the namespace and storage node membership until Ctrl-C, SIGTERM
//! or an unrecoverable durability failure.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use tracker::TrackerServer;
use tracker_common::TrackerConfig;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "tracker")]
#[command(about = "Namespace and storage node membership tracker")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "TRACKER_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, may be repeated (overrides the config file)
    #[arg(short, long)]
    listen: Vec<SocketAddr>,

    /// Directory for edit log segments and snapshots
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn load_config(path: Option<&Path>) -> Result<TrackerConfig> {
    let Some(path) = path else {
        return Ok(TrackerConfig::default());
    };
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Config file {} not found, using defaults", path.display());
            Ok(TrackerConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C"),
        () = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into());
    match args.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    let mut config = load_config(args.config.as_deref())?;
    // Command line takes precedence over the file
    if !args.listen.is_empty() {
        config.node.listen = args.listen;
    }
    if let Some(base_dir) = args.base_dir {
        config.node.base_dir = base_dir;
    }

    info!("Tracker {} starting", env!("CARGO_PKG_VERSION"));
    let server = TrackerServer::start(config).await.context("failed to start tracker")?;

    let fatal = tokio::select! {
        () = shutdown_signal() => None,
        reason = server.fatal().wait() => Some(reason),
    };

    let stopped = server.shutdown().await;
    if let Some(reason) = fatal {
        anyhow::bail!("tracker stopped after a fatal error: {reason}");
    }
    let tx_id = stopped.context("shutdown failed")?;
    info!("Tracker shut down cleanly at txid {}", tx_id);
    Ok(())
}
