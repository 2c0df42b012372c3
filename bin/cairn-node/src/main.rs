//! Cairn node - local storage daemon
//!
//! Opens the storage engine described by the configuration file and keeps
//! it running until interrupted.

use anyhow::{Context, Result};
use cairn_common::Config;
use cairn_storage::StorageEngine;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cairn-node")]
#[command(about = "Cairn storage node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/cairn/node.toml")]
    config: PathBuf,

    /// Data directory (overrides the configuration file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Advance the epoch locally every N seconds (standalone deployments)
    #[arg(long, env = "CAIRN_EPOCH_INTERVAL_SECS")]
    epoch_interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if let Some(data_dir) = args.data_dir {
        config.node.data_dir = data_dir;
    }

    // CLI takes precedence when set explicitly
    let log_level = if args.log_level == "info" {
        config.logging.level.clone()
    } else {
        args.log_level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Cairn node {}", config.node.name);
    info!("Config file: {}", args.config.display());
    info!("Data directory: {}", config.node.data_dir.display());

    if config.shards.is_empty() {
        error!("No shards configured in {}", args.config.display());
        std::process::exit(1);
    }

    let engine = StorageEngine::open(&config).context("failed to open storage engine")?;
    engine.init().context("failed to initialize storage engine")?;

    for shard in engine.shard_infos() {
        info!(
            shard_id = %shard.id,
            path = %shard.path.display(),
            mode = %shard.mode,
            writecache = shard.writecache,
            "shard ready"
        );
    }

    let shutdown = CancellationToken::new();
    let ticker = args.epoch_interval_secs.map(|secs| {
        info!("Local epoch ticker enabled, interval {secs}s");
        tokio::spawn(tick_epochs(
            Arc::clone(&engine),
            Duration::from_secs(secs.max(1)),
            shutdown.clone(),
        ))
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    if let Some(ticker) = ticker
        && let Err(e) = ticker.await
    {
        warn!("Epoch ticker failed: {e}");
    }

    engine.close().await;
    info!("Cairn node stopped");
    Ok(())
}

/// Missing file means an all-defaults config
fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path).with_context(|| format!("failed to load config {}", path.display()))
    } else {
        eprintln!("Warning: config file {} not found, using defaults", path.display());
        Ok(Config::default())
    }
}

async fn tick_epochs(engine: Arc<StorageEngine>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let epoch = engine.epoch() + 1;
        info!(epoch, "Local epoch advanced");
        engine.handle_new_epoch(epoch).await;
    }
}
