//! Daemon command: run the scheduling engine until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::{Result, miette};
use tokio::sync::watch;
use tracing::info;

use cadence_scheduler::{Engine, EngineConfig, process_runner};
use cadence_store::TaskStore;

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub db_path: PathBuf,
    /// Store poll period for hot-reload.
    pub reload_interval: Duration,
    /// How long in-flight scripts get to finish on shutdown.
    pub shutdown_grace: Duration,
}

pub async fn run(config: DaemonConfig) -> Result<()> {
    let store = Arc::new(TaskStore::open(&config.db_path).map_err(|e| miette!("{}", e))?);

    let engine = Engine::new(
        store,
        process_runner(),
        EngineConfig {
            reload_interval: config.reload_interval,
            shutdown_grace: config.shutdown_grace,
        },
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    info!(
        db_path = %config.db_path.display(),
        reload_interval_secs = config.reload_interval.as_secs(),
        "daemon starting"
    );

    engine.run(shutdown_rx).await;

    info!("daemon stopped");
    Ok(())
}
