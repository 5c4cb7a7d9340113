//! # Reservation Expiry Daemon
//!
//! Runs the expiry sweeper against the configured database until SIGINT or
//! SIGTERM.
//!
//! ## Usage
//! ```bash
//! # Default config location (see CheckoutConfig::default_config_path)
//! cargo run -p bazaar-checkout --bin bazaar-sweeper
//!
//! # Explicit config file, verbose logging
//! RUST_LOG=bazaar_checkout=debug cargo run -p bazaar-checkout --bin bazaar-sweeper -- ./checkout.toml
//! ```

use std::path::PathBuf;

use anyhow::Context;
use bazaar_checkout::{CheckoutConfig, ExpirySweeper};
use bazaar_db::Database;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("Starting Bazaar expiry sweeper...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = CheckoutConfig::load(config_path).context("loading checkout configuration")?;
    info!(
        db_path = %config.database.path.display(),
        interval_secs = config.sweeper.interval_secs,
        batch_limit = config.sweeper.batch_limit,
        "Configuration loaded"
    );

    let db = Database::new(config.database.db_config())
        .await
        .context("opening database")?;
    info!("Database ready");

    let (sweeper, handle) = ExpirySweeper::from_config(db.clone(), &config);
    let task = tokio::spawn(sweeper.run());

    shutdown_signal().await;

    if let Err(e) = handle.shutdown().await {
        error!(?e, "Sweeper was already stopped");
    }
    if let Err(e) = task.await {
        error!(?e, "Sweeper task panicked");
    }
    db.close().await;

    info!("Sweeper shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM. If a handler cannot be installed the
/// daemon keeps running on the remaining one.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping sweeper...");
}
