//! # Expiry Sweeper
//!
//! Background task that marks lapsed reservations `expired`, returning their
//! quantity to the available pool.
//!
//! ## Sweep Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          ExpirySweeper                                  │
//! │                                                                         │
//! │   interval tick ──┐                                                     │
//! │   sweep_now()   ──┼──► sweep(now)                                       │
//! │                   │      │                                              │
//! │                   │      ├─ expire_stale(now, batch_limit)  ◄──┐        │
//! │                   │      │                                     │        │
//! │                   │      └─ full batch? ──── yes ──────────────┘        │
//! │                   │                 no ──► done, log count              │
//! │   shutdown()    ──┴──► break                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every expiry is a single conditional update on `status = 'active'`, so
//! several sweepers (or a sweeper racing a commit) never double-process a
//! row. Expiry never touches on-hand stock.

use std::time::Duration;

use bazaar_db::Database;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::CheckoutConfig;
use crate::error::{CheckoutError, CheckoutResult};

/// Hard stop on passes per sweep so one tick cannot monopolize the pool.
const MAX_PASSES_PER_SWEEP: u32 = 100;

// =============================================================================
// Expiry Sweeper
// =============================================================================

pub struct ExpirySweeper {
    db: Database,
    interval: Duration,
    batch_limit: u32,
    trigger_rx: mpsc::Receiver<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for controlling a running sweeper.
#[derive(Clone)]
pub struct ExpirySweeperHandle {
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl ExpirySweeperHandle {
    /// Requests an immediate sweep. A request already queued absorbs this one.
    pub fn sweep_now(&self) -> CheckoutResult<()> {
        match self.trigger_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => {
                Err(CheckoutError::ChannelError("Sweeper trigger channel closed".into()))
            }
        }
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> CheckoutResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| CheckoutError::ChannelError("Shutdown channel closed".into()))
    }
}

impl ExpirySweeper {
    /// Creates a sweeper and returns its handle.
    pub fn new(db: Database, interval: Duration, batch_limit: u32) -> (Self, ExpirySweeperHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let sweeper = ExpirySweeper {
            db,
            interval,
            batch_limit: batch_limit.max(1),
            trigger_rx,
            shutdown_rx,
        };
        let handle = ExpirySweeperHandle {
            trigger_tx,
            shutdown_tx,
        };

        (sweeper, handle)
    }

    pub fn from_config(db: Database, config: &CheckoutConfig) -> (Self, ExpirySweeperHandle) {
        Self::new(db, config.sweep_interval(), config.sweeper.batch_limit)
    }

    /// Runs the sweep loop until shutdown.
    ///
    /// This should be spawned as a background task. A failed sweep is logged
    /// and retried on the next tick.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch_limit = self.batch_limit,
            "Expiry sweeper starting"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(?e, "Failed to sweep expired reservations");
                    }
                }

                Some(()) = self.trigger_rx.recv() => {
                    if let Err(e) = self.run_once().await {
                        error!(?e, "Failed to sweep expired reservations on demand");
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Expiry sweeper shutting down");
                    break;
                }
            }
        }

        info!("Expiry sweeper stopped");
    }

    /// Expires everything that has lapsed as of now.
    pub async fn run_once(&self) -> CheckoutResult<u64> {
        self.sweep(Utc::now()).await
    }

    /// Expires holds lapsed at `now`, in batches, until a batch comes back
    /// short.
    pub async fn sweep(&self, now: DateTime<Utc>) -> CheckoutResult<u64> {
        let manager = self.db.reservations();
        let mut total = 0u64;

        for _ in 0..MAX_PASSES_PER_SWEEP {
            let expired = manager.expire_stale(now, self.batch_limit).await?;
            total += expired;
            if expired < u64::from(self.batch_limit) {
                break;
            }
        }

        if total > 0 {
            info!(expired = total, "Expired lapsed reservations");
        } else {
            debug!("No lapsed reservations");
        }
        Ok(total)
    }
}
