//! Periodic overdue sweep

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::invoice::InvoiceLedger;

/// Default time between sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Moves past-due invoices to overdue on a fixed interval
pub struct OverdueSweeper {
    ledger: Arc<InvoiceLedger>,
    every: Duration,
}

impl OverdueSweeper {
    pub fn new(ledger: Arc<InvoiceLedger>, every: Duration) -> Self {
        Self { ledger, every }
    }

    /// One sweep at the current time; returns how many invoices went overdue
    pub async fn sweep_once(&self) -> usize {
        match self.ledger.mark_overdue_due(Utc::now()).await {
            Ok(transitions) => {
                if transitions.is_empty() {
                    debug!("overdue sweep: nothing due");
                } else {
                    info!(count = transitions.len(), "overdue sweep moved invoices to overdue");
                }
                transitions.len()
            }
            Err(e) => {
                error!(error = %e, "overdue sweep failed");
                0
            }
        }
    }

    /// Sweep until `shutdown` flips to true. The first sweep runs immediately.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.every.as_secs(), "overdue sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("overdue sweeper stopped");
                        return;
                    }
                }
            }
        }
    }
}
