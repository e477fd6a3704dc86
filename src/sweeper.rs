// src/sweeper.rs
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{error, info, warn};

use crate::error::{bounded, StoreError};
use crate::ledger::LedgerStore;
use crate::results::ResultAggregator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub closed: usize,
    pub failed: usize,
}

/// Closes polls whose expiry has passed.
pub struct ExpirySweeper {
    ledger: Arc<dyn LedgerStore>,
    results: Arc<ResultAggregator>,
    store_timeout: Duration,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        results: Arc<ResultAggregator>,
        store_timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            results,
            store_timeout,
            interval,
        }
    }

    pub async fn sweep_expired_polls(&self) -> Result<SweepReport, StoreError> {
        self.sweep_at(Utc::now()).await
    }

    /// Each poll is closed in its own statement; one failure is logged and
    /// the rest of the batch still runs.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let expired = bounded(self.store_timeout, self.ledger.expired_active_polls(now)).await?;
        let mut report = SweepReport::default();

        for poll_id in expired {
            match bounded(self.store_timeout, self.ledger.deactivate_poll(poll_id)).await {
                Ok(true) => {
                    info!(%poll_id, "Closed expired poll");
                    report.closed += 1;
                    self.results.invalidate(poll_id).await;
                }
                // Closed or deleted by someone else since the scan.
                Ok(false) => {}
                Err(e) => {
                    warn!(%poll_id, "Failed to close expired poll: {e}");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Sweeps on a fixed interval until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.interval.is_zero() {
            error!("Expiry sweeper not started: sweep interval must be greater than zero");
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Expiry sweeper running every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.sweep_expired_polls().await {
                    Ok(report) if report.closed > 0 || report.failed > 0 => {
                        info!(closed = report.closed, failed = report.failed, "Expiry sweep finished");
                    }
                    Ok(_) => {}
                    Err(e) => error!("Expiry sweep aborted: {e}"),
                },
                _ = shutdown.changed() => {
                    info!("Expiry sweeper stopping");
                    break;
                }
            }
        }
    }
}
