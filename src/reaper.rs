//! Expiry reaper: releases reservations whose hold lapsed.
//!
//! Runs on its own task, independent of user actions. Each cycle takes a
//! bounded batch of candidates and expires them one atomic unit at a time;
//! a booking that a user moved first is left alone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::{EngineError, expire_reservation};
use crate::notify::{Notification, Outbox};
use crate::store::LedgerStore;

/// What one reaper cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub scanned: usize,
    pub expired: usize,
    /// Candidates that had already left `SlotReserved`.
    pub skipped: usize,
    pub failed: usize,
}

pub struct Reaper<S> {
    store: Arc<S>,
    outbox: Outbox,
    interval: Duration,
    batch_size: usize,
}

impl<S: LedgerStore> Reaper<S> {
    pub fn new(store: Arc<S>, outbox: Outbox, config: &EngineConfig) -> Self {
        Self {
            store,
            outbox,
            interval: Duration::from_secs(config.reaper_interval_secs),
            batch_size: config.reaper_batch_size,
        }
    }

    /// Expire one batch of lapsed reservations.
    ///
    /// A failing candidate is logged and counted; it never aborts the batch.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<ReapReport, EngineError> {
        let candidates = self
            .store
            .expired_reservations(now, self.batch_size)
            .await?;

        let mut report = ReapReport {
            scanned: candidates.len(),
            ..ReapReport::default()
        };

        for booking in candidates {
            let result = self
                .store
                .atomic(|tx| expire_reservation(tx, &booking))
                .await;
            match result {
                Ok(true) => {
                    report.expired += 1;
                    debug!(booking = %booking.id, user = booking.user_id, "reservation expired");
                    self.outbox.publish(Notification::Expired {
                        user: booking.user_id,
                        booking: booking.id,
                        job: booking.job_id,
                    });
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(booking = %booking.id, reason = %e, "failed to expire reservation");
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                expired = report.expired,
                skipped = report.skipped,
                failed = report.failed,
                "reaper cycle done"
            );
        }
        Ok(report)
    }

    /// Run cycles every configured interval until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "reaper started");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle(Utc::now()).await {
                        warn!(reason = %e, "reaper cycle failed");
                    }
                }
            }
        }

        info!("reaper stopped");
    }
}
