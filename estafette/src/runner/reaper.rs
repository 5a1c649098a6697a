//! Lease reclamation and terminal-row pruning.
//!
//! A worker that dies mid-job leaves its row `processing` with a lease that
//! will never be released. The reaper resets such rows to `pending` once the
//! lease expires (without counting a retry, so a crash doesn't burn an
//! attempt) and deletes terminal rows past their retention window.

use std::sync::Arc;

use chrono::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::core::clock::Clock;
use crate::core::config::EngineConfig;
use crate::core::job::JobStatus;
use crate::core::store::{QueueError, Store};

/// Counters from one maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired leases reset to pending.
    pub unlocked: u64,
    /// Completed rows pruned past retention.
    pub pruned_completed: u64,
    /// Failed rows pruned past retention.
    pub pruned_failed: u64,
}

pub struct Reaper<S> {
    store: S,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl<S: Store> Reaper<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Run the maintenance loop until cancelled.
    pub async fn run(self, cancellation_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.reap_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(error) = self.sweep().await {
                        error!(%error, "maintenance sweep failed");
                    }
                }
                _ = cancellation_token.cancelled() => {
                    debug!("shutdown requested, stopping reaper");
                    return;
                }
            }
        }
    }

    /// One maintenance pass: unlock expired leases, then prune terminal rows
    /// past their retention windows.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, QueueError> {
        let now = self.clock.now();

        let unlocked = self.store.unlock_expired(now).await?;

        let completed_cutoff = now - Duration::days(self.config.completed_retention_days as i64);
        let pruned_completed = self
            .store
            .delete_older_than(JobStatus::Completed, completed_cutoff)
            .await?;

        let failed_cutoff = now - Duration::days(self.config.failed_retention_days as i64);
        let pruned_failed = self
            .store
            .delete_older_than(JobStatus::Failed, failed_cutoff)
            .await?;

        let report = SweepReport {
            unlocked,
            pruned_completed,
            pruned_failed,
        };

        if report != SweepReport::default() {
            info!(
                unlocked = report.unlocked,
                pruned_completed = report.pruned_completed,
                pruned_failed = report.pruned_failed,
                "maintenance sweep finished"
            );
        }

        Ok(report)
    }
}
