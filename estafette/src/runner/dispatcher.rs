//! Periodic scan for ready jobs.
//!
//! The dispatcher never claims anything: it looks at the head of the backlog
//! and nudges workers, one nudge per ready job. Claiming happens inside the
//! worker, so two workers racing toward the same job is fine: exactly one
//! wins. Missed ticks delay dispatch, they never lose work.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::core::clock::Clock;
use crate::core::config::EngineConfig;
use crate::core::store::{QueueError, Store};

pub struct Dispatcher<S> {
    store: S,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    trigger: Arc<Notify>,
}

impl<S: Store> Dispatcher<S> {
    pub fn new(
        store: S,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        trigger: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            trigger,
        }
    }

    /// Run the dispatch loop until cancelled.
    pub async fn run(self, cancellation_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.dispatch_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(error) = self.tick().await {
                        error!(%error, "dispatch scan failed");
                    }
                }
                _ = cancellation_token.cancelled() => {
                    debug!("shutdown requested, stopping dispatcher");
                    return;
                }
            }
        }
    }

    /// One dispatch pass: scan for ready jobs and wake a worker per job.
    /// Returns the number of ready jobs seen.
    #[instrument(skip(self), fields(ready))]
    pub async fn tick(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let ready = self
            .store
            .ready_batch(now, self.config.dispatch_batch_size)
            .await?;

        tracing::Span::current().record("ready", ready.len());

        for _ in &ready {
            self.trigger.notify_one();
        }

        Ok(ready.len())
    }
}
