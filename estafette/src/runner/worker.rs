//! The claim loop.
//!
//! A worker repeatedly drains the backlog (claim, execute, finalize, claim
//! again) then sleeps until either the idle poll interval elapses (with a
//! little random jitter so a fleet of workers doesn't stampede the store) or
//! a nudge arrives from the dispatcher, an immediate high-priority enqueue,
//! or an admin retry.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::core::clock::Clock;
use crate::core::config::EngineConfig;
use crate::core::registry::HandlerRegistry;
use crate::core::store::{generate_lock_key, QueueError, Store};
use crate::runner::executor::Executor;

pub struct Worker<S> {
    store: S,
    executor: Executor<S>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    trigger: Arc<Notify>,
}

impl<S: Store + Clone> Worker<S> {
    pub fn new(
        store: S,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        trigger: Arc<Notify>,
    ) -> Self {
        let executor = Executor::new(store.clone(), registry, clock.clone(), config.clone());
        Self {
            store,
            executor,
            clock,
            config,
            trigger,
        }
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.config.poll_jitter.is_zero() {
            return self.config.poll_interval;
        }

        let jitter_millis = u64::try_from(self.config.poll_jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.config.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run until cancelled. Graceful shutdown simply stops claiming; a job in
    /// flight finishes its current attempt first.
    pub async fn run(self, cancellation_token: CancellationToken) {
        loop {
            self.drain().await;

            tokio::select! {
                _ = sleep(self.sleep_duration_with_jitter()) => {}
                _ = self.trigger.notified() => {
                    trace!("worker nudged");
                }
                _ = cancellation_token.cancelled() => {
                    debug!("shutdown requested, stopping worker");
                    return;
                }
            }
        }
    }

    /// Claim and execute jobs until the backlog has nothing eligible.
    pub async fn drain(&self) {
        loop {
            match self.claim_and_execute().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(error) => {
                    error!(%error, "worker failed against the store, backing off");
                    break;
                }
            }
        }
    }

    /// Claim the next eligible job and run it. Returns whether a job was
    /// claimed.
    pub async fn claim_and_execute(&self) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let lock_key = generate_lock_key();

        match self
            .store
            .claim_next(now, &lock_key, self.config.lease_duration())
            .await?
        {
            Some(job) => {
                self.executor.execute(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
