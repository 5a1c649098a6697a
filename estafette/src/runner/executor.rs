//! Runs claimed jobs and applies the outcome to the store.
//!
//! Every terminal write here is a compare-and-swap on the job's lock key. If
//! the lease was reclaimed while the handler ran (worker presumed crashed, or
//! the job was cancelled), the swap affects zero rows and the result of the
//! execution is discarded rather than overwriting another claimant's state.

use std::sync::Arc;

use chrono::Duration;
use tracing::{instrument, warn};

use crate::core::clock::Clock;
use crate::core::config::EngineConfig;
use crate::core::job::{Job, JobChanges};
use crate::core::registry::HandlerRegistry;
use crate::core::store::{QueueError, Store};

const BACKOFF_BASE_SECONDS: i64 = 60;

/// Reschedule delay after the given attempt number: `2^attempts × 60` seconds
/// (120 s after the first failure, doubling each attempt).
pub(crate) fn backoff_delay(attempts: i32) -> Duration {
    let exp = attempts.clamp(1, 30) as u32;
    Duration::seconds(BACKOFF_BASE_SECONDS << exp)
}

/// Executes one claimed job at a time: handler lookup, invocation, and the
/// completion / retry / terminal-failure transition.
pub struct Executor<S> {
    store: S,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl<S: Store> Executor<S> {
    pub fn new(
        store: S,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            config,
        }
    }

    /// Run a job previously returned by a claim and record the outcome.
    ///
    /// Handler failures never escape: they are persisted on the row and fed
    /// into the retry machinery. Only store errors propagate, for the caller
    /// to log.
    #[instrument(skip_all, err, fields(job_id = job.id, job_name = %job.job_name, retries = job.retries))]
    pub async fn execute(&self, job: Job) -> Result<(), QueueError> {
        let Some(lock_key) = job.lock_key.clone() else {
            warn!(job_id = job.id, "refusing to execute a job without a lease");
            return Ok(());
        };

        let Some(handler) = self.registry.get(&job.job_name) else {
            // A missing handler cannot heal by waiting; fail terminally with
            // the diagnostic on the row instead of burning retry attempts.
            let message = format!("no handler registered for job '{}'", job.job_name);
            let changes = JobChanges::failed(self.clock.now(), job.retries, message);
            self.finalize(&job, &lock_key, changes).await?;
            return Ok(());
        };

        match handler.handle(job.id, job.job_data.clone()).await {
            Ok(()) => {
                let changes = JobChanges::completed(self.clock.now());
                self.finalize(&job, &lock_key, changes).await
            }
            Err(error) => self.handle_failure(&job, &lock_key, error.to_string()).await,
        }
    }

    /// Record a failed attempt: reschedule with backoff while attempts
    /// remain, otherwise transition to terminal failure.
    pub async fn handle_failure(
        &self,
        job: &Job,
        lock_key: &str,
        message: String,
    ) -> Result<(), QueueError> {
        let attempts = job.retries + 1;
        let now = self.clock.now();

        let changes = if attempts < self.config.max_retries as i32 {
            let run_at = now + backoff_delay(attempts);
            warn!(
                job_id = job.id,
                attempts,
                run_at = %run_at,
                error = %message,
                "job failed, rescheduling"
            );
            JobChanges::rescheduled(run_at, attempts, message)
        } else {
            warn!(
                job_id = job.id,
                attempts,
                error = %message,
                "job failed permanently"
            );
            JobChanges::failed(now, attempts, message)
        };

        self.finalize(job, lock_key, changes).await
    }

    async fn finalize(
        &self,
        job: &Job,
        lock_key: &str,
        changes: JobChanges,
    ) -> Result<(), QueueError> {
        let rows = self
            .store
            .conditional_update(job.id, lock_key, changes)
            .await?;
        if rows == 0 {
            warn!(
                job_id = job.id,
                job_name = %job.job_name,
                "lease lost before the outcome could be recorded; discarding result"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_two_minutes() {
        assert_eq!(backoff_delay(1), Duration::seconds(120));
        assert_eq!(backoff_delay(2), Duration::seconds(240));
        assert_eq!(backoff_delay(3), Duration::seconds(480));
        assert_eq!(backoff_delay(4), Duration::seconds(960));
    }

    #[test]
    fn backoff_is_clamped_for_out_of_range_attempts() {
        assert_eq!(backoff_delay(0), Duration::seconds(120));
        assert_eq!(backoff_delay(-3), Duration::seconds(120));
        assert_eq!(backoff_delay(40), backoff_delay(30));
    }
}
