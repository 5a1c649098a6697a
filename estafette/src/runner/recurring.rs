//! Fixed-interval recurring producers.
//!
//! A recurring registration is an in-process timer task that re-enqueues the
//! same named job each period. Registrations are idempotent per job name and
//! are torn down with the engine (or individually via
//! [`Engine::unschedule_recurring`](crate::engine::Engine::unschedule_recurring)).

use std::time::Duration;

use bytes::Bytes;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::core::store::Store;
use crate::engine::{Engine, EnqueueOptions};

/// Cadence of a recurring job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurringInterval {
    Hourly,
    TwiceDaily,
    Daily,
}

impl RecurringInterval {
    pub fn period(&self) -> Duration {
        match self {
            RecurringInterval::Hourly => Duration::from_secs(60 * 60),
            RecurringInterval::TwiceDaily => Duration::from_secs(60 * 60 * 12),
            RecurringInterval::Daily => Duration::from_secs(60 * 60 * 24),
        }
    }
}

pub(crate) struct RecurringJob {
    pub job_name: String,
    pub payload: Bytes,
    pub interval: RecurringInterval,
    pub priority: i16,
}

/// Enqueue `job` once per period until cancelled. The first fire happens one
/// full period after registration.
pub(crate) async fn run<S>(
    engine: Engine<S>,
    job: RecurringJob,
    cancellation_token: CancellationToken,
) where
    S: Store + Clone + Send + Sync + 'static,
{
    let period = job.interval.period();

    loop {
        tokio::select! {
            _ = sleep(period) => {
                let options = EnqueueOptions::new().with_priority(job.priority);
                match engine
                    .enqueue_raw(&job.job_name, job.payload.clone(), options)
                    .await
                {
                    Ok(job_id) => {
                        debug!(job_name = %job.job_name, job_id, "enqueued recurring job");
                    }
                    Err(error) => {
                        error!(job_name = %job.job_name, %error, "failed to enqueue recurring job");
                    }
                }
            }
            _ = cancellation_token.cancelled() => {
                debug!(job_name = %job.job_name, "recurring producer stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periods() {
        assert_eq!(RecurringInterval::Hourly.period(), Duration::from_secs(3600));
        assert_eq!(
            RecurringInterval::TwiceDaily.period(),
            Duration::from_secs(43200)
        );
        assert_eq!(RecurringInterval::Daily.period(), Duration::from_secs(86400));
    }
}
