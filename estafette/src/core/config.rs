use std::time::Duration;

/// Tuning knobs for the engine.
///
/// The defaults are production values; tests typically shrink the intervals
/// or drive the components directly instead.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct EngineConfig {
    /// Attempts after which a failing job becomes terminally `failed`
    /// (default: 5).
    pub max_retries: u32,

    /// How long a claim's lease lasts before the reaper may reclaim it
    /// (default: 300 seconds).
    pub lease_duration_seconds: u64,

    /// How many ready jobs a dispatcher tick nudges workers about
    /// (default: 10).
    pub dispatch_batch_size: u32,

    /// Days a `completed` job is kept before pruning (default: 7).
    pub completed_retention_days: u32,

    /// Days a `failed` job is kept before pruning (default: 30).
    pub failed_retention_days: u32,

    /// Priority at or below which an immediate enqueue nudges a worker right
    /// away instead of waiting for the next dispatch tick (default: 3).
    pub high_priority_threshold: i16,

    /// Number of worker tasks started by the engine (default: 4).
    pub worker_count: usize,

    /// How often the dispatcher scans for ready jobs (default: 60 seconds).
    pub dispatch_interval: Duration,

    /// How often the reaper reclaims expired leases and prunes terminal rows
    /// (default: 24 hours).
    pub reap_interval: Duration,

    /// Idle worker fallback poll interval (default: 1 second).
    pub poll_interval: Duration,

    /// Maximum random jitter added to the idle poll, spreading out claim
    /// attempts across workers (default: 100 ms).
    pub poll_jitter: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            lease_duration_seconds: 300,
            dispatch_batch_size: 10,
            completed_retention_days: 7,
            failed_retention_days: 30,
            high_priority_threshold: 3,
            worker_count: 4,
            dispatch_interval: Duration::from_secs(60),
            reap_interval: Duration::from_secs(60 * 60 * 24),
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    /// Lease duration as a chrono duration, for schedule arithmetic.
    pub(crate) fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_duration_seconds as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.lease_duration_seconds, 300);
        assert_eq!(config.dispatch_batch_size, 10);
        assert_eq!(config.completed_retention_days, 7);
        assert_eq!(config.failed_retention_days, 30);
        assert_eq!(config.high_priority_threshold, 3);
        assert_eq!(config.dispatch_interval, Duration::from_secs(60));
    }
}
