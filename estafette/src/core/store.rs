//! Storage contract for the job table.
//!
//! The store is the single serialization point: every mutation of a job row
//! goes through one of these operations, and the claim and conditional-update
//! operations are the atomic primitives the rest of the engine builds on.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Duration;
use rand::Rng;
use thiserror::Error;

use crate::core::job::{Job, JobChanges, JobStatus, NewJob};
use crate::core::DateTime;

/// Persistent job storage.
///
/// Implementations must guarantee that [`claim_next`](Store::claim_next)
/// transfers at most one row from `pending` to `processing` per call, atomically,
/// so that concurrent claims against the same backlog never return the same
/// job. [`conditional_update`](Store::conditional_update) must be a
/// compare-and-swap on `lock_key`: a worker whose lease was reclaimed reports
/// zero rows affected instead of overwriting another claimant's state.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new pending job, returning its store-assigned id.
    async fn insert(&self, job: NewJob) -> Result<i64, QueueError>;

    /// Fetch a job by id.
    async fn get(&self, id: i64) -> Result<Option<Job>, QueueError>;

    /// Unconditionally apply a field set to a job. Returns rows affected.
    async fn update(&self, id: i64, changes: JobChanges) -> Result<u64, QueueError>;

    /// Apply a field set only if the row still carries `lock_key`. Returns
    /// rows affected; zero means the lease was lost.
    async fn conditional_update(
        &self,
        id: i64,
        lock_key: &str,
        changes: JobChanges,
    ) -> Result<u64, QueueError>;

    /// Atomically elect and lock the next dispatchable job.
    ///
    /// The candidate is the pending job with `scheduled_at <= now` and no live
    /// lease, ordered by priority (ascending, 1 runs first), then
    /// `scheduled_at`, then id. On success the row is `processing` with
    /// `started_at = now`, the given `lock_key`, and a lease expiring at
    /// `now + lease`.
    async fn claim_next(
        &self,
        now: DateTime,
        lock_key: &str,
        lease: Duration,
    ) -> Result<Option<Job>, QueueError>;

    /// Pending jobs ready to run at `now`, in claim order, up to `limit`.
    /// Used by the dispatcher's scan; does not lock anything.
    async fn ready_batch(&self, now: DateTime, limit: u32) -> Result<Vec<Job>, QueueError>;

    /// Reset every `processing` row whose lease expired before `now` back to
    /// `pending` with the lock cleared. Returns the number of rows unlocked.
    async fn unlock_expired(&self, now: DateTime) -> Result<u64, QueueError>;

    /// Delete terminal rows of the given status completed before `cutoff`.
    /// Returns the number of rows deleted.
    async fn delete_older_than(
        &self,
        status: JobStatus,
        cutoff: DateTime,
    ) -> Result<u64, QueueError>;

    /// Delete a job regardless of status. Returns whether a row existed.
    async fn delete(&self, id: i64) -> Result<bool, QueueError>;

    /// List jobs, optionally filtered by status, newest first, up to `limit`.
    async fn list(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<Job>, QueueError>;

    /// Count jobs grouped by status. Statuses with no rows are absent.
    async fn count_by_status(&self) -> Result<HashMap<JobStatus, i64>, QueueError>;
}

/// Errors surfaced by queue operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QueueError {
    /// No handler is registered under the given job name.
    #[error("no handler registered for job '{job_name}'")]
    UnknownHandler { job_name: String },

    /// Failed to serialize a typed payload.
    #[error("failed to serialize payload for job '{job_name}': {error}")]
    Serialize {
        job_name: String,
        #[source]
        error: serde_json::Error,
    },

    /// Job not found.
    #[error("job {job_id} not found")]
    JobNotFound { job_id: i64 },

    /// Database or other backend error.
    #[error("database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl QueueError {
    pub fn unknown_handler(job_name: impl Into<String>) -> Self {
        Self::UnknownHandler {
            job_name: job_name.into(),
        }
    }

    pub fn serialize_error(job_name: impl Into<String>, error: serde_json::Error) -> Self {
        Self::Serialize {
            job_name: job_name.into(),
            error,
        }
    }

    pub fn job_not_found(job_id: i64) -> Self {
        Self::JobNotFound { job_id }
    }
}

/// Generate a fresh 128-bit lock key, hex-encoded.
///
/// The thread RNG is a CSPRNG, so keys are unguessable and collisions are not
/// a practical concern.
pub fn generate_lock_key() -> String {
    let token: u128 = rand::thread_rng().gen();
    format!("{token:032x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_32_hex_chars() {
        let key = generate_lock_key();
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn lock_keys_are_unique() {
        let a = generate_lock_key();
        let b = generate_lock_key();
        assert_ne!(a, b);
    }

    #[test]
    fn error_messages_name_the_job() {
        let error = QueueError::unknown_handler("send_email");
        assert!(error.to_string().contains("send_email"));

        let error = QueueError::job_not_found(42);
        assert!(error.to_string().contains("42"));
    }
}
