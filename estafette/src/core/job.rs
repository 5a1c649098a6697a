use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::DateTime;

/// Lowest allowed priority value (least urgent).
pub const PRIORITY_MIN: i16 = 1;

/// Highest allowed priority value (most urgent; sorts first).
pub const PRIORITY_MAX: i16 = 10;

/// Lifecycle state of a job.
///
/// `Completed` and `Failed` are terminal. A `Processing` job always carries a
/// lock key and lease expiration; a `Pending` job never does (except in the
/// window between a lease expiring and the next reaper pass).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// The canonical storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognized status string.
#[derive(Error, Debug)]
#[error("unknown job status '{0}'")]
pub struct ParseJobStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ParseJobStatusError(other.to_string())),
        }
    }
}

/// A persisted unit of deferred work.
///
/// The payload is opaque to the queue; decoding happens inside the handler
/// binding. `id` is assigned by the store on insert and is immutable, as is
/// `job_name`.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub job_name: String,
    pub job_data: Bytes,
    pub priority: i16,
    pub status: JobStatus,
    pub created_at: DateTime,
    pub scheduled_at: DateTime,
    pub started_at: Option<DateTime>,
    pub completed_at: Option<DateTime>,
    pub retries: i32,
    pub error_message: Option<String>,
    pub lock_key: Option<String>,
    pub lock_expiration: Option<DateTime>,
}

/// The insertable subset of a job. The store fills in `id` and the initial
/// `pending` status.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_name: String,
    pub job_data: Bytes,
    pub priority: i16,
    pub created_at: DateTime,
    pub scheduled_at: DateTime,
}

/// A partial update to a job row.
///
/// `None` leaves the column untouched; for nullable columns, `Some(None)`
/// writes NULL. Constructors cover the transitions the engine performs so
/// call sites never assemble field sets by hand.
#[derive(Debug, Clone, Default)]
pub struct JobChanges {
    pub status: Option<JobStatus>,
    pub scheduled_at: Option<DateTime>,
    pub started_at: Option<Option<DateTime>>,
    pub completed_at: Option<Option<DateTime>>,
    pub retries: Option<i32>,
    pub error_message: Option<Option<String>>,
    pub lock_key: Option<Option<String>>,
    pub lock_expiration: Option<Option<DateTime>>,
}

impl JobChanges {
    /// True when no column would be written.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.scheduled_at.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
            && self.retries.is_none()
            && self.error_message.is_none()
            && self.lock_key.is_none()
            && self.lock_expiration.is_none()
    }

    /// Successful terminal transition: completed, lock released.
    pub fn completed(now: DateTime) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            completed_at: Some(Some(now)),
            error_message: Some(None),
            lock_key: Some(None),
            lock_expiration: Some(None),
            ..Self::default()
        }
    }

    /// Transient failure: back to pending at a later time with the attempt
    /// counted and the failure reason recorded.
    pub fn rescheduled(run_at: DateTime, retries: i32, error: String) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            scheduled_at: Some(run_at),
            retries: Some(retries),
            error_message: Some(Some(error)),
            lock_key: Some(None),
            lock_expiration: Some(None),
            ..Self::default()
        }
    }

    /// Permanent failure: terminal, lock released, reason recorded.
    pub fn failed(now: DateTime, retries: i32, error: String) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            completed_at: Some(Some(now)),
            retries: Some(retries),
            error_message: Some(Some(error)),
            lock_key: Some(None),
            lock_expiration: Some(None),
            ..Self::default()
        }
    }

    /// Operator-initiated reset: fresh pending job, ready to run now.
    pub fn retry_reset(now: DateTime) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            scheduled_at: Some(now),
            started_at: Some(None),
            completed_at: Some(None),
            retries: Some(0),
            error_message: Some(None),
            lock_key: Some(None),
            lock_expiration: Some(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn status_rejects_unknown_values() {
        assert!("archived".parse::<JobStatus>().is_err());
        assert!("".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn completed_changes_release_the_lock() {
        let changes = JobChanges::completed(Utc::now());
        assert_eq!(changes.status, Some(JobStatus::Completed));
        assert_eq!(changes.lock_key, Some(None));
        assert_eq!(changes.lock_expiration, Some(None));
        assert!(changes.completed_at.is_some());
        assert!(changes.retries.is_none());
    }

    #[test]
    fn rescheduled_changes_count_the_attempt() {
        let run_at = Utc::now();
        let changes = JobChanges::rescheduled(run_at, 3, "boom".into());
        assert_eq!(changes.status, Some(JobStatus::Pending));
        assert_eq!(changes.scheduled_at, Some(run_at));
        assert_eq!(changes.retries, Some(3));
        assert_eq!(changes.error_message, Some(Some("boom".into())));
        assert_eq!(changes.lock_key, Some(None));
    }

    #[test]
    fn retry_reset_clears_everything() {
        let changes = JobChanges::retry_reset(Utc::now());
        assert_eq!(changes.retries, Some(0));
        assert_eq!(changes.error_message, Some(None));
        assert_eq!(changes.started_at, Some(None));
        assert_eq!(changes.completed_at, Some(None));
        assert_eq!(changes.lock_key, Some(None));
        assert!(!changes.is_empty());
    }

    #[test]
    fn default_changes_are_empty() {
        assert!(JobChanges::default().is_empty());
    }
}
