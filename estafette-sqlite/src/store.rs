use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Duration;
use estafette::core::job::{Job, JobChanges, JobStatus, NewJob};
use estafette::core::store::{QueueError, Store};
use estafette::core::DateTime;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::instrument;

use crate::types::{datetime_to_timestamp, JobRow};

/// An implementation of the Store backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    pub(crate) pool: SqlitePool,
}

impl SqliteStore {
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Render a field set as an UPDATE, optionally guarded by the lock key,
    /// and return the number of rows it touched.
    async fn apply_changes(
        &self,
        id: i64,
        lock_key: Option<&str>,
        changes: JobChanges,
    ) -> Result<u64, QueueError> {
        if changes.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("UPDATE estafette_jobs SET ");
        {
            let mut fields = builder.separated(", ");
            if let Some(status) = changes.status {
                fields.push("status = ");
                fields.push_bind_unseparated(status.as_str());
            }
            if let Some(scheduled_at) = changes.scheduled_at {
                fields.push("scheduled_at = ");
                fields.push_bind_unseparated(datetime_to_timestamp(scheduled_at));
            }
            if let Some(started_at) = changes.started_at {
                match started_at {
                    Some(at) => {
                        fields.push("started_at = ");
                        fields.push_bind_unseparated(datetime_to_timestamp(at));
                    }
                    None => {
                        fields.push("started_at = NULL");
                    }
                }
            }
            if let Some(completed_at) = changes.completed_at {
                match completed_at {
                    Some(at) => {
                        fields.push("completed_at = ");
                        fields.push_bind_unseparated(datetime_to_timestamp(at));
                    }
                    None => {
                        fields.push("completed_at = NULL");
                    }
                }
            }
            if let Some(retries) = changes.retries {
                fields.push("retries = ");
                fields.push_bind_unseparated(retries);
            }
            if let Some(error_message) = changes.error_message {
                match error_message {
                    Some(message) => {
                        fields.push("error_message = ");
                        fields.push_bind_unseparated(message);
                    }
                    None => {
                        fields.push("error_message = NULL");
                    }
                }
            }
            if let Some(lock_key) = changes.lock_key {
                match lock_key {
                    Some(key) => {
                        fields.push("lock_key = ");
                        fields.push_bind_unseparated(key);
                    }
                    None => {
                        fields.push("lock_key = NULL");
                    }
                }
            }
            if let Some(lock_expiration) = changes.lock_expiration {
                match lock_expiration {
                    Some(at) => {
                        fields.push("lock_expiration = ");
                        fields.push_bind_unseparated(datetime_to_timestamp(at));
                    }
                    None => {
                        fields.push("lock_expiration = NULL");
                    }
                }
            }
        }

        builder.push(" WHERE id = ");
        builder.push_bind(id);
        if let Some(key) = lock_key {
            builder.push(" AND lock_key = ");
            builder.push_bind(key.to_string());
        }

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .context("Failed to update job")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip_all, err, ret, fields(job_name = %job.job_name, priority = job.priority))]
    async fn insert(&self, job: NewJob) -> Result<i64, QueueError> {
        let result = sqlx::query(
            "INSERT INTO estafette_jobs (job_name, job_data, priority, status, created_at, scheduled_at, retries)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, 0)",
        )
        .bind(&job.job_name)
        .bind(job.job_data.as_ref())
        .bind(job.priority)
        .bind(datetime_to_timestamp(job.created_at))
        .bind(datetime_to_timestamp(job.scheduled_at))
        .execute(&self.pool)
        .await
        .context("Failed to add job to the queue")?;

        Ok(result.last_insert_rowid())
    }

    #[instrument(skip_all, err)]
    async fn get(&self, id: i64) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM estafette_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch job")?;
        Ok(row.map(|r| r.0))
    }

    #[instrument(skip_all, err)]
    async fn update(&self, id: i64, changes: JobChanges) -> Result<u64, QueueError> {
        self.apply_changes(id, None, changes).await
    }

    #[instrument(skip_all, err)]
    async fn conditional_update(
        &self,
        id: i64,
        lock_key: &str,
        changes: JobChanges,
    ) -> Result<u64, QueueError> {
        self.apply_changes(id, Some(lock_key), changes).await
    }

    #[instrument(skip_all, err)]
    async fn claim_next(
        &self,
        now: DateTime,
        lock_key: &str,
        lease: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let lease_until = now + lease;

        // Candidate election and lock installation in one statement, so
        // concurrent claimants can never pick the same row.
        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE estafette_jobs
             SET status = 'processing', started_at = ?1, lock_key = ?2, lock_expiration = ?3
             WHERE id = (
                 SELECT id FROM estafette_jobs
                 WHERE status = 'pending'
                   AND scheduled_at <= ?1
                   AND (lock_key IS NULL OR lock_expiration < ?1)
                 ORDER BY priority ASC, scheduled_at ASC, id ASC
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(datetime_to_timestamp(now))
        .bind(lock_key)
        .bind(datetime_to_timestamp(lease_until))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check out a job from the queue")?;

        Ok(row.map(|r| r.0))
    }

    #[instrument(skip_all, err)]
    async fn ready_batch(&self, now: DateTime, limit: u32) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM estafette_jobs
             WHERE status = 'pending' AND scheduled_at <= ?1
             ORDER BY priority ASC, scheduled_at ASC, id ASC
             LIMIT ?2",
        )
        .bind(datetime_to_timestamp(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to scan for ready jobs")?;

        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    #[instrument(skip_all, err, ret)]
    async fn unlock_expired(&self, now: DateTime) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "UPDATE estafette_jobs
             SET status = 'pending', lock_key = NULL, lock_expiration = NULL
             WHERE status = 'processing' AND lock_expiration < ?1",
        )
        .bind(datetime_to_timestamp(now))
        .execute(&self.pool)
        .await
        .context("Failed to unlock expired leases")?;

        Ok(result.rows_affected())
    }

    #[instrument(skip_all, err, ret, fields(status = %status))]
    async fn delete_older_than(
        &self,
        status: JobStatus,
        cutoff: DateTime,
    ) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "DELETE FROM estafette_jobs WHERE status = ?1 AND completed_at < ?2",
        )
        .bind(status.as_str())
        .bind(datetime_to_timestamp(cutoff))
        .execute(&self.pool)
        .await
        .context("Failed to prune old jobs")?;

        Ok(result.rows_affected())
    }

    #[instrument(skip_all, err)]
    async fn delete(&self, id: i64) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM estafette_jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to remove job from the queue")?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, err)]
    async fn list(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<Job>, QueueError> {
        let rows = if let Some(status) = status {
            sqlx::query_as::<_, JobRow>(
                "SELECT * FROM estafette_jobs WHERE status = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, JobRow>("SELECT * FROM estafette_jobs ORDER BY id DESC LIMIT ?1")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
        };

        let rows = rows.context("Failed to list jobs")?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    #[instrument(skip_all, err)]
    async fn count_by_status(&self) -> Result<HashMap<JobStatus, i64>, QueueError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM estafette_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .context("Failed to count jobs")?;

        let mut counts = HashMap::new();
        for (status_text, count) in rows {
            let status = status_text
                .parse::<JobStatus>()
                .map_err(anyhow::Error::from)?;
            counts.insert(status, count);
        }
        Ok(counts)
    }
}
