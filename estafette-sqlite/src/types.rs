use bytes::Bytes;
use estafette::core::job::{Job, JobStatus};
use estafette::core::DateTime;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

// Helper to convert a SQLite INTEGER (Unix timestamp in milliseconds) to DateTime
pub(crate) fn timestamp_to_datetime(ts_ms: i64) -> Option<DateTime> {
    DateTime::from_timestamp_millis(ts_ms)
}

// Helper to convert a DateTime to a SQLite INTEGER (Unix timestamp in milliseconds)
pub(crate) fn datetime_to_timestamp(dt: DateTime) -> i64 {
    dt.timestamp_millis()
}

fn decode_timestamp(column: &str, ts_ms: i64) -> Result<DateTime, sqlx::Error> {
    timestamp_to_datetime(ts_ms).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("timestamp {ts_ms} out of range").into(),
    })
}

fn required_timestamp(row: &SqliteRow, column: &str) -> Result<DateTime, sqlx::Error> {
    decode_timestamp(column, row.try_get(column)?)
}

fn optional_timestamp(row: &SqliteRow, column: &str) -> Result<Option<DateTime>, sqlx::Error> {
    row.try_get::<Option<i64>, _>(column)?
        .map(|ts_ms| decode_timestamp(column, ts_ms))
        .transpose()
}

/// A decoded row from `estafette_jobs`.
pub(crate) struct JobRow(pub(crate) Job);

impl FromRow<'_, SqliteRow> for JobRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status = row
            .try_get::<String, _>("status")?
            .parse::<JobStatus>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: Box::new(e),
            })?;

        Ok(Self(Job {
            id: row.try_get("id")?,
            job_name: row.try_get("job_name")?,
            job_data: Bytes::from(row.try_get::<Vec<u8>, _>("job_data")?),
            priority: row.try_get("priority")?,
            status,
            created_at: required_timestamp(row, "created_at")?,
            scheduled_at: required_timestamp(row, "scheduled_at")?,
            started_at: optional_timestamp(row, "started_at")?,
            completed_at: optional_timestamp(row, "completed_at")?,
            retries: row.try_get("retries")?,
            error_message: row.try_get("error_message")?,
            lock_key: row.try_get("lock_key")?,
            lock_expiration: optional_timestamp(row, "lock_expiration")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use estafette::core::Utc;

    #[test]
    fn timestamps_round_trip_at_millisecond_precision() {
        let dt = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let ts = datetime_to_timestamp(dt);
        assert_eq!(timestamp_to_datetime(ts), Some(dt));
    }

    #[test]
    fn out_of_range_timestamp_is_rejected() {
        assert!(timestamp_to_datetime(i64::MAX).is_none());
    }
}
