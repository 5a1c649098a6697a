#![doc = include_str!("../README.md")]

pub mod store;
pub mod types;

pub use store::SqliteStore;
use sqlx::migrate::Migrator;
pub static MIGRATOR: Migrator = sqlx::migrate!();

#[cfg(test)]
mod test {
    use crate::store::SqliteStore;
    use crate::MIGRATOR;
    use estafette::core::job::{JobStatus, NewJob};
    use estafette::core::store::{generate_lock_key, Store};
    use estafette::core::{Bytes, Duration, Utc};
    use estafette::{engine_spec, store_spec};
    use sqlx::SqlitePool;

    #[allow(dead_code)]
    pub fn setup_logger() {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .init();
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn store_smoke_test(pool: SqlitePool) {
        let store = SqliteStore::with_pool(pool);
        let now = store_spec::base_time();

        // Empty queue claims nothing.
        {
            let job = store
                .claim_next(now, &generate_lock_key(), Duration::seconds(300))
                .await
                .unwrap();
            assert!(job.is_none());
        }

        let id = store
            .insert(NewJob {
                job_name: "smoke".to_string(),
                job_data: Bytes::from_static(b"{}"),
                priority: 5,
                created_at: now,
                scheduled_at: now,
            })
            .await
            .unwrap();

        let job = store
            .claim_next(now, &generate_lock_key(), Duration::seconds(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Processing);

        // Claimed once means claimed for the duration of the lease.
        {
            let job = store
                .claim_next(now, &generate_lock_key(), Duration::seconds(300))
                .await
                .unwrap();
            assert!(job.is_none());
        }
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn migrations_define_the_expected_indices(pool: SqlitePool) {
        let indices: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'estafette_jobs' AND name LIKE 'idx_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        let names: Vec<&str> = indices.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "idx_estafette_jobs_dispatch",
                "idx_estafette_jobs_job_name",
                "idx_estafette_jobs_scheduled_at",
                "idx_estafette_jobs_status",
            ]
        );
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn rejects_overlong_job_names(pool: SqlitePool) {
        let store = SqliteStore::with_pool(pool);
        let result = store
            .insert(NewJob {
                job_name: "x".repeat(256),
                job_data: Bytes::from_static(b"{}"),
                priority: 5,
                created_at: Utc::now(),
                scheduled_at: Utc::now(),
            })
            .await;
        assert!(result.is_err());
    }

    // Store contract specs shared with other backends.

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn insert_and_get_round_trip(pool: SqlitePool) {
        store_spec::test_insert_and_get_round_trip(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn get_missing_returns_none(pool: SqlitePool) {
        store_spec::test_get_missing_returns_none(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn ids_are_monotonically_increasing(pool: SqlitePool) {
        store_spec::test_ids_are_monotonically_increasing(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn claim_transitions_to_processing(pool: SqlitePool) {
        store_spec::test_claim_transitions_to_processing(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn claim_returns_none_when_empty(pool: SqlitePool) {
        store_spec::test_claim_returns_none_when_empty(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn claim_honors_scheduled_at(pool: SqlitePool) {
        store_spec::test_claim_honors_scheduled_at(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn claim_orders_by_priority_then_schedule_then_id(pool: SqlitePool) {
        store_spec::test_claim_orders_by_priority_then_schedule_then_id(SqliteStore::with_pool(
            pool,
        ))
        .await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn claim_skips_rows_already_processing(pool: SqlitePool) {
        store_spec::test_claim_skips_rows_already_processing(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn claim_honors_leftover_lock_fields_on_pending_rows(pool: SqlitePool) {
        store_spec::test_claim_honors_leftover_lock_fields_on_pending_rows(SqliteStore::with_pool(
            pool,
        ))
        .await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn conditional_update_applies_with_matching_key(pool: SqlitePool) {
        store_spec::test_conditional_update_applies_with_matching_key(SqliteStore::with_pool(pool))
            .await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn conditional_update_ignores_stale_key(pool: SqlitePool) {
        store_spec::test_conditional_update_ignores_stale_key(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn update_is_unconditional(pool: SqlitePool) {
        store_spec::test_update_is_unconditional(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn unlock_expired_resets_only_expired_leases(pool: SqlitePool) {
        store_spec::test_unlock_expired_resets_only_expired_leases(SqliteStore::with_pool(pool))
            .await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn delete_older_than_filters_by_status_and_cutoff(pool: SqlitePool) {
        store_spec::test_delete_older_than_filters_by_status_and_cutoff(SqliteStore::with_pool(
            pool,
        ))
        .await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn delete_removes_any_status(pool: SqlitePool) {
        store_spec::test_delete_removes_any_status(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn list_filters_and_limits(pool: SqlitePool) {
        store_spec::test_list_filters_and_limits(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn count_by_status_groups(pool: SqlitePool) {
        store_spec::test_count_by_status_groups(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn ready_batch_orders_and_limits(pool: SqlitePool) {
        store_spec::test_ready_batch_orders_and_limits(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn concurrent_claims_elect_exactly_one_worker(pool: SqlitePool) {
        store_spec::test_concurrent_claims_elect_exactly_one_worker(SqliteStore::with_pool(pool))
            .await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn concurrent_claims_return_distinct_jobs(pool: SqlitePool) {
        store_spec::test_concurrent_claims_return_distinct_jobs(SqliteStore::with_pool(pool)).await;
    }

    // End-to-end engine specs over this backend.

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn enqueue_dispatch_complete(pool: SqlitePool) {
        engine_spec::test_enqueue_dispatch_complete(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn payload_round_trip(pool: SqlitePool) {
        engine_spec::test_payload_round_trip(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn priority_clamped_on_enqueue(pool: SqlitePool) {
        engine_spec::test_priority_clamped_on_enqueue(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn enqueue_unknown_handler_rejected(pool: SqlitePool) {
        engine_spec::test_enqueue_unknown_handler_rejected(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn delayed_enqueue_waits_for_schedule(pool: SqlitePool) {
        engine_spec::test_delayed_enqueue_waits_for_schedule(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn retry_then_succeed(pool: SqlitePool) {
        engine_spec::test_retry_then_succeed(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn permanent_failure(pool: SqlitePool) {
        engine_spec::test_permanent_failure(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn crash_recovery(pool: SqlitePool) {
        engine_spec::test_crash_recovery(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn reaper_prunes_terminal_rows(pool: SqlitePool) {
        engine_spec::test_reaper_prunes_terminal_rows(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn unknown_handler_at_execute_fails_terminally(pool: SqlitePool) {
        engine_spec::test_unknown_handler_at_execute_fails_terminally(SqliteStore::with_pool(pool))
            .await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn undecodable_payload_follows_retry_path(pool: SqlitePool) {
        engine_spec::test_undecodable_payload_follows_retry_path(SqliteStore::with_pool(pool))
            .await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn admin_retry_resets_job(pool: SqlitePool) {
        engine_spec::test_admin_retry_resets_job(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn cancel_deletes_processing_job(pool: SqlitePool) {
        engine_spec::test_cancel_deletes_processing_job(SqliteStore::with_pool(pool)).await;
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    async fn recurring_registration_is_idempotent(pool: SqlitePool) {
        engine_spec::test_recurring_registration_is_idempotent(SqliteStore::with_pool(pool)).await;
    }
}
