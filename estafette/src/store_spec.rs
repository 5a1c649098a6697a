//! Shared test specifications for Store implementations.
//!
//! These test functions can be called by any backend to ensure consistent
//! behavior across all implementations.

use std::collections::HashSet;

use bytes::Bytes;
use chrono::{Duration, TimeZone};

use crate::core::job::{JobChanges, JobStatus, NewJob};
use crate::core::store::{generate_lock_key, Store};
use crate::core::{DateTime, Utc};

/// A fixed, millisecond-exact base time so values survive the round trip
/// through integer-timestamp columns.
pub fn base_time() -> DateTime {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn new_job(job_name: &str, priority: i16, scheduled_at: DateTime) -> NewJob {
    NewJob {
        job_name: job_name.to_string(),
        job_data: Bytes::from_static(b"{\"x\":1}"),
        priority,
        created_at: base_time(),
        scheduled_at,
    }
}

pub async fn test_insert_and_get_round_trip<S: Store>(store: S) {
    let t0 = base_time();
    // Arbitrary bytes, deliberately not valid JSON: the store must not care.
    let payload = Bytes::from_static(&[0x00, 0xFF, 0x7F, 0x42]);

    let id = store
        .insert(NewJob {
            job_name: "blob_job".to_string(),
            job_data: payload.clone(),
            priority: 7,
            created_at: t0,
            scheduled_at: t0 + Duration::seconds(30),
        })
        .await
        .unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.job_name, "blob_job");
    assert_eq!(job.job_data, payload);
    assert_eq!(job.priority, 7);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.created_at, t0);
    assert_eq!(job.scheduled_at, t0 + Duration::seconds(30));
    assert_eq!(job.retries, 0);
    assert!(job.started_at.is_none());
    assert!(job.completed_at.is_none());
    assert!(job.error_message.is_none());
    assert!(job.lock_key.is_none());
    assert!(job.lock_expiration.is_none());
}

pub async fn test_get_missing_returns_none<S: Store>(store: S) {
    assert!(store.get(123456).await.unwrap().is_none());
}

pub async fn test_ids_are_monotonically_increasing<S: Store>(store: S) {
    let t0 = base_time();
    let a = store.insert(new_job("first", 5, t0)).await.unwrap();
    let b = store.insert(new_job("second", 5, t0)).await.unwrap();
    let c = store.insert(new_job("third", 5, t0)).await.unwrap();
    assert!(a < b && b < c);
}

pub async fn test_claim_transitions_to_processing<S: Store>(store: S) {
    let t0 = base_time();
    let id = store.insert(new_job("work", 5, t0)).await.unwrap();

    let now = t0 + Duration::seconds(1);
    let lock_key = generate_lock_key();
    let claimed = store
        .claim_next(now, &lock_key, Duration::seconds(300))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, JobStatus::Processing);
    assert_eq!(claimed.started_at, Some(now));
    assert_eq!(claimed.lock_key.as_deref(), Some(lock_key.as_str()));
    assert_eq!(claimed.lock_expiration, Some(now + Duration::seconds(300)));

    // Persisted state matches what the claim returned.
    let stored = store.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Processing);
    assert_eq!(stored.lock_key.as_deref(), Some(lock_key.as_str()));
}

pub async fn test_claim_returns_none_when_empty<S: Store>(store: S) {
    let claimed = store
        .claim_next(base_time(), &generate_lock_key(), Duration::seconds(300))
        .await
        .unwrap();
    assert!(claimed.is_none());
}

pub async fn test_claim_honors_scheduled_at<S: Store>(store: S) {
    let t0 = base_time();
    let id = store
        .insert(new_job("later", 1, t0 + Duration::hours(1)))
        .await
        .unwrap();

    let early = store
        .claim_next(t0, &generate_lock_key(), Duration::seconds(300))
        .await
        .unwrap();
    assert!(early.is_none());

    let on_time = store
        .claim_next(
            t0 + Duration::hours(1),
            &generate_lock_key(),
            Duration::seconds(300),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(on_time.id, id);
}

pub async fn test_claim_orders_by_priority_then_schedule_then_id<S: Store>(store: S) {
    let t0 = base_time();
    let low = store.insert(new_job("low", 5, t0)).await.unwrap();
    let urgent_late = store
        .insert(new_job("urgent_late", 1, t0 + Duration::seconds(1)))
        .await
        .unwrap();
    let urgent_early_a = store.insert(new_job("urgent_early", 1, t0)).await.unwrap();
    let urgent_early_b = store.insert(new_job("urgent_early", 1, t0)).await.unwrap();

    let now = t0 + Duration::minutes(1);
    let mut order = Vec::new();
    while let Some(job) = store
        .claim_next(now, &generate_lock_key(), Duration::seconds(300))
        .await
        .unwrap()
    {
        order.push(job.id);
    }

    // Priority 1 first; among those, earliest schedule, then lowest id.
    assert_eq!(order, vec![urgent_early_a, urgent_early_b, urgent_late, low]);
}

pub async fn test_claim_skips_rows_already_processing<S: Store>(store: S) {
    let t0 = base_time();
    store.insert(new_job("once", 5, t0)).await.unwrap();

    let first = store
        .claim_next(t0, &generate_lock_key(), Duration::seconds(300))
        .await
        .unwrap();
    assert!(first.is_some());

    let second = store
        .claim_next(t0, &generate_lock_key(), Duration::seconds(300))
        .await
        .unwrap();
    assert!(second.is_none());
}

pub async fn test_claim_honors_leftover_lock_fields_on_pending_rows<S: Store>(store: S) {
    let t0 = base_time();

    // A pending row can transiently carry lock fields between reaper passes.
    // An expired leftover lock must not block the claim; a live one must.
    let stale = store.insert(new_job("stale_lock", 5, t0)).await.unwrap();
    let rows = store
        .update(
            stale,
            JobChanges {
                lock_key: Some(Some(generate_lock_key())),
                lock_expiration: Some(Some(t0 - Duration::seconds(1))),
                ..JobChanges::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let claimed = store
        .claim_next(t0, &generate_lock_key(), Duration::seconds(300))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, stale);

    let live = store.insert(new_job("live_lock", 5, t0)).await.unwrap();
    store
        .update(
            live,
            JobChanges {
                lock_key: Some(Some(generate_lock_key())),
                lock_expiration: Some(Some(t0 + Duration::hours(1))),
                ..JobChanges::default()
            },
        )
        .await
        .unwrap();

    let blocked = store
        .claim_next(t0, &generate_lock_key(), Duration::seconds(300))
        .await
        .unwrap();
    assert!(blocked.is_none());
}

pub async fn test_conditional_update_applies_with_matching_key<S: Store>(store: S) {
    let t0 = base_time();
    let id = store.insert(new_job("cas", 5, t0)).await.unwrap();

    let lock_key = generate_lock_key();
    store
        .claim_next(t0, &lock_key, Duration::seconds(300))
        .await
        .unwrap()
        .unwrap();

    let rows = store
        .conditional_update(id, &lock_key, JobChanges::completed(t0 + Duration::seconds(5)))
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_at, Some(t0 + Duration::seconds(5)));
    assert!(job.lock_key.is_none());
    assert!(job.lock_expiration.is_none());
}

pub async fn test_conditional_update_ignores_stale_key<S: Store>(store: S) {
    let t0 = base_time();
    let id = store.insert(new_job("cas_stale", 5, t0)).await.unwrap();

    let original_key = generate_lock_key();
    store
        .claim_next(t0, &original_key, Duration::seconds(300))
        .await
        .unwrap()
        .unwrap();

    // The lease is reclaimed and a second worker takes over.
    store.unlock_expired(t0 + Duration::seconds(301)).await.unwrap();
    let second_key = generate_lock_key();
    store
        .claim_next(t0 + Duration::seconds(301), &second_key, Duration::seconds(300))
        .await
        .unwrap()
        .unwrap();

    // The first worker finally reports; its write must not land.
    let rows = store
        .conditional_update(
            id,
            &original_key,
            JobChanges::completed(t0 + Duration::seconds(302)),
        )
        .await
        .unwrap();
    assert_eq!(rows, 0);

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.lock_key.as_deref(), Some(second_key.as_str()));
}

pub async fn test_update_is_unconditional<S: Store>(store: S) {
    let t0 = base_time();
    let id = store.insert(new_job("plain", 5, t0)).await.unwrap();

    let rows = store
        .update(
            id,
            JobChanges {
                retries: Some(3),
                error_message: Some(Some("injected".to_string())),
                ..JobChanges::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.retries, 3);
    assert_eq!(job.error_message.as_deref(), Some("injected"));

    let missing = store
        .update(id + 1000, JobChanges::retry_reset(t0))
        .await
        .unwrap();
    assert_eq!(missing, 0);
}

pub async fn test_unlock_expired_resets_only_expired_leases<S: Store>(store: S) {
    let t0 = base_time();
    let expired = store.insert(new_job("expired", 5, t0)).await.unwrap();
    store
        .claim_next(t0, &generate_lock_key(), Duration::seconds(300))
        .await
        .unwrap()
        .unwrap();

    let live = store.insert(new_job("live", 5, t0)).await.unwrap();
    let live_key = generate_lock_key();
    store
        .claim_next(t0 + Duration::seconds(200), &live_key, Duration::seconds(300))
        .await
        .unwrap()
        .unwrap();

    // t0 + 301: the first lease (expires t0+300) is stale, the second is not.
    let unlocked = store.unlock_expired(t0 + Duration::seconds(301)).await.unwrap();
    assert_eq!(unlocked, 1);

    let reclaimed = store.get(expired).await.unwrap().unwrap();
    assert_eq!(reclaimed.status, JobStatus::Pending);
    assert!(reclaimed.lock_key.is_none());
    assert!(reclaimed.lock_expiration.is_none());
    assert_eq!(reclaimed.retries, 0);

    let untouched = store.get(live).await.unwrap().unwrap();
    assert_eq!(untouched.status, JobStatus::Processing);
    assert_eq!(untouched.lock_key.as_deref(), Some(live_key.as_str()));
}

pub async fn test_delete_older_than_filters_by_status_and_cutoff<S: Store>(store: S) {
    let t0 = base_time();

    let old_completed = store.insert(new_job("old_done", 5, t0)).await.unwrap();
    store
        .update(old_completed, JobChanges::completed(t0 - Duration::days(10)))
        .await
        .unwrap();

    let fresh_completed = store.insert(new_job("fresh_done", 5, t0)).await.unwrap();
    store
        .update(fresh_completed, JobChanges::completed(t0 - Duration::days(1)))
        .await
        .unwrap();

    let old_failed = store.insert(new_job("old_failed", 5, t0)).await.unwrap();
    store
        .update(
            old_failed,
            JobChanges::failed(t0 - Duration::days(10), 5, "gone".to_string()),
        )
        .await
        .unwrap();

    let deleted = store
        .delete_older_than(JobStatus::Completed, t0 - Duration::days(7))
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    assert!(store.get(old_completed).await.unwrap().is_none());
    assert!(store.get(fresh_completed).await.unwrap().is_some());
    // Failed rows are a separate retention class.
    assert!(store.get(old_failed).await.unwrap().is_some());
}

pub async fn test_delete_removes_any_status<S: Store>(store: S) {
    let t0 = base_time();
    let id = store.insert(new_job("doomed", 5, t0)).await.unwrap();
    store
        .claim_next(t0, &generate_lock_key(), Duration::seconds(300))
        .await
        .unwrap()
        .unwrap();

    assert!(store.delete(id).await.unwrap());
    assert!(store.get(id).await.unwrap().is_none());
    assert!(!store.delete(id).await.unwrap());
}

pub async fn test_list_filters_and_limits<S: Store>(store: S) {
    let t0 = base_time();
    for i in 0..3 {
        store
            .insert(new_job("pending_job", 5, t0 + Duration::seconds(i)))
            .await
            .unwrap();
    }
    let done = store.insert(new_job("done_job", 5, t0)).await.unwrap();
    store.update(done, JobChanges::completed(t0)).await.unwrap();

    let all = store.list(None, 100).await.unwrap();
    assert_eq!(all.len(), 4);

    let pending = store.list(Some(JobStatus::Pending), 100).await.unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|j| j.status == JobStatus::Pending));

    let limited = store.list(Some(JobStatus::Pending), 2).await.unwrap();
    assert_eq!(limited.len(), 2);
}

pub async fn test_count_by_status_groups<S: Store>(store: S) {
    let t0 = base_time();
    for _ in 0..2 {
        store.insert(new_job("p", 5, t0)).await.unwrap();
    }
    let done = store.insert(new_job("c", 5, t0)).await.unwrap();
    store.update(done, JobChanges::completed(t0)).await.unwrap();

    let counts = store.count_by_status().await.unwrap();
    assert_eq!(counts.get(&JobStatus::Pending), Some(&2));
    assert_eq!(counts.get(&JobStatus::Completed), Some(&1));
    assert_eq!(counts.get(&JobStatus::Failed), None);
}

pub async fn test_ready_batch_orders_and_limits<S: Store>(store: S) {
    let t0 = base_time();
    let urgent = store.insert(new_job("urgent", 1, t0)).await.unwrap();
    let normal = store.insert(new_job("normal", 5, t0)).await.unwrap();
    store
        .insert(new_job("future", 1, t0 + Duration::hours(1)))
        .await
        .unwrap();

    let ready = store.ready_batch(t0, 10).await.unwrap();
    assert_eq!(
        ready.iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![urgent, normal]
    );

    let capped = store.ready_batch(t0, 1).await.unwrap();
    assert_eq!(capped.len(), 1);
    assert_eq!(capped[0].id, urgent);
}

/// Many concurrent claimants against a single job: exactly one wins.
pub async fn test_concurrent_claims_elect_exactly_one_worker<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    let t0 = base_time();
    let id = store.insert(new_job("contested", 1, t0)).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store
                .claim_next(t0, &generate_lock_key(), Duration::seconds(300))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if let Some(job) = task.await.unwrap() {
            assert_eq!(job.id, id);
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

/// Concurrent claimants against a backlog: every claim is a distinct job.
pub async fn test_concurrent_claims_return_distinct_jobs<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    let t0 = base_time();
    for _ in 0..5 {
        store.insert(new_job("bulk", 5, t0)).await.unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store
                .claim_next(t0, &generate_lock_key(), Duration::seconds(300))
                .await
                .unwrap()
        }));
    }

    let mut claimed = HashSet::new();
    for task in tasks {
        if let Some(job) = task.await.unwrap() {
            assert!(claimed.insert(job.id), "job {} claimed twice", job.id);
        }
    }
    assert_eq!(claimed.len(), 5);
}
