//! Shared end-to-end test specifications: engine + runtime over a real store,
//! driven deterministically with a manual clock.
//!
//! Backend tests call these functions with their store instance. The dispatch
//! and maintenance loops are stepped directly (`tick`, `sweep`, `drain`)
//! instead of waiting on timers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, TimeZone};
use serde::{Deserialize, Serialize};

use crate::core::clock::Clock;

use crate::core::clock::ManualClock;
use crate::core::config::EngineConfig;
use crate::core::handler::JobHandler;
use crate::core::job::JobStatus;
use crate::core::registry::HandlerRegistry;
use crate::core::store::{generate_lock_key, QueueError, Store};
use crate::core::{DateTime, Utc};
use crate::engine::{Engine, EnqueueOptions};
use crate::runner::recurring::RecurringInterval;

fn start_time() -> DateTime {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GreetingPayload {
    pub x: i32,
}

struct HelloJob {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl JobHandler for HelloJob {
    type Payload = GreetingPayload;
    type Error = anyhow::Error;

    fn name() -> &'static str {
        "hello"
    }

    async fn handle(&self, _job_id: i64, _payload: Self::Payload) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails the first `fail_first` invocations, then succeeds.
struct FlakyJob {
    calls: Arc<AtomicU32>,
    fail_first: u32,
}

#[async_trait]
impl JobHandler for FlakyJob {
    type Payload = GreetingPayload;
    type Error = anyhow::Error;

    fn name() -> &'static str {
        "flaky"
    }

    async fn handle(&self, _job_id: i64, _payload: Self::Payload) -> anyhow::Result<()> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            anyhow::bail!("transient outage");
        }
        Ok(())
    }
}

struct DoomedJob {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl JobHandler for DoomedJob {
    type Payload = GreetingPayload;
    type Error = anyhow::Error;

    fn name() -> &'static str {
        "doomed"
    }

    async fn handle(&self, _job_id: i64, _payload: Self::Payload) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("handler exploded")
    }
}

struct Setup<S> {
    engine: Engine<S>,
    clock: Arc<ManualClock>,
    calls: Arc<AtomicU32>,
}

fn setup<S, F>(store: S, register: F) -> Setup<S>
where
    S: Store + Clone + Send + Sync + 'static,
    F: FnOnce(&mut HandlerRegistry, Arc<AtomicU32>),
{
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = HandlerRegistry::default();
    register(&mut registry, calls.clone());

    let clock = Arc::new(ManualClock::new(start_time()));
    let engine = Engine::with_clock(store, registry, EngineConfig::default(), clock.clone());

    Setup {
        engine,
        clock,
        calls,
    }
}

fn hello_setup<S>(store: S) -> Setup<S>
where
    S: Store + Clone + Send + Sync + 'static,
{
    setup(store, |registry, calls| registry.add_handler(HelloJob { calls }))
}

/// Enqueue, dispatch, execute: the whole happy path.
pub async fn test_enqueue_dispatch_complete<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    let Setup {
        engine,
        clock,
        calls,
    } = hello_setup(store);

    let id = engine
        .enqueue::<HelloJob>(GreetingPayload { x: 1 }, EnqueueOptions::new())
        .await
        .unwrap();

    let job = engine.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let ready = engine.dispatcher().tick().await.unwrap();
    assert_eq!(ready, 1);
    engine.worker().drain().await;

    let job = engine.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.started_at, Some(clock.now()));
    assert_eq!(job.completed_at, Some(clock.now()));
    assert!(job.error_message.is_none());
    assert!(job.lock_key.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Typed payloads survive the trip through the store byte-for-byte.
pub async fn test_payload_round_trip<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    let Setup { engine, .. } = hello_setup(store);

    let payload = GreetingPayload { x: -17 };
    let id = engine
        .enqueue::<HelloJob>(payload.clone(), EnqueueOptions::new())
        .await
        .unwrap();

    let job = engine.get_job(id).await.unwrap().unwrap();
    let decoded: GreetingPayload = serde_json::from_slice(&job.job_data).unwrap();
    assert_eq!(decoded, payload);
}

/// Priority is clamped into [1, 10] on insert.
pub async fn test_priority_clamped_on_enqueue<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    let Setup { engine, .. } = hello_setup(store);

    let too_low = engine
        .enqueue::<HelloJob>(
            GreetingPayload { x: 0 },
            EnqueueOptions::new().with_priority(0),
        )
        .await
        .unwrap();
    assert_eq!(engine.get_job(too_low).await.unwrap().unwrap().priority, 1);

    let too_high = engine
        .enqueue::<HelloJob>(
            GreetingPayload { x: 0 },
            EnqueueOptions::new().with_priority(99),
        )
        .await
        .unwrap();
    assert_eq!(engine.get_job(too_high).await.unwrap().unwrap().priority, 10);
}

/// Enqueuing a name nobody registered is rejected up front.
pub async fn test_enqueue_unknown_handler_rejected<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    let Setup { engine, .. } = hello_setup(store);

    let result = engine
        .enqueue_raw("nobody_home", Bytes::from_static(b"{}"), EnqueueOptions::new())
        .await;
    assert!(matches!(
        result,
        Err(QueueError::UnknownHandler { job_name }) if job_name == "nobody_home"
    ));
}

/// A delayed job only becomes claimable once the clock reaches its schedule.
pub async fn test_delayed_enqueue_waits_for_schedule<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    let Setup {
        engine,
        clock,
        calls,
    } = hello_setup(store);

    let id = engine
        .enqueue::<HelloJob>(
            GreetingPayload { x: 1 },
            EnqueueOptions::new().with_delay_seconds(600),
        )
        .await
        .unwrap();

    engine.worker().drain().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        engine.get_job(id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );

    clock.advance(Duration::seconds(600));
    engine.worker().drain().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        engine.get_job(id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

/// Two transient failures, then success: backoff doubles and the retry count
/// sticks at two.
pub async fn test_retry_then_succeed<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    let Setup {
        engine,
        clock,
        calls,
    } = setup(store, |registry, calls| {
        registry.add_handler(FlakyJob {
            calls,
            fail_first: 2,
        })
    });
    let t0 = clock.now();

    let id = engine
        .enqueue::<FlakyJob>(GreetingPayload { x: 1 }, EnqueueOptions::new())
        .await
        .unwrap();

    // First attempt fails: rescheduled 120 s out.
    engine.worker().drain().await;
    let job = engine.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retries, 1);
    assert_eq!(job.scheduled_at, t0 + Duration::seconds(120));
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("transient outage"));

    // Second attempt fails: rescheduled a further 240 s out.
    clock.advance(Duration::seconds(120));
    engine.worker().drain().await;
    let job = engine.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retries, 2);
    assert_eq!(job.scheduled_at, t0 + Duration::seconds(120 + 240));

    // Third attempt succeeds.
    clock.advance(Duration::seconds(240));
    engine.worker().drain().await;
    let job = engine.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retries, 2);
    assert!(job.error_message.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

/// A handler that never succeeds exhausts its attempts and lands in `failed`.
pub async fn test_permanent_failure<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    let Setup {
        engine,
        clock,
        calls,
    } = setup(store, |registry, calls| {
        registry.add_handler(DoomedJob { calls })
    });

    let id = engine
        .enqueue::<DoomedJob>(GreetingPayload { x: 1 }, EnqueueOptions::new())
        .await
        .unwrap();

    // Five attempts; the longest backoff between them is 960 s.
    for _ in 0..5 {
        engine.worker().drain().await;
        clock.advance(Duration::seconds(1000));
    }

    let job = engine.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retries, 5);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("handler exploded"));
    assert_eq!(job.completed_at, Some(clock.now() - Duration::seconds(1000)));
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    // Terminal means terminal: nothing left to claim.
    engine.worker().drain().await;
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

/// A worker that dies mid-job loses its lease to the reaper; the job becomes
/// claimable again with no retry burned.
pub async fn test_crash_recovery<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    let Setup { engine, clock, .. } = hello_setup(store.clone());

    let id = engine
        .enqueue::<HelloJob>(GreetingPayload { x: 1 }, EnqueueOptions::new())
        .await
        .unwrap();

    // Claim directly and never finalize, as a crashing worker would.
    let claimed = store
        .claim_next(clock.now(), &generate_lock_key(), Duration::seconds(300))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, id);

    clock.advance(Duration::seconds(301));
    let report = engine.reaper().sweep().await.unwrap();
    assert_eq!(report.unlocked, 1);

    let job = engine.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.lock_key.is_none());
    assert!(job.lock_expiration.is_none());
    assert_eq!(job.retries, 0);

    // A fresh claim picks the same job up again.
    let reclaimed = store
        .claim_next(clock.now(), &generate_lock_key(), Duration::seconds(300))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.id, id);
}

/// The reaper prunes terminal rows past their retention windows.
pub async fn test_reaper_prunes_terminal_rows<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    use crate::core::job::JobChanges;

    let Setup { engine, clock, .. } = hello_setup(store.clone());
    let t0 = clock.now();

    let done = engine
        .enqueue::<HelloJob>(GreetingPayload { x: 1 }, EnqueueOptions::new())
        .await
        .unwrap();
    engine.worker().drain().await;
    assert_eq!(
        engine.get_job(done).await.unwrap().unwrap().status,
        JobStatus::Completed
    );

    let broken = engine
        .enqueue::<HelloJob>(GreetingPayload { x: 2 }, EnqueueOptions::new())
        .await
        .unwrap();
    store
        .update(broken, JobChanges::failed(t0, 5, "kaput".to_string()))
        .await
        .unwrap();

    // Inside both retention windows: nothing pruned.
    clock.advance(Duration::days(5));
    let report = engine.reaper().sweep().await.unwrap();
    assert_eq!(report.pruned_completed, 0);
    assert_eq!(report.pruned_failed, 0);

    // Past completed retention (7 days), inside failed retention (30 days).
    clock.advance(Duration::days(3));
    let report = engine.reaper().sweep().await.unwrap();
    assert_eq!(report.pruned_completed, 1);
    assert_eq!(report.pruned_failed, 0);
    assert!(engine.get_job(done).await.unwrap().is_none());
    assert!(engine.get_job(broken).await.unwrap().is_some());

    // Past failed retention.
    clock.advance(Duration::days(23));
    let report = engine.reaper().sweep().await.unwrap();
    assert_eq!(report.pruned_failed, 1);
    assert!(engine.get_job(broken).await.unwrap().is_none());
}

/// A job whose handler disappeared fails terminally instead of cycling
/// through pointless retries.
pub async fn test_unknown_handler_at_execute_fails_terminally<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    let Setup { engine, clock, .. } = hello_setup(store.clone());

    let id = engine
        .enqueue::<HelloJob>(GreetingPayload { x: 1 }, EnqueueOptions::new())
        .await
        .unwrap();

    // A second deployment whose registry no longer binds "hello" picks the
    // job up.
    let calls = Arc::new(AtomicU32::new(0));
    let mut bare_registry = HandlerRegistry::default();
    bare_registry.add_handler(DoomedJob { calls });
    let stripped_engine = Engine::with_clock(
        store,
        bare_registry,
        EngineConfig::default(),
        clock.clone(),
    );
    stripped_engine.worker().drain().await;

    let job = engine.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retries, 0);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("no handler registered"));
}

/// A payload the handler cannot decode is a normal failure: retried with
/// backoff, terminal once attempts run out.
pub async fn test_undecodable_payload_follows_retry_path<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    let Setup { engine, calls, .. } = hello_setup(store);

    let id = engine
        .enqueue_raw("hello", Bytes::from_static(b"{not json"), EnqueueOptions::new())
        .await
        .unwrap();

    engine.worker().drain().await;
    let job = engine.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retries, 1);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("failed to decode payload"));
    // The typed handler never ran.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// Admin retry resets a dead job to a clean, immediately-runnable slate.
pub async fn test_admin_retry_resets_job<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    use crate::core::job::JobChanges;

    let Setup { engine, clock, .. } = hello_setup(store.clone());

    let id = engine
        .enqueue::<HelloJob>(GreetingPayload { x: 1 }, EnqueueOptions::new())
        .await
        .unwrap();
    store
        .update(
            id,
            JobChanges::failed(clock.now(), 5, "wedged".to_string()),
        )
        .await
        .unwrap();

    clock.advance(Duration::hours(1));
    engine.retry_job(id).await.unwrap();

    let job = engine.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retries, 0);
    assert!(job.error_message.is_none());
    assert!(job.completed_at.is_none());
    assert_eq!(job.scheduled_at, clock.now());

    let missing = engine.retry_job(id + 1000).await;
    assert!(matches!(missing, Err(QueueError::JobNotFound { .. })));
}

/// Cancel is a hard delete; a handler still running the job finds its
/// finalizing write affects nothing.
pub async fn test_cancel_deletes_processing_job<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    use crate::core::job::JobChanges;

    let Setup { engine, clock, .. } = hello_setup(store.clone());

    let id = engine
        .enqueue::<HelloJob>(GreetingPayload { x: 1 }, EnqueueOptions::new())
        .await
        .unwrap();

    let lock_key = generate_lock_key();
    store
        .claim_next(clock.now(), &lock_key, Duration::seconds(300))
        .await
        .unwrap()
        .unwrap();

    assert!(engine.cancel_job(id).await.unwrap());
    assert!(engine.get_job(id).await.unwrap().is_none());

    // The orphaned worker's completion write is a no-op.
    let rows = store
        .conditional_update(id, &lock_key, JobChanges::completed(clock.now()))
        .await
        .unwrap();
    assert_eq!(rows, 0);

    assert!(!engine.cancel_job(id).await.unwrap());
}

/// Recurring registration is idempotent per job name.
pub async fn test_recurring_registration_is_idempotent<S>(store: S)
where
    S: Store + Clone + Send + Sync + 'static,
{
    let Setup { engine, .. } = hello_setup(store);
    let payload = Bytes::from_static(b"{\"x\":1}");

    assert!(engine.schedule_recurring_raw(
        "hello",
        payload.clone(),
        RecurringInterval::Hourly,
        3
    ));
    assert!(!engine.schedule_recurring_raw(
        "hello",
        payload.clone(),
        RecurringInterval::Daily,
        3
    ));

    assert!(engine.unschedule_recurring("hello"));
    assert!(!engine.unschedule_recurring("hello"));

    // Gone means a fresh registration is accepted again.
    assert!(engine.schedule_recurring_raw("hello", payload, RecurringInterval::Hourly, 3));
}
