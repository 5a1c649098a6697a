//! The engine handle.
//!
//! One `Engine` value per process, constructed from a store, a handler
//! registry, and a config, then cloned freely into producers, admin surfaces,
//! and the background tasks. There is no global state: everything the queue
//! needs travels through this handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::Duration;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::EngineConfig;
use crate::core::handler::JobHandler;
use crate::core::job::{Job, JobChanges, JobStatus, NewJob, PRIORITY_MAX, PRIORITY_MIN};
use crate::core::registry::HandlerRegistry;
use crate::core::store::{QueueError, Store};
use crate::runner::dispatcher::Dispatcher;
use crate::runner::reaper::Reaper;
use crate::runner::recurring::{self, RecurringInterval, RecurringJob};
use crate::runner::worker::Worker;

/// Default priority for jobs that don't specify one.
pub const DEFAULT_PRIORITY: i16 = 5;

/// Scheduling options for enqueuing jobs.
///
/// ## Example
/// ```rust,ignore
/// // Run as soon as a worker is free, at default priority.
/// let options = EnqueueOptions::new();
///
/// // Run in five minutes at high priority.
/// let options = EnqueueOptions::new()
///     .with_delay_seconds(300)
///     .with_priority(2);
/// ```
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    delay_seconds: u64,
    priority: i16,
}

impl EnqueueOptions {
    /// Immediate scheduling at the default priority.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay the first eligible run by the given number of seconds.
    pub fn with_delay_seconds(mut self, delay_seconds: u64) -> Self {
        self.delay_seconds = delay_seconds;
        self
    }

    /// Set the priority. Values are clamped into `[1, 10]` on insert;
    /// 1 runs first.
    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay_seconds(&self) -> u64 {
        self.delay_seconds
    }

    pub fn priority(&self) -> i16 {
        self.priority
    }
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay_seconds: 0,
            priority: DEFAULT_PRIORITY,
        }
    }
}

struct EngineInner<S> {
    store: S,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    trigger: Arc<Notify>,
    recurring: Mutex<HashMap<String, CancellationToken>>,
    root: CancellationToken,
}

/// Handle to the queue engine: producer API, admin API, and lifecycle.
pub struct Engine<S> {
    inner: Arc<EngineInner<S>>,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> Engine<S>
where
    S: Store + Clone + Send + Sync + 'static,
{
    /// Create an engine over the given store with the wall clock.
    pub fn new(store: S, registry: HandlerRegistry, config: EngineConfig) -> Self {
        Self::with_clock(store, registry, config, Arc::new(SystemClock))
    }

    /// Create an engine with an injected clock. Tests use this with
    /// [`ManualClock`](crate::core::clock::ManualClock) to drive schedules
    /// deterministically.
    pub fn with_clock(
        store: S,
        registry: HandlerRegistry,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            handlers = registry.len(),
            workers = config.worker_count,
            "initializing queue engine"
        );

        Self {
            inner: Arc::new(EngineInner {
                store,
                registry: Arc::new(registry),
                clock,
                config,
                trigger: Arc::new(Notify::new()),
                recurring: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
            }),
        }
    }

    // ----- Producer API -----

    /// Enqueue a typed payload for the handler `J`.
    ///
    /// Serializes the payload at the edge; from here on the engine only moves
    /// opaque bytes.
    pub async fn enqueue<J>(
        &self,
        payload: J::Payload,
        options: EnqueueOptions,
    ) -> Result<i64, QueueError>
    where
        J: JobHandler + 'static,
        J::Payload: Serialize,
    {
        let data = serde_json::to_vec(&payload)
            .map_err(|e| QueueError::serialize_error(J::name(), e))?;
        self.enqueue_raw(J::name(), Bytes::from(data), options).await
    }

    /// Enqueue an already-encoded payload under a job name.
    ///
    /// Rejects names with no registered handler. Priority is clamped into
    /// `[1, 10]`. An immediate enqueue at or above the high-priority
    /// threshold nudges an idle worker right away instead of waiting for the
    /// next dispatch tick.
    #[instrument(skip_all, err, ret, fields(job_name = %job_name, priority))]
    pub async fn enqueue_raw(
        &self,
        job_name: &str,
        payload: Bytes,
        options: EnqueueOptions,
    ) -> Result<i64, QueueError> {
        if !self.inner.registry.contains(job_name) {
            return Err(QueueError::unknown_handler(job_name));
        }

        let priority = options.priority().clamp(PRIORITY_MIN, PRIORITY_MAX);
        tracing::Span::current().record("priority", priority);

        let now = self.inner.clock.now();
        let scheduled_at = now + Duration::seconds(options.delay_seconds() as i64);

        let job_id = self
            .inner
            .store
            .insert(NewJob {
                job_name: job_name.to_string(),
                job_data: payload,
                priority,
                created_at: now,
                scheduled_at,
            })
            .await?;

        if priority <= self.inner.config.high_priority_threshold && options.delay_seconds() == 0 {
            self.inner.trigger.notify_one();
        }

        Ok(job_id)
    }

    /// Register a recurring producer that re-enqueues a typed payload each
    /// period. Returns `Ok(false)` without re-registering if a producer with
    /// this job name already exists.
    pub fn schedule_recurring<J>(
        &self,
        payload: J::Payload,
        interval: RecurringInterval,
        priority: i16,
    ) -> Result<bool, QueueError>
    where
        J: JobHandler + 'static,
        J::Payload: Serialize,
    {
        let data = serde_json::to_vec(&payload)
            .map_err(|e| QueueError::serialize_error(J::name(), e))?;
        Ok(self.schedule_recurring_raw(J::name(), Bytes::from(data), interval, priority))
    }

    /// Register a recurring producer for an already-encoded payload.
    /// Idempotent per job name: returns `false` if one is already registered.
    ///
    /// The producer task lives until [`unschedule_recurring`](Self::unschedule_recurring)
    /// or engine shutdown. Must be called from within a tokio runtime.
    pub fn schedule_recurring_raw(
        &self,
        job_name: &str,
        payload: Bytes,
        interval: RecurringInterval,
        priority: i16,
    ) -> bool {
        let mut recurring = self
            .inner
            .recurring
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if recurring.contains_key(job_name) {
            return false;
        }

        let cancellation_token = self.inner.root.child_token();
        recurring.insert(job_name.to_string(), cancellation_token.clone());

        let job = RecurringJob {
            job_name: job_name.to_string(),
            payload,
            interval,
            priority: priority.clamp(PRIORITY_MIN, PRIORITY_MAX),
        };
        info!(job_name = %job.job_name, interval = ?interval, "registered recurring producer");
        tokio::spawn(recurring::run(self.clone(), job, cancellation_token));

        true
    }

    /// Stop a recurring producer. Returns whether one was registered.
    pub fn unschedule_recurring(&self, job_name: &str) -> bool {
        let token = {
            let mut recurring = self
                .inner
                .recurring
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            recurring.remove(job_name)
        };
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    // ----- Admin API -----

    /// Fetch a job by id.
    pub async fn get_job(&self, job_id: i64) -> Result<Option<Job>, QueueError> {
        self.inner.store.get(job_id).await
    }

    /// List jobs, optionally filtered by status.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: u32,
    ) -> Result<Vec<Job>, QueueError> {
        self.inner.store.list(status, limit).await
    }

    /// Count jobs grouped by status.
    pub async fn count_by_status(&self) -> Result<HashMap<JobStatus, i64>, QueueError> {
        self.inner.store.count_by_status().await
    }

    /// Reset a job to a fresh pending state (retries zeroed, error and lock
    /// cleared, eligible to run immediately) and nudge a worker.
    #[instrument(skip(self), err)]
    pub async fn retry_job(&self, job_id: i64) -> Result<(), QueueError> {
        let now = self.inner.clock.now();
        let rows = self
            .inner
            .store
            .update(job_id, JobChanges::retry_reset(now))
            .await?;
        if rows == 0 {
            return Err(QueueError::job_not_found(job_id));
        }

        self.inner.trigger.notify_one();
        Ok(())
    }

    /// Delete a job regardless of status. A handler currently running it is
    /// not signalled; its finalizing write will find no matching lease and
    /// discard the result. Returns whether a row existed.
    #[instrument(skip(self), err)]
    pub async fn cancel_job(&self, job_id: i64) -> Result<bool, QueueError> {
        let deleted = self.inner.store.delete(job_id).await?;
        if !deleted {
            warn!(job_id, "cancel requested for a job that does not exist");
        }
        Ok(deleted)
    }

    // ----- Components -----
    //
    // `start` wires these onto tokio timers. Embedders that drive their own
    // scheduling (or tests stepping a manual clock) construct them here and
    // call `tick` / `sweep` / `drain` directly.

    /// A worker wired to this engine.
    pub fn worker(&self) -> Worker<S> {
        Worker::new(
            self.inner.store.clone(),
            self.inner.registry.clone(),
            self.inner.clock.clone(),
            self.inner.config.clone(),
            self.inner.trigger.clone(),
        )
    }

    /// A dispatcher wired to this engine.
    pub fn dispatcher(&self) -> Dispatcher<S> {
        Dispatcher::new(
            self.inner.store.clone(),
            self.inner.clock.clone(),
            self.inner.config.clone(),
            self.inner.trigger.clone(),
        )
    }

    /// A reaper wired to this engine.
    pub fn reaper(&self) -> Reaper<S> {
        Reaper::new(
            self.inner.store.clone(),
            self.inner.clock.clone(),
            self.inner.config.clone(),
        )
    }

    // ----- Lifecycle -----

    /// Start the worker pool, dispatcher, and reaper.
    ///
    /// Returns a handle used to shut everything down. Shutdown stops workers
    /// from claiming new jobs and cancels recurring producers; a job already
    /// executing finishes its attempt first.
    pub fn start(&self) -> EngineHandle {
        let mut handles = Vec::new();

        for i in 1..=self.inner.config.worker_count {
            info!(worker = i, "starting worker");
            let worker = self.worker();
            let token = self.inner.root.child_token();
            handles.push(tokio::spawn(worker.run(token)));
        }

        let dispatcher = self.dispatcher();
        handles.push(tokio::spawn(dispatcher.run(self.inner.root.child_token())));

        let reaper = self.reaper();
        handles.push(tokio::spawn(reaper.run(self.inner.root.child_token())));

        EngineHandle {
            root: self.inner.root.clone(),
            handles,
        }
    }
}

/// Handle to a running engine's background tasks.
pub struct EngineHandle {
    root: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Request shutdown and wait for every background task to stop.
    pub async fn shutdown(self) {
        self.root.cancel();
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "background task panicked");
            }
        });
    }
}
