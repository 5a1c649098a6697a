#![doc = include_str!("../README.md")]

pub mod core;

pub mod engine;

/// Background runtime: workers, dispatcher, reaper, and recurring producers.
pub mod runner {
    pub mod dispatcher;
    pub mod executor;
    pub mod reaper;
    pub mod recurring;
    pub mod worker;
}

/// Shared test specifications for store implementations.
///
/// These test functions ensure consistent behavior across all Store
/// implementations. Backend tests should call these functions with their
/// store instance.
#[doc(hidden)]
pub mod store_spec;

/// Shared end-to-end test specifications for the engine over a backend.
///
/// Backend tests should call these functions with their store instance.
#[doc(hidden)]
pub mod engine_spec;

/// Re-exports to simplify importing this crate's types.
pub mod prelude {
    pub use super::core::{
        clock::{Clock, ManualClock, SystemClock},
        config::EngineConfig,
        handler::{HandlerError, JobHandler},
        job::{Job, JobStatus},
        registry::HandlerRegistry,
        store::{QueueError, Store},
        Bytes, CancellationToken, DateTime, Duration, Utc,
    };
    pub use super::engine::{Engine, EngineHandle, EnqueueOptions};
    pub use super::runner::recurring::RecurringInterval;
    pub use serde::{Deserialize, Serialize};
}
