//! Implementation agnostic types and traits, and re-exports of 3rd party
//! types/crates used in the public interface.

/// An alias for `chrono::DateTime<chrono::Utc>`
pub type DateTime = chrono::DateTime<chrono::Utc>;
pub use bytes::Bytes;
pub use chrono::{Duration, Utc};
pub use tokio_util::sync::CancellationToken;

pub mod clock;
pub mod config;
pub mod handler;
pub mod job;
pub mod registry;
pub mod store;
