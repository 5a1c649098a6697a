use std::convert::Infallible;

use async_trait::async_trait;
use thiserror::Error;

/// A job-handler interface keyed by name.
///
/// The name is the persisted identity of the job type: it is stored with each
/// row and looked up in the [`HandlerRegistry`](crate::core::registry::HandlerRegistry)
/// at execution time. Names must be unique across the application and at most
/// 255 characters.
///
/// The payload must implement `Serialize` and `Deserialize` for queue
/// operations; the registry's wrapping adapter performs the decode so the
/// engine itself only ever moves opaque bytes.
///
/// ## Example
/// ```rust,ignore
/// use estafette::prelude::*;
///
/// struct Resize;
///
/// #[derive(Serialize, Deserialize)]
/// struct ResizePayload {
///     image_id: u64,
///     width: u32,
/// }
///
/// #[async_trait::async_trait]
/// impl JobHandler for Resize {
///     type Payload = ResizePayload;
///     type Error = anyhow::Error;
///
///     fn name() -> &'static str {
///         "resize_image"
///     }
///
///     async fn handle(&self, _job_id: i64, payload: Self::Payload) -> anyhow::Result<()> {
///         resize(payload.image_id, payload.width).await
///     }
/// }
/// ```
///
/// ## Services
/// If a handler needs external services (database client, REST client, etc.),
/// add them directly as struct fields.
///
/// ## Idempotency
/// A handler that outlives its lease may run concurrently with a second
/// claimant; handlers must tolerate duplicate execution.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The input payload for this handler.
    type Payload: Send;

    /// The error type returned by this handler.
    ///
    /// Should implement `Into<HandlerError>` so failures flow into the retry
    /// machinery.
    type Error: Send + Into<HandlerError>;

    /// The persisted job name bound to this handler.
    fn name() -> &'static str
    where
        Self: Sized;

    /// Execute one unit of work.
    async fn handle(&self, job_id: i64, payload: Self::Payload) -> Result<(), Self::Error>;
}

/// Failure of a single execution attempt.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HandlerError {
    /// The stored payload could not be decoded into the handler's payload type.
    #[error("failed to decode payload: {error}\npayload sample: {payload_sample}")]
    Decode {
        #[source]
        error: serde_json::Error,
        payload_sample: String,
    },

    /// The handler returned an error.
    #[error("handler failed: {0}")]
    Failed(#[source] anyhow::Error),
}

impl HandlerError {
    /// Create a decode error carrying a truncated payload sample for debugging.
    pub fn decode_error(error: serde_json::Error, payload: &[u8]) -> Self {
        let payload_sample = String::from_utf8_lossy(payload).chars().take(500).collect();

        Self::Decode {
            error,
            payload_sample,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        HandlerError::Failed(error)
    }
}

impl From<Infallible> for HandlerError {
    fn from(_: Infallible) -> Self {
        unreachable!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_truncates_sample() {
        let payload = "x".repeat(1000);
        let error = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();

        let handler_error = HandlerError::decode_error(error, payload.as_bytes());
        match handler_error {
            HandlerError::Decode { payload_sample, .. } => {
                assert_eq!(payload_sample.len(), 500);
            }
            other => panic!("expected Decode, got {other:?}"),
        }
    }

    #[test]
    fn decode_error_tolerates_invalid_utf8() {
        let payload: &[u8] = &[0xFF, 0xFE, 0xFD];
        let error = serde_json::from_slice::<serde_json::Value>(payload).unwrap_err();

        let handler_error = HandlerError::decode_error(error, payload);
        assert!(handler_error.to_string().contains("decode"));
    }

    #[test]
    fn anyhow_errors_become_failures() {
        let handler_error: HandlerError = anyhow::anyhow!("downstream unavailable").into();
        match handler_error {
            HandlerError::Failed(e) => assert_eq!(e.to_string(), "downstream unavailable"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
