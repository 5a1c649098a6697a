use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::core::handler::{HandlerError, JobHandler};

/// Shorthand for the boxed, type-erased form of a registered handler.
pub type BoxedHandler = Box<dyn JobHandler<Payload = Bytes, Error = HandlerError>>;

/// Maps job names to handler implementations.
///
/// Build the registry at startup, register every handler, then hand it to the
/// engine. Registration after workers start is not supported; the registry is
/// read-only once the engine owns it.
///
/// ## Example
/// ```rust,ignore
/// let registry = {
///     let mut r = HandlerRegistry::default();
///     r.add_handler(SendEmail);
///     r.add_handler(Resize);
///     r
/// };
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxedHandler>,
}

impl HandlerRegistry {
    /// Register a handler under its name, replacing any previous binding.
    pub fn add_handler<J>(&mut self, handler: J)
    where
        J: JobHandler + 'static,
        J::Payload: for<'de> Deserialize<'de> + Serialize,
        J::Error: Into<HandlerError>,
    {
        self.handlers
            .insert(J::name().to_string(), WrappedHandler::new(handler).boxed());
    }

    /// Whether a handler is bound to the given name.
    pub fn contains(&self, job_name: &str) -> bool {
        self.handlers.contains_key(job_name)
    }

    /// Look up the handler bound to a name.
    pub fn get(&self, job_name: &str) -> Option<&BoxedHandler> {
        self.handlers.get(job_name)
    }

    /// All registered job names.
    pub fn job_names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Object-safe adapter around a typed handler. Decodes the stored payload
/// bytes before delegating, so decode failures surface through the same
/// failure path as handler errors.
pub struct WrappedHandler<J: JobHandler> {
    handler: J,
}

impl<J> WrappedHandler<J>
where
    J: JobHandler + 'static,
    J::Payload: for<'de> Deserialize<'de> + Serialize,
    J::Error: Into<HandlerError>,
{
    pub fn new(handler: J) -> Self {
        Self { handler }
    }

    pub fn boxed(self) -> BoxedHandler {
        Box::new(self) as BoxedHandler
    }
}

#[async_trait]
impl<J> JobHandler for WrappedHandler<J>
where
    J: JobHandler + 'static,
    J::Payload: for<'de> Deserialize<'de> + Serialize,
    J::Error: Into<HandlerError>,
{
    type Payload = Bytes;
    type Error = HandlerError;

    fn name() -> &'static str {
        J::name()
    }

    #[instrument(skip_all, err, fields(job_id = job_id, job_name = %Self::name()))]
    async fn handle(&self, job_id: i64, payload: Self::Payload) -> Result<(), Self::Error> {
        let typed: J::Payload = serde_json::from_slice(payload.as_ref())
            .map_err(|error| HandlerError::decode_error(error, payload.as_ref()))?;

        self.handler
            .handle(job_id, typed)
            .await
            .map_err(Into::into)
    }
}

impl<J> From<J> for WrappedHandler<J>
where
    J: JobHandler + 'static,
    J::Payload: for<'de> Deserialize<'de> + Serialize,
    J::Error: Into<HandlerError>,
{
    fn from(handler: J) -> Self {
        Self::new(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct EchoPayload {
        value: String,
    }

    struct EchoJob {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler for EchoJob {
        type Payload = EchoPayload;
        type Error = Infallible;

        fn name() -> &'static str {
            "echo"
        }

        async fn handle(&self, _job_id: i64, _payload: Self::Payload) -> Result<(), Infallible> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FussyJob;

    #[async_trait]
    impl JobHandler for FussyJob {
        type Payload = EchoPayload;
        type Error = anyhow::Error;

        fn name() -> &'static str {
            "fussy"
        }

        async fn handle(&self, _job_id: i64, _payload: Self::Payload) -> anyhow::Result<()> {
            anyhow::bail!("always refuses")
        }
    }

    fn registry_with_echo() -> (HandlerRegistry, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::default();
        registry.add_handler(EchoJob {
            calls: calls.clone(),
        });
        (registry, calls)
    }

    #[test]
    fn lookup_by_name() {
        let (registry, _) = registry_with_echo();
        assert!(registry.contains("echo"));
        assert!(!registry.contains("missing"));
        assert!(registry.get("echo").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn wrapped_handler_decodes_and_delegates() {
        let (registry, calls) = registry_with_echo();
        let payload = Bytes::from(
            serde_json::to_vec(&EchoPayload {
                value: "hi".into(),
            })
            .unwrap(),
        );

        registry.get("echo").unwrap().handle(1, payload).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrapped_handler_reports_decode_failures() {
        let (registry, calls) = registry_with_echo();

        let result = registry
            .get("echo")
            .unwrap()
            .handle(1, Bytes::from("{broken"))
            .await;
        match result.unwrap_err() {
            HandlerError::Decode { .. } => {}
            other => panic!("expected Decode, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wrapped_handler_propagates_handler_errors() {
        let mut registry = HandlerRegistry::default();
        registry.add_handler(FussyJob);
        let payload = Bytes::from(
            serde_json::to_vec(&EchoPayload {
                value: "hi".into(),
            })
            .unwrap(),
        );

        let result = registry.get("fussy").unwrap().handle(7, payload).await;
        match result.unwrap_err() {
            HandlerError::Failed(e) => assert_eq!(e.to_string(), "always refuses"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
