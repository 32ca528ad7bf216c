//! Event kind → handler dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use pulse_core::Event;
use tracing::debug;

use super::client::Client;
use crate::errors::RouteError;
use crate::metrics::{EVENTS_ROUTED_TOTAL, ROUTE_FAILURES_TOTAL};

/// Consumer of decoded inbound events.
///
/// Called from the read pump, so implementations must return promptly; the
/// next frame is not read until `dispatch` returns.
#[async_trait]
pub trait Router: Send + Sync {
    /// Handle one event from `client`. An error is reported and the client
    /// keeps running.
    async fn dispatch(&self, event: Event, client: &Arc<Client>) -> Result<(), RouteError>;
}

/// Handler for a single event kind.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process `event` sent by `client`.
    async fn handle(&self, event: Event, client: &Arc<Client>) -> Result<(), RouteError>;
}

/// Router mapping event kinds to handlers.
pub struct EventRouter {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl EventRouter {
    /// Create a router with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: &str, handler: impl EventHandler + 'static) {
        let _ = self.handlers.insert(kind.to_owned(), Arc::new(handler));
    }

    /// Whether a handler is registered for `kind`.
    pub fn has_kind(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Router for EventRouter {
    async fn dispatch(&self, event: Event, client: &Arc<Client>) -> Result<(), RouteError> {
        let kind = event.kind.clone();
        let Some(handler) = self.handlers.get(&kind) else {
            counter!(ROUTE_FAILURES_TOTAL, "kind" => "unknown").increment(1);
            return Err(RouteError::UnknownKind(kind));
        };
        debug!(kind, client_id = %client.id(), "routing event");
        let result = handler.handle(event, client).await;
        match &result {
            Ok(()) => counter!(EVENTS_ROUTED_TOTAL, "kind" => kind).increment(1),
            Err(_) => counter!(ROUTE_FAILURES_TOTAL, "kind" => kind).increment(1),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::testutil::{RecordingRegistry, RecordingRouter, memory_connection};
    use crate::websocket::client::ClientContext;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl EventHandler for Forward {
        async fn handle(&self, event: Event, _client: &Arc<Client>) -> Result<(), RouteError> {
            let _ = self.0.send(event);
            Ok(())
        }
    }

    struct Reject;

    #[async_trait]
    impl EventHandler for Reject {
        async fn handle(&self, _event: Event, _client: &Arc<Client>) -> Result<(), RouteError> {
            Err(RouteError::Handler("nope".into()))
        }
    }

    fn test_client() -> Arc<Client> {
        let (connection, _peer) = memory_connection();
        let (router, _rx) = RecordingRouter::new();
        let ctx = ClientContext::new(RecordingRegistry::new(), router);
        Client::connect(connection, &ClientConfig::default(), ctx).0
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut router = EventRouter::new();
        router.register("chat", Forward(tx));
        let client = test_client();

        router
            .dispatch(Event::new("chat", json!("hi")), &client)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Event::new("chat", json!("hi")));
    }

    #[tokio::test]
    async fn unknown_kind_is_an_error() {
        let router = EventRouter::new();
        let client = test_client();
        let err = router
            .dispatch(Event::new("mystery", json!(null)), &client)
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::UnknownKind("mystery".into()));
    }

    #[tokio::test]
    async fn handler_error_is_returned() {
        let mut router = EventRouter::new();
        router.register("bad", Reject);
        let client = test_client();
        let err = router
            .dispatch(Event::new("bad", json!(1)), &client)
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::Handler("nope".into()));
    }

    #[test]
    fn kinds_are_sorted() {
        let mut router = EventRouter::new();
        router.register("echo", Reject);
        router.register("chat", Reject);
        assert_eq!(router.kinds(), vec!["chat".to_owned(), "echo".to_owned()]);
        assert!(router.has_kind("chat"));
        assert!(!router.has_kind("move"));
    }
}
