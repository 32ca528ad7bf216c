//! Built-in event handlers.

use std::sync::Arc;

use async_trait::async_trait;
use pulse_core::Event;
use tracing::debug;

use super::client::Client;
use super::manager::ClientManager;
use super::router::EventHandler;
use crate::errors::RouteError;

/// Re-broadcasts the event to every connected client, sender included.
pub struct BroadcastHandler {
    manager: Arc<ClientManager>,
}

impl BroadcastHandler {
    /// Broadcast through `manager`.
    pub fn new(manager: Arc<ClientManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl EventHandler for BroadcastHandler {
    async fn handle(&self, event: Event, client: &Arc<Client>) -> Result<(), RouteError> {
        let recipients = self.manager.broadcast(&event).await;
        debug!(client_id = %client.id(), kind = %event.kind, recipients, "relayed event");
        Ok(())
    }
}

/// Sends the event back to the client that sent it.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl EventHandler for EchoHandler {
    async fn handle(&self, event: Event, client: &Arc<Client>) -> Result<(), RouteError> {
        // Waits for the write pump; fails once it has stopped.
        client
            .send(event)
            .await
            .map_err(|e| RouteError::Handler(e.to_string()))
    }
}
