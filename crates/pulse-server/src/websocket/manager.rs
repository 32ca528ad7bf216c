//! Registry of live clients and event fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use pulse_core::{ClientId, Event};
use tracing::{debug, warn};

use super::client::Client;
use crate::config::DEFAULT_WRITE_WAIT;
use crate::metrics::{
    BROADCAST_DROPS_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};

/// Where clients register on connect and deregister on teardown.
pub trait Registry: Send + Sync {
    /// Register a freshly connected client.
    fn add(&self, client: Arc<Client>);

    /// Deregister `client`. Safe to call concurrently and repeatedly;
    /// returns `true` only for the call that actually removed it.
    fn remove(&self, client: &Client) -> bool;
}

/// Tracks connected clients by id.
pub struct ClientManager {
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
    send_timeout: Option<Duration>,
}

impl ClientManager {
    /// Create an empty manager. Broadcast recipients get
    /// [`DEFAULT_WRITE_WAIT`] to accept each event.
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            send_timeout: Some(DEFAULT_WRITE_WAIT),
        }
    }

    /// How long a broadcast waits for one recipient's queue slot before
    /// closing that recipient. `None` waits indefinitely.
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Look up a client.
    pub fn get(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.clients.read().get(id).cloned()
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Whether no client is registered.
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Ids of every registered client.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.read().keys().cloned().collect()
    }

    /// Queue `event` for every registered client.
    ///
    /// Recipients are served concurrently and the call returns once each has
    /// accepted the event, so successive broadcasts reach a client in call
    /// order and a full queue holds up the caller. A recipient that does not
    /// free its slot within the send timeout is closed. Returns the number of
    /// recipients.
    pub async fn broadcast(&self, event: &Event) -> usize {
        let recipients = self.snapshot();
        debug!(kind = %event.kind, recipients = recipients.len(), "broadcast event");
        let _ = future::join_all(
            recipients
                .iter()
                .map(|client| self.deliver(client, event.clone())),
        )
        .await;
        recipients.len()
    }

    async fn deliver(&self, client: &Client, event: Event) {
        let sent = match self.send_timeout {
            Some(limit) => match tokio::time::timeout(limit, client.send(event)).await {
                Ok(sent) => sent,
                Err(_) => {
                    counter!(BROADCAST_DROPS_TOTAL).increment(1);
                    warn!(client_id = %client.id(), ?limit, "closing stalled broadcast recipient");
                    let _ = client.close();
                    return;
                }
            },
            None => client.send(event).await,
        };
        if sent.is_err() {
            counter!(BROADCAST_DROPS_TOTAL).increment(1);
            debug!(client_id = %client.id(), "broadcast recipient already closing");
        }
    }

    /// Close every client's outbound queue. Each client sends a close frame
    /// and tears itself down. Returns how many queues this call closed.
    pub fn close_all(&self) -> usize {
        let closed = self.snapshot().iter().filter(|c| c.close()).count();
        if closed > 0 {
            debug!(closed, "closed all client queues");
        }
        closed
    }

    fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.read().values().cloned().collect()
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry for ClientManager {
    fn add(&self, client: Arc<Client>) {
        let id = client.id().clone();
        if self.clients.write().insert(id.clone(), client).is_some() {
            warn!(client_id = %id, "replaced client with duplicate id");
            return;
        }
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    }

    fn remove(&self, client: &Client) -> bool {
        let removed = self.clients.write().remove(client.id()).is_some();
        if removed {
            let _ = client.close();
            counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
            gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::errors::{SendError, TransportError};
    use crate::testutil::{MemoryPeer, RecordingRouter, memory_connection};
    use crate::websocket::client::{ClientContext, ClientState, PumpHandles};
    use crate::websocket::connection::Connection;
    use crate::websocket::frame::Frame;
    use futures::StreamExt;
    use serde_json::json;

    fn connect(manager: &Arc<ClientManager>) -> (Arc<Client>, PumpHandles, MemoryPeer) {
        let (connection, peer) = memory_connection();
        let (router, _rx) = RecordingRouter::new();
        let ctx = ClientContext::new(manager.clone(), router);
        let (client, handles) = Client::connect(connection, &ClientConfig::default(), ctx);
        (client, handles, peer)
    }

    #[tokio::test]
    async fn connect_registers() {
        let manager = Arc::new(ClientManager::new());
        assert!(manager.is_empty());
        let (client, _handles, _peer) = connect(&manager);
        assert_eq!(manager.len(), 1);
        assert!(manager.get(client.id()).is_some());
        assert_eq!(manager.client_ids(), vec![client.id().clone()]);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let manager = Arc::new(ClientManager::new());
        let (client, _handles, _peer) = connect(&manager);
        assert!(manager.remove(&client));
        assert!(!manager.remove(&client));
        assert!(manager.is_empty());
        assert_eq!(client.state(), ClientState::Closing);
    }

    #[tokio::test]
    async fn client_teardown_deregisters() {
        let manager = Arc::new(ClientManager::new());
        let (_client, handles, peer) = connect(&manager);
        peer.sender.close(1000);
        let _ = handles.join().await;
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let manager = Arc::new(ClientManager::new());
        let (_a, _ha, mut peer_a) = connect(&manager);
        let (_b, _hb, mut peer_b) = connect(&manager);

        let event = Event::new("chat", json!("hello"));
        assert_eq!(manager.broadcast(&event).await, 2);

        for peer in [&mut peer_a, &mut peer_b] {
            let Some(Frame::Text(text)) = peer.receiver.recv_data().await else {
                panic!("expected text frame");
            };
            assert_eq!(Event::decode(text.as_bytes()).unwrap(), event);
        }
    }

    /// A peer whose transport never finishes a write.
    fn connect_stalled(manager: &Arc<ClientManager>) -> Arc<Client> {
        let sink = futures::sink::unfold((), |(), _frame: Frame| {
            future::pending::<Result<(), TransportError>>()
        });
        let stream = futures::stream::pending::<Result<Frame, TransportError>>().boxed();
        let (router, _rx) = RecordingRouter::new();
        let ctx = ClientContext::new(manager.clone(), router);
        let config = ClientConfig {
            write_wait: None,
            ..ClientConfig::default()
        };
        let (client, _handles) =
            Client::connect(Connection::new(stream, Box::pin(sink)), &config, ctx);
        client
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn broadcasts_arrive_in_call_order() {
        let manager = Arc::new(ClientManager::new());
        let (_client, _handles, mut peer) = connect(&manager);

        for i in 0..200 {
            assert_eq!(manager.broadcast(&Event::new("chat", json!(i))).await, 1);
        }

        let mut received = Vec::new();
        while received.len() < 200 {
            match peer.receiver.recv_data().await {
                Some(Frame::Text(text)) => {
                    received.push(Event::decode(text.as_bytes()).unwrap().payload);
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        let expected: Vec<_> = (0..200).map(|i| json!(i)).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn full_recipient_holds_up_broadcaster() {
        let manager = Arc::new(ClientManager::new().with_send_timeout(None));
        let client = connect_stalled(&manager);

        // One event is stuck in the write, one fills the queue slot.
        assert_eq!(manager.broadcast(&Event::new("chat", json!(1))).await, 1);
        assert_eq!(manager.broadcast(&Event::new("chat", json!(2))).await, 1);

        let third_event = Event::new("chat", json!(3));
        let third = manager.broadcast(&third_event);
        assert!(
            tokio::time::timeout(Duration::from_secs(5), third)
                .await
                .is_err()
        );
        assert_eq!(client.state(), ClientState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_recipient_is_closed_after_send_timeout() {
        let manager =
            Arc::new(ClientManager::new().with_send_timeout(Some(Duration::from_secs(1))));
        let client = connect_stalled(&manager);

        for i in 0..3 {
            assert_eq!(manager.broadcast(&Event::new("chat", json!(i))).await, 1);
        }

        assert_eq!(client.state(), ClientState::Closing);
        assert_eq!(
            client.try_send(Event::new("chat", json!(4))),
            Err(SendError::Closed)
        );
    }

    #[tokio::test]
    async fn broadcast_with_no_clients() {
        let manager = ClientManager::new();
        assert_eq!(manager.broadcast(&Event::new("chat", json!(null))).await, 0);
    }

    #[tokio::test]
    async fn close_all_sends_close_frames() {
        let manager = Arc::new(ClientManager::new());
        let (_a, ha, mut peer_a) = connect(&manager);
        let (_b, hb, mut peer_b) = connect(&manager);

        assert_eq!(manager.close_all(), 2);
        assert_eq!(manager.close_all(), 0);

        let _ = ha.join().await;
        let _ = hb.join().await;
        assert_eq!(peer_a.receiver.recv_data().await, Some(Frame::Close(None)));
        assert_eq!(peer_b.receiver.recv_data().await, Some(Frame::Close(None)));
        assert!(manager.is_empty());
    }
}
