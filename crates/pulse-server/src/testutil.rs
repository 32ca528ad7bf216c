//! Test doubles: an in-memory transport and recording implementations of
//! the registry, router and observer seams.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pulse_core::{ClientId, Event};
use tokio::sync::mpsc;

use crate::errors::{RouteError, TransportError};
use crate::websocket::client::Client;
use crate::websocket::connection::Connection;
use crate::websocket::frame::Frame;
use crate::websocket::manager::Registry;
use crate::websocket::observer::{ClientObserver, PumpEvent};
use crate::websocket::router::Router;

// ── In-memory transport ─────────────────────────────────────────────────────

/// The remote end of a [`memory_connection`].
pub struct MemoryPeer {
    /// Pushes frames (or transport errors) towards the server.
    pub sender: PeerSender,
    /// Observes frames the server wrote.
    pub receiver: PeerReceiver,
}

/// Create a connection whose other end is driven by the test.
pub fn memory_connection() -> (Connection, MemoryPeer) {
    let (inbound_tx, inbound_rx) = fmpsc::unbounded::<Result<Frame, TransportError>>();
    let (outbound_tx, outbound_rx) = fmpsc::unbounded::<Frame>();

    let sink = outbound_tx.sink_map_err(|_| TransportError::ConnectionClosed);
    let connection = Connection::new(inbound_rx.boxed(), Box::pin(sink));
    let peer = MemoryPeer {
        sender: PeerSender { tx: inbound_tx },
        receiver: PeerReceiver { rx: outbound_rx },
    };
    (connection, peer)
}

/// Peer-side writer. Dropping every clone ends the server's inbound stream.
#[derive(Clone)]
pub struct PeerSender {
    tx: fmpsc::UnboundedSender<Result<Frame, TransportError>>,
}

impl PeerSender {
    /// Send a raw frame.
    pub fn frame(&self, frame: Frame) {
        let _ = self.tx.unbounded_send(Ok(frame));
    }

    /// Send a text frame.
    pub fn text(&self, text: &str) {
        self.frame(Frame::Text(text.to_owned()));
    }

    /// Send an event encoded as a text frame.
    pub fn event(&self, kind: &str, payload: serde_json::Value) {
        let text = serde_json::to_string(&Event::new(kind, payload)).unwrap_or_default();
        self.frame(Frame::Text(text));
    }

    /// Answer a ping.
    pub fn pong(&self) {
        self.frame(Frame::Pong(Bytes::new()));
    }

    /// Send a close frame with `code`.
    pub fn close(&self, code: u16) {
        self.frame(Frame::close_with(code, ""));
    }

    /// Make the server's next read fail with `error`.
    pub fn error(&self, error: TransportError) {
        let _ = self.tx.unbounded_send(Err(error));
    }
}

/// Peer-side reader.
pub struct PeerReceiver {
    rx: fmpsc::UnboundedReceiver<Frame>,
}

impl PeerReceiver {
    /// Next frame written by the server; `None` once its writer is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.next().await
    }

    /// Next frame that is not a ping.
    pub async fn recv_data(&mut self) -> Option<Frame> {
        loop {
            match self.rx.next().await {
                Some(Frame::Ping(_)) => {}
                other => return other,
            }
        }
    }

    /// Every remaining frame until the server's writer is dropped.
    pub async fn collect(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.rx.next().await {
            frames.push(frame);
        }
        frames
    }

    /// Stop accepting frames; the server's next write fails.
    pub fn stop(&mut self) {
        self.rx.close();
    }
}

// ── Recording observer ──────────────────────────────────────────────────────

/// Observer that keeps every event it sees.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<(ClientId, PumpEvent)>>,
}

impl RecordingObserver {
    /// New empty observer.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of recorded events, in order.
    pub fn events(&self) -> Vec<PumpEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    /// Number of recorded events matching `pred`.
    pub fn count(&self, pred: impl Fn(&PumpEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|(_, e)| pred(e)).count()
    }
}

impl ClientObserver for RecordingObserver {
    fn observe(&self, client: &ClientId, event: &PumpEvent) {
        self.events.lock().push((client.clone(), event.clone()));
    }
}

// ── Recording registry ──────────────────────────────────────────────────────

/// Registry that counts calls.
#[derive(Default)]
pub struct RecordingRegistry {
    members: Mutex<HashSet<ClientId>>,
    adds: AtomicUsize,
    remove_calls: AtomicUsize,
    removals: AtomicUsize,
}

impl RecordingRegistry {
    /// New empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of `add` calls.
    pub fn adds(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    /// Number of `remove` calls, effective or not.
    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    /// Number of `remove` calls that actually removed a member.
    pub fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: &ClientId) -> bool {
        self.members.lock().contains(id)
    }
}

impl Registry for RecordingRegistry {
    fn add(&self, client: Arc<Client>) {
        let _ = self.adds.fetch_add(1, Ordering::SeqCst);
        let _ = self.members.lock().insert(client.id().clone());
    }

    fn remove(&self, client: &Client) -> bool {
        let _ = self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let removed = self.members.lock().remove(client.id());
        if removed {
            let _ = self.removals.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }
}

// ── Recording router ────────────────────────────────────────────────────────

/// Router that forwards every dispatched event to a channel and fails for a
/// configurable set of kinds.
pub struct RecordingRouter {
    tx: mpsc::UnboundedSender<Event>,
    failing: HashSet<String>,
}

impl RecordingRouter {
    /// Router accepting every kind, plus the receiving end of its log.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        Self::failing_on(&[])
    }

    /// Router that fails for the listed kinds (after recording them).
    pub fn failing_on(kinds: &[&str]) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Self {
            tx,
            failing: kinds.iter().map(|k| (*k).to_owned()).collect(),
        };
        (Arc::new(router), rx)
    }
}

#[async_trait]
impl Router for RecordingRouter {
    async fn dispatch(&self, event: Event, _client: &Arc<Client>) -> Result<(), RouteError> {
        let fail = self.failing.contains(&event.kind);
        let kind = event.kind.clone();
        let _ = self.tx.send(event);
        if fail {
            Err(RouteError::Handler(format!("rejected {kind}")))
        } else {
            Ok(())
        }
    }
}
