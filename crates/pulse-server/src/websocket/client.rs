//! One connected client: outbound queue, read pump, write pump, teardown.
//!
//! [`Client::connect`] spawns two tasks per connection. The read pump owns
//! the [`ConnectionReader`] and is the only reader; the write pump owns the
//! [`ConnectionWriter`] and the receiving end of the outbound queue and is
//! the only writer. Whichever pump stops first runs the teardown path,
//! which removes the client from the registry, closes the outbound queue (so
//! the write pump sends a close frame and stops) and closes the connection
//! (so a pending read fails with `ClosedLocally`). Every step is idempotent,
//! so the second pump running the same path is harmless.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use pulse_core::{ClientId, CodecError, Event};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, info_span};

use super::connection::{
    Connection, ConnectionCloser, ConnectionReader, ConnectionWriter, ReadControl,
};
use super::frame::Frame;
use super::manager::Registry;
use super::observer::{ClientObserver, Pump, PumpEvent, TracingObserver};
use super::router::Router;
use crate::config::ClientConfig;
use crate::errors::{SendError, TransportError};
use crate::metrics::{
    DECODE_FAILURES_TOTAL, EVENTS_RECEIVED_TOTAL, EVENTS_SENT_TOTAL, PUMP_EXITS_TOTAL,
};

/// Slots in each client's outbound queue. Producers wait while it is full.
pub const OUTBOUND_CAPACITY: usize = 1;

/// Why a pump stopped.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PumpExit {
    /// The peer went away normally, or the connection was closed locally.
    #[error("disconnected: {0}")]
    Disconnected(TransportError),
    /// The read failed (deadline, oversized frame, protocol error, ...).
    #[error("read failed: {0}")]
    Transport(TransportError),
    /// An inbound frame was not a valid event.
    #[error(transparent)]
    Decode(CodecError),
    /// The outbound queue was closed; the close notice has been attempted.
    #[error("outbound queue closed")]
    QueueClosed,
    /// An outbound event could not be serialized.
    #[error(transparent)]
    Encode(CodecError),
    /// Writing a data frame failed fatally.
    #[error("write failed: {0}")]
    Write(TransportError),
    /// Writing a ping failed.
    #[error("ping failed: {0}")]
    Ping(TransportError),
    /// The pump task panicked or was cancelled.
    #[error("pump task aborted")]
    Aborted,
}

impl PumpExit {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected(_) => "disconnected",
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
            Self::QueueClosed => "queue_closed",
            Self::Encode(_) => "encode",
            Self::Write(_) => "write",
            Self::Ping(_) => "ping",
            Self::Aborted => "aborted",
        }
    }
}

/// Lifecycle of a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    /// Registered, pumps being started.
    Connecting = 0,
    /// Both pumps running.
    Active = 1,
    /// Teardown started; the outbound queue accepts nothing more.
    Closing = 2,
    /// Both pumps have stopped.
    Closed = 3,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Collaborators shared by every client of a server.
#[derive(Clone)]
pub struct ClientContext {
    /// Where clients register and deregister.
    pub registry: Arc<dyn Registry>,
    /// Receives every decoded inbound event.
    pub router: Arc<dyn Router>,
    /// Receives pump failures and lifecycle events.
    pub observer: Arc<dyn ClientObserver>,
}

impl ClientContext {
    /// Context reporting through [`TracingObserver`].
    pub fn new(registry: Arc<dyn Registry>, router: Arc<dyn Router>) -> Self {
        Self {
            registry,
            router,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Replace the observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ClientObserver>) -> Self {
        self.observer = observer;
        self
    }
}

/// Join handles for a client's two tasks.
pub struct PumpHandles {
    /// Read pump.
    pub read: JoinHandle<PumpExit>,
    /// Write pump.
    pub write: JoinHandle<PumpExit>,
}

impl PumpHandles {
    /// Wait for both pumps; returns `(read, write)` exits.
    pub async fn join(self) -> (PumpExit, PumpExit) {
        let read = self.read.await.unwrap_or(PumpExit::Aborted);
        let write = self.write.await.unwrap_or(PumpExit::Aborted);
        (read, write)
    }
}

/// A connected client.
pub struct Client {
    id: ClientId,
    outbound: Mutex<Option<mpsc::Sender<Event>>>,
    closer: ConnectionCloser,
    state: AtomicU8,
    pumps_running: AtomicU8,
    connected_at: Instant,
}

impl Client {
    /// Register a new client for `connection` and start its pumps.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        connection: Connection,
        config: &ClientConfig,
        ctx: ClientContext,
    ) -> (Arc<Self>, PumpHandles) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let client = Arc::new(Self {
            id: ClientId::new(),
            outbound: Mutex::new(Some(tx)),
            closer: connection.closer(),
            state: AtomicU8::new(ClientState::Connecting as u8),
            pumps_running: AtomicU8::new(2),
            connected_at: Instant::now(),
        });
        ctx.registry.add(Arc::clone(&client));

        let (reader, writer) = connection.split();
        let span = info_span!("client", client_id = %client.id);
        let read = tokio::spawn(
            Arc::clone(&client)
                .read_pump(reader, *config, ctx.clone())
                .instrument(span.clone()),
        );
        let write = tokio::spawn(
            Arc::clone(&client)
                .write_pump(writer, rx, *config, ctx)
                .instrument(span),
        );

        let _ = client.state.compare_exchange(
            ClientState::Connecting as u8,
            ClientState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        (client, PumpHandles { read, write })
    }

    /// Client identifier.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Time since the client connected.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Enqueue an event, waiting for the queue slot if it is occupied.
    ///
    /// Fails with [`SendError::Closed`] once the queue is closed, including
    /// while waiting, if the write pump stops.
    pub async fn send(&self, event: Event) -> Result<(), SendError> {
        let tx = self.outbound.lock().clone().ok_or(SendError::Closed)?;
        tx.send(event).await.map_err(|_| SendError::Closed)
    }

    /// Enqueue an event without waiting.
    pub fn try_send(&self, event: Event) -> Result<(), SendError> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(SendError::Closed)?;
        tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Close the outbound queue.
    ///
    /// Events already enqueued are still written, then the write pump sends a
    /// close frame and stops, which tears the client down. Returns `true`
    /// only for the call that closed the queue.
    pub fn close(&self) -> bool {
        let closed = self.outbound.lock().take().is_some();
        if closed {
            self.begin_closing();
        }
        closed
    }

    /// Remove from the registry and close both the queue and the connection.
    fn deregister(&self, ctx: &ClientContext) {
        self.begin_closing();
        if ctx.registry.remove(self) {
            ctx.observer.observe(&self.id, &PumpEvent::Deregistered);
        }
        let _ = self.close();
        let _ = self.closer.close();
    }

    fn begin_closing(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s < ClientState::Closing as u8).then_some(ClientState::Closing as u8)
            });
    }

    fn pump_exited(&self, ctx: &ClientContext, pump: Pump, exit: &PumpExit) {
        counter!(PUMP_EXITS_TOTAL, "pump" => pump.to_string(), "reason" => exit.label())
            .increment(1);
        ctx.observer.observe(
            &self.id,
            &PumpEvent::Exited {
                pump,
                exit: exit.clone(),
            },
        );
        self.deregister(ctx);
        if self.pumps_running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.store(ClientState::Closed as u8, Ordering::Release);
        }
    }

    // ── Read pump ───────────────────────────────────────────────────────────

    async fn read_pump(
        self: Arc<Self>,
        mut reader: ConnectionReader,
        config: ClientConfig,
        ctx: ClientContext,
    ) -> PumpExit {
        let exit = self.read_loop(&mut reader, &config, &ctx).await;
        drop(reader);
        self.pump_exited(&ctx, Pump::Read, &exit);
        exit
    }

    async fn read_loop(
        self: &Arc<Self>,
        reader: &mut ConnectionReader,
        config: &ClientConfig,
        ctx: &ClientContext,
    ) -> PumpExit {
        let policy = config.heartbeat;
        reader.set_read_limit(config.read_limit);
        if let Err(error) = reader.set_read_deadline(policy.read_deadline(Instant::now())) {
            return self.read_failed(error, ctx);
        }

        let observer = Arc::clone(&ctx.observer);
        let id = self.id.clone();
        let mut extend = policy.pong_handler();
        reader.set_pong_handler(Box::new(move |payload: &[u8], control: &mut ReadControl| {
            extend(payload, control)?;
            observer.observe(&id, &PumpEvent::PongReceived);
            Ok(())
        }));

        loop {
            let data = match reader.receive().await {
                Ok(data) => data,
                Err(error) => return self.read_failed(error, ctx),
            };
            let event = match Event::decode(&data) {
                Ok(event) => event,
                Err(error) => {
                    counter!(DECODE_FAILURES_TOTAL).increment(1);
                    ctx.observer
                        .observe(&self.id, &PumpEvent::DecodeFailed(error.clone()));
                    return PumpExit::Decode(error);
                }
            };
            counter!(EVENTS_RECEIVED_TOTAL).increment(1);

            let kind = event.kind.clone();
            if let Err(error) = ctx.router.dispatch(event, self).await {
                ctx.observer
                    .observe(&self.id, &PumpEvent::RouteFailed { kind, error });
            }
        }
    }

    /// Classify a terminal read error. Anything after a local close is part
    /// of teardown.
    fn read_failed(&self, error: TransportError, ctx: &ClientContext) -> PumpExit {
        if error.is_expected_close() || self.closer.is_closed() {
            ctx.observer
                .observe(&self.id, &PumpEvent::Disconnected(error.clone()));
            PumpExit::Disconnected(error)
        } else {
            ctx.observer
                .observe(&self.id, &PumpEvent::ReadFailed(error.clone()));
            PumpExit::Transport(error)
        }
    }

    // ── Write pump ──────────────────────────────────────────────────────────

    async fn write_pump(
        self: Arc<Self>,
        mut writer: ConnectionWriter,
        mut outbound: mpsc::Receiver<Event>,
        config: ClientConfig,
        ctx: ClientContext,
    ) -> PumpExit {
        writer.set_write_wait(config.write_wait);
        let mut ticker = config.heartbeat.ticker();

        let exit = loop {
            tokio::select! {
                next = outbound.recv() => match next {
                    Some(event) => {
                        if let Some(exit) = self.write_event(&mut writer, &event, &ctx).await {
                            break exit;
                        }
                    }
                    None => {
                        if let Err(error) = writer.send(Frame::Close(None)).await {
                            ctx.observer.observe(&self.id, &PumpEvent::CloseNoticeFailed(error));
                        }
                        break PumpExit::QueueClosed;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(error) = writer.send(Frame::Ping(Bytes::new())).await {
                        ctx.observer.observe(&self.id, &PumpEvent::PingFailed(error.clone()));
                        break PumpExit::Ping(error);
                    }
                }
            }
        };

        drop(ticker);
        // Releases producers still waiting for a slot.
        drop(outbound);
        drop(writer);
        self.pump_exited(&ctx, Pump::Write, &exit);
        exit
    }

    async fn write_event(
        &self,
        writer: &mut ConnectionWriter,
        event: &Event,
        ctx: &ClientContext,
    ) -> Option<PumpExit> {
        let text = match event.encode() {
            Ok(text) => text,
            Err(error) => {
                ctx.observer
                    .observe(&self.id, &PumpEvent::EncodeFailed(error.clone()));
                return Some(PumpExit::Encode(error));
            }
        };
        match writer.send(Frame::Text(text)).await {
            Ok(()) => {
                counter!(EVENTS_SENT_TOTAL).increment(1);
                None
            }
            Err(error) => {
                ctx.observer
                    .observe(&self.id, &PumpEvent::WriteFailed(error.clone()));
                error.is_fatal().then_some(PumpExit::Write(error))
            }
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
