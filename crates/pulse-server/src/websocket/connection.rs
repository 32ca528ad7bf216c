//! Framed connection over a `WebSocket` transport.
//!
//! A [`Connection`] is split into a [`ConnectionReader`] (owned by the read
//! pump) and a [`ConnectionWriter`] (owned by the write pump), so at most one
//! read and one write can ever be outstanding. Both halves share a
//! [`ConnectionCloser`], an idempotent latch that aborts a pending read.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Sink, SinkExt, StreamExt};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::frame::{CLOSE_ABNORMAL, CLOSE_NO_STATUS, Frame};
use crate::errors::TransportError;

/// Inbound half of a transport.
pub type FrameStream = BoxStream<'static, Result<Frame, TransportError>>;

/// Outbound half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// Callback run by the reader whenever a pong frame arrives.
///
/// Receives the pong payload and the reader's [`ReadControl`]; an error is
/// returned from the pending `receive` call.
pub type PongHandler =
    Box<dyn FnMut(&[u8], &mut ReadControl) -> Result<(), TransportError> + Send>;

/// A transport connection, before it is split between the pumps.
pub struct Connection {
    reader: ConnectionReader,
    writer: ConnectionWriter,
}

impl Connection {
    /// Wrap a frame stream and sink.
    pub fn new(stream: FrameStream, sink: FrameSink) -> Self {
        let closer = ConnectionCloser::new();
        Self {
            reader: ConnectionReader {
                stream,
                control: ReadControl {
                    limit: None,
                    deadline: None,
                    closer: closer.clone(),
                },
                pong_handler: None,
            },
            writer: ConnectionWriter {
                sink,
                write_wait: None,
            },
        }
    }

    /// Handle that closes this connection.
    pub fn closer(&self) -> ConnectionCloser {
        self.reader.control.closer.clone()
    }

    /// Split into the read and write halves.
    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        (self.reader, self.writer)
    }
}

// ── Close latch ─────────────────────────────────────────────────────────────

struct CloseLatch {
    closed: AtomicBool,
    token: CancellationToken,
}

/// Idempotent close handle shared by both halves of a connection.
#[derive(Clone)]
pub struct ConnectionCloser {
    latch: Arc<CloseLatch>,
}

impl ConnectionCloser {
    fn new() -> Self {
        Self {
            latch: Arc::new(CloseLatch {
                closed: AtomicBool::new(false),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Close the connection. Returns `true` only for the call that closed it.
    ///
    /// A pending `receive` fails with [`TransportError::ClosedLocally`]; the
    /// socket itself is released once both halves are dropped.
    pub fn close(&self) -> bool {
        let first = !self.latch.closed.swap(true, Ordering::AcqRel);
        self.latch.token.cancel();
        first
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.latch.closed.load(Ordering::Acquire)
    }

    fn token(&self) -> CancellationToken {
        self.latch.token.clone()
    }
}

impl std::fmt::Debug for ConnectionCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCloser")
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── Read half ───────────────────────────────────────────────────────────────

/// Transport-level guards applied to reads.
pub struct ReadControl {
    limit: Option<usize>,
    deadline: Option<Instant>,
    closer: ConnectionCloser,
}

impl ReadControl {
    /// Cap the size of a single inbound message.
    pub fn set_read_limit(&mut self, limit: usize) {
        self.limit = Some(limit);
    }

    /// Fail pending and future reads once `at` passes.
    ///
    /// Errors with [`TransportError::ConnectionClosed`] after the connection
    /// was closed.
    pub fn set_read_deadline(&mut self, at: Instant) -> Result<(), TransportError> {
        if self.closer.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.deadline = Some(at);
        Ok(())
    }

    /// Current read deadline, if any.
    pub fn read_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Current read limit, if any.
    pub fn read_limit(&self) -> Option<usize> {
        self.limit
    }
}

/// Read half of a [`Connection`].
pub struct ConnectionReader {
    stream: FrameStream,
    control: ReadControl,
    pong_handler: Option<PongHandler>,
}

impl ConnectionReader {
    /// See [`ReadControl::set_read_limit`].
    pub fn set_read_limit(&mut self, limit: usize) {
        self.control.set_read_limit(limit);
    }

    /// See [`ReadControl::set_read_deadline`].
    pub fn set_read_deadline(&mut self, at: Instant) -> Result<(), TransportError> {
        self.control.set_read_deadline(at)
    }

    /// Install the callback invoked for every inbound pong.
    pub fn set_pong_handler(&mut self, handler: PongHandler) {
        self.pong_handler = Some(handler);
    }

    /// Read guards, for inspection.
    pub fn control(&self) -> &ReadControl {
        &self.control
    }

    pub(crate) fn control_mut(&mut self) -> &mut ReadControl {
        &mut self.control
    }

    /// Wait for the next data frame.
    ///
    /// Pongs are handed to the pong handler and pings are left to the
    /// transport, so neither returns from here. A close frame or the end of
    /// the stream surfaces as [`TransportError::Closed`]. Every error is
    /// terminal for the caller.
    pub async fn receive(&mut self) -> Result<Bytes, TransportError> {
        loop {
            match self.next_frame().await? {
                Frame::Text(text) => return self.check_limit(Bytes::from(text)),
                Frame::Binary(data) => return self.check_limit(data),
                Frame::Pong(data) => {
                    if let Some(handler) = self.pong_handler.as_mut() {
                        handler(&data, &mut self.control)?;
                    }
                }
                Frame::Ping(_) => {}
                Frame::Close(frame) => {
                    let code = frame.map_or(CLOSE_NO_STATUS, |f| f.code);
                    return Err(TransportError::Closed { code });
                }
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        let closed = self.control.closer.token();
        if closed.is_cancelled() {
            return Err(TransportError::ClosedLocally);
        }

        let deadline = self.control.deadline;
        let stream = &mut self.stream;
        let read = async move {
            match deadline {
                Some(at) => time::timeout_at(at, stream.next())
                    .await
                    .map_err(|_| TransportError::DeadlineExceeded),
                None => Ok(stream.next().await),
            }
        };

        tokio::select! {
            biased;
            () = closed.cancelled() => Err(TransportError::ClosedLocally),
            next = read => match next? {
                Some(frame) => frame,
                None => Err(TransportError::Closed { code: CLOSE_ABNORMAL }),
            },
        }
    }

    fn check_limit(&self, data: Bytes) -> Result<Bytes, TransportError> {
        match self.control.limit {
            Some(limit) if data.len() > limit => Err(TransportError::MessageTooLarge {
                size: data.len(),
                limit,
            }),
            _ => Ok(data),
        }
    }
}

// ── Write half ──────────────────────────────────────────────────────────────

/// Write half of a [`Connection`].
pub struct ConnectionWriter {
    sink: FrameSink,
    write_wait: Option<Duration>,
}

impl ConnectionWriter {
    /// Bound every subsequent write to `wait` (`None` removes the bound).
    pub fn set_write_wait(&mut self, wait: Option<Duration>) {
        self.write_wait = wait;
    }

    /// Write one frame to completion.
    pub async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        match self.write_wait {
            Some(wait) => time::timeout_at(Instant::now() + wait, self.sink.send(frame))
                .await
                .map_err(|_| TransportError::WriteTimeout)?,
            None => self.sink.send(frame).await,
        }
    }
}
