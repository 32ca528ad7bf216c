//! Reporting seam for pump failures and lifecycle transitions.

use std::fmt;

use pulse_core::{ClientId, CodecError};
use tracing::{debug, trace, warn};

use super::client::PumpExit;
use crate::errors::{RouteError, TransportError};

/// Which of a client's two tasks an event refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pump {
    /// Inbound task.
    Read,
    /// Outbound task.
    Write,
}

impl fmt::Display for Pump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Something worth reporting that happened inside a pump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PumpEvent {
    /// The peer went away normally (close 1000/1001/1006 or local teardown).
    Disconnected(TransportError),
    /// The read failed for any other reason.
    ReadFailed(TransportError),
    /// An inbound frame was not a valid event.
    DecodeFailed(CodecError),
    /// The router rejected an event; the read pump keeps going.
    RouteFailed {
        /// Kind of the rejected event.
        kind: String,
        /// Router's error.
        error: RouteError,
    },
    /// An outbound event could not be serialized.
    EncodeFailed(CodecError),
    /// Writing a data frame failed.
    WriteFailed(TransportError),
    /// Writing a ping failed.
    PingFailed(TransportError),
    /// The close notice could not be written.
    CloseNoticeFailed(TransportError),
    /// A pong arrived and the read deadline moved forward.
    PongReceived,
    /// A pump stopped.
    Exited {
        /// Which pump.
        pump: Pump,
        /// Why it stopped.
        exit: PumpExit,
    },
    /// The client was removed from the registry by this teardown.
    Deregistered,
}

/// Receives pump events for every client.
pub trait ClientObserver: Send + Sync {
    /// Called synchronously from the pump that produced `event`.
    fn observe(&self, client: &ClientId, event: &PumpEvent);
}

/// Default observer: logs through `tracing`.
///
/// Expected disconnects and routine lifecycle go to `debug`/`trace`; genuine
/// failures go to `warn`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl ClientObserver for TracingObserver {
    fn observe(&self, client: &ClientId, event: &PumpEvent) {
        match event {
            PumpEvent::Disconnected(reason) => {
                debug!(client_id = %client, %reason, "client disconnected");
            }
            PumpEvent::ReadFailed(error) => {
                warn!(client_id = %client, %error, "read failed");
            }
            PumpEvent::DecodeFailed(error) => {
                warn!(client_id = %client, %error, "dropping client after malformed event");
            }
            PumpEvent::RouteFailed { kind, error } => {
                warn!(client_id = %client, kind, %error, "event not routed");
            }
            PumpEvent::EncodeFailed(error) => {
                warn!(client_id = %client, %error, "failed to encode outbound event");
            }
            PumpEvent::WriteFailed(error) => {
                warn!(client_id = %client, %error, "write failed");
            }
            PumpEvent::PingFailed(error) => {
                warn!(client_id = %client, %error, "ping failed");
            }
            PumpEvent::CloseNoticeFailed(error) => {
                debug!(client_id = %client, %error, "close frame not delivered");
            }
            PumpEvent::PongReceived => trace!(client_id = %client, "pong"),
            PumpEvent::Exited { pump, exit } => {
                debug!(client_id = %client, %pump, reason = %exit, "pump exited");
            }
            PumpEvent::Deregistered => debug!(client_id = %client, "client deregistered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pump_display() {
        assert_eq!(Pump::Read.to_string(), "read");
        assert_eq!(Pump::Write.to_string(), "write");
    }

    #[test]
    fn tracing_observer_accepts_every_event() {
        let id = ClientId::from("client_test");
        let events = [
            PumpEvent::Disconnected(TransportError::Closed { code: 1000 }),
            PumpEvent::ReadFailed(TransportError::DeadlineExceeded),
            PumpEvent::DecodeFailed(CodecError::Decode("eof".into())),
            PumpEvent::RouteFailed {
                kind: "chat".into(),
                error: RouteError::UnknownKind("chat".into()),
            },
            PumpEvent::PongReceived,
            PumpEvent::Exited {
                pump: Pump::Write,
                exit: PumpExit::QueueClosed,
            },
            PumpEvent::Deregistered,
        ];
        for event in &events {
            TracingObserver.observe(&id, event);
        }
    }
}
