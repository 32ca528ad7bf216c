//! Error types shared by the connection, the pumps and the router.

use thiserror::Error;

use crate::websocket::frame::{CLOSE_ABNORMAL, CLOSE_GOING_AWAY, CLOSE_NORMAL};

/// Close codes that mean the peer simply went away.
const EXPECTED_CLOSE_CODES: [u16; 3] = [CLOSE_NORMAL, CLOSE_GOING_AWAY, CLOSE_ABNORMAL];

/// Failures reported by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer closed the connection (or the stream ended, reported as 1006).
    #[error("connection closed by peer (code {code})")]
    Closed {
        /// `WebSocket` close code.
        code: u16,
    },
    /// The connection was closed on our side while a read was pending.
    #[error("connection closed locally")]
    ClosedLocally,
    /// An operation was attempted on a connection that is already closed.
    #[error("use of closed connection")]
    ConnectionClosed,
    /// An inbound message exceeded the read limit.
    #[error("message of {size} bytes exceeds read limit of {limit} bytes")]
    MessageTooLarge {
        /// Size of the offending message.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
    /// No frame arrived before the read deadline.
    #[error("read deadline exceeded")]
    DeadlineExceeded,
    /// A single frame write did not finish within the write bound.
    #[error("write deadline exceeded")]
    WriteTimeout,
    /// Any other I/O or protocol failure.
    #[error("transport failure: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether this is an ordinary disconnect rather than something worth
    /// reporting.
    pub fn is_expected_close(&self) -> bool {
        match self {
            Self::Closed { code } => EXPECTED_CLOSE_CODES.contains(code),
            Self::ClosedLocally => true,
            _ => false,
        }
    }

    /// Whether the write pump must stop after this error on a data frame.
    ///
    /// A timed-out write leaves the sink usable; everything else means the
    /// socket is gone.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::WriteTimeout)
    }
}

/// Failures reported by the router for a decoded event.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RouteError {
    /// No handler is registered for the event kind.
    #[error("there is no such event kind: {0:?}")]
    UnknownKind(String),
    /// The handler rejected or failed to process the event.
    #[error("event handler failed: {0}")]
    Handler(String),
}

/// Failure to enqueue an outbound event.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SendError {
    /// The client is closing; its outbound queue accepts nothing more.
    #[error("client outbound queue is closed")]
    Closed,
    /// The queue slot is occupied (only from [`try_send`]).
    ///
    /// [`try_send`]: crate::websocket::client::Client::try_send
    #[error("client outbound queue is full")]
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_going_away_and_abnormal_are_expected() {
        for code in [1000, 1001, 1006] {
            assert!(TransportError::Closed { code }.is_expected_close(), "{code}");
        }
        assert!(TransportError::ClosedLocally.is_expected_close());
    }

    #[test]
    fn other_close_codes_are_unexpected() {
        for code in [1002, 1005, 1008, 1011] {
            assert!(!TransportError::Closed { code }.is_expected_close(), "{code}");
        }
        assert!(!TransportError::DeadlineExceeded.is_expected_close());
        assert!(!TransportError::Io("reset".into()).is_expected_close());
    }

    #[test]
    fn only_write_timeout_is_recoverable() {
        assert!(!TransportError::WriteTimeout.is_fatal());
        assert!(TransportError::ConnectionClosed.is_fatal());
        assert!(TransportError::Io("broken pipe".into()).is_fatal());
    }

    #[test]
    fn display_messages() {
        let err = TransportError::MessageTooLarge {
            size: 600,
            limit: 512,
        };
        assert_eq!(
            err.to_string(),
            "message of 600 bytes exceeds read limit of 512 bytes"
        );
        assert_eq!(
            RouteError::UnknownKind("nope".into()).to_string(),
            "there is no such event kind: \"nope\""
        );
        assert_eq!(SendError::Closed.to_string(), "client outbound queue is closed");
    }
}
