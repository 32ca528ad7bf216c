//! Transport-neutral frames.

use bytes::Bytes;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away (page navigation, server restart).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close frame carried no status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// One `WebSocket` frame as seen by the connection layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 data frame.
    Text(String),
    /// Binary data frame.
    Binary(Bytes),
    /// Liveness probe.
    Ping(Bytes),
    /// Liveness acknowledgement.
    Pong(Bytes),
    /// Closing handshake.
    Close(Option<CloseFrame>),
}

/// Payload of a close frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close status code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl Frame {
    /// Close frame with a status code and reason.
    pub fn close_with(code: u16, reason: impl Into<String>) -> Self {
        Self::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        }))
    }
}
