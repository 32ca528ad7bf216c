//! Adapter from an axum `WebSocket` to a [`Connection`].

use std::error::Error as StdError;
use std::io::{self, ErrorKind};

use axum::extract::ws::{self, Message, WebSocket};
use futures::{SinkExt, StreamExt, future};

use super::connection::Connection;
use super::frame::{CLOSE_ABNORMAL, CloseFrame, Frame};
use crate::errors::TransportError;

const MESSAGE_TOO_LONG: &str = "Message too long: ";
const CLOSED_MESSAGES: [&str; 2] = [
    "Connection closed normally",
    "Trying to work with closed connection",
];
const RESET_MESSAGE: &str = "Connection reset without closing handshake";

/// Wrap an upgraded socket.
pub fn from_websocket(socket: WebSocket) -> Connection {
    let (sink, stream) = socket.split();
    let stream = stream
        .map(|item| item.map(frame_from_message).map_err(map_ws_error))
        .boxed();
    let sink = sink
        .sink_map_err(map_ws_error)
        .with(|frame: Frame| future::ready(Ok::<_, TransportError>(message_from_frame(frame))));
    Connection::new(stream, Box::pin(sink))
}

/// Convert an inbound axum message.
pub fn frame_from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(close) => Frame::Close(close.map(|c| CloseFrame {
            code: c.code,
            reason: c.reason.as_str().to_owned(),
        })),
    }
}

/// Convert an outbound frame.
pub fn message_from_frame(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close(close) => Message::Close(close.map(|c| ws::CloseFrame {
            code: c.code,
            reason: c.reason.into(),
        })),
    }
}

/// Classify an axum socket error.
///
/// axum hides the tungstenite error type it links against, so socket
/// failures are recognised by their `io::Error` source, and protocol and
/// capacity failures by tungstenite's message text.
pub fn map_ws_error(error: axum::Error) -> TransportError {
    let inner = error.into_inner();
    let mut cause: Option<&(dyn StdError + 'static)> = Some(&*inner);
    while let Some(err) = cause {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            return map_io_error(io);
        }
        cause = err.source();
    }
    map_message(&inner.to_string())
}

fn map_io_error(error: &io::Error) -> TransportError {
    match error.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => TransportError::Closed {
            code: CLOSE_ABNORMAL,
        },
        _ => TransportError::Io(error.to_string()),
    }
}

fn map_message(text: &str) -> TransportError {
    if let Some((size, limit)) = parse_too_long(text) {
        TransportError::MessageTooLarge { size, limit }
    } else if CLOSED_MESSAGES.iter().any(|m| text.contains(m)) {
        TransportError::ConnectionClosed
    } else if text.contains(RESET_MESSAGE) {
        TransportError::Closed {
            code: CLOSE_ABNORMAL,
        }
    } else {
        TransportError::Io(text.to_owned())
    }
}

/// `"... Message too long: 628 > 512"` -> `(628, 512)`.
fn parse_too_long(text: &str) -> Option<(usize, usize)> {
    let start = text.find(MESSAGE_TOO_LONG)? + MESSAGE_TOO_LONG.len();
    let (size, limit) = text[start..].split_once(" > ")?;
    let limit = limit
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or_default();
    Some((size.trim().parse().ok()?, limit.parse().ok()?))
}
