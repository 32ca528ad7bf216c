//! Wire envelope for application events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// An application event as it travels over the wire.
///
/// Serialized as `{"kind": "...", "payload": ...}`, one text frame per
/// event. The payload is opaque to the relay; its shape belongs to whichever
/// handler owns `kind`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Discriminator used to pick a handler.
    #[serde(default)]
    pub kind: String,
    /// Handler-defined body.
    #[serde(default)]
    pub payload: Value,
}

/// Errors raised while converting between [`Event`] and its wire form.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Inbound bytes were not a valid event envelope.
    #[error("failed to decode event: {0}")]
    Decode(String),
    /// The event could not be serialized.
    #[error("failed to encode event: {0}")]
    Encode(String),
}

impl Event {
    /// Build an event from a kind and a payload.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Decode an event from a raw frame payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    /// Encode the event to its JSON text form.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Encode(e.to_string()))
    }
}
