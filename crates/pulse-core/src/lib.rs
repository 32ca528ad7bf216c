//! # pulse-core
//!
//! Shared building blocks for the Pulse relay:
//!
//! - [`Event`]: the JSON envelope exchanged with peers (`{kind, payload}`)
//! - [`ClientId`]: identity of one connected client
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod event;
pub mod ids;
pub mod logging;

pub use event::{CodecError, Event};
pub use ids::ClientId;
