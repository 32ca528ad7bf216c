//! # pulse-server
//!
//! Axum `WebSocket` relay built around one idea: every connected client is
//! served by exactly two tasks, a read pump and a write pump, and tears down
//! through a single idempotent path no matter which of them fails first.
//!
//! - [`websocket::connection`]: framed transport with read limit, read
//!   deadline, write bound and close latch
//! - [`websocket::client`]: the pumps, the outbound queue and the lifecycle
//! - [`websocket::heartbeat`]: ping cadence and pong-driven deadline extension
//! - [`websocket::manager`]: registry of live clients and broadcast
//! - [`websocket::router`]: kind-to-handler dispatch
//! - [`server`]: HTTP routes (`/ws`, `/health`, `/metrics`) and graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod testutil;
pub mod websocket;
