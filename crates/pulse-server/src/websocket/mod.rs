//! `WebSocket` connection management, heartbeat, dispatch and broadcasting.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `frame` | Transport-neutral frame type and close codes |
//! | `connection` | Reader/writer halves with limit, deadlines and close latch |
//! | `transport` | Adapter from an axum `WebSocket` to a [`connection::Connection`] |
//! | `heartbeat` | Ping cadence and pong-driven read deadline |
//! | `client` | Read pump, write pump, outbound queue, teardown |
//! | `observer` | Pluggable sink for pump failures and lifecycle events |
//! | `manager` | Registry of live clients, broadcast |
//! | `router` | Event kind → handler dispatch |
//! | `handlers` | Built-in handlers (broadcast, echo) |
//!
//! ## Data Flow
//!
//! socket → `connection` → read pump → `router` → handlers → client outbound
//! queue → write pump → `connection` → socket.

pub mod client;
pub mod connection;
pub mod frame;
pub mod handlers;
pub mod heartbeat;
pub mod manager;
pub mod observer;
pub mod router;
pub mod transport;
