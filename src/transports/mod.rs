//! Transport implementations for the peer lobby protocol.
//!
//! | Feature                | Module        | Provides |
//! |------------------------|---------------|----------|
//! | (always)               | [`memory`]    | [`MemoryBroker`], [`MemoryNetwork`], [`MemoryConnection`] |
//! | `transport-websocket`  | `websocket`   | `WebSocketTransport` |
//!
//! The memory broker implements the full [`PeerNetwork`](crate::PeerNetwork)
//! contract in-process. `WebSocketTransport` is a single data connection; pair
//! it with a [`PeerNetwork`](crate::PeerNetwork) implementation that performs
//! discovery for your deployment.

pub mod memory;

#[cfg(feature = "transport-websocket")]
pub mod websocket;

pub use memory::{MemoryBroker, MemoryConnection, MemoryNetwork};

#[cfg(feature = "transport-websocket")]
pub use websocket::WebSocketTransport;
