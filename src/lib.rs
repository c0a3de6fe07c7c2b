//! PSK-authenticated secure channel library.
//!
//! Servers and clients that authenticate each other with a shared secret
//! key instead of certificates, then exchange arbitrary byte payloads over
//! the resulting encrypted connection.

pub mod config;
pub mod connection;
pub mod context;
pub mod controller;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod payload;
pub mod transport;

pub use config::TlsPskConfig;
pub use connection::{ConnectionHandle, Role};
pub use context::Context;
pub use controller::{Client, Server};
pub use error::Error;
pub use lifecycle::wait_for_signal;
pub use payload::{Payload, PresharedKey};
pub use transport::{ConnectionId, ListenerId, MemoryTransport, PskTcpTransport, Transport};
