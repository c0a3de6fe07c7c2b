//! Transport provider subsystem.
//!
//! # Data Flow
//! ```text
//! listen(key, port?)  → listener.rs (bind, bounded accept, TLS accept)
//!                     → accept_next drains completed handshakes
//! dial(key, host, port) → tcp.rs (connect, TLS connect)
//!
//! Established connection:
//!     session.rs (TLS 1.2 PSK channel)
//!         read  → decrypt → Inbound::Data | Inbound::Closed
//!         write → encrypt
//! ```
//!
//! # Design Decisions
//! - The core only sees the `Transport` trait; providers mint identifiers
//! - Provider errors stay inside this crate's internals and are collapsed
//!   into the caller-facing taxonomy by the controllers
//! - `memory.rs` implements the same contract in-process for tests

#[cfg(test)]
pub(crate) mod gated;
pub mod listener;
pub mod memory;
pub mod session;
pub mod tcp;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryTransport;
pub use tcp::PskTcpTransport;

/// Identifier of one established connection, minted by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifier of one listening endpoint, minted by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Result of a successful `listen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listening {
    pub id: ListenerId,
    pub port: u16,
}

/// A connection whose handshake completed, from either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Established {
    pub id: ConnectionId,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// Next inbound event on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Data(Bytes),
    Closed,
}

/// Errors raised by transport providers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("port {0} is restricted")]
    RestrictedPort(u16),

    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),

    #[error("invalid key: {0}")]
    InvalidKey(&'static str),

    #[error("peer unreachable: {0}")]
    Unreachable(#[source] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("unknown listener {0}")]
    UnknownListener(ListenerId),

    #[error("listener closed")]
    ListenerClosed,

    #[error("TLS error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The PSK transport collaborator.
///
/// Implementations must be safe to call concurrently: accept, read, write
/// and shutdown for different (or the same) identifiers may overlap.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start listening. `None` asks for an ephemeral port.
    async fn listen(&self, key: &[u8], port: Option<u16>) -> Result<Listening, TransportError>;

    /// Wait for the next completed inbound handshake.
    ///
    /// Fails with `ListenerClosed` once the listener has been stopped.
    async fn accept_next(&self, listener: ListenerId) -> Result<Established, TransportError>;

    /// Connect and complete the handshake as initiator.
    async fn dial(&self, key: &[u8], host: &str, port: u16) -> Result<Established, TransportError>;

    /// Wait for the next inbound event. Resolves `Closed` after `shutdown`.
    async fn read(&self, id: ConnectionId) -> Result<Inbound, TransportError>;

    async fn write(&self, id: ConnectionId, data: &[u8]) -> Result<(), TransportError>;

    async fn shutdown(&self, id: ConnectionId) -> Result<(), TransportError>;

    async fn unlisten(&self, listener: ListenerId) -> Result<(), TransportError>;
}

/// Reject ports below 1024 unless the configuration allows them.
pub(crate) fn check_port(port: Option<u16>, allow_privileged: bool) -> Result<(), TransportError> {
    match port {
        Some(p) if p != 0 && p < 1024 && !allow_privileged => Err(TransportError::RestrictedPort(p)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
        assert_ne!(ListenerId::new(), ListenerId::new());
    }

    #[test]
    fn privileged_ports_are_restricted_by_default() {
        assert!(matches!(check_port(Some(9), false), Err(TransportError::RestrictedPort(9))));
        assert!(check_port(Some(9), true).is_ok());
        assert!(check_port(Some(0), false).is_ok());
        assert!(check_port(None, false).is_ok());
        assert!(check_port(Some(40000), false).is_ok());
    }
}
