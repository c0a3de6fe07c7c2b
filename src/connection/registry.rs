//! Connection registry.
//!
//! # Responsibilities
//! - Map each live connection identifier to its record
//! - Track listening servers
//! - Answer "is this connection alive" for every other component
//!
//! # Design Decisions
//! - Presence in the map is liveness; `remove` also cancels the record's
//!   token so clones held by handles and dispatchers observe the close
//! - `DashMap` entries are never held across an `.await`

use std::net::SocketAddr;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::observability::metrics;
use crate::transport::{ConnectionId, Established, ListenerId};

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Dialed by a client controller.
    Client,
    /// Accepted by the server controller listening as the given listener.
    ServerAccepted(ListenerId),
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::ServerAccepted(_) => "server",
        }
    }
}

/// One live connection.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    id: ConnectionId,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    role: Role,
    live: CancellationToken,
}

impl ConnectionRecord {
    pub fn new(established: Established, role: Role) -> Self {
        Self {
            id: established.id,
            local_addr: established.local_addr,
            peer_addr: established.peer_addr,
            role,
            live: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_live(&self) -> bool {
        !self.live.is_cancelled()
    }

    /// Token cancelled when the record leaves the registry.
    pub(crate) fn closed(&self) -> &CancellationToken {
        &self.live
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate connection identifier {0}")]
    DuplicateIdentifier(ConnectionId),
}

/// Table of live connections and listeners.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionRecord>,
    listeners: DashMap<ListenerId, u16>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, record: ConnectionRecord) -> Result<(), RegistryError> {
        match self.connections.entry(record.id) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateIdentifier(record.id)),
            Entry::Vacant(slot) => {
                metrics::record_connection_opened(record.role.label());
                tracing::debug!(
                    connection_id = %record.id,
                    peer_addr = %record.peer_addr,
                    role = record.role.label(),
                    "Connection registered"
                );
                slot.insert(record);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Remove and mark closed. Idempotent: later calls return `None`.
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        let (_, record) = self.connections.remove(&id)?;
        record.live.cancel();
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Live connections opened by client controllers.
    pub fn client_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.role == Role::Client)
            .count()
    }

    /// Live connections accepted by any server.
    pub fn accepted_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| matches!(entry.role, Role::ServerAccepted(_)))
            .count()
    }

    /// Live connections accepted by one listener.
    pub fn accepted_by(&self, listener: ListenerId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| entry.role == Role::ServerAccepted(listener))
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn register_listener(&self, id: ListenerId, port: u16) {
        self.listeners.insert(id, port);
        metrics::record_listener_started();
    }

    pub fn remove_listener(&self, id: ListenerId) -> Option<u16> {
        let (_, port) = self.listeners.remove(&id)?;
        metrics::record_listener_stopped();
        Some(port)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
