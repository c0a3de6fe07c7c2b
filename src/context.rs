//! Shared collaborators for servers, clients and handles.

use std::sync::Arc;

use crate::config::TransportConfig;
use crate::connection::registry::{ConnectionRecord, ConnectionRegistry};
use crate::controller::{Client, Server};
use crate::observability::metrics;
use crate::transport::{ConnectionId, MemoryTransport, PskTcpTransport, Transport, TransportError};

/// One transport plus the registry of every connection opened through it.
///
/// Every controller created from the same context shares its registry.
/// Cloning is cheap.
#[derive(Clone)]
pub struct Context {
    transport: Arc<dyn Transport>,
    registry: Arc<ConnectionRegistry>,
}

impl Context {
    pub fn new(transport: impl Transport) -> Self {
        Self::with_transport(Arc::new(transport))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            registry: Arc::new(ConnectionRegistry::new()),
        }
    }

    /// Context backed by the TCP provider.
    pub fn tcp(config: TransportConfig) -> Self {
        Self::new(PskTcpTransport::new(config))
    }

    /// Context backed by the in-process provider.
    pub fn memory() -> Self {
        Self::new(MemoryTransport::new())
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn server(&self) -> Server {
        Server::new(self.clone())
    }

    pub fn client(&self) -> Client {
        Client::new(self.clone())
    }

    /// Tear down `id` if it is still registered.
    ///
    /// Removal from the registry is the single point where a connection
    /// becomes closed: only the caller that gets the record back shuts the
    /// transport down, every other caller gets `None`.
    pub(crate) async fn release(&self, id: ConnectionId, initiator: &'static str) -> Option<ConnectionRecord> {
        let record = self.registry.remove(id)?;
        self.finish_release(&record, initiator).await;
        Some(record)
    }

    /// Transport side of a close whose record the caller already removed.
    pub(crate) async fn finish_release(&self, record: &ConnectionRecord, initiator: &'static str) {
        let id = record.id();
        match self.transport.shutdown(id).await {
            Ok(()) | Err(TransportError::UnknownConnection(_)) => {}
            Err(e) => tracing::debug!(connection_id = %id, error = %e, "Transport shutdown reported an error"),
        }

        metrics::record_connection_closed(record.role().label(), initiator);
        tracing::debug!(connection_id = %id, initiator, "Connection closed");
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("connections", &self.registry.len())
            .field("listeners", &self.registry.listener_count())
            .finish()
    }
}
