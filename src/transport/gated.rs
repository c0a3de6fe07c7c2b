//! In-process provider whose `listen` and `dial` can be held in flight.

use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use crate::transport::{
    ConnectionId, Established, Inbound, ListenerId, Listening, MemoryTransport, Transport, TransportError,
};

/// Wraps [`MemoryTransport`]. While the gate is shut, `listen` and `dial`
/// park until `open` is called; every other operation passes through.
pub(crate) struct GatedTransport {
    inner: MemoryTransport,
    open: watch::Sender<bool>,
    parked: Notify,
}

impl GatedTransport {
    pub(crate) fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self {
            inner: MemoryTransport::new(),
            open,
            parked: Notify::new(),
        }
    }

    pub(crate) fn shut(&self) {
        self.open.send_replace(false);
    }

    pub(crate) fn open(&self) {
        self.open.send_replace(true);
    }

    /// Resolves once an operation is parked at the gate.
    pub(crate) async fn parked(&self) {
        self.parked.notified().await;
    }

    async fn pass(&self) {
        let mut open = self.open.subscribe();
        if *open.borrow_and_update() {
            return;
        }
        self.parked.notify_one();
        let _ = open.wait_for(|open| *open).await;
    }
}

#[async_trait]
impl Transport for GatedTransport {
    async fn listen(&self, key: &[u8], port: Option<u16>) -> Result<Listening, TransportError> {
        self.pass().await;
        self.inner.listen(key, port).await
    }

    async fn accept_next(&self, listener: ListenerId) -> Result<Established, TransportError> {
        self.inner.accept_next(listener).await
    }

    async fn dial(&self, key: &[u8], host: &str, port: u16) -> Result<Established, TransportError> {
        self.pass().await;
        self.inner.dial(key, host, port).await
    }

    async fn read(&self, id: ConnectionId) -> Result<Inbound, TransportError> {
        self.inner.read(id).await
    }

    async fn write(&self, id: ConnectionId, data: &[u8]) -> Result<(), TransportError> {
        self.inner.write(id, data).await
    }

    async fn shutdown(&self, id: ConnectionId) -> Result<(), TransportError> {
        self.inner.shutdown(id).await
    }

    async fn unlisten(&self, listener: ListenerId) -> Result<(), TransportError> {
        self.inner.unlisten(listener).await
    }
}
