//! TCP transport provider.
//!
//! Implements [`Transport`] over `tokio::net` with TLS 1.2 PSK channels
//! from `session.rs`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::TransportConfig;
use crate::observability::metrics;
use crate::transport::listener::PskListener;
use crate::transport::session::{self, PskKey, SecureChannel};
use crate::transport::{
    ConnectionId, Established, Inbound, ListenerId, Listening, Transport, TransportError,
};

pub(crate) type TcpChannel = SecureChannel<TcpStream>;
pub(crate) type ChannelMap = Arc<DashMap<ConnectionId, Arc<TcpChannel>>>;

struct ListenerSlot {
    incoming: Mutex<mpsc::Receiver<Established>>,
    stop: CancellationToken,
    /// Owns the bound socket; joined on unlisten so the port is free afterwards.
    accept_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// PSK transport over TCP.
pub struct PskTcpTransport {
    config: TransportConfig,
    listeners: DashMap<ListenerId, Arc<ListenerSlot>>,
    channels: ChannelMap,
}

impl PskTcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            listeners: DashMap::new(),
            channels: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn channel(&self, id: ConnectionId) -> Result<Arc<TcpChannel>, TransportError> {
        self.channels
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::UnknownConnection(id))
    }

    async fn establish(&self, key: &PskKey, host: &str, port: u16) -> Result<Established, TransportError> {
        let tls = session::connector(key)?;
        let stream = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::Timeout(self.config.connect_timeout()))?
            .map_err(TransportError::Unreachable)?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;

        let channel = tokio::time::timeout(self.config.handshake_timeout(), session::connect(&tls, stream))
            .await
            .map_err(|_| TransportError::Timeout(self.config.handshake_timeout()))??;
        tracing::debug!(peer_addr = %peer_addr, protocol = channel.protocol(), cipher = channel.cipher(), "TLS session established");

        let id = ConnectionId::new();
        self.channels.insert(id, Arc::new(channel));
        Ok(Established { id, local_addr, peer_addr })
    }
}

impl Default for PskTcpTransport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Drop for PskTcpTransport {
    fn drop(&mut self) {
        for slot in self.listeners.iter() {
            slot.stop.cancel();
        }
    }
}

#[async_trait]
impl Transport for PskTcpTransport {
    async fn listen(&self, key: &[u8], port: Option<u16>) -> Result<Listening, TransportError> {
        let key = PskKey::new(key)?;
        let listener = PskListener::bind(&self.config, &key, port).await?;
        let port = listener.local_addr().map_err(TransportError::Bind)?.port();

        let id = ListenerId::new();
        let (queue, incoming) = mpsc::channel(self.config.accept_backlog.max(1));
        let stop = CancellationToken::new();
        let accept_loop = tokio::spawn(
            listener
                .run(self.channels.clone(), queue, stop.clone())
                .instrument(tracing::info_span!("accept_loop", listener_id = %id, port)),
        );
        self.listeners.insert(
            id,
            Arc::new(ListenerSlot {
                incoming: Mutex::new(incoming),
                stop,
                accept_loop: parking_lot::Mutex::new(Some(accept_loop)),
            }),
        );

        Ok(Listening { id, port })
    }

    async fn accept_next(&self, listener: ListenerId) -> Result<Established, TransportError> {
        let slot = self
            .listeners
            .get(&listener)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::UnknownListener(listener))?;

        let mut incoming = slot.incoming.lock().await;
        tokio::select! {
            _ = slot.stop.cancelled() => Err(TransportError::ListenerClosed),
            next = incoming.recv() => next.ok_or(TransportError::ListenerClosed),
        }
    }

    async fn dial(&self, key: &[u8], host: &str, port: u16) -> Result<Established, TransportError> {
        let key = PskKey::new(key)?;
        let result = self.establish(&key, host, port).await;
        metrics::record_handshake("client", if result.is_ok() { "ok" } else { "failed" });
        result
    }

    async fn read(&self, id: ConnectionId) -> Result<Inbound, TransportError> {
        self.channel(id)?.recv().await
    }

    async fn write(&self, id: ConnectionId, data: &[u8]) -> Result<(), TransportError> {
        self.channel(id)?.send(data).await
    }

    async fn shutdown(&self, id: ConnectionId) -> Result<(), TransportError> {
        let (_, channel) = self
            .channels
            .remove(&id)
            .ok_or(TransportError::UnknownConnection(id))?;
        channel.close().await
    }

    async fn unlisten(&self, listener: ListenerId) -> Result<(), TransportError> {
        let (_, slot) = self
            .listeners
            .remove(&listener)
            .ok_or(TransportError::UnknownListener(listener))?;
        slot.stop.cancel();
        let accept_loop = slot.accept_loop.lock().take();
        if let Some(accept_loop) = accept_loop {
            if let Err(e) = accept_loop.await {
                tracing::error!(listener_id = %listener, error = %e, "Accept loop panicked");
            }
        }

        // Connections that finished their handshake but were never claimed.
        let mut incoming = slot.incoming.lock().await;
        incoming.close();
        while let Ok(pending) = incoming.try_recv() {
            let _ = self.shutdown(pending.id).await;
        }

        tracing::info!(listener_id = %listener, "Listener stopped");
        Ok(())
    }
}
