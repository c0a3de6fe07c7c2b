//! In-process transport provider.
//!
//! Listeners are keyed by port and connections are pairs of channels.
//! Keys are compared byte-for-byte at dial time; a mismatch fails the same
//! way a rejected network handshake does. No bytes leave the process.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::transport::{
    check_port, ConnectionId, Established, Inbound, ListenerId, Listening, Transport, TransportError,
};

const EPHEMERAL_START: u16 = 49152;
const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct MemoryListener {
    port: u16,
    key: Vec<u8>,
    queue: mpsc::UnboundedSender<Established>,
    incoming: Mutex<mpsc::UnboundedReceiver<Established>>,
    stop: CancellationToken,
}

struct Pipe {
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    closed: CancellationToken,
}

impl Pipe {
    fn new(inbound: mpsc::UnboundedReceiver<Bytes>, outbound: mpsc::UnboundedSender<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            inbound: Mutex::new(inbound),
            outbound: parking_lot::Mutex::new(Some(outbound)),
            closed: CancellationToken::new(),
        })
    }
}

fn broken_pipe() -> TransportError {
    std::io::Error::from(std::io::ErrorKind::BrokenPipe).into()
}

/// Transport that connects endpoints inside one process.
pub struct MemoryTransport {
    allow_privileged_ports: bool,
    next_port: AtomicU16,
    listeners: DashMap<ListenerId, Arc<MemoryListener>>,
    ports: DashMap<u16, ListenerId>,
    pipes: DashMap<ConnectionId, Arc<Pipe>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            allow_privileged_ports: false,
            next_port: AtomicU16::new(EPHEMERAL_START),
            listeners: DashMap::new(),
            ports: DashMap::new(),
            pipes: DashMap::new(),
        }
    }

    pub fn allow_privileged_ports(mut self, allow: bool) -> Self {
        self.allow_privileged_ports = allow;
        self
    }

    /// Number of open connection endpoints (two per dialed connection).
    pub fn open_endpoints(&self) -> usize {
        self.pipes.len()
    }

    fn claim_port(&self, requested: Option<u16>, id: ListenerId) -> Result<u16, TransportError> {
        if let Some(port) = requested.filter(|p| *p != 0) {
            return match self.ports.entry(port) {
                Entry::Occupied(_) => Err(TransportError::Bind(std::io::Error::from(
                    std::io::ErrorKind::AddrInUse,
                ))),
                Entry::Vacant(slot) => {
                    slot.insert(id);
                    Ok(port)
                }
            };
        }

        for _ in EPHEMERAL_START..=u16::MAX {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            let port = if port < EPHEMERAL_START {
                self.next_port.store(EPHEMERAL_START + 1, Ordering::Relaxed);
                EPHEMERAL_START
            } else {
                port
            };
            if let Entry::Vacant(slot) = self.ports.entry(port) {
                slot.insert(id);
                return Ok(port);
            }
        }
        Err(TransportError::Bind(std::io::Error::from(std::io::ErrorKind::AddrNotAvailable)))
    }

    fn pipe(&self, id: ConnectionId) -> Result<Arc<Pipe>, TransportError> {
        self.pipes
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::UnknownConnection(id))
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, key: &[u8], port: Option<u16>) -> Result<Listening, TransportError> {
        check_port(port, self.allow_privileged_ports)?;
        if key.is_empty() {
            return Err(TransportError::InvalidKey("key material is empty"));
        }

        let id = ListenerId::new();
        let port = self.claim_port(port, id)?;
        let (queue, incoming) = mpsc::unbounded_channel();
        self.listeners.insert(
            id,
            Arc::new(MemoryListener {
                port,
                key: key.to_vec(),
                queue,
                incoming: Mutex::new(incoming),
                stop: CancellationToken::new(),
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

    async fn dial(&self, key: &[u8], _host: &str, port: u16) -> Result<Established, TransportError> {
        if key.is_empty() {
            return Err(TransportError::InvalidKey("key material is empty"));
        }
        let refused = || TransportError::Unreachable(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));

        let listener_id = self.ports.get(&port).map(|entry| *entry.value()).ok_or_else(refused)?;
        let listener = self
            .listeners
            .get(&listener_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(refused)?;

        if listener.key != key {
            return Err(TransportError::Handshake("peer rejected the key".into()));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let client_id = ConnectionId::new();
        let server_id = ConnectionId::new();
        let client_addr = SocketAddr::new(LOOPBACK, self.next_port.fetch_add(1, Ordering::Relaxed));
        let server_addr = SocketAddr::new(LOOPBACK, listener.port);

        self.pipes.insert(client_id, Pipe::new(from_server, to_server));
        self.pipes.insert(server_id, Pipe::new(from_client, to_client));

        let accepted = Established {
            id: server_id,
            local_addr: server_addr,
            peer_addr: client_addr,
        };
        if listener.stop.is_cancelled() || listener.queue.send(accepted).is_err() {
            self.pipes.remove(&client_id);
            self.pipes.remove(&server_id);
            return Err(refused());
        }

        Ok(Established {
            id: client_id,
            local_addr: client_addr,
            peer_addr: server_addr,
        })
    }

    async fn read(&self, id: ConnectionId) -> Result<Inbound, TransportError> {
        let pipe = self.pipe(id)?;
        let mut inbound = pipe.inbound.lock().await;
        tokio::select! {
            _ = pipe.closed.cancelled() => Ok(Inbound::Closed),
            next = inbound.recv() => Ok(next.map_or(Inbound::Closed, Inbound::Data)),
        }
    }

    async fn write(&self, id: ConnectionId, data: &[u8]) -> Result<(), TransportError> {
        let pipe = self.pipe(id)?;
        if data.is_empty() {
            return Ok(());
        }
        let outbound = pipe.outbound.lock();
        outbound
            .as_ref()
            .ok_or_else(broken_pipe)?
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| broken_pipe())
    }

    async fn shutdown(&self, id: ConnectionId) -> Result<(), TransportError> {
        let (_, pipe) = self
            .pipes
            .remove(&id)
            .ok_or(TransportError::UnknownConnection(id))?;
        pipe.closed.cancel();
        pipe.outbound.lock().take();
        Ok(())
    }

    async fn unlisten(&self, listener: ListenerId) -> Result<(), TransportError> {
        let (_, slot) = self
            .listeners
            .remove(&listener)
            .ok_or(TransportError::UnknownListener(listener))?;
        self.ports.remove(&slot.port);
        slot.stop.cancel();

        let mut incoming = slot.incoming.lock().await;
        incoming.close();
        while let Ok(pending) = incoming.try_recv() {
            let _ = self.shutdown(pending.id).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_ports_are_distinct() {
        let transport = MemoryTransport::new();
        let a = transport.listen(b"k", None).await.unwrap();
        let b = transport.listen(b"k", None).await.unwrap();
        assert_ne!(a.port, b.port);
        assert!(a.port >= EPHEMERAL_START);
    }

    #[tokio::test]
    async fn explicit_port_in_use_fails_bind() {
        let transport = MemoryTransport::new();
        transport.listen(b"k", Some(40000)).await.unwrap();
        assert!(matches!(
            transport.listen(b"k", Some(40000)).await,
            Err(TransportError::Bind(_))
        ));
    }

    #[tokio::test]
    async fn privileged_ports_follow_policy() {
        assert!(matches!(
            MemoryTransport::new().listen(b"k", Some(9)).await,
            Err(TransportError::RestrictedPort(9))
        ));
        let permissive = MemoryTransport::new().allow_privileged_ports(true);
        assert_eq!(permissive.listen(b"k", Some(9)).await.unwrap().port, 9);
    }

    #[tokio::test]
    async fn dial_pairs_endpoints_and_carries_data() {
        let transport = MemoryTransport::new();
        let listening = transport.listen(b"k", None).await.unwrap();

        let client = transport.dial(b"k", "localhost", listening.port).await.unwrap();
        let server = transport.accept_next(listening.id).await.unwrap();
        assert_eq!(server.peer_addr, client.local_addr);
        assert_eq!(transport.open_endpoints(), 2);

        transport.write(client.id, b"foobar").await.unwrap();
        assert_eq!(
            transport.read(server.id).await.unwrap(),
            Inbound::Data(Bytes::from_static(b"foobar"))
        );

        transport.shutdown(server.id).await.unwrap();
        assert_eq!(transport.read(client.id).await.unwrap(), Inbound::Closed);
    }

    #[tokio::test]
    async fn wrong_key_and_missing_listener() {
        let transport = MemoryTransport::new();
        let listening = transport.listen(b"k", None).await.unwrap();

        assert!(matches!(
            transport.dial(b"other", "localhost", listening.port).await,
            Err(TransportError::Handshake(_))
        ));
        assert!(matches!(
            transport.dial(b"k", "localhost", 9).await,
            Err(TransportError::Unreachable(_))
        ));
        assert_eq!(transport.open_endpoints(), 0);
    }

    #[tokio::test]
    async fn unlisten_closes_unclaimed_connections() {
        let transport = MemoryTransport::new();
        let listening = transport.listen(b"k", None).await.unwrap();
        let client = transport.dial(b"k", "localhost", listening.port).await.unwrap();

        transport.unlisten(listening.id).await.unwrap();
        assert_eq!(transport.read(client.id).await.unwrap(), Inbound::Closed);
        assert!(matches!(
            transport.dial(b"k", "localhost", listening.port).await,
            Err(TransportError::Unreachable(_))
        ));
    }
}
