//! Client controller.
//!
//! # State Machine
//! ```text
//! Disconnected --connect--> Connecting --dial ok--> Connected
//!                           Connecting --dial err--> Disconnected  (ConnectError)
//!                           Connecting --close--> Disconnected     (connect → ConnectError)
//! Connected --close / peer close--> Disconnected
//! ```
//!
//! A connection closed by the peer leaves the client disconnected; the
//! next `connect` resets the stale state instead of failing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::connection::dispatcher;
use crate::connection::{ConnectionHandle, ConnectionRecord, Role, Subscriptions};
use crate::context::Context;
use crate::error::Error;
use crate::payload::{Payload, PresharedKey};
use crate::transport::ConnectionId;

#[derive(Clone)]
struct Session {
    handle: ConnectionHandle,
    host: String,
    port: u16,
}

enum ClientState {
    Disconnected,
    /// A dial is in flight for the given attempt.
    Connecting(u64),
    Connected(Session),
}

/// A PSK client holding at most one connection.
///
/// Subscriptions live on the client and are shared with every connection it
/// opens, so they may be set before `connect`.
pub struct Client {
    context: Context,
    state: Mutex<ClientState>,
    subscriptions: Arc<Subscriptions>,
    attempts: AtomicU64,
}

impl Client {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            state: Mutex::new(ClientState::Disconnected),
            subscriptions: Arc::new(Subscriptions::new()),
            attempts: AtomicU64::new(0),
        }
    }

    /// Open a connection to `host:port` keyed by `key`.
    ///
    /// Every failure (unreachable host, handshake rejected, timeout) is
    /// reported as `ConnectError`.
    pub async fn connect(
        &self,
        key: impl Into<PresharedKey>,
        host: impl Into<String>,
        port: u16,
    ) -> Result<ConnectionId, Error> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            match &*state {
                ClientState::Connecting(_) => return Err(Error::AlreadyConnected),
                ClientState::Connected(session) if session.handle.is_open() => {
                    return Err(Error::AlreadyConnected)
                }
                _ => {}
            }
            *state = ClientState::Connecting(attempt);
        }

        let key = key.into();
        let host = host.into();
        let transport = self.context.transport().clone();

        let established = match transport.dial(key.as_bytes(), &host, port).await {
            Ok(established) => established,
            Err(e) => {
                tracing::debug!(host = %host, port, error = %e, "Connect failed");
                let mut state = self.state.lock();
                if matches!(*state, ClientState::Connecting(a) if a == attempt) {
                    *state = ClientState::Disconnected;
                }
                return Err(Error::ConnectError);
            }
        };

        let handle = {
            let mut state = self.state.lock();
            if matches!(*state, ClientState::Connecting(a) if a == attempt) {
                let record = ConnectionRecord::new(established, Role::Client);
                if let Err(e) = self.context.registry().register(record.clone()) {
                    tracing::error!(error = %e, "Transport reused a live identifier");
                    *state = ClientState::Disconnected;
                    return Err(Error::ConnectError);
                }
                let handle = ConnectionHandle::new(self.context.clone(), record, self.subscriptions.clone());
                *state = ClientState::Connected(Session {
                    handle: handle.clone(),
                    host: host.clone(),
                    port,
                });
                Some(handle)
            } else {
                None
            }
        };

        match handle {
            Some(handle) => {
                tracing::info!(connection_id = %handle.id(), host = %host, port, "Client connected");
                dispatcher::spawn(handle.clone());
                Ok(handle.id())
            }
            None => {
                tracing::info!(host = %host, port, "Client closed while connecting");
                let _ = transport.shutdown(established.id).await;
                Err(Error::ConnectError)
            }
        }
    }

    /// Close the current connection, or abandon an in-flight connect.
    pub async fn close(&self) -> Result<(), Error> {
        let session = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, ClientState::Disconnected) {
                ClientState::Connected(session) => session,
                ClientState::Connecting(_) => return Ok(()),
                ClientState::Disconnected => return Err(Error::UnknownClient),
            }
        };

        session
            .handle
            .close()
            .await
            .map_err(|_| Error::UnknownClient)?;
        tracing::info!(connection_id = %session.handle.id(), host = %session.host, port = session.port, "Client closed");
        Ok(())
    }

    pub async fn send(&self, data: impl Into<Payload>) -> Result<(), Error> {
        let session = self.session().ok_or(Error::UnknownClient)?;
        session
            .handle
            .send(data)
            .await
            .map_err(|_| Error::UnknownClient)
    }

    pub fn id(&self) -> Option<ConnectionId> {
        self.session().map(|session| session.handle.id())
    }

    pub fn host(&self) -> Option<String> {
        self.session().map(|session| session.host)
    }

    pub fn port(&self) -> Option<u16> {
        self.session().map(|session| session.port)
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.session().map(|session| session.handle)
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_some()
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    pub fn subscribe_receive<F>(&self, callback: F)
    where
        F: Fn(&ConnectionHandle, Bytes) + Send + Sync + 'static,
    {
        self.subscriptions.subscribe_receive(callback);
    }

    pub fn unsubscribe_receive(&self) {
        self.subscriptions.unsubscribe_receive();
    }

    pub fn subscribe_close<F>(&self, callback: F)
    where
        F: Fn(&ConnectionHandle) + Send + Sync + 'static,
    {
        self.subscriptions.subscribe_close(callback);
    }

    pub fn unsubscribe_close(&self) {
        self.subscriptions.unsubscribe_close();
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Current session if its connection is still registered.
    fn session(&self) -> Option<Session> {
        let mut state = self.state.lock();
        if let ClientState::Connected(session) = &*state {
            if session.handle.is_open() {
                return Some(session.clone());
            }
        } else {
            return None;
        }
        *state = ClientState::Disconnected;
        None
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let ClientState::Connected(session) = std::mem::replace(self.state.get_mut(), ClientState::Disconnected) {
            if !session.handle.is_open() {
                return;
            }
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = session.handle.close().await;
                });
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id())
            .field("host", &self.host())
            .field("port", &self.port())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::gated::GatedTransport;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const KEY: [u8; 2] = [0x01, 0x23];

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn operations_require_a_connection() {
        let client = Context::memory().client();
        assert_eq!(client.send("x").await, Err(Error::UnknownClient));
        assert_eq!(client.close().await, Err(Error::UnknownClient));
        assert_eq!(client.id(), None);
        assert_eq!(client.host(), None);
        assert_eq!(client.port(), None);
    }

    #[tokio::test]
    async fn failed_connect_leaves_nothing_behind() {
        let context = Context::memory();
        let client = context.client();
        assert_eq!(
            client.connect(KEY, "localhost", 40001).await,
            Err(Error::ConnectError)
        );
        assert!(!client.is_connected());
        assert!(context.registry().is_empty());
    }

    #[tokio::test]
    async fn key_mismatch_is_a_connect_error() {
        let context = Context::memory();
        let server = context.server();
        let (_, port) = server.start(KEY, None).await.unwrap();

        let client = context.client();
        assert_eq!(
            client.connect([0xAB, 0xCD], "localhost", port).await,
            Err(Error::ConnectError)
        );
        assert_eq!(context.registry().accepted_count(), 0);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn connect_exposes_session_and_rejects_a_second_connect() {
        let context = Context::memory();
        let server = context.server();
        let (_, port) = server.start(KEY, None).await.unwrap();

        let client = context.client();
        let id = client.connect(KEY, "localhost", port).await.unwrap();
        assert_eq!(client.id(), Some(id));
        assert_eq!(client.host().as_deref(), Some("localhost"));
        assert_eq!(client.port(), Some(port));

        assert_eq!(
            client.connect(KEY, "localhost", port).await,
            Err(Error::AlreadyConnected)
        );
        assert_eq!(client.id(), Some(id));
        client.send("still usable").await.unwrap();

        client.close().await.unwrap();
        assert_eq!(client.id(), None);
        assert_eq!(client.close().await, Err(Error::UnknownClient));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn peer_close_disconnects_and_allows_reconnect() {
        let context = Context::memory();
        let server = context.server();
        let (tx, mut accepted) = mpsc::unbounded_channel();
        server.subscribe_accept(move |handle| {
            let _ = tx.send(handle);
        });
        let (_, port) = server.start(KEY, None).await.unwrap();

        let client = context.client();
        let (close_tx, mut closed) = mpsc::unbounded_channel();
        client.subscribe_close(move |handle| {
            let _ = close_tx.send(handle.id());
        });

        let first = client.connect(KEY, "localhost", port).await.unwrap();
        let server_side = recv(&mut accepted).await;
        server_side.close().await.unwrap();

        assert_eq!(recv(&mut closed).await, first);
        assert!(!client.is_connected());
        assert_eq!(client.send("gone").await, Err(Error::UnknownClient));

        let second = client.connect(KEY, "localhost", port).await.unwrap();
        assert_ne!(first, second);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn receive_subscription_set_before_connect_applies() {
        let context = Context::memory();
        let server = context.server();
        server.subscribe_receive(|handle, bytes| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let _ = handle.send(bytes).await;
            });
        });
        let (_, port) = server.start(KEY, None).await.unwrap();

        let client = context.client();
        let (tx, mut received) = mpsc::unbounded_channel();
        client.subscribe_receive(move |_, bytes| {
            let _ = tx.send(bytes);
        });
        client.connect(KEY, "localhost", port).await.unwrap();
        client.send(vec![1u8, 2, 3]).await.unwrap();

        assert_eq!(recv(&mut received).await.as_ref(), &[1, 2, 3]);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn close_during_connect_cancels_it_without_events() {
        let transport = Arc::new(GatedTransport::new());
        let context = Context::with_transport(transport.clone());
        let server = context.server();
        server.subscribe_accept(|handle| {
            tokio::spawn(async move {
                let _ = handle.send("hello").await;
            });
        });
        let (_, port) = server.start(KEY, None).await.unwrap();

        let client = Arc::new(context.client());
        let (tx, mut events) = mpsc::unbounded_channel();
        let close_tx = tx.clone();
        client.subscribe_receive(move |_, bytes| {
            let _ = tx.send(format!("receive {}", bytes.len()));
        });
        client.subscribe_close(move |_| {
            let _ = close_tx.send("close".to_string());
        });

        transport.shut();
        let connecting = {
            let client = client.clone();
            tokio::spawn(async move { client.connect(KEY, "localhost", port).await })
        };
        transport.parked().await;
        client.close().await.unwrap();
        assert!(!client.is_connected());

        transport.open();
        assert_eq!(connecting.await.unwrap(), Err(Error::ConnectError));
        assert!(!client.is_connected());
        assert_eq!(client.id(), None);
        assert_eq!(client.close().await, Err(Error::UnknownClient));
        assert_eq!(context.registry().client_count(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err(), "no events after a cancelled connect");
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_connects_yield_exactly_one_session() {
        let transport = Arc::new(GatedTransport::new());
        let context = Context::with_transport(transport.clone());
        let server = context.server();
        let (_, port) = server.start(KEY, None).await.unwrap();
        let client = Arc::new(context.client());

        transport.shut();
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.connect(KEY, "localhost", port).await })
            })
            .collect();
        transport.parked().await;
        transport.open();

        let (mut connected, mut rejected) = (Vec::new(), 0);
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(id) => connected.push(id),
                Err(Error::AlreadyConnected) => rejected += 1,
                other => panic!("unexpected connect result {other:?}"),
            }
        }
        assert_eq!(connected.len(), 1);
        assert_eq!(rejected, 7);
        assert_eq!(client.id(), Some(connected[0]));
        assert_eq!(context.registry().client_count(), 1);

        client.close().await.unwrap();
        server.stop().await.unwrap();
    }
}
