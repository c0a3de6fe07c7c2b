//! Server controller.
//!
//! # Responsibilities
//! - Own at most one listening state per instance
//! - Drive the transport's accept loop
//! - Register each accepted connection and hand its handle to `onAccept`
//! - On stop, close every connection this instance accepted
//!
//! # State Machine
//! ```text
//! Idle --start ok--> Starting --listen ok--> Listening --stop--> Idle
//!                    Starting --listen err--> Idle        (StartError)
//!                    Starting --stop--> Idle              (start → StartError)
//! Listening --start--> Listening                           (AlreadyStarted)
//! Idle --stop--> Idle                                      (UnknownServer)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::connection::dispatcher;
use crate::connection::{ConnectionHandle, ConnectionRecord, Role, Subscriptions};
use crate::context::Context;
use crate::error::Error;
use crate::payload::PresharedKey;
use crate::transport::{Established, ListenerId, TransportError};

pub type AcceptCallback = Arc<dyn Fn(ConnectionHandle) + Send + Sync>;

struct ListeningState {
    id: ListenerId,
    port: u16,
    stop: CancellationToken,
    accept_loop: JoinHandle<()>,
}

enum ServerState {
    Idle,
    /// A start attempt is waiting on the transport.
    Starting(u64),
    Listening(ListeningState),
}

/// State shared with the accept loop.
struct Hooks {
    context: Context,
    defaults: Subscriptions,
    on_accept: ArcSwap<Option<AcceptCallback>>,
}

impl Hooks {
    fn admit(&self, listener: ListenerId, established: Established) {
        let record = ConnectionRecord::new(established, Role::ServerAccepted(listener));
        if let Err(e) = self.context.registry().register(record.clone()) {
            tracing::error!(error = %e, "Transport reused a live identifier, connection ignored");
            return;
        }

        // Later changes to the server defaults do not reach this handle.
        let subscriptions = Arc::new(Subscriptions::from_snapshot(self.defaults.snapshot()));
        let handle = ConnectionHandle::new(self.context.clone(), record, subscriptions);

        tracing::info!(
            connection_id = %handle.id(),
            peer_addr = %handle.peer_addr(),
            "Connection accepted"
        );

        if let Some(on_accept) = self.on_accept.load_full().as_ref() {
            on_accept(handle.clone());
        }
        dispatcher::spawn(handle);
    }
}

/// A PSK server: one listener at a time, any number of accepted connections.
pub struct Server {
    hooks: Arc<Hooks>,
    state: Mutex<ServerState>,
    attempts: AtomicU64,
}

impl Server {
    pub fn new(context: Context) -> Self {
        Self {
            hooks: Arc::new(Hooks {
                context,
                defaults: Subscriptions::new(),
                on_accept: ArcSwap::from_pointee(None),
            }),
            state: Mutex::new(ServerState::Idle),
            attempts: AtomicU64::new(0),
        }
    }

    /// Listener identifier while listening.
    pub fn id(&self) -> Option<ListenerId> {
        match &*self.state.lock() {
            ServerState::Listening(listening) => Some(listening.id),
            _ => None,
        }
    }

    /// Bound port while listening.
    pub fn port(&self) -> Option<u16> {
        match &*self.state.lock() {
            ServerState::Listening(listening) => Some(listening.port),
            _ => None,
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(&*self.state.lock(), ServerState::Listening(_))
    }

    /// Start listening. `None` picks an ephemeral port.
    pub async fn start(
        &self,
        key: impl Into<PresharedKey>,
        port: Option<u16>,
    ) -> Result<(ListenerId, u16), Error> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            if !matches!(*state, ServerState::Idle) {
                return Err(Error::AlreadyStarted);
            }
            *state = ServerState::Starting(attempt);
        }

        let key = key.into();
        let transport = self.hooks.context.transport().clone();
        let listening = match transport.listen(key.as_bytes(), port).await {
            Ok(listening) => listening,
            Err(e) => {
                tracing::warn!(port = ?port, error = %e, "Server failed to start");
                let mut state = self.state.lock();
                if matches!(*state, ServerState::Starting(a) if a == attempt) {
                    *state = ServerState::Idle;
                }
                return Err(Error::StartError);
            }
        };

        {
            let mut state = self.state.lock();
            if matches!(*state, ServerState::Starting(a) if a == attempt) {
                let stop = CancellationToken::new();
                self.hooks
                    .context
                    .registry()
                    .register_listener(listening.id, listening.port);

                let span = tracing::info_span!("server", listener_id = %listening.id, port = listening.port);
                let accept_loop = tokio::spawn(
                    accept_loop(self.hooks.clone(), listening.id, stop.clone()).instrument(span),
                );

                *state = ServerState::Listening(ListeningState {
                    id: listening.id,
                    port: listening.port,
                    stop,
                    accept_loop,
                });
                tracing::info!(listener_id = %listening.id, port = listening.port, "Server started");
                return Ok((listening.id, listening.port));
            }
        }

        tracing::info!(listener_id = %listening.id, "Server stopped while starting");
        let _ = transport.unlisten(listening.id).await;
        Err(Error::StartError)
    }

    /// Stop listening and close every connection this server accepted.
    pub async fn stop(&self) -> Result<(), Error> {
        let listening = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, ServerState::Idle) {
                ServerState::Listening(listening) => listening,
                ServerState::Starting(_) => return Ok(()),
                ServerState::Idle => return Err(Error::UnknownServer),
            }
        };

        teardown(&self.hooks, listening).await;
        Ok(())
    }

    pub fn subscribe_accept<F>(&self, callback: F)
    where
        F: Fn(ConnectionHandle) + Send + Sync + 'static,
    {
        let callback: AcceptCallback = Arc::new(callback);
        self.hooks.on_accept.store(Arc::new(Some(callback)));
    }

    pub fn unsubscribe_accept(&self) {
        self.hooks.on_accept.store(Arc::new(None));
    }

    /// Default receive subscriber copied into each newly accepted handle.
    pub fn subscribe_receive<F>(&self, callback: F)
    where
        F: Fn(&ConnectionHandle, Bytes) + Send + Sync + 'static,
    {
        self.hooks.defaults.subscribe_receive(callback);
    }

    pub fn unsubscribe_receive(&self) {
        self.hooks.defaults.unsubscribe_receive();
    }

    /// Default close subscriber copied into each newly accepted handle.
    pub fn subscribe_close<F>(&self, callback: F)
    where
        F: Fn(&ConnectionHandle) + Send + Sync + 'static,
    {
        self.hooks.defaults.subscribe_close(callback);
    }

    pub fn unsubscribe_close(&self) {
        self.hooks.defaults.unsubscribe_close();
    }

    pub fn context(&self) -> &Context {
        &self.hooks.context
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let ServerState::Listening(listening) = std::mem::replace(self.state.get_mut(), ServerState::Idle) {
            listening.stop.cancel();
            let hooks = self.hooks.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { teardown(&hooks, listening).await });
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id())
            .field("port", &self.port())
            .finish()
    }
}

async fn accept_loop(hooks: Arc<Hooks>, listener: ListenerId, stop: CancellationToken) {
    let transport = hooks.context.transport().clone();
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = transport.accept_next(listener) => next,
        };

        match next {
            Ok(established) if stop.is_cancelled() => {
                let _ = transport.shutdown(established.id).await;
                break;
            }
            Ok(established) => hooks.admit(listener, established),
            Err(TransportError::ListenerClosed) | Err(TransportError::UnknownListener(_)) => break,
            Err(e) => tracing::warn!(error = %e, "Accept failed"),
        }
    }
    tracing::debug!("Accept loop exited");
}

async fn teardown(hooks: &Hooks, listening: ListeningState) {
    listening.stop.cancel();
    if let Err(e) = hooks.context.transport().unlisten(listening.id).await {
        tracing::debug!(listener_id = %listening.id, error = %e, "Unlisten reported an error");
    }
    // No registrations can race the sweep below once the loop has exited.
    if let Err(e) = listening.accept_loop.await {
        tracing::error!(listener_id = %listening.id, error = %e, "Accept loop panicked");
    }

    let accepted = hooks.context.registry().accepted_by(listening.id);
    let closed = accepted.len();
    for id in accepted {
        hooks.context.release(id, "local").await;
    }
    hooks.context.registry().remove_listener(listening.id);

    tracing::info!(listener_id = %listening.id, port = listening.port, closed, "Server stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
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
    async fn starts_and_stops_on_requested_and_ephemeral_ports() {
        let server = Context::memory().server();
        for port in [Some(40000), None] {
            assert_eq!(server.id(), None);
            assert_eq!(server.port(), None);

            let (id, bound) = server.start(KEY, port).await.unwrap();
            assert_eq!(server.id(), Some(id));
            assert_eq!(server.port(), Some(bound));
            if let Some(port) = port {
                assert_eq!(bound, port);
            }
            assert_eq!(server.context().registry().listener_count(), 1);

            server.stop().await.unwrap();
            assert_eq!(server.id(), None);
            assert_eq!(server.port(), None);
            assert_eq!(server.context().registry().listener_count(), 0);
        }
    }

    #[tokio::test]
    async fn second_start_is_rejected_without_changing_state() {
        let server = Context::memory().server();
        let first = server.start(KEY, None).await.unwrap();

        assert_eq!(server.start(KEY, None).await, Err(Error::AlreadyStarted));
        assert_eq!(server.id(), Some(first.0));
        assert_eq!(server.port(), Some(first.1));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_requires_listening() {
        let server = Context::memory().server();
        assert_eq!(server.stop().await, Err(Error::UnknownServer));

        server.start(KEY, None).await.unwrap();
        server.stop().await.unwrap();
        assert_eq!(server.stop().await, Err(Error::UnknownServer));
    }

    #[tokio::test]
    async fn restricted_port_leaves_server_idle() {
        let server = Context::memory().server();
        assert_eq!(server.start(KEY, Some(9)).await, Err(Error::StartError));
        assert_eq!(server.id(), None);
        assert_eq!(server.port(), None);

        // Still usable afterwards.
        server.start(KEY, None).await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_starts_yield_one_winner() {
        let server = Context::memory().server();
        let results =
            futures_util::future::join_all((0..8).map(|_| server.start(KEY, None))).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| *e == Error::AlreadyStarted));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn accepted_handles_snapshot_server_defaults() {
        let context = Context::memory();
        let server = context.server();
        let (tx, mut accepted) = mpsc::unbounded_channel();
        server.subscribe_accept(move |handle| {
            let _ = tx.send(handle);
        });
        let (rx_tx, mut received) = mpsc::unbounded_channel();
        server.subscribe_receive(move |_, bytes: Bytes| {
            let _ = rx_tx.send(bytes);
        });
        let (_, port) = server.start(KEY, None).await.unwrap();

        let first = context.client();
        first.connect(KEY, "localhost", port).await.unwrap();
        let first_handle = recv(&mut accepted).await;

        // Only connections accepted after this point lose the default.
        server.unsubscribe_receive();
        let second = context.client();
        second.connect(KEY, "localhost", port).await.unwrap();
        let second_handle = recv(&mut accepted).await;

        assert!(first_handle.subscriptions().snapshot().has_receive());
        assert!(!second_handle.subscriptions().snapshot().has_receive());

        first.send("foobar").await.unwrap();
        assert_eq!(recv(&mut received).await.as_ref(), b"foobar");

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_closes_only_own_connections() {
        let context = Context::memory();
        let a = context.server();
        let b = context.server();
        let (a_id, a_port) = a.start(KEY, None).await.unwrap();
        let (b_id, b_port) = b.start([0xAB, 0xCD], None).await.unwrap();

        let (tx, mut accepted) = mpsc::unbounded_channel();
        let tx_b = tx.clone();
        a.subscribe_accept(move |h| {
            let _ = tx.send(h);
        });
        b.subscribe_accept(move |h| {
            let _ = tx_b.send(h);
        });

        let client_a = context.client();
        let client_b = context.client();
        client_a.connect(KEY, "localhost", a_port).await.unwrap();
        client_b.connect([0xAB, 0xCD], "localhost", b_port).await.unwrap();
        recv(&mut accepted).await;
        recv(&mut accepted).await;
        assert_eq!(context.registry().accepted_count(), 2);

        a.stop().await.unwrap();
        assert!(context.registry().accepted_by(a_id).is_empty());
        assert_eq!(context.registry().accepted_by(b_id).len(), 1);
        assert!(client_b.is_connected());

        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribed_accept_keeps_connection_alive() {
        let context = Context::memory();
        let server = context.server();
        let (id, port) = server.start(KEY, None).await.unwrap();

        let client = context.client();
        client.connect(KEY, "localhost", port).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while context.registry().accepted_by(id).is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        client.send("still here").await.unwrap();
        assert_eq!(context.registry().accepted_by(id).len(), 1);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_during_start_cancels_it() {
        use crate::transport::gated::GatedTransport;
        use std::sync::atomic::AtomicUsize;

        let transport = Arc::new(GatedTransport::new());
        let context = Context::with_transport(transport.clone());
        let server = Arc::new(context.server());
        let accepts = Arc::new(AtomicUsize::new(0));
        {
            let accepts = accepts.clone();
            server.subscribe_accept(move |_| {
                accepts.fetch_add(1, Ordering::SeqCst);
            });
        }

        transport.shut();
        let starting = {
            let server = server.clone();
            tokio::spawn(async move { server.start(KEY, Some(40200)).await })
        };
        transport.parked().await;
        assert!(!server.is_listening());
        assert_eq!(server.start(KEY, None).await, Err(Error::AlreadyStarted));

        server.stop().await.unwrap();
        transport.open();
        assert_eq!(starting.await.unwrap(), Err(Error::StartError));
        assert_eq!(server.id(), None);
        assert_eq!(context.registry().listener_count(), 0);
        assert_eq!(server.stop().await, Err(Error::UnknownServer));

        // The cancelled start left nothing listening behind.
        let client = context.client();
        assert_eq!(
            client.connect(KEY, "localhost", 40200).await,
            Err(Error::ConnectError)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 0);

        let (_, port) = server.start(KEY, Some(40200)).await.unwrap();
        assert_eq!(port, 40200);
        server.stop().await.unwrap();
    }
}
