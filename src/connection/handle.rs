//! Connection handles and their subscriptions.
//!
//! # Responsibilities
//! - Expose send/close for one registered connection
//! - Hold the receive/close subscriptions the dispatcher delivers to
//!
//! # Design Decisions
//! - A handle addresses its connection by identifier; whether it is still
//!   open is always answered by the registry record, never by the handle
//! - Subscriptions are an immutable set behind `ArcSwap`: delivery loads a
//!   snapshot without locking, and a server's defaults are copied into a
//!   new handle by taking one snapshot at accept time

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::connection::registry::{ConnectionRecord, Role};
use crate::context::Context;
use crate::error::Error;
use crate::observability::metrics;
use crate::payload::Payload;
use crate::transport::{ConnectionId, TransportError};

pub type ReceiveCallback = Arc<dyn Fn(&ConnectionHandle, Bytes) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&ConnectionHandle) + Send + Sync>;

/// Callbacks subscribed to one connection's events.
#[derive(Clone, Default)]
pub struct SubscriptionSet {
    on_receive: Option<ReceiveCallback>,
    on_close: Option<CloseCallback>,
}

impl SubscriptionSet {
    pub fn has_receive(&self) -> bool {
        self.on_receive.is_some()
    }

    pub fn has_close(&self) -> bool {
        self.on_close.is_some()
    }
}

impl std::fmt::Debug for SubscriptionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSet")
            .field("on_receive", &self.has_receive())
            .field("on_close", &self.has_close())
            .finish()
    }
}

/// Mutable subscription slot; replace or clear callbacks at any time.
pub struct Subscriptions {
    current: ArcSwap<SubscriptionSet>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::from_snapshot(Arc::new(SubscriptionSet::default()))
    }

    pub fn from_snapshot(set: Arc<SubscriptionSet>) -> Self {
        Self {
            current: ArcSwap::new(set),
        }
    }

    pub fn snapshot(&self) -> Arc<SubscriptionSet> {
        self.current.load_full()
    }

    pub fn subscribe_receive<F>(&self, callback: F)
    where
        F: Fn(&ConnectionHandle, Bytes) + Send + Sync + 'static,
    {
        let callback: ReceiveCallback = Arc::new(callback);
        self.update(|set| set.on_receive = Some(callback.clone()));
    }

    pub fn unsubscribe_receive(&self) {
        self.update(|set| set.on_receive = None);
    }

    pub fn subscribe_close<F>(&self, callback: F)
    where
        F: Fn(&ConnectionHandle) + Send + Sync + 'static,
    {
        let callback: CloseCallback = Arc::new(callback);
        self.update(|set| set.on_close = Some(callback.clone()));
    }

    pub fn unsubscribe_close(&self) {
        self.update(|set| set.on_close = None);
    }

    fn update(&self, apply: impl Fn(&mut SubscriptionSet)) {
        self.current.rcu(|current| {
            let mut next = SubscriptionSet::clone(current);
            apply(&mut next);
            next
        });
    }
}

impl Default for Subscriptions {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.snapshot(), f)
    }
}

struct HandleInner {
    record: ConnectionRecord,
    context: Context,
    subscriptions: Arc<Subscriptions>,
}

/// Caller-facing view of one connection, client-side or server-accepted.
///
/// Clones refer to the same connection and compare equal.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub(crate) fn new(context: Context, record: ConnectionRecord, subscriptions: Arc<Subscriptions>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                record,
                context,
                subscriptions,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.record.id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.record.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.record.peer_addr()
    }

    pub fn role(&self) -> Role {
        self.inner.record.role()
    }

    pub fn is_open(&self) -> bool {
        self.inner.record.is_live()
    }

    /// Send one payload. No framing is added.
    pub async fn send(&self, data: impl Into<Payload>) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::UnknownConnection);
        }

        let bytes = data.into().into_bytes();
        match self.inner.context.transport().write(self.id(), &bytes).await {
            Ok(()) => {
                metrics::record_bytes("sent", bytes.len());
                tracing::trace!(connection_id = %self.id(), len = bytes.len(), "Payload sent");
                Ok(())
            }
            Err(TransportError::UnknownConnection(_)) => Err(Error::UnknownConnection),
            Err(e) => {
                tracing::warn!(connection_id = %self.id(), error = %e, "Send failed");
                Err(Error::UnknownConnection)
            }
        }
    }

    /// Close the connection. A second call fails with `UnknownConnection`.
    ///
    /// The local close subscriber is not invoked; the peer's is.
    pub async fn close(&self) -> Result<(), Error> {
        self.inner
            .context
            .release(self.id(), "local")
            .await
            .map(|_| ())
            .ok_or(Error::UnknownConnection)
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.inner.subscriptions
    }

    pub fn subscribe_receive<F>(&self, callback: F)
    where
        F: Fn(&ConnectionHandle, Bytes) + Send + Sync + 'static,
    {
        self.inner.subscriptions.subscribe_receive(callback);
    }

    pub fn unsubscribe_receive(&self) {
        self.inner.subscriptions.unsubscribe_receive();
    }

    pub fn subscribe_close<F>(&self, callback: F)
    where
        F: Fn(&ConnectionHandle) + Send + Sync + 'static,
    {
        self.inner.subscriptions.subscribe_close(callback);
    }

    pub fn unsubscribe_close(&self) {
        self.inner.subscriptions.unsubscribe_close();
    }

    pub(crate) fn context(&self) -> &Context {
        &self.inner.context
    }

    pub(crate) fn closed(&self) -> &CancellationToken {
        self.inner.record.closed()
    }

    pub(crate) fn deliver_receive(&self, bytes: Bytes) {
        if !self.is_open() {
            return;
        }
        match &self.inner.subscriptions.snapshot().on_receive {
            Some(callback) => callback(self, bytes),
            None => tracing::trace!(connection_id = %self.id(), len = bytes.len(), "No receive subscriber, payload dropped"),
        }
    }

    /// Peer or transport closed the connection.
    ///
    /// `onClose` runs before the transport is shut down. The record is
    /// claimed first, so a concurrent local close finds nothing to do and
    /// the callback sees `is_open() == false`.
    pub(crate) async fn remote_closed(&self, initiator: &'static str) {
        let context = &self.inner.context;
        let Some(record) = context.registry().remove(self.id()) else {
            return;
        };
        if let Some(callback) = &self.inner.subscriptions.snapshot().on_close {
            callback(self);
        }
        context.finish_release(&record, initiator).await;
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ConnectionHandle {}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("peer_addr", &self.peer_addr())
            .field("role", &self.role())
            .field("open", &self.is_open())
            .finish()
    }
}
