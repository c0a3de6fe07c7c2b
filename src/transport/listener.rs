//! TCP listener with bounded PSK handshakes.
//!
//! # Responsibilities
//! - Bind to the configured address and requested port
//! - Accept incoming TCP connections
//! - Enforce `max_pending_handshakes` via semaphore
//! - Run the TLS accept handshake per connection under a deadline
//! - Queue completed connections for `accept_next`

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use openssl::ssl::SslContext;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::observability::metrics;
use crate::transport::session::{self, PskKey};
use crate::transport::tcp::{ChannelMap, TcpChannel};
use crate::transport::{check_port, ConnectionId, Established, TransportError};

/// A bound listener whose accept loop has not started yet.
pub struct PskListener {
    /// The underlying TCP listener.
    inner: TcpListener,
    /// Semaphore limiting concurrent handshakes.
    handshake_limit: Arc<Semaphore>,
    /// Shared by every handshake on this listener.
    tls: SslContext,
    config: TransportConfig,
}

impl PskListener {
    /// Bind to `bind_address:port`, rejecting restricted ports first.
    pub async fn bind(
        config: &TransportConfig,
        key: &PskKey,
        port: Option<u16>,
    ) -> Result<Self, TransportError> {
        check_port(port, config.allow_privileged_ports)?;
        let tls = session::acceptor(key)?;

        let ip: IpAddr = config
            .bind_address
            .parse()
            .map_err(|e| TransportError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        let addr = SocketAddr::new(ip, port.unwrap_or(0));

        let listener = TcpListener::bind(addr).await.map_err(TransportError::Bind)?;
        let local_addr = listener.local_addr().map_err(TransportError::Bind)?;

        tracing::info!(
            address = %local_addr,
            max_pending_handshakes = config.max_pending_handshakes,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            handshake_limit: Arc::new(Semaphore::new(config.max_pending_handshakes.max(1))),
            tls,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// Accept until `stop` fires, handing completed handshakes to `queue`.
    pub async fn run(
        self,
        channels: ChannelMap,
        queue: mpsc::Sender<Established>,
        stop: CancellationToken,
    ) {
        loop {
            // Acquire permit first (backpressure)
            let permit = tokio::select! {
                _ = stop.cancelled() => break,
                permit = self.handshake_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer_addr) = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.inner.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            tracing::debug!(
                peer_addr = %peer_addr,
                available_permits = self.handshake_limit.available_permits(),
                "TCP connection accepted"
            );

            let tls = self.tls.clone();
            let timeout = self.config.handshake_timeout();
            let channels = channels.clone();
            let queue = queue.clone();
            let stop = stop.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let outcome = tokio::time::timeout(timeout, handshake(&tls, stream)).await;
                let (channel, local_addr) = match outcome {
                    Ok(Ok(done)) => done,
                    Ok(Err(e)) => {
                        metrics::record_handshake("server", "rejected");
                        tracing::debug!(peer_addr = %peer_addr, error = %e, "Handshake rejected");
                        return;
                    }
                    Err(_) => {
                        metrics::record_handshake("server", "timeout");
                        tracing::debug!(peer_addr = %peer_addr, "Handshake timed out");
                        return;
                    }
                };
                metrics::record_handshake("server", "ok");

                let id = ConnectionId::new();
                channels.insert(id, channel.clone());
                let established = Established { id, local_addr, peer_addr };

                let delivered = tokio::select! {
                    _ = stop.cancelled() => false,
                    sent = queue.send(established) => sent.is_ok(),
                };
                if !delivered {
                    channels.remove(&id);
                    let _ = channel.close().await;
                    tracing::debug!(connection_id = %id, "Listener stopped before connection was claimed");
                }
            });
        }

        tracing::debug!("Accept loop exited");
    }
}

async fn handshake(
    tls: &SslContext,
    stream: TcpStream,
) -> Result<(Arc<TcpChannel>, SocketAddr), TransportError> {
    stream.set_nodelay(true)?;
    let local_addr = stream.local_addr()?;
    let channel = session::accept(tls, stream).await?;
    tracing::debug!(protocol = channel.protocol(), cipher = channel.cipher(), "TLS session established");
    Ok((Arc::new(channel), local_addr))
}
