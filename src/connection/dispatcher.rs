//! Per-connection event pump.
//!
//! Pulls inbound events from the transport for one connection and hands
//! them to the handle's subscribers in arrival order. Read errors count as
//! a close. The pump ends as soon as the connection leaves the registry.

use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::connection::handle::ConnectionHandle;
use crate::observability::metrics;
use crate::transport::Inbound;

pub(crate) fn spawn(handle: ConnectionHandle) -> JoinHandle<()> {
    let span = tracing::debug_span!("dispatcher", connection_id = %handle.id());
    tokio::spawn(run(handle).instrument(span))
}

async fn run(handle: ConnectionHandle) {
    let transport = handle.context().transport().clone();
    let closed = handle.closed().clone();
    let id = handle.id();

    loop {
        let event = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            event = transport.read(id) => event,
        };

        match event {
            Ok(Inbound::Data(bytes)) => {
                metrics::record_bytes("received", bytes.len());
                tracing::trace!(len = bytes.len(), "Payload received");
                handle.deliver_receive(bytes);
            }
            Ok(Inbound::Closed) => {
                handle.remote_closed("remote").await;
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Read failed, treating as close");
                handle.remote_closed("transport").await;
                break;
            }
        }
    }

    tracing::trace!("Dispatcher exited");
}
