//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use tokio::sync::mpsc;

use tls_psk::config::TransportConfig;
use tls_psk::Context;

pub const KEY: [u8; 2] = [0x01, 0x23];
pub const OTHER_KEY: [u8; 2] = [0xAB, 0xCD];

const WAIT: Duration = Duration::from_secs(5);

/// Context over real localhost TCP with short timeouts.
pub fn tcp_context() -> Context {
    let config = TransportConfig {
        bind_address: "127.0.0.1".to_string(),
        connect_timeout_ms: 2_000,
        handshake_timeout_ms: 2_000,
        ..TransportConfig::default()
    };
    Context::tcp(config)
}

/// A localhost port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Next value from a callback channel, failing the test after a timeout.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("callback channel closed")
}

/// True if nothing arrives on `rx` within `ms`.
pub async fn quiet_for<T>(rx: &mut mpsc::UnboundedReceiver<T>, ms: u64) -> bool {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .is_err()
}

/// Poll `condition` until it holds, failing the test after a timeout.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held")
}
