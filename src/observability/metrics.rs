//! Metrics collection and exposition.
//!
//! # Metrics
//! - `tls_psk_handshakes_total` (counter): handshakes by role, outcome
//! - `tls_psk_connections_opened_total` (counter): registered connections by role
//! - `tls_psk_connections_closed_total` (counter): closes by role, initiator
//! - `tls_psk_active_connections` (gauge): live registry entries
//! - `tls_psk_active_listeners` (gauge): listening servers
//! - `tls_psk_bytes_total` (counter): payload bytes by direction

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_handshake(role: &'static str, outcome: &'static str) {
    metrics::counter!("tls_psk_handshakes_total", "role" => role, "outcome" => outcome).increment(1);
}

pub fn record_connection_opened(role: &'static str) {
    metrics::counter!("tls_psk_connections_opened_total", "role" => role).increment(1);
    metrics::gauge!("tls_psk_active_connections").increment(1.0);
}

pub fn record_connection_closed(role: &'static str, initiator: &'static str) {
    metrics::counter!("tls_psk_connections_closed_total", "role" => role, "initiator" => initiator)
        .increment(1);
    metrics::gauge!("tls_psk_active_connections").decrement(1.0);
}

pub fn record_listener_started() {
    metrics::gauge!("tls_psk_active_listeners").increment(1.0);
}

pub fn record_listener_stopped() {
    metrics::gauge!("tls_psk_active_listeners").decrement(1.0);
}

pub fn record_bytes(direction: &'static str, len: usize) {
    metrics::counter!("tls_psk_bytes_total", "direction" => direction).increment(len as u64);
}
