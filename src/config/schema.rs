//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsPskConfig {
    /// Transport provider settings (bind address, timeouts, limits).
    pub transport: TransportConfig,

    /// Defaults for the `serve` command.
    pub server: ServerConfig,

    /// Defaults for the `send` command.
    pub client: ClientConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Transport provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address listeners bind to (the port comes from `start`).
    pub bind_address: String,

    /// TCP connect timeout for outbound dials.
    pub connect_timeout_ms: u64,

    /// Deadline for a PSK handshake, on either side.
    pub handshake_timeout_ms: u64,

    /// Allow listening on ports below 1024.
    pub allow_privileged_ports: bool,

    /// Maximum concurrent inbound handshakes per listener (backpressure).
    pub max_pending_handshakes: usize,

    /// Completed inbound connections queued until the accept loop claims them.
    pub accept_backlog: usize,
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            allow_privileged_ports: false,
            max_pending_handshakes: 64,
            accept_backlog: 128,
        }
    }
}

/// Server defaults used by the CLI.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on; absent means ephemeral.
    pub port: Option<u16>,

    /// Hex-encoded pre-shared key.
    pub key: Option<String>,
}

/// Client defaults used by the CLI.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: Option<u16>,

    /// Hex-encoded pre-shared key.
    pub key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            key: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive).
    pub log_level: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
