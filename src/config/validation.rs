//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0)
//! - Validate addresses and hex-encoded keys
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TlsPskConfig → Result<(), Vec<ValidationError>>

use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

use crate::config::schema::TlsPskConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} is not a valid address: {value}")]
    Address { field: &'static str, value: String },

    #[error("{field} is not valid hex")]
    Key { field: &'static str },
}

pub fn validate_config(config: &TlsPskConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let transport = &config.transport;

    for (field, value) in [
        ("transport.connect_timeout_ms", transport.connect_timeout_ms as usize),
        ("transport.handshake_timeout_ms", transport.handshake_timeout_ms as usize),
        ("transport.max_pending_handshakes", transport.max_pending_handshakes),
        ("transport.accept_backlog", transport.accept_backlog),
    ] {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    if transport.bind_address.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::Address {
            field: "transport.bind_address",
            value: transport.bind_address.clone(),
        });
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::Address {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    for (field, key) in [("server.key", &config.server.key), ("client.key", &config.client.key)] {
        if let Some(key) = key {
            if hex::decode(key.trim()).map_or(true, |bytes| bytes.is_empty()) {
                errors.push(ValidationError::Key { field });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
