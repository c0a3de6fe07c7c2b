//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (read & deserialize)
//!     → validation.rs (semantic checks)
//!     → TlsPskConfig (validated, immutable)
//!     → TransportConfig handed to the transport provider
//!     → ObservabilityConfig handed to logging/metrics init
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal (or absent) config files
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::ClientConfig;
pub use schema::ObservabilityConfig;
pub use schema::ServerConfig;
pub use schema::TlsPskConfig;
pub use schema::TransportConfig;
