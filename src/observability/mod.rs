//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! transport, registry, dispatchers, controllers produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (fmt layer, EnvFilter)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Design Decisions
//! - Structured fields (connection_id, listener_id, peer_addr) on every event
//! - Metrics are cheap facade calls; without an installed recorder they are no-ops
//! - Key material is never logged

pub mod logging;
pub mod metrics;
