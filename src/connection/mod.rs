//! Connection subsystem.
//!
//! # Data Flow
//! ```text
//! handshake completes (controller)
//!     → registry.rs (record registered, liveness token minted)
//!     → handle.rs (handle built around the record + subscriptions)
//!     → dispatcher.rs (pump: transport.read → onReceive / onClose)
//!
//! Close (local or remote):
//!     registry.remove wins once → token cancelled → transport.shutdown
//! ```
//!
//! # Design Decisions
//! - Connections are addressed by identifier, never by direct reference
//! - Exactly one path tears a connection down; the others observe `None`
//! - Events for one connection are delivered in transport order

pub(crate) mod dispatcher;
pub mod handle;
pub mod registry;

pub use handle::{CloseCallback, ConnectionHandle, ReceiveCallback, SubscriptionSet, Subscriptions};
pub use registry::{ConnectionRecord, ConnectionRegistry, RegistryError, Role};
