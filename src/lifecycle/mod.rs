//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → wait_for_signal resolves
//!     → serve: Server.stop (listener closed, accepted connections closed)
//!     → send:  reply window cut short, Client.close
//! ```

pub mod signals;

pub use signals::wait_for_signal;
