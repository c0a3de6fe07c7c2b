//! Server and client controllers.
//!
//! # Responsibilities
//! - Own the lifecycle state of one server or one client
//! - Translate transport failures into the caller-facing error kinds
//!
//! # Design Decisions
//! - State lives in an explicit enum behind a `parking_lot::Mutex` that is
//!   never held across an `.await`; a transition out of a transient state
//!   is only applied if the attempt counter still matches
//! - Connection teardown always goes through the shared registry

pub mod client;
pub mod server;

pub use client::Client;
pub use server::{AcceptCallback, Server};
