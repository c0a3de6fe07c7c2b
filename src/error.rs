//! Caller-facing error taxonomy.
//!
//! Every controller and handle operation fails with one of these kinds.
//! The `Display` strings are stable and part of the public contract.
//! Variants carry no detail: transport diagnostics are logged where they
//! occur and never reach the caller, so an authentication failure looks
//! exactly like an unreachable peer.

use thiserror::Error;

/// Errors surfaced by servers, clients and connection handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Error {
    /// `start` on a server that is already listening.
    #[error("Server already started")]
    AlreadyStarted,

    /// `stop` on a server that is not listening.
    #[error("Unknown server")]
    UnknownServer,

    /// The transport could not listen (restricted port, bind failure, bad key).
    #[error("Start error")]
    StartError,

    /// `connect` on a client that already holds a connection.
    #[error("Client already connected")]
    AlreadyConnected,

    /// `close` or `send` on a client without a connection.
    #[error("Unknown client")]
    UnknownClient,

    /// Dial failed for any reason, including a rejected key.
    #[error("Connect error")]
    ConnectError,

    /// Operation on a handle whose connection is already closed.
    #[error("Unknown connection")]
    UnknownConnection,
}

impl Error {
    /// Stable kind name, independent of the display message.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AlreadyStarted => "AlreadyStarted",
            Error::UnknownServer => "UnknownServer",
            Error::StartError => "StartError",
            Error::AlreadyConnected => "AlreadyConnected",
            Error::UnknownClient => "UnknownClient",
            Error::ConnectError => "ConnectError",
            Error::UnknownConnection => "UnknownConnection",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings_are_stable() {
        assert_eq!(Error::AlreadyStarted.to_string(), "Server already started");
        assert_eq!(Error::UnknownServer.to_string(), "Unknown server");
        assert_eq!(Error::StartError.to_string(), "Start error");
        assert_eq!(Error::AlreadyConnected.to_string(), "Client already connected");
        assert_eq!(Error::UnknownClient.to_string(), "Unknown client");
        assert_eq!(Error::ConnectError.to_string(), "Connect error");
        assert_eq!(Error::UnknownConnection.to_string(), "Unknown connection");
    }

    #[test]
    fn kinds_match_variant_names() {
        assert_eq!(Error::ConnectError.kind(), "ConnectError");
        assert_eq!(Error::UnknownConnection.kind(), "UnknownConnection");
    }
}
