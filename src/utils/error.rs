//! The `error` module defines the error types used within `eventfabric`.
//!
//! Nothing in the fabric panics across a component boundary. Client-facing
//! failures are `ProtocolError`s whose display text becomes the `message` of
//! a `{"type":"error"}` frame; session failures are events, not errors.

use thiserror::Error;

use crate::client::ClientId;

/// A subscription pattern that cannot be accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,

    #[error("pattern '{0}' contains an empty segment")]
    EmptySegment(String),

    #[error("'**' must be the last segment in '{0}'")]
    MisplacedMultiWildcard(String),
}

/// Registry lookups against a client that is not (or no longer) registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown client: {0}")]
    UnknownClient(ClientId),
}

/// Rejection raised by a service handler before anything is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("missing or invalid parameter: {0}")]
    InvalidParams(String),

    #[error("command not supported: {0}")]
    Unsupported(String),
}

/// Malformed or unroutable client frames.
///
/// The offending client receives the display text; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid message")]
    InvalidMessage,

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid topic pattern")]
    InvalidPattern(#[source] PatternError),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown command: {service}/{command}")]
    UnknownCommand { service: String, command: String },

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("command rejected: {0}")]
    Rejected(#[from] CommandError),
}

/// Failures bringing up or running the WebSocket listener.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error for the server binary.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
