//! Error types shared by the tunnel and the relay
use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::network::session::SessionId;

/// Problems found before any settings reach the host, or reported by it
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("host rejected tunnel network settings: {0}")]
    Rejected(String),
}

/// Failures of the WebSocket session carrying the packets
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("session {0} is closed")]
    Closed(SessionId),
}

/// Messages of an unexpected shape. Logged and discarded, never propagated.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("binary message carries no packet")]
    EmptyPacket,

    #[error("unexpected raw {0} frame")]
    UnexpectedFrame(&'static str),
}

/// Errors related to virtual network interface operations
#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("failed to create interface: {0}")]
    CreationFailed(io::Error),

    #[error("failed to configure interface: {0}")]
    ConfigurationFailed(String),

    #[error("failed to read from interface: {0}")]
    ReadFailed(io::Error),

    #[error("failed to write to interface: {0}")]
    WriteFailed(io::Error),
}

/// Errors surfaced by [`crate::network::TunnelEndpoint`]
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("tunnel was already started")]
    AlreadyStarted,
}
