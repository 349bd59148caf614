//! Error types for the reconnecting websocket client

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the reconnecting websocket client
///
/// Dial and transport failures are recovered internally by retrying; they
/// only show up here when logged or when a caller interacts with a client
/// that has already stopped.
#[derive(Error, Debug)]
pub enum ReconWsError {
    /// The destination could not be turned into a websocket request
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The bearer token is not a valid header value
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Dialing the server failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The handshake did not complete in time
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Reading from or writing to an open socket failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The client has been stopped
    #[error("Client stopped")]
    Stopped,
}

/// Result type for reconnecting websocket operations
pub type Result<T> = std::result::Result<T, ReconWsError>;
