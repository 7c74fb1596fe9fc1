//! # Error Taxonomy
//!
//! Purpose: Give callers one typed error that separates "this request failed"
//! from "the connection died", so retry and re-authentication decisions can be
//! made without string matching.
//!
//! ## Design Principles
//! 1. **Single Enum**: Every layer (codec, transport, engine) reports `MginError`.
//! 2. **Cheap Clone**: Variants carry owned strings so one failure can be fanned
//!    out to every pending caller.
//! 3. **Classified**: `is_connection_fatal()` and `is_request_failure()` encode
//!    the propagation policy in one place.

use std::time::Duration;

use thiserror::Error;

/// Result alias used across the MginDB crates.
pub type MginResult<T> = Result<T, MginError>;

/// Errors surfaced by the MginDB client engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MginError {
    /// Bad credentials or an unexpected handshake reply. Carries the server text.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// I/O failure or server-initiated close while the connection was in use.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The client was closed by the caller.
    #[error("connection closed")]
    ConnectionClosed,
    /// No response arrived within the configured window.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    /// Another command is in flight and the client runs in fail-fast mode.
    #[error("another command is already in flight")]
    ConcurrentRequest,
    /// Malformed or unattributable frame.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A command argument failed validation before anything was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The connection is not ready and automatic reconnection is disabled.
    #[error("not connected")]
    NotConnected,
    /// The transport could not be opened or failed underneath a write.
    #[error("transport error: {0}")]
    Transport(String),
    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MginError {
    /// Returns true when the error means the connection itself is unusable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            MginError::ConnectionLost(_)
                | MginError::ConnectionClosed
                | MginError::Timeout(_)
                | MginError::Transport(_)
        )
    }

    /// Returns true when only the caller's request failed and the connection
    /// is still usable.
    pub fn is_request_failure(&self) -> bool {
        matches!(
            self,
            MginError::InvalidArgument(_) | MginError::ConcurrentRequest | MginError::Protocol(_)
        )
    }
}

impl From<std::io::Error> for MginError {
    fn from(err: std::io::Error) -> Self {
        MginError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for MginError {
    fn from(err: serde_json::Error) -> Self {
        MginError::Protocol(err.to_string())
    }
}
