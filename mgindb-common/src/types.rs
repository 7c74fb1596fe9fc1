//! # Shared Data Types
//!
//! Purpose: Plain values exchanged between the codec and the client engine.
//!
//! ## Design Principles
//! 1. **Owned Data**: Frames are ephemeral, so types own their strings and can
//!    move freely between the reader task and listener channels.
//! 2. **Serde at the Edge**: Only the handshake record and push payloads touch
//!    JSON; everything else is raw text.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the single connection owned by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No socket is open.
    #[default]
    Disconnected,
    /// The transport is being opened.
    Connecting,
    /// The credential record was sent and the welcome line is awaited.
    Authenticating,
    /// Handshake succeeded; commands may be written.
    Ready,
    /// The caller requested `close()` and teardown is in progress.
    Closing,
}

impl ConnectionState {
    /// Returns true when commands can be written without reconnecting.
    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Credential record sent as the first line of every session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub username: String,
    pub password: String,
}

impl AuthPayload {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        AuthPayload {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Unsolicited update delivered because of an active subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct PushNotification {
    /// Key the update pertains to (or `MONITOR` for monitor pushes).
    pub key: String,
    /// Decoded payload: the `data` field, or the whole object for monitor pushes.
    pub data: serde_json::Value,
    /// The line exactly as it arrived.
    pub raw: String,
}
