//! # Client Configuration
//!
//! Purpose: Describe the endpoint, credentials and timing policy of one
//! client instance, loadable from TOML or built in code.
//!
//! ## Design Principles
//! 1. **Sane Defaults**: `ClientConfig::default()` talks to a local server.
//! 2. **Human Durations**: Timeouts are written as `"5s"` or `"250ms"`.
//! 3. **Validate Once**: Scheme and limits are checked before the first connect.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use mgindb_common::{AuthPayload, MginError, MginResult};

/// Default endpoint of a local MginDB server.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:6446";

/// Default maximum inbound line length for the TCP transport (8 MiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// What a second caller sees while a command is already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Wait in arrival order behind the in-flight command.
    #[default]
    Fifo,
    /// Fail immediately with `MginError::ConcurrentRequest`.
    FailFast,
}

/// Transport selected by the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// `ws://` or `wss://`: one text message per line.
    WebSocket,
    /// `tcp://`: newline-delimited UTF-8.
    Tcp,
}

/// Configuration for one client and its single connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server endpoint, e.g. "ws://127.0.0.1:6446" or "tcp://127.0.0.1:6446".
    pub url: String,
    /// Handshake username (empty when the server requires none).
    pub username: String,
    /// Handshake password (empty when the server requires none).
    pub password: String,
    /// Window for opening the transport and completing the handshake.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-command response window; `None` waits indefinitely.
    #[serde(with = "humantime_serde")]
    pub command_timeout: Option<Duration>,
    /// Behaviour of concurrent callers.
    pub queue_mode: QueueMode,
    /// Connect transparently before a command when not ready.
    pub auto_reconnect: bool,
    /// Re-issue `SUB` for keys lost on a drop after the next connect.
    pub resubscribe_on_reconnect: bool,
    /// Maximum inbound line length accepted by the TCP transport.
    pub max_line_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            url: DEFAULT_URL.to_string(),
            username: String::new(),
            password: String::new(),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Some(Duration::from_secs(30)),
            queue_mode: QueueMode::Fifo,
            auto_reconnect: true,
            resubscribe_on_reconnect: false,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for `url` with default policy.
    pub fn new(url: impl Into<String>) -> Self {
        ClientConfig {
            url: url.into(),
            ..ClientConfig::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_queue_mode(mut self, mode: QueueMode) -> Self {
        self.queue_mode = mode;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_resubscribe_on_reconnect(mut self, enabled: bool) -> Self {
        self.resubscribe_on_reconnect = enabled;
        self
    }

    /// Parses a TOML document. Missing fields keep their defaults.
    pub fn from_toml_str(content: &str) -> MginResult<Self> {
        let config: ClientConfig =
            toml::from_str(content).map_err(|err| MginError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub async fn from_file(path: impl AsRef<Path>) -> MginResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| MginError::Config(format!("{}: {}", path.display(), err)))?;
        Self::from_toml_str(&content)
    }

    /// Checks the URL scheme and limits.
    pub fn validate(&self) -> MginResult<()> {
        self.transport_kind()?;
        if self.max_line_length == 0 {
            return Err(MginError::Config("max_line_length must be positive".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(MginError::Config("connect_timeout must be positive".into()));
        }
        Ok(())
    }

    /// Resolves the transport from the URL scheme.
    pub fn transport_kind(&self) -> MginResult<TransportKind> {
        let url = self.parsed_url()?;
        match url.scheme() {
            "ws" | "wss" => Ok(TransportKind::WebSocket),
            "tcp" => Ok(TransportKind::Tcp),
            other => Err(MginError::Config(format!("unsupported url scheme: {other}"))),
        }
    }

    pub(crate) fn parsed_url(&self) -> MginResult<Url> {
        Url::parse(&self.url).map_err(|err| MginError::Config(format!("{}: {}", self.url, err)))
    }

    /// `host:port` for the TCP transport.
    pub(crate) fn socket_addr(&self) -> MginResult<String> {
        let url = self.parsed_url()?;
        let host = url
            .host_str()
            .ok_or_else(|| MginError::Config(format!("{}: missing host", self.url)))?;
        let port = url
            .port()
            .ok_or_else(|| MginError::Config(format!("{}: missing port", self.url)))?;
        Ok(format!("{host}:{port}"))
    }

    pub(crate) fn auth_payload(&self) -> AuthPayload {
        AuthPayload::new(self.username.clone(), self.password.clone())
    }
}
