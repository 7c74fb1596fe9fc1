//! # Asynchronous Client API
//!
//! Purpose: Expose one typed method per MginDB verb plus connection
//! lifecycle and push-listener registration.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `MginClient` hides the connection manager, the
//!    correlator and the subscription router.
//! 2. **Validate First**: Arguments are checked before the socket is touched.
//! 3. **Raw Responses**: Response text is returned exactly as received; the
//!    server defines its format.
//! 4. **Cheap Clones**: The client is an `Arc` handle; clones share one
//!    connection and serialize through its FIFO queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use mgindb_common::{subscription_keys, Command, ConnectionState, MginError, MginResult, ACK_OK};

use crate::backoff::BackoffPolicy;
use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::metrics::MetricsSnapshot;
use crate::router::Listener;
use crate::transport::{connector_for, Connector};

/// Client for one MginDB server over one persistent connection.
#[derive(Clone)]
pub struct MginClient {
    inner: Arc<ConnectionManager>,
}

impl MginClient {
    /// Creates a client for `config`. No socket is opened until `connect()`
    /// or the first command.
    pub fn new(config: ClientConfig) -> MginResult<Self> {
        config.validate()?;
        let connector = connector_for(&config)?;
        Ok(Self::with_connector(config, connector))
    }

    /// Creates a client over a custom transport.
    pub fn with_connector(config: ClientConfig, connector: Box<dyn Connector>) -> Self {
        MginClient {
            inner: Arc::new(ConnectionManager::new(config, connector)),
        }
    }

    /// Creates a client and connects it immediately.
    pub async fn connect_to(config: ClientConfig) -> MginResult<Self> {
        let client = Self::new(config)?;
        client.connect().await?;
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        self.inner.config()
    }

    /// Opens and authenticates the connection if it is not ready.
    ///
    /// Also re-enables the client after `close()`.
    pub async fn connect(&self) -> MginResult<()> {
        self.inner.connect().await
    }

    /// Retries `connect()` with exponential backoff.
    ///
    /// Authentication and configuration failures are returned at once; they
    /// would fail the same way on every retry.
    pub async fn connect_with_backoff(&self, policy: &BackoffPolicy) -> MginResult<()> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match self.connect().await {
                Ok(()) => return Ok(()),
                Err(err @ (MginError::Authentication(_) | MginError::Config(_))) => {
                    return Err(err)
                }
                Err(err) => err,
            };
            if !policy.allows_attempt(attempts) {
                warn!(attempts, error = %err, "giving up on reconnect");
                return Err(err);
            }
            let wait = policy.jittered_delay(attempts);
            let wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
            warn!(attempts, error = %err, wait_ms, "connect failed, retrying");
            tokio::time::sleep(wait).await;
        }
    }

    /// Fails every pending and queued command with `ConnectionClosed` and
    /// releases the socket. Later commands fail until `connect()` is called.
    pub async fn close(&self) {
        self.inner.close().await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Receiver that observes every lifecycle transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.watch_state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Sends a typed command using the configured timeout.
    pub async fn execute(&self, command: Command) -> MginResult<String> {
        let timeout = self.inner.config().command_timeout;
        self.execute_with_timeout_opt(command, timeout).await
    }

    /// Sends a typed command with an explicit timeout.
    pub async fn execute_with_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> MginResult<String> {
        self.execute_with_timeout_opt(command, Some(timeout)).await
    }

    async fn execute_with_timeout_opt(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> MginResult<String> {
        command.validate()?;
        self.inner.execute(command.encode(), timeout).await
    }

    /// `SET key value`
    pub async fn set(&self, key: &str, value: &str) -> MginResult<String> {
        self.execute(Command::Set {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// `INCR key delta`
    pub async fn incr(&self, key: &str, delta: &str) -> MginResult<String> {
        self.execute(Command::Incr {
            key: key.to_string(),
            delta: delta.to_string(),
        })
        .await
    }

    /// `DECR key delta`
    pub async fn decr(&self, key: &str, delta: &str) -> MginResult<String> {
        self.execute(Command::Decr {
            key: key.to_string(),
            delta: delta.to_string(),
        })
        .await
    }

    /// `DEL key`
    pub async fn delete(&self, key: &str) -> MginResult<String> {
        self.execute(Command::Del {
            key: key.to_string(),
        })
        .await
    }

    /// `QUERY key [query] [options]`
    pub async fn query(
        &self,
        key: &str,
        query: Option<&str>,
        options: Option<&str>,
    ) -> MginResult<String> {
        self.execute(Command::Query {
            key: key.to_string(),
            query: query.map(str::to_string),
            options: options.map(str::to_string),
        })
        .await
    }

    /// `COUNT key`
    pub async fn count(&self, key: &str) -> MginResult<String> {
        self.execute(Command::Count {
            key: key.to_string(),
        })
        .await
    }

    /// `INDICES action [key] [value]`
    pub async fn indices(
        &self,
        action: &str,
        key: Option<&str>,
        value: Option<&str>,
    ) -> MginResult<String> {
        self.execute(Command::Indices {
            action: action.to_string(),
            key: key.map(str::to_string),
            value: value.map(str::to_string),
        })
        .await
    }

    /// `SCHEDULE action [cron_or_key] [command]`
    pub async fn schedule(
        &self,
        action: &str,
        cron_or_key: Option<&str>,
        command: Option<&str>,
    ) -> MginResult<String> {
        self.execute(Command::Schedule {
            action: action.to_string(),
            cron_or_key: cron_or_key.map(str::to_string),
            command: command.map(str::to_string),
        })
        .await
    }

    /// `KEYS`
    pub async fn keys(&self) -> MginResult<String> {
        self.execute(Command::Keys).await
    }

    /// `RENAME key TO new_key`
    pub async fn rename(&self, key: &str, new_key: &str) -> MginResult<String> {
        self.execute(Command::Rename {
            key: key.to_string(),
            new_key: new_key.to_string(),
        })
        .await
    }

    /// `SUBLIST`: the server's view of all subscriptions.
    pub async fn sublist(&self) -> MginResult<String> {
        self.execute(Command::SubList).await
    }

    /// Sends any other command line verbatim.
    pub async fn raw(&self, line: &str) -> MginResult<String> {
        self.execute(Command::Raw(line.to_string())).await
    }

    /// `SUB key`: subscribes and, once the server acknowledges with `OK`,
    /// keeps `key` active so its pushes reach listeners.
    ///
    /// `key` may be a comma-separated list (`a,b`); each entry becomes its own
    /// subscription. Keys are marked active before the frame is written so a
    /// push racing the acknowledgment is still routed; they are rolled back
    /// when the server answers anything but `OK` or the command fails.
    pub async fn sub(&self, key: &str) -> MginResult<String> {
        let command = Command::Sub {
            key: key.to_string(),
        };
        command.validate()?;
        let keys = subscription_keys(key)?;

        let router = &self.inner.router;
        let newly_active: Vec<&str> = keys
            .into_iter()
            .filter(|entry| router.activate(entry))
            .collect();
        let result = self.execute(command).await;
        match &result {
            Ok(reply) if reply == ACK_OK => debug!(key, "subscribed"),
            Ok(reply) => {
                for entry in &newly_active {
                    router.deactivate(entry);
                }
                warn!(key, reply = %reply, "subscription rejected");
            }
            Err(_) => {
                for entry in &newly_active {
                    router.deactivate(entry);
                }
            }
        }
        result
    }

    /// `UNSUB key`: deactivates every key in the list once the server
    /// acknowledges.
    pub async fn unsub(&self, key: &str) -> MginResult<String> {
        let command = Command::Unsub {
            key: key.to_string(),
        };
        command.validate()?;
        let keys = subscription_keys(key)?;

        let reply = self.execute(command).await?;
        if reply == ACK_OK {
            for entry in keys {
                self.inner.router.deactivate(entry);
            }
            debug!(key, "unsubscribed");
        }
        Ok(reply)
    }

    /// Subscribes to the server's stream of executed commands.
    pub async fn monitor(&self) -> MginResult<String> {
        self.sub(mgindb_common::MONITOR_KEY).await
    }

    /// Registers a listener for pushes on `key` (exact key or wildcard
    /// pattern such as `users:*`). Registration is local; call `sub()` to
    /// start receiving pushes from the server.
    pub fn listen(&self, key: &str) -> Listener {
        self.inner.router.listen(key)
    }

    /// Deregisters a listener by id. Dropping the `Listener` does the same.
    pub fn remove_listener(&self, id: u64) -> bool {
        self.inner.router.remove_listener(id)
    }

    /// Keys currently subscribed on this connection, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.router.active_keys()
    }
}
