//! # MginDB Async Client
//!
//! Purpose: Provide a race-free client engine for the MginDB text protocol:
//! one persistent, authenticated connection carrying both command responses
//! and subscription pushes.
//!
//! ## Design Principles
//! 1. **Single Connection**: One socket per client; clones share it.
//! 2. **FIFO Correlation**: Commands are serialized so each response line is
//!    attributed to exactly one caller, in issue order.
//! 3. **Independent Pushes**: Push notifications are routed to listeners and
//!    never resolve or block a command.
//! 4. **Bounded Waiting**: Every command has a timeout path; a timeout drops
//!    the desynchronized connection.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mgindb_client::{ClientConfig, MginClient, SubscriptionEvent};
//!
//! let client = MginClient::new(
//!     ClientConfig::new("ws://127.0.0.1:6446").with_credentials("admin", "secret"),
//! )?;
//! client.set("users:1", r#"{"name":"Ada"}"#).await?;
//! let rows = client.query("users", Some("WHERE name = Ada"), None).await?;
//!
//! let mut updates = client.listen("users:*");
//! client.sub("users:*").await?;
//! while let Some(SubscriptionEvent::Push(push)) = updates.recv().await {
//!     println!("{} -> {}", push.key, push.data);
//! }
//! ```

mod backoff;
mod client;
mod config;
mod connection;
mod correlator;
mod metrics;
mod router;
mod transport;

pub use backoff::BackoffPolicy;
pub use client::MginClient;
pub use config::{ClientConfig, QueueMode, TransportKind};
pub use metrics::{LatencySnapshot, MetricsSnapshot};
pub use router::{Listener, SubscriptionEvent};
pub use transport::{
    Connector, LineCodec, LineSink, LineStream, TcpConnector, Transport, WebSocketConnector,
};

pub use mgindb_common::{Command, ConnectionState, MginError, MginResult, PushNotification};
