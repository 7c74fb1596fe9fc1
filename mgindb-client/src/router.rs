//! # Subscription Router
//!
//! Purpose: Track which keys this client is subscribed to and fan push
//! notifications out to registered listeners, independently of any command
//! in flight.
//!
//! ## Design Principles
//! 1. **Observer Pattern**: A persistent registry of listeners keyed by
//!    subscription pattern; several listeners may share a key.
//! 2. **Never Block the Reader**: Listeners are unbounded channels, so dispatch
//!    is a handful of non-blocking sends.
//! 3. **Drop Is Not Failure**: A push with no matching active subscription is
//!    logged and dropped, never surfaced as an error.
//!
//! ## Matching
//! A listener registered for pattern `P` receives a push for key `K` when `P`
//! is currently active and `subscription_matches(P, K)` holds, so wildcard
//! subscriptions such as `users:*` behave like they do on the server.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use mgindb_common::{subscription_matches, MginError, PushNotification};

/// Event delivered to a listener.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// An update for a key matching the listener's subscription.
    Push(PushNotification),
    /// The connection dropped and every subscription was cleared.
    ConnectionLost,
}

struct ListenerEntry {
    id: u64,
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

#[derive(Default)]
struct RouterState {
    active: HashSet<String>,
    history: HashSet<String>,
    lost: HashSet<String>,
    listeners: HashMap<String, Vec<ListenerEntry>>,
}

/// Registry of active subscriptions and their listeners.
#[derive(Default)]
pub struct SubscriptionRouter {
    state: Mutex<RouterState>,
    next_id: AtomicU64,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `key` (exact key or wildcard pattern).
    pub fn listen(self: &Arc<Self>, key: impl Into<String>) -> Listener {
        let key = key.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .listeners
            .entry(key.clone())
            .or_default()
            .push(ListenerEntry { id, tx });
        trace!(id, key = %key, "listener registered");
        Listener {
            id,
            key,
            rx,
            router: Arc::downgrade(self),
        }
    }

    /// Deregisters a listener. Returns false when it was already gone.
    pub fn remove_listener(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let mut removed = false;
        state.listeners.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        removed
    }

    /// Number of listeners registered under exactly `key`.
    #[cfg(test)]
    pub fn listener_count(&self, key: &str) -> usize {
        self.state
            .lock()
            .listeners
            .get(key)
            .map_or(0, |entries| entries.len())
    }

    /// Marks `key` active. Returns false when it already was.
    pub fn activate(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        state.history.insert(key.to_string());
        state.lost.remove(key);
        state.active.insert(key.to_string())
    }

    /// Marks `key` inactive and forgets it for resubscription. Returns false
    /// when it was not active.
    pub fn deactivate(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        state.lost.remove(key);
        state.active.remove(key)
    }

    /// Undoes an `activate` whose `SUB` did not go through. Unlike
    /// `deactivate`, the key stays queued for resubscription if a drop put it
    /// there.
    pub fn rollback(&self, key: &str) -> bool {
        self.state.lock().active.remove(key)
    }

    /// Queues `keys` for resubscription again after an interrupted attempt.
    pub fn restore_lost<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock();
        for key in keys {
            let key = key.into();
            if !state.active.contains(&key) {
                state.lost.insert(key);
            }
        }
    }

    /// Does any active subscription receive pushes for `key`?
    pub fn matches_active(&self, key: &str) -> bool {
        self.state
            .lock()
            .active
            .iter()
            .any(|pattern| subscription_matches(pattern, key))
    }

    /// Active subscription keys, sorted.
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().active.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Delivers `push` to every listener of a matching active subscription.
    ///
    /// **Output**: number of listeners that received the event.
    pub fn dispatch(&self, push: PushNotification) -> usize {
        let mut state = self.state.lock();
        let patterns: Vec<String> = state
            .active
            .iter()
            .filter(|pattern| subscription_matches(pattern, &push.key))
            .cloned()
            .collect();

        if patterns.is_empty() {
            let known = state
                .history
                .iter()
                .any(|pattern| subscription_matches(pattern, &push.key));
            if known {
                debug!(key = %push.key, "push for inactive subscription dropped");
            } else {
                let err = MginError::Protocol(format!("push for unknown key {}", push.key));
                warn!(error = %err, "push dropped");
            }
            return 0;
        }

        let mut delivered = 0;
        for pattern in patterns {
            let Some(entries) = state.listeners.get_mut(&pattern) else {
                continue;
            };
            entries.retain(|entry| {
                let sent = entry.tx.send(SubscriptionEvent::Push(push.clone())).is_ok();
                delivered += usize::from(sent);
                sent
            });
        }
        if delivered == 0 {
            debug!(key = %push.key, "push has no listener, dropped");
        }
        delivered
    }

    /// Clears every active subscription after a connection drop and tells all
    /// listeners. The cleared keys are remembered for resubscription.
    pub fn connection_lost(&self) -> usize {
        let mut state = self.state.lock();
        let cleared: Vec<String> = state.active.drain().collect();
        let count = cleared.len();
        state.lost.extend(cleared);
        for entries in state.listeners.values_mut() {
            entries.retain(|entry| entry.tx.send(SubscriptionEvent::ConnectionLost).is_ok());
        }
        state.listeners.retain(|_, entries| !entries.is_empty());
        count
    }

    /// Keys cleared by connection drops and not yet resubscribed.
    pub fn take_lost(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().lost.drain().collect();
        keys.sort();
        keys
    }
}

/// Receiving end of a registered listener.
///
/// Dropping the listener deregisters it.
pub struct Listener {
    id: u64,
    key: String,
    rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
    router: Weak<SubscriptionRouter>,
}

impl Listener {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The key or pattern this listener was registered for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Waits for the next event. Returns `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.rx.recv().await
    }

    /// Returns an already queued event without waiting.
    pub fn try_recv(&mut self) -> Option<SubscriptionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Listener {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.remove_listener(self.id);
        }
    }
}
