//! # Connection Manager
//!
//! Purpose: Own the single socket of a client: open it, authenticate, write
//! commands in caller order, run the inbound reader loop, and tear everything
//! down on close, timeout or transport failure.
//!
//! ## Design Principles
//! 1. **Explicit State Machine**: `ConnectionState` is published on a `watch`
//!    channel so every transition is observable.
//! 2. **One Lock, One Writer**: The session (socket write half) sits behind a
//!    fair `tokio::sync::Mutex`. A caller holds it from writing its frame until
//!    the response arrives, so at most one request is ever outstanding and
//!    waiting callers are served in arrival order.
//! 3. **Generations**: Every session gets a fresh generation number; a reader
//!    task from an older session can never fail requests of a newer one.
//! 4. **Fail Loudly**: Connection-fatal errors fail every pending caller. A
//!    strange or undecodable line fails at most the pending request; only I/O
//!    failures end the session.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Ready
//!      ^              |               |            |
//!      +--------------+---------------+------------+  (error / drop / timeout)
//! Ready -> Closing -> Disconnected                     (close)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use mgindb_common::{
    classify, encode_auth, ClassifyContext, Command, ConnectionState, Frame, MginError,
    MginResult, ACK_OK, WELCOME_LINE,
};

use crate::config::{ClientConfig, QueueMode};
use crate::correlator::Correlator;
use crate::metrics::ClientMetrics;
use crate::router::SubscriptionRouter;
use crate::transport::{Connector, LineSink, LineStream};

/// Upper bound for flushing and closing a socket during teardown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// One authenticated socket.
struct Session {
    generation: u64,
    sink: LineSink,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Session {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, self.sink.close()).await;
    }
}

/// Classification context backed by the live correlator and router.
struct RouteContext<'a> {
    correlator: &'a Correlator,
    router: &'a SubscriptionRouter,
}

impl ClassifyContext for RouteContext<'_> {
    fn has_pending(&self) -> bool {
        self.correlator.has_pending()
    }

    fn is_subscribed(&self, key: &str) -> bool {
        self.router.matches_active(key)
    }
}

/// Socket owner shared by the client facade and the reader task.
pub(crate) struct ConnectionManager {
    config: ClientConfig,
    connector: Box<dyn Connector>,
    session: Mutex<Option<Session>>,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    closed: AtomicBool,
    pub(crate) correlator: Correlator,
    pub(crate) router: Arc<SubscriptionRouter>,
    pub(crate) metrics: ClientMetrics,
}

impl ConnectionManager {
    pub(crate) fn new(config: ClientConfig, connector: Box<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        ConnectionManager {
            config,
            connector,
            session: Mutex::new(None),
            state,
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            correlator: Correlator::new(),
            router: Arc::new(SubscriptionRouter::new()),
            metrics: ClientMetrics::new(),
        }
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "connection state changed");
        }
    }

    /// Opens and authenticates a session unless one is already ready.
    ///
    /// Clears a previous `close()`, so this is also the explicit reconnect.
    pub(crate) async fn connect(self: &Arc<Self>) -> MginResult<()> {
        let mut guard = self.session.lock().await;
        self.closed.store(false, Ordering::SeqCst);
        if self.is_ready_locked(&guard) {
            return Ok(());
        }
        self.connect_locked(&mut guard).await
    }

    /// Fails every pending and queued command with `ConnectionClosed` and
    /// releases the socket.
    pub(crate) async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Closing);
        let failed = self.correlator.fail_all(MginError::ConnectionClosed);
        let mut guard = self.session.lock().await;
        self.teardown_locked(&mut guard, MginError::ConnectionClosed).await;
        info!(failed, "connection closed");
    }

    /// Writes one command frame and waits for its response.
    ///
    /// **Logic**:
    /// 1. Take the session lock (queue in FIFO mode, refuse in fail-fast mode).
    /// 2. Ensure the session is ready, reconnecting on demand.
    /// 3. Register a pending request, write the frame, await the response
    ///    under `timeout`.
    pub(crate) async fn execute(
        self: &Arc<Self>,
        frame: String,
        timeout: Option<Duration>,
    ) -> MginResult<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MginError::ConnectionClosed);
        }

        let started = Instant::now();
        self.metrics.record_request_start();
        let result = self.execute_queued(frame, timeout).await;
        self.metrics.record_request_end(started.elapsed());
        if result.is_err() {
            self.metrics.record_error();
        }
        result
    }

    async fn execute_queued(
        self: &Arc<Self>,
        frame: String,
        timeout: Option<Duration>,
    ) -> MginResult<String> {
        let mut guard = self.acquire().await?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(MginError::ConnectionClosed);
        }
        self.ensure_ready_locked(&mut guard).await?;
        self.roundtrip_locked(&mut guard, frame, timeout).await
    }

    async fn acquire(&self) -> MginResult<MutexGuard<'_, Option<Session>>> {
        match self.config.queue_mode {
            QueueMode::Fifo => Ok(self.session.lock().await),
            QueueMode::FailFast => self
                .session
                .try_lock()
                .map_err(|_| MginError::ConcurrentRequest),
        }
    }

    fn is_ready_locked(&self, guard: &Option<Session>) -> bool {
        self.state().is_ready() && guard.as_ref().is_some_and(Session::is_alive)
    }

    async fn ensure_ready_locked(self: &Arc<Self>, guard: &mut Option<Session>) -> MginResult<()> {
        if self.is_ready_locked(guard) {
            return Ok(());
        }
        if !self.config.auto_reconnect {
            return Err(MginError::NotConnected);
        }
        debug!("connection not ready, reconnecting on demand");
        self.connect_locked(guard).await
    }

    async fn connect_locked(self: &Arc<Self>, guard: &mut Option<Session>) -> MginResult<()> {
        if let Some(stale) = guard.take() {
            stale.shutdown().await;
        }

        self.set_state(ConnectionState::Connecting);
        match self.open_session().await {
            Ok(session) => {
                info!(
                    endpoint = %self.connector.describe(),
                    generation = session.generation,
                    "connection ready"
                );
                *guard = Some(session);
                self.set_state(ConnectionState::Ready);
                self.metrics.record_connect();
            }
            Err(err) => {
                self.generation.fetch_add(1, Ordering::SeqCst);
                self.set_state(ConnectionState::Disconnected);
                warn!(endpoint = %self.connector.describe(), error = %err, "connect failed");
                return Err(err);
            }
        }

        if self.config.resubscribe_on_reconnect {
            self.resubscribe_locked(guard).await?;
        }
        Ok(())
    }

    async fn open_session(self: &Arc<Self>) -> MginResult<Session> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut transport = self.connector.open().await?;

        self.set_state(ConnectionState::Authenticating);
        let auth = encode_auth(&self.config.auth_payload())?;
        let handshake = async {
            transport.sink.send(auth).await?;
            transport.stream.next().await.transpose()
        };
        let reply = tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| MginError::Transport("handshake timed out".into()))??;

        match reply {
            Some(line) if line == WELCOME_LINE => {}
            Some(line) => {
                warn!(reply = %line, "handshake rejected");
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, transport.sink.close()).await;
                return Err(MginError::Authentication(line));
            }
            None => {
                return Err(MginError::ConnectionLost(
                    "server closed the connection during the handshake".into(),
                ));
            }
        }

        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            Arc::downgrade(self),
            generation,
            Arc::clone(&alive),
            transport.stream,
        ));
        Ok(Session {
            generation,
            sink: transport.sink,
            alive,
            reader,
        })
    }

    /// Re-issues `SUB` for every key cleared by a drop.
    ///
    /// A key leaves the queue only once the server answered for it. If the
    /// session dies midway, the interrupted key and every untried key are put
    /// back for the next connect.
    async fn resubscribe_locked(&self, guard: &mut Option<Session>) -> MginResult<()> {
        let keys = self.router.take_lost();
        for (idx, key) in keys.iter().enumerate() {
            self.router.activate(key);
            let frame = Command::Sub { key: key.clone() }.encode();
            match self
                .roundtrip_locked(guard, frame, self.config.command_timeout)
                .await
            {
                Ok(reply) if reply == ACK_OK => debug!(key = %key, "resubscribed"),
                Ok(reply) => {
                    self.router.rollback(key);
                    warn!(key = %key, reply = %reply, "resubscribe rejected");
                }
                Err(err) if err.is_connection_fatal() => {
                    self.router.rollback(key);
                    self.router.restore_lost(keys[idx..].iter().map(String::as_str));
                    warn!(
                        key = %key,
                        pending = keys.len() - idx,
                        error = %err,
                        "resubscribe interrupted"
                    );
                    return Err(err);
                }
                Err(err) => {
                    self.router.rollback(key);
                    warn!(key = %key, error = %err, "resubscribe failed");
                }
            }
        }
        Ok(())
    }

    async fn roundtrip_locked(
        &self,
        guard: &mut Option<Session>,
        frame: String,
        timeout: Option<Duration>,
    ) -> MginResult<String> {
        let session = guard.as_mut().ok_or(MginError::NotConnected)?;
        let generation = session.generation;
        let handle = self.correlator.register(frame.clone());

        // A drop or close may have raced the registration; re-check after it
        // is visible so the request cannot wait on a dead socket.
        if self.closed.load(Ordering::SeqCst) {
            self.correlator.cancel(handle.id);
            return Err(MginError::ConnectionClosed);
        }
        if !session.is_alive() {
            self.correlator.cancel(handle.id);
            return Err(MginError::ConnectionLost(
                "connection dropped before the command was written".into(),
            ));
        }

        trace!(id = handle.id, generation, frame = %frame, "writing command");
        if let Err(err) = session.sink.send(frame).await {
            self.correlator.cancel(handle.id);
            let err = MginError::ConnectionLost(err.to_string());
            self.teardown_locked(guard, err.clone()).await;
            return Err(err);
        }

        let id = handle.id;
        let completion = match timeout {
            None => handle.rx.await,
            Some(limit) => match tokio::time::timeout(limit, handle.rx).await {
                Ok(completion) => completion,
                Err(_) => {
                    self.correlator.cancel(id);
                    self.metrics.record_timeout();
                    let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    warn!(
                        id,
                        generation,
                        timeout_ms,
                        "command timed out, dropping desynchronized connection"
                    );
                    self.teardown_locked(
                        guard,
                        MginError::ConnectionLost("desynchronized after a timeout".into()),
                    )
                    .await;
                    return Err(MginError::Timeout(limit));
                }
            },
        };

        completion.unwrap_or_else(|_| {
            Err(MginError::ConnectionLost(
                "request abandoned by the connection".into(),
            ))
        })
    }

    /// Releases the session and fails everything attached to it.
    async fn teardown_locked(&self, guard: &mut Option<Session>, err: MginError) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = guard.take() {
            session.shutdown().await;
        }
        let failed = self.correlator.fail_all(err);
        let cleared = self.router.connection_lost();
        self.set_state(ConnectionState::Disconnected);
        debug!(failed, cleared, "session torn down");
    }

    /// Routes one inbound line to the correlator or the router.
    fn route_line(&self, line: String) {
        let ctx = RouteContext {
            correlator: &self.correlator,
            router: &self.router,
        };
        match classify(line, &ctx) {
            Frame::Response(line) => {
                if let Err(line) = self.correlator.resolve(line) {
                    // The request was cancelled between classification and resolve.
                    debug!(line = %line, "late response dropped");
                    self.metrics.record_unexpected();
                }
            }
            Frame::Push(push) => {
                trace!(key = %push.key, "push received");
                let delivered = self.router.dispatch(push);
                self.metrics.record_push(delivered > 0);
            }
            Frame::Unexpected(line) => {
                warn!(line = %line, "unexpected frame with no pending request, dropped");
                self.metrics.record_unexpected();
            }
        }
    }

    /// Handles a line the transport could not decode. It answers the pending
    /// request with the error; with nothing pending it is dropped.
    fn reject_line(&self, err: MginError) {
        match self.correlator.reject(err.clone()) {
            Some(id) => debug!(id, error = %err, "malformed response"),
            None => {
                warn!(error = %err, "malformed frame with no pending request, dropped");
                self.metrics.record_unexpected();
            }
        }
    }

    /// Called by the reader task when its stream ends or fails.
    fn handle_drop(&self, generation: u64, reason: String) {
        if self.generation.load(Ordering::SeqCst) != generation {
            trace!(generation, "stale reader finished");
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        let failed = self
            .correlator
            .fail_all(MginError::ConnectionLost(reason.clone()));
        let cleared = self.router.connection_lost();
        warn!(generation, failed, cleared, reason = %reason, "connection lost");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.alive.store(false, Ordering::SeqCst);
            session.reader.abort();
        }
    }
}

/// Inbound loop for one session.
async fn read_loop(
    manager: Weak<ConnectionManager>,
    generation: u64,
    alive: Arc<AtomicBool>,
    mut stream: LineStream,
) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(line)) => match manager.upgrade() {
                Some(manager) => manager.route_line(line),
                None => return,
            },
            Some(Err(err @ MginError::Protocol(_))) => match manager.upgrade() {
                Some(manager) => manager.reject_line(err),
                None => return,
            },
            Some(Err(err)) => break err.to_string(),
            None => break "server closed the connection".to_string(),
        }
    };

    alive.store(false, Ordering::SeqCst);
    if let Some(manager) = manager.upgrade() {
        manager.handle_drop(generation, reason);
    }
}
