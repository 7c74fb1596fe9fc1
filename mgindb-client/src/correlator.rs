//! # Request Correlator
//!
//! Purpose: Match every outbound command to exactly one inbound response.
//!
//! ## Design Principles
//! 1. **FIFO Correlation**: The wire has no request identifiers, so the head
//!    of the queue owns the next response line.
//! 2. **One-Shot Completion**: Each pending request holds a `oneshot` sender
//!    that is completed exactly once (response, error, or cancellation).
//! 3. **Short Critical Sections**: The queue lock is never held across an
//!    await, so the reader task can resolve while callers wait.
//!
//! ## Notes
//! - The connection holds its write lock from registration until completion,
//!   so in practice the queue holds at most one entry. The queue itself stays
//!   correct for any depth.
//! - Correlation identifiers are local and monotonically increasing; an
//!   identifier is never reused.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use mgindb_common::{MginError, MginResult};

/// One in-flight command.
struct PendingRequest {
    id: u64,
    frame: String,
    issued_at: Instant,
    completion: oneshot::Sender<MginResult<String>>,
}

/// Caller-side half of a pending request.
#[derive(Debug)]
pub struct PendingHandle {
    pub id: u64,
    pub rx: oneshot::Receiver<MginResult<String>>,
}

/// FIFO queue of pending requests.
pub struct Correlator {
    queue: Mutex<VecDeque<PendingRequest>>,
    next_id: AtomicU64,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Correlator {
            queue: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Appends a pending request for `frame` and returns its completion handle.
    pub fn register(&self, frame: String) -> PendingHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (completion, rx) = oneshot::channel();
        self.queue.lock().push_back(PendingRequest {
            id,
            frame,
            issued_at: Instant::now(),
            completion,
        });
        PendingHandle { id, rx }
    }

    /// Completes the head of the queue with `line`.
    ///
    /// **Output**: the resolved request id, or the line back when nothing is
    /// pending so the caller can route it elsewhere.
    pub fn resolve(&self, line: String) -> Result<u64, String> {
        let Some(head) = self.queue.lock().pop_front() else {
            return Err(line);
        };
        trace!(
            id = head.id,
            frame = %head.frame,
            elapsed_us =
                u64::try_from(head.issued_at.elapsed().as_micros()).unwrap_or(u64::MAX),
            "response correlated"
        );
        // The caller may have stopped waiting; a dropped receiver is fine.
        let _ = head.completion.send(Ok(line));
        Ok(head.id)
    }

    /// Fails the head of the queue with `err` (a malformed response line).
    /// Returns the failed request id, or `None` when nothing is pending.
    pub fn reject(&self, err: MginError) -> Option<u64> {
        let head = self.queue.lock().pop_front()?;
        let _ = head.completion.send(Err(err));
        Some(head.id)
    }

    /// Removes a request without completing it (timeout path).
    pub fn cancel(&self, id: u64) -> bool {
        let mut queue = self.queue.lock();
        match queue.iter().position(|pending| pending.id == id) {
            Some(idx) => {
                queue.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Fails every queued request with `err`. Returns how many were failed.
    pub fn fail_all(&self, err: MginError) -> usize {
        let drained: Vec<PendingRequest> = self.queue.lock().drain(..).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.completion.send(Err(err.clone()));
        }
        count
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.lock().is_empty()
    }
}
