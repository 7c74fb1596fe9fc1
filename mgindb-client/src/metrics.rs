//! # Client Metrics
//!
//! Provide lightweight counters and a latency histogram for commands and
//! push traffic on one client.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Use atomic counters to aggregate events cheaply.
//! 2. **Fixed Buckets**: Keep histogram buckets in a contiguous array for cache locality.
//! 3. **Zero-Cost Access**: Expose snapshots as plain structs without locking.
//!
//! ## Notes
//! - Bucket boundaries are expressed in microseconds. Round trips to a remote
//!   server are slower than in-process calls, so the default buckets start at
//!   100us and reach 5s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default latency bucket boundaries in microseconds.
pub const DEFAULT_LATENCY_BUCKETS_US: [u64; 12] = [
    100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 100_000, 500_000, 1_000_000, 5_000_000,
];

/// Snapshot of all client metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total number of commands issued.
    pub requests_total: u64,
    /// Commands that completed with an error (timeouts included).
    pub errors_total: u64,
    /// Commands that hit the response timeout.
    pub timeouts_total: u64,
    /// Commands currently queued or awaiting a response.
    pub inflight: u64,
    /// Push notifications delivered to at least one listener.
    pub pushes_delivered: u64,
    /// Push notifications with no active subscription or listener.
    pub pushes_dropped: u64,
    /// Lines that matched no request: stray text, malformed lines, and
    /// responses that arrived after their request timed out.
    pub unexpected_frames: u64,
    /// Successful handshakes.
    pub connects_total: u64,
    /// Command latency histogram snapshot.
    pub latency: LatencySnapshot,
}

/// Snapshot of the latency histogram.
#[derive(Debug, Clone)]
pub struct LatencySnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    /// Total number of samples.
    pub samples: u64,
    /// Sum of latencies in microseconds.
    pub sum_us: u64,
}

impl LatencySnapshot {
    /// Mean latency, or zero when nothing was recorded.
    pub fn mean(&self) -> Duration {
        if self.samples == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.sum_us / self.samples)
    }
}

/// Thread-safe metrics aggregator for one client.
///
/// `Ordering::Relaxed` is sufficient because no cross-field ordering is
/// required, only eventual consistency.
pub struct ClientMetrics {
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    timeouts_total: AtomicU64,
    inflight: AtomicU64,
    pushes_delivered: AtomicU64,
    pushes_dropped: AtomicU64,
    unexpected_frames: AtomicU64,
    connects_total: AtomicU64,
    latency: LatencyHistogram,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMetrics {
    /// Creates a new aggregator with the default latency buckets.
    pub fn new() -> Self {
        Self::with_latency_buckets(DEFAULT_LATENCY_BUCKETS_US.to_vec())
    }

    /// Creates a new aggregator with custom latency bucket boundaries.
    ///
    /// **Input**: `bounds_us` (ascending microsecond thresholds).
    /// **Output**: a `ClientMetrics` instance configured with those buckets.
    pub fn with_latency_buckets(bounds_us: Vec<u64>) -> Self {
        ClientMetrics {
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            inflight: AtomicU64::new(0),
            pushes_delivered: AtomicU64::new(0),
            pushes_dropped: AtomicU64::new(0),
            unexpected_frames: AtomicU64::new(0),
            connects_total: AtomicU64::new(0),
            latency: LatencyHistogram::new(bounds_us),
        }
    }

    /// Records a command entering the queue.
    pub fn record_request_start(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a command leaving the queue.
    ///
    /// **Input**: `latency` measured from issue to completion.
    ///
    /// **Logic**:
    /// 1. Decrement `inflight`.
    /// 2. Record the latency into the histogram.
    pub fn record_request_end(&self, latency: Duration) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        self.latency.record(latency);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_push(&self, delivered: bool) {
        if delivered {
            self.pushes_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pushes_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_unexpected(&self) {
        self.unexpected_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.connects_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters and histogram buckets.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
            pushes_delivered: self.pushes_delivered.load(Ordering::Relaxed),
            pushes_dropped: self.pushes_dropped.load(Ordering::Relaxed),
            unexpected_frames: self.unexpected_frames.load(Ordering::Relaxed),
            connects_total: self.connects_total.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

/// Fixed-bucket latency histogram.
///
/// Uses a linear scan to pick buckets; the list is small and stays hot in cache.
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a histogram with `bounds_us.len() + 1` buckets (last is overflow).
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    /// Records a latency measurement into the histogram.
    ///
    /// **Logic**:
    /// 1. Convert to microseconds.
    /// 2. Increment `samples` and add to `sum_us`.
    /// 3. Find the first bucket where `micros <= bound`, otherwise use overflow.
    pub fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);

        let idx = self
            .bounds_us
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of the histogram.
    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}
