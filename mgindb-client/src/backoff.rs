//! Exponential backoff for reconnect attempts.
//!
//! The engine never reconnects silently after a drop; callers who want a
//! retrying connect use `MginClient::connect_with_backoff` with a policy.

use std::time::Duration;

use rand::Rng;

/// Delay before the first retry.
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Ceiling for the exponential delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Retry schedule for `connect_with_backoff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    pub initial: Duration,
    /// Upper bound for any single delay (before jitter).
    pub max: Duration,
    /// Random extra delay in `[0, jitter)` added to each wait.
    pub jitter: Duration,
    /// Total attempts including the first; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial: INITIAL_RECONNECT_DELAY,
            max: MAX_RECONNECT_DELAY,
            jitter: Duration::from_millis(500),
            max_attempts: Some(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay after `failures` consecutive failures (1-based), without jitter.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// `delay_for` plus random jitter.
    pub fn jittered_delay(&self, failures: u32) -> Duration {
        let base = self.delay_for(failures);
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }

    /// Returns true when another attempt is allowed after `attempts` tries.
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}
