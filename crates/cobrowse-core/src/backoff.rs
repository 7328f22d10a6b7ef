//! Reconnect backoff policy.
//!
//! Sync-only math; the connection manager owns the timers.
//!
//! Delay for zero-based attempt `n` is `min(max_delay, base_delay * 2^n)`.
//! Attempts past `max_attempts` are refused, which is the terminal condition.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default cap on a single delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default maximum number of reconnect attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Exponential backoff parameters for reconnection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Cap on any single delay.
    pub max_delay_ms: u64,
    /// Number of retries before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Delay before zero-based retry `attempt`, or `None` once the policy is
    /// exhausted.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then(|| {
            Duration::from_millis(calculate_backoff_delay(
                attempt,
                self.base_delay_ms,
                self.max_delay_ms,
            ))
        })
    }
}

/// `min(max_delay_ms, base_delay_ms * 2^attempt)`, saturating.
#[must_use]
pub fn calculate_backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    base_delay_ms
        .saturating_mul(1u64 << attempt.min(31))
        .min(max_delay_ms)
}
