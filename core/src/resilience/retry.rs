//! Retry policy
//!
//! Bounded attempts with exponential backoff and deterministic jitter.
//! Only errors the taxonomy classifies retryable are attempted again;
//! client-validation failures are never retried. Open-circuit failures use
//! a longer base backoff so a tripping service is not hammered the moment
//! its breaker reopens.

use crate::error::{CoreError, FailureClass};
use crate::rng::JitterRng;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Retry tuning for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,

    /// First retry delay
    pub base_backoff_ms: i64,

    /// Backoff ceiling
    pub max_backoff_ms: i64,

    /// Base delay when the failure came from an open circuit
    pub breaker_backoff_ms: i64,

    /// Uniform jitter bound added to every delay
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 10_000,
            breaker_backoff_ms: 2_000,
            jitter_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt may follow `attempt` (1-based) failing with
    /// `error`.
    pub fn should_retry(&self, attempt: u32, error: &CoreError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// Delay before the attempt after `attempt` (1-based) failed.
    pub fn backoff(&self, attempt: u32, error: &CoreError, rng: &mut JitterRng) -> Duration {
        let base = match error.class() {
            FailureClass::RetryableBreaker => self.breaker_backoff_ms,
            _ => self.base_backoff_ms,
        };
        let shift = attempt.saturating_sub(1).min(20);
        let ms = base
            .saturating_mul(1_i64 << shift)
            .min(self.max_backoff_ms);
        Duration::milliseconds(ms + rng.jitter_ms(self.jitter_ms) as i64)
    }
}
