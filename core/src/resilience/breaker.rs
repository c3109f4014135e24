//! Circuit breaker
//!
//! Stateful guard over one downstream service for one tenant. Trips OPEN
//! when the rolling failure rate or slow-call rate crosses its threshold,
//! waits out `wait_duration`, then probes through HALF_OPEN with a limited
//! call budget. Any failure in HALF_OPEN reopens; a run of consecutive
//! successes closes.
//!
//! ```text
//! CLOSED --(failure/slow rate over window)--> OPEN
//! OPEN --(wait_duration elapsed)--> HALF_OPEN
//! HALF_OPEN --(failure)--> OPEN
//! HALF_OPEN --(success_threshold successes)--> CLOSED
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::info;

/// Breaker tuning for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerPolicy {
    /// Rolling window size in calls
    pub window_size: usize,

    /// Trip when failures / window >= this fraction
    pub failure_rate_threshold: f64,

    /// Trip when slow calls / window >= this fraction
    pub slow_call_rate_threshold: f64,

    /// A call slower than this is counted slow
    pub slow_call_ms: i64,

    /// Rates are not evaluated below this many recorded calls
    pub minimum_calls: usize,

    /// How long OPEN lasts before probing
    pub wait_duration_secs: i64,

    /// Calls admitted while HALF_OPEN
    pub half_open_permits: u32,

    /// Consecutive HALF_OPEN successes required to close
    pub success_threshold: u32,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            window_size: 20,
            failure_rate_threshold: 0.5,
            slow_call_rate_threshold: 0.8,
            slow_call_ms: 5_000,
            minimum_calls: 5,
            wait_duration_secs: 30,
            half_open_permits: 3,
            success_threshold: 2,
        }
    }
}

impl BreakerPolicy {
    pub fn wait_duration(&self) -> Duration {
        Duration::seconds(self.wait_duration_secs)
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Returned when the breaker refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerRejection;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct CallSample {
    success: bool,
    slow: bool,
}

/// One breaker instance (keyed per service and tenant by the kernel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    state: BreakerState,
    window: VecDeque<CallSample>,
    opened_at: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            state: BreakerState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            half_open_in_flight: 0,
            half_open_successes: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Gate a call. Moves OPEN to HALF_OPEN once the wait has elapsed and
    /// budgets HALF_OPEN probes.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> Result<(), BreakerRejection> {
        match self.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                if now - opened_at >= self.policy.wait_duration() {
                    self.transition(BreakerState::HalfOpen);
                    self.half_open_in_flight = 1;
                    self.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(BreakerRejection)
                }
            }
            BreakerState::HalfOpen => {
                if self.half_open_in_flight < self.policy.half_open_permits {
                    self.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(BreakerRejection)
                }
            }
        }
    }

    /// Record a successful call. Returns true when this success closed the
    /// breaker.
    pub fn record_success(&mut self, now: DateTime<Utc>, elapsed_ms: i64) -> bool {
        let slow = elapsed_ms >= self.policy.slow_call_ms;
        match self.state {
            BreakerState::Closed => {
                self.push_sample(CallSample {
                    success: true,
                    slow,
                });
                // A flood of slow successes can still trip the breaker.
                self.evaluate_window(now)
            }
            BreakerState::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                self.half_open_successes += 1;
                if self.half_open_successes >= self.policy.success_threshold {
                    self.transition(BreakerState::Closed);
                    self.window.clear();
                    true
                } else {
                    false
                }
            }
            BreakerState::Open => false,
        }
    }

    /// Record a failed call. Returns true when this failure tripped the
    /// breaker OPEN.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed => {
                self.push_sample(CallSample {
                    success: false,
                    slow: false,
                });
                self.evaluate_window(now)
            }
            BreakerState::HalfOpen => {
                // Any half-open failure reopens immediately.
                self.half_open_in_flight = 0;
                self.half_open_successes = 0;
                self.open(now);
                true
            }
            BreakerState::Open => false,
        }
    }

    fn push_sample(&mut self, sample: CallSample) {
        self.window.push_back(sample);
        while self.window.len() > self.policy.window_size {
            self.window.pop_front();
        }
    }

    /// Evaluate thresholds over the window; trips when crossed.
    fn evaluate_window(&mut self, now: DateTime<Utc>) -> bool {
        if self.window.len() < self.policy.minimum_calls {
            return false;
        }
        let total = self.window.len() as f64;
        let failures = self.window.iter().filter(|s| !s.success).count() as f64;
        let slow = self.window.iter().filter(|s| s.slow).count() as f64;

        let tripped = failures / total >= self.policy.failure_rate_threshold
            || slow / total >= self.policy.slow_call_rate_threshold;
        if tripped {
            self.open(now);
        }
        tripped
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.transition(BreakerState::Open);
        self.opened_at = Some(now);
        self.window.clear();
    }

    fn transition(&mut self, to: BreakerState) {
        if self.state != to {
            info!(from = ?self.state, to = ?to, "circuit breaker transition");
            self.state = to;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap()
    }

    fn policy() -> BreakerPolicy {
        BreakerPolicy {
            window_size: 4,
            failure_rate_threshold: 0.5,
            slow_call_rate_threshold: 1.0,
            slow_call_ms: 1_000,
            minimum_calls: 4,
            wait_duration_secs: 30,
            half_open_permits: 2,
            success_threshold: 2,
        }
    }

    fn tripped_breaker() -> CircuitBreaker {
        let mut b = CircuitBreaker::new(policy());
        for _ in 0..2 {
            b.record_success(t0(), 10);
        }
        b.record_failure(t0());
        assert!(b.record_failure(t0()), "half the window failed");
        b
    }

    #[test]
    fn trips_on_failure_rate() {
        let b = tripped_breaker();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn open_rejects_until_wait_elapses() {
        let mut b = tripped_breaker();
        assert!(b.try_acquire(t0() + Duration::seconds(10)).is_err());

        // Wait elapsed: half-open probe allowed.
        assert!(b.try_acquire(t0() + Duration::seconds(30)).is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut b = tripped_breaker();
        let later = t0() + Duration::seconds(31);
        b.try_acquire(later).unwrap();
        assert!(b.record_failure(later));
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.try_acquire(later + Duration::seconds(1)).is_err());
    }

    #[test]
    fn half_open_successes_close() {
        let mut b = tripped_breaker();
        let later = t0() + Duration::seconds(31);
        b.try_acquire(later).unwrap();
        assert!(!b.record_success(later, 10));
        b.try_acquire(later).unwrap();
        assert!(b.record_success(later, 10), "second success closes");
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_budget_is_limited() {
        let mut b = tripped_breaker();
        let later = t0() + Duration::seconds(31);
        b.try_acquire(later).unwrap();
        b.try_acquire(later).unwrap();
        assert!(b.try_acquire(later).is_err(), "only two permits configured");
    }

    #[test]
    fn slow_successes_trip_breaker() {
        let mut b = CircuitBreaker::new(BreakerPolicy {
            slow_call_rate_threshold: 0.75,
            ..policy()
        });
        b.record_success(t0(), 10);
        for _ in 0..2 {
            b.record_success(t0(), 2_000);
        }
        assert!(b.record_success(t0(), 2_000), "slow-call rate crossed");
        assert_eq!(b.state(), BreakerState::Open);
    }
}
