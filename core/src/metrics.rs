//! Process-wide metrics registry
//!
//! The single piece of global state in the crate, and deliberately so: a
//! registry of monotonic counters read by operators and tests. Everything
//! else receives its collaborators explicitly.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for the orchestration core.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Retry attempts performed by the resiliency kernel
    pub retries: AtomicU64,

    /// Circuit breaker CLOSED/HALF_OPEN -> OPEN transitions
    pub breaker_trips: AtomicU64,

    /// Calls rejected by a saturated bulkhead
    pub bulkhead_rejections: AtomicU64,

    /// Outbox events successfully published
    pub outbox_published: AtomicU64,

    /// Outbox events parked as POISON
    pub outbox_poisoned: AtomicU64,

    /// Offline queue messages re-driven to completion
    pub queue_replays: AtomicU64,

    /// Offline queue messages that expired without success
    pub queue_expirations: AtomicU64,

    /// Sagas reaching COMPLETED
    pub sagas_completed: AtomicU64,

    /// Sagas reaching FAILED
    pub sagas_failed: AtomicU64,

    /// Sagas reaching REJECTED
    pub sagas_rejected: AtomicU64,

    /// Sagas reaching TIMED_OUT
    pub sagas_timed_out: AtomicU64,

    /// Compensation runs started
    pub compensations_started: AtomicU64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

static REGISTRY: Lazy<Metrics> = Lazy::new(Metrics::default);

/// The process-wide registry.
pub fn metrics() -> &'static Metrics {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let before = Metrics::read(&metrics().retries);
        Metrics::incr(&metrics().retries);
        Metrics::incr(&metrics().retries);
        assert!(Metrics::read(&metrics().retries) >= before + 2);
    }
}
