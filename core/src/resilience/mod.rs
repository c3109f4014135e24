//! Resiliency kernel
//!
//! Uniform guard around every external call: bulkhead, circuit breaker,
//! bounded retry with jittered backoff, and a cooperative deadline passed
//! down to the adapter. Breaker and bulkhead state is keyed per
//! `(service, tenant)` and held in process (single-region deployment).
//!
//! The kernel is synchronous; waiting between attempts goes through the
//! injectable `Sleeper` so tests can run a full retry schedule without
//! real delay. Failed idempotent calls that should survive the process are
//! parked in the `offline_queue` by their adapters, not by the kernel.

pub mod breaker;
pub mod bulkhead;
pub mod health;
pub mod offline_queue;
pub mod retry;

pub use breaker::{BreakerPolicy, BreakerState, CircuitBreaker};
pub use bulkhead::{Bulkhead, BulkheadPolicy};
pub use health::{HealthMonitor, HealthPolicy};
pub use offline_queue::{OfflineQueue, QueueCompletion, QueuePolicy, QueuedCallHandler};
pub use retry::RetryPolicy;

use crate::core::{Clock, Deadline, TenantContext};
use crate::error::CoreError;
use crate::metrics::{metrics, Metrics};
use crate::rng::JitterRng;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Injectable wait primitive for retry backoff.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Production sleeper: blocks the worker thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if let Ok(d) = duration.to_std() {
            std::thread::sleep(d);
        }
    }
}

/// Test sleeper: returns immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSleeper;

impl Sleeper for NoopSleeper {
    fn sleep(&self, _duration: Duration) {}
}

/// Complete resilience tuning for one service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicePolicy {
    pub breaker: BreakerPolicy,
    pub retry: RetryPolicy,
    pub bulkhead: BulkheadPolicy,

    /// Per-call timeout; the effective deadline handed to the adapter is
    /// the earlier of this and the caller's deadline
    pub call_timeout_ms: i64,
}

impl ServicePolicy {
    pub fn call_timeout(&self) -> Duration {
        if self.call_timeout_ms > 0 {
            Duration::milliseconds(self.call_timeout_ms)
        } else {
            Duration::seconds(30)
        }
    }
}

struct ServiceGuards {
    breaker: CircuitBreaker,
    bulkhead: Bulkhead,
}

/// The kernel: `call` wraps an operation with the service's policies.
pub struct ResilienceKernel {
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    default_policy: ServicePolicy,
    policies: Mutex<BTreeMap<String, ServicePolicy>>,
    guards: Mutex<BTreeMap<(String, String), ServiceGuards>>,
    rng: Mutex<JitterRng>,
}

impl ResilienceKernel {
    pub fn new(clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>, jitter_seed: u64) -> Self {
        Self {
            clock,
            sleeper,
            default_policy: ServicePolicy::default(),
            policies: Mutex::new(BTreeMap::new()),
            guards: Mutex::new(BTreeMap::new()),
            rng: Mutex::new(JitterRng::new(jitter_seed)),
        }
    }

    /// Register a service-specific policy (builder style).
    pub fn with_policy(self, service: &str, policy: ServicePolicy) -> Self {
        self.set_policy(service, policy);
        self
    }

    pub fn set_policy(&self, service: &str, policy: ServicePolicy) {
        self.policies
            .lock()
            .unwrap()
            .insert(service.to_string(), policy);
    }

    fn policy_for(&self, service: &str) -> ServicePolicy {
        self.policies
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    /// Current breaker state for observability; None when the pair has not
    /// called yet.
    pub fn breaker_state(&self, service: &str, ctx: &TenantContext) -> Option<BreakerState> {
        self.guards
            .lock()
            .unwrap()
            .get(&(service.to_string(), ctx.tenant_id().to_string()))
            .map(|g| g.breaker.state())
    }

    /// Force the breaker for a pair into a state (tests and operator
    /// tooling).
    pub fn trip_breaker(&self, service: &str, ctx: &TenantContext) {
        let policy = self.policy_for(service);
        let mut guards = self.guards.lock().unwrap();
        let guard = guards
            .entry((service.to_string(), ctx.tenant_id().to_string()))
            .or_insert_with(|| ServiceGuards {
                breaker: CircuitBreaker::new(policy.breaker.clone()),
                bulkhead: Bulkhead::new(policy.bulkhead.clone()),
            });
        let now = self.clock.now();
        // Enough synthetic failures to cross any sane threshold.
        for _ in 0..policy.breaker.window_size.max(policy.breaker.minimum_calls) {
            guard.breaker.record_failure(now);
        }
    }

    /// Run `op` under the service's bulkhead, breaker, retry and timeout
    /// policies. The closure receives the effective deadline for one
    /// attempt and must give up once it has passed.
    pub fn call<T>(
        &self,
        service: &str,
        ctx: &TenantContext,
        deadline: Deadline,
        op: &mut dyn FnMut(Deadline) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let policy = self.policy_for(service);
        let key = (service.to_string(), ctx.tenant_id().to_string());
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let now = self.clock.now();
            if deadline.is_expired(now) {
                return Err(CoreError::DeadlineExceeded);
            }

            // Gate: breaker then bulkhead. The permit must outlive the op.
            let permit = {
                let mut guards = self.guards.lock().unwrap();
                let guard = guards.entry(key.clone()).or_insert_with(|| ServiceGuards {
                    breaker: CircuitBreaker::new(policy.breaker.clone()),
                    bulkhead: Bulkhead::new(policy.bulkhead.clone()),
                });

                if guard.breaker.try_acquire(now).is_err() {
                    drop(guards);
                    let err = CoreError::ServiceUnavailable {
                        service: service.to_string(),
                    };
                    if policy.retry.should_retry(attempt, &err) {
                        self.backoff(&policy, attempt, &err);
                        continue;
                    }
                    return Err(err);
                }

                match guard.bulkhead.try_acquire() {
                    Ok(permit) => permit,
                    Err(_) => {
                        // The breaker admitted a call that never ran.
                        guard.breaker.record_success(now, 0);
                        drop(guards);
                        Metrics::incr(&metrics().bulkhead_rejections);
                        let err = CoreError::BulkheadSaturated {
                            service: service.to_string(),
                        };
                        if policy.retry.should_retry(attempt, &err) {
                            self.backoff(&policy, attempt, &err);
                            continue;
                        }
                        return Err(err);
                    }
                }
            };

            let attempt_deadline =
                deadline.min(Deadline::after(now, policy.call_timeout()));
            let started = self.clock.now();
            let result = op(attempt_deadline);
            let elapsed_ms = (self.clock.now() - started).num_milliseconds();
            drop(permit);

            match result {
                Ok(value) => {
                    let mut guards = self.guards.lock().unwrap();
                    if let Some(guard) = guards.get_mut(&key) {
                        guard.breaker.record_success(self.clock.now(), elapsed_ms);
                    }
                    return Ok(value);
                }
                Err(mut err) => {
                    // An attempt-level timeout is retryable while the
                    // caller's own deadline still has budget.
                    if err == CoreError::DeadlineExceeded
                        && !deadline.is_expired(self.clock.now())
                    {
                        err = CoreError::Transient {
                            cause: format!("{service} call timed out"),
                        };
                    }

                    // Client-side denials mean the service worked; they are
                    // not breaker failures and are never retried.
                    if err.is_retryable() || err == CoreError::DeadlineExceeded {
                        let mut guards = self.guards.lock().unwrap();
                        if let Some(guard) = guards.get_mut(&key) {
                            if guard.breaker.record_failure(self.clock.now()) {
                                Metrics::incr(&metrics().breaker_trips);
                                warn!(service, tenant = ctx.tenant_id(), "circuit breaker opened");
                            }
                        }
                    } else {
                        let mut guards = self.guards.lock().unwrap();
                        if let Some(guard) = guards.get_mut(&key) {
                            guard.breaker.record_success(self.clock.now(), elapsed_ms);
                        }
                    }

                    if policy.retry.should_retry(attempt, &err) {
                        debug!(service, attempt, error = %err, "retrying call");
                        self.backoff(&policy, attempt, &err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// `call`, invoking `fallback` with the final error when the guarded
    /// operation could not complete.
    pub fn call_with_fallback<T>(
        &self,
        service: &str,
        ctx: &TenantContext,
        deadline: Deadline,
        op: &mut dyn FnMut(Deadline) -> Result<T, CoreError>,
        fallback: impl FnOnce(CoreError) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        match self.call(service, ctx, deadline, op) {
            Ok(value) => Ok(value),
            Err(err) => fallback(err),
        }
    }

    fn backoff(&self, policy: &ServicePolicy, attempt: u32, err: &CoreError) {
        Metrics::incr(&metrics().retries);
        let delay = {
            let mut rng = self.rng.lock().unwrap();
            policy.retry.backoff(attempt, err, &mut rng)
        };
        self.sleeper.sleep(delay);
    }
}

impl std::fmt::Debug for ResilienceKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceKernel").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn kernel() -> (Arc<ManualClock>, ResilienceKernel) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap(),
        ));
        let kernel = ResilienceKernel::new(clock.clone(), Arc::new(NoopSleeper), 42);
        (clock, kernel)
    }

    fn ctx() -> TenantContext {
        TenantContext::new("T1", "B1")
    }

    fn far_deadline(clock: &ManualClock) -> Deadline {
        Deadline::after(clock.now(), Duration::hours(1))
    }

    #[test]
    fn retries_transient_until_success() {
        let (clock, kernel) = kernel();
        let calls = AtomicU32::new(0);

        let result = kernel.call("svc", &ctx(), far_deadline(&clock), &mut |_| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CoreError::Transient {
                    cause: "blip".to_string(),
                })
            } else {
                Ok(7)
            }
        });

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn validation_errors_do_not_retry_or_trip() {
        let (clock, kernel) = kernel();
        let calls = AtomicU32::new(0);

        let result: Result<(), CoreError> =
            kernel.call("svc", &ctx(), far_deadline(&clock), &mut |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::Validation("bad request".to_string()))
            });

        assert!(matches!(result, Err(CoreError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            kernel.breaker_state("svc", &ctx()),
            Some(BreakerState::Closed)
        );
    }

    #[test]
    fn open_breaker_short_circuits_with_service_unavailable() {
        let (clock, kernel) = kernel();
        kernel.trip_breaker("svc", &ctx());

        let calls = AtomicU32::new(0);
        let result: Result<(), CoreError> =
            kernel.call("svc", &ctx(), far_deadline(&clock), &mut |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        assert!(matches!(result, Err(CoreError::ServiceUnavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "op must not run while OPEN");
        assert_eq!(kernel.breaker_state("svc", &ctx()), Some(BreakerState::Open));
    }

    #[test]
    fn breaker_recovers_through_half_open() {
        let (clock, kernel) = kernel();
        kernel.trip_breaker("svc", &ctx());

        // Wait out the OPEN window, then succeed through HALF_OPEN.
        clock.advance(Duration::seconds(31));
        for _ in 0..2 {
            let result = kernel.call("svc", &ctx(), far_deadline(&clock), &mut |_| Ok(1));
            assert_eq!(result, Ok(1));
        }
        assert_eq!(
            kernel.breaker_state("svc", &ctx()),
            Some(BreakerState::Closed)
        );
    }

    #[test]
    fn expired_deadline_fails_fast() {
        let (clock, kernel) = kernel();
        let expired = Deadline::at(clock.now());
        let result: Result<(), CoreError> =
            kernel.call("svc", &ctx(), expired, &mut |_| Ok(()));
        assert_eq!(result, Err(CoreError::DeadlineExceeded));
    }

    #[test]
    fn breaker_state_is_tenant_scoped() {
        let (clock, kernel) = kernel();
        kernel.trip_breaker("svc", &ctx());

        let other = TenantContext::new("T2", "B1");
        let result = kernel.call("svc", &other, far_deadline(&clock), &mut |_| Ok(5));
        assert_eq!(result, Ok(5), "another tenant's breaker is independent");
    }
}
