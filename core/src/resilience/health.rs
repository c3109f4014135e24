//! Health monitor
//!
//! Periodic liveness probing with a short TTL cache. A service is HEALTHY
//! when its last probe within the TTL succeeded; a stale cache entry
//! triggers a fresh probe on the next ask.

use crate::error::CoreError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Health monitor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// How long a probe result stays fresh
    pub ttl_secs: i64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self { ttl_secs: 10 }
    }
}

#[derive(Debug, Clone, Copy)]
struct ProbeResult {
    healthy: bool,
    probed_at: DateTime<Utc>,
}

/// TTL-cached liveness view over probed services.
#[derive(Debug)]
pub struct HealthMonitor {
    policy: HealthPolicy,
    cache: Mutex<BTreeMap<String, ProbeResult>>,
}

impl HealthMonitor {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Current health of `service`, probing when the cached result is
    /// missing or stale.
    pub fn is_healthy(
        &self,
        service: &str,
        now: DateTime<Utc>,
        probe: impl FnOnce() -> Result<(), CoreError>,
    ) -> bool {
        let ttl = Duration::seconds(self.policy.ttl_secs);
        {
            let cache = self.cache.lock().unwrap();
            if let Some(result) = cache.get(service) {
                if now - result.probed_at < ttl {
                    return result.healthy;
                }
            }
        }

        let healthy = probe().is_ok();
        self.cache.lock().unwrap().insert(
            service.to_string(),
            ProbeResult {
                healthy,
                probed_at: now,
            },
        );
        healthy
    }

    /// Drop a cached result so the next ask probes fresh (used when a
    /// breaker observes recovery).
    pub fn invalidate(&self, service: &str) {
        self.cache.lock().unwrap().remove(service);
    }
}
