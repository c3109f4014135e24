//! Bulkhead
//!
//! Per-service concurrency cap. Saturation rejects immediately; queueing is
//! the caller's problem (the offline queue exists for deferrable work).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Bulkhead tuning for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadPolicy {
    /// Maximum concurrent in-flight calls
    pub max_concurrent: u32,
}

impl Default for BulkheadPolicy {
    fn default() -> Self {
        Self { max_concurrent: 16 }
    }
}

/// Returned when the bulkhead is saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadRejection;

/// Concurrency gate for one service.
#[derive(Debug)]
pub struct Bulkhead {
    policy: BulkheadPolicy,
    in_flight: Arc<AtomicU32>,
}

impl Bulkhead {
    pub fn new(policy: BulkheadPolicy) -> Self {
        Self {
            policy,
            in_flight: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Acquire a permit, released when the returned guard drops.
    pub fn try_acquire(&self) -> Result<BulkheadPermit, BulkheadRejection> {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.policy.max_concurrent {
                return Err(BulkheadRejection);
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(BulkheadPermit {
                        in_flight: self.in_flight.clone(),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }
}

/// RAII permit; dropping returns the slot.
#[derive(Debug)]
pub struct BulkheadPermit {
    in_flight: Arc<AtomicU32>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturation_rejects_immediately() {
        let bulkhead = Bulkhead::new(BulkheadPolicy { max_concurrent: 2 });
        let _p1 = bulkhead.try_acquire().unwrap();
        let _p2 = bulkhead.try_acquire().unwrap();
        assert!(bulkhead.try_acquire().is_err());
    }

    #[test]
    fn dropping_permit_frees_slot() {
        let bulkhead = Bulkhead::new(BulkheadPolicy { max_concurrent: 1 });
        {
            let _p = bulkhead.try_acquire().unwrap();
            assert_eq!(bulkhead.in_flight(), 1);
        }
        assert_eq!(bulkhead.in_flight(), 0);
        assert!(bulkhead.try_acquire().is_ok());
    }
}
