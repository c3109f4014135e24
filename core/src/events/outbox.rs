//! Outbox publisher
//!
//! Background worker that drains unpublished events to the notification
//! sink in `(saga_id, seq)` order with at-least-once semantics.
//!
//! A failed delivery backs off exponentially per event and blocks the rest
//! of that saga's tail (duplicates are allowed, reordering within a saga is
//! not). Once an event exhausts its attempt cap it is parked as POISON and
//! surfaced through `EventStore::poisoned_outbox` and the metrics registry.

use crate::contracts::NotificationSink;
use crate::events::{EventStore, OutboxState};
use crate::metrics::{metrics, Metrics};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Publication policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxPolicy {
    /// First retry delay
    pub base_backoff_ms: i64,

    /// Backoff ceiling
    pub max_backoff_ms: i64,

    /// Attempts before an event is parked as POISON
    pub attempt_cap: u32,
}

impl Default for OutboxPolicy {
    fn default() -> Self {
        Self {
            base_backoff_ms: 500,
            max_backoff_ms: 60_000,
            attempt_cap: 10,
        }
    }
}

impl OutboxPolicy {
    /// Exponential backoff for the given attempt number (1-based).
    fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(20);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1_i64 << shift)
            .min(self.max_backoff_ms);
        Duration::milliseconds(ms)
    }
}

/// Result of one publication pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishReport {
    pub published: usize,
    pub failed: usize,
    pub poisoned: usize,
}

/// Drains the outbox tail of an event store.
#[derive(Debug, Clone)]
pub struct OutboxPublisher {
    policy: OutboxPolicy,
}

impl OutboxPublisher {
    pub fn new(policy: OutboxPolicy) -> Self {
        Self { policy }
    }

    /// Publish every due pending event, in `(saga_id, seq)` order.
    ///
    /// Within a saga, a failed or not-yet-due event stops that saga's tail
    /// so consumers never observe reordering. Other sagas continue
    /// independently.
    pub fn publish_due(
        &self,
        store: &mut EventStore,
        sink: &dyn NotificationSink,
        now: DateTime<Utc>,
    ) -> PublishReport {
        let mut report = PublishReport::default();

        // Pending entry indexes grouped per saga, ordered by seq.
        let mut per_saga: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, entry) in store.outbox().iter().enumerate() {
            if entry.state == OutboxState::Pending {
                per_saga.entry(entry.saga_id.clone()).or_default().push(idx);
            }
        }
        for indexes in per_saga.values_mut() {
            indexes.sort_by_key(|&idx| store.outbox()[idx].seq);
        }

        for (saga_id, indexes) in per_saga {
            for idx in indexes {
                let (due, attempts) = {
                    let entry = &store.outbox()[idx];
                    (entry.next_attempt_at <= now, entry.attempts)
                };
                if !due {
                    // Earlier event still backing off: hold the tail.
                    break;
                }

                let envelope = {
                    let entry = store.outbox()[idx].clone();
                    store.envelope_for_entry(&entry).cloned()
                };
                let Some(envelope) = envelope else {
                    debug_assert!(false, "outbox entry without an appended event");
                    continue;
                };
                let delivered = sink.deliver(&envelope).is_ok();

                let entry = &mut store.outbox_mut()[idx];
                if delivered {
                    entry.state = OutboxState::Published;
                    report.published += 1;
                    Metrics::incr(&metrics().outbox_published);
                } else {
                    entry.attempts = attempts + 1;
                    if entry.attempts >= self.policy.attempt_cap {
                        entry.state = OutboxState::Poison;
                        report.poisoned += 1;
                        Metrics::incr(&metrics().outbox_poisoned);
                        warn!(
                            saga_id = %saga_id,
                            seq = entry.seq,
                            attempts = entry.attempts,
                            "outbox event parked as poison"
                        );
                    } else {
                        entry.next_attempt_at = now + self.policy.backoff(entry.attempts);
                        report.failed += 1;
                    }
                    // Preserve order: stop this saga's tail on failure.
                    break;
                }
            }
        }

        report
    }
}
