//! Offline message queue
//!
//! Durable retry channel for idempotent external calls that could not
//! complete inline. A failed call is parked as a `QueuedMessage`; the
//! background worker re-drives due messages with exponential backoff until
//! success, retry exhaustion or expiry.
//!
//! Completions are reported back to the caller of `run_due` so the
//! orchestrator can resume sagas suspended on a queued message.

use crate::core::Clock;
use crate::error::CoreError;
use crate::metrics::{metrics, Metrics};
use crate::models::queued_message::{QueuedMessage, QueuedMessageError, QueuedMessageStatus};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Queue worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePolicy {
    /// First retry delay
    pub base_backoff_ms: i64,

    /// Backoff ceiling
    pub max_backoff_ms: i64,

    /// Default retry budget for new messages
    pub default_max_retries: u32,

    /// Default time-to-live for new messages
    pub default_ttl_secs: i64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1_000,
            max_backoff_ms: 5 * 60 * 1_000,
            default_max_retries: 10,
            default_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl QueuePolicy {
    pub fn default_ttl(&self) -> Duration {
        Duration::seconds(self.default_ttl_secs)
    }

    /// `next_retry_at` offset after `retry_count` attempts:
    /// `min(base * 2^retry_count, max_backoff)`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let shift = retry_count.min(20);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1_i64 << shift)
            .min(self.max_backoff_ms);
        Duration::milliseconds(ms)
    }
}

/// Executes a queued message against its downstream service.
pub trait QueuedCallHandler {
    fn handle(&self, message: &QueuedMessage) -> Result<(), CoreError>;
}

/// A message that completed during `run_due`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueCompletion {
    pub message_id: String,
    pub payment_id: Option<String>,
}

/// The offline queue and its worker entry point.
pub struct OfflineQueue {
    clock: Arc<dyn Clock>,
    policy: QueuePolicy,
    messages: Mutex<BTreeMap<String, QueuedMessage>>,
}

impl OfflineQueue {
    pub fn new(clock: Arc<dyn Clock>, policy: QueuePolicy) -> Self {
        Self {
            clock,
            policy,
            messages: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Park a message for background delivery.
    pub fn enqueue(&self, message: QueuedMessage) {
        debug!(
            message_id = message.message_id(),
            service = message.service_name(),
            "queued offline message"
        );
        self.messages
            .lock()
            .unwrap()
            .insert(message.message_id().to_string(), message);
    }

    /// Re-drive every due message once. Expired messages are marked and
    /// surfaced via metrics; completions are returned for saga resumption.
    pub fn run_due(&self, handler: &dyn QueuedCallHandler) -> Vec<QueueCompletion> {
        let now = self.clock.now();
        let due_ids: Vec<String> = {
            let messages = self.messages.lock().unwrap();
            messages
                .values()
                .filter(|m| m.is_due(now) || (!m.status().is_terminal() && m.is_past_expiry(now)))
                .map(|m| m.message_id().to_string())
                .collect()
        };

        let mut completions = Vec::new();
        for message_id in due_ids {
            let snapshot = {
                let mut messages = self.messages.lock().unwrap();
                let Some(message) = messages.get_mut(&message_id) else {
                    continue;
                };

                if message.is_past_expiry(now) {
                    if message.mark_expired().is_ok() {
                        Metrics::incr(&metrics().queue_expirations);
                        warn!(
                            message_id = %message_id,
                            service = message.service_name(),
                            "queued message expired without success"
                        );
                    }
                    continue;
                }

                if message.begin_processing().is_err() {
                    continue;
                }
                message.clone()
            };

            let outcome = handler.handle(&snapshot);

            let mut messages = self.messages.lock().unwrap();
            let Some(message) = messages.get_mut(&message_id) else {
                continue;
            };
            match outcome {
                Ok(()) => {
                    if message.mark_processed().is_ok() {
                        Metrics::incr(&metrics().queue_replays);
                        completions.push(QueueCompletion {
                            message_id: message_id.clone(),
                            payment_id: message.payment_id().map(|p| p.to_string()),
                        });
                    }
                }
                Err(err) => {
                    let next_retry_at = now + self.policy.backoff(message.retry_count());
                    match message.mark_failed(next_retry_at) {
                        Ok(()) => {
                            debug!(
                                message_id = %message_id,
                                error = %err,
                                retry_count = message.retry_count(),
                                "queued message attempt failed; retry scheduled"
                            );
                        }
                        Err(QueuedMessageError::RetriesExhausted { max_retries }) => {
                            warn!(
                                message_id = %message_id,
                                max_retries,
                                "queued message exhausted its retry budget"
                            );
                        }
                        Err(_) => {}
                    }
                }
            }
        }

        completions
    }

    /// Message lookup.
    pub fn get(&self, message_id: &str) -> Option<QueuedMessage> {
        self.messages.lock().unwrap().get(message_id).cloned()
    }

    /// Operator cancel.
    pub fn cancel(&self, message_id: &str) -> Result<(), CoreError> {
        let mut messages = self.messages.lock().unwrap();
        let message = messages
            .get_mut(message_id)
            .ok_or_else(|| CoreError::NotFound(format!("queued message {message_id}")))?;
        message
            .cancel()
            .map_err(|e| CoreError::Validation(e.to_string()))
    }

    /// Messages in a given status, for operator listings.
    pub fn list_by_status(&self, status: QueuedMessageStatus) -> Vec<QueuedMessage> {
        self.messages
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.status() == status)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().unwrap().is_empty()
    }

    /// Serializable copy of all messages.
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.messages.lock().unwrap().values().cloned().collect()
    }

    /// Restore from a snapshot, replacing current content.
    pub fn restore(&self, messages: Vec<QueuedMessage>) {
        let mut map = self.messages.lock().unwrap();
        map.clear();
        for message in messages {
            map.insert(message.message_id().to_string(), message);
        }
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyHandler {
        failures_before_success: AtomicU32,
    }

    impl QueuedCallHandler for FlakyHandler {
        fn handle(&self, _message: &QueuedMessage) -> Result<(), CoreError> {
            if self.failures_before_success.load(Ordering::SeqCst) == 0 {
                Ok(())
            } else {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                Err(CoreError::Transient {
                    cause: "backend down".to_string(),
                })
            }
        }
    }

    fn setup(failures: u32, max_retries: u32) -> (Arc<ManualClock>, OfflineQueue, FlakyHandler) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap(),
        ));
        let queue = OfflineQueue::new(clock.clone(), QueuePolicy::default());
        let message = QueuedMessage::new(
            "msg_1".to_string(),
            "T1".to_string(),
            "B1".to_string(),
            "core-banking-1".to_string(),
            "/accounts/hold".to_string(),
            "place_hold".to_string(),
            serde_json::json!({}),
            BTreeMap::new(),
            Some("pay_1".to_string()),
            max_retries,
            clock.now(),
            clock.now() + Duration::hours(1),
        );
        queue.enqueue(message);
        (
            clock,
            queue,
            FlakyHandler {
                failures_before_success: AtomicU32::new(failures),
            },
        )
    }

    #[test]
    fn replays_until_success_and_reports_completion() {
        let (clock, queue, handler) = setup(2, 10);

        assert!(queue.run_due(&handler).is_empty(), "first attempt fails");
        clock.advance(Duration::seconds(2));
        assert!(queue.run_due(&handler).is_empty(), "second attempt fails");
        clock.advance(Duration::seconds(4));

        let completions = queue.run_due(&handler);
        assert_eq!(
            completions,
            vec![QueueCompletion {
                message_id: "msg_1".to_string(),
                payment_id: Some("pay_1".to_string()),
            }]
        );
        assert_eq!(
            queue.get("msg_1").unwrap().status(),
            QueuedMessageStatus::Processed
        );
    }

    #[test]
    fn backoff_holds_message_until_due() {
        let (clock, queue, handler) = setup(5, 10);
        queue.run_due(&handler);
        // Immediately re-running does nothing: the retry is not due.
        assert_eq!(
            queue.get("msg_1").unwrap().retry_count(),
            1,
            "message retried before its due time"
        );
        queue.run_due(&handler);
        assert_eq!(queue.get("msg_1").unwrap().retry_count(), 1);

        clock.advance(Duration::seconds(2));
        queue.run_due(&handler);
        assert_eq!(queue.get("msg_1").unwrap().retry_count(), 2);
    }

    #[test]
    fn expiry_parks_message_for_operator() {
        let (clock, queue, handler) = setup(u32::MAX, 1_000);
        queue.run_due(&handler);

        clock.advance(Duration::hours(2));
        queue.run_due(&handler);

        let expired = queue.list_by_status(QueuedMessageStatus::Expired);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message_id(), "msg_1");
    }
}
