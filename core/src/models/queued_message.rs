//! Offline retry record
//!
//! When an idempotent external call fails and cannot complete inline, the
//! resiliency kernel parks it as a `QueuedMessage`. A background worker
//! re-drives due messages until success, exhaustion or expiry.
//!
//! # Status DAG
//!
//! ```text
//! PENDING -> PROCESSING -> PROCESSED
//!                       -> FAILED -> RETRY -> PROCESSING (on due time)
//! PENDING | RETRY | PROCESSING -> EXPIRED (expires_at passed)
//! any non-terminal -> CANCELLED (operator)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Queued message status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueuedMessageStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Retry,
    Expired,
    Cancelled,
}

impl QueuedMessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueuedMessageStatus::Processed
                | QueuedMessageStatus::Expired
                | QueuedMessageStatus::Cancelled
        )
    }
}

/// Errors for illegal queued-message transitions
#[derive(Debug, Error, PartialEq)]
pub enum QueuedMessageError {
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: QueuedMessageStatus,
        to: QueuedMessageStatus,
    },

    #[error("retry budget exhausted ({max_retries} attempts)")]
    RetriesExhausted { max_retries: u32 },
}

/// A durable record of an idempotent external call awaiting re-drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    message_id: String,
    tenant_id: String,
    business_unit_id: String,

    /// Logical downstream service name (breaker / bulkhead key)
    service_name: String,

    /// Downstream endpoint or operation locator
    endpoint: String,

    /// Operation verb as the adapter understands it
    method: String,

    payload: serde_json::Value,
    headers: BTreeMap<String, String>,

    /// Saga waiting on this message, when one is suspended
    payment_id: Option<String>,

    status: QueuedMessageStatus,
    retry_count: u32,
    max_retries: u32,
    next_retry_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl QueuedMessage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_id: String,
        tenant_id: String,
        business_unit_id: String,
        service_name: String,
        endpoint: String,
        method: String,
        payload: serde_json::Value,
        headers: BTreeMap<String, String>,
        payment_id: Option<String>,
        max_retries: u32,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id,
            tenant_id,
            business_unit_id,
            service_name,
            endpoint,
            method,
            payload,
            headers,
            payment_id,
            status: QueuedMessageStatus::Pending,
            retry_count: 0,
            max_retries,
            next_retry_at: now,
            expires_at,
            created_at: now,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn business_unit_id(&self) -> &str {
        &self.business_unit_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn payment_id(&self) -> Option<&str> {
        self.payment_id.as_deref()
    }

    pub fn status(&self) -> QueuedMessageStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn next_retry_at(&self) -> DateTime<Utc> {
        self.next_retry_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Due for a delivery attempt: PENDING or RETRY with due time reached.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            QueuedMessageStatus::Pending | QueuedMessageStatus::Retry
        ) && now >= self.next_retry_at
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// PENDING | RETRY -> PROCESSING.
    pub fn begin_processing(&mut self) -> Result<(), QueuedMessageError> {
        match self.status {
            QueuedMessageStatus::Pending | QueuedMessageStatus::Retry => {
                self.status = QueuedMessageStatus::Processing;
                self.retry_count += 1;
                Ok(())
            }
            from => Err(QueuedMessageError::IllegalTransition {
                from,
                to: QueuedMessageStatus::Processing,
            }),
        }
    }

    /// PROCESSING -> PROCESSED.
    pub fn mark_processed(&mut self) -> Result<(), QueuedMessageError> {
        match self.status {
            QueuedMessageStatus::Processing => {
                self.status = QueuedMessageStatus::Processed;
                Ok(())
            }
            from => Err(QueuedMessageError::IllegalTransition {
                from,
                to: QueuedMessageStatus::Processed,
            }),
        }
    }

    /// PROCESSING -> FAILED, then -> RETRY when attempts remain.
    ///
    /// `next_retry_at` follows `last_attempt + min(base * 2^retries,
    /// max_backoff)`; the caller supplies the computed instant.
    pub fn mark_failed(
        &mut self,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), QueuedMessageError> {
        match self.status {
            QueuedMessageStatus::Processing => {
                if self.retry_count >= self.max_retries {
                    self.status = QueuedMessageStatus::Failed;
                    Err(QueuedMessageError::RetriesExhausted {
                        max_retries: self.max_retries,
                    })
                } else {
                    self.status = QueuedMessageStatus::Retry;
                    self.next_retry_at = next_retry_at;
                    Ok(())
                }
            }
            from => Err(QueuedMessageError::IllegalTransition {
                from,
                to: QueuedMessageStatus::Failed,
            }),
        }
    }

    /// PENDING | RETRY | PROCESSING -> EXPIRED.
    pub fn mark_expired(&mut self) -> Result<(), QueuedMessageError> {
        match self.status {
            QueuedMessageStatus::Pending
            | QueuedMessageStatus::Retry
            | QueuedMessageStatus::Processing
            | QueuedMessageStatus::Failed => {
                self.status = QueuedMessageStatus::Expired;
                Ok(())
            }
            from => Err(QueuedMessageError::IllegalTransition {
                from,
                to: QueuedMessageStatus::Expired,
            }),
        }
    }

    /// Operator cancel; any non-terminal state.
    pub fn cancel(&mut self) -> Result<(), QueuedMessageError> {
        if self.status.is_terminal() {
            return Err(QueuedMessageError::IllegalTransition {
                from: self.status,
                to: QueuedMessageStatus::Cancelled,
            });
        }
        self.status = QueuedMessageStatus::Cancelled;
        Ok(())
    }
}
