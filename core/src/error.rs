//! Error taxonomy
//!
//! One crate-wide error enum plus the failure classification the saga
//! engine drives on. Narrow per-module errors convert into `CoreError` with
//! `#[from]` where they cross a component boundary.
//!
//! Classification rules:
//! - validation / authorization / limit / insufficient-funds failures are
//!   final and reject the payment
//! - clearing rejection is final and fails the payment after compensation
//! - transient and unknown failures are retried within budget
//! - open-circuit failures are retried with breaker-aware (longer) backoff
//! - deadline expiry is its own class; it switches the saga to the
//!   compensating path with cause TIMED_OUT

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limits::LimitDimension;

/// Crate-wide error taxonomy.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("limit exceeded: {dimension}")]
    LimitExceeded { dimension: LimitDimension },

    #[error("payment {payment_id} already holds a live reservation")]
    DuplicateReservation { payment_id: String },

    #[error("insufficient funds on account {account_ref}")]
    InsufficientFunds { account_ref: String },

    #[error("account {account_ref} is closed")]
    AccountClosed { account_ref: String },

    #[error("backend {backend} does not support {op}")]
    OperationNotSupported { backend: String, op: String },

    #[error("transient failure: {cause}")]
    Transient { cause: String },

    #[error("service {service} unavailable")]
    ServiceUnavailable { service: String },

    #[error("bulkhead saturated for service {service}")]
    BulkheadSaturated { service: String },

    #[error("clearing rejected payment: {code}")]
    ClearingRejected { code: String },

    #[error("no routing rule matched and no tenant default is configured")]
    NoRouteFound,

    #[error("compensation failed: {0}")]
    CompensationFailed(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// How the saga engine reacts to a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Non-retryable denial: saga ends REJECTED (after releasing upstream
    /// effects).
    Reject,

    /// Non-retryable operational failure: compensate, then saga ends FAILED.
    Fail,

    /// Retry within the step's retry budget.
    Retryable,

    /// Retry with longer, breaker-aware backoff.
    RetryableBreaker,

    /// Saga deadline has passed: compensate with cause TIMED_OUT.
    TimedOut,
}

impl CoreError {
    /// Classify for the saga driving loop.
    pub fn class(&self) -> FailureClass {
        match self {
            CoreError::Validation(_)
            | CoreError::Authorization(_)
            | CoreError::LimitExceeded { .. }
            | CoreError::DuplicateReservation { .. }
            | CoreError::InsufficientFunds { .. }
            | CoreError::AccountClosed { .. }
            | CoreError::OperationNotSupported { .. }
            | CoreError::NoRouteFound
            | CoreError::InvalidConfig(_) => FailureClass::Reject,

            CoreError::ClearingRejected { .. } => FailureClass::Fail,

            CoreError::ServiceUnavailable { .. } => FailureClass::RetryableBreaker,

            CoreError::DeadlineExceeded => FailureClass::TimedOut,

            // Unknown / infrastructure failures are treated as transient up
            // to the retry budget.
            CoreError::Transient { .. }
            | CoreError::BulkheadSaturated { .. }
            | CoreError::CompensationFailed(_)
            | CoreError::NotFound(_)
            | CoreError::Internal(_) => FailureClass::Retryable,
        }
    }

    /// True when the retry policy may attempt the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            FailureClass::Retryable | FailureClass::RetryableBreaker
        )
    }

    /// Short stable tag for metrics and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::Authorization(_) => "authorization",
            CoreError::LimitExceeded { .. } => "limit_exceeded",
            CoreError::DuplicateReservation { .. } => "duplicate_reservation",
            CoreError::InsufficientFunds { .. } => "insufficient_funds",
            CoreError::AccountClosed { .. } => "account_closed",
            CoreError::OperationNotSupported { .. } => "operation_not_supported",
            CoreError::Transient { .. } => "transient",
            CoreError::ServiceUnavailable { .. } => "service_unavailable",
            CoreError::BulkheadSaturated { .. } => "bulkhead_saturated",
            CoreError::ClearingRejected { .. } => "clearing_rejected",
            CoreError::NoRouteFound => "no_route_found",
            CoreError::CompensationFailed(_) => "compensation_failed",
            CoreError::DeadlineExceeded => "deadline_exceeded",
            CoreError::InvalidConfig(_) => "invalid_config",
            CoreError::NotFound(_) => "not_found",
            CoreError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denials_are_not_retryable() {
        assert_eq!(
            CoreError::Validation("bad amount".into()).class(),
            FailureClass::Reject
        );
        assert_eq!(
            CoreError::InsufficientFunds {
                account_ref: "ACC1".into()
            }
            .class(),
            FailureClass::Reject
        );
        assert!(!CoreError::NoRouteFound.is_retryable());
    }

    #[test]
    fn open_circuit_gets_breaker_class() {
        let err = CoreError::ServiceUnavailable {
            service: "core-banking-1".into(),
        };
        assert_eq!(err.class(), FailureClass::RetryableBreaker);
        assert!(err.is_retryable());
    }

    #[test]
    fn clearing_rejection_fails_after_compensation() {
        let err = CoreError::ClearingRejected { code: "AC04".into() };
        assert_eq!(err.class(), FailureClass::Fail);
        assert!(!err.is_retryable());
    }
}
