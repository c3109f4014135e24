//! Transaction events
//!
//! Every state change in the core is captured as an event. Events enable:
//! - Durable resumption (replay a saga's history after a crash)
//! - Auditing (verify limits, holds and compensations balance out)
//! - Downstream notification (outbox publication to external sinks)
//!
//! The envelope carries identity, ordering and tenancy; the body is the
//! typed payload. `seq` is strictly increasing and gap-free per saga and is
//! assigned by the event store at append time.

use crate::models::payment::{Money, PaymentStatus};
use crate::models::saga::SagaStep;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Typed event payload. One variant per observable state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    /// Payment accepted and saga created
    PaymentInitiated {
        payment_type: String,
        amount: Money,
    },

    /// Payment status moved between two states
    StatusChanged {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    /// Fraud evaluation passed with the given resolution
    FraudApproved { resolution: String, score: Option<f64> },

    /// Fraud evaluation denied the payment
    FraudRejected { resolution: String, score: Option<f64> },

    /// Limit capacity reserved
    LimitReserved {
        reservation_id: String,
        amount: Money,
    },

    /// Reservation consumed into the permanent counters
    LimitConsumed { reservation_id: String },

    /// Reservation released and capacity returned
    LimitReleased {
        reservation_id: String,
        reason: String,
    },

    /// Reservation expired by the sweeper
    LimitExpired { reservation_id: String },

    /// Backend hold placed
    FundsHeld {
        hold_ref: String,
        account_ref: String,
        amount: Money,
    },

    /// Backend hold released
    FundsReleased { hold_ref: String },

    /// Backend hold captured during posting
    FundsCaptured { hold_ref: String },

    /// Routing decision taken
    RoutingDecided {
        clearing_system: String,
        routing_priority: u8,
        is_fallback: bool,
    },

    /// Payment submitted to a clearing channel
    ClearingSubmitted { clearing_ref: String },

    /// Clearing confirmed the payment
    ClearingCleared { clearing_ref: String },

    /// Clearing rejected the payment
    ClearingRejected {
        clearing_ref: String,
        code: String,
    },

    /// Clearing submission cancelled during compensation
    ClearingCancelled { clearing_ref: String },

    /// A clearing cancel was impossible; parked for reconciliation
    MarkedForReconciliation { clearing_ref: String },

    /// Ledger postings applied (debit source, credit destination)
    LedgerPosted {
        debit_account_ref: String,
        credit_account_ref: String,
        amount: Money,
    },

    /// Ledger postings reversed during compensation
    LedgerReversed {
        debit_account_ref: String,
        credit_account_ref: String,
        amount: Money,
    },

    /// Terminal: payment completed
    PaymentCompleted,

    /// Terminal: payment failed after compensation
    PaymentFailed { reason: String },

    /// Terminal: payment rejected (validation / authorization / limits /
    /// funds denial)
    PaymentRejected { reason: String },

    /// Terminal: saga deadline passed
    PaymentTimedOut,

    /// Unwind started with the recorded cause
    CompensationStarted { cause: String },

    /// All compensators succeeded
    CompensationCompleted,

    /// A single step completed (fine-grained audit trail)
    StepSucceeded { step: SagaStep },

    /// Saga suspended awaiting an external signal
    SagaSuspended { waiting_on: String },

    /// Saga resumed by an external signal
    SagaResumed { trigger: String },
}

impl EventBody {
    /// Stable type tag for filtering and metrics.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventBody::PaymentInitiated { .. } => "PaymentInitiated",
            EventBody::StatusChanged { .. } => "StatusChanged",
            EventBody::FraudApproved { .. } => "FraudApproved",
            EventBody::FraudRejected { .. } => "FraudRejected",
            EventBody::LimitReserved { .. } => "LimitReserved",
            EventBody::LimitConsumed { .. } => "LimitConsumed",
            EventBody::LimitReleased { .. } => "LimitReleased",
            EventBody::LimitExpired { .. } => "LimitExpired",
            EventBody::FundsHeld { .. } => "FundsHeld",
            EventBody::FundsReleased { .. } => "FundsReleased",
            EventBody::FundsCaptured { .. } => "FundsCaptured",
            EventBody::RoutingDecided { .. } => "RoutingDecided",
            EventBody::ClearingSubmitted { .. } => "ClearingSubmitted",
            EventBody::ClearingCleared { .. } => "ClearingCleared",
            EventBody::ClearingRejected { .. } => "ClearingRejected",
            EventBody::ClearingCancelled { .. } => "ClearingCancelled",
            EventBody::MarkedForReconciliation { .. } => "MarkedForReconciliation",
            EventBody::LedgerPosted { .. } => "LedgerPosted",
            EventBody::LedgerReversed { .. } => "LedgerReversed",
            EventBody::PaymentCompleted => "PaymentCompleted",
            EventBody::PaymentFailed { .. } => "PaymentFailed",
            EventBody::PaymentRejected { .. } => "PaymentRejected",
            EventBody::PaymentTimedOut => "PaymentTimedOut",
            EventBody::CompensationStarted { .. } => "CompensationStarted",
            EventBody::CompensationCompleted => "CompensationCompleted",
            EventBody::StepSucceeded { .. } => "StepSucceeded",
            EventBody::SagaSuspended { .. } => "SagaSuspended",
            EventBody::SagaResumed { .. } => "SagaResumed",
        }
    }
}

/// Event identity, ordering and tenancy around a typed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,

    /// Saga (= payment) this event belongs to
    pub saga_id: String,

    /// Strictly increasing, gap-free per saga
    pub seq: u64,

    pub occurred_at: DateTime<Utc>,

    /// Correlation id: the saga id for all saga-driven events
    pub correlation_id: String,

    /// Event that caused this one, for external-event-driven transitions
    pub causation_id: Option<String>,

    pub tenant_id: String,
    pub business_unit_id: String,

    pub body: EventBody,
}

impl EventEnvelope {
    pub fn event_type(&self) -> &'static str {
        self.body.event_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_tag_is_stable() {
        let body = EventBody::LimitReserved {
            reservation_id: "res_1".to_string(),
            amount: Money::new(500_000, "ZAR"),
        };
        assert_eq!(body.event_type(), "LimitReserved");
    }

    #[test]
    fn body_serializes_with_type_tag() {
        let body = EventBody::PaymentCompleted;
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "payment_completed");
    }
}
