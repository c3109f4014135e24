//! Domain models for the payment orchestration core

pub mod event;
pub mod fraud_toggle;
pub mod hold;
pub mod payment;
pub mod queued_message;
pub mod reservation;
pub mod routing_rule;
pub mod saga;

// Re-exports
pub use event::{EventBody, EventEnvelope};
pub use fraud_toggle::FraudToggleConfig;
pub use hold::{FundsHold, HoldStatus};
pub use payment::{Money, Payment, PaymentStatus, PaymentType};
pub use queued_message::{QueuedMessage, QueuedMessageError, QueuedMessageStatus};
pub use reservation::{LedgerReservation, ReservationStatus};
pub use routing_rule::{
    ConditionOp, RoutingRule, RuleAction, RuleCondition, RuleStatus,
};
pub use saga::{
    CompensationAction, ResumeOn, SagaInstance, SagaStatus, SagaStep,
};
