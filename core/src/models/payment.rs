//! Payment model
//!
//! The business intent driven through the saga state machine. Each payment
//! has:
//! - Tenant identity (tenant, business unit) and customer
//! - Debit and credit account references
//! - Amount in minor units with a currency code
//! - Payment type and optional local instrument
//! - External reference for caller-side idempotency
//! - Status (the saga-visible state machine)
//!
//! CRITICAL: All money values are i64 (minor units)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Monetary amount in minor units paired with its currency code.
///
/// # Example
/// ```
/// use payment_orchestration_core::models::Money;
///
/// let m = Money::new(500_000, "ZAR"); // R5,000.00
/// assert_eq!(m.amount_minor(), 500_000);
/// assert_eq!(m.currency(), "ZAR");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount_minor: i64,
    currency: String,
}

impl Money {
    pub fn new(amount_minor: i64, currency: impl Into<String>) -> Self {
        Self {
            amount_minor,
            currency: currency.into(),
        }
    }

    pub fn amount_minor(&self) -> i64 {
        self.amount_minor
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn is_positive(&self) -> bool {
        self.amount_minor > 0
    }
}

/// Supported payment types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    Eft,
    Rtc,
    Rtgs,
    DebitOrder,
    Card,
    Wallet,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Eft => "EFT",
            PaymentType::Rtc => "RTC",
            PaymentType::Rtgs => "RTGS",
            PaymentType::DebitOrder => "DEBIT_ORDER",
            PaymentType::Card => "CARD",
            PaymentType::Wallet => "WALLET",
        }
    }
}

impl std::fmt::Display for PaymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment status
///
/// The externally visible state machine. Terminal states are `Completed`,
/// `Failed`, `TimedOut` and `Rejected`; a payment in a terminal state is
/// immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Initiated,
    FraudEval,
    LimitReserving,
    LimitReserved,
    FundsHolding,
    FundsHeld,
    Routing,
    Routed,
    ClearingSubmitted,
    AwaitingClearing,
    Posting,
    Completed,
    Compensating,
    Failed,
    TimedOut,
    Rejected,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed
                | PaymentStatus::Failed
                | PaymentStatus::TimedOut
                | PaymentStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Initiated => "INITIATED",
            PaymentStatus::FraudEval => "FRAUD_EVAL",
            PaymentStatus::LimitReserving => "LIMIT_RESERVING",
            PaymentStatus::LimitReserved => "LIMIT_RESERVED",
            PaymentStatus::FundsHolding => "FUNDS_HOLDING",
            PaymentStatus::FundsHeld => "FUNDS_HELD",
            PaymentStatus::Routing => "ROUTING",
            PaymentStatus::Routed => "ROUTED",
            PaymentStatus::ClearingSubmitted => "CLEARING_SUBMITTED",
            PaymentStatus::AwaitingClearing => "AWAITING_CLEARING",
            PaymentStatus::Posting => "POSTING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Compensating => "COMPENSATING",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::TimedOut => "TIMED_OUT",
            PaymentStatus::Rejected => "REJECTED",
        }
    }
}

/// Errors that can occur mutating a payment
#[derive(Debug, Error, PartialEq)]
pub enum PaymentError {
    #[error("payment is terminal ({status:?}) and cannot transition")]
    AlreadyTerminal { status: PaymentStatus },
}

/// A payment being orchestrated.
///
/// Created by the initiation path, then mutated only by the orchestrator
/// through status transitions. Immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    /// Unique payment identifier (time-ordered)
    payment_id: String,

    tenant_id: String,
    business_unit_id: String,

    /// Customer on whose behalf the payment is made
    customer_id: String,

    /// Source account reference
    debit_account_ref: String,

    /// Destination account reference
    credit_account_ref: String,

    amount: Money,

    payment_type: PaymentType,

    /// Scheme-specific instrument code, when the caller supplies one
    local_instrument: Option<String>,

    /// Caller idempotency reference, unique per tenant when present
    external_reference: Option<String>,

    created_at: DateTime<Utc>,

    status: PaymentStatus,
}

impl Payment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        payment_id: String,
        tenant_id: String,
        business_unit_id: String,
        customer_id: String,
        debit_account_ref: String,
        credit_account_ref: String,
        amount: Money,
        payment_type: PaymentType,
        local_instrument: Option<String>,
        external_reference: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            payment_id,
            tenant_id,
            business_unit_id,
            customer_id,
            debit_account_ref,
            credit_account_ref,
            amount,
            payment_type,
            local_instrument,
            external_reference,
            created_at,
            status: PaymentStatus::Initiated,
        }
    }

    pub fn payment_id(&self) -> &str {
        &self.payment_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn business_unit_id(&self) -> &str {
        &self.business_unit_id
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn debit_account_ref(&self) -> &str {
        &self.debit_account_ref
    }

    pub fn credit_account_ref(&self) -> &str {
        &self.credit_account_ref
    }

    pub fn amount(&self) -> &Money {
        &self.amount
    }

    pub fn payment_type(&self) -> PaymentType {
        self.payment_type
    }

    pub fn local_instrument(&self) -> Option<&str> {
        self.local_instrument.as_deref()
    }

    pub fn external_reference(&self) -> Option<&str> {
        self.external_reference.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> PaymentStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a new status. Terminal payments refuse further transitions.
    pub fn transition_to(&mut self, next: PaymentStatus) -> Result<PaymentStatus, PaymentError> {
        if self.status.is_terminal() {
            return Err(PaymentError::AlreadyTerminal {
                status: self.status,
            });
        }
        let previous = self.status;
        self.status = next;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn payment() -> Payment {
        Payment::new(
            "pay_1".to_string(),
            "T1".to_string(),
            "B1".to_string(),
            "C1".to_string(),
            "ACC_DEBIT".to_string(),
            "ACC_CREDIT".to_string(),
            Money::new(500_000, "ZAR"),
            PaymentType::Rtc,
            None,
            Some("ext-001".to_string()),
            Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap(),
        )
    }

    #[test]
    fn new_payment_starts_initiated() {
        let p = payment();
        assert_eq!(p.status(), PaymentStatus::Initiated);
        assert!(!p.is_terminal());
    }

    #[test]
    fn terminal_payment_refuses_transitions() {
        let mut p = payment();
        p.transition_to(PaymentStatus::Completed).unwrap();
        let err = p.transition_to(PaymentStatus::Failed).unwrap_err();
        assert_eq!(
            err,
            PaymentError::AlreadyTerminal {
                status: PaymentStatus::Completed
            }
        );
    }

    #[test]
    fn transition_reports_previous_status() {
        let mut p = payment();
        let prev = p.transition_to(PaymentStatus::FraudEval).unwrap();
        assert_eq!(prev, PaymentStatus::Initiated);
        assert_eq!(p.status(), PaymentStatus::FraudEval);
    }
}
