//! External adapter contracts
//!
//! The interfaces the core consumes. Implementations live outside the
//! orchestration core (HTTP clients, scheme gateways, scoring services);
//! tests use in-memory fakes. All contracts take the tenant context and a
//! deadline explicitly; adapters must give up once the deadline passes.

use crate::core::{Deadline, TenantContext};
use crate::error::CoreError;
use crate::models::event::EventEnvelope;
use crate::models::payment::{Money, Payment, PaymentType};
use crate::routing::RoutingDecision;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Inbound payment initiation request.
///
/// Idempotent by `(tenant_id, external_reference)`: resubmitting the same
/// reference returns the original payment untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub tenant_id: String,
    pub business_unit_id: String,

    /// Generated when absent
    pub payment_id: Option<String>,

    pub external_reference: Option<String>,
    pub customer_id: String,
    pub debit_account_ref: String,
    pub credit_account_ref: String,
    pub amount_minor: i64,
    pub currency: String,
    pub payment_type: PaymentType,
    pub local_instrument: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Source of initiation requests (queue consumer, file ingester, ...).
pub trait PaymentInitiationSource {
    /// Pull the next pending request, if any.
    fn poll(&mut self) -> Option<PaymentRequest>;
}

/// Outcome reported by a clearing system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClearingOutcome {
    Cleared,
    Rejected { code: String },
    Pending,
}

/// A clearing system adapter.
///
/// Synchronous channels (RTC, RTGS) resolve the outcome inside
/// `await_outcome` immediately after submission; asynchronous channels
/// (EFT, ACH-style) report `Pending` and deliver the outcome later through
/// the orchestrator's clearing-outcome processor.
pub trait ClearingChannel: Send + Sync {
    /// Channel name as routing decisions reference it.
    fn name(&self) -> &str;

    /// True when the outcome resolves at submission time.
    fn is_synchronous(&self) -> bool;

    /// True when `cancel` can revoke a submission.
    fn supports_cancellation(&self) -> bool;

    /// Submit the payment; returns the channel's clearing reference.
    fn submit(
        &self,
        ctx: &TenantContext,
        payment: &Payment,
        decision: &RoutingDecision,
        deadline: Deadline,
    ) -> Result<String, CoreError>;

    /// Attempt to cancel a prior submission. `Ok(false)` means the channel
    /// could not cancel (already cleared or past the point of no return).
    fn cancel(&self, ctx: &TenantContext, clearing_ref: &str) -> Result<bool, CoreError>;

    /// Current outcome for a submission.
    fn await_outcome(
        &self,
        ctx: &TenantContext,
        clearing_ref: &str,
    ) -> Result<ClearingOutcome, CoreError>;
}

/// External fraud scorer. Returns a normalized score in `[0, 1]`; the
/// provider's native field mapping is its own concern.
pub trait FraudScoreProvider: Send + Sync {
    fn score(
        &self,
        ctx: &TenantContext,
        payment: &Payment,
        deadline: Deadline,
    ) -> Result<f64, CoreError>;
}

/// Fire-and-forget consumer of published events.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, event: &EventEnvelope) -> Result<(), CoreError>;
}

/// Uniform account operation verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountOp {
    GetAccount,
    PlaceHold,
    CaptureHold,
    ReleaseHold,
    Credit,
    Debit,
}

impl AccountOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountOp::GetAccount => "get_account",
            AccountOp::PlaceHold => "place_hold",
            AccountOp::CaptureHold => "capture_hold",
            AccountOp::ReleaseHold => "release_hold",
            AccountOp::Credit => "credit",
            AccountOp::Debit => "debit",
        }
    }

    /// Ops that move or encumber money. These are never served from cache
    /// and must carry an idempotency key.
    pub fn is_fund_affecting(&self) -> bool {
        !matches!(self, AccountOp::GetAccount)
    }
}

impl std::fmt::Display for AccountOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform backend request shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRequest {
    pub op: AccountOp,
    pub account_ref: String,
    pub amount: Option<Money>,

    /// Derived from `(payment_id, op)`; repeat calls must not double-apply
    pub idempotency_key: String,

    pub reason: Option<String>,
    pub payment_id: String,

    /// Existing hold reference for capture/release
    pub hold_ref: Option<String>,
}

/// Backend-level status. HTTP codes are an encoding detail of the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendStatus {
    Ok,
    NotSupported,
    InsufficientFunds,
    AccountClosed,
    Failed,
}

/// Uniform backend response shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub status: BackendStatus,
    pub hold_ref: Option<String>,
    pub balance: Option<i64>,
    pub error: Option<String>,
}

impl BackendResponse {
    pub fn ok() -> Self {
        Self {
            status: BackendStatus::Ok,
            hold_ref: None,
            balance: None,
            error: None,
        }
    }

    pub fn with_hold_ref(mut self, hold_ref: impl Into<String>) -> Self {
        self.hold_ref = Some(hold_ref.into());
        self
    }

    pub fn with_balance(mut self, balance: i64) -> Self {
        self.balance = Some(balance);
        self
    }
}

/// One of the N core-banking systems behind the account adapter.
pub trait AccountBackend: Send + Sync {
    /// Stable backend identifier matching the routing table.
    fn backend_id(&self) -> &str;

    /// Execute a uniform account operation.
    fn execute(
        &self,
        ctx: &TenantContext,
        request: &BackendRequest,
        deadline: Deadline,
    ) -> Result<BackendResponse, CoreError>;

    /// Liveness probe used by the health monitor.
    fn health_check(&self) -> Result<(), CoreError>;
}
