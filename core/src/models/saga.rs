//! Saga aggregate
//!
//! One `SagaInstance` per payment, keyed by the payment id. The instance
//! records which steps completed, which compensating actions would undo
//! them, and where a suspended saga must resume.
//!
//! # Critical Invariants
//!
//! 1. `compensation_stack` is exactly the reverse of `completed_steps`
//!    filtered to steps that declared a compensator
//! 2. A terminal saga has an empty compensation stack
//! 3. At most one driver holds the lease at a time; all mutation happens
//!    under the lease

use crate::models::payment::Money;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Steps of the payment saga, in driving order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStep {
    FraudEvaluate,
    ReserveLimit,
    HoldFunds,
    SelectRoute,
    SubmitClearing,
    PostLedger,
    ConsumeReservation,
}

impl SagaStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::FraudEvaluate => "fraud_evaluate",
            SagaStep::ReserveLimit => "reserve_limit",
            SagaStep::HoldFunds => "hold_funds",
            SagaStep::SelectRoute => "select_route",
            SagaStep::SubmitClearing => "submit_clearing",
            SagaStep::PostLedger => "post_ledger",
            SagaStep::ConsumeReservation => "consume_reservation",
        }
    }

    /// Complete step order for a fresh saga.
    pub const ORDER: [SagaStep; 7] = [
        SagaStep::FraudEvaluate,
        SagaStep::ReserveLimit,
        SagaStep::HoldFunds,
        SagaStep::SelectRoute,
        SagaStep::SubmitClearing,
        SagaStep::PostLedger,
        SagaStep::ConsumeReservation,
    ];

    /// The step after this one, if any.
    pub fn next(&self) -> Option<SagaStep> {
        let idx = Self::ORDER.iter().position(|s| s == self)?;
        Self::ORDER.get(idx + 1).copied()
    }
}

impl std::fmt::Display for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic inverse of a completed step, executed LIFO on unwind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CompensationAction {
    /// Return reserved limit capacity
    ReleaseReservation { reservation_id: String },

    /// Release a backend funds hold
    ReleaseHold {
        account_ref: String,
        hold_ref: String,
    },

    /// Cancel a clearing submission (falls back to reconciliation marking
    /// when the channel cannot cancel)
    CancelClearing { clearing_ref: String },

    /// Reverse posted ledger entries with an opposite debit/credit pair
    ReverseLedger {
        debit_account_ref: String,
        credit_account_ref: String,
        amount: Money,
    },
}

/// Saga status (terminal: Completed, Failed, TimedOut, Rejected).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    Running,
    Compensating,
    Completed,
    Failed,
    TimedOut,
    Rejected,
}

impl SagaStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed
                | SagaStatus::Failed
                | SagaStatus::TimedOut
                | SagaStatus::Rejected
        )
    }
}

/// Durable marker describing what a suspended saga is waiting for.
///
/// No in-process state survives a crash; resumption is driven by event
/// processors matching on these markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumeOn {
    /// Asynchronous clearing outcome for the given reference
    ClearingOutcome { clearing_ref: String },

    /// Completion of an offline queued message
    QueuedMessage { message_id: String },

    /// A timer tick at or after the given instant
    Timer { at: DateTime<Utc> },
}

/// Single-writer lease on a saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaLease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Errors that can occur mutating a saga
#[derive(Debug, Error, PartialEq)]
pub enum SagaError {
    #[error("saga lease held by {owner} until {expires_at}")]
    LeaseHeld {
        owner: String,
        expires_at: DateTime<Utc>,
    },

    #[error("saga is terminal ({status:?}) and cannot transition")]
    AlreadyTerminal { status: SagaStatus },

    #[error("saga is not compensating")]
    NotCompensating,
}

/// The orchestrator aggregate for one payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Equals the payment id
    saga_id: String,

    tenant_id: String,
    business_unit_id: String,

    /// Next step to execute while RUNNING
    current_step: Option<SagaStep>,

    /// Steps completed so far, in execution order
    completed_steps: Vec<SagaStep>,

    /// Compensators pushed as their steps completed; popped LIFO
    compensation_stack: Vec<CompensationAction>,

    /// Attempts used per step (step name -> count)
    attempt_counts: BTreeMap<String, u32>,

    /// Sequence number of the last event appended for this saga
    last_event_seq: u64,

    /// Wall deadline for the whole saga
    deadline_at: DateTime<Utc>,

    status: SagaStatus,

    /// Error kind that pushed the saga into compensation, if any
    failure_kind: Option<String>,

    /// Human-readable failure detail
    failure_reason: Option<String>,

    /// What a suspended saga is waiting for
    resume_on: Option<ResumeOn>,

    /// Set by an external cancel request; honored at the next step boundary
    cancel_requested: bool,

    lease: Option<SagaLease>,

    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SagaInstance {
    pub fn new(
        saga_id: String,
        tenant_id: String,
        business_unit_id: String,
        deadline_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            saga_id,
            tenant_id,
            business_unit_id,
            current_step: Some(SagaStep::ORDER[0]),
            completed_steps: Vec::new(),
            compensation_stack: Vec::new(),
            attempt_counts: BTreeMap::new(),
            last_event_seq: 0,
            deadline_at,
            status: SagaStatus::Running,
            failure_kind: None,
            failure_reason: None,
            resume_on: None,
            cancel_requested: false,
            lease: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn business_unit_id(&self) -> &str {
        &self.business_unit_id
    }

    pub fn current_step(&self) -> Option<SagaStep> {
        self.current_step
    }

    pub fn completed_steps(&self) -> &[SagaStep] {
        &self.completed_steps
    }

    pub fn compensation_stack(&self) -> &[CompensationAction] {
        &self.compensation_stack
    }

    pub fn attempts(&self, step: SagaStep) -> u32 {
        self.attempt_counts
            .get(step.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn last_event_seq(&self) -> u64 {
        self.last_event_seq
    }

    pub fn set_last_event_seq(&mut self, seq: u64) {
        self.last_event_seq = seq;
    }

    pub fn deadline_at(&self) -> DateTime<Utc> {
        self.deadline_at
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn failure_kind(&self) -> Option<&str> {
        self.failure_kind.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn resume_on(&self) -> Option<&ResumeOn> {
        self.resume_on.as_ref()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    // ------------------------------------------------------------------
    // Lease
    // ------------------------------------------------------------------

    /// Acquire (or renew) the single-writer lease.
    ///
    /// A live lease held by another owner refuses the acquire; an expired
    /// lease is taken over.
    pub fn acquire_lease(
        &mut self,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), SagaError> {
        if let Some(lease) = &self.lease {
            if lease.owner != owner && lease.expires_at > now {
                return Err(SagaError::LeaseHeld {
                    owner: lease.owner.clone(),
                    expires_at: lease.expires_at,
                });
            }
        }
        self.lease = Some(SagaLease {
            owner: owner.to_string(),
            expires_at: now + ttl,
        });
        Ok(())
    }

    /// Release the lease if held by `owner`.
    pub fn release_lease(&mut self, owner: &str) {
        if let Some(lease) = &self.lease {
            if lease.owner == owner {
                self.lease = None;
            }
        }
    }

    pub fn lease(&self) -> Option<&SagaLease> {
        self.lease.as_ref()
    }

    // ------------------------------------------------------------------
    // Step bookkeeping
    // ------------------------------------------------------------------

    /// Record one attempt at a step; returns the new attempt count.
    pub fn record_attempt(&mut self, step: SagaStep, now: DateTime<Utc>) -> u32 {
        let count = self
            .attempt_counts
            .entry(step.as_str().to_string())
            .or_insert(0);
        *count += 1;
        self.updated_at = now;
        *count
    }

    /// Record a successful step: advance `current_step` and push the
    /// compensator, keeping the stack the exact reverse of compensatable
    /// completed steps.
    pub fn record_step_success(
        &mut self,
        step: SagaStep,
        compensator: Option<CompensationAction>,
        now: DateTime<Utc>,
    ) {
        self.completed_steps.push(step);
        if let Some(action) = compensator {
            self.compensation_stack.push(action);
        }
        self.current_step = step.next();
        self.resume_on = None;
        self.updated_at = now;
    }

    /// Suspend at the current step until the marker fires.
    pub fn suspend(&mut self, marker: ResumeOn, now: DateTime<Utc>) {
        self.resume_on = Some(marker);
        self.updated_at = now;
    }

    /// Clear the suspension marker (the awaited signal arrived).
    pub fn resume(&mut self, now: DateTime<Utc>) {
        self.resume_on = None;
        self.updated_at = now;
    }

    /// Request cancellation; honored by the driver at the next boundary.
    pub fn request_cancel(&mut self, now: DateTime<Utc>) {
        self.cancel_requested = true;
        self.updated_at = now;
    }

    // ------------------------------------------------------------------
    // Status transitions
    // ------------------------------------------------------------------

    /// Switch to COMPENSATING, recording the cause.
    pub fn begin_compensating(
        &mut self,
        failure_kind: &str,
        failure_reason: String,
        now: DateTime<Utc>,
    ) -> Result<(), SagaError> {
        if self.status.is_terminal() {
            return Err(SagaError::AlreadyTerminal {
                status: self.status,
            });
        }
        self.status = SagaStatus::Compensating;
        self.failure_kind = Some(failure_kind.to_string());
        self.failure_reason = Some(failure_reason);
        self.current_step = None;
        self.resume_on = None;
        self.updated_at = now;
        Ok(())
    }

    /// Pop the next compensator (LIFO).
    pub fn pop_compensation(&mut self) -> Option<CompensationAction> {
        self.compensation_stack.pop()
    }

    /// Push a compensator back after a failed attempt so the unwind can be
    /// re-driven later.
    pub fn push_compensation(&mut self, action: CompensationAction) {
        self.compensation_stack.push(action);
    }

    /// Finish compensation with the given terminal outcome.
    pub fn finish_compensation(
        &mut self,
        outcome: SagaStatus,
        now: DateTime<Utc>,
    ) -> Result<(), SagaError> {
        if self.status != SagaStatus::Compensating {
            return Err(SagaError::NotCompensating);
        }
        debug_assert!(self.compensation_stack.is_empty());
        self.status = outcome;
        self.updated_at = now;
        Ok(())
    }

    /// Complete the saga. Completed effects are final, so the stack drains.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), SagaError> {
        if self.status.is_terminal() {
            return Err(SagaError::AlreadyTerminal {
                status: self.status,
            });
        }
        self.status = SagaStatus::Completed;
        self.compensation_stack.clear();
        self.current_step = None;
        self.resume_on = None;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap()
    }

    fn saga() -> SagaInstance {
        SagaInstance::new(
            "pay_1".to_string(),
            "T1".to_string(),
            "B1".to_string(),
            t0() + Duration::minutes(10),
            t0(),
        )
    }

    #[test]
    fn steps_advance_in_declared_order() {
        let mut s = saga();
        assert_eq!(s.current_step(), Some(SagaStep::FraudEvaluate));

        s.record_step_success(SagaStep::FraudEvaluate, None, t0());
        assert_eq!(s.current_step(), Some(SagaStep::ReserveLimit));
        assert!(s.compensation_stack().is_empty());

        s.record_step_success(
            SagaStep::ReserveLimit,
            Some(CompensationAction::ReleaseReservation {
                reservation_id: "res_1".to_string(),
            }),
            t0(),
        );
        assert_eq!(s.current_step(), Some(SagaStep::HoldFunds));
        assert_eq!(s.compensation_stack().len(), 1);
    }

    #[test]
    fn compensation_stack_pops_lifo() {
        let mut s = saga();
        s.record_step_success(
            SagaStep::ReserveLimit,
            Some(CompensationAction::ReleaseReservation {
                reservation_id: "res_1".to_string(),
            }),
            t0(),
        );
        s.record_step_success(
            SagaStep::HoldFunds,
            Some(CompensationAction::ReleaseHold {
                account_ref: "ACC1".to_string(),
                hold_ref: "h1".to_string(),
            }),
            t0(),
        );

        s.begin_compensating("transient", "backend down".to_string(), t0())
            .unwrap();

        // Last completed step unwinds first
        assert!(matches!(
            s.pop_compensation(),
            Some(CompensationAction::ReleaseHold { .. })
        ));
        assert!(matches!(
            s.pop_compensation(),
            Some(CompensationAction::ReleaseReservation { .. })
        ));
        assert!(s.pop_compensation().is_none());

        s.finish_compensation(SagaStatus::Failed, t0()).unwrap();
        assert!(s.is_terminal());
        assert!(s.compensation_stack().is_empty());
    }

    #[test]
    fn lease_excludes_second_owner_until_expiry() {
        let mut s = saga();
        s.acquire_lease("worker-a", t0(), Duration::seconds(30)).unwrap();

        let err = s
            .acquire_lease("worker-b", t0() + Duration::seconds(10), Duration::seconds(30))
            .unwrap_err();
        assert!(matches!(err, SagaError::LeaseHeld { .. }));

        // Expired lease is taken over
        s.acquire_lease("worker-b", t0() + Duration::seconds(40), Duration::seconds(30))
            .unwrap();
        assert_eq!(s.lease().unwrap().owner, "worker-b");
    }

    #[test]
    fn completed_saga_has_empty_stack() {
        let mut s = saga();
        s.record_step_success(
            SagaStep::ReserveLimit,
            Some(CompensationAction::ReleaseReservation {
                reservation_id: "res_1".to_string(),
            }),
            t0(),
        );
        s.complete(t0()).unwrap();
        assert!(s.compensation_stack().is_empty());
        assert_eq!(s.status(), SagaStatus::Completed);
    }
}
