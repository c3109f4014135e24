//! Orchestrator engine
//!
//! The driving loop for payment sagas, integrating all components:
//! - Fraud evaluation (toggle + score with fallback)
//! - Limit reservation (reserve / consume / release)
//! - Funds hold via the account adapter (offline-queue deferral on outage)
//! - Routing (rule evaluation to a clearing channel)
//! - Clearing submission (synchronous and asynchronous channels)
//! - Ledger posting (capture + credit) and reservation consumption
//! - LIFO compensation on failure, with queued re-drive of stuck
//!   compensators
//!
//! # Architecture
//!
//! One `drive` call advances one saga as far as it can go: to completion,
//! to a durable suspension (awaiting a clearing outcome, a queued-message
//! replay, or a timer), or to a terminal failure state after compensation.
//! A single-writer lease keyed by saga id keeps concurrent drivers out;
//! every state transition commits together with its event append under the
//! state lock, and external calls never run while that lock is held.
//!
//! # Critical Invariants
//!
//! 1. Per-saga events are strictly ordered by `seq`
//! 2. Compensation pops the stack LIFO; a terminal saga has an empty stack
//! 3. Every step effect is idempotent against `(payment_id, op)` so a
//!    redrive after a crash is safe
//! 4. Tenant context is checked on every read and write

use crate::accounts::{AccountAdapter, OpOutcome};
use crate::contracts::{
    ClearingChannel, ClearingOutcome, FraudScoreProvider, NotificationSink, PaymentInitiationSource,
    PaymentRequest,
};
use crate::core::{Clock, Deadline, IdGenerator, TenantContext};
use crate::error::{CoreError, FailureClass};
use crate::events::{EventStore, OutboxPolicy, OutboxPublisher, PublishReport};
use crate::fraud::{FraudRuleConfig, FraudService};
use crate::limits::{LimitConfig, LimitEngine};
use crate::metrics::{metrics, Metrics};
use crate::models::event::EventBody;
use crate::models::hold::FundsHold;
use crate::models::payment::{Money, Payment, PaymentStatus};
use crate::models::saga::{
    CompensationAction, ResumeOn, SagaInstance, SagaStatus, SagaStep,
};
use crate::resilience::{
    OfflineQueue, QueuePolicy, ResilienceKernel, Sleeper,
};
use crate::routing::{RoutingConfig, RoutingContext, RoutingDecision, RoutingEngine};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Complete orchestration core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Default customer limits
    pub default_limits: LimitConfig,

    /// Routing engine tuning
    pub routing: RoutingConfig,

    /// Outbox publication tuning
    pub outbox: OutboxPolicy,

    /// Offline queue tuning
    pub queue: QueuePolicy,

    /// Rule-based fraud fallback tuning
    pub fraud_rules: FraudRuleConfig,

    /// Wall deadline for a whole saga
    pub saga_deadline_secs: i64,

    /// Single-writer lease TTL
    pub lease_ttl_secs: i64,

    /// Saga-level drive attempts per step before the saga is poisoned
    /// into compensation
    pub step_retry_budget: u32,

    /// How long terminal sagas are retained before the sweep deletes them
    pub retention_grace_secs: i64,

    /// Seed for deterministic retry jitter
    pub jitter_seed: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_limits: LimitConfig::default(),
            routing: RoutingConfig::default(),
            outbox: OutboxPolicy::default(),
            queue: QueuePolicy::default(),
            fraud_rules: FraudRuleConfig::default(),
            saga_deadline_secs: 3_600,
            lease_ttl_secs: 30,
            step_retry_budget: 3,
            retention_grace_secs: 7 * 24 * 3_600,
            jitter_seed: 0x5EED,
        }
    }
}

impl CoreConfig {
    fn validate(&self) -> Result<(), CoreError> {
        if self.saga_deadline_secs <= 0 {
            return Err(CoreError::InvalidConfig(
                "saga_deadline_secs must be > 0".to_string(),
            ));
        }
        if self.lease_ttl_secs <= 0 {
            return Err(CoreError::InvalidConfig(
                "lease_ttl_secs must be > 0".to_string(),
            ));
        }
        if self.step_retry_budget == 0 {
            return Err(CoreError::InvalidConfig(
                "step_retry_budget must be > 0".to_string(),
            ));
        }
        if self.retention_grace_secs < 0 {
            return Err(CoreError::InvalidConfig(
                "retention_grace_secs must be >= 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn saga_deadline(&self) -> Duration {
        Duration::seconds(self.saga_deadline_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::seconds(self.lease_ttl_secs)
    }
}

// ============================================================================
// Inbound / outbound DTOs
// ============================================================================

/// Acknowledgement returned by `submit_payment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitAck {
    pub payment_id: String,
    pub status: PaymentStatus,

    /// True when the `(tenant, external_reference)` pair was seen before
    /// and the original payment was returned
    pub duplicate: bool,
}

/// Answer to `query_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub payment_id: String,
    pub status: PaymentStatus,
    pub saga_status: SagaStatus,
    pub last_event_seq: u64,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    /// The saga will unwind
    Accepted,

    /// Past the point of irrevocable clearing submission; a reversal must
    /// run as a fresh saga
    Rejected,
}

/// Result of one `drive` call.
#[derive(Debug, Clone, PartialEq)]
pub struct DriveResult {
    pub payment_id: String,
    pub saga_status: SagaStatus,
    pub payment_status: PaymentStatus,
    pub steps_executed: usize,

    /// True when the saga parked on a durable suspension marker
    pub suspended: bool,
}

/// What one step execution did.
enum StepFlow {
    Advanced,
    Suspended,
}

/// What one compensation round did.
enum CompensationFlow {
    Progress,
    Suspended,
    Blocked,
    Done,
}

// ============================================================================
// Orchestration state
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct OrchestrationState {
    pub(crate) payments: BTreeMap<String, Payment>,
    pub(crate) sagas: BTreeMap<String, SagaInstance>,
    pub(crate) holds: BTreeMap<String, FundsHold>,

    /// (tenant_id, external_reference) -> payment_id
    pub(crate) external_refs: BTreeMap<(String, String), String>,

    /// Routing decision per payment, kept for the clearing step
    pub(crate) decisions: BTreeMap<String, RoutingDecision>,

    /// clearing_ref -> payment_id
    pub(crate) clearing_refs: BTreeMap<String, String>,

    pub(crate) events: EventStore,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// The payment orchestration engine.
///
/// Owns the orchestration state and wires every component together at
/// construction time. Collaborators (backends, clearing channels, routing
/// rules, fraud toggles) are registered through the exposed component
/// handles before payments are submitted.
pub struct PaymentOrchestrator {
    config: CoreConfig,
    clock: Arc<dyn Clock>,
    ids: IdGenerator,
    limits: Arc<LimitEngine>,
    kernel: Arc<ResilienceKernel>,
    accounts: Arc<AccountAdapter>,
    routing: Arc<RoutingEngine>,
    fraud: Arc<FraudService>,
    queue: Arc<OfflineQueue>,
    sink: Arc<dyn NotificationSink>,
    publisher: OutboxPublisher,
    clearing: Mutex<BTreeMap<String, Arc<dyn ClearingChannel>>>,
    state: Mutex<OrchestrationState>,
    worker_id: String,
}

impl PaymentOrchestrator {
    /// Build the engine and all owned components.
    pub fn new(
        config: CoreConfig,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        fraud_provider: Arc<dyn FraudScoreProvider>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let ids = IdGenerator::new(clock.clone());
        let kernel = Arc::new(ResilienceKernel::new(
            clock.clone(),
            sleeper,
            config.jitter_seed,
        ));
        let limits = Arc::new(LimitEngine::new(
            clock.clone(),
            config.default_limits.clone(),
        ));
        let queue = Arc::new(OfflineQueue::new(clock.clone(), config.queue.clone()));
        let accounts = Arc::new(AccountAdapter::new(
            clock.clone(),
            kernel.clone(),
            queue.clone(),
        ));
        let routing = Arc::new(RoutingEngine::new(clock.clone(), config.routing.clone()));
        let fraud = Arc::new(FraudService::new(
            clock.clone(),
            kernel.clone(),
            fraud_provider,
            config.fraud_rules.clone(),
        ));
        let publisher = OutboxPublisher::new(config.outbox.clone());

        Ok(Self {
            config,
            clock,
            ids,
            limits,
            kernel,
            accounts,
            routing,
            fraud,
            queue,
            sink,
            publisher,
            clearing: Mutex::new(BTreeMap::new()),
            state: Mutex::new(OrchestrationState::default()),
            worker_id: format!("worker-{}", std::process::id()),
        })
    }

    // ------------------------------------------------------------------
    // Component handles (wiring surface)
    // ------------------------------------------------------------------

    pub fn limits(&self) -> &LimitEngine {
        &self.limits
    }

    pub fn accounts(&self) -> &AccountAdapter {
        &self.accounts
    }

    pub fn routing(&self) -> &RoutingEngine {
        &self.routing
    }

    pub fn fraud(&self) -> &FraudService {
        &self.fraud
    }

    pub fn kernel(&self) -> &ResilienceKernel {
        &self.kernel
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Register a clearing channel under its routing name.
    pub fn register_clearing_channel(&self, channel: Arc<dyn ClearingChannel>) {
        self.clearing
            .lock()
            .unwrap()
            .insert(channel.name().to_string(), channel);
    }

    // ------------------------------------------------------------------
    // Inbound operations
    // ------------------------------------------------------------------

    /// Accept a payment initiation request and create its saga.
    ///
    /// Idempotent by `(tenant_id, external_reference)`: a repeat submission
    /// returns the original payment id and mutates nothing.
    pub fn submit_payment(&self, request: PaymentRequest) -> Result<SubmitAck, CoreError> {
        Self::validate_request(&request)?;
        let ctx = TenantContext::new(&request.tenant_id, &request.business_unit_id);
        let now = self.clock.now();

        let mut state = self.state.lock().unwrap();

        if let Some(external_reference) = &request.external_reference {
            let key = (request.tenant_id.clone(), external_reference.clone());
            if let Some(existing_id) = state.external_refs.get(&key) {
                let payment = state
                    .payments
                    .get(existing_id)
                    .ok_or_else(|| CoreError::Internal("dangling external ref".to_string()))?;
                return Ok(SubmitAck {
                    payment_id: payment.payment_id().to_string(),
                    status: payment.status(),
                    duplicate: true,
                });
            }
        }

        let payment_id = request
            .payment_id
            .clone()
            .unwrap_or_else(|| self.ids.new_payment_id());
        if state.payments.contains_key(&payment_id) {
            return Err(CoreError::Validation(format!(
                "payment {payment_id} already exists"
            )));
        }

        let payment = Payment::new(
            payment_id.clone(),
            request.tenant_id.clone(),
            request.business_unit_id.clone(),
            request.customer_id.clone(),
            request.debit_account_ref.clone(),
            request.credit_account_ref.clone(),
            Money::new(request.amount_minor, request.currency.clone()),
            request.payment_type,
            request.local_instrument.clone(),
            request.external_reference.clone(),
            now,
        );
        let saga = SagaInstance::new(
            payment_id.clone(),
            request.tenant_id.clone(),
            request.business_unit_id.clone(),
            now + self.config.saga_deadline(),
            now,
        );

        if let Some(external_reference) = &request.external_reference {
            state.external_refs.insert(
                (request.tenant_id.clone(), external_reference.clone()),
                payment_id.clone(),
            );
        }
        state.payments.insert(payment_id.clone(), payment);
        state.sagas.insert(payment_id.clone(), saga);

        self.append(
            &mut state,
            &ctx,
            &payment_id,
            EventBody::PaymentInitiated {
                payment_type: request.payment_type.as_str().to_string(),
                amount: Money::new(request.amount_minor, request.currency.clone()),
            },
            None,
        );

        info!(payment_id = %payment_id, tenant = %request.tenant_id, "payment initiated");
        Ok(SubmitAck {
            payment_id,
            status: PaymentStatus::Initiated,
            duplicate: false,
        })
    }

    /// Pull every pending request from an initiation source.
    pub fn ingest(&self, source: &mut dyn PaymentInitiationSource) -> Vec<Result<SubmitAck, CoreError>> {
        let mut acks = Vec::new();
        while let Some(request) = source.poll() {
            acks.push(self.submit_payment(request));
        }
        acks
    }

    fn validate_request(request: &PaymentRequest) -> Result<(), CoreError> {
        if request.tenant_id.is_empty() || request.business_unit_id.is_empty() {
            return Err(CoreError::Validation(
                "tenant_id and business_unit_id are required".to_string(),
            ));
        }
        if request.customer_id.is_empty() {
            return Err(CoreError::Validation("customer_id is required".to_string()));
        }
        if request.debit_account_ref.is_empty() || request.credit_account_ref.is_empty() {
            return Err(CoreError::Validation(
                "debit and credit account references are required".to_string(),
            ));
        }
        if request.debit_account_ref == request.credit_account_ref {
            return Err(CoreError::Validation(
                "debit and credit accounts must differ".to_string(),
            ));
        }
        if request.amount_minor <= 0 {
            return Err(CoreError::Validation(
                "amount must be positive".to_string(),
            ));
        }
        if request.currency.len() != 3 {
            return Err(CoreError::Validation(
                "currency must be a 3-letter code".to_string(),
            ));
        }
        Ok(())
    }

    /// Current status of a payment.
    pub fn query_status(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
    ) -> Result<StatusView, CoreError> {
        let state = self.state.lock().unwrap();
        let payment = state
            .payments
            .get(payment_id)
            .ok_or_else(|| CoreError::NotFound(format!("payment {payment_id}")))?;
        ctx.guard_row(payment.tenant_id(), payment.business_unit_id())?;
        let saga = state
            .sagas
            .get(payment_id)
            .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
        Ok(StatusView {
            payment_id: payment_id.to_string(),
            status: payment.status(),
            saga_status: saga.status(),
            last_event_seq: saga.last_event_seq(),
        })
    }

    /// Request cancellation of a running payment.
    ///
    /// Accepted while the saga has not submitted to clearing; past that
    /// point the cancel is rejected and a reversal must run as a fresh
    /// saga.
    pub fn cancel_payment(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
    ) -> Result<CancelOutcome, CoreError> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock().unwrap();
            let saga = state
                .sagas
                .get_mut(payment_id)
                .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
            ctx.guard_row(saga.tenant_id(), saga.business_unit_id())?;

            if saga.is_terminal() {
                return Ok(CancelOutcome::Rejected);
            }
            if saga
                .completed_steps()
                .contains(&SagaStep::SubmitClearing)
                || saga.status() == SagaStatus::Compensating
            {
                return Ok(CancelOutcome::Rejected);
            }
            saga.request_cancel(now);
        }
        self.drive(ctx, payment_id)?;
        Ok(CancelOutcome::Accepted)
    }

    // ------------------------------------------------------------------
    // Driving loop
    // ------------------------------------------------------------------

    /// Advance one saga as far as it can go under an exclusive lease.
    pub fn drive(&self, ctx: &TenantContext, payment_id: &str) -> Result<DriveResult, CoreError> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock().unwrap();
            let saga = state
                .sagas
                .get_mut(payment_id)
                .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
            ctx.guard_row(saga.tenant_id(), saga.business_unit_id())?;
            saga.acquire_lease(&self.worker_id, now, self.config.lease_ttl())
                .map_err(|e| CoreError::Transient {
                    cause: e.to_string(),
                })?;
        }

        // The lease is released on every exit path, including errors.
        let outcome = self.drive_loop(ctx, payment_id);

        let mut state = self.state.lock().unwrap();
        let saga = state
            .sagas
            .get_mut(payment_id)
            .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
        saga.release_lease(&self.worker_id);
        let saga_status = saga.status();
        let (steps_executed, suspended) = outcome?;
        let payment_status = state
            .payments
            .get(payment_id)
            .map(|p| p.status())
            .ok_or_else(|| CoreError::NotFound(format!("payment {payment_id}")))?;

        Ok(DriveResult {
            payment_id: payment_id.to_string(),
            saga_status,
            payment_status,
            steps_executed,
            suspended,
        })
    }

    fn drive_loop(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
    ) -> Result<(usize, bool), CoreError> {
        let mut steps_executed = 0usize;
        let mut suspended = false;

        loop {
            // Lease renewal keeps long drives exclusive.
            let now = self.clock.now();
            let (saga_status, current_step, is_suspended, deadline_at, cancel_requested) = {
                let mut state = self.state.lock().unwrap();
                let saga = state
                    .sagas
                    .get_mut(payment_id)
                    .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
                let _ = saga.acquire_lease(&self.worker_id, now, self.config.lease_ttl());
                (
                    saga.status(),
                    saga.current_step(),
                    saga.resume_on().is_some(),
                    saga.deadline_at(),
                    saga.cancel_requested(),
                )
            };

            if saga_status.is_terminal() {
                break;
            }

            // Saga deadline dominates everything but terminal states.
            if now >= deadline_at && saga_status != SagaStatus::Compensating {
                self.enter_compensation(ctx, payment_id, "deadline_exceeded", "saga deadline passed")?;
                continue;
            }

            match saga_status {
                SagaStatus::Running => {
                    if is_suspended {
                        suspended = true;
                        break;
                    }
                    if cancel_requested {
                        self.enter_compensation(ctx, payment_id, "cancelled", "cancel requested")?;
                        continue;
                    }
                    let Some(step) = current_step else {
                        break;
                    };
                    match self.execute_step(ctx, payment_id, step) {
                        Ok(StepFlow::Advanced) => {
                            steps_executed += 1;
                        }
                        Ok(StepFlow::Suspended) => {
                            suspended = true;
                            break;
                        }
                        Err(err) => {
                            if !self.handle_step_failure(ctx, payment_id, step, &err)? {
                                // Transient: stop driving, a later drive
                                // retries the same step.
                                break;
                            }
                        }
                    }
                }
                SagaStatus::Compensating => {
                    if is_suspended {
                        suspended = true;
                        break;
                    }
                    match self.run_compensation_round(ctx, payment_id)? {
                        CompensationFlow::Progress => {}
                        CompensationFlow::Suspended => {
                            suspended = true;
                            break;
                        }
                        CompensationFlow::Blocked => break,
                        CompensationFlow::Done => {}
                    }
                }
                _ => break,
            }
        }

        Ok((steps_executed, suspended))
    }

    // ------------------------------------------------------------------
    // Step execution
    // ------------------------------------------------------------------

    fn execute_step(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        step: SagaStep,
    ) -> Result<StepFlow, CoreError> {
        let now = self.clock.now();
        let (payment, deadline_at) = {
            let mut state = self.state.lock().unwrap();
            let saga = state
                .sagas
                .get_mut(payment_id)
                .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
            saga.record_attempt(step, now);
            let deadline_at = saga.deadline_at();
            let payment = state
                .payments
                .get(payment_id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("payment {payment_id}")))?;
            (payment, deadline_at)
        };
        let step_deadline = Deadline::at(deadline_at);
        debug!(payment_id, step = %step, "executing saga step");

        match step {
            SagaStep::FraudEvaluate => self.step_fraud(ctx, payment_id, &payment, step_deadline),
            SagaStep::ReserveLimit => self.step_reserve(ctx, payment_id, &payment),
            SagaStep::HoldFunds => self.step_hold(ctx, payment_id, &payment, step_deadline),
            SagaStep::SelectRoute => self.step_route(ctx, payment_id, &payment),
            SagaStep::SubmitClearing => self.step_clearing(ctx, payment_id, &payment, step_deadline),
            SagaStep::PostLedger => self.step_post(ctx, payment_id, &payment, step_deadline),
            SagaStep::ConsumeReservation => self.step_consume(ctx, payment_id),
        }
    }

    fn step_fraud(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        payment: &Payment,
        deadline: Deadline,
    ) -> Result<StepFlow, CoreError> {
        self.set_payment_status(ctx, payment_id, PaymentStatus::FraudEval)?;

        let decision = self.fraud.evaluate(ctx, payment, deadline)?;
        if !decision.resolution.allows_payment() {
            let mut state = self.state.lock().unwrap();
            self.append(
                &mut state,
                ctx,
                payment_id,
                EventBody::FraudRejected {
                    resolution: decision.resolution.as_str().to_string(),
                    score: decision.score,
                },
                None,
            );
            return Err(CoreError::Authorization(format!(
                "fraud evaluation resolved {}",
                decision.resolution.as_str()
            )));
        }

        let mut state = self.state.lock().unwrap();
        self.append(
            &mut state,
            ctx,
            payment_id,
            EventBody::FraudApproved {
                resolution: decision.resolution.as_str().to_string(),
                score: decision.score,
            },
            None,
        );
        self.complete_step(&mut state, ctx, payment_id, SagaStep::FraudEvaluate, None)?;
        self.transition(&mut state, ctx, payment_id, PaymentStatus::LimitReserving)?;
        Ok(StepFlow::Advanced)
    }

    fn step_reserve(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        payment: &Payment,
    ) -> Result<StepFlow, CoreError> {
        // Idempotent redrive: reuse a live reservation if one exists.
        let reservation_id = match self.limits.live_reservation_for_payment(ctx, payment_id) {
            Some(reservation) => reservation.reservation_id().to_string(),
            None => self.limits.reserve(
                ctx,
                self.ids.new_entity_id(),
                payment_id,
                payment.customer_id(),
                payment.amount(),
                payment.payment_type(),
            )?,
        };

        let mut state = self.state.lock().unwrap();
        self.append(
            &mut state,
            ctx,
            payment_id,
            EventBody::LimitReserved {
                reservation_id: reservation_id.clone(),
                amount: payment.amount().clone(),
            },
            None,
        );
        self.complete_step(
            &mut state,
            ctx,
            payment_id,
            SagaStep::ReserveLimit,
            Some(CompensationAction::ReleaseReservation { reservation_id }),
        )?;
        self.transition(&mut state, ctx, payment_id, PaymentStatus::LimitReserved)?;
        Ok(StepFlow::Advanced)
    }

    fn step_hold(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        payment: &Payment,
        deadline: Deadline,
    ) -> Result<StepFlow, CoreError> {
        self.set_payment_status(ctx, payment_id, PaymentStatus::FundsHolding)?;

        let outcome = self.accounts.place_hold_deferrable(
            ctx,
            payment_id,
            payment.debit_account_ref(),
            payment.amount(),
            deadline,
        )?;

        match outcome {
            OpOutcome::Done(response) => {
                let hold_ref = response.hold_ref.ok_or_else(|| {
                    CoreError::Internal("backend acknowledged hold without a hold_ref".to_string())
                })?;
                let mut state = self.state.lock().unwrap();
                state.holds.insert(
                    hold_ref.clone(),
                    FundsHold::new(
                        hold_ref.clone(),
                        ctx.tenant_id().to_string(),
                        ctx.business_unit_id().to_string(),
                        payment.debit_account_ref().to_string(),
                        payment_id.to_string(),
                        payment.amount().clone(),
                        None,
                    ),
                );
                self.append(
                    &mut state,
                    ctx,
                    payment_id,
                    EventBody::FundsHeld {
                        hold_ref: hold_ref.clone(),
                        account_ref: payment.debit_account_ref().to_string(),
                        amount: payment.amount().clone(),
                    },
                    None,
                );
                self.complete_step(
                    &mut state,
                    ctx,
                    payment_id,
                    SagaStep::HoldFunds,
                    Some(CompensationAction::ReleaseHold {
                        account_ref: payment.debit_account_ref().to_string(),
                        hold_ref,
                    }),
                )?;
                self.transition(&mut state, ctx, payment_id, PaymentStatus::FundsHeld)?;
                Ok(StepFlow::Advanced)
            }
            OpOutcome::Deferred { message_id } => {
                let now = self.clock.now();
                let mut state = self.state.lock().unwrap();
                let saga = state
                    .sagas
                    .get_mut(payment_id)
                    .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
                saga.suspend(
                    ResumeOn::QueuedMessage {
                        message_id: message_id.clone(),
                    },
                    now,
                );
                self.append(
                    &mut state,
                    ctx,
                    payment_id,
                    EventBody::SagaSuspended {
                        waiting_on: format!("queued_message:{message_id}"),
                    },
                    None,
                );
                Ok(StepFlow::Suspended)
            }
        }
    }

    fn step_route(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        payment: &Payment,
    ) -> Result<StepFlow, CoreError> {
        self.set_payment_status(ctx, payment_id, PaymentStatus::Routing)?;

        let routing_ctx = RoutingContext::from_payment(payment, ctx);
        let decision = self.routing.decide(ctx, &routing_ctx)?;

        let mut state = self.state.lock().unwrap();
        state
            .decisions
            .insert(payment_id.to_string(), decision.clone());
        self.append(
            &mut state,
            ctx,
            payment_id,
            EventBody::RoutingDecided {
                clearing_system: decision.clearing_system.clone(),
                routing_priority: decision.routing_priority,
                is_fallback: decision.is_fallback,
            },
            None,
        );
        self.complete_step(&mut state, ctx, payment_id, SagaStep::SelectRoute, None)?;
        self.transition(&mut state, ctx, payment_id, PaymentStatus::Routed)?;
        Ok(StepFlow::Advanced)
    }

    fn step_clearing(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        payment: &Payment,
        deadline: Deadline,
    ) -> Result<StepFlow, CoreError> {
        let decision = {
            let state = self.state.lock().unwrap();
            state
                .decisions
                .get(payment_id)
                .cloned()
                .ok_or_else(|| CoreError::Internal("routing decision missing".to_string()))?
        };
        let channel = self
            .clearing
            .lock()
            .unwrap()
            .get(&decision.clearing_system)
            .cloned()
            .ok_or_else(|| {
                CoreError::InvalidConfig(format!(
                    "no clearing channel registered for {}",
                    decision.clearing_system
                ))
            })?;

        self.set_payment_status(ctx, payment_id, PaymentStatus::ClearingSubmitted)?;

        let channel_service = format!("clearing-{}", channel.name());
        let payment_clone = payment.clone();
        let decision_clone = decision.clone();
        let channel_for_call = channel.clone();
        let clearing_ref = self.kernel.call(
            &channel_service,
            ctx,
            deadline,
            &mut |attempt_deadline| {
                channel_for_call.submit(ctx, &payment_clone, &decision_clone, attempt_deadline)
            },
        )?;

        {
            let mut state = self.state.lock().unwrap();
            state
                .clearing_refs
                .insert(clearing_ref.clone(), payment_id.to_string());
            self.append(
                &mut state,
                ctx,
                payment_id,
                EventBody::ClearingSubmitted {
                    clearing_ref: clearing_ref.clone(),
                },
                None,
            );
            self.complete_step(
                &mut state,
                ctx,
                payment_id,
                SagaStep::SubmitClearing,
                Some(CompensationAction::CancelClearing {
                    clearing_ref: clearing_ref.clone(),
                }),
            )?;
            self.transition(&mut state, ctx, payment_id, PaymentStatus::AwaitingClearing)?;
        }

        // Synchronous channels resolve the outcome inline; asynchronous
        // channels park the saga until the outcome processor fires.
        if channel.is_synchronous() {
            let outcome = channel.await_outcome(ctx, &clearing_ref)?;
            self.apply_clearing_outcome(ctx, payment_id, &clearing_ref, outcome, None)?;
            match self.saga_status(payment_id)? {
                SagaStatus::Running => Ok(StepFlow::Advanced),
                _ => Err(CoreError::ClearingRejected {
                    code: "synchronous clearing rejection".to_string(),
                })
            }
        } else {
            let now = self.clock.now();
            let mut state = self.state.lock().unwrap();
            let saga = state
                .sagas
                .get_mut(payment_id)
                .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
            saga.suspend(
                ResumeOn::ClearingOutcome {
                    clearing_ref: clearing_ref.clone(),
                },
                now,
            );
            self.append(
                &mut state,
                ctx,
                payment_id,
                EventBody::SagaSuspended {
                    waiting_on: format!("clearing_outcome:{clearing_ref}"),
                },
                None,
            );
            Ok(StepFlow::Suspended)
        }
    }

    fn step_post(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        payment: &Payment,
        deadline: Deadline,
    ) -> Result<StepFlow, CoreError> {
        self.set_payment_status(ctx, payment_id, PaymentStatus::Posting)?;

        let hold_ref = {
            let state = self.state.lock().unwrap();
            state
                .holds
                .values()
                .find(|h| h.payment_id() == payment_id && h.is_active())
                .map(|h| h.hold_ref().to_string())
                .ok_or_else(|| CoreError::Internal("active hold missing for posting".to_string()))?
        };

        // Debit side: capture the placed hold.
        self.accounts.capture_hold(
            ctx,
            payment_id,
            payment.debit_account_ref(),
            &hold_ref,
            deadline,
        )?;
        {
            let mut state = self.state.lock().unwrap();
            if let Some(hold) = state.holds.get_mut(&hold_ref) {
                hold.mark_captured();
            }
            self.append(
                &mut state,
                ctx,
                payment_id,
                EventBody::FundsCaptured {
                    hold_ref: hold_ref.clone(),
                },
                None,
            );
        }

        // Credit side.
        self.accounts.credit(
            ctx,
            payment_id,
            payment.credit_account_ref(),
            payment.amount(),
            deadline,
        )?;

        let mut state = self.state.lock().unwrap();
        self.append(
            &mut state,
            ctx,
            payment_id,
            EventBody::LedgerPosted {
                debit_account_ref: payment.debit_account_ref().to_string(),
                credit_account_ref: payment.credit_account_ref().to_string(),
                amount: payment.amount().clone(),
            },
            None,
        );
        self.complete_step(
            &mut state,
            ctx,
            payment_id,
            SagaStep::PostLedger,
            Some(CompensationAction::ReverseLedger {
                debit_account_ref: payment.debit_account_ref().to_string(),
                credit_account_ref: payment.credit_account_ref().to_string(),
                amount: payment.amount().clone(),
            }),
        )?;
        Ok(StepFlow::Advanced)
    }

    fn step_consume(&self, ctx: &TenantContext, payment_id: &str) -> Result<StepFlow, CoreError> {
        let reservation_id = {
            let state = self.state.lock().unwrap();
            // The latest reservation is the live one (an earlier one may
            // have expired and been re-reserved).
            state
                .events
                .events_of_type(ctx, payment_id, "LimitReserved")?
                .last()
                .and_then(|e| match &e.body {
                    EventBody::LimitReserved { reservation_id, .. } => {
                        Some(reservation_id.clone())
                    }
                    _ => None,
                })
                .ok_or_else(|| CoreError::Internal("reservation id missing".to_string()))?
        };

        self.limits.consume(ctx, &reservation_id)?;

        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        self.append(
            &mut state,
            ctx,
            payment_id,
            EventBody::LimitConsumed {
                reservation_id: reservation_id.clone(),
            },
            None,
        );
        self.complete_step(
            &mut state,
            ctx,
            payment_id,
            SagaStep::ConsumeReservation,
            None,
        )?;

        let saga = state
            .sagas
            .get_mut(payment_id)
            .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
        saga.complete(now)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        self.transition(&mut state, ctx, payment_id, PaymentStatus::Completed)?;
        self.append(&mut state, ctx, payment_id, EventBody::PaymentCompleted, None);
        Metrics::incr(&metrics().sagas_completed);
        info!(payment_id, "payment completed");
        Ok(StepFlow::Advanced)
    }

    // ------------------------------------------------------------------
    // Failure handling and compensation
    // ------------------------------------------------------------------

    /// React to a failed step. Returns true when the driving loop should
    /// continue (the saga switched to compensating), false when the drive
    /// must stop and retry later.
    fn handle_step_failure(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        step: SagaStep,
        err: &CoreError,
    ) -> Result<bool, CoreError> {
        match err.class() {
            FailureClass::Reject | FailureClass::Fail => {
                warn!(payment_id, step = %step, error = %err, "step failed; compensating");
                self.enter_compensation(ctx, payment_id, err.kind(), &err.to_string())?;
                Ok(true)
            }
            FailureClass::TimedOut => {
                self.enter_compensation(ctx, payment_id, "deadline_exceeded", &err.to_string())?;
                Ok(true)
            }
            FailureClass::Retryable | FailureClass::RetryableBreaker => {
                let attempts = {
                    let state = self.state.lock().unwrap();
                    state
                        .sagas
                        .get(payment_id)
                        .map(|s| s.attempts(step))
                        .unwrap_or(0)
                };
                if attempts >= self.config.step_retry_budget {
                    warn!(
                        payment_id,
                        step = %step,
                        attempts,
                        "step exceeded its retry budget; compensating"
                    );
                    self.enter_compensation(
                        ctx,
                        payment_id,
                        "max_retries_exceeded",
                        &err.to_string(),
                    )?;
                    Ok(true)
                } else {
                    debug!(payment_id, step = %step, error = %err, "transient step failure");
                    Ok(false)
                }
            }
        }
    }

    fn enter_compensation(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        kind: &str,
        reason: &str,
    ) -> Result<(), CoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        let saga = state
            .sagas
            .get_mut(payment_id)
            .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
        if saga.status() == SagaStatus::Compensating {
            return Ok(());
        }
        saga.begin_compensating(kind, reason.to_string(), now)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        self.transition(&mut state, ctx, payment_id, PaymentStatus::Compensating)?;
        self.append(
            &mut state,
            ctx,
            payment_id,
            EventBody::CompensationStarted {
                cause: kind.to_string(),
            },
            None,
        );
        Metrics::incr(&metrics().compensations_started);
        Ok(())
    }

    /// Pop and execute one compensator. A failed compensator is pushed
    /// back; an unreachable backend parks the saga on the offline queue.
    fn run_compensation_round(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
    ) -> Result<CompensationFlow, CoreError> {
        let action = {
            let mut state = self.state.lock().unwrap();
            let saga = state
                .sagas
                .get_mut(payment_id)
                .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
            saga.pop_compensation()
        };

        let Some(action) = action else {
            self.finish_compensation(ctx, payment_id)?;
            return Ok(CompensationFlow::Done);
        };

        match self.execute_compensator(ctx, payment_id, &action) {
            Ok(()) => Ok(CompensationFlow::Progress),
            Err(err) if err.is_retryable() => {
                // Push back for the next round; park on the queue when the
                // adapter deferred the call.
                let deferred = self.defer_compensator(ctx, payment_id, &action, &err)?;
                let now = self.clock.now();
                let mut state = self.state.lock().unwrap();
                let saga = state
                    .sagas
                    .get_mut(payment_id)
                    .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
                saga.push_compensation(action);
                if let Some(message_id) = deferred {
                    saga.suspend(ResumeOn::QueuedMessage { message_id }, now);
                    Ok(CompensationFlow::Suspended)
                } else {
                    Ok(CompensationFlow::Blocked)
                }
            }
            Err(err) => {
                // A compensator must eventually succeed; a non-retryable
                // answer here is an operational defect.
                warn!(payment_id, error = %err, "compensator failed non-retryably");
                let mut state = self.state.lock().unwrap();
                let saga = state
                    .sagas
                    .get_mut(payment_id)
                    .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
                saga.push_compensation(action);
                Err(CoreError::CompensationFailed(err.to_string()))
            }
        }
    }

    fn execute_compensator(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        action: &CompensationAction,
    ) -> Result<(), CoreError> {
        let deadline = Deadline::after(self.clock.now(), Duration::seconds(30));
        match action {
            CompensationAction::ReleaseReservation { reservation_id } => {
                let released = self.limits.release(ctx, reservation_id, "compensation")?;
                if released {
                    let mut state = self.state.lock().unwrap();
                    self.append(
                        &mut state,
                        ctx,
                        payment_id,
                        EventBody::LimitReleased {
                            reservation_id: reservation_id.clone(),
                            reason: "compensation".to_string(),
                        },
                        None,
                    );
                }
                Ok(())
            }
            CompensationAction::ReleaseHold {
                account_ref,
                hold_ref,
            } => {
                self.accounts
                    .release_hold(ctx, payment_id, account_ref, hold_ref, deadline)?;
                let mut state = self.state.lock().unwrap();
                if let Some(hold) = state.holds.get_mut(hold_ref) {
                    hold.mark_released();
                }
                self.append(
                    &mut state,
                    ctx,
                    payment_id,
                    EventBody::FundsReleased {
                        hold_ref: hold_ref.clone(),
                    },
                    None,
                );
                Ok(())
            }
            CompensationAction::CancelClearing { clearing_ref } => {
                let channel = self.channel_for_payment(payment_id)?;
                let body = if channel.supports_cancellation() {
                    let cancelled = self.kernel.call(
                        &format!("clearing-{}", channel.name()),
                        ctx,
                        deadline,
                        &mut |_| channel.cancel(ctx, clearing_ref),
                    )?;
                    if cancelled {
                        EventBody::ClearingCancelled {
                            clearing_ref: clearing_ref.clone(),
                        }
                    } else {
                        EventBody::MarkedForReconciliation {
                            clearing_ref: clearing_ref.clone(),
                        }
                    }
                } else {
                    EventBody::MarkedForReconciliation {
                        clearing_ref: clearing_ref.clone(),
                    }
                };
                let mut state = self.state.lock().unwrap();
                self.append(&mut state, ctx, payment_id, body, None);
                Ok(())
            }
            CompensationAction::ReverseLedger {
                debit_account_ref,
                credit_account_ref,
                amount,
            } => {
                // Opposite pair under a reversal-scoped idempotency key.
                let reversal_id = format!("{payment_id}:reversal");
                self.accounts
                    .debit(ctx, &reversal_id, credit_account_ref, amount, deadline)?;
                self.accounts
                    .credit(ctx, &reversal_id, debit_account_ref, amount, deadline)?;
                let mut state = self.state.lock().unwrap();
                self.append(
                    &mut state,
                    ctx,
                    payment_id,
                    EventBody::LedgerReversed {
                        debit_account_ref: debit_account_ref.clone(),
                        credit_account_ref: credit_account_ref.clone(),
                        amount: amount.clone(),
                    },
                    None,
                );
                Ok(())
            }
        }
    }

    /// Try to park a failed account-side compensator on the offline queue.
    /// Returns the message id when deferred.
    fn defer_compensator(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        action: &CompensationAction,
        err: &CoreError,
    ) -> Result<Option<String>, CoreError> {
        if !matches!(err.class(), FailureClass::RetryableBreaker) {
            return Ok(None);
        }
        match action {
            CompensationAction::ReleaseHold {
                account_ref,
                hold_ref,
            } => self
                .accounts
                .release_hold_deferred(ctx, payment_id, account_ref, hold_ref)
                .map(Some),
            _ => Ok(None),
        }
    }

    fn finish_compensation(&self, ctx: &TenantContext, payment_id: &str) -> Result<(), CoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        let saga = state
            .sagas
            .get_mut(payment_id)
            .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;

        let (outcome, payment_status, body, counter) = match saga.failure_kind() {
            Some("deadline_exceeded") => (
                SagaStatus::TimedOut,
                PaymentStatus::TimedOut,
                EventBody::PaymentTimedOut,
                &metrics().sagas_timed_out,
            ),
            Some(
                "validation" | "authorization" | "limit_exceeded" | "duplicate_reservation"
                | "insufficient_funds" | "account_closed" | "operation_not_supported"
                | "no_route_found" | "invalid_config",
            ) => (
                SagaStatus::Rejected,
                PaymentStatus::Rejected,
                EventBody::PaymentRejected {
                    reason: saga.failure_reason().unwrap_or_default().to_string(),
                },
                &metrics().sagas_rejected,
            ),
            _ => (
                SagaStatus::Failed,
                PaymentStatus::Failed,
                EventBody::PaymentFailed {
                    reason: saga.failure_reason().unwrap_or_default().to_string(),
                },
                &metrics().sagas_failed,
            ),
        };

        saga.finish_compensation(outcome, now)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        self.append(&mut state, ctx, payment_id, EventBody::CompensationCompleted, None);
        self.transition(&mut state, ctx, payment_id, payment_status)?;
        self.append(&mut state, ctx, payment_id, body, None);
        Metrics::incr(counter);
        info!(payment_id, outcome = ?outcome, "compensation completed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event processors (resumption)
    // ------------------------------------------------------------------

    /// Clearing callback processor: apply an asynchronous outcome and
    /// resume the suspended saga.
    pub fn on_clearing_outcome(
        &self,
        ctx: &TenantContext,
        clearing_ref: &str,
        outcome: ClearingOutcome,
        causation_id: Option<String>,
    ) -> Result<(), CoreError> {
        let payment_id = {
            let state = self.state.lock().unwrap();
            state
                .clearing_refs
                .get(clearing_ref)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("clearing ref {clearing_ref}")))?
        };

        {
            let state = self.state.lock().unwrap();
            let saga = state
                .sagas
                .get(&payment_id)
                .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
            ctx.guard_row(saga.tenant_id(), saga.business_unit_id())?;
            if saga.is_terminal() {
                // Duplicate delivery of an outcome already applied.
                debug!(payment_id = %payment_id, "clearing outcome for a terminal saga ignored");
                return Ok(());
            }
            match saga.resume_on() {
                Some(ResumeOn::ClearingOutcome { clearing_ref: waiting })
                    if waiting.as_str() == clearing_ref => {}
                _ => {
                    debug!(payment_id = %payment_id, "clearing outcome for a saga not awaiting it");
                }
            }
        }

        if outcome == ClearingOutcome::Pending {
            return Ok(());
        }

        {
            let now = self.clock.now();
            let mut state = self.state.lock().unwrap();
            let saga = state
                .sagas
                .get_mut(&payment_id)
                .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
            if saga.resume_on().is_some() {
                saga.resume(now);
                self.append(
                    &mut state,
                    ctx,
                    &payment_id,
                    EventBody::SagaResumed {
                        trigger: format!("clearing_outcome:{clearing_ref}"),
                    },
                    causation_id.clone(),
                );
            }
        }

        self.apply_clearing_outcome(ctx, &payment_id, clearing_ref, outcome, causation_id)?;
        self.drive(ctx, &payment_id)?;
        Ok(())
    }

    fn apply_clearing_outcome(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        clearing_ref: &str,
        outcome: ClearingOutcome,
        causation_id: Option<String>,
    ) -> Result<(), CoreError> {
        match outcome {
            ClearingOutcome::Cleared => {
                let mut state = self.state.lock().unwrap();
                self.append(
                    &mut state,
                    ctx,
                    payment_id,
                    EventBody::ClearingCleared {
                        clearing_ref: clearing_ref.to_string(),
                    },
                    causation_id,
                );
                self.transition(&mut state, ctx, payment_id, PaymentStatus::Posting)?;
                Ok(())
            }
            ClearingOutcome::Rejected { code } => {
                {
                    let mut state = self.state.lock().unwrap();
                    self.append(
                        &mut state,
                        ctx,
                        payment_id,
                        EventBody::ClearingRejected {
                            clearing_ref: clearing_ref.to_string(),
                            code: code.clone(),
                        },
                        causation_id,
                    );
                    // The submission is dead at the channel; cancelling it
                    // is pointless, so drop that compensator.
                    let saga = state
                        .sagas
                        .get_mut(payment_id)
                        .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
                    let remaining: Vec<CompensationAction> = {
                        let mut kept = Vec::new();
                        while let Some(action) = saga.pop_compensation() {
                            if !matches!(action, CompensationAction::CancelClearing { .. }) {
                                kept.push(action);
                            }
                        }
                        kept.into_iter().rev().collect()
                    };
                    for action in remaining {
                        saga.push_compensation(action);
                    }
                }
                self.enter_compensation(
                    ctx,
                    payment_id,
                    "clearing_rejected",
                    &format!("clearing rejected with code {code}"),
                )
            }
            ClearingOutcome::Pending => Ok(()),
        }
    }

    /// Offline-queue worker entry: replay due messages and resume sagas
    /// whose awaited message completed.
    pub fn run_queue(&self) -> Result<usize, CoreError> {
        let completions = self.queue.run_due(self.accounts.as_ref());
        let count = completions.len();

        for completion in completions {
            let Some(payment_id) = completion.payment_id else {
                continue;
            };
            let ctx = {
                let state = self.state.lock().unwrap();
                let Some(saga) = state.sagas.get(&payment_id) else {
                    continue;
                };
                let waiting = matches!(
                    saga.resume_on(),
                    Some(ResumeOn::QueuedMessage { message_id }) if *message_id == completion.message_id
                );
                if !waiting {
                    continue;
                }
                TenantContext::new(saga.tenant_id(), saga.business_unit_id())
            };

            {
                let now = self.clock.now();
                let mut state = self.state.lock().unwrap();
                if let Some(saga) = state.sagas.get_mut(&payment_id) {
                    saga.resume(now);
                }
                self.append(
                    &mut state,
                    &ctx,
                    &payment_id,
                    EventBody::SagaResumed {
                        trigger: format!("queued_message:{}", completion.message_id),
                    },
                    None,
                );
            }
            self.drive(&ctx, &payment_id)?;
        }
        Ok(count)
    }

    /// Timer tick: expire reservations, redrive deadline-passed sagas,
    /// prune retained terminal sagas.
    pub fn run_timers(&self) -> Result<(), CoreError> {
        // Reservation expiry.
        for reservation in self.limits.expire_sweep() {
            let ctx = TenantContext::new(reservation.tenant_id(), reservation.business_unit_id());
            let mut state = self.state.lock().unwrap();
            if state.sagas.contains_key(reservation.payment_id()) {
                let payment_id = reservation.payment_id().to_string();
                self.append(
                    &mut state,
                    &ctx,
                    &payment_id,
                    EventBody::LimitExpired {
                        reservation_id: reservation.reservation_id().to_string(),
                    },
                    None,
                );
            }
        }

        // Deadline-passed sagas move into (or continue) compensation.
        let now = self.clock.now();
        let overdue: Vec<(String, TenantContext)> = {
            let state = self.state.lock().unwrap();
            state
                .sagas
                .values()
                .filter(|s| !s.is_terminal() && now >= s.deadline_at())
                .map(|s| {
                    (
                        s.saga_id().to_string(),
                        TenantContext::new(s.tenant_id(), s.business_unit_id()),
                    )
                })
                .collect()
        };
        for (payment_id, ctx) in overdue {
            // A suspended saga ignores its marker once the deadline passed.
            {
                let mut state = self.state.lock().unwrap();
                if let Some(saga) = state.sagas.get_mut(&payment_id) {
                    if saga.resume_on().is_some() {
                        saga.resume(now);
                    }
                }
            }
            self.drive(&ctx, &payment_id)?;
        }

        // Retention sweep.
        let cutoff = now - Duration::seconds(self.config.retention_grace_secs);
        let mut state = self.state.lock().unwrap();
        let expired: Vec<String> = state
            .sagas
            .values()
            .filter(|s| s.is_terminal() && s.updated_at() < cutoff)
            .map(|s| s.saga_id().to_string())
            .collect();
        for payment_id in expired {
            debug!(payment_id = %payment_id, "retention sweep removed terminal saga");
            state.sagas.remove(&payment_id);
            if let Some(payment) = state.payments.remove(&payment_id) {
                if let Some(external_reference) = payment.external_reference() {
                    state.external_refs.remove(&(
                        payment.tenant_id().to_string(),
                        external_reference.to_string(),
                    ));
                }
            }
            state.decisions.remove(&payment_id);
        }

        Ok(())
    }

    /// Publish due outbox events to the notification sink.
    pub fn publish_outbox(&self) -> PublishReport {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        let OrchestrationState { events, .. } = &mut *state;
        self.publisher.publish_due(events, self.sink.as_ref(), now)
    }

    // ------------------------------------------------------------------
    // Queries and operator surface
    // ------------------------------------------------------------------

    /// Events for one saga, in order.
    pub fn events_for_payment(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
    ) -> Result<Vec<crate::models::event::EventEnvelope>, CoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .events
            .events_for_saga(ctx, payment_id)?
            .into_iter()
            .cloned()
            .collect())
    }

    /// Sagas stuck in COMPENSATING, for operator attention.
    pub fn stuck_compensating(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .sagas
            .values()
            .filter(|s| s.status() == SagaStatus::Compensating)
            .map(|s| s.saga_id().to_string())
            .collect()
    }

    /// Poisoned outbox entries as `(saga_id, seq)` pairs.
    pub fn poisoned_events(&self) -> Vec<(String, u64)> {
        let state = self.state.lock().unwrap();
        state
            .events
            .poisoned_outbox()
            .map(|e| (e.saga_id.clone(), e.seq))
            .collect()
    }

    pub(crate) fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub(crate) fn state_handle(&self) -> &Mutex<OrchestrationState> {
        &self.state
    }

    fn saga_status(&self, payment_id: &str) -> Result<SagaStatus, CoreError> {
        let state = self.state.lock().unwrap();
        state
            .sagas
            .get(payment_id)
            .map(|s| s.status())
            .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))
    }

    fn channel_for_payment(&self, payment_id: &str) -> Result<Arc<dyn ClearingChannel>, CoreError> {
        let clearing_system = {
            let state = self.state.lock().unwrap();
            state
                .decisions
                .get(payment_id)
                .map(|d| d.clearing_system.clone())
                .ok_or_else(|| CoreError::Internal("routing decision missing".to_string()))?
        };
        self.clearing
            .lock()
            .unwrap()
            .get(&clearing_system)
            .cloned()
            .ok_or_else(|| {
                CoreError::InvalidConfig(format!(
                    "no clearing channel registered for {clearing_system}"
                ))
            })
    }

    // ------------------------------------------------------------------
    // Commit helpers (called under the state lock)
    // ------------------------------------------------------------------

    fn append(
        &self,
        state: &mut OrchestrationState,
        ctx: &TenantContext,
        saga_id: &str,
        body: EventBody,
        causation_id: Option<String>,
    ) -> u64 {
        let seq = state.events.append(
            ctx,
            saga_id,
            self.ids.new_event_id(),
            body,
            causation_id,
            self.clock.now(),
        );
        if let Some(saga) = state.sagas.get_mut(saga_id) {
            saga.set_last_event_seq(seq);
        }
        seq
    }

    fn complete_step(
        &self,
        state: &mut OrchestrationState,
        ctx: &TenantContext,
        payment_id: &str,
        step: SagaStep,
        compensator: Option<CompensationAction>,
    ) -> Result<(), CoreError> {
        let now = self.clock.now();
        let saga = state
            .sagas
            .get_mut(payment_id)
            .ok_or_else(|| CoreError::NotFound(format!("saga {payment_id}")))?;
        saga.record_step_success(step, compensator, now);
        self.append(
            state,
            ctx,
            payment_id,
            EventBody::StepSucceeded { step },
            None,
        );
        Ok(())
    }

    fn transition(
        &self,
        state: &mut OrchestrationState,
        ctx: &TenantContext,
        payment_id: &str,
        to: PaymentStatus,
    ) -> Result<(), CoreError> {
        let payment = state
            .payments
            .get_mut(payment_id)
            .ok_or_else(|| CoreError::NotFound(format!("payment {payment_id}")))?;
        ctx.guard_row(payment.tenant_id(), payment.business_unit_id())?;
        if payment.status() == to {
            return Ok(());
        }
        let from = payment
            .transition_to(to)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        self.append(
            state,
            ctx,
            payment_id,
            EventBody::StatusChanged { from, to },
            None,
        );
        Ok(())
    }

    fn set_payment_status(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        to: PaymentStatus,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        self.transition(&mut state, ctx, payment_id, to)
    }
}

impl std::fmt::Debug for PaymentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentOrchestrator")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}
