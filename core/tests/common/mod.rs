//! Shared test fixture: an orchestrator wired to in-memory fakes of every
//! adapter contract, under a manual clock.
//!
//! Tenant T1 / business unit B1 / customer C1 with daily R100,000 and
//! monthly R500,000 limits (minor units: 10,000,000 / 50,000,000).

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use payment_orchestration_core::accounts::BackendProfile;
use payment_orchestration_core::contracts::{
    AccountBackend, AccountOp, BackendRequest, BackendResponse, BackendStatus, ClearingChannel,
    ClearingOutcome, FraudScoreProvider, NotificationSink, PaymentRequest,
};
use payment_orchestration_core::core::{Deadline, ManualClock, TenantContext};
use payment_orchestration_core::error::CoreError;
use payment_orchestration_core::limits::LimitConfig;
use payment_orchestration_core::models::event::EventEnvelope;
use payment_orchestration_core::models::payment::{Payment, PaymentType};
use payment_orchestration_core::models::routing_rule::{
    ConditionOp, RoutingRule, RuleAction, RuleCondition, RuleStatus,
};
use payment_orchestration_core::orchestrator::{CoreConfig, PaymentOrchestrator};
use payment_orchestration_core::resilience::NoopSleeper;
use payment_orchestration_core::routing::RoutingDecision;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

pub const DAILY_LIMIT: i64 = 10_000_000; // R100,000.00
pub const MONTHLY_LIMIT: i64 = 50_000_000; // R500,000.00

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap()
}

pub fn ctx() -> TenantContext {
    TenantContext::new("T1", "B1")
}

// ============================================================================
// Mock account backend
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Normal,
    Down,
    InsufficientFunds,
}

#[derive(Default)]
struct BackendState {
    mode: Option<BackendMode>,
    holds_by_key: HashMap<String, String>,
    hold_status: HashMap<String, &'static str>,
    applied_keys: HashMap<String, i64>,
    balances: HashMap<String, i64>,
    ops: Vec<(AccountOp, String)>,
    next_hold: u32,
}

/// In-memory core-banking backend with idempotency-key deduplication.
pub struct MockBackend {
    id: String,
    state: Mutex<BackendState>,
}

impl MockBackend {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            state: Mutex::new(BackendState {
                mode: Some(BackendMode::Normal),
                ..BackendState::default()
            }),
        })
    }

    pub fn set_mode(&self, mode: BackendMode) {
        self.state.lock().unwrap().mode = Some(mode);
    }

    pub fn set_balance(&self, account_ref: &str, balance: i64) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(account_ref.to_string(), balance);
    }

    pub fn balance(&self, account_ref: &str) -> i64 {
        self.state
            .lock()
            .unwrap()
            .balances
            .get(account_ref)
            .copied()
            .unwrap_or(0)
    }

    /// Operations that reached the backend, in call order.
    pub fn ops(&self) -> Vec<(AccountOp, String)> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn hold_status(&self, hold_ref: &str) -> Option<&'static str> {
        self.state.lock().unwrap().hold_status.get(hold_ref).copied()
    }
}

impl AccountBackend for MockBackend {
    fn backend_id(&self) -> &str {
        &self.id
    }

    fn execute(
        &self,
        _ctx: &TenantContext,
        request: &BackendRequest,
        _deadline: Deadline,
    ) -> Result<BackendResponse, CoreError> {
        let mut state = self.state.lock().unwrap();
        match state.mode {
            Some(BackendMode::Down) => {
                return Err(CoreError::Transient {
                    cause: "connection refused".to_string(),
                })
            }
            Some(BackendMode::InsufficientFunds) if request.op == AccountOp::PlaceHold => {
                state.ops.push((request.op, request.account_ref.clone()));
                return Ok(BackendResponse {
                    status: BackendStatus::InsufficientFunds,
                    hold_ref: None,
                    balance: None,
                    error: None,
                });
            }
            _ => {}
        }
        state.ops.push((request.op, request.account_ref.clone()));

        match request.op {
            AccountOp::GetAccount => {
                let balance = state
                    .balances
                    .get(&request.account_ref)
                    .copied()
                    .unwrap_or(0);
                Ok(BackendResponse::ok().with_balance(balance))
            }
            AccountOp::PlaceHold => {
                // Repeat of the same idempotency key returns the same hold.
                if let Some(existing) = state.holds_by_key.get(&request.idempotency_key) {
                    let hold_ref = existing.clone();
                    return Ok(BackendResponse::ok().with_hold_ref(hold_ref));
                }
                state.next_hold += 1;
                let hold_ref = format!("{}_hold_{}", self.id, state.next_hold);
                state
                    .holds_by_key
                    .insert(request.idempotency_key.clone(), hold_ref.clone());
                state.hold_status.insert(hold_ref.clone(), "active");
                Ok(BackendResponse::ok().with_hold_ref(hold_ref))
            }
            AccountOp::CaptureHold => {
                let hold_ref = request
                    .hold_ref
                    .clone()
                    .ok_or_else(|| CoreError::Validation("hold_ref required".to_string()))?;
                state.hold_status.insert(hold_ref, "captured");
                Ok(BackendResponse::ok())
            }
            AccountOp::ReleaseHold => {
                let hold_ref = request
                    .hold_ref
                    .clone()
                    .ok_or_else(|| CoreError::Validation("hold_ref required".to_string()))?;
                state.hold_status.insert(hold_ref, "released");
                Ok(BackendResponse::ok())
            }
            AccountOp::Credit | AccountOp::Debit => {
                let amount = request
                    .amount
                    .as_ref()
                    .map(|m| m.amount_minor())
                    .unwrap_or(0);
                // Idempotent: a replayed key does not re-apply.
                if state
                    .applied_keys
                    .insert(request.idempotency_key.clone(), amount)
                    .is_none()
                {
                    let delta = if request.op == AccountOp::Credit {
                        amount
                    } else {
                        -amount
                    };
                    *state
                        .balances
                        .entry(request.account_ref.clone())
                        .or_insert(0) += delta;
                }
                Ok(BackendResponse::ok())
            }
        }
    }

    fn health_check(&self) -> Result<(), CoreError> {
        match self.state.lock().unwrap().mode {
            Some(BackendMode::Down) => Err(CoreError::Transient {
                cause: "down".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Mock clearing channel
// ============================================================================

#[derive(Default)]
struct ChannelState {
    outcome: Option<ClearingOutcome>,
    submissions: Vec<(String, String)>,
    cancelled: Vec<String>,
    next: u32,
}

pub struct MockClearingChannel {
    name: String,
    synchronous: bool,
    cancellable: bool,
    state: Mutex<ChannelState>,
}

impl MockClearingChannel {
    pub fn synchronous(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            synchronous: true,
            cancellable: true,
            state: Mutex::new(ChannelState {
                outcome: Some(ClearingOutcome::Cleared),
                ..ChannelState::default()
            }),
        })
    }

    pub fn asynchronous(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            synchronous: false,
            cancellable: true,
            state: Mutex::new(ChannelState {
                outcome: Some(ClearingOutcome::Pending),
                ..ChannelState::default()
            }),
        })
    }

    pub fn set_outcome(&self, outcome: ClearingOutcome) {
        self.state.lock().unwrap().outcome = Some(outcome);
    }

    pub fn set_cancellable(&mut self, cancellable: bool) {
        self.cancellable = cancellable;
    }

    pub fn submissions(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn last_clearing_ref(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .submissions
            .last()
            .map(|(r, _)| r.clone())
    }
}

impl ClearingChannel for MockClearingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    fn supports_cancellation(&self) -> bool {
        self.cancellable
    }

    fn submit(
        &self,
        _ctx: &TenantContext,
        payment: &Payment,
        _decision: &RoutingDecision,
        _deadline: Deadline,
    ) -> Result<String, CoreError> {
        let mut state = self.state.lock().unwrap();
        state.next += 1;
        let clearing_ref = format!("{}_clr_{}", self.name, state.next);
        state
            .submissions
            .push((clearing_ref.clone(), payment.payment_id().to_string()));
        Ok(clearing_ref)
    }

    fn cancel(&self, _ctx: &TenantContext, clearing_ref: &str) -> Result<bool, CoreError> {
        let mut state = self.state.lock().unwrap();
        state.cancelled.push(clearing_ref.to_string());
        Ok(true)
    }

    fn await_outcome(
        &self,
        _ctx: &TenantContext,
        _clearing_ref: &str,
    ) -> Result<ClearingOutcome, CoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .outcome
            .clone()
            .unwrap_or(ClearingOutcome::Pending))
    }
}

// ============================================================================
// Mock fraud provider and notification sink
// ============================================================================

pub struct MockFraudProvider {
    score: Mutex<Result<f64, ()>>,
}

impl MockFraudProvider {
    pub fn approving() -> Arc<Self> {
        Arc::new(Self {
            score: Mutex::new(Ok(0.1)),
        })
    }

    pub fn set_score(&self, score: f64) {
        *self.score.lock().unwrap() = Ok(score);
    }

    pub fn set_unavailable(&self) {
        *self.score.lock().unwrap() = Err(());
    }
}

impl FraudScoreProvider for MockFraudProvider {
    fn score(
        &self,
        _ctx: &TenantContext,
        _payment: &Payment,
        _deadline: Deadline,
    ) -> Result<f64, CoreError> {
        self.score
            .lock()
            .unwrap()
            .map_err(|_| CoreError::Transient {
                cause: "scorer down".to_string(),
            })
    }
}

#[derive(Default)]
pub struct CollectingSink {
    delivered: Mutex<Vec<EventEnvelope>>,
    failing: Mutex<bool>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn delivered(&self) -> Vec<EventEnvelope> {
        self.delivered.lock().unwrap().clone()
    }
}

impl NotificationSink for CollectingSink {
    fn deliver(&self, event: &EventEnvelope) -> Result<(), CoreError> {
        if *self.failing.lock().unwrap() {
            return Err(CoreError::Transient {
                cause: "sink down".to_string(),
            });
        }
        self.delivered.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ============================================================================
// Fixture
// ============================================================================

pub struct Fixture {
    pub clock: Arc<ManualClock>,
    pub orchestrator: PaymentOrchestrator,
    pub backend: Arc<MockBackend>,
    pub rtc: Arc<MockClearingChannel>,
    pub eft: Arc<MockClearingChannel>,
    pub fraud: Arc<MockFraudProvider>,
    pub sink: Arc<CollectingSink>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(CoreConfig::default())
    }

    pub fn with_config(mut config: CoreConfig) -> Self {
        config.default_limits = LimitConfig {
            daily_limit: DAILY_LIMIT,
            monthly_limit: MONTHLY_LIMIT,
            per_transaction_limit: DAILY_LIMIT,
            per_type_daily_limits: BTreeMap::new(),
            daily_count_limit: 100,
            reservation_ttl_secs: 30 * 60,
        };

        let clock = Arc::new(ManualClock::new(t0()));
        let fraud = MockFraudProvider::approving();
        let sink = CollectingSink::new();
        let orchestrator = PaymentOrchestrator::new(
            config,
            clock.clone(),
            Arc::new(NoopSleeper),
            fraud.clone(),
            sink.clone(),
        )
        .expect("orchestrator config must validate");

        let backend = MockBackend::new("core-banking-1");
        backend.set_balance("ACC_DEBIT", 100_000_000);
        let mut profile = BackendProfile::full("core-banking-1");
        // Small breaker window so outage scenarios trip within one call's
        // retry budget.
        profile.policy.breaker.window_size = 4;
        profile.policy.breaker.minimum_calls = 3;
        orchestrator
            .accounts()
            .register_backend(profile, backend.clone());
        orchestrator.accounts().map_account("ACC_DEBIT", "core-banking-1");
        orchestrator.accounts().map_account("ACC_CREDIT", "core-banking-1");

        let rtc = MockClearingChannel::synchronous("RTC");
        let eft = MockClearingChannel::asynchronous("EFT");
        orchestrator.register_clearing_channel(rtc.clone());
        orchestrator.register_clearing_channel(eft.clone());

        orchestrator.routing().load_rules(
            "T1",
            vec![RoutingRule {
                rule_id: "rule_rtc".to_string(),
                tenant_id: "T1".to_string(),
                business_unit_id: None,
                priority: 10,
                conditions: vec![RuleCondition {
                    field: "payment_type".to_string(),
                    op: ConditionOp::Eq,
                    value: serde_json::json!("RTC"),
                    order: 1,
                }],
                actions: vec![RuleAction {
                    clearing_system: "RTC".to_string(),
                    routing_priority: 5,
                    is_primary: true,
                }],
                effective_from: None,
                effective_to: None,
                status: RuleStatus::Active,
            }],
        );
        orchestrator.routing().set_tenant_default("T1", "EFT");

        Self {
            clock,
            orchestrator,
            backend,
            rtc,
            eft,
            fraud,
            sink,
        }
    }

    pub fn request(&self, amount_minor: i64, payment_type: PaymentType) -> PaymentRequest {
        PaymentRequest {
            tenant_id: "T1".to_string(),
            business_unit_id: "B1".to_string(),
            payment_id: None,
            external_reference: None,
            customer_id: "C1".to_string(),
            debit_account_ref: "ACC_DEBIT".to_string(),
            credit_account_ref: "ACC_CREDIT".to_string(),
            amount_minor,
            currency: "ZAR".to_string(),
            payment_type,
            local_instrument: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Submit and drive to quiescence; returns the payment id.
    pub fn submit_and_drive(&self, amount_minor: i64, payment_type: PaymentType) -> String {
        let ack = self
            .orchestrator
            .submit_payment(self.request(amount_minor, payment_type))
            .expect("submission must be accepted");
        self.orchestrator
            .drive(&ctx(), &ack.payment_id)
            .expect("drive must not error");
        ack.payment_id
    }

    /// Event type tags for one payment, in seq order.
    pub fn event_types(&self, payment_id: &str) -> Vec<&'static str> {
        self.orchestrator
            .events_for_payment(&ctx(), payment_id)
            .expect("events must be readable")
            .iter()
            .map(|e| e.event_type())
            .collect()
    }
}

/// True when `needle` appears in `haystack` in order (not necessarily
/// contiguously).
pub fn is_ordered_subsequence(haystack: &[&str], needle: &[&str]) -> bool {
    let mut it = haystack.iter();
    needle.iter().all(|n| it.any(|h| h == n))
}
