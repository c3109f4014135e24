//! Account adapter
//!
//! Uniform debit / credit / hold surface over N heterogeneous core-banking
//! backends. Routing from account reference to backend is table-driven;
//! every call runs through the resiliency kernel under the backend's own
//! policy.
//!
//! Capability gates answer `OperationNotSupported` without a network round
//! trip (loan backends accept only credits). `get_account` may fall back
//! to a staleness-bounded cached snapshot; fund-affecting operations are
//! never faked from cache.
//!
//! Idempotency: every backend request carries a key derived from
//! `(payment_id, op)`. Backends must treat a repeated key as the original
//! call, which is also what makes offline replay safe.

use crate::contracts::{AccountBackend, AccountOp, BackendRequest, BackendResponse, BackendStatus};
use crate::core::{Clock, Deadline, TenantContext};
use crate::error::CoreError;
use crate::models::payment::Money;
use crate::models::queued_message::QueuedMessage;
use crate::resilience::{
    HealthMonitor, HealthPolicy, OfflineQueue, QueuedCallHandler, ResilienceKernel, ServicePolicy,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Static description of one backend system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendProfile {
    pub backend_id: String,

    /// Operations this backend supports
    pub capabilities: BTreeSet<AccountOp>,

    /// Operations that may be parked on the offline queue when the backend
    /// is unreachable (must be idempotent)
    pub deferrable_ops: BTreeSet<AccountOp>,

    /// Resilience tuning applied to this backend's calls
    pub policy: ServicePolicy,

    /// How long a cached account snapshot may serve as a fallback
    pub cache_staleness_secs: i64,
}

impl BackendProfile {
    /// A full-service backend profile with every capability.
    pub fn full(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            capabilities: [
                AccountOp::GetAccount,
                AccountOp::PlaceHold,
                AccountOp::CaptureHold,
                AccountOp::ReleaseHold,
                AccountOp::Credit,
                AccountOp::Debit,
            ]
            .into_iter()
            .collect(),
            deferrable_ops: [
                AccountOp::PlaceHold,
                AccountOp::CaptureHold,
                AccountOp::ReleaseHold,
                AccountOp::Credit,
                AccountOp::Debit,
            ]
            .into_iter()
            .collect(),
            policy: ServicePolicy::default(),
            cache_staleness_secs: 300,
        }
    }

    /// A loan-book profile: credit only.
    pub fn credit_only(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            capabilities: [AccountOp::GetAccount, AccountOp::Credit]
                .into_iter()
                .collect(),
            deferrable_ops: [AccountOp::Credit].into_iter().collect(),
            policy: ServicePolicy::default(),
            cache_staleness_secs: 300,
        }
    }
}

/// Cached view of one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_ref: String,
    pub backend_id: String,
    pub balance: Option<i64>,
    pub fetched_at: chrono::DateTime<chrono::Utc>,
}

/// Result of a deferrable operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    /// The backend answered inline
    Done(BackendResponse),

    /// The backend is unreachable; the call was parked on the offline
    /// queue and will be replayed
    Deferred { message_id: String },
}

/// The uniform account operation surface.
pub struct AccountAdapter {
    clock: Arc<dyn Clock>,
    kernel: Arc<ResilienceKernel>,
    queue: Arc<OfflineQueue>,
    health: HealthMonitor,
    backends: Mutex<BTreeMap<String, Arc<dyn AccountBackend>>>,
    profiles: Mutex<BTreeMap<String, BackendProfile>>,
    routes: Mutex<BTreeMap<String, String>>,
    cache: Mutex<HashMap<String, AccountSnapshot>>,
    next_message_id: Mutex<u64>,
}

impl AccountAdapter {
    pub fn new(
        clock: Arc<dyn Clock>,
        kernel: Arc<ResilienceKernel>,
        queue: Arc<OfflineQueue>,
    ) -> Self {
        Self {
            clock,
            kernel,
            queue,
            health: HealthMonitor::new(HealthPolicy::default()),
            backends: Mutex::new(BTreeMap::new()),
            profiles: Mutex::new(BTreeMap::new()),
            routes: Mutex::new(BTreeMap::new()),
            cache: Mutex::new(HashMap::new()),
            next_message_id: Mutex::new(1),
        }
    }

    /// TTL-cached health of one backend, probed via its `health_check`.
    pub fn backend_healthy(&self, backend_id: &str) -> bool {
        let backend = self.backends.lock().unwrap().get(backend_id).cloned();
        let Some(backend) = backend else {
            return false;
        };
        self.health
            .is_healthy(backend_id, self.clock.now(), || backend.health_check())
    }

    /// Register a backend and its resilience policy.
    pub fn register_backend(&self, profile: BackendProfile, backend: Arc<dyn AccountBackend>) {
        self.kernel
            .set_policy(&profile.backend_id, profile.policy.clone());
        self.backends
            .lock()
            .unwrap()
            .insert(profile.backend_id.clone(), backend);
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.backend_id.clone(), profile);
    }

    /// Map an account reference onto a backend.
    pub fn map_account(&self, account_ref: &str, backend_id: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(account_ref.to_string(), backend_id.to_string());
    }

    /// Idempotency key for `(payment_id, op)`.
    pub fn idempotency_key(payment_id: &str, op: AccountOp) -> String {
        let digest = Sha256::digest(format!("{payment_id}:{op}").as_bytes());
        format!("{digest:x}")
    }

    fn resolve(&self, account_ref: &str) -> Result<(BackendProfile, Arc<dyn AccountBackend>), CoreError> {
        let backend_id = self
            .routes
            .lock()
            .unwrap()
            .get(account_ref)
            .cloned()
            .ok_or_else(|| {
                CoreError::Validation(format!("no backend mapped for account {account_ref}"))
            })?;
        let profile = self
            .profiles
            .lock()
            .unwrap()
            .get(&backend_id)
            .cloned()
            .ok_or_else(|| CoreError::InvalidConfig(format!("unknown backend {backend_id}")))?;
        let backend = self
            .backends
            .lock()
            .unwrap()
            .get(&backend_id)
            .cloned()
            .ok_or_else(|| CoreError::InvalidConfig(format!("unknown backend {backend_id}")))?;
        Ok((profile, backend))
    }

    fn build_request(
        op: AccountOp,
        account_ref: &str,
        payment_id: &str,
        amount: Option<Money>,
        hold_ref: Option<String>,
        reason: Option<String>,
    ) -> BackendRequest {
        BackendRequest {
            op,
            account_ref: account_ref.to_string(),
            amount,
            idempotency_key: Self::idempotency_key(payment_id, op),
            reason,
            payment_id: payment_id.to_string(),
            hold_ref,
        }
    }

    /// Run one operation through the kernel, mapping backend statuses onto
    /// the error taxonomy.
    fn execute(
        &self,
        ctx: &TenantContext,
        request: &BackendRequest,
        deadline: Deadline,
    ) -> Result<BackendResponse, CoreError> {
        let (profile, backend) = self.resolve(&request.account_ref)?;

        if !profile.capabilities.contains(&request.op) {
            return Err(CoreError::OperationNotSupported {
                backend: profile.backend_id.clone(),
                op: request.op.as_str().to_string(),
            });
        }

        let request = request.clone();
        let account_ref = request.account_ref.clone();
        let response = self.kernel.call(
            &profile.backend_id,
            ctx,
            deadline,
            &mut |attempt_deadline| {
                let response = backend.execute(ctx, &request, attempt_deadline)?;
                match response.status {
                    BackendStatus::Ok => Ok(response),
                    BackendStatus::InsufficientFunds => Err(CoreError::InsufficientFunds {
                        account_ref: account_ref.clone(),
                    }),
                    BackendStatus::AccountClosed => Err(CoreError::AccountClosed {
                        account_ref: account_ref.clone(),
                    }),
                    BackendStatus::NotSupported => Err(CoreError::OperationNotSupported {
                        backend: profile.backend_id.clone(),
                        op: request.op.as_str().to_string(),
                    }),
                    BackendStatus::Failed => Err(CoreError::Transient {
                        cause: response
                            .error
                            .unwrap_or_else(|| "backend failure".to_string()),
                    }),
                }
            },
        )?;
        Ok(response)
    }

    /// Fetch an account, falling back to a fresh-enough cached snapshot
    /// when the backend cannot answer.
    pub fn get_account(
        &self,
        ctx: &TenantContext,
        account_ref: &str,
        deadline: Deadline,
    ) -> Result<AccountSnapshot, CoreError> {
        let (profile, _) = self.resolve(account_ref)?;
        let request =
            Self::build_request(AccountOp::GetAccount, account_ref, "inquiry", None, None, None);

        match self.execute(ctx, &request, deadline) {
            Ok(response) => {
                let snapshot = AccountSnapshot {
                    account_ref: account_ref.to_string(),
                    backend_id: profile.backend_id.clone(),
                    balance: response.balance,
                    fetched_at: self.clock.now(),
                };
                self.cache
                    .lock()
                    .unwrap()
                    .insert(account_ref.to_string(), snapshot.clone());
                Ok(snapshot)
            }
            Err(err) => {
                let now = self.clock.now();
                let cached = self.cache.lock().unwrap().get(account_ref).cloned();
                match cached {
                    Some(snapshot)
                        if now - snapshot.fetched_at
                            <= Duration::seconds(profile.cache_staleness_secs) =>
                    {
                        debug!(account_ref, "serving stale account snapshot as fallback");
                        Ok(snapshot)
                    }
                    _ => Err(err),
                }
            }
        }
    }

    /// Place a hold. Returns the backend-issued hold reference.
    pub fn place_hold(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        account_ref: &str,
        amount: &Money,
        deadline: Deadline,
    ) -> Result<String, CoreError> {
        let request = Self::build_request(
            AccountOp::PlaceHold,
            account_ref,
            payment_id,
            Some(amount.clone()),
            None,
            None,
        );
        let response = self.execute(ctx, &request, deadline)?;
        response.hold_ref.ok_or_else(|| {
            CoreError::Internal("backend acknowledged hold without a hold_ref".to_string())
        })
    }

    /// Place a hold, parking the call on the offline queue when the
    /// backend is unreachable and the op is deferrable.
    pub fn place_hold_deferrable(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        account_ref: &str,
        amount: &Money,
        deadline: Deadline,
    ) -> Result<OpOutcome, CoreError> {
        let request = Self::build_request(
            AccountOp::PlaceHold,
            account_ref,
            payment_id,
            Some(amount.clone()),
            None,
            None,
        );
        match self.execute(ctx, &request, deadline) {
            Ok(response) => Ok(OpOutcome::Done(response)),
            Err(err) => self.defer_or_fail(ctx, request, err),
        }
    }

    /// Capture a placed hold.
    pub fn capture_hold(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        account_ref: &str,
        hold_ref: &str,
        deadline: Deadline,
    ) -> Result<(), CoreError> {
        let request = Self::build_request(
            AccountOp::CaptureHold,
            account_ref,
            payment_id,
            None,
            Some(hold_ref.to_string()),
            None,
        );
        self.execute(ctx, &request, deadline).map(|_| ())
    }

    /// Release a placed hold.
    pub fn release_hold(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        account_ref: &str,
        hold_ref: &str,
        deadline: Deadline,
    ) -> Result<(), CoreError> {
        let request = Self::build_request(
            AccountOp::ReleaseHold,
            account_ref,
            payment_id,
            None,
            Some(hold_ref.to_string()),
            Some("compensation".to_string()),
        );
        self.execute(ctx, &request, deadline).map(|_| ())
    }

    /// Credit an account.
    pub fn credit(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        account_ref: &str,
        amount: &Money,
        deadline: Deadline,
    ) -> Result<(), CoreError> {
        let request = Self::build_request(
            AccountOp::Credit,
            account_ref,
            payment_id,
            Some(amount.clone()),
            None,
            None,
        );
        self.execute(ctx, &request, deadline).map(|_| ())
    }

    /// Debit an account.
    pub fn debit(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        account_ref: &str,
        amount: &Money,
        deadline: Deadline,
    ) -> Result<(), CoreError> {
        let request = Self::build_request(
            AccountOp::Debit,
            account_ref,
            payment_id,
            Some(amount.clone()),
            None,
            None,
        );
        self.execute(ctx, &request, deadline).map(|_| ())
    }

    /// Park a hold release on the offline queue without another inline
    /// attempt (the caller already observed the backend unreachable).
    /// Returns the queued message id.
    pub fn release_hold_deferred(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
        account_ref: &str,
        hold_ref: &str,
    ) -> Result<String, CoreError> {
        let request = Self::build_request(
            AccountOp::ReleaseHold,
            account_ref,
            payment_id,
            None,
            Some(hold_ref.to_string()),
            Some("compensation".to_string()),
        );
        match self.defer_or_fail(
            ctx,
            request,
            CoreError::ServiceUnavailable {
                service: account_ref.to_string(),
            },
        )? {
            OpOutcome::Deferred { message_id } => Ok(message_id),
            OpOutcome::Done(_) => Err(CoreError::Internal(
                "deferred release unexpectedly completed inline".to_string(),
            )),
        }
    }

    /// Park an unreachable idempotent call on the offline queue; anything
    /// else propagates.
    fn defer_or_fail(
        &self,
        ctx: &TenantContext,
        request: BackendRequest,
        err: CoreError,
    ) -> Result<OpOutcome, CoreError> {
        if !err.is_retryable() {
            return Err(err);
        }
        let (profile, _) = self.resolve(&request.account_ref)?;
        if !profile.deferrable_ops.contains(&request.op) {
            return Err(err);
        }

        let now = self.clock.now();
        let message_id = {
            let mut next = self.next_message_id.lock().unwrap();
            let id = format!("qm_{:08}", *next);
            *next += 1;
            id
        };
        let payload = serde_json::to_value(&request)
            .map_err(|e| CoreError::Internal(format!("queued payload encoding: {e}")))?;
        let mut headers = BTreeMap::new();
        headers.insert(
            "Idempotency-Key".to_string(),
            request.idempotency_key.clone(),
        );

        let message = QueuedMessage::new(
            message_id.clone(),
            ctx.tenant_id().to_string(),
            ctx.business_unit_id().to_string(),
            profile.backend_id.clone(),
            format!("/accounts/{}", request.op),
            request.op.as_str().to_string(),
            payload,
            headers,
            Some(request.payment_id.clone()),
            self.queue.policy().default_max_retries,
            now,
            now + self.queue.policy().default_ttl(),
        );
        warn!(
            message_id = %message_id,
            backend = %profile.backend_id,
            op = %request.op,
            "backend unreachable; call parked on offline queue"
        );
        self.queue.enqueue(message);
        Ok(OpOutcome::Deferred { message_id })
    }
}

impl QueuedCallHandler for AccountAdapter {
    /// Replay a parked call. A failed health probe skips the attempt
    /// cheaply; the idempotency key makes a replay of an already-applied
    /// call a no-op at the backend.
    fn handle(&self, message: &QueuedMessage) -> Result<(), CoreError> {
        if !self.backend_healthy(message.service_name()) {
            return Err(CoreError::ServiceUnavailable {
                service: message.service_name().to_string(),
            });
        }
        let request: BackendRequest = serde_json::from_value(message.payload().clone())
            .map_err(|e| CoreError::Internal(format!("queued payload decoding: {e}")))?;
        let ctx = TenantContext::new(message.tenant_id(), message.business_unit_id());
        let deadline = Deadline::after(self.clock.now(), Duration::seconds(30));
        self.execute(&ctx, &request, deadline).map(|_| ())
    }
}

impl std::fmt::Debug for AccountAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountAdapter").finish_non_exhaustive()
    }
}
