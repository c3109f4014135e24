//! Limit reservation engine
//!
//! Multi-level reserve / consume / release over customer limit buckets
//! (daily amount, monthly amount, per-type daily amount, daily count, and a
//! per-transaction ceiling).
//!
//! A reservation claims capacity immediately: counters include reserved
//! amounts, so a check after a successful reserve always sees
//! `used_amount <= configured_limit`. Consume makes the claim permanent by
//! flipping the reservation status; release and expiry return the claimed
//! capacity.
//!
//! # Concurrency
//!
//! All mutation happens under one internal mutex, making `reserve`
//! serializable relative to concurrent reserves on the same customer: two
//! reserves that together overflow a bucket can never both succeed. Callers
//! that race at the same instant are ordered by the lock; payment ids are
//! time-ordered, so the earlier payment wins the tie.
//!
//! # Critical Invariants
//!
//! 1. `used_amount <= configured_limit` for every bucket after every
//!    successful reserve
//! 2. At most one live reservation per payment
//! 3. `reserve` then `release` restores every counter exactly
//! 4. Closed (historical) buckets are never mutated

pub mod bucket;

pub use bucket::{BucketKey, LimitCounter};

use crate::core::{Clock, TenantContext};
use crate::error::CoreError;
use crate::models::payment::{Money, PaymentType};
use crate::models::reservation::{LedgerReservation, ReservationStatus};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Limit dimension that rejected a reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitDimension {
    Daily,
    Monthly,
    PerTransaction,
    PerType,
    DailyCount,
}

impl std::fmt::Display for LimitDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LimitDimension::Daily => "daily",
            LimitDimension::Monthly => "monthly",
            LimitDimension::PerTransaction => "per_transaction",
            LimitDimension::PerType => "per_type",
            LimitDimension::DailyCount => "daily_count",
        };
        f.write_str(s)
    }
}

/// Configured limits for one customer.
///
/// Amounts are i64 minor units. A per-type limit falls back to
/// `daily_limit` when the type has no entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    pub daily_limit: i64,
    pub monthly_limit: i64,
    pub per_transaction_limit: i64,
    pub per_type_daily_limits: BTreeMap<PaymentType, i64>,
    pub daily_count_limit: u32,

    /// Reservation time-to-live in seconds (default 30 minutes)
    pub reservation_ttl_secs: i64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            daily_limit: 10_000_000,
            monthly_limit: 50_000_000,
            per_transaction_limit: 10_000_000,
            per_type_daily_limits: BTreeMap::new(),
            daily_count_limit: 1_000,
            reservation_ttl_secs: 30 * 60,
        }
    }
}

impl LimitConfig {
    pub fn reservation_ttl(&self) -> Duration {
        Duration::seconds(self.reservation_ttl_secs)
    }

    fn per_type_limit(&self, payment_type: PaymentType) -> i64 {
        self.per_type_daily_limits
            .get(&payment_type)
            .copied()
            .unwrap_or(self.daily_limit)
    }
}

/// Result of a pure availability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitCheck {
    pub sufficient: bool,
    pub daily_available: i64,
    pub monthly_available: i64,
    pub per_type_available: i64,
    pub count_remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct CounterKey {
    tenant_id: String,
    customer_id: String,
    bucket: BucketKey,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LimitState {
    counters: BTreeMap<CounterKey, LimitCounter>,

    /// All reservations by id, live and settled
    reservations: BTreeMap<String, LedgerReservation>,

    /// payment_id -> reservation_id for live reservations only
    live_by_payment: BTreeMap<String, String>,
}

/// Serializable snapshot of the limit engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSnapshot {
    state: LimitState,
}

/// The limit reservation engine.
pub struct LimitEngine {
    clock: Arc<dyn Clock>,
    default_limits: LimitConfig,
    customer_limits: Mutex<BTreeMap<(String, String), LimitConfig>>,
    state: Mutex<LimitState>,
}

impl LimitEngine {
    pub fn new(clock: Arc<dyn Clock>, default_limits: LimitConfig) -> Self {
        Self {
            clock,
            default_limits,
            customer_limits: Mutex::new(BTreeMap::new()),
            state: Mutex::new(LimitState::default()),
        }
    }

    /// Override the limits for one customer.
    pub fn set_customer_limits(
        &self,
        ctx: &TenantContext,
        customer_id: &str,
        limits: LimitConfig,
    ) {
        self.customer_limits.lock().unwrap().insert(
            (ctx.tenant_id().to_string(), customer_id.to_string()),
            limits,
        );
    }

    fn limits_for(&self, tenant_id: &str, customer_id: &str) -> LimitConfig {
        self.customer_limits
            .lock()
            .unwrap()
            .get(&(tenant_id.to_string(), customer_id.to_string()))
            .cloned()
            .unwrap_or_else(|| self.default_limits.clone())
    }

    fn counter_key(ctx: &TenantContext, customer_id: &str, bucket: BucketKey) -> CounterKey {
        CounterKey {
            tenant_id: ctx.tenant_id().to_string(),
            customer_id: customer_id.to_string(),
            bucket,
        }
    }

    fn used(state: &LimitState, key: &CounterKey) -> LimitCounter {
        state.counters.get(key).copied().unwrap_or_default()
    }

    /// Pure read: how much capacity remains for this customer and amount.
    pub fn check(
        &self,
        ctx: &TenantContext,
        customer_id: &str,
        amount: &Money,
        payment_type: PaymentType,
    ) -> LimitCheck {
        let limits = self.limits_for(ctx.tenant_id(), customer_id);
        let today = self.clock.now().date_naive();
        let state = self.state.lock().unwrap();

        let daily = Self::used(&state, &Self::counter_key(ctx, customer_id, BucketKey::daily(today)));
        let monthly =
            Self::used(&state, &Self::counter_key(ctx, customer_id, BucketKey::monthly(today)));
        let per_type = Self::used(
            &state,
            &Self::counter_key(ctx, customer_id, BucketKey::per_type(today, payment_type)),
        );
        let count = Self::used(
            &state,
            &Self::counter_key(ctx, customer_id, BucketKey::daily_count(today)),
        );

        let daily_available = (limits.daily_limit - daily.used_amount).max(0);
        let monthly_available = (limits.monthly_limit - monthly.used_amount).max(0);
        let per_type_available =
            (limits.per_type_limit(payment_type) - per_type.used_amount).max(0);
        let count_remaining = limits.daily_count_limit.saturating_sub(count.used_count);

        let value = amount.amount_minor();
        LimitCheck {
            sufficient: value > 0
                && value <= limits.per_transaction_limit
                && value <= daily_available
                && value <= monthly_available
                && value <= per_type_available
                && count_remaining > 0,
            daily_available,
            monthly_available,
            per_type_available,
            count_remaining,
        }
    }

    /// Atomically reserve capacity across every bucket.
    ///
    /// Fails with `LimitExceeded(dimension)` naming the first overflowing
    /// bucket, or `DuplicateReservation` when the payment already holds a
    /// live reservation. The new reservation expires after the configured
    /// TTL.
    pub fn reserve(
        &self,
        ctx: &TenantContext,
        reservation_id: String,
        payment_id: &str,
        customer_id: &str,
        amount: &Money,
        payment_type: PaymentType,
    ) -> Result<String, CoreError> {
        let value = amount.amount_minor();
        if value <= 0 {
            return Err(CoreError::Validation(
                "reserve amount must be positive".to_string(),
            ));
        }

        let limits = self.limits_for(ctx.tenant_id(), customer_id);
        if value > limits.per_transaction_limit {
            return Err(CoreError::LimitExceeded {
                dimension: LimitDimension::PerTransaction,
            });
        }

        let now = self.clock.now();
        let today = now.date_naive();
        let mut state = self.state.lock().unwrap();

        if state.live_by_payment.contains_key(payment_id) {
            return Err(CoreError::DuplicateReservation {
                payment_id: payment_id.to_string(),
            });
        }

        let daily_key = Self::counter_key(ctx, customer_id, BucketKey::daily(today));
        let monthly_key = Self::counter_key(ctx, customer_id, BucketKey::monthly(today));
        let per_type_key =
            Self::counter_key(ctx, customer_id, BucketKey::per_type(today, payment_type));
        let count_key = Self::counter_key(ctx, customer_id, BucketKey::daily_count(today));

        // Reject-before-mutate: no bucket may overflow.
        if Self::used(&state, &daily_key).used_amount + value > limits.daily_limit {
            return Err(CoreError::LimitExceeded {
                dimension: LimitDimension::Daily,
            });
        }
        if Self::used(&state, &monthly_key).used_amount + value > limits.monthly_limit {
            return Err(CoreError::LimitExceeded {
                dimension: LimitDimension::Monthly,
            });
        }
        if Self::used(&state, &per_type_key).used_amount + value
            > limits.per_type_limit(payment_type)
        {
            return Err(CoreError::LimitExceeded {
                dimension: LimitDimension::PerType,
            });
        }
        if Self::used(&state, &count_key).used_count + 1 > limits.daily_count_limit {
            return Err(CoreError::LimitExceeded {
                dimension: LimitDimension::DailyCount,
            });
        }

        state.counters.entry(daily_key).or_default().add(value, 0);
        state.counters.entry(monthly_key).or_default().add(value, 0);
        state.counters.entry(per_type_key).or_default().add(value, 0);
        state.counters.entry(count_key).or_default().add(0, 1);

        let reservation = LedgerReservation::new(
            reservation_id.clone(),
            ctx.tenant_id().to_string(),
            ctx.business_unit_id().to_string(),
            customer_id.to_string(),
            payment_id.to_string(),
            amount.clone(),
            payment_type,
            now,
            now + limits.reservation_ttl(),
        );
        state
            .live_by_payment
            .insert(payment_id.to_string(), reservation_id.clone());
        state
            .reservations
            .insert(reservation_id.clone(), reservation);

        debug!(payment_id, reservation_id = %reservation_id, amount = value, "limit reserved");
        Ok(reservation_id)
    }

    /// RESERVED -> CONSUMED: the claimed capacity becomes permanent usage.
    /// Replaying consume on a consumed reservation is a no-op.
    pub fn consume(&self, ctx: &TenantContext, reservation_id: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        let reservation = state
            .reservations
            .get_mut(reservation_id)
            .ok_or_else(|| CoreError::NotFound(format!("reservation {reservation_id}")))?;
        ctx.guard_row(reservation.tenant_id(), reservation.business_unit_id())?;

        match reservation.status() {
            ReservationStatus::Reserved => {
                let payment_id = reservation.payment_id().to_string();
                reservation.mark_consumed();
                state.live_by_payment.remove(&payment_id);
                Ok(())
            }
            ReservationStatus::Consumed => Ok(()),
            status => Err(CoreError::Internal(format!(
                "reservation {reservation_id} is {status:?}; cannot consume"
            ))),
        }
    }

    /// RESERVED -> RELEASED: return the claimed capacity. Idempotent; a
    /// consumed or expired reservation is left untouched. Returns true
    /// when this call performed the release.
    pub fn release(
        &self,
        ctx: &TenantContext,
        reservation_id: &str,
        reason: &str,
    ) -> Result<bool, CoreError> {
        let mut state = self.state.lock().unwrap();
        let reservation = state
            .reservations
            .get(reservation_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("reservation {reservation_id}")))?;
        ctx.guard_row(reservation.tenant_id(), reservation.business_unit_id())?;

        if reservation.status() != ReservationStatus::Reserved {
            return Ok(false);
        }

        Self::return_capacity(&mut state, &reservation);
        if let Some(r) = state.reservations.get_mut(reservation_id) {
            r.mark_released();
        }
        state.live_by_payment.remove(reservation.payment_id());
        debug!(reservation_id, reason, "limit released");
        Ok(true)
    }

    /// Background sweep: expire live reservations past their TTL and return
    /// their capacity. Returns the reservations that expired.
    pub fn expire_sweep(&self) -> Vec<LedgerReservation> {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        let due: Vec<LedgerReservation> = state
            .reservations
            .values()
            .filter(|r| r.is_live() && r.is_past_expiry(now))
            .cloned()
            .collect();

        for reservation in &due {
            Self::return_capacity(&mut state, reservation);
            if let Some(r) = state.reservations.get_mut(reservation.reservation_id()) {
                r.mark_expired();
            }
            state.live_by_payment.remove(reservation.payment_id());
        }

        due
    }

    fn return_capacity(state: &mut LimitState, reservation: &LedgerReservation) {
        let ctx = TenantContext::new(reservation.tenant_id(), reservation.business_unit_id());
        let customer_id = reservation.customer_id();
        let date = reservation.reserved_at().date_naive();
        let value = reservation.amount().amount_minor();

        for (bucket, amount, count) in [
            (BucketKey::daily(date), value, 0),
            (BucketKey::monthly(date), value, 0),
            (
                BucketKey::per_type(date, reservation.payment_type()),
                value,
                0,
            ),
            (BucketKey::daily_count(date), 0, 1),
        ] {
            let key = Self::counter_key(&ctx, customer_id, bucket);
            if let Some(counter) = state.counters.get_mut(&key) {
                counter.subtract(amount, count);
            }
        }
    }

    /// Reservation lookup by id, tenant-guarded.
    pub fn reservation(
        &self,
        ctx: &TenantContext,
        reservation_id: &str,
    ) -> Result<LedgerReservation, CoreError> {
        let state = self.state.lock().unwrap();
        let reservation = state
            .reservations
            .get(reservation_id)
            .ok_or_else(|| CoreError::NotFound(format!("reservation {reservation_id}")))?;
        ctx.guard_row(reservation.tenant_id(), reservation.business_unit_id())?;
        Ok(reservation.clone())
    }

    /// Live reservation for a payment, if any.
    pub fn live_reservation_for_payment(
        &self,
        ctx: &TenantContext,
        payment_id: &str,
    ) -> Option<LedgerReservation> {
        let state = self.state.lock().unwrap();
        let reservation_id = state.live_by_payment.get(payment_id)?;
        let reservation = state.reservations.get(reservation_id)?;
        if !ctx.owns_row(reservation.tenant_id(), reservation.business_unit_id()) {
            return None;
        }
        Some(reservation.clone())
    }

    /// Current usage of one bucket (immutable read; historical buckets stay
    /// readable for reconciliation).
    pub fn bucket_usage(
        &self,
        ctx: &TenantContext,
        customer_id: &str,
        bucket: BucketKey,
    ) -> LimitCounter {
        let state = self.state.lock().unwrap();
        Self::used(&state, &Self::counter_key(ctx, customer_id, bucket))
    }

    /// Serializable snapshot of counters and reservations.
    pub fn snapshot(&self) -> LimitsSnapshot {
        LimitsSnapshot {
            state: self.state.lock().unwrap().clone(),
        }
    }

    /// Restore a snapshot, replacing current state.
    pub fn restore(&self, snapshot: LimitsSnapshot) {
        *self.state.lock().unwrap() = snapshot.state;
    }
}

impl std::fmt::Debug for LimitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitEngine")
            .field("default_limits", &self.default_limits)
            .finish_non_exhaustive()
    }
}
