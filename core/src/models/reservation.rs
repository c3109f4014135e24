//! Limit reservation model
//!
//! A time-bounded claim against a customer's limit buckets. Becomes
//! permanent on consume, or returns its capacity on release/expiry.
//!
//! # Critical Invariants
//!
//! 1. At most one non-terminal reservation per payment
//! 2. Status transitions only RESERVED -> {CONSUMED, RELEASED, EXPIRED}
//! 3. `expires_at == now` counts as expired

use crate::models::payment::{Money, PaymentType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reservation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Reserved,
    Consumed,
    Released,
    Expired,
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Reserved)
    }
}

/// A live or settled claim against limit capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerReservation {
    reservation_id: String,
    tenant_id: String,
    business_unit_id: String,
    customer_id: String,

    /// One reservation per payment
    payment_id: String,

    amount: Money,
    payment_type: PaymentType,
    status: ReservationStatus,
    reserved_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LedgerReservation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reservation_id: String,
        tenant_id: String,
        business_unit_id: String,
        customer_id: String,
        payment_id: String,
        amount: Money,
        payment_type: PaymentType,
        reserved_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            reservation_id,
            tenant_id,
            business_unit_id,
            customer_id,
            payment_id,
            amount,
            payment_type,
            status: ReservationStatus::Reserved,
            reserved_at,
            expires_at,
        }
    }

    pub fn reservation_id(&self) -> &str {
        &self.reservation_id
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

    pub fn payment_id(&self) -> &str {
        &self.payment_id
    }

    pub fn amount(&self) -> &Money {
        &self.amount
    }

    pub fn payment_type(&self) -> PaymentType {
        self.payment_type
    }

    pub fn status(&self) -> ReservationStatus {
        self.status
    }

    pub fn reserved_at(&self) -> DateTime<Utc> {
        self.reserved_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_live(&self) -> bool {
        self.status == ReservationStatus::Reserved
    }

    /// A reservation whose expiry equals `now` is already expired.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// RESERVED -> CONSUMED. Returns false when already terminal (the
    /// caller treats that as an idempotent no-op or an error by context).
    pub fn mark_consumed(&mut self) -> bool {
        if self.status == ReservationStatus::Reserved {
            self.status = ReservationStatus::Consumed;
            true
        } else {
            false
        }
    }

    /// RESERVED -> RELEASED.
    pub fn mark_released(&mut self) -> bool {
        if self.status == ReservationStatus::Reserved {
            self.status = ReservationStatus::Released;
            true
        } else {
            false
        }
    }

    /// RESERVED -> EXPIRED.
    pub fn mark_expired(&mut self) -> bool {
        if self.status == ReservationStatus::Reserved {
            self.status = ReservationStatus::Expired;
            true
        } else {
            false
        }
    }
}
