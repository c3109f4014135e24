//! Funds hold model
//!
//! The backend-account-level analog of a limit reservation. The hold
//! reference is issued by the backend and opaque to the core.
//!
//! # Critical Invariants
//!
//! 1. At most one ACTIVE hold per payment per account
//! 2. Status transitions only ACTIVE -> {CAPTURED, RELEASED, EXPIRED}

use crate::models::payment::Money;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hold status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldStatus {
    Active,
    Captured,
    Released,
    Expired,
}

/// A claim against available funds on a backend account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundsHold {
    /// Backend-issued, opaque
    hold_ref: String,

    tenant_id: String,
    business_unit_id: String,
    account_ref: String,
    payment_id: String,
    amount: Money,
    status: HoldStatus,
    expires_at: Option<DateTime<Utc>>,
}

impl FundsHold {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hold_ref: String,
        tenant_id: String,
        business_unit_id: String,
        account_ref: String,
        payment_id: String,
        amount: Money,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            hold_ref,
            tenant_id,
            business_unit_id,
            account_ref,
            payment_id,
            amount,
            status: HoldStatus::Active,
            expires_at,
        }
    }

    pub fn hold_ref(&self) -> &str {
        &self.hold_ref
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn business_unit_id(&self) -> &str {
        &self.business_unit_id
    }

    pub fn account_ref(&self) -> &str {
        &self.account_ref
    }

    pub fn payment_id(&self) -> &str {
        &self.payment_id
    }

    pub fn amount(&self) -> &Money {
        &self.amount
    }

    pub fn status(&self) -> HoldStatus {
        self.status
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_active(&self) -> bool {
        self.status == HoldStatus::Active
    }

    /// ACTIVE -> CAPTURED. False when not active.
    pub fn mark_captured(&mut self) -> bool {
        if self.status == HoldStatus::Active {
            self.status = HoldStatus::Captured;
            true
        } else {
            false
        }
    }

    /// ACTIVE -> RELEASED.
    pub fn mark_released(&mut self) -> bool {
        if self.status == HoldStatus::Active {
            self.status = HoldStatus::Released;
            true
        } else {
            false
        }
    }

    /// ACTIVE -> EXPIRED.
    pub fn mark_expired(&mut self) -> bool {
        if self.status == HoldStatus::Active {
            self.status = HoldStatus::Expired;
            true
        } else {
            false
        }
    }
}
