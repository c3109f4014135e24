//! Fraud toggle configuration
//!
//! Multi-level enable/disable switch for fraud evaluation. The most
//! specific currently-effective active row wins; the default when no row
//! matches is enabled.

use crate::models::payment::PaymentType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One toggle row. Specificity is the number of optional dimensions set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudToggleConfig {
    pub tenant_id: String,
    pub payment_type: Option<PaymentType>,
    pub local_instrument: Option<String>,
    pub clearing_system: Option<String>,

    pub is_enabled: bool,

    /// Tie-break among rows of equal specificity (higher wins)
    pub priority: i32,

    pub effective_from: Option<DateTime<Utc>>,
    pub effective_to: Option<DateTime<Utc>>,

    /// Operator note explaining the toggle
    pub reason: Option<String>,
}

impl FraudToggleConfig {
    /// Count of set optional dimensions; higher is more specific.
    pub fn specificity(&self) -> u8 {
        let mut n = 0;
        if self.payment_type.is_some() {
            n += 1;
        }
        if self.local_instrument.is_some() {
            n += 1;
        }
        if self.clearing_system.is_some() {
            n += 1;
        }
        n
    }

    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        if let Some(from) = self.effective_from {
            if now < from {
                return false;
            }
        }
        if let Some(to) = self.effective_to {
            if now > to {
                return false;
            }
        }
        true
    }

    /// Row matches the lookup key: every set dimension must equal the
    /// corresponding key component.
    pub fn matches(
        &self,
        tenant_id: &str,
        payment_type: PaymentType,
        local_instrument: Option<&str>,
        clearing_system: Option<&str>,
    ) -> bool {
        if self.tenant_id != tenant_id {
            return false;
        }
        if let Some(pt) = self.payment_type {
            if pt != payment_type {
                return false;
            }
        }
        if let Some(li) = &self.local_instrument {
            if local_instrument != Some(li.as_str()) {
                return false;
            }
        }
        if let Some(cs) = &self.clearing_system {
            if clearing_system != Some(cs.as_str()) {
                return false;
            }
        }
        true
    }
}
