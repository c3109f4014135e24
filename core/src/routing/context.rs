//! Routing evaluation context
//!
//! Builds the field map rule conditions evaluate against. Fields come from
//! the payment, the tenant context and caller metadata; tenant-level flags
//! can be merged in at decision time.
//!
//! # Field Catalog
//!
//! **Payment fields**: amount (minor units), currency, payment_type,
//! local_instrument, urgency, debit_account_type, credit_account_type
//!
//! **Tenant fields**: tenant_id, business_unit_id, plus any flag merged via
//! `with_flag` / `with_field`

use crate::core::TenantContext;
use crate::models::payment::Payment;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A field value in the routing context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Flag(bool),
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Flag(b) => Some(if *b { 1.0 } else { 0.0 }),
            FieldValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Immutable field map for one routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingContext {
    fields: BTreeMap<String, FieldValue>,
}

impl RoutingContext {
    /// Build the standard field set from a payment.
    pub fn from_payment(payment: &Payment, ctx: &TenantContext) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            "amount".to_string(),
            FieldValue::Number(payment.amount().amount_minor() as f64),
        );
        fields.insert(
            "currency".to_string(),
            FieldValue::Text(payment.amount().currency().to_string()),
        );
        fields.insert(
            "payment_type".to_string(),
            FieldValue::Text(payment.payment_type().as_str().to_string()),
        );
        if let Some(li) = payment.local_instrument() {
            fields.insert(
                "local_instrument".to_string(),
                FieldValue::Text(li.to_string()),
            );
        }
        fields.insert(
            "tenant_id".to_string(),
            FieldValue::Text(ctx.tenant_id().to_string()),
        );
        fields.insert(
            "business_unit_id".to_string(),
            FieldValue::Text(ctx.business_unit_id().to_string()),
        );
        Self { fields }
    }

    /// Empty context for hand-built test scenarios.
    pub fn empty() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    /// Merge an arbitrary field (builder style).
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Merge a tenant-level flag.
    pub fn with_flag(self, name: impl Into<String>, value: bool) -> Self {
        self.with_field(name, FieldValue::Flag(value))
    }

    /// Merge a numeric field (urgency, account-type codes, ...).
    pub fn with_number(self, name: impl Into<String>, value: f64) -> Self {
        self.with_field(name, FieldValue::Number(value))
    }

    /// Merge a text field.
    pub fn with_text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_field(name, FieldValue::Text(value.into()))
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Stable content hash used as the decision-cache key. The field map
    /// is ordered, so equal contexts always hash equal.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.fields {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            match value {
                FieldValue::Number(n) => hasher.update(n.to_le_bytes()),
                FieldValue::Text(s) => hasher.update(s.as_bytes()),
                FieldValue::Flag(b) => hasher.update([u8::from(*b)]),
            }
            hasher.update(b";");
        }
        format!("{:x}", hasher.finalize())
    }
}
