//! Routing rule model
//!
//! Tenant-scoped, priority-ordered rules mapping payment attributes to a
//! clearing system. Rules are owned by a configuration administrator; the
//! core only reads them.
//!
//! Evaluation order is `(priority ASC, rule_id ASC)` for a total,
//! reproducible ordering. Only ACTIVE rules inside their effective window
//! participate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Condition operator
///
/// Serialized with the operator symbols used in rule documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOp {
    #[serde(rename = "=")]
    Eq,

    #[serde(rename = "!=")]
    Ne,

    #[serde(rename = "<")]
    Lt,

    #[serde(rename = "<=")]
    Le,

    #[serde(rename = ">")]
    Gt,

    #[serde(rename = ">=")]
    Ge,

    #[serde(rename = "in")]
    In,

    #[serde(rename = "not_in")]
    NotIn,

    #[serde(rename = "matches_regex")]
    MatchesRegex,
}

/// One condition inside a rule. Conditions compose with AND, evaluated in
/// `order` ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Field reference into the routing context (amount, currency,
    /// payment_type, local_instrument, urgency, ...)
    pub field: String,

    pub op: ConditionOp,

    /// Comparison value; arrays for `in` / `not_in`
    pub value: serde_json::Value,

    /// Evaluation position within the rule
    pub order: u32,
}

/// Action produced by a matched rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    /// Clearing system to submit through
    pub clearing_system: String,

    /// Priority hint forwarded to the clearing adapter
    pub routing_priority: u8,

    /// Marks the action used for the decision's clearing system
    pub is_primary: bool,
}

/// Rule status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStatus {
    Active,
    Inactive,
    Draft,
}

/// A tenant's routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub rule_id: String,
    pub tenant_id: String,

    /// None = tenant-wide fallback scope
    pub business_unit_id: Option<String>,

    /// Lower evaluates earlier
    pub priority: i32,

    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,

    pub effective_from: Option<DateTime<Utc>>,
    pub effective_to: Option<DateTime<Utc>>,

    pub status: RuleStatus,
}

impl RoutingRule {
    /// ACTIVE and inside the effective window.
    pub fn participates(&self, now: DateTime<Utc>) -> bool {
        if self.status != RuleStatus::Active {
            return false;
        }
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

    /// Scope check: rule applies to the business unit, or is tenant-wide.
    pub fn applies_to_business_unit(&self, business_unit_id: &str) -> bool {
        match &self.business_unit_id {
            Some(bu) => bu == business_unit_id,
            None => true,
        }
    }

    /// Conditions sorted by their declared evaluation order.
    pub fn ordered_conditions(&self) -> Vec<&RuleCondition> {
        let mut conditions: Vec<&RuleCondition> = self.conditions.iter().collect();
        conditions.sort_by_key(|c| c.order);
        conditions
    }

    /// The action carrying the clearing decision: the primary action, or
    /// the first action when none is marked primary.
    pub fn primary_action(&self) -> Option<&RuleAction> {
        self.actions
            .iter()
            .find(|a| a.is_primary)
            .or_else(|| self.actions.first())
    }
}
