//! Routing engine
//!
//! Picks a clearing system for a payment by evaluating the tenant's active
//! rules in `(priority ASC, rule_id ASC)` order. Conditions inside a rule
//! AND together in their declared order; the first fully-matching rule
//! wins. When nothing matches, the tenant default (if configured) is
//! returned as a fallback decision, otherwise `NoRouteFound`.
//!
//! Decisions are cached per `(tenant, context fingerprint)` with a TTL and
//! invalidated whenever the tenant's rules change.
//!
//! # Determinism
//!
//! Rule ordering is total and evaluation is pure over `(rules, context)`:
//! the same inputs always produce the same decision.

pub mod context;

pub use context::{FieldValue, RoutingContext};

use crate::core::{Clock, TenantContext};
use crate::error::CoreError;
use crate::models::routing_rule::{ConditionOp, RoutingRule, RuleAction, RuleCondition};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// The outcome of routing one payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub clearing_system: String,
    pub routing_priority: u8,
    pub actions: Vec<RuleAction>,

    /// True when the tenant default was used because no rule matched
    pub is_fallback: bool,

    /// Matched rule, None for fallback decisions
    pub rule_id: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedDecision {
    decision: RoutingDecision,
    cached_at: DateTime<Utc>,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Decision cache TTL; zero disables caching
    pub cache_ttl_secs: i64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 60 }
    }
}

/// Rule-driven clearing-system selection.
pub struct RoutingEngine {
    clock: Arc<dyn Clock>,
    config: RoutingConfig,
    rules: Mutex<BTreeMap<String, Vec<RoutingRule>>>,
    tenant_defaults: Mutex<BTreeMap<String, String>>,
    cache: Mutex<HashMap<(String, String), CachedDecision>>,
}

impl RoutingEngine {
    pub fn new(clock: Arc<dyn Clock>, config: RoutingConfig) -> Self {
        Self {
            clock,
            config,
            rules: Mutex::new(BTreeMap::new()),
            tenant_defaults: Mutex::new(BTreeMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Replace a tenant's rule set. Any cached decision for the tenant is
    /// invalidated.
    pub fn load_rules(&self, tenant_id: &str, rules: Vec<RoutingRule>) {
        self.rules
            .lock()
            .unwrap()
            .insert(tenant_id.to_string(), rules);
        self.cache
            .lock()
            .unwrap()
            .retain(|(tenant, _), _| tenant != tenant_id);
    }

    /// Configure the tenant's fallback clearing system.
    pub fn set_tenant_default(&self, tenant_id: &str, clearing_system: &str) {
        self.tenant_defaults
            .lock()
            .unwrap()
            .insert(tenant_id.to_string(), clearing_system.to_string());
        self.cache
            .lock()
            .unwrap()
            .retain(|(tenant, _), _| tenant != tenant_id);
    }

    /// Evaluate the rule set for one payment context.
    pub fn decide(
        &self,
        ctx: &TenantContext,
        routing_ctx: &RoutingContext,
    ) -> Result<RoutingDecision, CoreError> {
        let now = self.clock.now();
        let cache_key = (ctx.tenant_id().to_string(), routing_ctx.fingerprint());

        if self.config.cache_ttl_secs > 0 {
            let cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.get(&cache_key) {
                if now - cached.cached_at < Duration::seconds(self.config.cache_ttl_secs) {
                    return Ok(cached.decision.clone());
                }
            }
        }

        let decision = self.evaluate(ctx, routing_ctx, now)?;

        if self.config.cache_ttl_secs > 0 {
            self.cache.lock().unwrap().insert(
                cache_key,
                CachedDecision {
                    decision: decision.clone(),
                    cached_at: now,
                },
            );
        }
        Ok(decision)
    }

    fn evaluate(
        &self,
        ctx: &TenantContext,
        routing_ctx: &RoutingContext,
        now: DateTime<Utc>,
    ) -> Result<RoutingDecision, CoreError> {
        let rules = self.rules.lock().unwrap();
        let mut candidates: Vec<&RoutingRule> = rules
            .get(ctx.tenant_id())
            .map(|r| r.iter().collect())
            .unwrap_or_default();

        candidates.retain(|rule| {
            rule.participates(now) && rule.applies_to_business_unit(ctx.business_unit_id())
        });
        // Total order: identical priorities fall back to the rule id.
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });

        for rule in candidates {
            if rule
                .ordered_conditions()
                .iter()
                .all(|condition| Self::eval_condition(condition, routing_ctx))
            {
                let Some(primary) = rule.primary_action() else {
                    warn!(rule_id = %rule.rule_id, "matched rule has no actions; skipping");
                    continue;
                };
                debug!(rule_id = %rule.rule_id, clearing_system = %primary.clearing_system, "routing rule matched");
                return Ok(RoutingDecision {
                    clearing_system: primary.clearing_system.clone(),
                    routing_priority: primary.routing_priority,
                    actions: rule.actions.clone(),
                    is_fallback: false,
                    rule_id: Some(rule.rule_id.clone()),
                });
            }
        }

        if let Some(default_system) = self
            .tenant_defaults
            .lock()
            .unwrap()
            .get(ctx.tenant_id())
            .cloned()
        {
            debug!(clearing_system = %default_system, "no rule matched; tenant default used");
            return Ok(RoutingDecision {
                clearing_system: default_system,
                routing_priority: 5,
                actions: Vec::new(),
                is_fallback: true,
                rule_id: None,
            });
        }

        Err(CoreError::NoRouteFound)
    }

    /// Evaluate one condition against the context. A missing field or a
    /// type mismatch makes the condition false; a non-compiling regex is
    /// logged and fails closed.
    fn eval_condition(condition: &RuleCondition, routing_ctx: &RoutingContext) -> bool {
        let Some(field) = routing_ctx.get(&condition.field) else {
            return false;
        };

        match condition.op {
            ConditionOp::Eq => Self::values_equal(field, &condition.value),
            ConditionOp::Ne => !Self::values_equal(field, &condition.value),
            ConditionOp::Lt => Self::compare(field, &condition.value, |o| o.is_lt()),
            ConditionOp::Le => Self::compare(field, &condition.value, |o| o.is_le()),
            ConditionOp::Gt => Self::compare(field, &condition.value, |o| o.is_gt()),
            ConditionOp::Ge => Self::compare(field, &condition.value, |o| o.is_ge()),
            ConditionOp::In => Self::contained(field, &condition.value),
            ConditionOp::NotIn => {
                condition.value.is_array() && !Self::contained(field, &condition.value)
            }
            ConditionOp::MatchesRegex => {
                let (Some(text), Some(pattern)) = (field.as_text(), condition.value.as_str())
                else {
                    return false;
                };
                match regex::Regex::new(pattern) {
                    Ok(re) => re.is_match(text),
                    Err(err) => {
                        warn!(pattern, error = %err, "routing rule regex failed to compile");
                        false
                    }
                }
            }
        }
    }

    fn values_equal(field: &FieldValue, value: &serde_json::Value) -> bool {
        match field {
            FieldValue::Text(s) => value.as_str() == Some(s.as_str()),
            FieldValue::Number(n) => value.as_f64().map(|v| (v - n).abs() < f64::EPSILON) == Some(true),
            FieldValue::Flag(b) => value.as_bool() == Some(*b),
        }
    }

    fn compare(
        field: &FieldValue,
        value: &serde_json::Value,
        check: impl FnOnce(std::cmp::Ordering) -> bool,
    ) -> bool {
        let (Some(lhs), Some(rhs)) = (field.as_number(), value.as_f64()) else {
            return false;
        };
        lhs.partial_cmp(&rhs).map(check).unwrap_or(false)
    }

    fn contained(field: &FieldValue, value: &serde_json::Value) -> bool {
        let Some(items) = value.as_array() else {
            return false;
        };
        items.iter().any(|item| Self::values_equal(field, item))
    }
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
