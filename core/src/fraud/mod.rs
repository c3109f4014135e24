//! Fraud toggle and score
//!
//! Two halves: a multi-level enable/disable switch resolved most-specific
//! first, and score ingestion from the external provider through the
//! resiliency kernel with a per-tenant fallback strategy when the provider
//! cannot answer.
//!
//! Score bands: LOW <= 0.3 < MEDIUM <= 0.6 < HIGH <= 0.8 < CRITICAL.

use crate::contracts::FraudScoreProvider;
use crate::core::{Clock, Deadline, TenantContext};
use crate::error::CoreError;
use crate::models::fraud_toggle::FraudToggleConfig;
use crate::models::payment::Payment;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Service name the resiliency kernel keys fraud-provider calls under.
pub const FRAUD_SCORER_SERVICE: &str = "fraud-scorer";

/// Resolution of a fraud evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FraudResolution {
    Approve,
    ApproveWithMonitoring,
    RequireVerification,
    Reject,
}

impl FraudResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            FraudResolution::Approve => "APPROVE",
            FraudResolution::ApproveWithMonitoring => "APPROVE_WITH_MONITORING",
            FraudResolution::RequireVerification => "REQUIRE_VERIFICATION",
            FraudResolution::Reject => "REJECT",
        }
    }

    /// Resolution from a normalized score by threshold band.
    pub fn from_score(score: f64) -> Self {
        if score <= 0.3 {
            FraudResolution::Approve
        } else if score <= 0.6 {
            FraudResolution::ApproveWithMonitoring
        } else if score <= 0.8 {
            FraudResolution::RequireVerification
        } else {
            FraudResolution::Reject
        }
    }

    /// Whether this resolution lets the payment continue.
    pub fn allows_payment(&self) -> bool {
        matches!(
            self,
            FraudResolution::Approve | FraudResolution::ApproveWithMonitoring
        )
    }
}

/// Behavior when the scorer is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudFallbackStrategy {
    /// Approve with monitoring
    FailOpen,

    /// Reject
    FailClosed,

    /// Compute a score from internal velocity / amount heuristics
    RuleBased,
}

/// Rule-based fallback tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudRuleConfig {
    /// Amount at which the amount factor saturates
    pub high_amount_minor: i64,

    /// Submissions inside the window at which velocity saturates
    pub velocity_ceiling: u32,

    /// Velocity observation window
    pub velocity_window_secs: i64,
}

impl Default for FraudRuleConfig {
    fn default() -> Self {
        Self {
            high_amount_minor: 10_000_000,
            velocity_ceiling: 10,
            velocity_window_secs: 3_600,
        }
    }
}

/// Outcome of one fraud evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct FraudDecision {
    pub resolution: FraudResolution,
    pub score: Option<f64>,

    /// True when the provider was unavailable and a fallback decided
    pub fallback_used: bool,
}

/// The fraud evaluation service.
pub struct FraudService {
    clock: Arc<dyn Clock>,
    kernel: Arc<crate::resilience::ResilienceKernel>,
    provider: Arc<dyn FraudScoreProvider>,
    rule_config: FraudRuleConfig,
    toggles: Mutex<Vec<FraudToggleConfig>>,
    tenant_fallbacks: Mutex<BTreeMap<String, FraudFallbackStrategy>>,
    recent_submissions: Mutex<BTreeMap<(String, String), Vec<DateTime<Utc>>>>,
}

impl FraudService {
    pub fn new(
        clock: Arc<dyn Clock>,
        kernel: Arc<crate::resilience::ResilienceKernel>,
        provider: Arc<dyn FraudScoreProvider>,
        rule_config: FraudRuleConfig,
    ) -> Self {
        Self {
            clock,
            kernel,
            provider,
            rule_config,
            toggles: Mutex::new(Vec::new()),
            tenant_fallbacks: Mutex::new(BTreeMap::new()),
            recent_submissions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Replace the toggle rows.
    pub fn load_toggles(&self, toggles: Vec<FraudToggleConfig>) {
        *self.toggles.lock().unwrap() = toggles;
    }

    /// Configure a tenant's fallback strategy (default: fail-open).
    pub fn set_tenant_fallback(&self, tenant_id: &str, strategy: FraudFallbackStrategy) {
        self.tenant_fallbacks
            .lock()
            .unwrap()
            .insert(tenant_id.to_string(), strategy);
    }

    fn fallback_for(&self, tenant_id: &str) -> FraudFallbackStrategy {
        self.tenant_fallbacks
            .lock()
            .unwrap()
            .get(tenant_id)
            .copied()
            .unwrap_or(FraudFallbackStrategy::FailOpen)
    }

    /// Resolve the toggle for a lookup key: most specific wins, ties break
    /// on priority then the latest effective_from. Default is enabled.
    pub fn is_enabled(&self, ctx: &TenantContext, payment: &Payment, clearing_system: Option<&str>) -> bool {
        let now = self.clock.now();
        let toggles = self.toggles.lock().unwrap();
        toggles
            .iter()
            .filter(|t| {
                t.is_effective(now)
                    && t.matches(
                        ctx.tenant_id(),
                        payment.payment_type(),
                        payment.local_instrument(),
                        clearing_system,
                    )
            })
            .max_by_key(|t| (t.specificity(), t.priority, t.effective_from))
            .map(|t| t.is_enabled)
            .unwrap_or(true)
    }

    /// Evaluate a payment. When the toggle disables evaluation the payment
    /// is approved without a score.
    pub fn evaluate(
        &self,
        ctx: &TenantContext,
        payment: &Payment,
        deadline: Deadline,
    ) -> Result<FraudDecision, CoreError> {
        self.record_submission(ctx, payment.customer_id());

        if !self.is_enabled(ctx, payment, None) {
            debug!(payment_id = payment.payment_id(), "fraud evaluation disabled by toggle");
            return Ok(FraudDecision {
                resolution: FraudResolution::Approve,
                score: None,
                fallback_used: false,
            });
        }

        let provider = self.provider.clone();
        let strategy = self.fallback_for(ctx.tenant_id());
        self.kernel.call_with_fallback(
            FRAUD_SCORER_SERVICE,
            ctx,
            deadline,
            &mut |attempt_deadline| {
                let score = provider.score(ctx, payment, attempt_deadline)?;
                Ok(FraudDecision {
                    resolution: FraudResolution::from_score(score),
                    score: Some(score),
                    fallback_used: false,
                })
            },
            |err| {
                warn!(
                    payment_id = payment.payment_id(),
                    error = %err,
                    strategy = ?strategy,
                    "fraud scorer unavailable; applying fallback"
                );
                Ok(self.apply_fallback(ctx, payment, strategy))
            },
        )
    }

    fn apply_fallback(
        &self,
        ctx: &TenantContext,
        payment: &Payment,
        strategy: FraudFallbackStrategy,
    ) -> FraudDecision {
        match strategy {
            FraudFallbackStrategy::FailOpen => FraudDecision {
                resolution: FraudResolution::ApproveWithMonitoring,
                score: None,
                fallback_used: true,
            },
            FraudFallbackStrategy::FailClosed => FraudDecision {
                resolution: FraudResolution::Reject,
                score: None,
                fallback_used: true,
            },
            FraudFallbackStrategy::RuleBased => {
                let score = self.computed_score(ctx, payment);
                FraudDecision {
                    resolution: FraudResolution::from_score(score),
                    score: Some(score),
                    fallback_used: true,
                }
            }
        }
    }

    /// Internal score: amount pressure plus submission velocity, each
    /// saturating at 1.0.
    fn computed_score(&self, ctx: &TenantContext, payment: &Payment) -> f64 {
        let amount_factor = (payment.amount().amount_minor() as f64
            / self.rule_config.high_amount_minor.max(1) as f64)
            .min(1.0);
        let velocity_factor =
            (self.recent_count(ctx, payment.customer_id()) as f64
                / self.rule_config.velocity_ceiling.max(1) as f64)
                .min(1.0);
        (0.6 * amount_factor + 0.4 * velocity_factor).clamp(0.0, 1.0)
    }

    fn record_submission(&self, ctx: &TenantContext, customer_id: &str) {
        let now = self.clock.now();
        let window = Duration::seconds(self.rule_config.velocity_window_secs);
        let mut recent = self.recent_submissions.lock().unwrap();
        let samples = recent
            .entry((ctx.tenant_id().to_string(), customer_id.to_string()))
            .or_default();
        samples.push(now);
        samples.retain(|t| now - *t <= window);
    }

    fn recent_count(&self, ctx: &TenantContext, customer_id: &str) -> usize {
        self.recent_submissions
            .lock()
            .unwrap()
            .get(&(ctx.tenant_id().to_string(), customer_id.to_string()))
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for FraudService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FraudService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_bands_map_to_resolutions() {
        assert_eq!(FraudResolution::from_score(0.0), FraudResolution::Approve);
        assert_eq!(FraudResolution::from_score(0.3), FraudResolution::Approve);
        assert_eq!(
            FraudResolution::from_score(0.31),
            FraudResolution::ApproveWithMonitoring
        );
        assert_eq!(
            FraudResolution::from_score(0.7),
            FraudResolution::RequireVerification
        );
        assert_eq!(FraudResolution::from_score(0.81), FraudResolution::Reject);
    }

    #[test]
    fn only_approving_resolutions_allow_payment() {
        assert!(FraudResolution::Approve.allows_payment());
        assert!(FraudResolution::ApproveWithMonitoring.allows_payment());
        assert!(!FraudResolution::RequireVerification.allows_payment());
        assert!(!FraudResolution::Reject.allows_payment());
    }
}
