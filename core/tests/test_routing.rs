//! Routing engine tests
//!
//! Determinism, effective windows, operator coverage, caching.

use chrono::{Duration, TimeZone, Utc};
use payment_orchestration_core::core::{Clock, ManualClock, TenantContext};
use payment_orchestration_core::error::CoreError;
use payment_orchestration_core::models::routing_rule::{
    ConditionOp, RoutingRule, RuleAction, RuleCondition, RuleStatus,
};
use payment_orchestration_core::routing::{RoutingConfig, RoutingContext, RoutingEngine};
use std::sync::Arc;

fn engine() -> (Arc<ManualClock>, RoutingEngine) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap(),
    ));
    let engine = RoutingEngine::new(clock.clone(), RoutingConfig { cache_ttl_secs: 0 });
    (clock, engine)
}

fn ctx() -> TenantContext {
    TenantContext::new("T1", "B1")
}

fn rule(rule_id: &str, priority: i32, conditions: Vec<RuleCondition>, system: &str) -> RoutingRule {
    RoutingRule {
        rule_id: rule_id.to_string(),
        tenant_id: "T1".to_string(),
        business_unit_id: None,
        priority,
        conditions,
        actions: vec![RuleAction {
            clearing_system: system.to_string(),
            routing_priority: 5,
            is_primary: true,
        }],
        effective_from: None,
        effective_to: None,
        status: RuleStatus::Active,
    }
}

fn condition(field: &str, op: ConditionOp, value: serde_json::Value, order: u32) -> RuleCondition {
    RuleCondition {
        field: field.to_string(),
        op,
        value,
        order,
    }
}

#[test]
fn decisions_are_reproducible_for_the_same_inputs() {
    let (_, engine) = engine();
    engine.load_rules(
        "T1",
        vec![
            rule(
                "rule_high_value",
                10,
                vec![condition("amount", ConditionOp::Gt, serde_json::json!(5_000_000), 1)],
                "RTGS",
            ),
            rule(
                "rule_urgent",
                20,
                vec![condition("urgency", ConditionOp::Ge, serde_json::json!(8), 1)],
                "RTC",
            ),
            rule("rule_rest", 30, vec![], "EFT"),
        ],
    );

    let routing_ctx = RoutingContext::empty()
        .with_number("amount", 1_000_000.0)
        .with_number("urgency", 9.0);

    let first = engine.decide(&ctx(), &routing_ctx).unwrap();
    for _ in 0..10 {
        let again = engine.decide(&ctx(), &routing_ctx).unwrap();
        assert_eq!(again, first, "same rules + same context must reproduce");
    }
    assert_eq!(first.clearing_system, "RTC");
    assert_eq!(first.rule_id.as_deref(), Some("rule_urgent"));
}

#[test]
fn conditions_within_a_rule_compose_with_and() {
    let (_, engine) = engine();
    engine.load_rules(
        "T1",
        vec![rule(
            "rule_both",
            10,
            vec![
                condition("currency", ConditionOp::Eq, serde_json::json!("ZAR"), 1),
                condition("amount", ConditionOp::Le, serde_json::json!(1_000_000), 2),
            ],
            "RTC",
        )],
    );

    // Only one condition holds: no match.
    let partial = RoutingContext::empty()
        .with_text("currency", "ZAR")
        .with_number("amount", 2_000_000.0);
    assert_eq!(
        engine.decide(&ctx(), &partial).unwrap_err(),
        CoreError::NoRouteFound
    );

    let both = RoutingContext::empty()
        .with_text("currency", "ZAR")
        .with_number("amount", 500_000.0);
    assert!(engine.decide(&ctx(), &both).is_ok());
}

#[test]
fn effective_window_excludes_rules_as_the_clock_moves() {
    let (clock, engine) = engine();
    let mut windowed = rule("rule_window", 10, vec![], "RTC");
    windowed.effective_from = Some(clock.now() + Duration::days(1));
    windowed.effective_to = Some(clock.now() + Duration::days(2));
    engine.load_rules("T1", vec![windowed, rule("rule_always", 20, vec![], "EFT")]);

    // Before the window.
    assert_eq!(
        engine.decide(&ctx(), &RoutingContext::empty()).unwrap().clearing_system,
        "EFT"
    );

    // Inside the window the higher-priority rule takes over.
    clock.advance(Duration::days(1));
    assert_eq!(
        engine.decide(&ctx(), &RoutingContext::empty()).unwrap().clearing_system,
        "RTC"
    );

    // Past the window it drops out again.
    clock.advance(Duration::days(2));
    assert_eq!(
        engine.decide(&ctx(), &RoutingContext::empty()).unwrap().clearing_system,
        "EFT"
    );
}

#[test]
fn not_in_and_ne_operators() {
    let (_, engine) = engine();
    engine.load_rules(
        "T1",
        vec![rule(
            "rule_not_wallet",
            10,
            vec![
                condition(
                    "payment_type",
                    ConditionOp::NotIn,
                    serde_json::json!(["WALLET", "CARD"]),
                    1,
                ),
                condition("currency", ConditionOp::Ne, serde_json::json!("USD"), 2),
            ],
            "EFT",
        )],
    );

    let eligible = RoutingContext::empty()
        .with_text("payment_type", "EFT")
        .with_text("currency", "ZAR");
    assert!(engine.decide(&ctx(), &eligible).is_ok());

    let wallet = RoutingContext::empty()
        .with_text("payment_type", "WALLET")
        .with_text("currency", "ZAR");
    assert!(engine.decide(&ctx(), &wallet).is_err());
}

#[test]
fn invalid_regex_fails_closed_instead_of_matching() {
    let (_, engine) = engine();
    engine.load_rules(
        "T1",
        vec![
            rule(
                "rule_bad_regex",
                10,
                vec![condition(
                    "local_instrument",
                    ConditionOp::MatchesRegex,
                    serde_json::json!("[unclosed"),
                    1,
                )],
                "RTGS",
            ),
            rule("rule_fallback", 20, vec![], "EFT"),
        ],
    );

    let routing_ctx = RoutingContext::empty().with_text("local_instrument", "[unclosed");
    let decision = engine.decide(&ctx(), &routing_ctx).unwrap();
    assert_eq!(
        decision.clearing_system, "EFT",
        "a non-compiling pattern must never match"
    );
}

#[test]
fn missing_field_makes_the_condition_false() {
    let (_, engine) = engine();
    engine.load_rules(
        "T1",
        vec![
            rule(
                "rule_needs_urgency",
                10,
                vec![condition("urgency", ConditionOp::Ge, serde_json::json!(5), 1)],
                "RTC",
            ),
            rule("rule_rest", 20, vec![], "EFT"),
        ],
    );

    let decision = engine.decide(&ctx(), &RoutingContext::empty()).unwrap();
    assert_eq!(decision.clearing_system, "EFT");
}

#[test]
fn cached_decision_expires_with_its_ttl() {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap(),
    ));
    let engine = RoutingEngine::new(clock.clone(), RoutingConfig { cache_ttl_secs: 60 });
    let mut windowed = rule("rule_short", 10, vec![], "RTC");
    windowed.effective_to = Some(clock.now() + Duration::seconds(30));
    engine.load_rules("T1", vec![windowed, rule("rule_rest", 20, vec![], "EFT")]);

    assert_eq!(
        engine.decide(&ctx(), &RoutingContext::empty()).unwrap().clearing_system,
        "RTC"
    );

    // Within the TTL the cached decision is served even though the rule
    // has lapsed; after the TTL the engine re-evaluates.
    clock.advance(Duration::seconds(45));
    assert_eq!(
        engine.decide(&ctx(), &RoutingContext::empty()).unwrap().clearing_system,
        "RTC",
        "cache still fresh"
    );
    clock.advance(Duration::seconds(30));
    assert_eq!(
        engine.decide(&ctx(), &RoutingContext::empty()).unwrap().clearing_system,
        "EFT",
        "cache expired; lapsed rule no longer matches"
    );
}
