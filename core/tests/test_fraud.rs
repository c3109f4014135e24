//! Fraud toggle and scoring tests
//!
//! Most-specific-wins toggle resolution, score banding through the saga,
//! and the three fallback strategies when the scorer is unreachable.

mod common;

use common::{ctx, Fixture};
use payment_orchestration_core::fraud::FraudFallbackStrategy;
use payment_orchestration_core::models::fraud_toggle::FraudToggleConfig;
use payment_orchestration_core::models::payment::{PaymentStatus, PaymentType};
use payment_orchestration_core::models::saga::SagaStatus;

fn toggle(
    payment_type: Option<PaymentType>,
    local_instrument: Option<&str>,
    is_enabled: bool,
    priority: i32,
) -> FraudToggleConfig {
    FraudToggleConfig {
        tenant_id: "T1".to_string(),
        payment_type,
        local_instrument: local_instrument.map(|s| s.to_string()),
        clearing_system: None,
        is_enabled,
        priority,
        effective_from: None,
        effective_to: None,
        reason: None,
    }
}

#[test]
fn critical_score_rejects_the_payment() {
    let fixture = Fixture::new();
    fixture.fraud.set_score(0.95);

    let payment_id = fixture.submit_and_drive(100_000, PaymentType::Rtc);
    let status = fixture
        .orchestrator
        .query_status(&ctx(), &payment_id)
        .unwrap();
    assert_eq!(status.saga_status, SagaStatus::Rejected);
    assert!(fixture.event_types(&payment_id).contains(&"FraudRejected"));
}

#[test]
fn medium_score_approves_with_monitoring() {
    let fixture = Fixture::new();
    fixture.fraud.set_score(0.5);

    let payment_id = fixture.submit_and_drive(100_000, PaymentType::Rtc);
    let status = fixture
        .orchestrator
        .query_status(&ctx(), &payment_id)
        .unwrap();
    assert_eq!(status.status, PaymentStatus::Completed);
}

#[test]
fn most_specific_toggle_wins() {
    let fixture = Fixture::new();
    // Tenant-wide: disabled. RTC specifically: enabled.
    fixture.orchestrator.fraud().load_toggles(vec![
        toggle(None, None, false, 0),
        toggle(Some(PaymentType::Rtc), None, true, 0),
    ]);
    fixture.fraud.set_score(0.95);

    // RTC evaluates (specific row) and the critical score rejects.
    let rtc = fixture.submit_and_drive(100_000, PaymentType::Rtc);
    assert_eq!(
        fixture.orchestrator.query_status(&ctx(), &rtc).unwrap().saga_status,
        SagaStatus::Rejected
    );

    // EFT falls to the tenant-wide disable: no scoring, payment proceeds.
    let eft = fixture
        .orchestrator
        .submit_payment(fixture.request(100_000, PaymentType::Eft))
        .unwrap();
    fixture.orchestrator.drive(&ctx(), &eft.payment_id).unwrap();
    let events = fixture.event_types(&eft.payment_id);
    assert!(events.contains(&"FraudApproved"));
    let approved = fixture
        .orchestrator
        .events_for_payment(&ctx(), &eft.payment_id)
        .unwrap()
        .into_iter()
        .find(|e| e.event_type() == "FraudApproved")
        .unwrap();
    match &approved.body {
        payment_orchestration_core::models::event::EventBody::FraudApproved { score, .. } => {
            assert!(score.is_none(), "disabled evaluation must not score");
        }
        other => panic!("unexpected body {other:?}"),
    }
}

#[test]
fn equal_specificity_resolves_by_priority() {
    let fixture = Fixture::new();
    fixture.orchestrator.fraud().load_toggles(vec![
        toggle(Some(PaymentType::Rtc), None, false, 1),
        toggle(Some(PaymentType::Rtc), None, true, 10),
    ]);
    fixture.fraud.set_score(0.95);

    let payment_id = fixture.submit_and_drive(100_000, PaymentType::Rtc);
    assert_eq!(
        fixture
            .orchestrator
            .query_status(&ctx(), &payment_id)
            .unwrap()
            .saga_status,
        SagaStatus::Rejected,
        "the higher-priority enabled row must win"
    );
}

#[test]
fn fail_open_fallback_approves_with_monitoring() {
    let fixture = Fixture::new();
    fixture.fraud.set_unavailable();
    fixture
        .orchestrator
        .fraud()
        .set_tenant_fallback("T1", FraudFallbackStrategy::FailOpen);

    let payment_id = fixture.submit_and_drive(100_000, PaymentType::Rtc);
    assert_eq!(
        fixture
            .orchestrator
            .query_status(&ctx(), &payment_id)
            .unwrap()
            .status,
        PaymentStatus::Completed
    );
}

#[test]
fn fail_closed_fallback_rejects() {
    let fixture = Fixture::new();
    fixture.fraud.set_unavailable();
    fixture
        .orchestrator
        .fraud()
        .set_tenant_fallback("T1", FraudFallbackStrategy::FailClosed);

    let payment_id = fixture.submit_and_drive(100_000, PaymentType::Rtc);
    assert_eq!(
        fixture
            .orchestrator
            .query_status(&ctx(), &payment_id)
            .unwrap()
            .saga_status,
        SagaStatus::Rejected
    );
}

#[test]
fn rule_based_fallback_scores_small_payments_through() {
    let fixture = Fixture::new();
    fixture.fraud.set_unavailable();
    fixture
        .orchestrator
        .fraud()
        .set_tenant_fallback("T1", FraudFallbackStrategy::RuleBased);

    // Small amount, low velocity: the computed score lands in a passing
    // band.
    let payment_id = fixture.submit_and_drive(100_000, PaymentType::Rtc);
    assert_eq!(
        fixture
            .orchestrator
            .query_status(&ctx(), &payment_id)
            .unwrap()
            .status,
        PaymentStatus::Completed
    );
}
