//! Limit reservation engine tests
//!
//! Covers the serializability guarantee (competing reserves never
//! oversubscribe a bucket), idempotent consume/release, expiry, and the
//! counter round-trip properties.

use chrono::{Duration, TimeZone, Utc};
use payment_orchestration_core::core::{Clock, ManualClock, TenantContext};
use payment_orchestration_core::error::CoreError;
use payment_orchestration_core::limits::{BucketKey, LimitConfig, LimitDimension, LimitEngine};
use payment_orchestration_core::models::payment::{Money, PaymentType};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

const DAILY_LIMIT: i64 = 10_000_000;

fn engine_with_daily(daily_limit: i64) -> (Arc<ManualClock>, Arc<LimitEngine>) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap(),
    ));
    let engine = Arc::new(LimitEngine::new(
        clock.clone(),
        LimitConfig {
            daily_limit,
            monthly_limit: daily_limit * 5,
            per_transaction_limit: daily_limit,
            per_type_daily_limits: BTreeMap::new(),
            daily_count_limit: 1_000,
            reservation_ttl_secs: 30 * 60,
        },
    ));
    (clock, engine)
}

fn ctx() -> TenantContext {
    TenantContext::new("T1", "B1")
}

fn zar(amount: i64) -> Money {
    Money::new(amount, "ZAR")
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn competing_reserves_never_oversubscribe() {
    // Two concurrent reserves totaling limit + 1 must not both succeed.
    let (_, engine) = engine_with_daily(DAILY_LIMIT);

    let handles: Vec<_> = [("pay_a", 6_000_000i64), ("pay_b", 4_000_001i64)]
        .into_iter()
        .map(|(payment_id, amount)| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                engine.reserve(
                    &ctx(),
                    format!("res_{payment_id}"),
                    payment_id,
                    "C1",
                    &zar(amount),
                    PaymentType::Rtc,
                )
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one reserve may win: {results:?}");

    let today = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap().date_naive();
    let used = engine
        .bucket_usage(&ctx(), "C1", BucketKey::daily(today))
        .used_amount;
    assert!(used <= DAILY_LIMIT, "bucket oversubscribed: {used}");
}

#[test]
fn many_small_reserves_respect_the_limit_under_contention() {
    // 20 threads each try to reserve 1/10th of the limit.
    let (_, engine) = engine_with_daily(DAILY_LIMIT);
    let slice = DAILY_LIMIT / 10;

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                engine.reserve(
                    &ctx(),
                    format!("res_{i}"),
                    &format!("pay_{i}"),
                    "C1",
                    &zar(slice),
                    PaymentType::Rtc,
                )
            })
        })
        .collect();

    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|r| r.is_ok())
        .count();
    assert_eq!(successes, 10, "exactly the limit's worth may reserve");
}

// ============================================================================
// Boundaries
// ============================================================================

#[test]
fn reserve_exactly_at_limit_then_any_amount_rejected() {
    let (_, engine) = engine_with_daily(DAILY_LIMIT);
    engine
        .reserve(&ctx(), "res_1".into(), "pay_1", "C1", &zar(DAILY_LIMIT), PaymentType::Rtc)
        .unwrap();

    let err = engine
        .reserve(&ctx(), "res_2".into(), "pay_2", "C1", &zar(1), PaymentType::Rtc)
        .unwrap_err();
    assert_eq!(
        err,
        CoreError::LimitExceeded {
            dimension: LimitDimension::Daily
        }
    );
}

#[test]
fn per_type_bucket_is_independent_of_the_daily_bucket() {
    let (clock, engine) = engine_with_daily(DAILY_LIMIT);
    engine.set_customer_limits(
        &ctx(),
        "C1",
        LimitConfig {
            daily_limit: DAILY_LIMIT,
            monthly_limit: DAILY_LIMIT * 5,
            per_transaction_limit: DAILY_LIMIT,
            per_type_daily_limits: [(PaymentType::Rtc, 1_000_000)].into_iter().collect(),
            daily_count_limit: 1_000,
            reservation_ttl_secs: 30 * 60,
        },
    );

    // RTC capped at R10,000 even though the daily bucket has room.
    let err = engine
        .reserve(&ctx(), "res_1".into(), "pay_1", "C1", &zar(2_000_000), PaymentType::Rtc)
        .unwrap_err();
    assert_eq!(
        err,
        CoreError::LimitExceeded {
            dimension: LimitDimension::PerType
        }
    );

    // The same amount as EFT is fine.
    engine
        .reserve(&ctx(), "res_2".into(), "pay_2", "C1", &zar(2_000_000), PaymentType::Eft)
        .unwrap();
    let today = clock.now().date_naive();
    assert_eq!(
        engine
            .bucket_usage(&ctx(), "C1", BucketKey::per_type(today, PaymentType::Eft))
            .used_amount,
        2_000_000
    );
}

#[test]
fn count_limit_rejects_when_exhausted() {
    let (_, engine) = engine_with_daily(DAILY_LIMIT);
    engine.set_customer_limits(
        &ctx(),
        "C1",
        LimitConfig {
            daily_limit: DAILY_LIMIT,
            monthly_limit: DAILY_LIMIT * 5,
            per_transaction_limit: DAILY_LIMIT,
            per_type_daily_limits: BTreeMap::new(),
            daily_count_limit: 2,
            reservation_ttl_secs: 30 * 60,
        },
    );

    engine
        .reserve(&ctx(), "res_1".into(), "pay_1", "C1", &zar(100), PaymentType::Rtc)
        .unwrap();
    engine
        .reserve(&ctx(), "res_2".into(), "pay_2", "C1", &zar(100), PaymentType::Rtc)
        .unwrap();
    let err = engine
        .reserve(&ctx(), "res_3".into(), "pay_3", "C1", &zar(100), PaymentType::Rtc)
        .unwrap_err();
    assert_eq!(
        err,
        CoreError::LimitExceeded {
            dimension: LimitDimension::DailyCount
        }
    );
}

#[test]
fn expiry_sweep_returns_capacity_at_the_boundary_instant() {
    let (clock, engine) = engine_with_daily(DAILY_LIMIT);
    engine
        .reserve(&ctx(), "res_1".into(), "pay_1", "C1", &zar(1_000), PaymentType::Rtc)
        .unwrap();

    // One second early: nothing expires.
    clock.advance(Duration::minutes(30) - Duration::seconds(1));
    assert!(engine.expire_sweep().is_empty());

    // At exactly expires_at the reservation is expired.
    clock.advance(Duration::seconds(1));
    let expired = engine.expire_sweep();
    assert_eq!(expired.len(), 1);

    // The payment may reserve again afterwards.
    engine
        .reserve(&ctx(), "res_2".into(), "pay_1", "C1", &zar(1_000), PaymentType::Rtc)
        .unwrap();
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// reserve(p); release(p) leaves every counter at its pre-reserve
    /// value.
    #[test]
    fn reserve_release_restores_counters(amount in 1i64..DAILY_LIMIT) {
        let (clock, engine) = engine_with_daily(DAILY_LIMIT);
        let today = clock.now().date_naive();
        let buckets = [
            BucketKey::daily(today),
            BucketKey::monthly(today),
            BucketKey::per_type(today, PaymentType::Rtc),
            BucketKey::daily_count(today),
        ];
        let before: Vec<_> = buckets
            .iter()
            .map(|b| engine.bucket_usage(&ctx(), "C1", b.clone()))
            .collect();

        engine
            .reserve(&ctx(), "res_1".into(), "pay_1", "C1", &zar(amount), PaymentType::Rtc)
            .unwrap();
        engine.release(&ctx(), "res_1", "property test").unwrap();

        let after: Vec<_> = buckets
            .iter()
            .map(|b| engine.bucket_usage(&ctx(), "C1", b.clone()))
            .collect();
        prop_assert_eq!(before, after);
    }

    /// reserve(p); consume(p) equals applying the amount exactly once, no
    /// matter how often consume is replayed.
    #[test]
    fn consume_replay_applies_amount_exactly_once(
        amount in 1i64..DAILY_LIMIT,
        replays in 1usize..5,
    ) {
        let (clock, engine) = engine_with_daily(DAILY_LIMIT);
        engine
            .reserve(&ctx(), "res_1".into(), "pay_1", "C1", &zar(amount), PaymentType::Rtc)
            .unwrap();
        for _ in 0..replays {
            engine.consume(&ctx(), "res_1").unwrap();
        }

        let today = clock.now().date_naive();
        prop_assert_eq!(
            engine
                .bucket_usage(&ctx(), "C1", BucketKey::daily(today))
                .used_amount,
            amount
        );
        prop_assert_eq!(
            engine
                .bucket_usage(&ctx(), "C1", BucketKey::daily_count(today))
                .used_count,
            1
        );
    }

    /// Usage never exceeds the configured limit, whatever mix of reserves
    /// is attempted.
    #[test]
    fn used_amount_never_exceeds_limit(amounts in prop::collection::vec(1i64..4_000_000, 1..12)) {
        let (clock, engine) = engine_with_daily(DAILY_LIMIT);
        for (i, amount) in amounts.iter().enumerate() {
            let _ = engine.reserve(
                &ctx(),
                format!("res_{i}"),
                &format!("pay_{i}"),
                "C1",
                &zar(*amount),
                PaymentType::Rtc,
            );
        }
        let today = clock.now().date_naive();
        let used = engine
            .bucket_usage(&ctx(), "C1", BucketKey::daily(today))
            .used_amount;
        prop_assert!(used <= DAILY_LIMIT, "used {} over limit", used);
    }
}
