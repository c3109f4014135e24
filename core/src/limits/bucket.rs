//! Limit buckets
//!
//! A bucket is a time-keyed accumulator of limit usage. Buckets are
//! addressed by their time key, so a new day or month produces a fresh
//! bucket on first access and historical buckets are never mutated.
//! That IS the reset discipline; there is no reset job.

use crate::models::payment::PaymentType;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Time-keyed bucket address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BucketKey {
    /// Total amount for one calendar day
    Daily(NaiveDate),

    /// Total amount for one calendar month
    Monthly { year: i32, month: u32 },

    /// Amount for one payment type on one day
    PerType(NaiveDate, PaymentType),

    /// Payment count for one day
    DailyCount(NaiveDate),
}

impl BucketKey {
    pub fn daily(date: NaiveDate) -> Self {
        BucketKey::Daily(date)
    }

    pub fn monthly(date: NaiveDate) -> Self {
        BucketKey::Monthly {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn per_type(date: NaiveDate, payment_type: PaymentType) -> Self {
        BucketKey::PerType(date, payment_type)
    }

    pub fn daily_count(date: NaiveDate) -> Self {
        BucketKey::DailyCount(date)
    }
}

/// Usage accumulated in one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitCounter {
    pub used_amount: i64,
    pub used_count: u32,
}

impl LimitCounter {
    pub fn add(&mut self, amount: i64, count: u32) {
        self.used_amount += amount;
        self.used_count += count;
    }

    pub fn subtract(&mut self, amount: i64, count: u32) {
        self.used_amount -= amount;
        self.used_count = self.used_count.saturating_sub(count);
    }
}
