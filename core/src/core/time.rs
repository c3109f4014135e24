//! Time and identifier services
//!
//! The orchestration core never reads the wall clock directly. Every
//! component receives a `Clock` implementation at construction time:
//! `SystemClock` in production, `ManualClock` in tests where time must be
//! stepped explicitly (reservation expiry, breaker wait windows, saga
//! deadlines).
//!
//! Identifiers are UUIDv7: time-ordered and sortable by creation instant,
//! which gives concurrent operations a total, deterministic order (ties on
//! the millisecond are broken by the random tail). Correlation ids do not
//! need ordering and are plain v4.
//!
//! # Critical Invariants
//!
//! 1. No component reads wall-clock time outside `SystemClock`
//! 2. Ids issued later by the same generator sort after ids issued earlier
//! 3. Deadlines are values, not timers: expiry is checked against `Clock::now()`

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::sync::Mutex;
use uuid::{NoContext, Timestamp, Uuid};

/// Injectable time source.
///
/// # Example
/// ```
/// use payment_orchestration_core::core::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let now = clock.now();
/// assert!(now.timestamp() > 0);
/// ```
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock reading the operating system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only moves when told to.
///
/// # Example
/// ```
/// use chrono::{Duration, TimeZone, Utc};
/// use payment_orchestration_core::core::{Clock, ManualClock};
///
/// let start = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();
/// let clock = ManualClock::new(start);
/// clock.advance(Duration::minutes(30));
/// assert_eq!(clock.now(), start + Duration::minutes(30));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at the given instant.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }

    /// Jump the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap();
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Issues time-ordered identifiers from the injected clock.
///
/// Payment and saga ids come from `new_payment_id()` and are sortable by
/// creation time. Event sequence numbers are NOT issued here: they are
/// assigned by the event store at append time so they stay gap-free per
/// saga.
#[derive(Clone)]
pub struct IdGenerator {
    clock: Arc<dyn Clock>,
}

impl IdGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// New time-ordered payment id (doubles as the saga id).
    pub fn new_payment_id(&self) -> String {
        let now = self.clock.now();
        let ts = Timestamp::from_unix(
            NoContext,
            now.timestamp() as u64,
            now.timestamp_subsec_nanos(),
        );
        Uuid::new_v7(ts).to_string()
    }

    /// New time-ordered reservation / hold / message id.
    pub fn new_entity_id(&self) -> String {
        self.new_payment_id()
    }

    /// New correlation id (no ordering requirement).
    pub fn new_correlation_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// New event id (no ordering requirement; ordering lives in `seq`).
    pub fn new_event_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator").finish_non_exhaustive()
    }
}

/// Absolute instant by which work must finish.
///
/// Deadlines are inherited downward: a saga deadline bounds every step, a
/// step deadline bounds every adapter call. Adapters receive the deadline as
/// data and must give up once it has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: DateTime<Utc>,
}

impl Deadline {
    /// Deadline at an absolute instant.
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self { at: instant }
    }

    /// Deadline a duration from `now`.
    pub fn after(now: DateTime<Utc>, budget: Duration) -> Self {
        Self { at: now + budget }
    }

    /// The absolute expiry instant.
    pub fn instant(&self) -> DateTime<Utc> {
        self.at
    }

    /// True once `now` has reached or passed the deadline.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.at
    }

    /// Remaining budget, zero when expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        if now >= self.at {
            Duration::zero()
        } else {
            self.at - now
        }
    }

    /// The earlier of two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        if self.at <= other.at {
            self
        } else {
            other
        }
    }
}
