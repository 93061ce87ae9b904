use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

/// Wall-clock source. Injected so retention and tier routing can be tested
/// at fixed instants.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: parking_lot::Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: parking_lot::Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += to_delta(by);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Converts a std duration, saturating at the largest representable delta.
pub fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// `now - window`, clamped to the earliest representable instant.
pub fn earlier_by(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_delta(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Rounds down to a multiple of `unit` since the Unix epoch.
fn floor_to(ts: DateTime<Utc>, unit: TimeDelta) -> DateTime<Utc> {
    ts.duration_trunc(unit).unwrap_or(ts)
}

pub fn floor_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    floor_to(ts, TimeDelta::minutes(1))
}

pub fn floor_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    floor_to(ts, TimeDelta::hours(1))
}

/// Rounds down to UTC midnight.
pub fn floor_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    floor_to(ts, TimeDelta::days(1))
}
