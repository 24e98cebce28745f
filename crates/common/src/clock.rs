//! Wall-clock abstraction
//!
//! Time-of-day ROI gating and dwell tests need a controllable clock; the
//! engine reads time only through this trait.

use chrono::{DateTime, NaiveTime, TimeZone, Timelike, Utc};
use std::sync::Mutex;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Local time of day used for ROI schedule gating. The default maps the
    /// UTC instant directly; deployments with a fixed offset configure it at
    /// the edge.
    fn time_of_day(&self) -> NaiveTime {
        self.now_utc().time()
    }

    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64 {
        self.now_utc().timestamp_millis()
    }
}

/// System clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at the given milliseconds since the Unix epoch.
    #[must_use]
    pub fn starting_at_ms(epoch_ms: i64) -> Self {
        Self {
            now: Mutex::new(Utc.timestamp_millis_opt(epoch_ms).unwrap()),
        }
    }

    /// Start at a given time of day (today, UTC).
    #[must_use]
    pub fn starting_at_time(hour: u32, minute: u32, second: u32) -> Self {
        let base = Utc::now()
            .with_hour(hour)
            .and_then(|t| t.with_minute(minute))
            .and_then(|t| t.with_second(second))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap();
        Self {
            now: Mutex::new(base),
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::milliseconds(ms);
    }

    pub fn set_time_of_day(&self, hour: u32, minute: u32) {
        let mut now = self.now.lock().unwrap();
        *now = now
            .with_hour(hour)
            .and_then(|t| t.with_minute(minute))
            .and_then(|t| t.with_second(0))
            .unwrap();
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
