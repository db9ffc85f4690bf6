use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset, Local, LocalResult, NaiveDate, TimeZone};

/// Source of "now" for day/month bucketing.
///
/// Spend buckets are keyed by the machine-local calendar date, so anything
/// that decides which bucket a request lands in goes through this trait
/// instead of calling `Local::now()` directly. Tests pin it to a fixed
/// instant to make day and month boundaries deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Local calendar date key, e.g. "2026-02-14".
pub fn day_key(t: &DateTime<FixedOffset>) -> String {
    t.format("%Y-%m-%d").to_string()
}

/// Local calendar month prefix, e.g. "2026-02". Day keys of the current
/// month are exactly the ones starting with this prefix.
pub fn month_key(t: &DateTime<FixedOffset>) -> String {
    t.format("%Y-%m").to_string()
}

/// Midnight local time on the first day of the month after `t`.
///
/// Used as `retryAfter` when the monthly budget gate blocks a request.
pub fn first_of_next_month(t: &DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    let midnight = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_else(|| t.naive_local());
    match t.timezone().from_local_datetime(&midnight) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(dt, _) => dt,
        LocalResult::None => *t,
    }
}

#[cfg(test)]
pub struct FixedClock(pub DateTime<FixedOffset>);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.0
    }
}

#[cfg(test)]
pub fn fixed(rfc3339: &str) -> Arc<dyn Clock> {
    Arc::new(FixedClock(
        DateTime::parse_from_rfc3339(rfc3339).expect("valid rfc3339"),
    ))
}
