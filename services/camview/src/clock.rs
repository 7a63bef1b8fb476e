//! Source of the current local time.
//!
//! Every component that needs "now" or "today" reads it through a [`Clock`],
//! so tests can pin the date without touching process-wide state.

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, TimeZone};
use parking_lot::Mutex;
use std::time::SystemTime;

/// Date directory name format (`YYYY-MM-DD`).
pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Clock pinned to a settable instant.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Local>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Clock pinned to a local wall-clock time.
    pub fn at(naive: NaiveDateTime) -> Self {
        Self::new(local_datetime(naive))
    }

    pub fn set(&self, now: DateTime<Local>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock()
    }
}

/// Interpret a naive wall-clock time in the local zone.
///
/// Times that fall in a DST gap are shifted forward by an hour; ambiguous
/// times resolve to the earlier instant.
pub fn local_datetime(naive: NaiveDateTime) -> DateTime<Local> {
    match Local.from_local_datetime(&naive).earliest() {
        Some(dt) => dt,
        None => Local
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .unwrap_or_else(|| Local.from_utc_datetime(&naive)),
    }
}

pub fn from_system_time(t: SystemTime) -> DateTime<Local> {
    DateTime::<Local>::from(t)
}

/// Parse a date directory name.
pub fn parse_date(name: &str) -> Option<NaiveDate> {
    if name.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(name, DATE_FORMAT).ok()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Oldest date still inside a retention window of `retain_days` days
/// counted back from (and including) `today`.
pub fn oldest_retained(today: NaiveDate, retain_days: u32) -> NaiveDate {
    let span = i64::from(retain_days.max(1)) - 1;
    today - Duration::days(span)
}
