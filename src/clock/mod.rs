//! Local wall-clock helpers and the on-disk timestamp formats.
//!
//! Every component takes the current time as a `NaiveDateTime` argument so
//! that tests can pin it; only the agent calls [`now`].

use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};

/// Date bucket used in segment file names (`2024-03-01`).
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Timestamp used for event blocks, metrics rows and error records.
pub const RECORD_TIME_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// Timestamp stored in the event subsystem's last-capture marker.
pub const MARKER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Timestamp stored in the instance lock file.
pub const LOCK_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local time, truncated to whole seconds.
pub fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Calendar-day bucket for a timestamp.
pub fn date_bucket(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Second-precision record timestamp (`2024-03-01_12:30:05`).
pub fn record_time(at: NaiveDateTime) -> String {
    at.format(RECORD_TIME_FORMAT).to_string()
}
