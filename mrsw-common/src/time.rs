//! Timestamp utilities

use chrono::{Local, NaiveDateTime, Timelike};

/// Format of the manifest `Date` column (local wall-clock time)
pub const MANIFEST_TIME_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

/// Current local timestamp, truncated to whole seconds
pub fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Render a timestamp for the manifest
pub fn format_manifest_time(ts: &NaiveDateTime) -> String {
    ts.format(MANIFEST_TIME_FORMAT).to_string()
}

/// Parse a manifest `Date` value
pub fn parse_manifest_time(value: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value.trim(), MANIFEST_TIME_FORMAT)
}

/// Convert seconds to duration
pub fn secs_to_duration(secs: u64) -> std::time::Duration {
    std::time::Duration::from_secs(secs)
}
