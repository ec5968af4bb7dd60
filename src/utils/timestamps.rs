use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::constants::FILETIME_UNIX_EPOCH_DELTA;

/// Convert Unix timestamp to ISO 8601 format
pub fn unix_to_iso8601(timestamp: i64) -> String {
    match Utc.timestamp_opt(timestamp, 0) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339(),
        _ => "0000-00-00T00:00:00Z".to_string(), // Invalid timestamp
    }
}

/// Convert microseconds since the Unix epoch to ISO 8601 format
pub fn micros_to_iso8601(micros: i64) -> String {
    match Utc.timestamp_micros(micros) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339(),
        _ => "0000-00-00T00:00:00Z".to_string(),
    }
}

/// Convert a FILETIME (100ns intervals since 1601-01-01) to microseconds since the Unix epoch
pub fn filetime_to_micros(filetime: u64) -> Option<i64> {
    let since_unix = filetime.checked_sub(FILETIME_UNIX_EPOCH_DELTA)?;
    i64::try_from(since_unix / 10).ok()
}

/// Convert a FILETIME to ISO 8601 format, "N/A" when it predates the Unix epoch
pub fn filetime_to_iso8601(filetime: u64) -> String {
    filetime_to_micros(filetime)
        .map(micros_to_iso8601)
        .unwrap_or_else(|| "N/A".to_string())
}

/// Microseconds since the Unix epoch of a file system time
pub fn system_time_to_micros(time: SystemTime) -> Option<i64> {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_micros()).ok(),
        Err(before) => i64::try_from(before.duration().as_micros()).ok().map(|micros| -micros),
    }
}

/// Parses a timestamp given as microseconds, RFC 3339, "YYYY-MM-DD HH:MM:SS" or a date
pub fn parse_timestamp_micros(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(micros) = value.parse::<i64>() {
        return Some(micros);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_micros());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.and_utc().timestamp_micros());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_micros())
}
