//! Time grain and rollup heuristics over sampled timestamp values.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde_json::Value;

use crate::state::{RollupInterval, TimeGrain};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Read a sampled value as a UTC timestamp. Integers are epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s.trim()),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Finest grain at which the sampled timestamps differ from a truncation.
///
/// Returns `None` when no value parses as a timestamp.
pub fn smallest_time_grain(values: &[Value]) -> Option<TimeGrain> {
    let stamps: Vec<DateTime<Utc>> = values.iter().filter_map(parse_timestamp).collect();
    if stamps.is_empty() {
        return None;
    }

    let grain = if any_of(&stamps, |t| t.timestamp_subsec_millis() != 0) {
        TimeGrain::Millisecond
    } else if any_of(&stamps, |t| t.second() != 0) {
        TimeGrain::Second
    } else if any_of(&stamps, |t| t.minute() != 0) {
        TimeGrain::Minute
    } else if any_of(&stamps, |t| t.hour() != 0) {
        TimeGrain::Hour
    } else if any_of(&stamps, |t| t.day() != 1) {
        let weekday = stamps[0].weekday();
        if stamps.len() > 1 && stamps.iter().all(|t| t.weekday() == weekday) {
            TimeGrain::Week
        } else {
            TimeGrain::Day
        }
    } else if any_of(&stamps, |t| t.month() != 1) {
        TimeGrain::Month
    } else {
        TimeGrain::Year
    };

    Some(grain)
}

fn any_of(stamps: &[DateTime<Utc>], f: impl Fn(&DateTime<Utc>) -> bool) -> bool {
    stamps.iter().any(f)
}

/// Rollup grain that keeps a time series over `[min, max]` readable.
pub fn ideal_rollup_interval(min: &Value, max: &Value) -> Option<RollupInterval> {
    let start = parse_timestamp(min)?;
    let end = parse_timestamp(max)?;
    let span = end.signed_duration_since(start);

    let grain = if span.num_minutes() < 2 {
        TimeGrain::Second
    } else if span.num_hours() < 2 {
        TimeGrain::Minute
    } else if span.num_days() < 7 {
        TimeGrain::Hour
    } else if span.num_days() < 365 {
        TimeGrain::Day
    } else if span.num_days() < 365 * 5 {
        TimeGrain::Week
    } else if span.num_days() < 365 * 20 {
        TimeGrain::Month
    } else {
        TimeGrain::Year
    };

    Some(RollupInterval {
        grain,
        start: Some(start.to_rfc3339()),
        end: Some(end.to_rfc3339()),
    })
}
