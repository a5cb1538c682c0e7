//! Date and time coercion.
//!
//! wal2json renders temporal columns with the server's output functions,
//! e.g. `2024-01-15 10:30:00.5`, `2024-01-15 10:30:00+02` or `infinity`.
//! Timestamps the target cannot represent (unparseable, `infinity`, years
//! past 9999) collapse to a fixed maximum instead of failing the row.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};

/// Stand-in for timestamps past what ISO 8601 targets accept.
pub const MAX_TIMESTAMP: &str = "9999-12-31T23:59:59.999+00:00";
pub const MAX_DATE: &str = "9999-12-31T00:00:00+00:00";
/// `-infinity`.
pub const MIN_TIMESTAMP: &str = "0001-01-01T00:00:00+00:00";

const NEGATIVE_INFINITY: &str = "-infinity";
const MAX_YEAR: i32 = 9999;
const DAY_SECONDS: i64 = 86_400;

/// `2023-06-01T16:00:00+00:00`, with microseconds only when non-zero.
pub fn format_utc(dt: &DateTime<Utc>) -> String {
    if dt.timestamp_subsec_micros() == 0 {
        dt.format("%Y-%m-%dT%H:%M:%S+00:00").to_string()
    } else {
        dt.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
    }
}

fn format_time(time: NaiveTime) -> String {
    if time.nanosecond() / 1_000 == 0 {
        time.format("%H:%M:%S").to_string()
    } else {
        time.format("%H:%M:%S%.6f").to_string()
    }
}

fn parse_naive_timestamp(s: &str) -> Option<NaiveDateTime> {
    let formats = [
        "%Y-%m-%d %H:%M:%S",    // 2024-01-15 10:30:00
        "%Y-%m-%d %H:%M:%S%.f", // With fractional seconds
        "%Y-%m-%dT%H:%M:%S",    // ISO 8601 without timezone
        "%Y-%m-%dT%H:%M:%S%.f", // ISO 8601 with fractional seconds
    ];
    formats
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
}

/// Expand a short `+HH` offset to `+HH:00`.
fn normalize_offset(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() > 3 && matches!(bytes[bytes.len() - 3], b'+' | b'-') {
        format!("{s}:00")
    } else {
        s.to_string()
    }
}

/// Parse a `timestamp with time zone` as wal2json renders it.
pub fn parse_timestamptz(s: &str) -> Option<DateTime<Utc>> {
    let normalized = normalize_offset(s.trim());
    let formats = [
        "%Y-%m-%d %H:%M:%S%:z",    // 2024-01-15 10:30:00+00:00
        "%Y-%m-%d %H:%M:%S%.f%:z", // With fractional seconds
        "%Y-%m-%d %H:%M:%S%::z",   // Offsets with seconds, e.g. LMT
        "%Y-%m-%d %H:%M:%S%.f%::z",
        "%Y-%m-%dT%H:%M:%S%.f%:z", // ISO 8601
    ];
    formats.iter().find_map(|format| {
        DateTime::parse_from_str(&normalized, format)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

/// `timestamp without time zone`, taken as UTC.
pub fn coerce_timestamp(s: &str) -> String {
    if s == NEGATIVE_INFINITY {
        return MIN_TIMESTAMP.to_string();
    }
    match parse_naive_timestamp(s.trim()) {
        Some(naive) if naive.year() <= MAX_YEAR => format_utc(&naive.and_utc()),
        _ => MAX_TIMESTAMP.to_string(),
    }
}

/// `timestamp with time zone`, converted to UTC.
pub fn coerce_timestamptz(s: &str) -> String {
    if s == NEGATIVE_INFINITY {
        return MIN_TIMESTAMP.to_string();
    }
    match parse_timestamptz(s) {
        Some(dt) if dt.year() <= MAX_YEAR => format_utc(&dt),
        _ => MAX_TIMESTAMP.to_string(),
    }
}

pub fn coerce_date(s: &str) -> String {
    if s == NEGATIVE_INFINITY {
        return MIN_TIMESTAMP.to_string();
    }
    match NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
        Ok(date) if date.year() <= MAX_YEAR => date.format("%Y-%m-%dT00:00:00+00:00").to_string(),
        _ => MAX_DATE.to_string(),
    }
}

/// `24:00:00` is a valid Postgres time; it becomes midnight.
fn replace_hour_24(s: &str) -> String {
    match s.strip_prefix("24") {
        Some(rest) => format!("00{rest}"),
        None => s.to_string(),
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| format!("failed to parse time '{s}': {e}"))
}

/// `time without time zone` as `HH:MM:SS[.ffffff]`.
pub fn coerce_time(s: &str) -> Result<String, String> {
    parse_time(&replace_hour_24(s.trim())).map(format_time)
}

/// Offset of a `timetz` suffix (`+02`, `-05:30`, `+05:30:15`) in seconds.
fn parse_offset_seconds(offset: &str) -> Option<i64> {
    let (sign, digits) = match offset.as_bytes().first()? {
        b'+' => (1, &offset[1..]),
        b'-' => (-1, &offset[1..]),
        _ => return None,
    };
    let mut seconds = 0;
    let mut unit = 3_600;
    for part in digits.split(':') {
        if unit == 0 || part.is_empty() {
            return None;
        }
        seconds += part.parse::<i64>().ok()? * unit;
        unit /= 60;
    }
    Some(sign * seconds)
}

/// `time with time zone` shifted to UTC, zone dropped.
pub fn coerce_timetz(s: &str) -> Result<String, String> {
    let s = replace_hour_24(s.trim());
    let split = s
        .rfind(['+', '-'])
        .ok_or_else(|| format!("time with time zone '{s}' has no offset"))?;
    let (time, offset) = s.split_at(split);
    let time = parse_time(time)?;
    let offset = parse_offset_seconds(offset)
        .ok_or_else(|| format!("invalid offset in time with time zone '{s}'"))?;
    let seconds = (i64::from(time.num_seconds_from_midnight()) - offset).rem_euclid(DAY_SECONDS);
    let utc = NaiveTime::from_num_seconds_from_midnight_opt(seconds as u32, time.nanosecond())
        .ok_or_else(|| format!("time with time zone '{s}' is out of range"))?;
    Ok(format_time(utc))
}
