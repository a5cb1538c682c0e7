//! Temporal column coercion.
//!
//! TIMESTAMP values reach the decoder either as epoch seconds or as a naive
//! datetime in the reader's local zone; the latter is localized before
//! conversion to UTC. DATETIME and DATE values carry no zone and are taken
//! as UTC.

use chrono::{
    DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc,
};
use chrono_tz::Tz;
use mysql_async::consts::ColumnType;
use sync_core::Value;

/// `2023-06-01T16:00:00+00:00`, with microseconds only when non-zero.
pub fn format_utc(dt: &DateTime<Utc>) -> String {
    if dt.timestamp_subsec_micros() == 0 {
        dt.format("%Y-%m-%dT%H:%M:%S+00:00").to_string()
    } else {
        dt.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
    }
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%dT00:00:00+00:00").to_string()
}

/// Interpret `naive` as wall-clock time in `tz`.
///
/// Ambiguous and skipped wall-clock times resolve to standard time.
pub fn localize(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(_, standard) => standard.with_timezone(&Utc),
        LocalResult::None => {
            let offset = tz.offset_from_utc_datetime(&naive).fix();
            (naive - Duration::seconds(i64::from(offset.local_minus_utc()))).and_utc()
        }
    }
}

/// `None` for zero dates (`0000-00-00`) and other out-of-range parts.
pub fn naive_datetime(
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    micros: u32,
) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))?.and_hms_micro_opt(
        u32::from(hour),
        u32::from(minute),
        u32::from(second),
        micros,
    )
}

/// Coerce a `Value::Date` according to the column's wire type.
#[allow(clippy::too_many_arguments)]
pub fn coerce_date_value(
    column_type: ColumnType,
    tz: Tz,
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    micros: u32,
) -> Value {
    let Some(naive) = naive_datetime(year, month, day, hour, minute, second, micros) else {
        return Value::Null;
    };
    match column_type {
        ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => {
            Value::String(format_date(naive.date()))
        }
        ColumnType::MYSQL_TYPE_TIMESTAMP | ColumnType::MYSQL_TYPE_TIMESTAMP2 => {
            Value::String(format_utc(&localize(naive, tz)))
        }
        _ => Value::String(format_utc(&naive.and_utc())),
    }
}

/// TIMESTAMP as epoch seconds, `"1685620800"` or `"1685620800.250000"`.
/// Epoch zero is the zero timestamp and maps to null.
pub fn coerce_epoch_timestamp(text: &str) -> Result<Value, String> {
    let (secs, frac) = text.split_once('.').unwrap_or((text, ""));
    let secs: i64 = secs
        .parse()
        .map_err(|_| format!("invalid TIMESTAMP value '{text}'"))?;
    let micros = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().chain(std::iter::repeat('0')).take(6).collect();
        digits
            .parse::<u32>()
            .map_err(|_| format!("invalid TIMESTAMP fraction '{text}'"))?
    };
    if secs == 0 && micros == 0 {
        return Ok(Value::Null);
    }
    let dt = DateTime::from_timestamp(secs, micros * 1000)
        .ok_or_else(|| format!("TIMESTAMP '{text}' is out of range"))?;
    Ok(Value::String(format_utc(&dt)))
}

/// TIME values are durations; they are rendered as the time of day reached
/// from midnight, wrapping around whole days.
pub fn format_time(
    negative: bool,
    days: u32,
    hours: u8,
    minutes: u8,
    seconds: u8,
    micros: u32,
) -> String {
    const DAY_MICROS: i64 = 86_400 * 1_000_000;
    let magnitude = ((i64::from(days) * 24 + i64::from(hours)) * 3600
        + i64::from(minutes) * 60
        + i64::from(seconds))
        * 1_000_000
        + i64::from(micros);
    let total = if negative { -magnitude } else { magnitude };
    let of_day = total.rem_euclid(DAY_MICROS);

    let secs = of_day / 1_000_000;
    let micros = of_day % 1_000_000;
    let hms = format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60);
    if micros == 0 {
        format!("{hms}+00:00")
    } else {
        format!("{hms}.{micros:06}+00:00")
    }
}
