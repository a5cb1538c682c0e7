//! Binlog column value coercion into record values.
//!
//! The rules depend on both the declared schema (boolean, spatial) and the
//! wire type of the column. Errors are plain messages; the decoder wraps
//! them into decode errors naming the stream.

pub mod spatial;
pub mod temporal;

use chrono_tz::Tz;
use mysql_async::consts::ColumnType;
use mysql_async::Value as MySqlValue;
use sync_core::{Schema, Value};

use crate::event::WireValue;

/// What the coercion needs to know about one column.
#[derive(Debug, Clone, Copy)]
pub struct ColumnContext<'a> {
    pub column_type: ColumnType,
    pub schema: &'a Schema,
    /// `sql-datatype` from discovery, e.g. `varbinary(16)`.
    pub sql_datatype: Option<&'a str>,
    pub local_timezone: Tz,
}

pub fn coerce(column: &ColumnContext<'_>, value: &WireValue) -> Result<Value, String> {
    let value = match value {
        // JSON columns are emitted as JSON text.
        WireValue::Json(json) => return Ok(Value::String(json.to_string())),
        WireValue::Value(value) => value,
    };
    if matches!(value, MySqlValue::NULL) {
        return Ok(Value::Null);
    }
    if column.schema.is_boolean() {
        return Ok(Value::Bool(coerce_boolean(column.column_type, value)));
    }
    match value {
        MySqlValue::NULL => Ok(Value::Null),
        MySqlValue::Int(v) => Ok(Value::Int(*v)),
        MySqlValue::UInt(v) => Ok(Value::UInt(*v)),
        MySqlValue::Float(v) => Ok(Value::Float(f64::from(*v))),
        MySqlValue::Double(v) => Ok(Value::Float(*v)),
        MySqlValue::Date(year, month, day, hour, minute, second, micros) => {
            Ok(temporal::coerce_date_value(
                column.column_type,
                column.local_timezone,
                *year,
                *month,
                *day,
                *hour,
                *minute,
                *second,
                *micros,
            ))
        }
        MySqlValue::Time(negative, days, hours, minutes, seconds, micros) => Ok(Value::String(
            temporal::format_time(*negative, *days, *hours, *minutes, *seconds, *micros),
        )),
        MySqlValue::Bytes(bytes) => coerce_bytes(column, bytes),
    }
}

/// BIT columns are true when any bit is set; for every other wire type
/// only zero is false.
fn coerce_boolean(column_type: ColumnType, value: &MySqlValue) -> bool {
    match value {
        MySqlValue::Bytes(bytes) if column_type == ColumnType::MYSQL_TYPE_BIT => {
            bytes.iter().any(|b| *b != 0)
        }
        MySqlValue::NULL | MySqlValue::Int(0) | MySqlValue::UInt(0) => false,
        MySqlValue::Float(v) => *v != 0.0,
        MySqlValue::Double(v) => *v != 0.0,
        _ => true,
    }
}

fn is_binary_datatype(sql_datatype: Option<&str>) -> bool {
    sql_datatype
        .map(|t| {
            let t = t.to_ascii_lowercase();
            t.contains("binary") || t.contains("blob")
        })
        .unwrap_or(false)
}

fn coerce_bytes(column: &ColumnContext<'_>, bytes: &[u8]) -> Result<Value, String> {
    if column.schema.is_spatial() || column.column_type == ColumnType::MYSQL_TYPE_GEOMETRY {
        return spatial::mysql_geometry_to_geojson(bytes).map(Value::String);
    }
    match column.column_type {
        ColumnType::MYSQL_TYPE_JSON => {
            let text = utf8(bytes)?;
            Ok(Value::String(match serde_json::from_str::<serde_json::Value>(text) {
                Ok(json) => json.to_string(),
                Err(_) => text.to_string(),
            }))
        }
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
            let text = utf8(bytes)?;
            Value::numeric(text.trim()).ok_or_else(|| format!("invalid DECIMAL value '{text}'"))
        }
        ColumnType::MYSQL_TYPE_TIMESTAMP | ColumnType::MYSQL_TYPE_TIMESTAMP2 => {
            temporal::coerce_epoch_timestamp(utf8(bytes)?)
        }
        ColumnType::MYSQL_TYPE_BIT => {
            if bytes.len() > 8 {
                return Err(format!("BIT value of {} bytes", bytes.len()));
            }
            Ok(Value::UInt(
                bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
            ))
        }
        _ if is_binary_datatype(column.sql_datatype) => Ok(Value::String(hex::encode(bytes))),
        _ => match std::str::from_utf8(bytes) {
            Ok(text) => Ok(Value::String(text.to_string())),
            Err(_) => Ok(Value::String(hex::encode(bytes))),
        },
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, String> {
    std::str::from_utf8(bytes).map_err(|e| format!("invalid UTF-8: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(value: serde_json::Value) -> Schema {
        serde_json::from_value(value).unwrap()
    }

    fn ctx<'a>(
        column_type: ColumnType,
        schema: &'a Schema,
        sql_datatype: Option<&'a str>,
    ) -> ColumnContext<'a> {
        ColumnContext {
            column_type,
            schema,
            sql_datatype,
            local_timezone: Tz::UTC,
        }
    }

    fn bytes(b: &[u8]) -> WireValue {
        WireValue::Value(MySqlValue::Bytes(b.to_vec()))
    }

    #[test]
    fn test_boolean_asymmetry() {
        let boolean = schema(json!({"type": ["null", "boolean"]}));
        let bit = ctx(ColumnType::MYSQL_TYPE_BIT, &boolean, Some("bit(1)"));
        let tiny = ctx(ColumnType::MYSQL_TYPE_TINY, &boolean, Some("tinyint(1)"));

        assert_eq!(coerce(&bit, &bytes(&[1])).unwrap(), Value::Bool(true));
        assert_eq!(coerce(&bit, &bytes(&[0])).unwrap(), Value::Bool(false));
        assert_eq!(coerce(&tiny, &MySqlValue::Int(0).into()).unwrap(), Value::Bool(false));
        assert_eq!(coerce(&tiny, &MySqlValue::Int(2).into()).unwrap(), Value::Bool(true));
        assert_eq!(coerce(&tiny, &MySqlValue::NULL.into()).unwrap(), Value::Null);
        // Non-BIT bytes are non-null, hence true, even when they spell zero.
        assert_eq!(coerce(&tiny, &bytes(b"0")).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_json_is_emitted_as_text() {
        let string = schema(json!({"type": ["null", "string"]}));
        let column = ctx(ColumnType::MYSQL_TYPE_JSON, &string, Some("json"));

        let value = WireValue::Json(json!({"a": [1, "x"]}));
        assert_eq!(
            coerce(&column, &value).unwrap(),
            Value::String(r#"{"a":[1,"x"]}"#.into())
        );
        assert_eq!(
            coerce(&column, &bytes(br#"{"b": true}"#)).unwrap(),
            Value::String(r#"{"b":true}"#.into())
        );
    }

    #[test]
    fn test_binary_columns_are_hex() {
        let string = schema(json!({"type": ["null", "string"]}));
        let column = ctx(ColumnType::MYSQL_TYPE_STRING, &string, Some("binary(4)"));
        assert_eq!(
            coerce(&column, &bytes(&[0xDE, 0xAD, 0x00, 0x01])).unwrap(),
            Value::String("dead0001".into())
        );

        let column = ctx(ColumnType::MYSQL_TYPE_VARCHAR, &string, Some("varchar(10)"));
        assert_eq!(
            coerce(&column, &bytes(b"hello")).unwrap(),
            Value::String("hello".into())
        );
    }

    #[test]
    fn test_decimal_is_exact() {
        let number = schema(json!({"type": ["null", "number"]}));
        let column = ctx(ColumnType::MYSQL_TYPE_NEWDECIMAL, &number, Some("decimal(30,10)"));
        assert_eq!(
            coerce(&column, &bytes(b"12345678901234567890.0123456789")).unwrap(),
            Value::Numeric("12345678901234567890.0123456789".into())
        );
        assert!(coerce(&column, &bytes(b"abc")).is_err());
    }

    #[test]
    fn test_wide_bit_is_integer() {
        let integer = schema(json!({"type": ["null", "integer"]}));
        let column = ctx(ColumnType::MYSQL_TYPE_BIT, &integer, Some("bit(12)"));
        assert_eq!(coerce(&column, &bytes(&[0x0A, 0xBC])).unwrap(), Value::UInt(0xABC));
    }

    #[test]
    fn test_spatial_null_and_value() {
        let spatial = schema(json!({"type": ["null", "object"], "format": "spatial"}));
        let column = ctx(ColumnType::MYSQL_TYPE_GEOMETRY, &spatial, Some("point"));
        assert_eq!(coerce(&column, &MySqlValue::NULL.into()).unwrap(), Value::Null);

        let mut geometry = 4326u32.to_le_bytes().to_vec();
        geometry.push(1);
        geometry.extend_from_slice(&1u32.to_le_bytes());
        geometry.extend_from_slice(&3.0f64.to_le_bytes());
        geometry.extend_from_slice(&4.0f64.to_le_bytes());
        let Value::String(text) = coerce(&column, &bytes(&geometry)).unwrap() else {
            panic!("expected a string");
        };
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, json!({"type": "Point", "coordinates": [3.0, 4.0]}));
    }

    #[test]
    fn test_numbers_pass_through() {
        let integer = schema(json!({"type": ["null", "integer"]}));
        let column = ctx(ColumnType::MYSQL_TYPE_LONGLONG, &integer, Some("bigint(20) unsigned"));
        assert_eq!(
            coerce(&column, &MySqlValue::UInt(u64::MAX).into()).unwrap(),
            Value::UInt(u64::MAX)
        );
        let number = schema(json!({"type": ["null", "number"]}));
        let column = ctx(ColumnType::MYSQL_TYPE_DOUBLE, &number, Some("double"));
        assert_eq!(
            coerce(&column, &MySqlValue::Double(2.5).into()).unwrap(),
            Value::Float(2.5)
        );
    }
}
