//! Column value coercion.
//!
//! Each wal2json value is coerced by the column's `sql-datatype` from
//! discovery, falling back to the type wal2json reports. Scalars are
//! converted locally; arrays and hstore go through the server. A scalar
//! that cannot be converted is a [`CdcError::Decode`] and costs the event;
//! an array or hstore that cannot be converted is a
//! [`CdcError::TypeMapping`] and stops the run.

pub mod array;
pub mod temporal;

use futures::future::{BoxFuture, FutureExt};
use serde_json::value::RawValue;
use serde_json::Value as Json;
use sync_core::{CdcError, Result, Value};

use crate::source::ValueResolver;
use array::{array_cast_type, hstore_pairs};

/// How a column type is coerced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgType {
    Boolean,
    Bit,
    Integer,
    Float,
    Numeric,
    Json,
    Hstore,
    Date,
    Time,
    TimeTz,
    Timestamp,
    TimestampTz,
    /// `money`, `uuid`, enums and anything else rendered as text.
    Text,
    Array {
        element: Box<PgType>,
        cast: &'static str,
    },
}

/// Lowercase, drop type modifiers: `numeric(10,2)` is `numeric`,
/// `timestamp(3) without time zone` is `timestamp without time zone`.
pub fn normalize_sql_datatype(sql_datatype: &str) -> String {
    let mut normalized = String::with_capacity(sql_datatype.len());
    let mut depth = 0usize;
    for c in sql_datatype.trim().chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => normalized.extend(c.to_lowercase()),
            _ => {}
        }
    }
    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl PgType {
    pub fn from_sql_datatype(sql_datatype: &str) -> PgType {
        let normalized = normalize_sql_datatype(sql_datatype);
        if normalized.ends_with("[]") {
            let element = normalized.trim_end_matches("[]").trim_end();
            return PgType::Array {
                element: Box::new(PgType::scalar(element)),
                cast: array_cast_type(element),
            };
        }
        PgType::scalar(&normalized)
    }

    fn scalar(normalized: &str) -> PgType {
        match normalized {
            "boolean" | "bool" => PgType::Boolean,
            "bit" => PgType::Bit,
            "smallint" | "integer" | "int" | "bigint" | "int2" | "int4" | "int8" | "smallserial"
            | "serial" | "bigserial" | "oid" => PgType::Integer,
            "real" | "double precision" | "float4" | "float8" => PgType::Float,
            "numeric" | "decimal" => PgType::Numeric,
            "json" | "jsonb" => PgType::Json,
            "hstore" => PgType::Hstore,
            "date" => PgType::Date,
            "time" | "time without time zone" => PgType::Time,
            "timetz" | "time with time zone" => PgType::TimeTz,
            "timestamp" | "timestamp without time zone" => PgType::Timestamp,
            "timestamptz" | "timestamp with time zone" => PgType::TimestampTz,
            _ => PgType::Text,
        }
    }
}

/// The column a value belongs to, for coercion and error reporting.
#[derive(Debug, Clone, Copy)]
pub struct ColumnContext<'a> {
    pub stream: &'a str,
    pub column: &'a str,
    pub sql_datatype: &'a str,
}

impl ColumnContext<'_> {
    fn decode_error(&self, message: impl std::fmt::Display) -> CdcError {
        CdcError::decode(self.stream, format!("column '{}': {message}", self.column))
    }

    fn type_mapping_error(&self, message: impl Into<String>) -> CdcError {
        CdcError::type_mapping(self.column, self.sql_datatype, message)
    }
}

/// Coerce one raw wal2json value.
pub async fn coerce(
    context: &ColumnContext<'_>,
    raw: &RawValue,
    resolver: &dyn ValueResolver,
) -> Result<Value> {
    let text = raw.get();
    if text == "null" {
        return Ok(Value::Null);
    }
    let pg_type = PgType::from_sql_datatype(context.sql_datatype);

    // Exact numerics arrive unquoted; keep their text.
    if pg_type == PgType::Numeric && !text.starts_with('"') {
        return Value::numeric(text)
            .ok_or_else(|| context.decode_error(format!("'{text}' is not a number")));
    }

    let json: Json = serde_json::from_str(text).map_err(|e| context.decode_error(e))?;
    match &pg_type {
        PgType::Array { element, cast } => {
            let literal = literal(context, &json)?;
            let array = resolver
                .cast_array(literal, cast)
                .await
                .map_err(|e| context.type_mapping_error(format!("casting '{literal}' to {cast}: {e}")))?;
            coerce_element(context, element, array, resolver).await
        }
        PgType::Hstore => coerce_hstore(context, literal(context, &json)?, resolver).await,
        scalar => coerce_scalar(scalar, json).map_err(|message| context.decode_error(message)),
    }
}

fn literal<'j>(context: &ColumnContext<'_>, json: &'j Json) -> Result<&'j str> {
    json.as_str()
        .ok_or_else(|| context.type_mapping_error(format!("expected a text literal, got {json}")))
}

async fn coerce_hstore(
    context: &ColumnContext<'_>,
    literal: &str,
    resolver: &dyn ValueResolver,
) -> Result<Value> {
    let items = resolver
        .hstore_to_array(literal)
        .await
        .map_err(|e| context.type_mapping_error(format!("reading hstore '{literal}': {e}")))?;
    hstore_pairs(items).map_err(|message| context.type_mapping_error(message))
}

/// Coerce an element of a converted array, descending into nested arrays.
fn coerce_element<'a>(
    context: &'a ColumnContext<'a>,
    element: &'a PgType,
    json: Json,
    resolver: &'a dyn ValueResolver,
) -> BoxFuture<'a, Result<Value>> {
    async move {
        match json {
            Json::Null => Ok(Value::Null),
            Json::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(coerce_element(context, element, item, resolver).await?);
                }
                Ok(Value::Array(values))
            }
            Json::String(literal) if *element == PgType::Hstore => {
                coerce_hstore(context, &literal, resolver).await
            }
            json => coerce_scalar(element, json).map_err(|message| {
                context.type_mapping_error(format!("array element: {message}"))
            }),
        }
    }
    .boxed()
}

fn is_non_finite(text: &str) -> bool {
    matches!(text, "NaN" | "Infinity" | "-Infinity" | "inf" | "-inf")
}

/// Coerce a parsed scalar by column type.
pub fn coerce_scalar(pg_type: &PgType, json: Json) -> std::result::Result<Value, String> {
    if json.is_null() {
        return Ok(Value::Null);
    }
    match (pg_type, json) {
        (PgType::Boolean, Json::Bool(b)) => Ok(Value::Bool(b)),
        (PgType::Boolean, Json::String(s)) => match s.as_str() {
            "t" | "true" => Ok(Value::Bool(true)),
            "f" | "false" => Ok(Value::Bool(false)),
            _ => Err(format!("'{s}' is not a boolean")),
        },
        (PgType::Bit, Json::String(s)) => Ok(Value::Bool(s == "1")),
        (PgType::Bit, Json::Bool(b)) => Ok(Value::Bool(b)),
        (PgType::Integer, Json::Number(n)) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_u64().map(Value::UInt))
            .ok_or_else(|| format!("{n} is not an integer")),
        (PgType::Integer, Json::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("'{s}' is not an integer")),
        (PgType::Float, Json::Number(n)) => Ok(n
            .as_f64()
            .filter(|f| f.is_finite())
            .map(Value::Float)
            .unwrap_or(Value::Null)),
        (PgType::Float, Json::String(s)) if is_non_finite(&s) => Ok(Value::Null),
        (PgType::Float, Json::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(|f| if f.is_finite() { Value::Float(f) } else { Value::Null })
            .map_err(|_| format!("'{s}' is not a number")),
        (PgType::Numeric, Json::String(s)) if s == "NaN" => Ok(Value::Null),
        (PgType::Numeric, Json::String(s)) => {
            Value::numeric(&s).ok_or_else(|| format!("'{s}' is not a number"))
        }
        (PgType::Numeric, Json::Number(n)) => {
            Value::numeric(&n.to_string()).ok_or_else(|| format!("'{n}' is not a number"))
        }
        (PgType::Json, Json::String(s)) => serde_json::from_str::<Json>(&s)
            .map(Value::from_json)
            .map_err(|e| format!("invalid json document: {e}")),
        (PgType::Json, json) => Ok(Value::from_json(json)),
        (PgType::Date, Json::String(s)) => Ok(Value::String(temporal::coerce_date(&s))),
        (PgType::Timestamp, Json::String(s)) => Ok(Value::String(temporal::coerce_timestamp(&s))),
        (PgType::TimestampTz, Json::String(s)) => {
            Ok(Value::String(temporal::coerce_timestamptz(&s)))
        }
        (PgType::Time, Json::String(s)) => temporal::coerce_time(&s).map(Value::String),
        (PgType::TimeTz, Json::String(s)) => temporal::coerce_timetz(&s).map(Value::String),
        (PgType::Text, json) => Ok(Value::from_json(json)),
        (pg_type, json) => Err(format!("unexpected value {json} for {pg_type:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeResolver;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn raw(text: &str) -> Box<RawValue> {
        RawValue::from_string(text.to_string()).unwrap()
    }

    async fn coerce_as(sql_datatype: &str, text: &str, resolver: &FakeResolver) -> Result<Value> {
        let context = ColumnContext {
            stream: "public-items",
            column: "c",
            sql_datatype,
        };
        coerce(&context, &raw(text), resolver).await
    }

    async fn coerce_plain(sql_datatype: &str, text: &str) -> Value {
        coerce_as(sql_datatype, text, &FakeResolver::default())
            .await
            .unwrap()
    }

    #[test]
    fn test_type_classification() {
        assert_eq!(PgType::from_sql_datatype("numeric(10,2)"), PgType::Numeric);
        assert_eq!(
            PgType::from_sql_datatype("timestamp(3) without time zone"),
            PgType::Timestamp
        );
        assert_eq!(PgType::from_sql_datatype("character varying(255)"), PgType::Text);
        assert_eq!(PgType::from_sql_datatype("bit(1)"), PgType::Bit);
        assert_eq!(
            PgType::from_sql_datatype("integer[]"),
            PgType::Array {
                element: Box::new(PgType::Integer),
                cast: "integer[]"
            }
        );
        assert_eq!(
            PgType::from_sql_datatype("numeric(5,1)[]"),
            PgType::Array {
                element: Box::new(PgType::Numeric),
                cast: "text[]"
            }
        );
    }

    #[tokio::test]
    async fn test_scalars() {
        assert_eq!(coerce_plain("integer", "42").await, Value::Int(42));
        assert_eq!(coerce_plain("bigint", "null").await, Value::Null);
        assert_eq!(coerce_plain("boolean", "true").await, Value::Bool(true));
        assert_eq!(coerce_plain("bit", "\"1\"").await, Value::Bool(true));
        assert_eq!(coerce_plain("bit", "\"0\"").await, Value::Bool(false));
        assert_eq!(coerce_plain("real", "1.5").await, Value::Float(1.5));
        assert_eq!(coerce_plain("double precision", "\"NaN\"").await, Value::Null);
        assert_eq!(coerce_plain("money", "\"$1,234.50\"").await, Value::from("$1,234.50"));
        assert_eq!(
            coerce_plain("uuid", "\"a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11\"").await,
            Value::from("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11")
        );
    }

    #[tokio::test]
    async fn test_numeric_is_exact() {
        assert_eq!(
            coerce_plain("numeric(38,10)", "12345678901234567890.0123456789").await,
            Value::Numeric("12345678901234567890.0123456789".to_string())
        );
        assert_eq!(coerce_plain("numeric", "\"NaN\"").await, Value::Null);
        assert_eq!(
            coerce_plain("numeric", "\"1.10\"").await,
            Value::Numeric("1.10".to_string())
        );
    }

    #[tokio::test]
    async fn test_json_is_nested() {
        let value = coerce_plain("jsonb", r#""{\"a\": [1, true]}""#).await;
        let expected = Value::Object(BTreeMap::from([(
            "a".to_string(),
            Value::Array(vec![Value::Int(1), Value::Bool(true)]),
        )]));
        assert_eq!(value, expected);
    }

    #[tokio::test]
    async fn test_temporal_columns() {
        assert_eq!(
            coerce_plain("timestamp without time zone", "\"10000-01-01 00:00:00\"").await,
            Value::from("9999-12-31T23:59:59.999+00:00")
        );
        assert_eq!(
            coerce_plain("timestamp with time zone", "\"2024-01-15 10:30:00+02\"").await,
            Value::from("2024-01-15T08:30:00+00:00")
        );
        assert_eq!(
            coerce_plain("date", "\"2024-01-15\"").await,
            Value::from("2024-01-15T00:00:00+00:00")
        );
        assert_eq!(
            coerce_plain("time with time zone", "\"10:30:00+02\"").await,
            Value::from("08:30:00")
        );
    }

    #[tokio::test]
    async fn test_bad_scalar_is_decode_error() {
        let err = coerce_as("integer", "\"abc\"", &FakeResolver::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::Decode { .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_integer_array_round_trip() {
        let resolver = FakeResolver::default().with_array("{1,2,3}", "integer[]", json!([1, 2, 3]));
        let value = coerce_as("integer[]", "\"{1,2,3}\"", &resolver).await.unwrap();
        assert_eq!(
            value,
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[tokio::test]
    async fn test_array_elements_use_scalar_rules() {
        let resolver = FakeResolver::default()
            .with_array(
                "{{1.10,NaN},{2.5,NULL}}",
                "text[]",
                json!([["1.10", "NaN"], ["2.5", null]]),
            )
            .with_array(
                "{\"2024-01-15 10:30:00+02\"}",
                "text[]",
                json!(["2024-01-15 10:30:00+02"]),
            );
        let value = coerce_as("numeric[]", "\"{{1.10,NaN},{2.5,NULL}}\"", &resolver)
            .await
            .unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Array(vec![Value::Numeric("1.10".to_string()), Value::Null]),
                Value::Array(vec![Value::Numeric("2.5".to_string()), Value::Null]),
            ])
        );

        let value = coerce_as(
            "timestamp with time zone[]",
            r#""{\"2024-01-15 10:30:00+02\"}""#,
            &resolver,
        )
        .await
        .unwrap();
        assert_eq!(
            value,
            Value::Array(vec![Value::from("2024-01-15T08:30:00+00:00")])
        );
    }

    #[tokio::test]
    async fn test_hstore_and_hstore_arrays() {
        let resolver = FakeResolver::default()
            .with_hstore(r#""a"=>"1""#, &[Some("a"), Some("1")])
            .with_array(r#"{"\"a\"=>\"1\""}"#, "text[]", json!([r#""a"=>"1""#]));
        let value = coerce_as("hstore", r#""\"a\"=>\"1\"""#, &resolver).await.unwrap();
        let expected = Value::Object(BTreeMap::from([("a".to_string(), Value::from("1"))]));
        assert_eq!(value, expected);

        let value = coerce_as("hstore[]", r#""{\"\\\"a\\\"=>\\\"1\\\"\"}""#, &resolver)
            .await
            .unwrap();
        assert_eq!(value, Value::Array(vec![expected]));
    }

    #[tokio::test]
    async fn test_unresolvable_array_is_fatal() {
        let err = coerce_as("integer[]", "\"{1,2\"", &FakeResolver::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::TypeMapping { .. }));
        assert!(err.is_fatal());
    }
}
