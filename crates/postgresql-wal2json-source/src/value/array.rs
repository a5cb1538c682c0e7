//! Array and hstore literals.
//!
//! wal2json renders both as Postgres text literals (`{1,2,3}`,
//! `"a"=>"1"`). Parsing them locally would mean re-implementing the server's
//! quoting rules, so they are handed back to the server through a
//! [`ValueResolver`](crate::source::ValueResolver) and come back as JSON.

use std::collections::BTreeMap;
use sync_core::Value;

/// Cast applied to an array literal before `array_to_json`, by element type.
///
/// Element types whose JSON rendering would lose information (exact
/// numerics, temporal values, json documents) are read back as text and
/// coerced per element afterwards.
pub fn array_cast_type(element_sql_datatype: &str) -> &'static str {
    match element_sql_datatype {
        "bit" | "boolean" | "bool" => "boolean[]",
        "smallint" | "int2" => "smallint[]",
        "integer" | "int" | "int4" => "integer[]",
        "bigint" | "int8" => "bigint[]",
        "real" | "float4" => "real[]",
        "double precision" | "float8" => "double precision[]",
        "character varying" | "varchar" => "character varying[]",
        "cidr" => "cidr[]",
        "inet" => "inet[]",
        "mac" | "macaddr" => "macaddr[]",
        _ => "text[]",
    }
}

/// Pair up the `hstore_to_array` output: keys at even positions, values
/// (possibly NULL) after them.
pub fn hstore_pairs(items: Vec<Option<String>>) -> Result<Value, String> {
    if items.len() % 2 != 0 {
        return Err(format!(
            "hstore_to_array returned an odd number of items ({})",
            items.len()
        ));
    }
    let mut object = BTreeMap::new();
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        let key = key.ok_or("hstore key is NULL")?;
        object.insert(key, value.map(Value::String).unwrap_or(Value::Null));
    }
    Ok(Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cast_types() {
        assert_eq!(array_cast_type("bit"), "boolean[]");
        assert_eq!(array_cast_type("integer"), "integer[]");
        assert_eq!(array_cast_type("numeric"), "text[]");
        assert_eq!(array_cast_type("timestamp with time zone"), "text[]");
        assert_eq!(array_cast_type("jsonb"), "text[]");
        assert_eq!(array_cast_type("mac"), "macaddr[]");
        assert_eq!(array_cast_type("my_enum"), "text[]");
    }

    #[test]
    fn test_hstore_pairs() {
        let value = hstore_pairs(vec![
            Some("a".to_string()),
            Some("1".to_string()),
            Some("b".to_string()),
            None,
        ])
        .unwrap();
        let Value::Object(object) = value else {
            panic!("expected an object");
        };
        assert_eq!(object["a"], Value::from("1"));
        assert_eq!(object["b"], Value::Null);

        assert!(hstore_pairs(vec![Some("a".to_string())]).is_err());
        assert!(hstore_pairs(vec![None, Some("1".to_string())]).is_err());
    }
}
