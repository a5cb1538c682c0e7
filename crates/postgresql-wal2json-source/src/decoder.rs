//! wal2json message decoding.
//!
//! [`Wal2JsonDecoder`] turns one row change of a subscribed table into a
//! [`ChangeEvent`] positioned at the message's LSN. Inserts and updates
//! emit the new row image, deletes the replica identity.

use chrono::{DateTime, Utc};
use checkpoint::Lsn;
use sync_core::{
    format_singer_datetime, CdcError, ChangeEvent, Record, Result, StreamEntry, TableKey, Value,
    SDC_DELETED_AT, SDC_LSN,
};

use crate::change::{Wal2JsonColumn, Wal2JsonMessage};
use crate::source::ValueResolver;
use crate::value::temporal::parse_timestamptz;
use crate::value::{coerce, ColumnContext};

/// Used when neither discovery nor wal2json names a column's type.
const FALLBACK_SQL_DATATYPE: &str = "text";

#[derive(Debug, Clone, Default)]
pub struct Wal2JsonDecoder {
    debug_lsn: bool,
}

impl Wal2JsonDecoder {
    pub fn new(debug_lsn: bool) -> Self {
        Self { debug_lsn }
    }

    /// Decode a row change for `entry`.
    ///
    /// Deletes are stamped with the payload's commit timestamp, or
    /// `time_extracted` when the payload has none.
    pub async fn decode(
        &self,
        message: &Wal2JsonMessage,
        lsn: Lsn,
        entry: &StreamEntry,
        time_extracted: DateTime<Utc>,
        resolver: &dyn ValueResolver,
    ) -> Result<ChangeEvent<Lsn>> {
        let stream = entry.tap_stream_id();
        let operation = message.action.operation().ok_or_else(|| {
            CdcError::decode(stream, format!("{} is not a row change", message.action))
        })?;
        let (schema, table) = message
            .table_key()
            .ok_or_else(|| CdcError::decode(stream, format!("{operation} without schema or table")))?;

        let image = match operation {
            sync_core::Operation::Delete => &message.identity,
            _ => &message.columns,
        };
        if image.is_empty() {
            return Err(CdcError::decode(
                stream,
                format!("{operation} on {schema}.{table} at {lsn} without a row image"),
            ));
        }

        let event_time = message
            .timestamp
            .as_deref()
            .and_then(parse_timestamptz)
            .unwrap_or(time_extracted);

        let mut record = self.decode_image(image, entry, resolver).await?;
        if entry.is_desired(SDC_DELETED_AT) {
            let deleted_at = match operation {
                sync_core::Operation::Delete => Value::String(format_singer_datetime(&event_time)),
                _ => Value::Null,
            };
            record.insert(SDC_DELETED_AT.to_string(), deleted_at);
        }
        if self.debug_lsn && entry.is_desired(SDC_LSN) {
            record.insert(SDC_LSN.to_string(), Value::String(lsn.as_u64().to_string()));
        }

        Ok(ChangeEvent {
            operation,
            source_table_key: Some(TableKey::new(schema, table)),
            column_values: record,
            event_position: lsn,
            event_timestamp: event_time,
        })
    }

    async fn decode_image(
        &self,
        image: &[Wal2JsonColumn],
        entry: &StreamEntry,
        resolver: &dyn ValueResolver,
    ) -> Result<Record> {
        let catalog = entry.catalog();
        let mut record = Record::new();
        for column in image {
            if !entry.is_desired(&column.name) {
                continue;
            }
            if !catalog.schema.properties.contains_key(&column.name) {
                continue;
            }
            let sql_datatype = catalog
                .sql_datatype(&column.name)
                .or(column.type_name.as_deref())
                .unwrap_or(FALLBACK_SQL_DATATYPE);
            let context = ColumnContext {
                stream: entry.tap_stream_id(),
                column: &column.name,
                sql_datatype,
            };
            let value = coerce(&context, &column.value, resolver).await?;
            record.insert(column.name.clone(), value);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        delete_message, insert_message, pg_catalog_entry, update_message, FakeResolver,
    };
    use crate::source::WalMessage;
    use chrono::TimeZone;
    use serde_json::json;
    use sync_core::{add_automatic_columns, AutomaticColumn, Operation};

    fn entry(debug_lsn: bool) -> StreamEntry {
        let mut entry = StreamEntry::new(pg_catalog_entry(
            "public",
            "users",
            &[("name", "character varying"), ("score", "numeric")],
        ));
        let mut columns = vec![AutomaticColumn::soft_delete()];
        if debug_lsn {
            columns.push(AutomaticColumn::lsn());
        }
        add_automatic_columns(&mut entry, &columns);
        entry
    }

    fn time_extracted() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    async fn decode(message: &WalMessage, debug_lsn: bool) -> Result<ChangeEvent<Lsn>> {
        let parsed = Wal2JsonMessage::parse(&message.payload).unwrap();
        Wal2JsonDecoder::new(debug_lsn)
            .decode(
                &parsed,
                message.data_start,
                &entry(debug_lsn),
                time_extracted(),
                &FakeResolver::default(),
            )
            .await
    }

    #[tokio::test]
    async fn test_insert_projects_desired_columns() {
        let message = insert_message(
            100,
            "public",
            "users",
            &[
                ("id", "integer", json!(1)),
                ("name", "text", json!("ann")),
                ("internal", "text", json!("hidden")),
            ],
        );
        let event = decode(&message, false).await.unwrap();
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.event_position, Lsn(100));
        assert_eq!(event.source_table_key, Some(TableKey::new("public", "users")));
        let record = &event.column_values;
        assert_eq!(record["id"], Value::Int(1));
        assert_eq!(record["name"], Value::from("ann"));
        assert!(!record.contains_key("internal"));
        assert_eq!(record[SDC_DELETED_AT], Value::Null);
        assert!(!record.contains_key(SDC_LSN));
    }

    #[tokio::test]
    async fn test_update_and_debug_lsn() {
        let message = update_message(
            0x1_0000_0010,
            "public",
            "users",
            &[("id", "integer", json!(1)), ("name", "text", json!("bob"))],
        );
        let event = decode(&message, true).await.unwrap();
        assert_eq!(event.operation, Operation::Update);
        assert_eq!(event.column_values["name"], Value::from("bob"));
        assert_eq!(event.column_values[SDC_LSN], Value::from("4294967312"));
    }

    #[tokio::test]
    async fn test_same_change_decodes_identically() {
        let message = insert_message(
            200,
            "public",
            "users",
            &[
                ("id", "integer", json!(3)),
                ("name", "text", json!("carol")),
                ("score", "numeric", json!(12.25)),
            ],
        );
        let first = decode(&message, true).await.unwrap();
        let second = decode(&message, true).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first.column_values).unwrap(),
            serde_json::to_string(&second.column_values).unwrap()
        );
    }

    #[tokio::test]
    async fn test_delete_uses_identity_and_commit_time() {
        let message = delete_message(200, "public", "users", &[("id", "integer", json!(7))]);
        let event = decode(&message, false).await.unwrap();
        assert_eq!(event.operation, Operation::Delete);
        assert_eq!(event.column_values["id"], Value::Int(7));
        assert!(!event.column_values.contains_key("name"));
        assert_eq!(
            event.column_values[SDC_DELETED_AT],
            Value::from("2023-06-01T12:00:00.000000Z")
        );
    }

    #[tokio::test]
    async fn test_delete_without_timestamp_uses_time_extracted() {
        let message = WalMessage {
            data_start: Lsn(300),
            payload: json!({
                "action": "D", "schema": "public", "table": "users",
                "identity": [{"name": "id", "type": "integer", "value": 7}]
            })
            .to_string(),
        };
        let event = decode(&message, false).await.unwrap();
        assert_eq!(
            event.column_values[SDC_DELETED_AT],
            Value::from("2024-01-01T00:00:00.000000Z")
        );
    }

    #[tokio::test]
    async fn test_catalog_type_wins_over_payload_type() {
        // discovery says numeric, wal2json claims text
        let message = WalMessage {
            data_start: Lsn(400),
            payload: r#"{"action":"I","schema":"public","table":"users",
                "columns":[{"name":"id","type":"integer","value":1},
                           {"name":"score","type":"text","value":10.50}]}"#
                .to_string(),
        };
        let event = decode(&message, false).await.unwrap();
        assert_eq!(
            event.column_values["score"],
            Value::Numeric("10.50".to_string())
        );
    }

    #[tokio::test]
    async fn test_malformed_changes_are_decode_errors() {
        let empty = insert_message(500, "public", "users", &[]);
        let err = decode(&empty, false).await.unwrap_err();
        assert!(!err.is_fatal());

        let bad_value = insert_message(
            500,
            "public",
            "users",
            &[("id", "integer", json!("seven"))],
        );
        let err = decode(&bad_value, false).await.unwrap_err();
        assert!(matches!(err, CdcError::Decode { .. }));
    }
}
