//! In-memory collaborators for tests.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;

use crate::catalog::StreamCatalogEntry;
use crate::error::Result;
use crate::message::{Message, MessageSink};
use crate::refresh::Discovery;
use crate::value::Record;

/// Collects every message written to it.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub messages: Vec<Message>,
}

impl MessageSink for MemorySink {
    fn write_message(&mut self, message: &Message) -> Result<()> {
        self.messages.push(message.clone());
        Ok(())
    }
}

impl MemorySink {
    pub fn schemas(&self) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|m| matches!(m, Message::Schema { .. }))
            .collect()
    }

    pub fn records(&self) -> Vec<(&str, &Record, i64)> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::Record {
                    stream,
                    record,
                    version,
                    ..
                } => Some((stream.as_str(), record, *version)),
                _ => None,
            })
            .collect()
    }

    pub fn states(&self) -> Vec<&serde_json::Value> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::State { value } => Some(value),
                _ => None,
            })
            .collect()
    }

    pub fn last_state(&self) -> Option<&serde_json::Value> {
        self.states().into_iter().last()
    }
}

/// Discovery answering from a fixed set of entries.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    tables: HashMap<(String, String), StreamCatalogEntry>,
}

impl StaticDiscovery {
    pub fn new(entries: impl IntoIterator<Item = StreamCatalogEntry>) -> Self {
        let tables = entries
            .into_iter()
            .map(|e| {
                let key = (
                    e.database_name().unwrap_or_default().to_string(),
                    e.table_name().to_string(),
                );
                (key, e)
            })
            .collect();
        Self { tables }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover_table(
        &self,
        namespace: &str,
        table: &str,
    ) -> Result<Option<StreamCatalogEntry>> {
        Ok(self
            .tables
            .get(&(namespace.to_string(), table.to_string()))
            .cloned())
    }
}

/// A selected LOG_BASED entry for `namespace.table` whose columns are
/// nullable strings, except `id` which is an automatic integer key.
pub fn catalog_entry(namespace: &str, table: &str, columns: &[&str]) -> StreamCatalogEntry {
    let mut properties = serde_json::Map::new();
    let mut metadata = vec![json!({
        "breadcrumb": [],
        "metadata": {
            "selected": true,
            "replication-method": "LOG_BASED",
            "database-name": namespace,
            "table-key-properties": ["id"]
        }
    })];
    for column in columns {
        let (schema, sql_datatype, inclusion) = if *column == "id" {
            (json!({"type": ["null", "integer"]}), "int(11)", "automatic")
        } else {
            (json!({"type": ["null", "string"]}), "varchar(255)", "available")
        };
        properties.insert(column.to_string(), schema);
        metadata.push(json!({
            "breadcrumb": ["properties", column],
            "metadata": {
                "inclusion": inclusion,
                "selected-by-default": true,
                "sql-datatype": sql_datatype
            }
        }));
    }
    // The fixture is well-formed JSON for the catalog model.
    serde_json::from_value(json!({
        "tap_stream_id": format!("{namespace}-{table}"),
        "stream": table,
        "table_name": table,
        "schema": {"type": "object", "properties": properties},
        "metadata": metadata
    }))
    .unwrap_or_else(|e| panic!("invalid catalog fixture: {e}"))
}
