//! Singer catalog model.
//!
//! Catalog entries are produced by discovery, which is not part of this
//! crate. The replication loops consume them read-only, except for the
//! schema refresh that swaps an entry when a table grows new columns.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};

/// JSON schema `type`, either a single name or a list such as `["null", "string"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaType {
    One(String),
    Many(Vec<String>),
}

impl SchemaType {
    pub fn contains(&self, name: &str) -> bool {
        match self {
            SchemaType::One(t) => t == name,
            SchemaType::Many(types) => types.iter().any(|t| t == name),
        }
    }
}

/// The subset of JSON schema the taps emit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<SchemaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Schema>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Schema {
    /// A nullable property of the given JSON type.
    pub fn nullable(type_name: &str) -> Self {
        Schema {
            schema_type: Some(SchemaType::Many(vec![
                "null".to_string(),
                type_name.to_string(),
            ])),
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: &str) -> Self {
        self.format = Some(format.to_string());
        self
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.schema_type
            .as_ref()
            .map(|t| t.contains(name))
            .unwrap_or(false)
    }

    pub fn is_boolean(&self) -> bool {
        self.has_type("boolean")
    }

    pub fn is_spatial(&self) -> bool {
        self.format.as_deref() == Some("spatial")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMethod {
    FullTable,
    Incremental,
    LogBased,
}

/// One `{breadcrumb, metadata}` pair of Singer metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub breadcrumb: Vec<String>,
    pub metadata: Map<String, JsonValue>,
}

/// A replicated table as described by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCatalogEntry {
    pub tap_stream_id: String,
    pub stream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    pub schema: Schema,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
}

impl StreamCatalogEntry {
    fn metadata_at(&self, breadcrumb: &[&str]) -> Option<&Map<String, JsonValue>> {
        self.metadata
            .iter()
            .find(|m| m.breadcrumb.iter().map(String::as_str).eq(breadcrumb.iter().copied()))
            .map(|m| &m.metadata)
    }

    fn metadata_at_mut(&mut self, breadcrumb: &[&str]) -> &mut Map<String, JsonValue> {
        let position = self
            .metadata
            .iter()
            .position(|m| m.breadcrumb.iter().map(String::as_str).eq(breadcrumb.iter().copied()));
        let index = match position {
            Some(index) => index,
            None => {
                self.metadata.push(MetadataEntry {
                    breadcrumb: breadcrumb.iter().map(|s| s.to_string()).collect(),
                    metadata: Map::new(),
                });
                self.metadata.len() - 1
            }
        };
        &mut self.metadata[index].metadata
    }

    /// Table-level metadata (empty breadcrumb).
    pub fn stream_metadata(&self) -> Option<&Map<String, JsonValue>> {
        self.metadata_at(&[])
    }

    pub fn stream_metadata_mut(&mut self) -> &mut Map<String, JsonValue> {
        self.metadata_at_mut(&[])
    }

    pub fn column_metadata(&self, column: &str) -> Option<&Map<String, JsonValue>> {
        self.metadata_at(&["properties", column])
    }

    pub fn column_metadata_mut(&mut self, column: &str) -> &mut Map<String, JsonValue> {
        self.metadata_at_mut(&["properties", column])
    }

    pub fn table_name(&self) -> &str {
        self.table_name.as_deref().unwrap_or(&self.stream)
    }

    /// MySQL database or Postgres schema the table lives in.
    pub fn database_name(&self) -> Option<&str> {
        let md = self.stream_metadata()?;
        md.get("database-name")
            .or_else(|| md.get("schema-name"))
            .and_then(JsonValue::as_str)
    }

    pub fn replication_method(&self) -> Option<ReplicationMethod> {
        self.stream_metadata()
            .and_then(|md| md.get("replication-method"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn is_selected(&self) -> bool {
        self.stream_metadata()
            .and_then(|md| md.get("selected"))
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    /// Primary key columns, empty for views.
    pub fn key_properties(&self) -> Vec<String> {
        let Some(md) = self.stream_metadata() else {
            return Vec::new();
        };
        if md.get("is-view").and_then(JsonValue::as_bool) == Some(true) {
            return Vec::new();
        }
        md.get("table-key-properties")
            .and_then(JsonValue::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Column type as reported by the source at discovery time.
    pub fn sql_datatype(&self, column: &str) -> Option<&str> {
        self.column_metadata(column)
            .and_then(|md| md.get("sql-datatype"))
            .and_then(JsonValue::as_str)
    }

    /// Singer field selection: automatic columns always sync, an explicit
    /// `selected` wins next, unsupported columns never sync, anything else
    /// syncs.
    pub fn should_sync_column(&self, column: &str) -> bool {
        let md = self.column_metadata(column);
        let inclusion = md
            .and_then(|md| md.get("inclusion"))
            .and_then(JsonValue::as_str);
        if inclusion == Some("automatic") {
            return true;
        }
        if let Some(selected) = md.and_then(|md| md.get("selected")).and_then(JsonValue::as_bool) {
            return selected;
        }
        inclusion != Some("unsupported")
    }

    pub fn desired_columns(&self) -> BTreeSet<String> {
        self.schema
            .properties
            .keys()
            .filter(|c| self.should_sync_column(c))
            .cloned()
            .collect()
    }
}

/// The discovered catalog handed to a sync invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<StreamCatalogEntry>,
}

impl Catalog {
    /// Selected streams configured for log-based replication.
    pub fn log_based_streams(&self) -> impl Iterator<Item = &StreamCatalogEntry> {
        self.streams.iter().filter(|s| {
            s.is_selected() && s.replication_method() == Some(ReplicationMethod::LogBased)
        })
    }
}
