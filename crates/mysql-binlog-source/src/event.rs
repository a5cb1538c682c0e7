//! Binlog events as handed to the decoder.
//!
//! The `mysql_async` binlog types borrow from the stream's table-map cache,
//! so the adapter copies what the decoder needs into these owned types.
//! Column names are already resolved and ENUM/SET values carry their labels.

use chrono::{DateTime, Utc};
use checkpoint::Gtid;
use mysql_async::consts::ColumnType;

/// Common header of every binlog event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    /// Seconds since the epoch, as stamped by the source.
    pub timestamp: u32,
    /// Offset of the next event in the current binlog file.
    pub log_pos: u64,
    pub server_id: u32,
}

impl EventHeader {
    pub fn event_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(i64::from(self.timestamp), 0).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinlogEvent {
    pub header: EventHeader,
    pub data: EventData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    /// Switch to another binlog file.
    Rotate { next_log_file: String, position: u64 },
    /// Start of a transaction with a known GTID.
    Gtid(Gtid),
    Rows(RowsEvent),
    /// Anything else: format descriptions, queries, XIDs, heartbeats.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowsKind {
    Write,
    Update,
    Delete,
}

/// Column as described by the table map.
#[derive(Debug, Clone, PartialEq)]
pub struct WireColumn {
    pub name: String,
    pub column_type: ColumnType,
}

impl WireColumn {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// One column value of a row image.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Value(mysql_async::Value),
    /// Binary JSON, already converted.
    Json(serde_json::Value),
}

impl WireValue {
    pub fn is_null(&self) -> bool {
        matches!(self, WireValue::Value(mysql_async::Value::NULL))
    }
}

impl From<mysql_async::Value> for WireValue {
    fn from(value: mysql_async::Value) -> Self {
        WireValue::Value(value)
    }
}

/// Before and after images of one row, positionally aligned with the
/// event's columns.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub before: Option<Vec<WireValue>>,
    pub after: Option<Vec<WireValue>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub kind: RowsKind,
    pub database: String,
    pub table: String,
    pub columns: Vec<WireColumn>,
    pub rows: Vec<RowChange>,
}

impl RowsEvent {
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}
