//! Canonical decoded form of one wire-level mutation.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::message::Message;
use crate::registry::tap_stream_id;
use crate::value::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    /// Log file boundary; carries a position only.
    Rotate,
    /// Transaction metadata such as a GTID; carries a position only.
    Metadata,
}

impl Operation {
    pub fn is_row_change(&self) -> bool {
        matches!(
            self,
            Operation::Insert | Operation::Update | Operation::Delete
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert => write!(f, "INSERT"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
            Operation::Rotate => write!(f, "ROTATE"),
            Operation::Metadata => write!(f, "METADATA"),
        }
    }
}

/// Database (MySQL) or schema (Postgres) plus table name of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableKey {
    pub namespace: String,
    pub table: String,
}

impl TableKey {
    pub fn new(namespace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            table: table.into(),
        }
    }

    pub fn tap_stream_id(&self) -> String {
        tap_stream_id(&self.namespace, &self.table)
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.table)
    }
}

/// A decoded event. `P` is the engine's position type.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<P> {
    pub operation: Operation,
    /// `None` for position-only events.
    pub source_table_key: Option<TableKey>,
    pub column_values: Record,
    /// Position immediately after this event.
    pub event_position: P,
    pub event_timestamp: DateTime<Utc>,
}

impl<P> ChangeEvent<P> {
    /// Position-only event for log rotation and transaction metadata.
    pub fn position_only(operation: Operation, position: P, timestamp: DateTime<Utc>) -> Self {
        ChangeEvent {
            operation,
            source_table_key: None,
            column_values: Record::new(),
            event_position: position,
            event_timestamp: timestamp,
        }
    }

    /// RECORD message for a row change.
    pub fn into_record_message(
        self,
        stream: &str,
        version: i64,
        time_extracted: DateTime<Utc>,
    ) -> Message {
        Message::record(stream, self.column_values, version, time_extracted)
    }
}
