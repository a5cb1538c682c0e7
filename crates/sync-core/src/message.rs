//! Singer wire messages and the sink they are written to.
//!
//! Output is newline-delimited JSON, one message per line, written in the
//! order the loop produces it:
//!
//! ```text
//! {"type":"SCHEMA","stream":"t","schema":{..},"key_properties":["id"],"bookmark_properties":[]}
//! {"type":"RECORD","stream":"t","record":{..},"version":1685620800000,"time_extracted":"2023-06-01T12:00:00.000000Z"}
//! {"type":"STATE","value":{"bookmarks":{..}}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::io::Write;

use crate::catalog::{Schema, StreamCatalogEntry};
use crate::error::Result;
use crate::value::Record;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Message {
    Schema {
        stream: String,
        schema: Schema,
        key_properties: Vec<String>,
        bookmark_properties: Vec<String>,
    },
    Record {
        stream: String,
        record: Record,
        version: i64,
        #[serde(serialize_with = "serialize_singer_datetime")]
        time_extracted: DateTime<Utc>,
    },
    State {
        value: serde_json::Value,
    },
}

impl Message {
    /// SCHEMA message announcing the entry's current schema.
    pub fn schema_for(entry: &StreamCatalogEntry, bookmark_properties: &[&str]) -> Self {
        Message::Schema {
            stream: entry.stream.clone(),
            schema: entry.schema.clone(),
            key_properties: entry.key_properties(),
            bookmark_properties: bookmark_properties.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn record(
        stream: impl Into<String>,
        record: Record,
        version: i64,
        time_extracted: DateTime<Utc>,
    ) -> Self {
        Message::Record {
            stream: stream.into(),
            record,
            version,
            time_extracted,
        }
    }

    pub fn state(value: serde_json::Value) -> Self {
        Message::State { value }
    }
}

/// Singer's timestamp layout: microsecond precision, `Z` suffix.
pub fn format_singer_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn serialize_singer_datetime<S: Serializer>(
    dt: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_singer_datetime(dt))
}

/// Destination for Singer messages.
pub trait MessageSink: Send {
    fn write_message(&mut self, message: &Message) -> Result<()>;
}

/// Writes each message as one JSON line and flushes immediately.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> MessageSink for JsonLinesSink<W> {
    fn write_message(&mut self, message: &Message) -> Result<()> {
        serde_json::to_writer(&mut self.writer, message)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
