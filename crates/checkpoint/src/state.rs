//! Singer state: `{"bookmarks": {tap_stream_id: {...}}, ...}`.
//!
//! Key names are an interchange format read by other tooling, so bookmark
//! entries are kept as raw JSON maps and unknown keys survive untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use sync_core::Result;

pub const LOG_FILE: &str = "log_file";
pub const LOG_POS: &str = "log_pos";
pub const GTID: &str = "gtid";
pub const VERSION: &str = "version";
pub const LSN: &str = "lsn";

/// Keys left behind by an interrupted initial full-table sync.
pub const INITIAL_SYNC_KEYS: &[&str] = &["max_pk_values", "last_pk_fetched"];

/// Per-stream bookmark entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bookmark(Map<String, Value>);

impl Bookmark {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Integer bookmark values, also accepted as numeric strings.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn log_file(&self) -> Option<&str> {
        self.get_str(LOG_FILE)
    }

    pub fn log_pos(&self) -> Option<u64> {
        self.get_u64(LOG_POS)
    }

    pub fn gtid(&self) -> Option<&str> {
        self.get_str(GTID)
    }

    pub fn version(&self) -> Option<i64> {
        self.get_i64(VERSION)
    }

    /// Whether an initial full-table sync was interrupted for this stream.
    pub fn has_initial_sync_markers(&self) -> bool {
        INITIAL_SYNC_KEYS.iter().any(|k| self.contains(k))
    }

    pub fn retain_keys(&mut self, keys: &[&str]) {
        self.0.retain(|k, _| keys.contains(&k.as_str()));
    }
}

/// The full state value carried in STATE messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub bookmarks: BTreeMap<String, Bookmark>,
    /// Other top-level keys, e.g. `currently_syncing`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl State {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Value {
        // Maps of strings to JSON values always serialize.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn bookmark(&self, tap_stream_id: &str) -> Option<&Bookmark> {
        self.bookmarks.get(tap_stream_id)
    }

    pub fn bookmark_mut(&mut self, tap_stream_id: &str) -> &mut Bookmark {
        self.bookmarks.entry(tap_stream_id.to_string()).or_default()
    }
}
