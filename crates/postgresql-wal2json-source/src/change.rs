//! wal2json format-version 2 messages and plugin options.
//!
//! Each slot row carries one JSON document:
//!
//! ```text
//! {"action":"I","timestamp":"2023-06-01 12:00:00.123456+00","lsn":"0/16B3748",
//!  "schema":"public","table":"users",
//!  "columns":[{"name":"id","type":"integer","value":1}, ...]}
//! ```
//!
//! Column values are kept as raw JSON so exact numerics survive until the
//! decoder knows the column's type.

use serde::Deserialize;
use serde_json::value::RawValue;
use std::fmt;
use sync_core::Operation;

/// wal2json `action` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Action {
    #[serde(rename = "B")]
    Begin,
    #[serde(rename = "C")]
    Commit,
    #[serde(rename = "I")]
    Insert,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "D")]
    Delete,
    /// Logical decoding message (`pg_logical_emit_message`).
    #[serde(rename = "M")]
    Message,
    #[serde(rename = "T")]
    Truncate,
}

impl Action {
    /// The row operation, `None` for transaction markers and the like.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Action::Insert => Some(Operation::Insert),
            Action::Update => Some(Operation::Update),
            Action::Delete => Some(Operation::Delete),
            Action::Begin | Action::Commit | Action::Message | Action::Truncate => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Begin => write!(f, "Begin"),
            Action::Commit => write!(f, "Commit"),
            Action::Insert => write!(f, "Insert"),
            Action::Update => write!(f, "Update"),
            Action::Delete => write!(f, "Delete"),
            Action::Message => write!(f, "Message"),
            Action::Truncate => write!(f, "Truncate"),
        }
    }
}

#[derive(Deserialize)]
struct Framing {
    action: Action,
}

impl Action {
    /// The action of a raw payload, without decoding its columns.
    pub fn of_payload(payload: &str) -> Option<Action> {
        serde_json::from_str::<Framing>(payload)
            .ok()
            .map(|framing| framing.action)
    }
}

#[derive(Debug, Deserialize)]
pub struct Wal2JsonColumn {
    pub name: String,
    /// Present with `include-types`.
    #[serde(rename = "type", default)]
    pub type_name: Option<String>,
    pub value: Box<RawValue>,
}

#[derive(Debug, Deserialize)]
pub struct Wal2JsonMessage {
    pub action: Action,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub lsn: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    /// New row image of inserts and updates.
    #[serde(default)]
    pub columns: Vec<Wal2JsonColumn>,
    /// Replica identity of updates and deletes.
    #[serde(default)]
    pub identity: Vec<Wal2JsonColumn>,
}

impl Wal2JsonMessage {
    pub fn parse(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    /// `(schema, table)` for row changes.
    pub fn table_key(&self) -> Option<(&str, &str)> {
        Some((self.schema.as_deref()?, self.table.as_deref()?))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Plugin options passed to every slot read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wal2JsonOptions {
    /// `schema.table` list for `add-tables`, special characters escaped.
    pub add_tables: String,
}

/// Characters wal2json treats specially in `add-tables`.
const ADD_TABLES_SPECIAL_CHARS: &[char] = &[' ', '\'', ',', '.', '*'];

fn escape_table_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if ADD_TABLES_SPECIAL_CHARS.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl Wal2JsonOptions {
    pub fn for_tables<'a>(tables: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let add_tables = tables
            .into_iter()
            .map(|(schema, table)| {
                format!("{}.{}", escape_table_name(schema), escape_table_name(table))
            })
            .collect::<Vec<_>>()
            .join(",");
        Self { add_tables }
    }

    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("format-version", "2".to_string()),
            ("include-timestamp", "true".to_string()),
            ("include-types", "true".to_string()),
            ("include-lsn", "true".to_string()),
            ("actions", "insert,update,delete".to_string()),
            ("add-tables", self.add_tables.clone()),
        ]
    }

    /// Names and values flattened for the variadic `options` argument of the
    /// slot functions.
    pub fn to_args(&self) -> Vec<String> {
        self.to_pairs()
            .into_iter()
            .flat_map(|(name, value)| [name.to_string(), value])
            .collect()
    }
}
