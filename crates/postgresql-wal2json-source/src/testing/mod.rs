//! Testing utilities for the wal2json source.
//!
//! [`FakeLogicalSource`] answers bookkeeping queries from fixed values and
//! replays a scripted list of slot polls on every open, releasing whole
//! transactions the way the real reader does. The message
//! builders produce wal2json format-version 2 payloads.

use async_trait::async_trait;
use checkpoint::{CommittedStateReader, Lsn, State};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use sync_core::{CdcError, Result, StreamCatalogEntry};

use crate::change::Wal2JsonOptions;
use crate::checkpoint::OUTPUT_PLUGIN;
use crate::source::{
    LogicalReplicationSource, ReplicationSlot, ValueResolver, WalMessage, WalPoll, WalStream,
};
use crate::transaction::TransactionBuffer;

/// Commit timestamp stamped on every built message.
pub const PAYLOAD_TIMESTAMP: &str = "2023-06-01 12:00:00+00";

/// Slot name the default fixtures use.
pub const SLOT_NAME: &str = "pipelinewise_shop";

/// How a scripted slot behaves once its polls are used up.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    Drained,
    /// Nothing arrives, but the slot never reports drained.
    Idle,
    Error(String),
}

#[derive(Debug, Default)]
struct Observed {
    opened: Mutex<Vec<(String, Lsn, Wal2JsonOptions)>>,
    feedback: Mutex<Vec<Lsn>>,
    closed: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory [`LogicalReplicationSource`].
#[derive(Debug, Clone)]
pub struct FakeLogicalSource {
    version_num: u32,
    current_lsn: Lsn,
    slots: HashMap<String, ReplicationSlot>,
    polls: Vec<WalPoll>,
    end: StreamEnd,
    observed: Arc<Observed>,
}

impl Default for FakeLogicalSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLogicalSource {
    /// A PostgreSQL 15.4 server without slots.
    pub fn new() -> Self {
        Self {
            version_num: 150004,
            current_lsn: Lsn(0),
            slots: HashMap::new(),
            polls: Vec::new(),
            end: StreamEnd::Drained,
            observed: Arc::default(),
        }
    }

    pub fn with_version(mut self, version_num: u32) -> Self {
        self.version_num = version_num;
        self
    }

    pub fn with_current_lsn(mut self, lsn: u64) -> Self {
        self.current_lsn = Lsn(lsn);
        self
    }

    pub fn with_slot(mut self, name: &str, plugin: &str, confirmed_flush_lsn: Option<Lsn>) -> Self {
        self.slots.insert(
            name.to_string(),
            ReplicationSlot {
                slot_name: name.to_string(),
                plugin: plugin.to_string(),
                confirmed_flush_lsn,
            },
        );
        self
    }

    /// The default `pipelinewise_shop` wal2json slot.
    pub fn with_default_slot(self) -> Self {
        self.with_slot(SLOT_NAME, OUTPUT_PLUGIN, None)
    }

    pub fn with_messages(mut self, messages: impl IntoIterator<Item = WalMessage>) -> Self {
        self.polls.extend(messages.into_iter().map(WalPoll::Message));
        self
    }

    /// One empty poll at this point of the script.
    pub fn then_pending(mut self) -> Self {
        self.polls.push(WalPoll::Pending);
        self
    }

    pub fn ending_with(mut self, end: StreamEnd) -> Self {
        self.end = end;
        self
    }

    /// Slot, start LSN and options of every open so far.
    pub fn opened(&self) -> Vec<(String, Lsn, Wal2JsonOptions)> {
        lock(&self.observed.opened).clone()
    }

    /// Every LSN acknowledged through [`WalStream::send_feedback`].
    pub fn feedback(&self) -> Vec<Lsn> {
        lock(&self.observed.feedback).clone()
    }

    pub fn close_count(&self) -> usize {
        self.observed.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogicalReplicationSource for FakeLogicalSource {
    async fn server_version_num(&self) -> Result<u32> {
        Ok(self.version_num)
    }

    async fn current_wal_lsn(&self, _server_version_num: u32) -> Result<Lsn> {
        Ok(self.current_lsn)
    }

    async fn replication_slot(&self, slot_name: &str) -> Result<Option<ReplicationSlot>> {
        Ok(self.slots.get(slot_name).cloned())
    }

    async fn open_stream(
        &self,
        slot: &ReplicationSlot,
        start: Lsn,
        options: &Wal2JsonOptions,
    ) -> Result<Box<dyn WalStream>> {
        lock(&self.observed.opened).push((slot.slot_name.clone(), start, options.clone()));
        // scripted messages are in commit order, framed the way a slot frames them
        let mut transactions = TransactionBuffer::new(start);
        let mut polls = VecDeque::new();
        for poll in &self.polls {
            match poll {
                WalPoll::Message(message) => polls.extend(
                    transactions
                        .push(message.clone())
                        .into_iter()
                        .map(WalPoll::Message),
                ),
                other => polls.push_back(other.clone()),
            }
        }
        Ok(Box::new(ScriptedSlot {
            polls,
            end: self.end.clone(),
            observed: Arc::clone(&self.observed),
        }))
    }
}

struct ScriptedSlot {
    polls: VecDeque<WalPoll>,
    end: StreamEnd,
    observed: Arc<Observed>,
}

#[async_trait]
impl WalStream for ScriptedSlot {
    async fn poll(&mut self) -> Result<WalPoll> {
        if let Some(poll) = self.polls.pop_front() {
            return Ok(poll);
        }
        match &self.end {
            StreamEnd::Drained => Ok(WalPoll::Drained),
            StreamEnd::Idle => Ok(WalPoll::Pending),
            StreamEnd::Error(message) => Err(CdcError::stream(
                "peeking replication slot",
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, message.clone()),
            )),
        }
    }

    async fn send_feedback(&mut self, flush: Lsn) -> Result<()> {
        lock(&self.observed.feedback).push(flush);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.observed.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// [`ValueResolver`] answering from fixed conversions.
#[derive(Debug, Clone, Default)]
pub struct FakeResolver {
    arrays: HashMap<(String, String), serde_json::Value>,
    hstores: HashMap<String, Vec<Option<String>>>,
}

impl FakeResolver {
    pub fn with_array(mut self, literal: &str, cast: &str, json: serde_json::Value) -> Self {
        self.arrays
            .insert((literal.to_string(), cast.to_string()), json);
        self
    }

    pub fn with_hstore(mut self, literal: &str, items: &[Option<&str>]) -> Self {
        self.hstores.insert(
            literal.to_string(),
            items.iter().map(|i| i.map(str::to_string)).collect(),
        );
        self
    }
}

fn malformed(literal: &str) -> CdcError {
    CdcError::stream(
        "resolving value",
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("malformed literal: \"{literal}\""),
        ),
    )
}

#[async_trait]
impl ValueResolver for FakeResolver {
    async fn cast_array(&self, literal: &str, cast_type: &str) -> Result<serde_json::Value> {
        self.arrays
            .get(&(literal.to_string(), cast_type.to_string()))
            .cloned()
            .ok_or_else(|| malformed(literal))
    }

    async fn hstore_to_array(&self, literal: &str) -> Result<Vec<Option<String>>> {
        self.hstores
            .get(literal)
            .cloned()
            .ok_or_else(|| malformed(literal))
    }
}

/// Committed state another process may replace while a run is going on.
#[derive(Debug, Clone, Default)]
pub struct SharedCommittedState {
    state: Arc<Mutex<Option<State>>>,
}

impl SharedCommittedState {
    pub fn new(state: State) -> Self {
        Self {
            state: Arc::new(Mutex::new(Some(state))),
        }
    }

    pub fn set(&self, state: State) {
        *lock(&self.state) = Some(state);
    }
}

#[async_trait]
impl CommittedStateReader for SharedCommittedState {
    async fn read_committed(&self) -> Option<State> {
        lock(&self.state).clone()
    }
}

/// A selected LOG_BASED entry for `schema.table` with the given column
/// types. `id` is always present as the integer key.
pub fn pg_catalog_entry(schema: &str, table: &str, columns: &[(&str, &str)]) -> StreamCatalogEntry {
    let mut properties = serde_json::Map::new();
    properties.insert("id".to_string(), json!({"type": ["null", "integer"]}));
    let mut metadata = vec![
        json!({
            "breadcrumb": [],
            "metadata": {
                "selected": true,
                "replication-method": "LOG_BASED",
                "schema-name": schema,
                "table-key-properties": ["id"]
            }
        }),
        json!({
            "breadcrumb": ["properties", "id"],
            "metadata": {"inclusion": "automatic", "sql-datatype": "integer"}
        }),
    ];
    for (column, sql_datatype) in columns {
        properties.insert(column.to_string(), json!({"type": ["null", "string"]}));
        metadata.push(json!({
            "breadcrumb": ["properties", column],
            "metadata": {
                "inclusion": "available",
                "selected-by-default": true,
                "sql-datatype": sql_datatype
            }
        }));
    }
    serde_json::from_value(json!({
        "tap_stream_id": format!("{schema}-{table}"),
        "stream": table,
        "table_name": table,
        "schema": {"type": "object", "properties": properties},
        "metadata": metadata
    }))
    .unwrap_or_else(|e| panic!("invalid catalog fixture: {e}"))
}

pub fn wal_message(lsn: u64, payload: serde_json::Value) -> WalMessage {
    WalMessage {
        data_start: Lsn(lsn),
        payload: payload.to_string(),
    }
}

fn wal_columns(columns: &[(&str, &str, serde_json::Value)]) -> serde_json::Value {
    columns
        .iter()
        .map(|(name, type_name, value)| json!({"name": name, "type": type_name, "value": value}))
        .collect()
}

fn row_change(
    action: &str,
    lsn: u64,
    schema: &str,
    table: &str,
    image: &str,
    columns: &[(&str, &str, serde_json::Value)],
) -> WalMessage {
    let mut payload = json!({
        "action": action,
        "timestamp": PAYLOAD_TIMESTAMP,
        "lsn": Lsn(lsn).to_string(),
        "schema": schema,
        "table": table,
    });
    payload[image] = wal_columns(columns);
    wal_message(lsn, payload)
}

pub fn insert_message(
    lsn: u64,
    schema: &str,
    table: &str,
    columns: &[(&str, &str, serde_json::Value)],
) -> WalMessage {
    row_change("I", lsn, schema, table, "columns", columns)
}

pub fn update_message(
    lsn: u64,
    schema: &str,
    table: &str,
    columns: &[(&str, &str, serde_json::Value)],
) -> WalMessage {
    row_change("U", lsn, schema, table, "columns", columns)
}

pub fn delete_message(
    lsn: u64,
    schema: &str,
    table: &str,
    identity: &[(&str, &str, serde_json::Value)],
) -> WalMessage {
    row_change("D", lsn, schema, table, "identity", identity)
}

/// An insert of `id` and `name` into `schema.table`.
pub fn user_insert(lsn: u64, schema: &str, table: &str, id: i64, name: &str) -> WalMessage {
    insert_message(
        lsn,
        schema,
        table,
        &[
            ("id", "integer", json!(id)),
            ("name", "character varying(255)", json!(name)),
        ],
    )
}

/// Opens a transaction whose first change is at `lsn`.
pub fn begin_message(lsn: u64) -> WalMessage {
    wal_message(lsn, json!({"action": "B"}))
}

/// Commits the open transaction at `lsn`.
pub fn commit_message(lsn: u64) -> WalMessage {
    wal_message(lsn, json!({"action": "C"}))
}
