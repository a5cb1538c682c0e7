//! Testing utilities for the binlog source.
//!
//! [`FakeBinlogSource`] answers bookkeeping queries from a fixed set of
//! server variables and replays a scripted event list on every dump. The
//! event builders produce the owned events the `mysql_async` adapter would.

use async_trait::async_trait;
use checkpoint::{BinlogPosition, Gtid};
use mysql_async::consts::ColumnType;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use sync_core::{CdcError, Result};

use crate::event::{
    BinlogEvent, EventData, EventHeader, RowChange, RowsEvent, RowsKind, WireColumn, WireValue,
};
use crate::source::{BinaryLog, BinlogEventStream, BinlogSource, StartPosition};

/// `2023-06-01T12:00:00Z`, stamped on every built event.
pub const HEADER_TIMESTAMP: u32 = 1_685_620_800;

/// How a scripted dump ends once its events are used up.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    /// The server closes the dump.
    Eof,
    /// No further events ever arrive.
    Idle,
    /// The connection fails.
    Error(String),
}

#[derive(Debug, Default)]
struct Observed {
    opened: Mutex<Vec<(StartPosition, u32)>>,
    reconnects: Mutex<Vec<Gtid>>,
    closed: AtomicUsize,
}

/// In-memory [`BinlogSource`].
#[derive(Debug, Clone)]
pub struct FakeBinlogSource {
    variables: HashMap<String, String>,
    binary_logs: Vec<BinaryLog>,
    master_status: Option<BinlogPosition>,
    events: Vec<BinlogEvent>,
    end: StreamEnd,
    observed: Arc<Observed>,
}

impl Default for FakeBinlogSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBinlogSource {
    /// A correctly configured server: row based, full images, GTIDs on.
    pub fn new() -> Self {
        let variables = [
            ("binlog_format", "ROW"),
            ("binlog_row_image", "FULL"),
            ("gtid_mode", "ON"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            variables,
            binary_logs: Vec::new(),
            master_status: None,
            events: Vec::new(),
            end: StreamEnd::Eof,
            observed: Arc::default(),
        }
    }

    pub fn with_variable(mut self, name: &str, value: &str) -> Self {
        self.variables.insert(name.to_string(), value.to_string());
        self
    }

    pub fn without_variable(mut self, name: &str) -> Self {
        self.variables.remove(name);
        self
    }

    pub fn with_binary_log(mut self, log_name: &str, file_size: u64) -> Self {
        self.binary_logs.push(BinaryLog {
            log_name: log_name.to_string(),
            file_size,
        });
        self
    }

    pub fn with_master_status(mut self, position: BinlogPosition) -> Self {
        self.master_status = Some(position);
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = BinlogEvent>) -> Self {
        self.events.extend(events);
        self
    }

    pub fn ending_with(mut self, end: StreamEnd) -> Self {
        self.end = end;
        self
    }

    /// Start positions and server ids of every dump opened so far.
    pub fn opened(&self) -> Vec<(StartPosition, u32)> {
        lock(&self.observed.opened).clone()
    }

    /// GTIDs passed to [`BinlogEventStream::reconnect_from`].
    pub fn reconnects(&self) -> Vec<Gtid> {
        lock(&self.observed.reconnects).clone()
    }

    pub fn close_count(&self) -> usize {
        self.observed.closed.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl BinlogSource for FakeBinlogSource {
    async fn server_variable(&self, name: &str) -> Result<Option<String>> {
        Ok(self.variables.get(name).cloned())
    }

    async fn binary_logs(&self) -> Result<Vec<BinaryLog>> {
        Ok(self.binary_logs.clone())
    }

    async fn master_status(&self) -> Result<Option<BinlogPosition>> {
        Ok(self.master_status.clone())
    }

    async fn open_stream(
        &self,
        start: &StartPosition,
        server_id: u32,
    ) -> Result<Box<dyn BinlogEventStream>> {
        lock(&self.observed.opened).push((start.clone(), server_id));
        Ok(Box::new(ScriptedStream {
            events: self.events.iter().cloned().collect(),
            end: self.end.clone(),
            observed: Arc::clone(&self.observed),
        }))
    }
}

struct ScriptedStream {
    events: VecDeque<BinlogEvent>,
    end: StreamEnd,
    observed: Arc<Observed>,
}

#[async_trait]
impl BinlogEventStream for ScriptedStream {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        match &self.end {
            StreamEnd::Eof => Ok(None),
            StreamEnd::Idle => std::future::pending().await,
            StreamEnd::Error(message) => Err(CdcError::stream(
                "reading binlog event",
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, message.clone()),
            )),
        }
    }

    fn reconnect_from(&mut self, gtid: &Gtid) {
        lock(&self.observed.reconnects).push(gtid.clone());
    }

    async fn close(&mut self) -> Result<()> {
        self.observed.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn header(log_pos: u64) -> EventHeader {
    EventHeader {
        timestamp: HEADER_TIMESTAMP,
        log_pos,
        server_id: 1,
    }
}

/// The rotate event a dump starts with, or one written on file switch.
pub fn rotate_event(next_log_file: &str, position: u64) -> BinlogEvent {
    BinlogEvent {
        header: header(0),
        data: EventData::Rotate {
            next_log_file: next_log_file.to_string(),
            position,
        },
    }
}

pub fn gtid_event(gtid: &str, log_pos: u64) -> BinlogEvent {
    let gtid = Gtid::parse(gtid).unwrap_or_else(|e| panic!("invalid GTID fixture: {e}"));
    BinlogEvent {
        header: header(log_pos),
        data: EventData::Gtid(gtid),
    }
}

/// Query, XID and other events that only move the position.
pub fn other_event(log_pos: u64) -> BinlogEvent {
    BinlogEvent {
        header: header(log_pos),
        data: EventData::Other,
    }
}

pub fn rows_event(
    kind: RowsKind,
    database: &str,
    table: &str,
    columns: &[(&str, ColumnType)],
    rows: Vec<RowChange>,
    log_pos: u64,
) -> BinlogEvent {
    BinlogEvent {
        header: header(log_pos),
        data: EventData::Rows(RowsEvent {
            kind,
            database: database.to_string(),
            table: table.to_string(),
            columns: columns
                .iter()
                .map(|(name, column_type)| WireColumn::new(*name, *column_type))
                .collect(),
            rows,
        }),
    }
}

/// A single-row insert with `id` and `name` columns.
pub fn insert_event(database: &str, table: &str, id: i64, name: &str, log_pos: u64) -> BinlogEvent {
    rows_event(
        RowsKind::Write,
        database,
        table,
        &[
            ("id", ColumnType::MYSQL_TYPE_LONG),
            ("name", ColumnType::MYSQL_TYPE_VARCHAR),
        ],
        vec![RowChange {
            before: None,
            after: Some(vec![int(id), text(name)]),
        }],
        log_pos,
    )
}

pub fn int(value: i64) -> WireValue {
    WireValue::Value(mysql_async::Value::Int(value))
}

pub fn text(value: &str) -> WireValue {
    WireValue::Value(mysql_async::Value::Bytes(value.as_bytes().to_vec()))
}
