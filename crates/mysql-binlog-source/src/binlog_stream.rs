//! Binlog dump over `mysql_async`.
//!
//! Raw events are converted into the owned [`BinlogEvent`] model: table
//! maps are resolved against the dump's cache, column names come from the
//! table map's optional metadata or from `information_schema`, ENUM and SET
//! values are replaced by their labels, and binary JSON is decoded.

use async_trait::async_trait;
use checkpoint::{Gtid, GtidInterval, MariaDbGtid, MySqlGtid};
use futures::StreamExt;
use mysql_async::binlog::events::{
    Event, EventData as RawEventData, OptionalMetadataField, RowsEventData, TableMapEvent,
};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, GnoInterval, Opts, Pool, Sid, Value};
use std::collections::HashMap;
use sync_core::{CdcError, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::{
    BinlogEvent, EventData, EventHeader, RowChange, RowsEvent, RowsKind, WireColumn, WireValue,
};
use crate::source::{BinlogEventStream, StartPosition};

/// MariaDB writes its GTIDs as a dedicated event type.
const MARIADB_GTID_EVENT: u8 = 162;

/// Open a dump connection at `start`.
pub(crate) async fn open(
    opts: Opts,
    pool: Pool,
    start: &StartPosition,
    server_id: u32,
) -> Result<MySqlBinlogStream> {
    let stream = start_dump(opts.clone(), start, server_id).await?;
    Ok(MySqlBinlogStream {
        opts,
        pool,
        server_id,
        stream,
        columns: HashMap::new(),
        reconnect_gtid: None,
        reconnected: false,
    })
}

async fn start_dump(opts: Opts, start: &StartPosition, server_id: u32) -> Result<BinlogStream> {
    let mut conn = Conn::new(opts)
        .await
        .map_err(|e| CdcError::stream("connecting for binlog dump", e))?;

    let request = match start {
        StartPosition::Binlog(position) => BinlogStreamRequest::new(server_id)
            .with_filename(position.log_file.as_bytes())
            .with_pos(position.log_pos),
        StartPosition::Gtid(Gtid::MySql(gtid)) => {
            let executed = gtid.executed_through();
            let mut sid = Sid::new(executed.server_uuid.into_bytes());
            for interval in &executed.intervals {
                // GnoInterval is half-open
                sid = sid.with_interval(GnoInterval::new(interval.start, interval.end + 1));
            }
            BinlogStreamRequest::new(server_id)
                .with_gtid()
                .with_gtid_set(vec![sid])
        }
        StartPosition::Gtid(Gtid::MariaDb(gtid)) => {
            for sql in [
                format!("SET @slave_connect_state='{gtid}'"),
                "SET @slave_gtid_strict_mode=0".to_string(),
                "SET @mariadb_slave_capability=4".to_string(),
            ] {
                conn.query_drop(&sql)
                    .await
                    .map_err(|e| CdcError::stream(format!("preparing MariaDB dump: {sql}"), e))?;
            }
            BinlogStreamRequest::new(server_id).with_pos(4)
        }
    };

    info!("Starting binlog dump at {}", start);
    conn.get_binlog_stream(request)
        .await
        .map_err(|e| CdcError::stream(format!("starting binlog dump at {start}"), e))
}

/// Column names and ENUM/SET labels of one table, in ordinal order.
#[derive(Debug, Clone, Default)]
struct TableColumns {
    names: Vec<String>,
    labels: Vec<Option<Vec<String>>>,
    /// Table map column count this entry was fetched for.
    fetched_for: usize,
}

/// A rows event whose column names are not resolved yet.
struct PendingRows {
    header: EventHeader,
    kind: RowsKind,
    database: String,
    table: String,
    types: Vec<ColumnType>,
    metadata_names: Vec<String>,
    rows: Vec<(Option<Vec<WireValue>>, Option<Vec<WireValue>>)>,
}

enum Converted {
    Ready(BinlogEvent),
    Rows(PendingRows),
}

pub struct MySqlBinlogStream {
    opts: Opts,
    pool: Pool,
    server_id: u32,
    stream: BinlogStream,
    columns: HashMap<(String, String), TableColumns>,
    reconnect_gtid: Option<Gtid>,
    reconnected: bool,
}

impl MySqlBinlogStream {
    /// Re-open the dump after the last seen GTID, once per stream.
    async fn try_reconnect(&mut self, cause: &str) -> Result<bool> {
        let Some(gtid) = self.reconnect_gtid.clone() else {
            return Ok(false);
        };
        if self.reconnected {
            return Ok(false);
        }
        warn!("Binlog dump {}; re-opening after GTID {}", cause, gtid);
        self.reconnected = true;
        self.stream = start_dump(self.opts.clone(), &StartPosition::Gtid(gtid), self.server_id).await?;
        Ok(true)
    }

    fn convert(&self, event: &Event) -> Result<Converted> {
        let raw_header = event.header();
        let header = EventHeader {
            timestamp: raw_header.timestamp(),
            log_pos: u64::from(raw_header.log_pos()),
            server_id: raw_header.server_id(),
        };
        let other = || {
            Ok(Converted::Ready(BinlogEvent {
                header,
                data: EventData::Other,
            }))
        };

        if raw_header.event_type_raw() == MARIADB_GTID_EVENT {
            let gtid = parse_mariadb_gtid(event.data(), header.server_id)?;
            return Ok(Converted::Ready(BinlogEvent {
                header,
                data: EventData::Gtid(Gtid::MariaDb(gtid)),
            }));
        }

        let data = event
            .read_data()
            .map_err(|e| CdcError::stream("parsing binlog event", e))?;
        let Some(data) = data else {
            return other();
        };
        match data {
            RawEventData::RotateEvent(rotate) => Ok(Converted::Ready(BinlogEvent {
                header,
                data: EventData::Rotate {
                    next_log_file: rotate.name().into_owned(),
                    position: rotate.position(),
                },
            })),
            RawEventData::GtidEvent(gtid) => {
                let gtid = Gtid::MySql(MySqlGtid {
                    server_uuid: Uuid::from_bytes(gtid.sid()),
                    intervals: vec![GtidInterval {
                        start: gtid.gno(),
                        end: gtid.gno(),
                    }],
                });
                Ok(Converted::Ready(BinlogEvent {
                    header,
                    data: EventData::Gtid(gtid),
                }))
            }
            RawEventData::RowsEvent(rows_event) => {
                let table_id = rows_event.table_id();
                let tme = self.stream.get_tme(table_id).ok_or_else(|| {
                    CdcError::stream(
                        "decoding rows event",
                        format!("no table map for table id {table_id}"),
                    )
                })?;
                let kind = match &rows_event {
                    RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => {
                        RowsKind::Write
                    }
                    RowsEventData::UpdateRowsEvent(_)
                    | RowsEventData::UpdateRowsEventV1(_)
                    | RowsEventData::PartialUpdateRowsEvent(_) => RowsKind::Update,
                    RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => {
                        RowsKind::Delete
                    }
                };
                let mut rows = Vec::new();
                for row in rows_event.rows(tme) {
                    let (before, after) =
                        row.map_err(|e| CdcError::stream("decoding binlog row", e))?;
                    rows.push((before.as_ref().map(wire_row), after.as_ref().map(wire_row)));
                }
                Ok(Converted::Rows(PendingRows {
                    header,
                    kind,
                    database: tme.database_name().into_owned(),
                    table: tme.table_name().into_owned(),
                    types: column_types(tme),
                    metadata_names: metadata_column_names(tme),
                    rows,
                }))
            }
            _ => other(),
        }
    }

    async fn table_columns(&mut self, database: &str, table: &str, count: usize) -> TableColumns {
        let key = (database.to_string(), table.to_string());
        if let Some(cached) = self.columns.get(&key) {
            if cached.fetched_for == count {
                return cached.clone();
            }
        }
        let columns = match fetch_table_columns(&self.pool, database, table).await {
            Ok((names, labels)) => TableColumns {
                names,
                labels,
                fetched_for: count,
            },
            Err(e) => {
                warn!(
                    "Could not read column names of {}.{}: {}",
                    database, table, e
                );
                TableColumns {
                    fetched_for: count,
                    ..Default::default()
                }
            }
        };
        debug!(
            "Cached {} columns for {}.{}",
            columns.names.len(),
            database,
            table
        );
        self.columns.insert(key, columns.clone());
        columns
    }

    async fn resolve(&mut self, pending: PendingRows) -> BinlogEvent {
        let count = pending.types.len();
        let known = self
            .table_columns(&pending.database, &pending.table, count)
            .await;

        let columns: Vec<WireColumn> = pending
            .types
            .iter()
            .enumerate()
            .map(|(i, column_type)| {
                let name = pending
                    .metadata_names
                    .get(i)
                    .or_else(|| known.names.get(i))
                    .cloned()
                    .unwrap_or_else(|| format!("__dropped_col_{i}__"));
                WireColumn::new(name, *column_type)
            })
            .collect();

        let label = |image: Vec<WireValue>| -> Vec<WireValue> {
            image
                .into_iter()
                .enumerate()
                .map(|(i, value)| match (pending.types.get(i), known.labels.get(i)) {
                    (Some(column_type), Some(Some(labels))) => {
                        apply_labels(*column_type, labels, value)
                    }
                    _ => value,
                })
                .collect()
        };
        let rows = pending
            .rows
            .into_iter()
            .map(|(before, after)| RowChange {
                before: before.map(label),
                after: after.map(label),
            })
            .collect();

        BinlogEvent {
            header: pending.header,
            data: EventData::Rows(RowsEvent {
                kind: pending.kind,
                database: pending.database,
                table: pending.table,
                columns,
                rows,
            }),
        }
    }
}

#[async_trait]
impl BinlogEventStream for MySqlBinlogStream {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        let event = loop {
            match self.stream.next().await {
                Some(Ok(event)) => break event,
                Some(Err(e)) => {
                    if self.try_reconnect(&format!("failed: {e}")).await? {
                        continue;
                    }
                    return Err(CdcError::stream("reading binlog event", e));
                }
                None => {
                    if self.try_reconnect("ended unexpectedly").await? {
                        continue;
                    }
                    return Ok(None);
                }
            }
        };
        match self.convert(&event)? {
            Converted::Ready(event) => Ok(Some(event)),
            Converted::Rows(pending) => Ok(Some(self.resolve(pending).await)),
        }
    }

    fn reconnect_from(&mut self, gtid: &Gtid) {
        self.reconnect_gtid = Some(gtid.clone());
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close()
            .await
            .map_err(|e| CdcError::stream("closing binlog dump", e))
    }
}

fn column_types(tme: &TableMapEvent<'_>) -> Vec<ColumnType> {
    (0..tme.columns_count() as usize)
        .map(|i| {
            tme.get_column_type(i)
                .ok()
                .flatten()
                .unwrap_or(ColumnType::MYSQL_TYPE_NULL)
        })
        .collect()
}

/// Names from the table map, present with `binlog_row_metadata=FULL`.
fn metadata_column_names(tme: &TableMapEvent<'_>) -> Vec<String> {
    let mut names = Vec::new();
    for field in tme.iter_optional_meta().flatten() {
        if let OptionalMetadataField::ColumnName(column_names) = field {
            names.extend(
                column_names
                    .iter_names()
                    .flatten()
                    .map(|n| n.name().into_owned()),
            );
        }
    }
    names
}

fn wire_row(row: &BinlogRow) -> Vec<WireValue> {
    (0..row.len())
        .map(|i| match row.as_ref(i) {
            None => WireValue::Value(Value::NULL),
            Some(BinlogValue::Value(value)) => WireValue::Value(value.clone()),
            Some(BinlogValue::Jsonb(jsonb)) => match serde_json::Value::try_from(jsonb.clone()) {
                Ok(json) => WireValue::Json(json),
                Err(e) => {
                    warn!("Undecodable binary JSON value: {}", e);
                    WireValue::Value(Value::NULL)
                }
            },
            Some(BinlogValue::JsonDiff(_)) => {
                warn!("Partial JSON update in binlog; set binlog_row_value_options='' for full images");
                WireValue::Value(Value::NULL)
            }
        })
        .collect()
}

async fn fetch_table_columns(
    pool: &Pool,
    database: &str,
    table: &str,
) -> std::result::Result<(Vec<String>, Vec<Option<Vec<String>>>), mysql_async::Error> {
    let mut conn = pool.get_conn().await?;
    let rows: Vec<(String, String)> = conn
        .exec(
            "SELECT COLUMN_NAME, CAST(COLUMN_TYPE AS CHAR) FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
            (database, table),
        )
        .await?;
    Ok(rows
        .into_iter()
        .map(|(name, column_type)| (name, parse_enum_labels(&column_type)))
        .unzip())
}

/// Labels of an `enum('a','b')` or `set('x','y')` column type.
pub fn parse_enum_labels(column_type: &str) -> Option<Vec<String>> {
    let lower = column_type.to_ascii_lowercase();
    let body = if lower.starts_with("enum(") {
        &column_type[5..]
    } else if lower.starts_with("set(") {
        &column_type[4..]
    } else {
        return None;
    };
    let body = body.strip_suffix(')')?;

    let mut labels = Vec::new();
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\'' {
            continue;
        }
        let mut label = String::new();
        while let Some(c) = chars.next() {
            match c {
                '\'' if chars.peek() == Some(&'\'') => {
                    chars.next();
                    label.push('\'');
                }
                '\'' => break,
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        label.push(escaped);
                    }
                }
                c => label.push(c),
            }
        }
        labels.push(label);
    }
    Some(labels)
}

/// ENUM values arrive as 1-based indexes, SET values as bitmasks.
fn apply_labels(column_type: ColumnType, labels: &[String], value: WireValue) -> WireValue {
    let index = match &value {
        WireValue::Value(Value::Int(i)) => u64::try_from(*i).ok(),
        WireValue::Value(Value::UInt(u)) => Some(*u),
        _ => None,
    };
    let Some(index) = index else {
        return value;
    };
    let text = match column_type {
        ColumnType::MYSQL_TYPE_SET => labels
            .iter()
            .enumerate()
            .filter(|(bit, _)| *bit < 64 && index & (1u64 << bit) != 0)
            .map(|(_, label)| label.as_str())
            .collect::<Vec<_>>()
            .join(","),
        ColumnType::MYSQL_TYPE_ENUM => usize::try_from(index)
            .ok()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| labels.get(i))
            .cloned()
            .unwrap_or_default(),
        _ => return value,
    };
    WireValue::Value(Value::Bytes(text.into_bytes()))
}

/// MariaDB GTID event body: sequence (u64 LE), domain (u32 LE), flags.
fn parse_mariadb_gtid(payload: &[u8], server_id: u32) -> Result<MariaDbGtid> {
    let (Some(sequence), Some(domain)) = (payload.get(0..8), payload.get(8..12)) else {
        return Err(CdcError::stream(
            "parsing MariaDB GTID event",
            format!("payload of {} bytes is too short", payload.len()),
        ));
    };
    let mut sequence_bytes = [0u8; 8];
    sequence_bytes.copy_from_slice(sequence);
    let mut domain_bytes = [0u8; 4];
    domain_bytes.copy_from_slice(domain);
    Ok(MariaDbGtid {
        domain_id: u32::from_le_bytes(domain_bytes),
        server_id,
        sequence: u64::from_le_bytes(sequence_bytes),
    })
}
