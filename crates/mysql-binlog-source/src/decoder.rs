//! Binlog event decoding.
//!
//! [`BinlogDecoder`] tracks the reader position across events and turns
//! row events into [`ChangeEvent`]s for one subscribed stream. Decoding a
//! row event does not move the position; the loop calls
//! [`BinlogDecoder::observe`] for every event first.

use chrono_tz::Tz;
use checkpoint::BinlogPosition;
use sync_core::{
    format_singer_datetime, CdcError, ChangeEvent, Operation, Record, Result, StreamEntry,
    TableKey, Value, SDC_DELETED_AT,
};
use tracing::trace;

use crate::checkpoint::MySqlPosition;
use crate::event::{BinlogEvent, EventData, EventHeader, RowsEvent, RowsKind, WireValue};
use crate::value::{coerce, ColumnContext};

#[derive(Debug, Clone)]
pub struct BinlogDecoder {
    position: MySqlPosition,
    local_timezone: Tz,
}

impl BinlogDecoder {
    pub fn new(start: MySqlPosition, local_timezone: Tz) -> Self {
        Self {
            position: start,
            local_timezone,
        }
    }

    /// Position right after the last observed event.
    pub fn position(&self) -> &MySqlPosition {
        &self.position
    }

    /// Move the position past `event`.
    ///
    /// Returns a position-only change for rotations and GTIDs, `None` for
    /// everything else.
    pub fn observe(&mut self, event: &BinlogEvent) -> Option<ChangeEvent<MySqlPosition>> {
        let timestamp = event.header.event_time();
        match &event.data {
            EventData::Rotate {
                next_log_file,
                position,
            } => {
                trace!("Rotate to {}:{}", next_log_file, position);
                self.position.binlog = Some(BinlogPosition::new(next_log_file.clone(), *position));
                Some(ChangeEvent::position_only(
                    Operation::Rotate,
                    self.position.clone(),
                    timestamp,
                ))
            }
            EventData::Gtid(gtid) => {
                self.position.gtid = Some(gtid.clone());
                self.advance_log_pos(&event.header);
                Some(ChangeEvent::position_only(
                    Operation::Metadata,
                    self.position.clone(),
                    timestamp,
                ))
            }
            EventData::Rows(_) | EventData::Other => {
                self.advance_log_pos(&event.header);
                None
            }
        }
    }

    fn advance_log_pos(&mut self, header: &EventHeader) {
        // Artificial events carry no position.
        if header.log_pos == 0 {
            return;
        }
        if let Some(binlog) = self.position.binlog.as_mut() {
            binlog.log_pos = header.log_pos;
        }
    }

    /// Decode every row of `rows` for `entry`.
    ///
    /// Inserts and updates take the after image, deletes the before image.
    /// Only desired columns that the schema describes are emitted.
    pub fn decode_rows(
        &self,
        rows: &RowsEvent,
        header: &EventHeader,
        entry: &StreamEntry,
    ) -> Result<Vec<ChangeEvent<MySqlPosition>>> {
        let stream = entry.tap_stream_id();
        let table_key = TableKey::new(&rows.database, &rows.table);
        let operation = match rows.kind {
            RowsKind::Write => Operation::Insert,
            RowsKind::Update => Operation::Update,
            RowsKind::Delete => Operation::Delete,
        };
        let event_time = header.event_time();
        let deleted_at = match rows.kind {
            RowsKind::Delete => Value::String(format_singer_datetime(&event_time)),
            _ => Value::Null,
        };

        let mut events = Vec::with_capacity(rows.rows.len());
        for row in &rows.rows {
            let image = match rows.kind {
                RowsKind::Delete => row.before.as_ref(),
                RowsKind::Write | RowsKind::Update => row.after.as_ref(),
            }
            .ok_or_else(|| {
                CdcError::decode(stream, format!("{operation} on {table_key} without a row image"))
            })?;
            let mut record = self.decode_image(rows, image, entry)?;
            if entry.is_desired(SDC_DELETED_AT) {
                record.insert(SDC_DELETED_AT.to_string(), deleted_at.clone());
            }
            events.push(ChangeEvent {
                operation,
                source_table_key: Some(table_key.clone()),
                column_values: record,
                event_position: self.position.clone(),
                event_timestamp: event_time,
            });
        }
        Ok(events)
    }

    fn decode_image(
        &self,
        rows: &RowsEvent,
        image: &[WireValue],
        entry: &StreamEntry,
    ) -> Result<Record> {
        let stream = entry.tap_stream_id();
        if image.len() != rows.columns.len() {
            return Err(CdcError::decode(
                stream,
                format!(
                    "row image has {} values for {} columns",
                    image.len(),
                    rows.columns.len()
                ),
            ));
        }
        let catalog = entry.catalog();
        let mut record = Record::new();
        for (column, value) in rows.columns.iter().zip(image) {
            if !entry.is_desired(&column.name) {
                continue;
            }
            let Some(schema) = catalog.schema.properties.get(&column.name) else {
                continue;
            };
            let context = ColumnContext {
                column_type: column.column_type,
                schema,
                sql_datatype: catalog.sql_datatype(&column.name),
                local_timezone: self.local_timezone,
            };
            let value = coerce(&context, value).map_err(|message| {
                CdcError::decode(stream, format!("column '{}': {message}", column.name))
            })?;
            record.insert(column.name.clone(), value);
        }
        Ok(record)
    }
}
