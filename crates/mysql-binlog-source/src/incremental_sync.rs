//! MySQL binlog replication loop.
//!
//! One invocation reads the binlog from the oldest bookmark of the
//! selected streams up to the server position captured before the dump is
//! opened, emitting RECORD messages for subscribed tables and STATE
//! messages every `update_bookmark_period` events.
//!
//! ```text
//! bookmarks ──► resume position ──► binlog dump ──► decoder ──► RECORD
//!                                        │                        │
//!                                        └── position ──► store ──► STATE
//! ```

use chrono::Utc;
use checkpoint::{BinlogPosition, BookmarkStore, Gtid, ResumeOrigin, State};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use sync_core::{
    add_automatic_columns, AutomaticColumn, Catalog, CdcError, Discovery, LoopState, Message,
    MessageSink, Result, SchemaRefresher, StreamRegistry, SyncCounters, SyncOutcome,
};
use tracing::{debug, info, warn};

use crate::checkpoint::{
    fetch_current_gtid, fetch_current_log_file_and_pos, verify_binlog_config,
    verify_gtid_available, verify_gtid_config, verify_log_file_exists, MySqlPosition,
    BINLOG_BOOKMARK_KEYS,
};
use crate::config::MySqlBinlogConfig;
use crate::decoder::BinlogDecoder;
use crate::event::{BinlogEvent, EventData, EventHeader, RowsEvent};
use crate::source::{BinlogEventStream, BinlogSource, StartPosition};

/// Run one binlog replication pass.
///
/// `baseline` stands in for streams that have no bookmark yet; without it
/// every selected stream must already hold one. The returned outcome carries
/// the final state, which was also the last STATE message written.
pub async fn run_incremental_sync(
    config: &MySqlBinlogConfig,
    source: &dyn BinlogSource,
    catalog: &Catalog,
    state: State,
    discovery: Arc<dyn Discovery>,
    sink: &mut dyn MessageSink,
    baseline: Option<StartPosition>,
) -> Result<SyncOutcome<Arc<State>, MySqlPosition>> {
    let mut loop_state = LoopState::Init;
    let mut store = BookmarkStore::new(state);
    let counters = SyncCounters::new(config.update_bookmark_period);

    let automatic_columns = vec![AutomaticColumn::soft_delete()];
    let mut registry = StreamRegistry::new(catalog.log_based_streams().cloned());
    for entry in registry.entries_mut() {
        add_automatic_columns(entry, &automatic_columns);
    }
    let streams = registry.tap_stream_ids().to_vec();

    if streams.is_empty() {
        info!("No log-based streams selected, nothing to replicate");
        let snapshot = store.snapshot();
        sink.write_message(&Message::state(snapshot.to_value()))?;
        loop_state.transition_to(LoopState::CaughtUp);
        return Ok(SyncOutcome {
            exit: loop_state,
            state: snapshot,
            final_position: None,
            counters,
        });
    }

    verify_binlog_config(source).await?;
    if config.use_gtid {
        verify_gtid_config(source, config.engine).await?;
    }

    let start = resume_position(config, source, &store, &streams, baseline).await?;
    let binlog_marker = fetch_current_log_file_and_pos(source).await?;
    let gtid_marker = if config.use_gtid {
        Some(fetch_current_gtid(source, config.engine).await?)
    } else {
        None
    };
    info!(
        "Replicating {} streams from {} up to {}{}",
        streams.len(),
        start,
        binlog_marker,
        gtid_marker
            .as_ref()
            .map(|g| format!(" / GTID {g}"))
            .unwrap_or_default()
    );

    store.whitelist_bookmark_keys(&streams, BINLOG_BOOKMARK_KEYS);

    let mut versions = HashMap::new();
    for entry in registry.entries() {
        let version = store.stream_version(entry.tap_stream_id());
        versions.insert(entry.tap_stream_id().to_string(), version);
        sink.write_message(&Message::schema_for(entry.catalog(), &[]))?;
    }

    let start_position = match &start {
        StartPosition::Binlog(p) => MySqlPosition::at_binlog(p.clone()),
        StartPosition::Gtid(g) => MySqlPosition::at_gtid(g.clone()),
    };
    let already_caught_up = match (&start, &gtid_marker) {
        (StartPosition::Gtid(g), Some(marker)) => at_or_past(g, marker),
        (StartPosition::Binlog(p), _) => p >= &binlog_marker,
        (StartPosition::Gtid(_), None) => false,
    };
    if already_caught_up {
        info!("Bookmarks are at the current server position {}, nothing to read", start);
        let snapshot = store.snapshot();
        sink.write_message(&Message::state(snapshot.to_value()))?;
        loop_state.transition_to(LoopState::CaughtUp);
        return Ok(SyncOutcome {
            exit: loop_state,
            state: snapshot,
            final_position: Some(start_position),
            counters,
        });
    }

    let server_id = config.server_id();
    let mut stream = source.open_stream(&start, server_id).await?;
    info!("Opened binlog dump as replica {} at {}", server_id, start);
    loop_state.transition_to(LoopState::Streaming);

    let refresher = SchemaRefresher::new(discovery, automatic_columns, vec![]);
    let mut replication = BinlogReplication {
        config,
        streams,
        registry,
        store,
        counters,
        versions,
        refresher,
        decoder: BinlogDecoder::new(start_position, config.local_timezone),
        binlog_marker,
        gtid_marker,
        sink,
    };

    let result = replication.consume(stream.as_mut()).await;
    if let Err(e) = stream.close().await {
        warn!("Failed to close binlog dump: {}", e);
    }
    let exit = match result {
        Ok(exit) => exit,
        Err(e) => {
            loop_state.transition_to(LoopState::Error);
            loop_state.transition_to(LoopState::Closed);
            return Err(e);
        }
    };
    loop_state.transition_to(exit);

    let snapshot = replication.flush_state()?;
    loop_state.transition_to(LoopState::Closed);
    info!(
        "Binlog replication {} at {}: {} rows, {} events skipped",
        exit,
        replication.decoder.position(),
        replication.counters.rows_saved(),
        replication.counters.events_skipped()
    );

    Ok(SyncOutcome {
        exit,
        state: snapshot,
        final_position: Some(replication.decoder.position().clone()),
        counters: replication.counters,
    })
}

fn at_or_past(gtid: &Gtid, marker: &Gtid) -> bool {
    matches!(
        gtid.partial_cmp(marker),
        Some(Ordering::Greater | Ordering::Equal)
    )
}

fn resume_origin(origin: &ResumeOrigin) -> &str {
    match origin {
        ResumeOrigin::Bookmark(stream) => stream.as_str(),
        ResumeOrigin::Baseline => "baseline",
    }
}

async fn resume_position(
    config: &MySqlBinlogConfig,
    source: &dyn BinlogSource,
    store: &BookmarkStore,
    streams: &[String],
    baseline: Option<StartPosition>,
) -> Result<StartPosition> {
    if config.use_gtid {
        let baseline = match baseline {
            Some(StartPosition::Gtid(gtid)) => Some(gtid),
            Some(other) => {
                return Err(CdcError::configuration(
                    "use_gtid",
                    format!("baseline {other} is not a GTID"),
                ))
            }
            None => None,
        };
        let resume = store.compute_resume_position::<Gtid>(streams, baseline)?;
        verify_gtid_available(source, resume_origin(&resume.origin), &resume.position).await?;
        return Ok(StartPosition::Gtid(resume.position));
    }

    let baseline = match baseline {
        Some(StartPosition::Binlog(position)) => Some(position),
        Some(other) => {
            return Err(CdcError::configuration(
                "use_gtid",
                format!("baseline {other} requires GTID replication"),
            ))
        }
        None => None,
    };
    let resume = store.compute_resume_position::<BinlogPosition>(streams, baseline)?;
    verify_log_file_exists(source, resume_origin(&resume.origin), &resume.position).await?;
    Ok(StartPosition::Binlog(resume.position))
}

/// State of one running dump.
struct BinlogReplication<'a> {
    config: &'a MySqlBinlogConfig,
    streams: Vec<String>,
    registry: StreamRegistry,
    store: BookmarkStore,
    counters: SyncCounters,
    versions: HashMap<String, i64>,
    refresher: SchemaRefresher,
    decoder: BinlogDecoder,
    binlog_marker: BinlogPosition,
    gtid_marker: Option<Gtid>,
    sink: &'a mut dyn MessageSink,
}

impl BinlogReplication<'_> {
    async fn consume(&mut self, stream: &mut dyn BinlogEventStream) -> Result<LoopState> {
        loop {
            let next = match self.config.read_timeout() {
                Some(timeout) => match tokio::time::timeout(timeout, stream.next_event()).await {
                    Ok(next) => next?,
                    Err(_) => {
                        info!("No binlog event within {:?}, stopping", timeout);
                        return Ok(LoopState::TimedOut);
                    }
                },
                None => stream.next_event().await?,
            };
            let Some(event) = next else {
                info!("Server ended the binlog dump");
                return Ok(LoopState::CaughtUp);
            };

            if let EventData::Gtid(gtid) = &event.data {
                if let Some(marker) = &self.gtid_marker {
                    if gtid.partial_cmp(marker) == Some(Ordering::Greater) {
                        info!("Reached GTID {} past {}, stopping", gtid, marker);
                        return Ok(LoopState::CaughtUp);
                    }
                }
                stream.reconnect_from(gtid);
            }

            self.handle_event(&event).await?;

            if self.counters.flush_due() {
                self.flush_state()?;
            }
            if self.reached_binlog_marker() {
                debug!(
                    "Reached binlog position {} captured at start",
                    self.binlog_marker
                );
                return Ok(LoopState::CaughtUp);
            }
        }
    }

    async fn handle_event(&mut self, event: &BinlogEvent) -> Result<()> {
        let observed = self.decoder.observe(event);
        match &event.data {
            EventData::Rotate { .. } => {
                if let Some(change) = observed {
                    self.advance(&change.event_position);
                }
                Ok(())
            }
            EventData::Rows(rows) => self.handle_rows(rows, &event.header).await,
            EventData::Gtid(_) | EventData::Other => Ok(()),
        }
    }

    async fn handle_rows(&mut self, rows: &RowsEvent, header: &EventHeader) -> Result<()> {
        let Some(entry) =
            self.registry
                .resolve_or_skip(&rows.database, &rows.table, &mut self.counters)
        else {
            return Ok(());
        };
        let tap_stream_id = entry.tap_stream_id().to_string();

        let drifted = self.refresher.check(entry, rows.column_names());
        if !drifted.is_empty() {
            if let Some(entry) = self.registry.get_mut(&tap_stream_id) {
                self.refresher
                    .refresh(entry, drifted, &mut *self.sink)
                    .await?;
            }
        }

        let Some(entry) = self.registry.get(&tap_stream_id) else {
            return Ok(());
        };
        let changes = match self.decoder.decode_rows(rows, header, entry) {
            Ok(changes) => changes,
            Err(e) if !e.is_fatal() => {
                warn!(
                    "Skipping {:?} event on {}.{} at {}: {}",
                    rows.kind,
                    rows.database,
                    rows.table,
                    self.decoder.position(),
                    e
                );
                self.counters.record_skip();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let stream = entry.stream().to_string();
        let version = self.versions.get(&tap_stream_id).copied().unwrap_or_default();
        for change in changes {
            let message = change.into_record_message(&stream, version, Utc::now());
            self.sink.write_message(&message)?;
            self.counters.record_row(&tap_stream_id);
        }
        Ok(())
    }

    fn reached_binlog_marker(&self) -> bool {
        self.decoder
            .position()
            .binlog
            .as_ref()
            .map(|p| p >= &self.binlog_marker)
            .unwrap_or(false)
    }

    fn advance(&mut self, position: &MySqlPosition) -> Arc<State> {
        let mut snapshot = self.store.snapshot();
        if let Some(binlog) = &position.binlog {
            snapshot = self.store.advance(&self.streams, binlog);
        }
        if let Some(gtid) = &position.gtid {
            snapshot = self.store.advance(&self.streams, gtid);
        }
        snapshot
    }

    /// Advance every bookmark to the reader position and emit STATE.
    fn flush_state(&mut self) -> Result<Arc<State>> {
        let position = self.decoder.position().clone();
        let snapshot = self.advance(&position);
        self.sink.write_message(&Message::state(snapshot.to_value()))?;
        self.counters.mark_flushed();
        debug!(
            "Flushed state at {} ({} rows so far)",
            position,
            self.counters.rows_saved()
        );
        Ok(snapshot)
    }
}
