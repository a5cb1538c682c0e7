//! Logical replication loop.
//!
//! One invocation reads the wal2json slot from the oldest `lsn` bookmark of
//! the selected streams, emits RECORD messages for subscribed tables and
//! periodically STATE messages. Bookmarks only ever move to an LSN whose
//! changes were all emitted: several slot rows can share one LSN, so the
//! loop trails one distinct LSN behind what it is reading.
//!
//! ```text
//! bookmarks ──► start LSN ──► slot ──► wal2json ──► decoder ──► RECORD
//!                              ▲                                   │
//!      committed state ──► feedback         distinct LSNs ──► store ──► STATE
//! ```

use chrono::{DateTime, Utc};
use checkpoint::{BookmarkStore, CommittedStateReader, Lsn, ResumeOrigin, State};
use std::collections::HashMap;
use std::sync::Arc;
use sync_core::{
    add_automatic_columns, AutomaticColumn, Catalog, Discovery, LoopState, Message, MessageSink,
    Result, SchemaRefresher, StreamRegistry, SyncCounters, SyncOutcome,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::change::{Action, Wal2JsonMessage, Wal2JsonOptions};
use crate::checkpoint::{
    fetch_current_lsn, locate_replication_slot, verify_resume_position, verify_server_version,
    LOGICAL_BOOKMARK_KEYS,
};
use crate::config::PostgresLogicalConfig;
use crate::decoder::Wal2JsonDecoder;
use crate::source::{LogicalReplicationSource, ValueResolver, WalMessage, WalPoll, WalStream};

/// Run one logical replication pass.
///
/// `baseline` stands in for streams without an `lsn` bookmark. `committed`
/// is re-read every `poll_interval_seconds` to learn which LSN the
/// downstream target has durably stored; only that much of the slot is
/// acknowledged to the server.
#[allow(clippy::too_many_arguments)]
pub async fn run_incremental_sync(
    config: &PostgresLogicalConfig,
    source: &dyn LogicalReplicationSource,
    resolver: &dyn ValueResolver,
    catalog: &Catalog,
    state: State,
    discovery: Arc<dyn Discovery>,
    committed: &dyn CommittedStateReader,
    sink: &mut dyn MessageSink,
    baseline: Option<Lsn>,
) -> Result<SyncOutcome<Arc<State>, Lsn>> {
    let mut loop_state = LoopState::Init;
    let mut store = BookmarkStore::new(state);
    let counters = SyncCounters::new(config.update_bookmark_period);

    let mut automatic_columns = vec![AutomaticColumn::soft_delete()];
    if config.debug_lsn {
        automatic_columns.push(AutomaticColumn::lsn());
    }
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

    let version_num = source.server_version_num().await?;
    verify_server_version(version_num)?;

    let resume = store.compute_resume_position::<Lsn>(&streams, baseline)?;
    let slot = locate_replication_slot(source, config).await?;
    let origin = match &resume.origin {
        ResumeOrigin::Bookmark(stream) => stream.as_str(),
        ResumeOrigin::Baseline => "baseline",
    };
    verify_resume_position(&slot, origin, resume.position)?;
    let start = resume.position;
    let end_lsn = fetch_current_lsn(source, version_num).await?;
    info!(
        "Replicating {} streams from slot {} starting at {} up to {}",
        streams.len(),
        slot.slot_name,
        start,
        end_lsn
    );

    store.whitelist_bookmark_keys(&streams, LOGICAL_BOOKMARK_KEYS);

    let bookmark_properties = vec![checkpoint::state::LSN];
    let mut versions = HashMap::new();
    for entry in registry.entries() {
        let version = store.stream_version(entry.tap_stream_id());
        versions.insert(entry.tap_stream_id().to_string(), version);
        sink.write_message(&Message::schema_for(entry.catalog(), &bookmark_properties))?;
    }

    let options = Wal2JsonOptions::for_tables(registry.entries().map(|entry| {
        let catalog = entry.catalog();
        (catalog.database_name().unwrap_or("public"), catalog.table_name())
    }));
    let mut stream = source.open_stream(&slot, start, &options).await?;
    loop_state.transition_to(LoopState::Streaming);
    info!("Reading slot {} from {}", slot.slot_name, start);

    let refresher = SchemaRefresher::new(discovery, automatic_columns, bookmark_properties);
    let mut replication = LogicalReplication {
        config,
        resolver,
        committed,
        streams,
        registry,
        store,
        counters,
        versions,
        refresher,
        decoder: Wal2JsonDecoder::new(config.debug_lsn),
        sink,
        time_extracted: Utc::now(),
        end_lsn,
        lsn_committed: start,
        lsn_flushed: None,
        lsn_last_processed: None,
        lsn_currently_processing: None,
        lsns_since_flush: 0,
        caught_up: false,
    };

    let result = replication.consume(stream.as_mut()).await;
    if let Err(e) = stream.close().await {
        warn!("Failed to close replication slot reader: {}", e);
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

    let final_position = replication.final_position();
    if let Some(position) = final_position {
        info!("Updating bookmarks for all streams to lsn = {}", position);
    }
    let snapshot = replication.flush_state(final_position)?;
    loop_state.transition_to(LoopState::Closed);
    info!(
        "Logical replication {} at {}: {} rows, {} events skipped",
        exit,
        final_position.unwrap_or(start),
        replication.counters.rows_saved(),
        replication.counters.events_skipped()
    );

    Ok(SyncOutcome {
        exit,
        state: snapshot,
        final_position: Some(final_position.unwrap_or(start)),
        counters: replication.counters,
    })
}

/// State of one running slot read.
struct LogicalReplication<'a> {
    config: &'a PostgresLogicalConfig,
    resolver: &'a dyn ValueResolver,
    committed: &'a dyn CommittedStateReader,
    streams: Vec<String>,
    registry: StreamRegistry,
    store: BookmarkStore,
    counters: SyncCounters,
    versions: HashMap<String, i64>,
    refresher: SchemaRefresher,
    decoder: Wal2JsonDecoder,
    sink: &'a mut dyn MessageSink,
    time_extracted: DateTime<Utc>,
    end_lsn: Lsn,
    /// Lowest bookmark the downstream target has committed.
    lsn_committed: Lsn,
    /// Last LSN acknowledged to the server.
    lsn_flushed: Option<Lsn>,
    /// Newest LSN whose rows have all been emitted.
    lsn_last_processed: Option<Lsn>,
    lsn_currently_processing: Option<Lsn>,
    lsns_since_flush: u64,
    /// Everything up to `end_lsn` has been read.
    caught_up: bool,
}

impl LogicalReplication<'_> {
    async fn consume(&mut self, stream: &mut dyn WalStream) -> Result<LoopState> {
        let started = Instant::now();
        let mut last_received = started;
        let mut last_committed_poll = started;

        loop {
            if last_received.elapsed() >= self.config.quiet_period() {
                info!(
                    "No WAL message for {:?}, stopping",
                    self.config.quiet_period()
                );
                return Ok(LoopState::TimedOut);
            }
            if started.elapsed() >= self.config.max_run() {
                info!("Reached the maximum run time of {:?}, stopping", self.config.max_run());
                return Ok(LoopState::TimedOut);
            }

            match stream.poll().await? {
                WalPoll::Message(message) => {
                    last_received = Instant::now();
                    self.caught_up = false;
                    if self.config.break_at_end_lsn && message.data_start > self.end_lsn {
                        info!(
                            "Reached {} past the end position {}, stopping",
                            message.data_start, self.end_lsn
                        );
                        self.caught_up = true;
                        return Ok(LoopState::CaughtUp);
                    }
                    self.handle_message(&message).await?;
                    self.track_position(message.data_start, stream).await?;
                }
                WalPoll::Drained => {
                    self.caught_up = true;
                    if self.config.break_at_end_lsn {
                        info!("Replication slot drained, stopping");
                        return Ok(LoopState::CaughtUp);
                    }
                    tokio::time::sleep(self.config.idle_wait()).await;
                }
                WalPoll::Pending => tokio::time::sleep(self.config.idle_wait()).await,
            }

            if last_committed_poll.elapsed() >= self.config.poll_interval() {
                self.acknowledge_committed(stream).await?;
                last_committed_poll = Instant::now();
            }
        }
    }

    async fn handle_message(&mut self, message: &WalMessage) -> Result<()> {
        let parsed = match Wal2JsonMessage::parse(&message.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    "Skipping unparseable wal2json message at {}: {}",
                    message.data_start, e
                );
                self.counters.record_skip();
                return Ok(());
            }
        };

        match parsed.action {
            Action::Begin | Action::Commit | Action::Message => Ok(()),
            Action::Truncate => {
                warn!(
                    "TRUNCATE of {}.{} at {} is not replicated",
                    parsed.schema.as_deref().unwrap_or("?"),
                    parsed.table.as_deref().unwrap_or("?"),
                    message.data_start
                );
                Ok(())
            }
            Action::Insert | Action::Update | Action::Delete => {
                self.handle_row_change(&parsed, message.data_start).await
            }
        }
    }

    async fn handle_row_change(&mut self, message: &Wal2JsonMessage, lsn: Lsn) -> Result<()> {
        let Some((schema, table)) = message.table_key() else {
            warn!("Skipping {} at {} without schema or table", message.action, lsn);
            self.counters.record_skip();
            return Ok(());
        };
        let Some(entry) = self
            .registry
            .resolve_or_skip(schema, table, &mut self.counters)
        else {
            return Ok(());
        };
        let tap_stream_id = entry.tap_stream_id().to_string();

        // deletes only carry the replica identity
        if message.action != Action::Delete {
            let drifted = self.refresher.check(entry, message.column_names());
            if !drifted.is_empty() {
                if let Some(entry) = self.registry.get_mut(&tap_stream_id) {
                    self.refresher
                        .refresh(entry, drifted, &mut *self.sink)
                        .await?;
                }
            }
        }

        let Some(entry) = self.registry.get(&tap_stream_id) else {
            return Ok(());
        };
        let change = match self
            .decoder
            .decode(message, lsn, entry, self.time_extracted, self.resolver)
            .await
        {
            Ok(change) => change,
            Err(e) if !e.is_fatal() => {
                warn!(
                    "Skipping {} on {}.{} at {}: {}",
                    message.action, schema, table, lsn, e
                );
                self.counters.record_skip();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let stream = entry.stream().to_string();
        let version = self.versions.get(&tap_stream_id).copied().unwrap_or_default();
        let record = change.into_record_message(&stream, version, self.time_extracted);
        self.sink.write_message(&record)?;
        self.counters.record_row(&tap_stream_id);
        Ok(())
    }

    /// Move the processing window after a message at `lsn` was handled.
    async fn track_position(&mut self, lsn: Lsn, stream: &mut dyn WalStream) -> Result<()> {
        match self.lsn_currently_processing {
            None => {
                info!("First WAL message received at {}", lsn);
                self.lsn_currently_processing = Some(lsn);
                // release what the previous run committed, never past what is being read
                let flush = self.lsn_committed.min(lsn);
                self.acknowledge(flush, stream).await?;
            }
            Some(current) if lsn > current => {
                self.lsn_last_processed = Some(current);
                self.lsn_currently_processing = Some(lsn);
                self.lsns_since_flush += 1;
                if self.lsns_since_flush >= self.counters.period() {
                    debug!("Updating bookmarks for all streams to lsn = {}", current);
                    self.flush_state(Some(current))?;
                }
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Re-read committed state and acknowledge the lowest committed LSN if
    /// it moved and is behind the read position.
    async fn acknowledge_committed(&mut self, stream: &mut dyn WalStream) -> Result<()> {
        let Some(currently_processing) = self.lsn_currently_processing else {
            info!("Waiting for first WAL message");
            return Ok(());
        };
        info!("Latest WAL message received was {}", currently_processing);

        match self.committed.read_committed().await {
            Some(state) => {
                match BookmarkStore::new(state).lowest_bookmark::<Lsn>(&self.streams) {
                    Ok(Some(lsn)) => self.lsn_committed = lsn,
                    Ok(None) => debug!("Committed state holds no lsn bookmark yet"),
                    Err(e) => warn!("Ignoring unreadable committed state: {}", e),
                }
            }
            None => debug!("No committed state to read"),
        }

        let already_flushed = self
            .lsn_flushed
            .map(|flushed| self.lsn_committed <= flushed)
            .unwrap_or(false);
        if !already_flushed && self.lsn_committed < currently_processing {
            self.acknowledge(self.lsn_committed, stream).await?;
        }
        Ok(())
    }

    async fn acknowledge(&mut self, lsn: Lsn, stream: &mut dyn WalStream) -> Result<()> {
        info!("Confirming slot flush up to {}", lsn);
        stream.send_feedback(lsn).await?;
        self.lsn_flushed = Some(lsn);
        Ok(())
    }

    /// Where bookmarks land when the run ends.
    ///
    /// The LSN being read when the loop stopped may be incomplete, unless
    /// the slot was read through `end_lsn`. A position older than what the
    /// target already committed is never written back.
    fn final_position(&self) -> Option<Lsn> {
        let mut position = self.lsn_last_processed;
        if self.caught_up {
            position = position
                .max(self.lsn_currently_processing)
                .max(Some(self.end_lsn));
        }
        position.map(|lsn| lsn.max(self.lsn_committed))
    }

    /// Advance every bookmark to `position` and emit STATE.
    fn flush_state(&mut self, position: Option<Lsn>) -> Result<Arc<State>> {
        let snapshot = match position {
            Some(lsn) => self.store.advance(&self.streams, &lsn),
            None => self.store.snapshot(),
        };
        self.sink.write_message(&Message::state(snapshot.to_value()))?;
        self.counters.mark_flushed();
        self.lsns_since_flush = 0;
        debug!(
            "Flushed state at {:?} ({} rows so far)",
            position,
            self.counters.rows_saved()
        );
        Ok(snapshot)
    }
}
