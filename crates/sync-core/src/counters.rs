//! Per-invocation counters driving flush cadence and progress logging.

use std::collections::BTreeMap;

/// Default number of events between bookmark flushes.
pub const DEFAULT_UPDATE_BOOKMARK_PERIOD: u64 = 1000;

/// Row and skip counts for one sync invocation.
///
/// Owned by the replication loop; a fresh value is created for every run.
#[derive(Debug, Clone)]
pub struct SyncCounters {
    period: u64,
    rows_saved: u64,
    events_skipped: u64,
    rows_since_flush: u64,
    skipped_since_flush: u64,
    rows_by_stream: BTreeMap<String, u64>,
}

impl Default for SyncCounters {
    fn default() -> Self {
        Self::new(DEFAULT_UPDATE_BOOKMARK_PERIOD)
    }
}

impl SyncCounters {
    pub fn new(period: u64) -> Self {
        Self {
            period: period.max(1),
            rows_saved: 0,
            events_skipped: 0,
            rows_since_flush: 0,
            skipped_since_flush: 0,
            rows_by_stream: BTreeMap::new(),
        }
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn record_row(&mut self, tap_stream_id: &str) {
        self.rows_saved += 1;
        self.rows_since_flush += 1;
        *self
            .rows_by_stream
            .entry(tap_stream_id.to_string())
            .or_default() += 1;
    }

    /// Count an unmatched event. Returns true when the total lands on a
    /// period boundary, i.e. when the caller should log progress.
    pub fn record_skip(&mut self) -> bool {
        self.events_skipped += 1;
        self.skipped_since_flush += 1;
        self.events_skipped % self.period == 0
    }

    /// A STATE flush is due once either count reaches the period.
    pub fn flush_due(&self) -> bool {
        self.rows_since_flush >= self.period || self.skipped_since_flush >= self.period
    }

    pub fn mark_flushed(&mut self) {
        self.rows_since_flush = 0;
        self.skipped_since_flush = 0;
    }

    pub fn rows_saved(&self) -> u64 {
        self.rows_saved
    }

    pub fn events_skipped(&self) -> u64 {
        self.events_skipped
    }

    pub fn rows_for(&self, tap_stream_id: &str) -> u64 {
        self.rows_by_stream.get(tap_stream_id).copied().unwrap_or(0)
    }
}
