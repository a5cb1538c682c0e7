//! Lookup from a wire event's table to the subscribed catalog entry.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::catalog::StreamCatalogEntry;
use crate::counters::SyncCounters;

/// Stream identifier used as the bookmark key: `<database>-<table>`.
pub fn tap_stream_id(namespace: &str, table: &str) -> String {
    format!("{namespace}-{table}")
}

/// A subscribed stream together with the columns emitted for it.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub(crate) catalog: StreamCatalogEntry,
    pub(crate) desired_columns: BTreeSet<String>,
}

impl StreamEntry {
    pub fn new(catalog: StreamCatalogEntry) -> Self {
        let desired_columns = catalog.desired_columns();
        Self {
            catalog,
            desired_columns,
        }
    }

    pub fn catalog(&self) -> &StreamCatalogEntry {
        &self.catalog
    }

    pub fn tap_stream_id(&self) -> &str {
        &self.catalog.tap_stream_id
    }

    pub fn stream(&self) -> &str {
        &self.catalog.stream
    }

    pub fn desired_columns(&self) -> &BTreeSet<String> {
        &self.desired_columns
    }

    pub fn is_desired(&self, column: &str) -> bool {
        self.desired_columns.contains(column)
    }

    /// Swap in a refreshed catalog entry and its column selection.
    pub fn replace(&mut self, catalog: StreamCatalogEntry, desired_columns: BTreeSet<String>) {
        self.catalog = catalog;
        self.desired_columns = desired_columns;
    }
}

/// Subscribed streams keyed by tap stream id.
#[derive(Debug, Clone, Default)]
pub struct StreamRegistry {
    entries: HashMap<String, StreamEntry>,
    order: Vec<String>,
}

impl StreamRegistry {
    pub fn new(streams: impl IntoIterator<Item = StreamCatalogEntry>) -> Self {
        let mut registry = Self::default();
        for catalog in streams {
            registry.insert(StreamEntry::new(catalog));
        }
        registry
    }

    pub fn insert(&mut self, entry: StreamEntry) {
        let id = entry.tap_stream_id().to_string();
        if self.entries.insert(id.clone(), entry).is_none() {
            self.order.push(id);
        }
    }

    pub fn resolve(&self, namespace: &str, table: &str) -> Option<&StreamEntry> {
        self.entries.get(&tap_stream_id(namespace, table))
    }

    /// Resolve, counting a miss as a skipped event. Misses are logged once
    /// per flush period.
    pub fn resolve_or_skip(
        &self,
        namespace: &str,
        table: &str,
        counters: &mut SyncCounters,
    ) -> Option<&StreamEntry> {
        let entry = self.resolve(namespace, table);
        if entry.is_none() && counters.record_skip() {
            debug!(
                "Skipped {} events so far as they were not for selected tables; {} rows extracted",
                counters.events_skipped(),
                counters.rows_saved()
            );
        }
        entry
    }

    pub fn get(&self, tap_stream_id: &str) -> Option<&StreamEntry> {
        self.entries.get(tap_stream_id)
    }

    pub fn get_mut(&mut self, tap_stream_id: &str) -> Option<&mut StreamEntry> {
        self.entries.get_mut(tap_stream_id)
    }

    /// Stream ids in catalog order.
    pub fn tap_stream_ids(&self) -> &[String] {
        &self.order
    }

    pub fn entries(&self) -> impl Iterator<Item = &StreamEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut StreamEntry> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::catalog_entry;

    #[test]
    fn test_resolve_by_database_and_table() {
        let registry = StreamRegistry::new([
            catalog_entry("db", "t", &["id", "name"]),
            catalog_entry("db", "u", &["id"]),
        ]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("db", "t").unwrap().stream(), "t");
        assert!(registry.resolve("db", "missing").is_none());
        assert!(registry.resolve("other", "t").is_none());
        assert_eq!(registry.tap_stream_ids(), ["db-t", "db-u"]);
    }

    #[test]
    fn test_unmatched_events_are_counted() {
        let registry = StreamRegistry::new([catalog_entry("db", "t", &["id"])]);
        let mut counters = SyncCounters::new(2);
        assert!(registry.resolve_or_skip("db", "x", &mut counters).is_none());
        assert!(registry.resolve_or_skip("db", "t", &mut counters).is_some());
        assert!(registry.resolve_or_skip("db", "y", &mut counters).is_none());
        assert_eq!(counters.events_skipped(), 2);
        assert!(counters.flush_due());
    }

    #[test]
    fn test_desired_columns_come_from_selection() {
        let registry = StreamRegistry::new([catalog_entry("db", "t", &["id", "name"])]);
        let entry = registry.get("db-t").unwrap();
        assert!(entry.is_desired("id"));
        assert!(entry.is_desired("name"));
        assert!(!entry.is_desired("email"));
    }
}
