//! Schema refresh on drift.
//!
//! When a row event carries columns the catalog does not know, the
//! refresher either remembers them as ignorable or re-runs discovery for
//! that one table, republishes SCHEMA and hot-swaps the entry. The
//! replication position is untouched either way.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::StreamCatalogEntry;
use crate::drift::{add_automatic_columns, detect_drift, AutomaticColumn};
use crate::error::{CdcError, Result};
use crate::message::{Message, MessageSink};
use crate::registry::StreamEntry;

/// Table-scoped discovery, provided by the caller.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Re-discover one table. `Ok(None)` if the table no longer exists.
    async fn discover_table(
        &self,
        namespace: &str,
        table: &str,
    ) -> Result<Option<StreamCatalogEntry>>;
}

/// Stream-level metadata keys carried over from the previous entry.
const PRESERVED_STREAM_METADATA: &[&str] = &["selected", "replication-method", "replication-key"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    Ignore,
    Rediscover,
}

/// Decide whether drifted columns justify a re-discovery.
///
/// Each column is judged on its own and any one of them can trigger it. A
/// column without metadata is new to the catalog. A column selected by
/// default qualifies unless it is marked unsupported.
pub fn refresh_decision(entry: &StreamCatalogEntry, drifted: &BTreeSet<String>) -> RefreshDecision {
    for column in drifted {
        let Some(md) = entry.column_metadata(column) else {
            return RefreshDecision::Rediscover;
        };
        if md.get("inclusion").and_then(JsonValue::as_str) == Some("unsupported") {
            continue;
        }
        if md.get("selected-by-default").and_then(JsonValue::as_bool) == Some(true) {
            return RefreshDecision::Rediscover;
        }
    }
    RefreshDecision::Ignore
}

/// Merge a freshly discovered entry with the one in use: identifiers,
/// stream selection and explicit column selections survive.
pub fn merge_discovered(
    previous: &StreamCatalogEntry,
    mut discovered: StreamCatalogEntry,
) -> StreamCatalogEntry {
    discovered.tap_stream_id = previous.tap_stream_id.clone();
    discovered.stream = previous.stream.clone();
    if discovered.table_name.is_none() {
        discovered.table_name = previous.table_name.clone();
    }

    if let Some(old) = previous.stream_metadata() {
        let md = discovered.stream_metadata_mut();
        for key in PRESERVED_STREAM_METADATA {
            if let Some(value) = old.get(*key) {
                md.insert(key.to_string(), value.clone());
            }
        }
    }

    for column in previous.schema.properties.keys() {
        let selected = previous
            .column_metadata(column)
            .and_then(|md| md.get("selected"))
            .cloned();
        if let Some(selected) = selected {
            if discovered.schema.properties.contains_key(column) {
                discovered
                    .column_metadata_mut(column)
                    .insert("selected".to_string(), selected);
            }
        }
    }
    discovered
}

/// What a refresh did to the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Columns were added to the ignore set.
    Ignored(BTreeSet<String>),
    /// Discovery ran but produced the schema already announced.
    Unchanged,
    /// A new SCHEMA message was emitted and the entry swapped.
    Republished,
}

/// Drift checks and refreshes for one replication loop.
pub struct SchemaRefresher {
    discovery: Arc<dyn Discovery>,
    automatic_columns: Vec<AutomaticColumn>,
    bookmark_properties: Vec<&'static str>,
    ignored: HashMap<String, BTreeSet<String>>,
}

impl SchemaRefresher {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        automatic_columns: Vec<AutomaticColumn>,
        bookmark_properties: Vec<&'static str>,
    ) -> Self {
        Self {
            discovery,
            automatic_columns,
            bookmark_properties,
            ignored: HashMap::new(),
        }
    }

    pub fn automatic_columns(&self) -> &[AutomaticColumn] {
        &self.automatic_columns
    }

    pub fn bookmark_properties(&self) -> &[&'static str] {
        &self.bookmark_properties
    }

    /// Columns ignored for a stream so far in this run.
    pub fn ignored(&self, tap_stream_id: &str) -> BTreeSet<String> {
        self.ignored.get(tap_stream_id).cloned().unwrap_or_default()
    }

    /// Drift of `wire_columns` against the entry, honouring the ignore set.
    pub fn check<'a>(
        &self,
        entry: &StreamEntry,
        wire_columns: impl IntoIterator<Item = &'a str>,
    ) -> BTreeSet<String> {
        match self.ignored.get(entry.tap_stream_id()) {
            Some(ignored) => detect_drift(entry, wire_columns, ignored),
            None => detect_drift(entry, wire_columns, &BTreeSet::new()),
        }
    }

    /// Handle a non-empty drift set for `entry`.
    pub async fn refresh(
        &mut self,
        entry: &mut StreamEntry,
        drifted: BTreeSet<String>,
        sink: &mut dyn MessageSink,
    ) -> Result<RefreshOutcome> {
        let tap_stream_id = entry.tap_stream_id().to_string();
        debug!(
            "Difference between event and schema for {}: {:?}",
            tap_stream_id, drifted
        );

        if refresh_decision(entry.catalog(), &drifted) == RefreshDecision::Ignore {
            info!(
                "Stream {}: not running discovery, ignoring detected columns {:?}",
                tap_stream_id, drifted
            );
            self.ignore(&tap_stream_id, drifted.iter().cloned());
            return Ok(RefreshOutcome::Ignored(drifted));
        }

        let namespace = entry
            .catalog()
            .database_name()
            .ok_or_else(|| CdcError::Discovery {
                stream: tap_stream_id.clone(),
                message: "catalog entry has no database-name or schema-name metadata".to_string(),
            })?
            .to_string();
        let table = entry.catalog().table_name().to_string();

        info!(
            "Stream {}: running discovery on {}.{} for new columns {:?}",
            tap_stream_id, namespace, table, drifted
        );
        let Some(discovered) = self.discovery.discover_table(&namespace, &table).await? else {
            warn!(
                "Stream {}: discovery found no table {}.{}; ignoring {:?}",
                tap_stream_id, namespace, table, drifted
            );
            self.ignore(&tap_stream_id, drifted.iter().cloned());
            return Ok(RefreshOutcome::Ignored(drifted));
        };

        let merged = merge_discovered(entry.catalog(), discovered);
        let mut refreshed = StreamEntry::new(merged);
        add_automatic_columns(&mut refreshed, &self.automatic_columns);

        // Columns discovery still does not describe would trigger again on every event.
        let unresolved: Vec<String> = drifted
            .iter()
            .filter(|c| !refreshed.catalog().schema.properties.contains_key(*c))
            .cloned()
            .collect();
        if !unresolved.is_empty() {
            warn!(
                "Stream {}: discovery does not describe {:?}; ignoring them",
                tap_stream_id, unresolved
            );
            self.ignore(&tap_stream_id, unresolved);
        }

        if refreshed.catalog().schema == entry.catalog().schema {
            entry.replace(refreshed.catalog, refreshed.desired_columns);
            return Ok(RefreshOutcome::Unchanged);
        }

        sink.write_message(&Message::schema_for(
            refreshed.catalog(),
            &self.bookmark_properties,
        ))?;
        info!("Stream {}: published refreshed schema", tap_stream_id);
        entry.replace(refreshed.catalog, refreshed.desired_columns);
        Ok(RefreshOutcome::Republished)
    }

    fn ignore(&mut self, tap_stream_id: &str, columns: impl IntoIterator<Item = String>) {
        self.ignored
            .entry(tap_stream_id.to_string())
            .or_default()
            .extend(columns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Schema;
    use crate::drift::SDC_DELETED_AT;
    use crate::testing::{catalog_entry, MemorySink, StaticDiscovery};
    use serde_json::json;

    fn refresher(discovery: StaticDiscovery) -> SchemaRefresher {
        SchemaRefresher::new(
            Arc::new(discovery),
            vec![AutomaticColumn::soft_delete()],
            vec![],
        )
    }

    fn entry_with_automatic(columns: &[&str]) -> StreamEntry {
        let mut entry = StreamEntry::new(catalog_entry("db", "t", columns));
        add_automatic_columns(&mut entry, &[AutomaticColumn::soft_delete()]);
        entry
    }

    #[tokio::test]
    async fn test_refresh_republishes_and_contains_drift() {
        let mut discovered = catalog_entry("db", "t", &["id", "name", "email"]);
        discovered.tap_stream_id = "ignored-by-merge".to_string();
        let mut refresher = refresher(StaticDiscovery::new([discovered]));
        let mut entry = entry_with_automatic(&["id", "name"]);
        let mut sink = MemorySink::default();

        let drift = refresher.check(&entry, ["id", "name", "email"]);
        assert_eq!(drift, BTreeSet::from(["email".to_string()]));

        let outcome = refresher.refresh(&mut entry, drift, &mut sink).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Republished);
        assert_eq!(entry.tap_stream_id(), "db-t");
        assert!(entry.is_desired("email"));
        assert!(entry.is_desired(SDC_DELETED_AT));
        assert_eq!(sink.schemas().len(), 1);

        assert!(refresher.check(&entry, ["id", "name", "email"]).is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_column_goes_to_ignore_set() {
        let mut refresher = refresher(StaticDiscovery::default());
        let mut catalog = catalog_entry("db", "t", &["id"]);
        catalog
            .column_metadata_mut("geom")
            .insert("inclusion".to_string(), json!("unsupported"));
        let mut entry = StreamEntry::new(catalog);
        let mut sink = MemorySink::default();

        let drift = refresher.check(&entry, ["id", "geom"]);
        let outcome = refresher.refresh(&mut entry, drift, &mut sink).await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::Ignored(_)));
        assert!(sink.messages.is_empty());
        assert!(refresher.check(&entry, ["id", "geom"]).is_empty());
        assert_eq!(refresher.ignored("db-t"), BTreeSet::from(["geom".to_string()]));
    }

    #[tokio::test]
    async fn test_identical_rediscovery_does_not_republish() {
        let mut refresher = refresher(StaticDiscovery::new([catalog_entry("db", "t", &["id"])]));
        let mut entry = entry_with_automatic(&["id"]);
        let mut sink = MemorySink::default();

        let outcome = refresher
            .refresh(&mut entry, BTreeSet::from(["ghost".to_string()]), &mut sink)
            .await
            .unwrap();
        assert_eq!(outcome, RefreshOutcome::Unchanged);
        assert!(sink.messages.is_empty());
        // discovery did not describe the column, so it is not retried
        assert!(refresher.check(&entry, ["ghost"]).is_empty());
    }

    #[test]
    fn test_merge_keeps_explicit_deselection() {
        let mut previous = catalog_entry("db", "t", &["id", "name"]);
        previous
            .column_metadata_mut("name")
            .insert("selected".to_string(), json!(false));
        let mut discovered = catalog_entry("db", "t", &["id", "name", "email"]);
        discovered
            .stream_metadata_mut()
            .insert("selected".to_string(), json!(false));
        discovered
            .schema
            .properties
            .insert("email".to_string(), Schema::nullable("string"));

        let merged = merge_discovered(&previous, discovered);
        assert!(merged.is_selected());
        let desired = merged.desired_columns();
        assert!(desired.contains("email"));
        assert!(!desired.contains("name"));
    }

    #[test]
    fn test_decision_for_unknown_and_default_columns() {
        let mut catalog = catalog_entry("db", "t", &["id"]);
        let brand_new = BTreeSet::from(["email".to_string()]);
        assert_eq!(refresh_decision(&catalog, &brand_new), RefreshDecision::Rediscover);

        catalog
            .column_metadata_mut("email")
            .insert("selected-by-default".to_string(), json!(false));
        assert_eq!(refresh_decision(&catalog, &brand_new), RefreshDecision::Ignore);
    }

    #[test]
    fn test_unsupported_column_does_not_mask_a_new_one() {
        let mut catalog = catalog_entry("db", "t", &["id"]);
        let md = catalog.column_metadata_mut("a_geom");
        md.insert("inclusion".to_string(), json!("unsupported"));
        md.insert("selected-by-default".to_string(), json!(true));

        let only_unsupported = BTreeSet::from(["a_geom".to_string()]);
        assert_eq!(
            refresh_decision(&catalog, &only_unsupported),
            RefreshDecision::Ignore
        );

        let mixed = BTreeSet::from(["a_geom".to_string(), "b_email".to_string()]);
        assert_eq!(refresh_decision(&catalog, &mixed), RefreshDecision::Rediscover);
    }
}
