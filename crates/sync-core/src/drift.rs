//! Schema drift detection and automatic `_sdc_*` columns.

use std::collections::BTreeSet;

use crate::catalog::Schema;
use crate::registry::StreamEntry;

/// Soft-delete marker set on every record; non-null for deletes.
pub const SDC_DELETED_AT: &str = "_sdc_deleted_at";

/// Optional column carrying the Postgres LSN of each record.
pub const SDC_LSN: &str = "_sdc_lsn";

/// A column the tap adds to every stream it replicates.
#[derive(Debug, Clone, PartialEq)]
pub struct AutomaticColumn {
    pub name: &'static str,
    pub schema: Schema,
}

impl AutomaticColumn {
    /// `_sdc_deleted_at`, a nullable date-time string.
    pub fn soft_delete() -> Self {
        AutomaticColumn {
            name: SDC_DELETED_AT,
            schema: Schema::nullable("string").with_format("date-time"),
        }
    }

    /// `_sdc_lsn`, a nullable string.
    pub fn lsn() -> Self {
        AutomaticColumn {
            name: SDC_LSN,
            schema: Schema::nullable("string"),
        }
    }
}

/// Binlog readers name columns they cannot map `__dropped_col_<n>__`.
pub fn is_dropped_column_placeholder(name: &str) -> bool {
    name.strip_prefix("__dropped_col_")
        .and_then(|rest| rest.strip_suffix("__"))
        .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// Wire columns the entry's schema does not know about, minus dropped-column
/// placeholders and the `ignored` set.
pub fn detect_drift<'a>(
    entry: &StreamEntry,
    wire_columns: impl IntoIterator<Item = &'a str>,
    ignored: &BTreeSet<String>,
) -> BTreeSet<String> {
    let properties = &entry.catalog.schema.properties;
    wire_columns
        .into_iter()
        .filter(|c| !properties.contains_key(*c))
        .filter(|c| !is_dropped_column_placeholder(c))
        .filter(|c| !ignored.contains(*c))
        .map(str::to_string)
        .collect()
}

/// Add each automatic column to the schema and the desired columns.
/// Existing columns are left untouched, so repeated calls are harmless.
pub fn add_automatic_columns(entry: &mut StreamEntry, columns: &[AutomaticColumn]) {
    for column in columns {
        entry
            .catalog
            .schema
            .properties
            .entry(column.name.to_string())
            .or_insert_with(|| column.schema.clone());
        entry.desired_columns.insert(column.name.to_string());
    }
}
