//! Core types for tap-cdc.
//!
//! This crate holds what the MySQL binlog and Postgres wal2json sources
//! share:
//!
//! - [`CdcError`] - the error taxonomy, with fatal/recoverable classification
//! - [`StreamCatalogEntry`] - the Singer catalog model handed in by discovery
//! - [`Message`] / [`MessageSink`] - the Singer wire contract
//! - [`StreamRegistry`] - lookup from a wire event's table to its stream
//! - [`detect_drift`] / [`SchemaRefresher`] - schema drift handling
//! - [`SyncCounters`] / [`LoopState`] - per-invocation loop bookkeeping
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── checkpoint                     (positions, bookmarks, state)
//!    │
//!    ├─── mysql-binlog-source            (binlog decoder + loop)
//!    └─── postgresql-wal2json-source     (wal2json decoder + loop)
//! ```

pub mod catalog;
pub mod change;
pub mod counters;
pub mod drift;
pub mod error;
pub mod message;
pub mod outcome;
pub mod refresh;
pub mod registry;
pub mod value;

#[doc(hidden)]
pub mod testing;

pub use catalog::{Catalog, MetadataEntry, ReplicationMethod, Schema, SchemaType, StreamCatalogEntry};
pub use change::{ChangeEvent, Operation, TableKey};
pub use counters::{SyncCounters, DEFAULT_UPDATE_BOOKMARK_PERIOD};
pub use drift::{
    add_automatic_columns, detect_drift, is_dropped_column_placeholder, AutomaticColumn,
    SDC_DELETED_AT, SDC_LSN,
};
pub use error::{BoxError, CdcError, ErrorCategory, MissingBookmarkReason, Result};
pub use message::{format_singer_datetime, JsonLinesSink, Message, MessageSink};
pub use outcome::{LoopState, SyncOutcome};
pub use refresh::{merge_discovered, refresh_decision, Discovery, RefreshDecision, RefreshOutcome, SchemaRefresher};
pub use registry::{tap_stream_id, StreamEntry, StreamRegistry};
pub use value::{Record, Value};
