//! PostgreSQL logical replication for tap-cdc using wal2json.
//!
//! Reads a wal2json replication slot from the oldest `lsn` bookmark of the
//! selected streams and writes Singer RECORD and STATE messages. The slot is
//! only acknowledged up to what the downstream target has committed.
//!
//! ```ignore
//! use tap_cdc_postgresql_wal2json_source::{
//!     run_incremental_sync, PostgresLogicalClient, PostgresLogicalConfig,
//! };
//!
//! let config = PostgresLogicalConfig::new("host=localhost user=postgres dbname=shop", "shop");
//! let client = PostgresLogicalClient::connect(&config).await?;
//! let outcome = run_incremental_sync(
//!     &config, &client, &client, &catalog, state, discovery, &state_file, &mut sink, None,
//! )
//! .await?;
//! ```

mod change;
pub mod checkpoint;
mod client;
pub mod config;
pub mod decoder;
mod incremental_sync;
pub mod source;
mod transaction;
pub mod value;

// Make testing module available for integration tests
#[doc(hidden)]
pub mod testing;

pub use change::{Action, Wal2JsonColumn, Wal2JsonMessage, Wal2JsonOptions};
pub use self::checkpoint::{
    display_server_version, fetch_current_lsn, generate_slot_name, locate_replication_slot,
    verify_resume_position, verify_server_version, LOGICAL_BOOKMARK_KEYS, OUTPUT_PLUGIN,
};
pub use client::{sanitize_connection_string, PostgresLogicalClient};
pub use config::PostgresLogicalConfig;
pub use decoder::Wal2JsonDecoder;
pub use incremental_sync::run_incremental_sync;
pub use source::{LogicalReplicationSource, ReplicationSlot, ValueResolver, WalMessage, WalPoll, WalStream};
