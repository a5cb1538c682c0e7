//! MySQL and MariaDB binlog replication for tap-cdc.
//!
//! Reads row-based binlog events from the bookmarked position (binlog
//! coordinates or GTID) up to the server position captured at start, and
//! writes Singer RECORD and STATE messages for the selected streams.

pub mod checkpoint;
mod binlog_stream;
mod client;
pub mod config;
pub mod decoder;
pub mod event;
mod incremental_sync;
pub mod source;
pub mod value;

// Make testing module available for integration tests
#[doc(hidden)]
pub mod testing;

pub use binlog_stream::{parse_enum_labels, MySqlBinlogStream};
pub use self::checkpoint::{
    fetch_current_gtid, fetch_current_log_file_and_pos, verify_binlog_config,
    verify_gtid_config, verify_log_file_exists, MySqlPosition, BINLOG_BOOKMARK_KEYS,
};
pub use client::{sanitize_connection_string, MySqlBinlogClient};
pub use config::{Engine, MySqlBinlogConfig};
pub use decoder::BinlogDecoder;
pub use incremental_sync::run_incremental_sync;
pub use source::{BinaryLog, BinlogEventStream, BinlogSource, StartPosition};
