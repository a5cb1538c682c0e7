//! Seams between the replication loop and the MySQL server.
//!
//! The loop only talks to these traits. The `mysql_async` implementation
//! lives in [`crate::client`] and [`crate::binlog_stream`]; tests use the
//! scripted fakes from [`crate::testing`].

use async_trait::async_trait;
use checkpoint::{BinlogPosition, Gtid};
use std::fmt;
use sync_core::Result;

use crate::event::BinlogEvent;

/// A row of `SHOW BINARY LOGS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryLog {
    pub log_name: String,
    pub file_size: u64,
}

/// Where a binlog dump starts.
#[derive(Debug, Clone, PartialEq)]
pub enum StartPosition {
    Binlog(BinlogPosition),
    Gtid(Gtid),
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPosition::Binlog(p) => write!(f, "binlog position {p}"),
            StartPosition::Gtid(g) => write!(f, "GTID {g}"),
        }
    }
}

/// Bookkeeping queries plus the ability to open a binlog dump.
#[async_trait]
pub trait BinlogSource: Send + Sync {
    /// `@@<name>`, `None` if the server does not know the variable.
    async fn server_variable(&self, name: &str) -> Result<Option<String>>;

    /// `SHOW BINARY LOGS`.
    async fn binary_logs(&self) -> Result<Vec<BinaryLog>>;

    /// Current write position of the binlog, `None` when binary logging is
    /// disabled.
    async fn master_status(&self) -> Result<Option<BinlogPosition>>;

    /// Register as a replica and start dumping from `start`.
    async fn open_stream(
        &self,
        start: &StartPosition,
        server_id: u32,
    ) -> Result<Box<dyn BinlogEventStream>>;
}

/// An open binlog dump.
#[async_trait]
pub trait BinlogEventStream: Send {
    /// The next event. `Ok(None)` when the server ended the dump.
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>>;

    /// Record the last GTID seen, so a dropped connection can be re-opened
    /// right after it instead of at the original start position.
    fn reconnect_from(&mut self, gtid: &Gtid);

    /// Release the replica connection.
    async fn close(&mut self) -> Result<()>;
}
