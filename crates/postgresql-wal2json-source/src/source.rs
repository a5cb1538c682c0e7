//! Seams between the replication loop and the Postgres server.
//!
//! The loop only talks to these traits. The tokio-postgres implementation
//! lives in [`crate::client`]; tests use the fakes from [`crate::testing`].

use async_trait::async_trait;
use checkpoint::Lsn;
use sync_core::Result;

use crate::change::Wal2JsonOptions;

/// A row of `pg_replication_slots`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSlot {
    pub slot_name: String,
    pub plugin: String,
    /// Unknown on servers older than 9.6.
    pub confirmed_flush_lsn: Option<Lsn>,
}

/// One decoded change as handed out by the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalMessage {
    pub data_start: Lsn,
    /// wal2json output, one JSON document.
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalPoll {
    Message(WalMessage),
    /// Nothing right now; more may arrive.
    Pending,
    /// The slot has nothing left to decode.
    Drained,
}

/// Bookkeeping queries plus the ability to open a slot for reading.
#[async_trait]
pub trait LogicalReplicationSource: Send + Sync {
    /// `server_version_num`, e.g. `150004`.
    async fn server_version_num(&self) -> Result<u32>;

    /// Current WAL write position.
    async fn current_wal_lsn(&self, server_version_num: u32) -> Result<Lsn>;

    async fn replication_slot(&self, slot_name: &str) -> Result<Option<ReplicationSlot>>;

    /// Start reading `slot`, skipping transactions committed below `start`.
    async fn open_stream(
        &self,
        slot: &ReplicationSlot,
        start: Lsn,
        options: &Wal2JsonOptions,
    ) -> Result<Box<dyn WalStream>>;
}

/// An open logical replication slot.
#[async_trait]
pub trait WalStream: Send {
    async fn poll(&mut self) -> Result<WalPoll>;

    /// Tell the server everything up to `flush` may be released.
    async fn send_feedback(&mut self, flush: Lsn) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Server-side conversions for values wal2json only renders as text.
#[async_trait]
pub trait ValueResolver: Send + Sync {
    /// `array_to_json(literal::cast_type)`.
    async fn cast_array(&self, literal: &str, cast_type: &str) -> Result<serde_json::Value>;

    /// `hstore_to_array(literal::hstore)`: keys and values interleaved.
    async fn hstore_to_array(&self, literal: &str) -> Result<Vec<Option<String>>>;
}
