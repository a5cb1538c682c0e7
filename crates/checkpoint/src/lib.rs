//! Replication positions and Singer bookmarks for tap-cdc.
//!
//! Provides the position codec shared by the binlog and wal2json sources and
//! the bookmark bookkeeping that turns positions into resumable state.
//!
//! # Architecture
//!
//! This crate provides:
//! - [`position`] - engine-native positions (binlog file/offset, GTID, LSN)
//!   with total ordering and text codecs
//! - [`State`] / [`Bookmark`] - the Singer state value, key names preserved
//! - [`BookmarkStore`] - copy-on-write state owner: resume computation and
//!   monotonic advance
//! - [`StateFile`] - reads state persisted by the orchestrator, used to
//!   coordinate processes sharing one replication slot
//!
//! Each position type implements the [`Checkpoint`] trait, which maps it to
//! and from its bookmark keys.

mod filesystem;
pub mod position;
pub mod state;
mod store;

#[cfg(test)]
mod tests;

pub use filesystem::{CommittedStateReader, StateFile};
pub use position::{
    compare_log_files, decode_lsn, decode_mysql_log_pos, encode_lsn, BinlogPosition, Gtid,
    GtidInterval, GtidSet, Lsn, MariaDbGtid, MySqlGtid, ReplicationPosition,
};
pub use state::{Bookmark, State};
pub use store::{BookmarkStore, ResumeOrigin, ResumePoint};

use std::fmt;
use sync_core::{CdcError, Result};

/// Trait that engine positions must implement to be stored in bookmarks.
///
/// # Example
///
/// ```rust
/// use checkpoint::{Bookmark, Checkpoint, Lsn};
///
/// let mut bookmark = Bookmark::default();
/// Lsn(0x16_B374_D848).write_bookmark(&mut bookmark);
/// assert_eq!(Lsn::read_bookmark(&bookmark).unwrap(), Some(Lsn(0x16_B374_D848)));
/// assert_eq!(Lsn(0x16_B374_D848).to_cli_string(), "16/B374D848");
/// ```
pub trait Checkpoint: Clone + PartialOrd + fmt::Display + Send + Sync + Sized {
    /// Database type identifier ("mysql", "postgresql").
    const DATABASE_TYPE: &'static str;

    /// Position kind, used in error messages.
    const KIND: &'static str;

    /// Bookmark keys written by [`Checkpoint::write_bookmark`].
    const BOOKMARK_KEYS: &'static [&'static str];

    /// Read the position from a bookmark. `Ok(None)` when none was stored.
    fn read_bookmark(bookmark: &Bookmark) -> Result<Option<Self>>;

    /// Store the position in a bookmark, leaving other keys alone.
    fn write_bookmark(&self, bookmark: &mut Bookmark);

    /// Convert to CLI-friendly string format.
    ///
    /// The returned string is parseable by `from_cli_string()` and is how an
    /// externally supplied baseline position is passed in.
    fn to_cli_string(&self) -> String;

    /// Parse from CLI string format.
    fn from_cli_string(s: &str) -> Result<Self>;
}

impl Checkpoint for BinlogPosition {
    const DATABASE_TYPE: &'static str = "mysql";
    const KIND: &'static str = "binlog";
    const BOOKMARK_KEYS: &'static [&'static str] = &[state::LOG_FILE, state::LOG_POS];

    fn read_bookmark(bookmark: &Bookmark) -> Result<Option<Self>> {
        match (bookmark.log_file(), bookmark.get(state::LOG_POS)) {
            (Some(file), Some(_)) => {
                let pos = bookmark.log_pos().ok_or_else(|| {
                    CdcError::position_format(
                        Self::KIND,
                        bookmark.get(state::LOG_POS).map(ToString::to_string).unwrap_or_default(),
                        "log_pos is not an unsigned integer",
                    )
                })?;
                Ok(Some(BinlogPosition::new(file, pos)))
            }
            (None, None) => Ok(None),
            (Some(file), None) => Err(CdcError::position_format(
                Self::KIND,
                file,
                "log_file is set but log_pos is missing",
            )),
            (None, Some(pos)) => Err(CdcError::position_format(
                Self::KIND,
                pos.to_string(),
                "log_pos is set but log_file is missing",
            )),
        }
    }

    fn write_bookmark(&self, bookmark: &mut Bookmark) {
        bookmark.set(state::LOG_FILE, self.log_file.as_str());
        bookmark.set(state::LOG_POS, self.log_pos);
    }

    fn to_cli_string(&self) -> String {
        format!("{}:{}", self.log_file, self.log_pos)
    }

    fn from_cli_string(s: &str) -> Result<Self> {
        let (file, pos) = s
            .rsplit_once(':')
            .ok_or_else(|| CdcError::position_format(Self::KIND, s, "expected 'log_file:log_pos'"))?;
        let pos = pos
            .parse()
            .map_err(|_| CdcError::position_format(Self::KIND, s, "log_pos is not an integer"))?;
        if file.is_empty() {
            return Err(CdcError::position_format(Self::KIND, s, "empty log_file"));
        }
        Ok(BinlogPosition::new(file, pos))
    }
}

impl Checkpoint for Gtid {
    const DATABASE_TYPE: &'static str = "mysql";
    const KIND: &'static str = "gtid";
    const BOOKMARK_KEYS: &'static [&'static str] = &[state::GTID];

    fn read_bookmark(bookmark: &Bookmark) -> Result<Option<Self>> {
        bookmark.gtid().map(Gtid::parse).transpose()
    }

    fn write_bookmark(&self, bookmark: &mut Bookmark) {
        bookmark.set(state::GTID, self.to_string());
    }

    fn to_cli_string(&self) -> String {
        self.to_string()
    }

    fn from_cli_string(s: &str) -> Result<Self> {
        Gtid::parse(s.trim())
    }
}

impl Checkpoint for Lsn {
    const DATABASE_TYPE: &'static str = "postgresql";
    const KIND: &'static str = "lsn";
    const BOOKMARK_KEYS: &'static [&'static str] = &[state::LSN];

    /// Stored as an integer; older state files may hold a numeric string or
    /// the textual `FILE/OFFSET` form.
    fn read_bookmark(bookmark: &Bookmark) -> Result<Option<Self>> {
        let Some(raw) = bookmark.get(state::LSN) else {
            return Ok(None);
        };
        if let Some(lsn) = bookmark.get_u64(state::LSN) {
            return Ok(Some(Lsn(lsn)));
        }
        match raw.as_str() {
            Some(text) if text.contains('/') => encode_lsn(text).map(|lsn| Some(Lsn(lsn))),
            _ => Err(CdcError::position_format(
                Self::KIND,
                raw.to_string(),
                "expected an integer",
            )),
        }
    }

    fn write_bookmark(&self, bookmark: &mut Bookmark) {
        bookmark.set(state::LSN, self.0);
    }

    fn to_cli_string(&self) -> String {
        decode_lsn(self.0)
    }

    fn from_cli_string(s: &str) -> Result<Self> {
        s.trim().parse()
    }
}
