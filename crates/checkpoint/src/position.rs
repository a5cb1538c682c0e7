//! Replication positions and their codecs.
//!
//! Three engine-native positions are supported:
//!
//! - [`BinlogPosition`] - MySQL binlog file name plus byte offset
//! - [`Gtid`] - MySQL (`uuid:interval[:interval]`) or MariaDB
//!   (`domain-server-sequence`) global transaction ids
//! - [`Lsn`] - Postgres WAL position, textually `"FILE/OFFSET"` in hex
//!
//! Within one engine positions are totally ordered. Parsing failures are
//! [`CdcError::PositionFormat`], which is fatal: it means the bookmark was
//! written by a different engine or an incompatible version.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use sync_core::{CdcError, Result};
use uuid::Uuid;

/// Postgres log sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

/// Parse `"FILE/OFFSET"` into `(FILE << 32) + OFFSET`.
pub fn encode_lsn(text: &str) -> Result<u64> {
    let invalid = |reason: &str| CdcError::position_format("lsn", text, reason);
    let (file, offset) = text
        .split_once('/')
        .ok_or_else(|| invalid("expected FILE/OFFSET"))?;
    let parse_half = |half: &str| {
        if half.is_empty() || half.len() > 8 + half.bytes().take_while(|b| *b == b'0').count() {
            return Err(invalid("each half must be a 32-bit hex number"));
        }
        u32::from_str_radix(half, 16).map_err(|_| invalid("each half must be a 32-bit hex number"))
    };
    let file = parse_half(file)?;
    let offset = parse_half(offset)?;
    Ok(((file as u64) << 32) + offset as u64)
}

/// Render an LSN the way Postgres does: uppercase hex, no padding.
pub fn decode_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

impl Lsn {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for Lsn {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        encode_lsn(s.trim()).map(Lsn)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&decode_lsn(self.0))
    }
}

/// MySQL binlog coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinlogPosition {
    pub log_file: String,
    pub log_pos: u64,
}

impl BinlogPosition {
    pub fn new(log_file: impl Into<String>, log_pos: u64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
        }
    }
}

/// Binlog coordinates as given by the server.
pub fn decode_mysql_log_pos(log_file: &str, log_pos: u64) -> ReplicationPosition {
    ReplicationPosition::Binlog(BinlogPosition::new(log_file, log_pos))
}

/// Order binlog file names: files sharing a base name compare by their
/// numeric extension, anything else lexicographically.
pub fn compare_log_files(a: &str, b: &str) -> Ordering {
    fn split(name: &str) -> Option<(&str, u64)> {
        let (base, ext) = name.rsplit_once('.')?;
        if ext.is_empty() || !ext.bytes().all(|c| c.is_ascii_digit()) {
            return None;
        }
        ext.parse().ok().map(|n| (base, n))
    }
    match (split(a), split(b)) {
        (Some((base_a, n_a)), Some((base_b, n_b))) if base_a == base_b => n_a.cmp(&n_b),
        _ => a.cmp(b),
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_log_files(&self.log_file, &other.log_file).then(self.log_pos.cmp(&other.log_pos))
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_pos)
    }
}

/// Inclusive range of transaction numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GtidInterval {
    pub start: u64,
    pub end: u64,
}

/// A MySQL GTID or single-server GTID set: `uuid:1-5:7-9` or `uuid:42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MySqlGtid {
    pub server_uuid: Uuid,
    pub intervals: Vec<GtidInterval>,
}

impl MySqlGtid {
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |reason: &str| CdcError::position_format("gtid", text, reason);
        let mut parts = text.trim().split(':');
        let uuid = parts.next().unwrap_or_default();
        let server_uuid =
            Uuid::parse_str(uuid).map_err(|_| invalid("expected <server-uuid>:<interval>"))?;
        let mut intervals = Vec::new();
        for part in parts {
            let (start, end) = match part.split_once('-') {
                Some((start, end)) => (start, end),
                None => (part, part),
            };
            let start: u64 = start
                .parse()
                .map_err(|_| invalid("interval bounds must be integers"))?;
            let end: u64 = end
                .parse()
                .map_err(|_| invalid("interval bounds must be integers"))?;
            if start == 0 || end < start {
                return Err(invalid("interval must be a non-empty range starting at 1 or above"));
            }
            intervals.push(GtidInterval { start, end });
        }
        if intervals.is_empty() {
            return Err(invalid("expected at least one interval"));
        }
        Ok(Self {
            server_uuid,
            intervals,
        })
    }

    /// Comparable sequence: the largest upper bound among the intervals.
    pub fn sequence(&self) -> u64 {
        self.intervals.iter().map(|i| i.end).max().unwrap_or(0)
    }

    /// The executed set `uuid:1-N` used to re-open a GTID binlog dump
    /// right after this transaction.
    pub fn executed_through(&self) -> MySqlGtid {
        MySqlGtid {
            server_uuid: self.server_uuid,
            intervals: vec![GtidInterval {
                start: 1,
                end: self.sequence(),
            }],
        }
    }
}

impl fmt::Display for MySqlGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.server_uuid)?;
        for interval in &self.intervals {
            if interval.start == interval.end {
                write!(f, ":{}", interval.start)?;
            } else {
                write!(f, ":{}-{}", interval.start, interval.end)?;
            }
        }
        Ok(())
    }
}

/// A MariaDB GTID: `domain-server-sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MariaDbGtid {
    pub domain_id: u32,
    pub server_id: u32,
    pub sequence: u64,
}

impl MariaDbGtid {
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = || {
            CdcError::position_format("gtid", text, "expected <domain>-<server>-<sequence>")
        };
        let parts: Vec<&str> = text.trim().split('-').collect();
        let [domain, server, sequence] = parts.as_slice() else {
            return Err(invalid());
        };
        Ok(Self {
            domain_id: domain.parse().map_err(|_| invalid())?,
            server_id: server.parse().map_err(|_| invalid())?,
            sequence: sequence.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for MariaDbGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.sequence)
    }
}

/// GTID of either flavour.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Gtid {
    MySql(MySqlGtid),
    MariaDb(MariaDbGtid),
}

impl Gtid {
    /// MySQL GTIDs contain a `:`, MariaDB ones never do.
    pub fn parse(text: &str) -> Result<Self> {
        if text.contains(':') {
            MySqlGtid::parse(text).map(Gtid::MySql)
        } else {
            MariaDbGtid::parse(text).map(Gtid::MariaDb)
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            Gtid::MySql(g) => g.sequence(),
            Gtid::MariaDb(g) => g.sequence,
        }
    }
}

/// GTIDs compare by sequence number, as integers, only within one
/// history: the same MySQL server UUID or the same MariaDB domain. Equal
/// sequences are only `Equal` for equal GTIDs.
impl PartialOrd for Gtid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let ordering = match (self, other) {
            (Gtid::MySql(a), Gtid::MySql(b)) if a.server_uuid == b.server_uuid => {
                a.sequence().cmp(&b.sequence())
            }
            (Gtid::MariaDb(a), Gtid::MariaDb(b)) if a.domain_id == b.domain_id => {
                a.sequence.cmp(&b.sequence)
            }
            _ => return None,
        };
        match ordering {
            Ordering::Equal if self != other => None,
            ordering => Some(ordering),
        }
    }
}

impl FromStr for Gtid {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        Gtid::parse(s)
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gtid::MySql(g) => g.fmt(f),
            Gtid::MariaDb(g) => g.fmt(f),
        }
    }
}

/// `@@gtid_executed`: one entry per server, comma/newline separated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GtidSet {
    pub entries: Vec<MySqlGtid>,
}

impl GtidSet {
    pub fn parse(text: &str) -> Result<Self> {
        let entries = text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(MySqlGtid::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// The entry belonging to the given server.
    pub fn for_server(&self, server_uuid: &Uuid) -> Option<&MySqlGtid> {
        self.entries.iter().find(|g| &g.server_uuid == server_uuid)
    }
}

/// A position of any engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReplicationPosition {
    Binlog(BinlogPosition),
    Gtid(Gtid),
    Lsn(Lsn),
}

/// Positions of different kinds are unordered.
impl PartialOrd for ReplicationPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (ReplicationPosition::Binlog(a), ReplicationPosition::Binlog(b)) => a.partial_cmp(b),
            (ReplicationPosition::Gtid(a), ReplicationPosition::Gtid(b)) => a.partial_cmp(b),
            (ReplicationPosition::Lsn(a), ReplicationPosition::Lsn(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for ReplicationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationPosition::Binlog(p) => p.fmt(f),
            ReplicationPosition::Gtid(g) => g.fmt(f),
            ReplicationPosition::Lsn(l) => l.fmt(f),
        }
    }
}

impl From<BinlogPosition> for ReplicationPosition {
    fn from(p: BinlogPosition) -> Self {
        ReplicationPosition::Binlog(p)
    }
}

impl From<Gtid> for ReplicationPosition {
    fn from(g: Gtid) -> Self {
        ReplicationPosition::Gtid(g)
    }
}

impl From<Lsn> for ReplicationPosition {
    fn from(l: Lsn) -> Self {
        ReplicationPosition::Lsn(l)
    }
}
