//! MySQL replication positions and the server checks around them.
//!
//! A binlog bookmark holds `log_file`/`log_pos`, and `gtid` when GTID mode
//! is in use. The helpers here read the server's current position and make
//! sure the server can actually serve a binlog dump from a stored one.

use checkpoint::{BinlogPosition, Gtid, GtidSet, MariaDbGtid, MySqlGtid};
use std::fmt;
use sync_core::{CdcError, Result};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Engine;
use crate::source::BinlogSource;

/// Bookmark keys a binlog stream may carry once replication starts.
pub const BINLOG_BOOKMARK_KEYS: &[&str] = &[
    checkpoint::state::LOG_FILE,
    checkpoint::state::LOG_POS,
    checkpoint::state::GTID,
    checkpoint::state::VERSION,
];

/// Position of the binlog reader. The GTID is only known once the first
/// GTID event of a session has been read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MySqlPosition {
    pub binlog: Option<BinlogPosition>,
    pub gtid: Option<Gtid>,
}

impl MySqlPosition {
    pub fn at_binlog(position: BinlogPosition) -> Self {
        Self {
            binlog: Some(position),
            gtid: None,
        }
    }

    pub fn at_gtid(gtid: Gtid) -> Self {
        Self {
            binlog: None,
            gtid: Some(gtid),
        }
    }
}

impl fmt::Display for MySqlPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.binlog, &self.gtid) {
            (Some(binlog), Some(gtid)) => write!(f, "{binlog} ({gtid})"),
            (Some(binlog), None) => write!(f, "{binlog}"),
            (None, Some(gtid)) => write!(f, "{gtid}"),
            (None, None) => write!(f, "<unknown>"),
        }
    }
}

async fn required_variable(source: &dyn BinlogSource, name: &str) -> Result<String> {
    source.server_variable(name).await?.ok_or_else(|| {
        CdcError::configuration(name, format!("server variable @@{name} is not available"))
    })
}

/// Binlog must be row based with full row images.
pub async fn verify_binlog_config(source: &dyn BinlogSource) -> Result<()> {
    let binlog_format = required_variable(source, "binlog_format").await?;
    if !binlog_format.eq_ignore_ascii_case("ROW") {
        return Err(CdcError::configuration(
            "binlog_format",
            format!("expected ROW, found {binlog_format}"),
        ));
    }

    let Some(row_image) = source.server_variable("binlog_row_image").await? else {
        return Err(CdcError::configuration(
            "binlog_row_image",
            "not supported by this server; MySQL 5.6.2 or later is required",
        ));
    };
    if !row_image.eq_ignore_ascii_case("FULL") {
        return Err(CdcError::configuration(
            "binlog_row_image",
            format!("expected FULL, found {row_image}"),
        ));
    }
    Ok(())
}

/// MySQL needs GTID mode switched on; MariaDB always writes GTIDs.
pub async fn verify_gtid_config(source: &dyn BinlogSource, engine: Engine) -> Result<()> {
    if engine == Engine::Mariadb {
        return Ok(());
    }
    let gtid_mode = source.server_variable("gtid_mode").await?.unwrap_or_default();
    if !gtid_mode.eq_ignore_ascii_case("ON") {
        return Err(CdcError::configuration(
            "gtid_mode",
            format!(
                "GTID replication requires gtid_mode ON, found {}",
                if gtid_mode.is_empty() { "nothing" } else { &gtid_mode }
            ),
        ));
    }
    Ok(())
}

/// The bookmarked file must still exist and be long enough to hold the
/// bookmarked offset.
pub async fn verify_log_file_exists(
    source: &dyn BinlogSource,
    stream: &str,
    position: &BinlogPosition,
) -> Result<()> {
    let logs = source.binary_logs().await?;
    let Some(log) = logs.iter().find(|l| l.log_name == position.log_file) else {
        return Err(CdcError::ResumePositionExpired {
            stream: stream.to_string(),
            position: position.to_string(),
            reason: format!(
                "binlog file {} is no longer on the server (purged or rotated away)",
                position.log_file
            ),
        });
    };
    if position.log_pos > log.file_size {
        return Err(CdcError::ResumePositionExpired {
            stream: stream.to_string(),
            position: position.to_string(),
            reason: format!(
                "offset {} is past the end of {} ({} bytes)",
                position.log_pos, log.log_name, log.file_size
            ),
        });
    }
    debug!(
        "Binlog file {} exists with {} bytes, resuming at {}",
        log.log_name, log.file_size, position.log_pos
    );
    Ok(())
}

/// The transactions after a bookmarked GTID must still be in the binlogs.
///
/// MySQL lists what it purged in `@@gtid_purged`; anything purged past the
/// bookmark is lost. MariaDB has no purged set, so `@@gtid_binlog_state`
/// must still know the bookmark's domain and must not be behind it.
pub async fn verify_gtid_available(
    source: &dyn BinlogSource,
    stream: &str,
    gtid: &Gtid,
) -> Result<()> {
    let expired = |reason: String| CdcError::ResumePositionExpired {
        stream: stream.to_string(),
        position: gtid.to_string(),
        reason,
    };
    match gtid {
        Gtid::MySql(resume) => {
            let Some(purged) = source.server_variable("gtid_purged").await? else {
                debug!("@@gtid_purged is not available, skipping the purge check");
                return Ok(());
            };
            let purged = GtidSet::parse(&purged)?;
            if let Some(lost) = purged.for_server(&resume.server_uuid) {
                if lost.sequence() > resume.sequence() {
                    return Err(expired(format!(
                        "the server purged {lost}, past the bookmarked transaction"
                    )));
                }
            }
        }
        Gtid::MariaDb(resume) => {
            let Some(state) = source.server_variable("gtid_binlog_state").await? else {
                debug!("@@gtid_binlog_state is not available, skipping the purge check");
                return Ok(());
            };
            let latest = state
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(MariaDbGtid::parse)
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .filter(|g| g.domain_id == resume.domain_id)
                .map(|g| g.sequence)
                .max();
            match latest {
                None => {
                    return Err(expired(format!(
                        "the binlogs hold no history for GTID domain {}",
                        resume.domain_id
                    )))
                }
                Some(latest) if latest < resume.sequence => {
                    return Err(expired(format!(
                        "the binlogs of domain {} end at sequence {latest}, before the bookmark",
                        resume.domain_id
                    )))
                }
                Some(_) => {}
            }
        }
    }
    debug!("Binlogs still hold the transactions after {}", gtid);
    Ok(())
}

pub async fn fetch_current_log_file_and_pos(source: &dyn BinlogSource) -> Result<BinlogPosition> {
    source
        .master_status()
        .await?
        .ok_or_else(|| CdcError::configuration("log_bin", "binary logging is not enabled"))
}

/// The last GTID the server executed for its own transactions.
pub async fn fetch_current_gtid(source: &dyn BinlogSource, engine: Engine) -> Result<Gtid> {
    match engine {
        Engine::Mysql => {
            let server_uuid = required_variable(source, "server_uuid").await?;
            let uuid = Uuid::parse_str(server_uuid.trim()).map_err(|e| {
                CdcError::configuration("server_uuid", format!("'{server_uuid}' is not a UUID: {e}"))
            })?;
            let executed = required_variable(source, "gtid_executed").await?;
            let set = GtidSet::parse(&executed)?;
            let own: &MySqlGtid = set.for_server(&uuid).ok_or_else(|| {
                CdcError::configuration(
                    "gtid_executed",
                    format!("no GTID executed by this server ({uuid}) yet"),
                )
            })?;
            info!("Current MySQL GTID: {}", own);
            Ok(Gtid::MySql(own.clone()))
        }
        Engine::Mariadb => {
            let current = required_variable(source, "gtid_current_pos").await?;
            let server_id: Option<u32> = source
                .server_variable("server_id")
                .await?
                .and_then(|id| id.trim().parse().ok());
            let gtids = current
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(MariaDbGtid::parse)
                .collect::<Result<Vec<_>>>()?;
            let gtid = gtids
                .iter()
                .find(|g| Some(g.server_id) == server_id)
                .or_else(|| gtids.first())
                .copied()
                .ok_or_else(|| {
                    CdcError::configuration("gtid_current_pos", "no GTID executed yet")
                })?;
            info!("Current MariaDB GTID: {}", gtid);
            Ok(Gtid::MariaDb(gtid))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBinlogSource;
    use sync_core::ErrorCategory;

    #[tokio::test]
    async fn test_row_based_full_image_passes() {
        let source = FakeBinlogSource::new();
        verify_binlog_config(&source).await.unwrap();
    }

    #[tokio::test]
    async fn test_statement_format_is_rejected() {
        let source = FakeBinlogSource::new().with_variable("binlog_format", "STATEMENT");
        let err = verify_binlog_config(&source).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(err.to_string().contains("binlog_format"));
    }

    #[tokio::test]
    async fn test_minimal_row_image_is_rejected() {
        let source = FakeBinlogSource::new().with_variable("binlog_row_image", "MINIMAL");
        let err = verify_binlog_config(&source).await.unwrap_err();
        assert!(err.to_string().contains("binlog_row_image"));
        assert!(err.to_string().contains("MINIMAL"));
    }

    #[tokio::test]
    async fn test_old_server_without_row_image() {
        let source = FakeBinlogSource::new().without_variable("binlog_row_image");
        let err = verify_binlog_config(&source).await.unwrap_err();
        assert!(err.to_string().contains("5.6.2"));
    }

    #[tokio::test]
    async fn test_gtid_mode_off() {
        let source = FakeBinlogSource::new().with_variable("gtid_mode", "OFF");
        assert!(verify_gtid_config(&source, Engine::Mysql).await.is_err());
        verify_gtid_config(&source, Engine::Mariadb).await.unwrap();
    }

    #[tokio::test]
    async fn test_purged_log_file_expires_bookmark() {
        let source = FakeBinlogSource::new()
            .with_binary_log("mysql-bin.000002", 4_000)
            .with_binary_log("mysql-bin.000003", 1_000);

        let purged = BinlogPosition::new("mysql-bin.000001", 500);
        let err = verify_log_file_exists(&source, "db-t", &purged)
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::ResumePositionExpired { .. }));
        assert_eq!(err.category(), ErrorCategory::Position);

        let past_end = BinlogPosition::new("mysql-bin.000003", 1_001);
        assert!(verify_log_file_exists(&source, "db-t", &past_end)
            .await
            .is_err());

        let ok = BinlogPosition::new("mysql-bin.000002", 4_000);
        verify_log_file_exists(&source, "db-t", &ok).await.unwrap();
    }

    #[tokio::test]
    async fn test_purged_gtids_expire_bookmark() {
        let own = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
        let other = "4e11fa47-71ca-11e1-9e33-c80aa9429562";
        let source = FakeBinlogSource::new()
            .with_variable("gtid_purged", &format!("{other}:1-500,\n{own}:1-40"));

        let lost = Gtid::parse(&format!("{own}:30")).unwrap();
        let err = verify_gtid_available(&source, "db-t", &lost)
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::ResumePositionExpired { .. }));
        assert_eq!(err.category(), ErrorCategory::Position);

        let kept = Gtid::parse(&format!("{own}:40")).unwrap();
        verify_gtid_available(&source, "db-t", &kept).await.unwrap();

        // nothing purged on this server yet
        let source = FakeBinlogSource::new().with_variable("gtid_purged", "");
        verify_gtid_available(&source, "db-t", &lost).await.unwrap();
    }

    #[tokio::test]
    async fn test_mariadb_bookmark_outside_binlog_state_expires() {
        let source = FakeBinlogSource::new().with_variable("gtid_binlog_state", "0-1-90,0-2-120");

        let kept = Gtid::parse("0-1-100").unwrap();
        verify_gtid_available(&source, "db-t", &kept).await.unwrap();

        let other_domain = Gtid::parse("3-1-100").unwrap();
        let err = verify_gtid_available(&source, "db-t", &other_domain)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("domain 3"));

        // binlogs were reset since the bookmark
        let ahead = Gtid::parse("0-2-500").unwrap();
        assert!(matches!(
            verify_gtid_available(&source, "db-t", &ahead).await,
            Err(CdcError::ResumePositionExpired { .. })
        ));
    }

    #[tokio::test]
    async fn test_binary_logging_disabled() {
        let source = FakeBinlogSource::new();
        let err = fetch_current_log_file_and_pos(&source).await.unwrap_err();
        assert!(err.to_string().contains("log_bin"));

        let source = source.with_master_status(BinlogPosition::new("mysql-bin.000004", 154));
        assert_eq!(
            fetch_current_log_file_and_pos(&source).await.unwrap(),
            BinlogPosition::new("mysql-bin.000004", 154)
        );
    }

    #[tokio::test]
    async fn test_current_mysql_gtid_is_own_server_entry() {
        let own = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
        let other = "4e11fa47-71ca-11e1-9e33-c80aa9429562";
        let source = FakeBinlogSource::new()
            .with_variable("server_uuid", own)
            .with_variable("gtid_executed", &format!("{other}:1-99,\n{own}:1-23"));
        let gtid = fetch_current_gtid(&source, Engine::Mysql).await.unwrap();
        assert_eq!(gtid.to_string(), format!("{own}:1-23"));
        assert_eq!(gtid.sequence(), 23);
    }

    #[tokio::test]
    async fn test_current_mariadb_gtid_matches_server_id() {
        let source = FakeBinlogSource::new()
            .with_variable("gtid_current_pos", "0-1-100,1-2-7")
            .with_variable("server_id", "2");
        let gtid = fetch_current_gtid(&source, Engine::Mariadb).await.unwrap();
        assert_eq!(gtid.to_string(), "1-2-7");

        let source = source.with_variable("server_id", "9");
        let gtid = fetch_current_gtid(&source, Engine::Mariadb).await.unwrap();
        assert_eq!(gtid.to_string(), "0-1-100");
    }

    #[test]
    fn test_position_display() {
        let position = MySqlPosition::at_binlog(BinlogPosition::new("mysql-bin.000001", 4));
        assert_eq!(position.to_string(), "mysql-bin.000001:4");
        assert_eq!(MySqlPosition::default().to_string(), "<unknown>");
    }
}
