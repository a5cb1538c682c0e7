//! Postgres replication positions and the server checks around them.
//!
//! Bookmarks hold `lsn` as an integer. Before reading, the server version is
//! checked, the replication slot located and the resume LSN compared with
//! what the slot can still serve.

use checkpoint::Lsn;
use sync_core::{CdcError, Result};
use tracing::{debug, info};

use crate::config::PostgresLogicalConfig;
use crate::source::{LogicalReplicationSource, ReplicationSlot};

/// Bookmark keys a logical stream carries once replication starts.
pub const LOGICAL_BOOKMARK_KEYS: &[&str] = &[checkpoint::state::LSN, checkpoint::state::VERSION];

/// Plugin every slot read by this tap must use.
pub const OUTPUT_PLUGIN: &str = "wal2json";

/// Minor releases whose logical decoding can lose changes (bug #15114):
/// `(first affected, first fixed)`.
const LOGICAL_DECODING_BUG_RANGES: &[(u32, u32)] = &[
    (90400, 90421),
    (90500, 90516),
    (90600, 90612),
    (100000, 100007),
    (110000, 110002),
];

/// `150004` as `15.4`, `90621` as `9.6.21`.
pub fn display_server_version(version_num: u32) -> String {
    if version_num >= 100000 {
        format!("{}.{}", version_num / 10000, version_num % 10000)
    } else {
        format!(
            "{}.{}.{}",
            version_num / 10000,
            version_num / 100 % 100,
            version_num % 100
        )
    }
}

pub fn verify_server_version(version_num: u32) -> Result<()> {
    let version = display_server_version(version_num);
    if version_num < 90400 {
        return Err(CdcError::configuration(
            "server_version_num",
            format!("logical replication requires PostgreSQL 9.4 or later, server is {version}"),
        ));
    }
    if let Some((_, fixed)) = LOGICAL_DECODING_BUG_RANGES
        .iter()
        .find(|(first, fixed)| (*first..*fixed).contains(&version_num))
    {
        return Err(CdcError::configuration(
            "server_version_num",
            format!(
                "PostgreSQL {version} has a logical decoding bug that can lose changes, upgrade to {} or later",
                display_server_version(*fixed)
            ),
        ));
    }
    debug!("PostgreSQL {} supports logical replication", version);
    Ok(())
}

/// Query returning the current WAL write position as text.
pub fn current_lsn_query(version_num: u32) -> &'static str {
    if version_num >= 100000 {
        "SELECT pg_current_wal_lsn()::text"
    } else {
        "SELECT pg_current_xlog_location()::text"
    }
}

/// `<prefix>_<dbname>[_<tap_id>]`, lowercased, anything outside
/// `[a-z0-9_]` replaced by `_`.
pub fn generate_slot_name(prefix: &str, dbname: &str, tap_id: Option<&str>) -> String {
    let name = match tap_id {
        Some(tap_id) => format!("{prefix}_{dbname}_{tap_id}"),
        None => format!("{prefix}_{dbname}"),
    };
    name.to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Slot names tried in order.
pub fn slot_name_candidates(config: &PostgresLogicalConfig) -> Vec<String> {
    if let Some(slot_name) = &config.slot_name {
        return vec![slot_name.clone()];
    }
    let mut candidates = vec![generate_slot_name(&config.slot_prefix, &config.dbname, None)];
    if let Some(tap_id) = config.tap_id.as_deref() {
        candidates.push(generate_slot_name(
            &config.slot_prefix,
            &config.dbname,
            Some(tap_id),
        ));
    }
    candidates
}

/// The first candidate slot that exists and uses wal2json.
pub async fn locate_replication_slot(
    source: &dyn LogicalReplicationSource,
    config: &PostgresLogicalConfig,
) -> Result<ReplicationSlot> {
    let candidates = slot_name_candidates(config);
    for name in &candidates {
        match source.replication_slot(name).await? {
            Some(slot) if slot.plugin == OUTPUT_PLUGIN => {
                info!("Using replication slot {}", slot.slot_name);
                return Ok(slot);
            }
            Some(slot) => {
                return Err(CdcError::configuration(
                    "slot_name",
                    format!(
                        "replication slot '{}' uses plugin '{}', expected '{OUTPUT_PLUGIN}'",
                        slot.slot_name, slot.plugin
                    ),
                ))
            }
            None => debug!("No replication slot named {}", name),
        }
    }
    Err(CdcError::configuration(
        "slot_name",
        format!("no {OUTPUT_PLUGIN} replication slot found, tried {}", candidates.join(", ")),
    ))
}

/// Fail if the slot has already released WAL the resume point needs.
pub fn verify_resume_position(slot: &ReplicationSlot, stream: &str, start: Lsn) -> Result<()> {
    match slot.confirmed_flush_lsn {
        Some(confirmed) if start < confirmed => Err(CdcError::ResumePositionExpired {
            stream: stream.to_string(),
            position: start.to_string(),
            reason: format!(
                "replication slot '{}' is confirmed up to {confirmed}",
                slot.slot_name
            ),
        }),
        _ => Ok(()),
    }
}

pub async fn fetch_current_lsn(
    source: &dyn LogicalReplicationSource,
    version_num: u32,
) -> Result<Lsn> {
    let lsn = source.current_wal_lsn(version_num).await?;
    debug!("Current WAL position {}", lsn);
    Ok(lsn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLogicalSource;

    #[test]
    fn test_display_server_version() {
        assert_eq!(display_server_version(150004), "15.4");
        assert_eq!(display_server_version(90621), "9.6.21");
        assert_eq!(display_server_version(100007), "10.7");
    }

    #[test]
    fn test_version_gating() {
        assert!(verify_server_version(90300).is_err());
        assert!(verify_server_version(90420).is_err());
        assert!(verify_server_version(90421).is_ok());
        assert!(verify_server_version(90515).is_err());
        assert!(verify_server_version(90611).is_err());
        assert!(verify_server_version(90612).is_ok());
        assert!(verify_server_version(100006).is_err());
        assert!(verify_server_version(100007).is_ok());
        assert!(verify_server_version(110001).is_err());
        assert!(verify_server_version(110002).is_ok());
        assert!(verify_server_version(160002).is_ok());

        let err = verify_server_version(100003).unwrap_err();
        assert!(err.to_string().contains("10.7"));
    }

    #[test]
    fn test_current_lsn_query() {
        assert!(current_lsn_query(150004).contains("pg_current_wal_lsn"));
        assert!(current_lsn_query(90621).contains("pg_current_xlog_location"));
    }

    #[test]
    fn test_generate_slot_name() {
        assert_eq!(generate_slot_name("pipelinewise", "Shop", None), "pipelinewise_shop");
        assert_eq!(
            generate_slot_name("pipelinewise", "my-db", Some("Tap.1")),
            "pipelinewise_my_db_tap_1"
        );
    }

    #[test]
    fn test_slot_name_candidates() {
        let mut config = PostgresLogicalConfig::new("host=localhost", "shop");
        assert_eq!(slot_name_candidates(&config), vec!["pipelinewise_shop"]);
        config.tap_id = Some("eu".to_string());
        assert_eq!(
            slot_name_candidates(&config),
            vec!["pipelinewise_shop", "pipelinewise_shop_eu"]
        );
        config.slot_name = Some("custom".to_string());
        assert_eq!(slot_name_candidates(&config), vec!["custom"]);
    }

    #[tokio::test]
    async fn test_locate_falls_back_to_tap_id_slot() {
        let source = FakeLogicalSource::new().with_slot("pipelinewise_shop_eu", OUTPUT_PLUGIN, None);
        let mut config = PostgresLogicalConfig::new("host=localhost", "shop");
        config.tap_id = Some("eu".to_string());
        let slot = locate_replication_slot(&source, &config).await.unwrap();
        assert_eq!(slot.slot_name, "pipelinewise_shop_eu");
    }

    #[tokio::test]
    async fn test_locate_rejects_other_plugins_and_missing_slots() {
        let config = PostgresLogicalConfig::new("host=localhost", "shop");
        let source = FakeLogicalSource::new().with_slot("pipelinewise_shop", "pgoutput", None);
        let err = locate_replication_slot(&source, &config).await.unwrap_err();
        assert!(err.to_string().contains("pgoutput"));

        let err = locate_replication_slot(&FakeLogicalSource::new(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::Configuration { .. }));
        assert!(err.to_string().contains("pipelinewise_shop"));
    }

    #[test]
    fn test_resume_before_confirmed_flush_is_expired() {
        let slot = ReplicationSlot {
            slot_name: "pipelinewise_shop".to_string(),
            plugin: OUTPUT_PLUGIN.to_string(),
            confirmed_flush_lsn: Some(Lsn(500)),
        };
        assert!(verify_resume_position(&slot, "public-users", Lsn(500)).is_ok());
        assert!(verify_resume_position(&slot, "public-users", Lsn(900)).is_ok());
        let err = verify_resume_position(&slot, "public-users", Lsn(100)).unwrap_err();
        assert!(matches!(err, CdcError::ResumePositionExpired { .. }));

        let unknown = ReplicationSlot {
            confirmed_flush_lsn: None,
            ..slot
        };
        assert!(verify_resume_position(&unknown, "public-users", Lsn(1)).is_ok());
    }
}
