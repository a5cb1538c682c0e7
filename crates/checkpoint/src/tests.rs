//! Unit tests for the checkpoint crate.

use serde_json::json;
use std::sync::Arc;
use sync_core::{CdcError, MissingBookmarkReason};
use tempfile::TempDir;

use crate::{
    BinlogPosition, BookmarkStore, Checkpoint, CommittedStateReader, Gtid, Lsn, ResumeOrigin,
    State, StateFile,
};

fn store(value: serde_json::Value) -> BookmarkStore {
    BookmarkStore::new(State::from_value(value).unwrap())
}

fn streams(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// Checkpoint Trait Tests
// ============================================================================

#[test]
fn test_binlog_checkpoint_bookmark_keys() {
    let position = BinlogPosition::new("mysql-bin.000003", 1000);
    let mut bookmark = crate::Bookmark::default();
    position.write_bookmark(&mut bookmark);

    assert_eq!(
        serde_json::to_value(&bookmark).unwrap(),
        json!({"log_file": "mysql-bin.000003", "log_pos": 1000})
    );
    assert_eq!(
        BinlogPosition::read_bookmark(&bookmark).unwrap(),
        Some(position.clone())
    );
    assert_eq!(position.to_cli_string(), "mysql-bin.000003:1000");
    assert_eq!(
        BinlogPosition::from_cli_string("mysql-bin.000003:1000").unwrap(),
        position
    );
}

#[test]
fn test_binlog_checkpoint_rejects_half_bookmark() {
    let state = State::from_value(json!({"bookmarks": {"db-t": {"log_file": "mysql-bin.000001"}}}))
        .unwrap();
    let err = BinlogPosition::read_bookmark(state.bookmark("db-t").unwrap()).unwrap_err();
    assert!(matches!(err, CdcError::PositionFormat { kind: "binlog", .. }));
}

#[test]
fn test_lsn_checkpoint_accepts_legacy_forms() {
    for value in [json!(94_411_299_840u64), json!("94411299840"), json!("15/FB5A1C00")] {
        let state = State::from_value(json!({"bookmarks": {"public-t": {"lsn": value}}})).unwrap();
        let lsn = Lsn::read_bookmark(state.bookmark("public-t").unwrap()).unwrap();
        assert_eq!(lsn, Some(Lsn(0x15_FB5A_1C00)));
    }
}

#[test]
fn test_lsn_checkpoint_written_as_integer() {
    let mut bookmark = crate::Bookmark::default();
    Lsn(42).write_bookmark(&mut bookmark);
    assert_eq!(serde_json::to_value(&bookmark).unwrap(), json!({"lsn": 42}));
}

#[test]
fn test_gtid_checkpoint_round_trip() {
    let gtid = Gtid::from_cli_string("0-1-345").unwrap();
    let mut bookmark = crate::Bookmark::default();
    gtid.write_bookmark(&mut bookmark);
    assert_eq!(bookmark.gtid(), Some("0-1-345"));
    assert_eq!(Gtid::read_bookmark(&bookmark).unwrap(), Some(gtid));
}

// ============================================================================
// Resume Position Tests
// ============================================================================

#[test]
fn test_resume_from_oldest_bookmark() {
    let store = store(json!({"bookmarks": {"db-a": {"lsn": 100}, "db-b": {"lsn": 50}}}));
    let resume = store
        .compute_resume_position::<Lsn>(&streams(&["db-a", "db-b"]), None)
        .unwrap();
    assert_eq!(resume.position, Lsn(50));
    assert_eq!(resume.origin, ResumeOrigin::Bookmark("db-b".to_string()));
}

#[test]
fn test_resume_fails_closed_without_bookmark() {
    let store = store(json!({"bookmarks": {"db-a": {"lsn": 100}, "db-b": {"lsn": 50}, "db-c": {"lsn": null}}}));
    let err = store
        .compute_resume_position::<Lsn>(&streams(&["db-a", "db-b", "db-c"]), None)
        .unwrap_err();
    match err {
        CdcError::MissingBookmark { stream, reason } => {
            assert_eq!(stream, "db-c");
            assert_eq!(reason, MissingBookmarkReason::NeverSynced);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_resume_with_baseline() {
    let store = store(json!({"bookmarks": {"db-a": {"lsn": 100}}}));
    let ids = streams(&["db-a", "db-c"]);

    let resume = store
        .compute_resume_position(&ids, Some(Lsn(70)))
        .unwrap();
    assert_eq!(resume.position, Lsn(70));
    assert_eq!(resume.origin, ResumeOrigin::Baseline);

    let resume = store
        .compute_resume_position(&ids, Some(Lsn(170)))
        .unwrap();
    assert_eq!(resume.position, Lsn(100));
}

#[test]
fn test_baseline_unused_when_all_streams_have_bookmarks() {
    let store = store(json!({"bookmarks": {"db-a": {"lsn": 100}}}));
    let resume = store
        .compute_resume_position(&streams(&["db-a"]), Some(Lsn(1)))
        .unwrap();
    assert_eq!(resume.position, Lsn(100));
}

#[test]
fn test_missing_bookmark_reports_interrupted_initial_sync() {
    let store = store(json!({"bookmarks": {"db-t": {"max_pk_values": {"id": 10}, "version": 1}}}));
    let err = store
        .compute_resume_position::<BinlogPosition>(&streams(&["db-t"]), None)
        .unwrap_err();
    assert!(matches!(
        err,
        CdcError::MissingBookmark {
            reason: MissingBookmarkReason::InitialSyncInterrupted,
            ..
        }
    ));
}

#[test]
fn test_resume_binlog_orders_by_file_then_offset() {
    let store = store(json!({"bookmarks": {
        "db-a": {"log_file": "mysql-bin.000010", "log_pos": 4},
        "db-b": {"log_file": "mysql-bin.000009", "log_pos": 9000}
    }}));
    let resume = store
        .compute_resume_position::<BinlogPosition>(&streams(&["db-a", "db-b"]), None)
        .unwrap();
    assert_eq!(resume.position, BinlogPosition::new("mysql-bin.000009", 9000));
}

#[test]
fn test_resume_mixed_gtid_flavours_is_an_error() {
    let store = store(json!({"bookmarks": {
        "db-a": {"gtid": "0-1-5"},
        "db-b": {"gtid": "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5"}
    }}));
    let err = store
        .compute_resume_position::<Gtid>(&streams(&["db-a", "db-b"]), None)
        .unwrap_err();
    assert!(matches!(err, CdcError::PositionFormat { kind: "gtid", .. }));
}

#[test]
fn test_resume_gtids_of_different_servers_is_an_error() {
    let store = store(json!({"bookmarks": {
        "db-a": {"gtid": "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-7"},
        "db-b": {"gtid": "4f22ab58-71ca-11e1-9e33-c80aa9429562:1-7"}
    }}));
    let err = store
        .compute_resume_position::<Gtid>(&streams(&["db-a", "db-b"]), None)
        .unwrap_err();
    assert!(matches!(err, CdcError::PositionFormat { kind: "gtid", .. }));
}

#[test]
fn test_no_streams_is_a_configuration_error() {
    let err = BookmarkStore::default()
        .compute_resume_position::<Lsn>(&[], None)
        .unwrap_err();
    assert!(matches!(err, CdcError::Configuration { .. }));
}

// ============================================================================
// Advance Tests
// ============================================================================

#[test]
fn test_advance_is_monotonic() {
    let ids = streams(&["public-t"]);
    let mut store = BookmarkStore::default();
    for lsn in [30, 10, 50, 20, 40] {
        store.advance(&ids, &Lsn(lsn));
    }
    assert_eq!(store.bookmark::<Lsn>("public-t").unwrap(), Some(Lsn(50)));
}

#[test]
fn test_advance_moves_to_a_gtid_of_another_server() {
    let ids = streams(&["db-t"]);
    let mut store = store(json!({"bookmarks": {
        "db-t": {"gtid": "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-7"}
    }}));
    let other = Gtid::parse("4f22ab58-71ca-11e1-9e33-c80aa9429562:7").unwrap();
    store.advance(&ids, &other);
    assert_eq!(store.bookmark::<Gtid>("db-t").unwrap(), Some(other));
}

#[test]
fn test_advance_writes_every_stream() {
    let ids = streams(&["db-a", "db-b"]);
    let mut store = store(json!({"bookmarks": {"db-a": {"log_file": "mysql-bin.000002", "log_pos": 10, "version": 7}}}));
    store.advance(&ids, &BinlogPosition::new("mysql-bin.000001", 500));
    store.advance(&ids, &BinlogPosition::new("mysql-bin.000002", 5));

    // db-a was already ahead of both positions
    assert_eq!(
        store.bookmark::<BinlogPosition>("db-a").unwrap(),
        Some(BinlogPosition::new("mysql-bin.000002", 10))
    );
    assert_eq!(
        store.bookmark::<BinlogPosition>("db-b").unwrap(),
        Some(BinlogPosition::new("mysql-bin.000002", 5))
    );
    assert_eq!(store.snapshot().bookmark("db-a").unwrap().version(), Some(7));
}

#[test]
fn test_advance_leaves_earlier_snapshots_untouched() {
    let ids = streams(&["public-t"]);
    let mut store = BookmarkStore::default();
    let first = store.advance(&ids, &Lsn(10));
    let second = store.advance(&ids, &Lsn(20));

    assert_eq!(first.bookmark("public-t").unwrap().get_u64("lsn"), Some(10));
    assert_eq!(second.bookmark("public-t").unwrap().get_u64("lsn"), Some(20));
    assert!(!Arc::ptr_eq(&first, &second));
}

#[test]
fn test_lowest_bookmark_skips_streams_without_one() {
    let store = store(json!({"bookmarks": {"s-a": {"lsn": 300}, "s-b": {"lsn": 200}, "s-c": {}}}));
    assert_eq!(
        store
            .lowest_bookmark::<Lsn>(&streams(&["s-a", "s-b", "s-c"]))
            .unwrap(),
        Some(Lsn(200))
    );
    assert_eq!(store.lowest_bookmark::<Lsn>(&streams(&["s-c"])).unwrap(), None);
}

// ============================================================================
// Version and Whitelist Tests
// ============================================================================

#[test]
fn test_stream_version_is_stamped_once() {
    let mut store = BookmarkStore::default();
    let version = store.stream_version("db-t");
    assert!(version > 0);
    assert_eq!(store.stream_version("db-t"), version);

    let mut store = self::store(json!({"bookmarks": {"db-t": {"version": "1685620800000"}}}));
    assert_eq!(store.stream_version("db-t"), 1685620800000);
}

#[test]
fn test_whitelist_bookmark_keys() {
    let mut store = store(json!({"bookmarks": {"db-t": {
        "log_file": "mysql-bin.000001",
        "log_pos": 4,
        "version": 1,
        "max_pk_values": {"id": 3},
        "last_pk_fetched": {"id": 2}
    }}}));
    let before = store.snapshot();
    store.whitelist_bookmark_keys(&streams(&["db-t"]), &["log_file", "log_pos", "gtid", "version"]);

    let keys: Vec<_> = store
        .snapshot()
        .bookmark("db-t")
        .unwrap()
        .keys()
        .map(str::to_string)
        .collect();
    assert_eq!(keys, vec!["log_file", "log_pos", "version"]);
    assert!(before.bookmark("db-t").unwrap().has_initial_sync_markers());
}

// ============================================================================
// StateFile Tests
// ============================================================================

#[tokio::test]
async fn test_state_file_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let file = StateFile::new(temp_dir.path().join("state").join("state.json"));

    assert!(file.read_committed().await.is_none());

    let mut store = BookmarkStore::default();
    let snapshot = store.advance(&streams(&["public-t"]), &Lsn(1234));
    file.write(&snapshot).unwrap();

    let committed = file.read_committed().await.unwrap();
    assert_eq!(committed, *snapshot);
}

#[tokio::test]
async fn test_state_file_unparseable_is_no_state() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("state.json");
    std::fs::write(&path, "{not json").unwrap();
    assert!(StateFile::new(path).read_committed().await.is_none());
}
