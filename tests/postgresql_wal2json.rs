//! PostgreSQL wal2json replication end to end: exact values on the wire,
//! soft deletes and resumption from a persisted state file.

use serde_json::{json, Value as Json};
use std::sync::Arc;
use sync_core::testing::StaticDiscovery;
use tap_cdc::postgresql::testing::{delete_message, pg_catalog_entry, FakeLogicalSource, FakeResolver};
use tap_cdc::postgresql::{run_incremental_sync, PostgresLogicalConfig, WalMessage};
use tap_cdc::{Catalog, JsonLinesSink, LoopState, Lsn, State, StateFile};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tap_cdc_postgresql_wal2json_source=debug".into()),
        )
        .try_init()
        .ok();
}

fn catalog() -> Catalog {
    Catalog {
        streams: vec![pg_catalog_entry(
            "public",
            "scores",
            &[("name", "text"), ("score", "numeric(10,2)")],
        )],
    }
}

/// An insert whose numeric is written verbatim, as wal2json does.
fn score_insert(lsn: u64, id: i64, name: &str, score: &str) -> WalMessage {
    WalMessage {
        data_start: Lsn(lsn),
        payload: format!(
            r#"{{"action":"I","timestamp":"2023-06-01 12:00:00+00","lsn":"{}","schema":"public","table":"scores","columns":[{{"name":"id","type":"integer","value":{}}},{{"name":"name","type":"text","value":"{}"}},{{"name":"score","type":"numeric(10,2)","value":{}}}]}}"#,
            Lsn(lsn),
            id,
            name,
            score
        ),
    }
}

fn lines(output: Vec<u8>) -> Vec<String> {
    String::from_utf8(output)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

fn parse(line: &str) -> Json {
    serde_json::from_str(line).unwrap()
}

#[tokio::test]
async fn test_wal2json_run_writes_singer_messages_and_resumes() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let state_file = StateFile::new(dir.path().join("state.json"));
    state_file.write(&State::from_value(json!({
        "bookmarks": {"public-scores": {"lsn": 100, "version": 7, "xmin": 12}}
    }))?)?;

    let source = FakeLogicalSource::new()
        .with_default_slot()
        .with_current_lsn(300)
        .with_messages([
            score_insert(200, 1, "ann", "10.50"),
            delete_message(300, "public", "scores", &[("id", "integer", json!(1))]),
        ]);
    let mut config = PostgresLogicalConfig::new("host=localhost dbname=shop", "shop");
    config.debug_lsn = true;

    let mut sink = JsonLinesSink::new(Vec::new());
    let outcome = run_incremental_sync(
        &config,
        &source,
        &FakeResolver::default(),
        &catalog(),
        state_file.read().ok_or("state file unreadable")?,
        Arc::new(StaticDiscovery::default()),
        &state_file,
        &mut sink,
        None,
    )
    .await?;

    assert_eq!(outcome.exit, LoopState::CaughtUp);
    assert_eq!(outcome.final_position, Some(Lsn(300)));
    assert_eq!(source.opened()[0].1, Lsn(100));

    let output = lines(sink.into_inner());
    let schema = parse(&output[0]);
    assert_eq!(schema["type"], json!("SCHEMA"));
    assert_eq!(schema["bookmark_properties"], json!(["lsn"]));

    let records: Vec<&String> = output
        .iter()
        .filter(|line| parse(line)["type"] == "RECORD")
        .collect();
    assert_eq!(records.len(), 2);
    // exact numerics are written as JSON numbers with their scale
    assert!(records[0].contains(r#""score":10.50"#), "{}", records[0]);
    let insert = parse(records[0]);
    assert_eq!(insert["version"], json!(7));
    assert_eq!(insert["record"]["_sdc_deleted_at"], Json::Null);
    assert_eq!(insert["record"]["_sdc_lsn"], json!("200"));

    let delete = parse(records[1]);
    assert_eq!(delete["record"]["id"], json!(1));
    assert_eq!(
        delete["record"]["_sdc_deleted_at"],
        json!("2023-06-01T12:00:00.000000Z")
    );

    let state = output
        .iter()
        .map(|line| parse(line))
        .filter(|m| m["type"] == "STATE")
        .last()
        .ok_or("no STATE written")?;
    assert_eq!(
        state["value"]["bookmarks"]["public-scores"],
        json!({"lsn": 300, "version": 7})
    );
    state_file.write(&outcome.state)?;

    let mut sink = JsonLinesSink::new(Vec::new());
    let second = run_incremental_sync(
        &config,
        &source,
        &FakeResolver::default(),
        &catalog(),
        state_file.read().ok_or("state file unreadable")?,
        Arc::new(StaticDiscovery::default()),
        &state_file,
        &mut sink,
        None,
    )
    .await?;
    assert_eq!(second.exit, LoopState::CaughtUp);
    assert_eq!(source.opened()[1].1, Lsn(300));
    // the change at the bookmark is delivered again
    let output = lines(sink.into_inner());
    let records: Vec<Json> = output
        .iter()
        .map(|line| parse(line))
        .filter(|m| m["type"] == "RECORD")
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["record"]["_sdc_lsn"], json!("300"));
    Ok(())
}
