//! Logical replication source configuration.

use serde::Deserialize;
use std::time::Duration;
use sync_core::DEFAULT_UPDATE_BOOKMARK_PERIOD;

/// Settings for one logical replication run.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresLogicalConfig {
    /// tokio-postgres connection string, key/value or URL form.
    pub connection_string: String,

    /// Database the replication slot belongs to.
    pub dbname: String,

    /// Distinguishes slots when several taps replicate one database.
    #[serde(default)]
    pub tap_id: Option<String>,

    /// Use this slot instead of locating one by name.
    #[serde(default)]
    pub slot_name: Option<String>,

    #[serde(default = "default_slot_prefix")]
    pub slot_prefix: String,

    /// Add `_sdc_lsn` to every record.
    #[serde(default)]
    pub debug_lsn: bool,

    /// Hard limit on one run.
    #[serde(default = "default_max_run_seconds")]
    pub max_run_seconds: u64,

    /// Stop after this long without a message.
    #[serde(default = "default_logical_poll_total_seconds")]
    pub logical_poll_total_seconds: u64,

    /// How often committed state is re-read and the slot acknowledged.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    /// Stop at the WAL position captured when the run started.
    #[serde(default = "default_break_at_end_lsn")]
    pub break_at_end_lsn: bool,

    /// Distinct LSNs between bookmark flushes.
    #[serde(default = "default_update_bookmark_period")]
    pub update_bookmark_period: u64,

    /// Rows fetched at a time from a slot read window.
    #[serde(default = "default_peek_batch_size")]
    pub peek_batch_size: u32,

    /// Pause between polls of an idle slot.
    #[serde(default = "default_idle_wait_millis")]
    pub idle_wait_millis: u64,
}

impl PostgresLogicalConfig {
    pub fn new(connection_string: impl Into<String>, dbname: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            dbname: dbname.into(),
            tap_id: None,
            slot_name: None,
            slot_prefix: default_slot_prefix(),
            debug_lsn: false,
            max_run_seconds: default_max_run_seconds(),
            logical_poll_total_seconds: default_logical_poll_total_seconds(),
            poll_interval_seconds: default_poll_interval_seconds(),
            break_at_end_lsn: default_break_at_end_lsn(),
            update_bookmark_period: default_update_bookmark_period(),
            peek_batch_size: default_peek_batch_size(),
            idle_wait_millis: default_idle_wait_millis(),
        }
    }

    pub fn max_run(&self) -> Duration {
        Duration::from_secs(self.max_run_seconds)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_secs(self.logical_poll_total_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_millis)
    }
}

fn default_slot_prefix() -> String {
    "pipelinewise".to_string()
}

fn default_max_run_seconds() -> u64 {
    43_200
}

fn default_logical_poll_total_seconds() -> u64 {
    10_800
}

fn default_poll_interval_seconds() -> u64 {
    10
}

fn default_break_at_end_lsn() -> bool {
    true
}

fn default_update_bookmark_period() -> u64 {
    DEFAULT_UPDATE_BOOKMARK_PERIOD
}

fn default_peek_batch_size() -> u32 {
    10_000
}

fn default_idle_wait_millis() -> u64 {
    1_000
}
