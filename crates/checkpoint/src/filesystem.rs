//! Filesystem-based state storage.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use sync_core::Result;

use crate::state::State;

/// Source of the state other participants have committed.
///
/// Processes sharing one replication slot coordinate only through the state
/// the orchestrator persists after the target has loaded their output.
#[async_trait]
pub trait CommittedStateReader: Send + Sync {
    /// The latest committed state, or `None` if there is none to read.
    async fn read_committed(&self) -> Option<State>;
}

/// A state JSON file as written by the orchestrator.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file. A missing or unparseable file is "no state".
    pub fn read(&self) -> Option<State> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) => {
                tracing::debug!("Cannot read state file {}: {err}", self.path.display());
                return None;
            }
        };
        match State::from_json(&content) {
            Ok(state) => Some(state),
            Err(err) => {
                tracing::debug!("Ignoring state file {}: {err}", self.path.display());
                None
            }
        }
    }

    pub fn write(&self, state: &State) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(state)?)?;
        tracing::info!("Stored state to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl CommittedStateReader for StateFile {
    async fn read_committed(&self) -> Option<State> {
        self.read()
    }
}
