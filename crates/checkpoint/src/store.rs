//! Bookmark store: owns the state value and hands out immutable snapshots.

use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;
use sync_core::{CdcError, MissingBookmarkReason, Result};
use tracing::{debug, warn};

use crate::state::{State, VERSION};
use crate::Checkpoint;

/// Where a resume position came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOrigin {
    /// The oldest bookmark, held by this stream.
    Bookmark(String),
    /// The externally supplied baseline position.
    Baseline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint<P> {
    pub position: P,
    pub origin: ResumeOrigin,
}

/// Owner of the Singer state for one sync invocation.
///
/// Reads go through [`BookmarkStore::snapshot`]; writes clone the state only
/// when a snapshot is still alive, so a snapshot handed to the sink never
/// changes underneath it.
#[derive(Debug, Clone, Default)]
pub struct BookmarkStore {
    state: Arc<State>,
}

impl BookmarkStore {
    pub fn new(state: State) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn snapshot(&self) -> Arc<State> {
        Arc::clone(&self.state)
    }

    fn state_mut(&mut self) -> &mut State {
        Arc::make_mut(&mut self.state)
    }

    /// The stored position of one stream.
    pub fn bookmark<P: Checkpoint>(&self, tap_stream_id: &str) -> Result<Option<P>> {
        match self.state.bookmark(tap_stream_id) {
            Some(bookmark) => P::read_bookmark(bookmark),
            None => Ok(None),
        }
    }

    /// The oldest bookmark among `streams`.
    ///
    /// Every stream must hold a bookmark unless `baseline` is given, in which
    /// case the baseline stands in for the streams without one. Starting from
    /// the oldest position means streams that were further ahead see some
    /// events again.
    pub fn compute_resume_position<P: Checkpoint>(
        &self,
        streams: &[String],
        baseline: Option<P>,
    ) -> Result<ResumePoint<P>> {
        if streams.is_empty() {
            return Err(CdcError::configuration(
                "streams",
                "no log-based streams are selected",
            ));
        }

        let mut oldest: Option<ResumePoint<P>> = None;
        let mut needs_baseline = false;
        for stream in streams {
            let Some(position) = self.bookmark::<P>(stream)? else {
                if baseline.is_none() {
                    return Err(self.missing_bookmark(stream));
                }
                needs_baseline = true;
                continue;
            };
            oldest = Some(older(
                oldest,
                ResumePoint {
                    position,
                    origin: ResumeOrigin::Bookmark(stream.clone()),
                },
            )?);
        }

        if needs_baseline {
            if let Some(position) = baseline {
                oldest = Some(older(
                    oldest,
                    ResumePoint {
                        position,
                        origin: ResumeOrigin::Baseline,
                    },
                )?);
            }
        }

        let resume = oldest.ok_or_else(|| self.missing_bookmark(&streams[0]))?;
        debug!(
            "Resuming {} {} stream(s) from {} ({:?})",
            streams.len(),
            P::DATABASE_TYPE,
            resume.position,
            resume.origin
        );
        Ok(resume)
    }

    fn missing_bookmark(&self, stream: &str) -> CdcError {
        let interrupted = self
            .state
            .bookmark(stream)
            .map(|b| b.has_initial_sync_markers())
            .unwrap_or(false);
        CdcError::MissingBookmark {
            stream: stream.to_string(),
            reason: if interrupted {
                MissingBookmarkReason::InitialSyncInterrupted
            } else {
                MissingBookmarkReason::NeverSynced
            },
        }
    }

    /// The oldest position among the streams that have one.
    pub fn lowest_bookmark<P: Checkpoint>(&self, streams: &[String]) -> Result<Option<P>> {
        let mut lowest: Option<P> = None;
        for stream in streams {
            if let Some(position) = self.bookmark::<P>(stream)? {
                lowest = match lowest {
                    Some(current) if current <= position => Some(current),
                    _ => Some(position),
                };
            }
        }
        Ok(lowest)
    }

    /// Write `position` into the bookmark of every stream and return the new
    /// snapshot.
    ///
    /// Bookmarks never move backward: a stream already past `position` keeps
    /// its value. A position that cannot be ordered against the stored one
    /// (a GTID of another server) replaces it.
    pub fn advance<P: Checkpoint>(&mut self, streams: &[String], position: &P) -> Arc<State> {
        for stream in streams {
            let stored = self
                .state
                .bookmark(stream)
                .map(P::read_bookmark)
                .transpose()
                .unwrap_or_else(|err| {
                    warn!("Overwriting unreadable bookmark of '{stream}': {err}");
                    None
                })
                .flatten();
            if let Some(stored) = &stored {
                match stored.partial_cmp(position) {
                    Some(Ordering::Greater) => {
                        debug!("Bookmark of '{stream}' is already at {stored}, not moving to {position}");
                        continue;
                    }
                    Some(Ordering::Equal) => continue,
                    _ => {}
                }
            }
            position.write_bookmark(self.state_mut().bookmark_mut(stream));
        }
        self.snapshot()
    }

    /// The stream's table version, stamping one (epoch millis) if missing.
    pub fn stream_version(&mut self, tap_stream_id: &str) -> i64 {
        if let Some(version) = self
            .state
            .bookmark(tap_stream_id)
            .and_then(|b| b.version())
        {
            return version;
        }
        let version = Utc::now().timestamp_millis();
        self.state_mut()
            .bookmark_mut(tap_stream_id)
            .set(VERSION, version);
        version
    }

    /// Drop every bookmark key of `streams` not in `keys`.
    pub fn whitelist_bookmark_keys(&mut self, streams: &[String], keys: &[&str]) {
        for stream in streams {
            let dirty = self
                .state
                .bookmark(stream)
                .map(|b| b.keys().any(|k| !keys.contains(&k)))
                .unwrap_or(false);
            if dirty {
                self.state_mut().bookmark_mut(stream).retain_keys(keys);
            }
        }
    }
}

impl From<State> for BookmarkStore {
    fn from(state: State) -> Self {
        BookmarkStore::new(state)
    }
}

fn older<P: Checkpoint>(
    current: Option<ResumePoint<P>>,
    candidate: ResumePoint<P>,
) -> Result<ResumePoint<P>> {
    let Some(current) = current else {
        return Ok(candidate);
    };
    match candidate.position.partial_cmp(&current.position) {
        Some(Ordering::Less) => Ok(candidate),
        Some(_) => Ok(current),
        None => Err(CdcError::position_format(
            P::KIND,
            candidate.position.to_string(),
            format!("cannot be ordered against {}", current.position),
        )),
    }
}
