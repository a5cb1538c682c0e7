//! Replication loop lifecycle.

use std::fmt;
use tracing::debug;

use crate::counters::SyncCounters;

/// `Init -> Streaming -> (CaughtUp | TimedOut | Error) -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Streaming,
    /// Reached the position captured before the stream was opened.
    CaughtUp,
    /// Quiet period or wall-clock limit elapsed.
    TimedOut,
    Error,
    Closed,
}

impl LoopState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: LoopState) -> bool {
        use LoopState::*;
        matches!(
            (self, next),
            (Init, Streaming)
                | (Init, CaughtUp)
                | (Init, Error)
                | (Streaming, CaughtUp)
                | (Streaming, TimedOut)
                | (Streaming, Error)
                | (CaughtUp, Closed)
                | (TimedOut, Closed)
                | (Error, Closed)
        )
    }

    /// Move to `next`. Illegal transitions are a bug in the loop.
    pub fn transition_to(&mut self, next: LoopState) {
        debug_assert!(
            self.can_transition_to(next),
            "illegal loop transition {self} -> {next}"
        );
        debug!("Replication loop: {} -> {}", self, next);
        *self = next;
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Init => "init",
            LoopState::Streaming => "streaming",
            LoopState::CaughtUp => "caught_up",
            LoopState::TimedOut => "timed_out",
            LoopState::Error => "error",
            LoopState::Closed => "closed",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one replication run.
///
/// `S` is the final state snapshot, `P` the engine position type.
#[derive(Debug, Clone)]
pub struct SyncOutcome<S, P> {
    /// `CaughtUp` or `TimedOut`; errors are returned instead of an outcome.
    pub exit: LoopState,
    pub state: S,
    pub final_position: Option<P>,
    pub counters: SyncCounters,
}
