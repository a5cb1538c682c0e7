//! Error taxonomy for change data capture.
//!
//! Every failure the replication loops can surface falls into one
//! [`ErrorCategory`]. Only [`ErrorCategory::Decode`] is recoverable: the
//! offending event is logged and skipped. Everything else aborts the
//! invocation, leaving the last flushed STATE message as the resume point.

use thiserror::Error;

/// Boxed driver error carried by [`CdcError::Stream`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias used across the tap-cdc crates.
pub type Result<T, E = CdcError> = std::result::Result<T, E>;

/// Broad classification of a [`CdcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Source is not configured for change capture.
    Configuration,
    /// Bookmark or position is malformed, missing or expired.
    Position,
    /// A single event could not be decoded.
    Decode,
    /// A column type has no working coercion (arrays, hstore).
    TypeMapping,
    /// The replication stream or a bookkeeping query failed.
    Stream,
    /// Writing to the message sink failed.
    Sink,
    /// Scoped re-discovery failed during a schema refresh.
    Discovery,
}

/// Why a stream has no usable log-based bookmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingBookmarkReason {
    /// No position was ever stamped for the stream.
    NeverSynced,
    /// An initial full-table sync was interrupted (`max_pk_values` /
    /// `last_pk_fetched` are still present).
    InitialSyncInterrupted,
}

impl std::fmt::Display for MissingBookmarkReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MissingBookmarkReason::NeverSynced => write!(f, "no log position was ever recorded"),
            MissingBookmarkReason::InitialSyncInterrupted => {
                write!(f, "the initial full-table sync did not complete")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CdcError {
    #[error("source is not configured for change capture ({setting}): {message}")]
    Configuration { setting: String, message: String },

    #[error("malformed {kind} position '{value}': {reason}")]
    PositionFormat {
        kind: &'static str,
        value: String,
        reason: String,
    },

    #[error("stream '{stream}' cannot resume from {position}: {reason}; run a fresh bulk sync")]
    ResumePositionExpired {
        stream: String,
        position: String,
        reason: String,
    },

    #[error(
        "stream '{stream}' has no log-based bookmark ({reason}); a starting position must be stamped by a bulk sync"
    )]
    MissingBookmark {
        stream: String,
        reason: MissingBookmarkReason,
    },

    #[error("failed to decode event for stream '{stream}': {message}")]
    Decode { stream: String, message: String },

    #[error("no coercion for column '{column}' of type '{sql_datatype}': {message}")]
    TypeMapping {
        column: String,
        sql_datatype: String,
        message: String,
    },

    #[error("{context}: {source}")]
    Stream {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to write message: {0}")]
    Sink(#[from] std::io::Error),

    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("discovery of '{stream}' failed: {message}")]
    Discovery { stream: String, message: String },
}

impl CdcError {
    pub fn configuration(setting: impl Into<String>, message: impl Into<String>) -> Self {
        CdcError::Configuration {
            setting: setting.into(),
            message: message.into(),
        }
    }

    pub fn position_format(
        kind: &'static str,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        CdcError::PositionFormat {
            kind,
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn decode(stream: impl Into<String>, message: impl Into<String>) -> Self {
        CdcError::Decode {
            stream: stream.into(),
            message: message.into(),
        }
    }

    pub fn type_mapping(
        column: impl Into<String>,
        sql_datatype: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CdcError::TypeMapping {
            column: column.into(),
            sql_datatype: sql_datatype.into(),
            message: message.into(),
        }
    }

    /// Wrap a driver error with the operation that was running.
    pub fn stream<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        CdcError::Stream {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CdcError::Configuration { .. } => ErrorCategory::Configuration,
            CdcError::PositionFormat { .. }
            | CdcError::ResumePositionExpired { .. }
            | CdcError::MissingBookmark { .. } => ErrorCategory::Position,
            CdcError::Decode { .. } => ErrorCategory::Decode,
            CdcError::TypeMapping { .. } => ErrorCategory::TypeMapping,
            CdcError::Stream { .. } => ErrorCategory::Stream,
            CdcError::Sink(_) | CdcError::Serialization(_) => ErrorCategory::Sink,
            CdcError::Discovery { .. } => ErrorCategory::Discovery,
        }
    }

    /// Whether the loop must stop. Decode errors only cost the one event.
    pub fn is_fatal(&self) -> bool {
        self.category() != ErrorCategory::Decode
    }
}
