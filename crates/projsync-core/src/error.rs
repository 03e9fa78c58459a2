use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Source unreadable: {path}: {source}")]
    SourceUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Destination write failed: {path}: {source}")]
    DestinationWriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Hash mismatch after copy: {path} (expected {expected}, found {actual})")]
    HashMismatchAfterCopy {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Checkpoint failed for {path}: {reason}")]
    CheckpointFailed { path: PathBuf, reason: String },

    #[error("Path escapes destination root: {path}")]
    PathTraversalRejected { path: PathBuf },

    #[error("Index write failed for {path}: {source}")]
    IndexWriteFailed {
        path: String,
        source: rusqlite::Error,
    },

    #[error("A backup run is already active")]
    Busy,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The per-file failure kind this error is reported as, if any.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Error::SourceUnreadable { .. } => Some(FailureKind::SourceUnreadable),
            Error::DestinationWriteFailed { .. } => Some(FailureKind::DestinationWriteFailed),
            Error::HashMismatchAfterCopy { .. } => Some(FailureKind::HashMismatchAfterCopy),
            Error::CheckpointFailed { .. } => Some(FailureKind::CheckpointFailed),
            Error::PathTraversalRejected { .. } => Some(FailureKind::PathTraversalRejected),
            Error::IndexWriteFailed { .. } => Some(FailureKind::IndexWriteFailed),
            _ => None,
        }
    }

    /// Systemic errors abort the remainder of a pass instead of being recorded per file.
    pub fn is_systemic(&self) -> bool {
        matches!(self, Error::DestinationWriteFailed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    SourceUnreadable,
    DestinationWriteFailed,
    HashMismatchAfterCopy,
    CheckpointFailed,
    PathTraversalRejected,
    IndexWriteFailed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::SourceUnreadable => "SourceUnreadable",
            FailureKind::DestinationWriteFailed => "DestinationWriteFailed",
            FailureKind::HashMismatchAfterCopy => "HashMismatchAfterCopy",
            FailureKind::CheckpointFailed => "CheckpointFailed",
            FailureKind::PathTraversalRejected => "PathTraversalRejected",
            FailureKind::IndexWriteFailed => "IndexWriteFailed",
        };
        f.write_str(name)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
