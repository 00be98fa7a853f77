//! Error types shared across the crate.

use std::io;
use thiserror::Error;

/// Errors produced by the index file, the tree engine and the group layer.
#[derive(Debug, Error)]
pub enum SpatialError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("index file signature does not match the index definition")]
    SignatureMismatch,

    #[error("requested sequence {requested} is beyond the database sequence {current}")]
    InvalidTargetSeq { requested: u64, current: u64 },

    #[error("entry not found in tree")]
    EntryNotFound,

    #[error("spatial function error: {0}")]
    Eval(String),

    #[error("index group has shut down")]
    GroupShutdown,

    #[error("index updater failed: {0}")]
    UpdaterFailed(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for spatial operations
pub type SpatialResult<T> = Result<T, SpatialError>;
