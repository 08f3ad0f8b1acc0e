//! Error types for the deduplication pipeline.

use std::io;
use std::path::PathBuf;

// Every variant is fatal at the subcommand boundary: the caller logs one
// critical message and exits non-zero. Re-running with unchanged inputs is
// safe because the whole pipeline is deterministic.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open {path}: {source}")]
    IoOpen { path: PathBuf, source: io::Error },

    #[error("failed to read from {path}: {source}")]
    IoRead { path: PathBuf, source: io::Error },

    #[error("failed to write to {path}: {source}")]
    IoWrite { path: PathBuf, source: io::Error },

    #[error("failed to seek in {path}: {source}")]
    IoSeek { path: PathBuf, source: io::Error },

    #[error("unrecognized magic {found:?} in {path}")]
    BadMagic { path: PathBuf, found: [u8; 8] },

    #[error("bad header in {path}: {reason}")]
    BadHeader { path: PathBuf, reason: String },

    #[error("inconsistent sizes ({reason}): expected {expected}, got {actual}")]
    InconsistentSize {
        reason: String,
        expected: u64,
        actual: u64,
    },

    #[error("value out of range: {reason}")]
    OutOfRange { reason: String },

    #[error("target not found in the source manifest: {0}")]
    NotFound(String),

    #[error("target listed more than once in the source manifest: {0}")]
    Duplicate(String),
}

pub type Result<T> = std::result::Result<T, Error>;
