//! Error types for spool operations.

use std::{io, path::PathBuf};

use postrider_common::MessageId;
use thiserror::Error;

/// Top-level spool error type.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record (de)serialization failed.
    #[error("Record serialization error: {0}")]
    Serialization(String),

    /// No entry with this id in the expected queue.
    #[error("Entry not found: {0}")]
    NotFound(MessageId),

    /// The entry's exclusive lock was still contended when `give_up`
    /// elapsed. Skip and retry on the next tick.
    #[error("Entry is locked: {0}")]
    Locked(MessageId),

    /// The on-disk record no longer matches the in-memory copy the caller
    /// mutated from. The on-disk record is preserved unchanged.
    #[error("On-disk record for {0} diverged from the in-memory copy")]
    DiskDivergence(MessageId),

    /// Could not reserve a fresh unique name.
    #[error("Name reservation failed after {attempts} attempts")]
    NameCollision { attempts: u32 },

    /// Another process holds the spool lockfile.
    #[error("Spool at {} is held by another process", .0.display())]
    SpoolBusy(PathBuf),

    /// A queue directory is on a different filesystem than the root, so
    /// cross-queue renames would not be atomic.
    #[error("Spool root {} spans devices: {} is on a different filesystem", .root.display(), .dir.display())]
    CrossDevice { root: PathBuf, dir: PathBuf },

    /// The spool is shutting down.
    #[error("Spool is shutting down")]
    Closed,
}

impl From<serde_json::Error> for SpoolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Specialized `Result` type for spool operations.
pub type Result<T> = std::result::Result<T, SpoolError>;
