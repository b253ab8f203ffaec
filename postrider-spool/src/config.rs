use std::path::PathBuf;

use serde::Deserialize;

const fn default_open_file_limit() -> usize {
    400
}

const fn default_event_capacity() -> usize {
    1024
}

const fn default_reserve_attempts() -> u32 {
    16
}

/// Configuration for the on-disk spool.
///
/// # Examples
///
/// RON config:
/// ```ron
/// Postrider (
///     spool: (
///         path: "/var/spool/postrider",
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SpoolConfig {
    /// Spool root directory; created if missing.
    pub path: PathBuf,

    /// Process-wide bound on simultaneously open record/body files.
    #[serde(default = "default_open_file_limit")]
    pub open_file_limit: usize,

    /// Per-subscriber event backlog before overflow drops kick in.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// How many fresh names `reserve` tries before giving up.
    #[serde(default = "default_reserve_attempts")]
    pub reserve_attempts: u32,
}

impl SpoolConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            open_file_limit: default_open_file_limit(),
            event_capacity: default_event_capacity(),
            reserve_attempts: default_reserve_attempts(),
        }
    }
}
