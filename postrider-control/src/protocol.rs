//! Control protocol types and serialization.

use std::{collections::BTreeMap, time::Duration};

use postrider_common::MessageId;
use serde::{Deserialize, Serialize};

/// Request sent to the control handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Queue sizes and oldest-entry ages.
    Status,
    /// Hold the given entries until an operator releases them.
    Freeze { ids: Vec<MessageId> },
    /// Make the given entries eligible now, prepending extra retry
    /// intervals for the attempts that follow.
    Send {
        retry_intervals: Vec<Duration>,
        ids: Vec<MessageId>,
    },
    /// Tombstone the given entries.
    Remove { ids: Vec<MessageId> },
    /// Move entries from the removed or quarantine queue back to frozen.
    Recover {
        from: RecoverFrom,
        ids: Vec<MessageId>,
    },
    /// Resize the outbound connection budget.
    SetMaxConcurrentSendJobs { n: usize },
}

/// Queues an entry can be recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoverFrom {
    Removed,
    Quarantine,
}

/// Response from the control handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Command succeeded.
    Ok,
    /// Command succeeded with status data.
    Status(SpoolStatus),
    /// Command failed with error message.
    Error(String),
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }
}

/// Per-queue view of the spool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub len: usize,
    /// Age of the oldest entry, if any.
    pub oldest_age_secs: Option<u64>,
}

/// Snapshot of every queue, keyed by its on-disk directory name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolStatus {
    pub queues: BTreeMap<String, QueueStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip_through_json() {
        let request = Request::Send {
            retry_intervals: vec![Duration::from_secs(60)],
            ids: Vec::new(),
        };
        let json = serde_json::to_string(&request).unwrap();
        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, Request::Send { retry_intervals, .. }
            if retry_intervals == vec![Duration::from_secs(60)]));
    }

    #[test]
    fn status_response_keys_by_directory_name() {
        let mut status = SpoolStatus::default();
        status.queues.insert(
            "active".to_string(),
            QueueStatus {
                len: 3,
                oldest_age_secs: Some(12),
            },
        );
        let json = serde_json::to_string(&Response::Status(status)).unwrap();
        assert!(json.contains("\"active\""));
        assert!(json.contains("\"oldest_age_secs\":12"));
    }
}
