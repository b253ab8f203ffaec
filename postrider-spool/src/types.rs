use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Delivery lifecycle state of a spooled message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Eligible for delivery immediately.
    SendNow,
    /// Eligible once the wall clock reaches the given time.
    SendAt(SystemTime),
    /// A delivery attempt is in progress.
    Sending,
    /// Held until an operator intervenes.
    Frozen,
    /// Tombstone kept for audit; never delivered.
    Removed,
    /// Held aside with a reason; never delivered.
    Quarantined(String),
    /// Terminal: the on-disk entry is unlinked.
    Delivered,
}

impl Status {
    /// The status as the scheduler sees it: `SendAt(t)` downgrades to
    /// `SendNow` once `t` has passed.
    #[must_use]
    pub fn effective(&self, now: SystemTime) -> Self {
        match self {
            Self::SendAt(at) if *at <= now => Self::SendNow,
            other => other.clone(),
        }
    }

    pub fn is_eligible(&self, now: SystemTime) -> bool {
        matches!(self.effective(now), Self::SendNow)
    }
}

/// On-disk queue a message lives in, derived from its status.
///
/// This mapping is authoritative: the directory name under the spool root
/// equals [`Queue::dir_name`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Queue {
    Active,
    Frozen,
    Removed,
    Quarantine,
}

impl Queue {
    pub const ALL: [Self; 4] = [Self::Active, Self::Frozen, Self::Removed, Self::Quarantine];

    /// `None` for [`Status::Delivered`]: delivered entries have no queue.
    pub const fn of_status(status: &Status) -> Option<Self> {
        match status {
            Status::SendNow | Status::SendAt(_) | Status::Sending => Some(Self::Active),
            Status::Frozen => Some(Self::Frozen),
            Status::Removed => Some(Self::Removed),
            Status::Quarantined(_) => Some(Self::Quarantine),
            Status::Delivered => None,
        }
    }

    /// Stable on-disk directory name; operators depend on it.
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Frozen => "frozen",
            Self::Removed => "removed",
            Self::Quarantine => "quarantine",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn send_at_downgrades_once_due() {
        let now = SystemTime::now();
        let past = Status::SendAt(now - Duration::from_secs(1));
        let future = Status::SendAt(now + Duration::from_secs(60));

        assert_eq!(past.effective(now), Status::SendNow);
        assert!(past.is_eligible(now));
        assert_eq!(future.effective(now), future);
        assert!(!future.is_eligible(now));
    }

    #[test]
    fn queue_of_status_is_total_except_delivered() {
        let now = SystemTime::now();
        assert_eq!(Queue::of_status(&Status::SendNow), Some(Queue::Active));
        assert_eq!(Queue::of_status(&Status::SendAt(now)), Some(Queue::Active));
        assert_eq!(Queue::of_status(&Status::Sending), Some(Queue::Active));
        assert_eq!(Queue::of_status(&Status::Frozen), Some(Queue::Frozen));
        assert_eq!(Queue::of_status(&Status::Removed), Some(Queue::Removed));
        assert_eq!(
            Queue::of_status(&Status::Quarantined("malformed".to_string())),
            Some(Queue::Quarantine)
        );
        assert_eq!(Queue::of_status(&Status::Delivered), None);
    }

    #[test]
    fn dir_names_are_stable() {
        assert_eq!(Queue::Active.dir_name(), "active");
        assert_eq!(Queue::Frozen.dir_name(), "frozen");
        assert_eq!(Queue::Removed.dir_name(), "removed");
        assert_eq!(Queue::Quarantine.dir_name(), "quarantine");
    }
}
