//! Pure retry scheduling: maps a delivery outcome onto the record's next
//! state.
//!
//! | Outcome | Next state |
//! |---|---|
//! | Envelope accepted | `Delivered` (entry unlinked) |
//! | Permanent envelope reject, or no recipients left | `Frozen` |
//! | Temporary failure, no intervals left | `Frozen` |
//! | Temporary failure, interval `r` remaining | `SendAt(now + r)` |
//!
//! Rejected recipients are partitioned by reply class: permanent rejects
//! move to `failed_recipients`, transient rejects stay remaining.

use std::time::SystemTime;

use postrider_common::{EnvelopeStatus, RejectedRecipient};
use postrider_spool::{MessageRecord, Status};

/// A delivery attempt's outcome as seen by the scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The downstream accepted the envelope for the recipients it did not
    /// explicitly reject.
    Accepted {
        rejected_recipients: Vec<RejectedRecipient>,
    },
    /// The downstream refused the envelope itself (sender or body).
    EnvelopeRejected {
        reply: postrider_common::Reply,
        rejected_recipients: Vec<RejectedRecipient>,
    },
    /// Every recipient was refused before DATA.
    AllRecipientsRejected {
        rejected_recipients: Vec<RejectedRecipient>,
    },
    /// Transport-level failure: connect, I/O, or protocol breakdown.
    Unreachable { error: String },
    /// No pooled connection became available within `give_up`.
    GaveUpWaiting,
    /// The cache is shutting down.
    CacheClosed,
}

impl SendOutcome {
    pub fn from_status(status: EnvelopeStatus) -> Self {
        match status {
            EnvelopeStatus::Ok {
                rejected_recipients,
                ..
            } => Self::Accepted {
                rejected_recipients,
            },
            EnvelopeStatus::NoRecipients {
                rejected_recipients,
            } => Self::AllRecipientsRejected {
                rejected_recipients,
            },
            EnvelopeStatus::RejectedSender { reply } => Self::EnvelopeRejected {
                reply,
                rejected_recipients: Vec::new(),
            },
            EnvelopeStatus::RejectedSenderAndRecipients {
                reply,
                rejected_recipients,
            }
            | EnvelopeStatus::RejectedBody {
                reply,
                rejected_recipients,
            } => Self::EnvelopeRejected {
                reply,
                rejected_recipients,
            },
        }
    }

    /// One-line description recorded in `relay_attempts`.
    pub fn describe(&self) -> String {
        match self {
            Self::Accepted { .. } => "accepted".to_string(),
            Self::EnvelopeRejected { reply, .. } => format!("envelope rejected: {reply}"),
            Self::AllRecipientsRejected {
                rejected_recipients,
            } => format!("all {} recipients rejected", rejected_recipients.len()),
            Self::Unreachable { error } => format!("unreachable: {error}"),
            Self::GaveUpWaiting => "gave up waiting for a connection".to_string(),
            Self::CacheClosed => "connection cache closed".to_string(),
        }
    }
}

/// What [`apply`] did to the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Delivered,
    Frozen,
    Scheduled(SystemTime),
}

/// Apply one outcome to the record: partition rejected recipients, pick the
/// next status per the table above, and append the attempt (newest first)
/// when it failed.
///
/// Pure over the record value; persistence is the caller's job.
pub fn apply(record: &mut MessageRecord, outcome: &SendOutcome, now: SystemTime) -> Applied {
    match outcome {
        SendOutcome::Accepted {
            rejected_recipients,
        } => {
            fail_permanently_rejected(record, rejected_recipients);
            // Whatever was not rejected has been delivered.
            record.remaining_recipients.clear();
            record.status = Status::Delivered;
            Applied::Delivered
        }
        SendOutcome::EnvelopeRejected {
            reply,
            rejected_recipients,
        } => {
            fail_permanently_rejected(record, rejected_recipients);
            if reply.is_permanent() {
                freeze(record, outcome, now)
            } else {
                defer(record, outcome, now)
            }
        }
        SendOutcome::AllRecipientsRejected {
            rejected_recipients,
        } => {
            fail_permanently_rejected(record, rejected_recipients);
            defer(record, outcome, now)
        }
        SendOutcome::Unreachable { .. } | SendOutcome::GaveUpWaiting | SendOutcome::CacheClosed => {
            defer(record, outcome, now)
        }
    }
}

/// Move permanently rejected recipients from `remaining` to `failed`;
/// transient rejects stay remaining for the next attempt.
fn fail_permanently_rejected(record: &mut MessageRecord, rejected: &[RejectedRecipient]) {
    for rejection in rejected {
        if !rejection.reply.is_permanent() {
            continue;
        }
        record
            .remaining_recipients
            .retain(|r| *r != rejection.recipient);
        if !record.failed_recipients.contains(&rejection.recipient) {
            record.failed_recipients.push(rejection.recipient.clone());
        }
    }
}

/// Temporary-failure path: consume the head retry interval, or freeze when
/// the schedule (or the recipient set) is exhausted.
fn defer(record: &mut MessageRecord, outcome: &SendOutcome, now: SystemTime) -> Applied {
    if record.remaining_recipients.is_empty() || record.retry_intervals.is_empty() {
        return freeze(record, outcome, now);
    }
    let interval = record.retry_intervals.remove(0);
    record.record_attempt(now, outcome.describe());
    let at = now + interval;
    record.status = Status::SendAt(at);
    Applied::Scheduled(at)
}

fn freeze(record: &mut MessageRecord, outcome: &SendOutcome, now: SystemTime) -> Applied {
    record.record_attempt(now, outcome.describe());
    record.status = Status::Frozen;
    Applied::Frozen
}
