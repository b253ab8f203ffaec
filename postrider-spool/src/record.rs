//! The per-message metadata record and its disk-consistency helpers.

use std::{
    path::PathBuf,
    time::{Duration, SystemTime},
};

use postrider_common::{EmailAddress, Envelope, EnvelopeId, Flows, MessageId, NextHop};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SpoolError},
    events::SpoolEvent,
    spool::{Disposition, Entry, Routing, Spool},
    types::{Queue, Status},
};

/// How long record-level mutators wait on the entry lock.
const MUTATE_GIVE_UP: Duration = Duration::from_secs(5);

/// One failed relay attempt, newest kept first on the record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAttempt {
    pub at: SystemTime,
    pub error: String,
}

/// Everything the relay knows about one spooled message, apart from the raw
/// body bytes that live in the sibling `.body` file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub parent_envelope_id: EnvelopeId,
    /// Spool root this record was written under.
    pub spool_dir: PathBuf,
    pub spool_date: SystemTime,
    /// Downstream servers to try, in order.
    pub next_hop_choices: Vec<NextHop>,
    /// FIFO: the head is the wait applied after the next failed attempt.
    pub retry_intervals: Vec<Duration>,
    pub remaining_recipients: Vec<EmailAddress>,
    pub failed_recipients: Vec<EmailAddress>,
    /// Newest first.
    pub relay_attempts: Vec<RelayAttempt>,
    pub status: Status,
    pub flows: Flows,
    /// The envelope as accepted at ingress.
    pub envelope_info: Envelope,
}

impl MessageRecord {
    pub fn new(
        id: MessageId,
        parent_envelope_id: EnvelopeId,
        spool_dir: PathBuf,
        routing: &Routing,
        envelope_info: Envelope,
        flows: Flows,
    ) -> Self {
        Self {
            id,
            parent_envelope_id,
            spool_dir,
            spool_date: SystemTime::now(),
            next_hop_choices: routing.next_hop_choices.clone(),
            retry_intervals: routing.retry_intervals.clone(),
            remaining_recipients: routing.recipients.clone(),
            failed_recipients: Vec::new(),
            relay_attempts: Vec::new(),
            status: Status::SendNow,
            flows,
            envelope_info,
        }
    }

    /// The queue this record belongs in; `None` once delivered.
    pub const fn queue(&self) -> Option<Queue> {
        Queue::of_status(&self.status)
    }

    /// The record's on-disk location, assuming it has a queue.
    pub fn entry(&self) -> Result<Entry> {
        self.queue()
            .map(|queue| Entry::new(self.id.clone(), queue))
            .ok_or_else(|| SpoolError::NotFound(self.id.clone()))
    }

    /// Record a failed attempt, newest first.
    pub fn record_attempt(&mut self, at: SystemTime, error: impl Into<String>) {
        self.relay_attempts.insert(
            0,
            RelayAttempt {
                at,
                error: error.into(),
            },
        );
    }

    /// remaining and failed recipient sets never overlap.
    pub fn recipients_disjoint(&self) -> bool {
        !self
            .remaining_recipients
            .iter()
            .any(|r| self.failed_recipients.contains(r))
    }

    /// # Errors
    /// If the record cannot be encoded.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// # Errors
    /// If the bytes are not a valid record.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Mutate this record under its entry lock and persist the result.
    ///
    /// The on-disk record is compared against `self` after the lock is
    /// acquired; a mismatch fails with [`SpoolError::DiskDivergence`] and
    /// leaves the disk untouched, so a stale in-memory copy can never
    /// clobber a newer record. On success `self` is the persisted record
    /// (moved between queues, or unlinked when the new status is
    /// [`Status::Delivered`]).
    ///
    /// Returns whether the mutation changed the record; an unchanged record
    /// is a successful no-op, which is what makes the control operations
    /// idempotent.
    ///
    /// # Errors
    /// `Locked`, `DiskDivergence`, or `IoError`.
    pub async fn with_file<F>(&mut self, spool: &Spool, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Self) + Send,
    {
        let entry = self.entry()?;
        let snapshot = self.clone();

        let saved: Result<Self> = spool
            .with_entry(&entry, MUTATE_GIVE_UP, move |disk| {
                if disk != snapshot {
                    let id = snapshot.id.clone();
                    return (Disposition::Keep, Err(SpoolError::DiskDivergence(id)));
                }
                let mut record = disk;
                f(&mut record);
                debug_assert!(record.recipients_disjoint());
                if record == snapshot {
                    (Disposition::Keep, Ok(record))
                } else {
                    (Disposition::Save(record.clone()), Ok(record))
                }
            })
            .await?;

        let saved = saved?;
        let changed = saved != *self;
        *self = saved;
        Ok(changed)
    }

    /// Hold this message until an operator intervenes.
    ///
    /// # Errors
    /// `Locked`, `DiskDivergence`, or `IoError`.
    pub async fn freeze(&mut self, spool: &Spool) -> Result<()> {
        let changed = self
            .with_file(spool, |record| record.status = Status::Frozen)
            .await?;
        if changed {
            spool.events().publish(SpoolEvent::Frozen(self.id.clone()));
        }
        Ok(())
    }

    /// Make this message eligible immediately, optionally prepending extra
    /// retry intervals for the attempts that follow.
    ///
    /// # Errors
    /// `Locked`, `DiskDivergence`, or `IoError`.
    pub async fn mark_for_send_now(
        &mut self,
        spool: &Spool,
        extra_intervals: Vec<Duration>,
    ) -> Result<()> {
        self.with_file(spool, |record| {
            record.retry_intervals.splice(0..0, extra_intervals);
            record.status = Status::SendNow;
        })
        .await?;
        Ok(())
    }

    /// Tombstone this message. The entry stays on disk for audit.
    ///
    /// # Errors
    /// `Locked`, `DiskDivergence`, or `IoError`.
    pub async fn remove(&mut self, spool: &Spool) -> Result<()> {
        let changed = self
            .with_file(spool, |record| record.status = Status::Removed)
            .await?;
        if changed {
            spool.events().publish(SpoolEvent::Removed(self.id.clone()));
        }
        Ok(())
    }

    /// Rewrite every recipient address through `f`, e.g. for a domain
    /// migration.
    ///
    /// # Errors
    /// `Locked`, `DiskDivergence`, or `IoError`.
    pub async fn map_recipients<F>(&mut self, spool: &Spool, f: F) -> Result<()>
    where
        F: Fn(&EmailAddress) -> EmailAddress + Send + Sync,
    {
        let changed = self
            .with_file(spool, |record| {
                record.remaining_recipients =
                    record.remaining_recipients.iter().map(&f).collect();
                record.failed_recipients = record.failed_recipients.iter().map(&f).collect();
                record.envelope_info.recipients =
                    record.envelope_info.recipients.iter().map(&f).collect();
            })
            .await?;
        if changed {
            spool
                .events()
                .publish(SpoolEvent::RecipientsUpdated(self.id.clone()));
        }
        Ok(())
    }
}
