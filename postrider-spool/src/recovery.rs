//! Startup reconciliation of interrupted deliveries.
//!
//! Any entry still `Sending` on disk was in flight when the previous
//! process stopped; the attempt is invalidated and the entry made eligible
//! again. Entries in other queues are untouched.

use std::time::Duration;

use crate::{
    error::{Result, SpoolError},
    spool::{Disposition, Spool},
    types::{Queue, Status},
};

/// Nothing else runs at startup, so the locks are uncontended; this bound
/// only guards against a wedged filesystem.
const RECOVERY_GIVE_UP: Duration = Duration::from_secs(30);

/// What startup recovery did.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryReport {
    /// Entries rewritten from `Sending` to `SendNow`.
    pub reset: usize,
    /// Active entries inspected.
    pub scanned: usize,
}

/// Rewrite every `Sending` entry in the `Active` queue to `SendNow`.
///
/// # Errors
/// `IoError`; an entry that vanished mid-scan is skipped.
pub async fn recover(spool: &Spool) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for entry in spool.list(Queue::Active).await? {
        report.scanned += 1;
        let reset = spool
            .with_entry(&entry, RECOVERY_GIVE_UP, |mut record| {
                if record.status == Status::Sending {
                    record.status = Status::SendNow;
                    (Disposition::Save(record), true)
                } else {
                    (Disposition::Keep, false)
                }
            })
            .await;
        match reset {
            Ok(true) => report.reset += 1,
            Ok(false) | Err(SpoolError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}
