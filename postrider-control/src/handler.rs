//! Dispatch of control requests over the spool and client cache.

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use postrider_common::MessageId;
use postrider_delivery::CacheControl;
use postrider_spool::{
    Disposition, EventStream, MessageRecord, Queue, Spool, SpoolError, SpoolEvent, Status,
};

use crate::protocol::{QueueStatus, RecoverFrom, Request, Response, SpoolStatus};

/// Operators are interactive; don't let one wedged entry hang the surface.
const CONTROL_GIVE_UP: Duration = Duration::from_secs(5);

/// The control surface over a running relay.
///
/// Every per-id operation is idempotent: an entry already in the target
/// state is a successful no-op.
pub struct Controller {
    spool: Arc<Spool>,
    cache: Arc<dyn CacheControl>,
}

impl Controller {
    pub fn new(spool: Arc<Spool>, cache: Arc<dyn CacheControl>) -> Self {
        Self { spool, cache }
    }

    /// Handle one request. Per-id failures are collected; the operation
    /// continues over the remaining ids.
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Status => match self.status().await {
                Ok(status) => Response::Status(status),
                Err(e) => Response::error(e.to_string()),
            },
            Request::Freeze { ids } => self.for_each(&ids, |id| self.freeze(id)).await,
            Request::Send {
                retry_intervals,
                ids,
            } => {
                self.for_each(&ids, |id| self.send(id, retry_intervals.clone()))
                    .await
            }
            Request::Remove { ids } => self.for_each(&ids, |id| self.remove(id)).await,
            Request::Recover { from, ids } => {
                self.for_each(&ids, |id| self.recover(id, from)).await
            }
            Request::SetMaxConcurrentSendJobs { n } => {
                self.cache.set_max_concurrent_send_jobs(n);
                Response::Ok
            }
        }
    }

    /// Subscribe to the live spool event stream.
    pub fn events(&self) -> EventStream {
        self.spool.events().subscribe()
    }

    /// Queue sizes and oldest-entry ages.
    ///
    /// # Errors
    /// If a queue directory cannot be listed.
    pub async fn status(&self) -> Result<SpoolStatus, SpoolError> {
        let now_ms = u64::try_from(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
        )
        .unwrap_or(u64::MAX);

        let mut status = SpoolStatus::default();
        for queue in Queue::ALL {
            let entries = self.spool.list(queue).await?;
            // Entries are oldest first; ids carry their spool date.
            let oldest_age_secs = entries
                .first()
                .map(|entry| now_ms.saturating_sub(entry.id().sort_key().0) / 1_000);
            status.queues.insert(
                queue.dir_name().to_string(),
                QueueStatus {
                    len: entries.len(),
                    oldest_age_secs,
                },
            );
        }
        Ok(status)
    }

    async fn for_each<'a, F, Fut>(&self, ids: &'a [MessageId], op: F) -> Response
    where
        F: Fn(&'a MessageId) -> Fut,
        Fut: Future<Output = Result<(), SpoolError>>,
    {
        let mut failures = Vec::new();
        for id in ids {
            if let Err(e) = op(id).await {
                failures.push(format!("{id}: {e}"));
            }
        }
        if failures.is_empty() {
            Response::Ok
        } else {
            Response::error(failures.join("; "))
        }
    }

    async fn freeze(&self, id: &MessageId) -> Result<(), SpoolError> {
        let changed = self
            .mutate(id, |record| record.status = Status::Frozen)
            .await?;
        if changed {
            self.spool.events().publish(SpoolEvent::Frozen(id.clone()));
        }
        Ok(())
    }

    async fn send(&self, id: &MessageId, retry_intervals: Vec<Duration>) -> Result<(), SpoolError> {
        self.mutate(id, move |record| {
            record.retry_intervals.splice(0..0, retry_intervals);
            record.status = Status::SendNow;
        })
        .await?;
        Ok(())
    }

    async fn remove(&self, id: &MessageId) -> Result<(), SpoolError> {
        let changed = self
            .mutate(id, |record| record.status = Status::Removed)
            .await?;
        if changed {
            self.spool.events().publish(SpoolEvent::Removed(id.clone()));
        }
        Ok(())
    }

    async fn recover(&self, id: &MessageId, from: RecoverFrom) -> Result<(), SpoolError> {
        let source = match from {
            RecoverFrom::Removed => Queue::Removed,
            RecoverFrom::Quarantine => Queue::Quarantine,
        };
        let changed = self
            .mutate(id, move |record| {
                if record.queue() == Some(source) {
                    record.status = Status::Frozen;
                }
            })
            .await?;
        if changed {
            self.spool.events().publish(SpoolEvent::Frozen(id.clone()));
        }
        Ok(())
    }

    /// Locate the entry for `id`, apply `f` under its lock, and persist if
    /// anything changed. Returns whether it did.
    async fn mutate<F>(&self, id: &MessageId, f: F) -> Result<bool, SpoolError>
    where
        F: FnOnce(&mut MessageRecord) + Send,
    {
        let entry = self
            .spool
            .find(id)
            .await?
            .ok_or_else(|| SpoolError::NotFound(id.clone()))?;

        self.spool
            .with_entry(&entry, CONTROL_GIVE_UP, move |record| {
                let mut updated = record.clone();
                f(&mut updated);
                if updated == record {
                    (Disposition::Keep, false)
                } else {
                    (Disposition::Save(updated), true)
                }
            })
            .await
    }
}
