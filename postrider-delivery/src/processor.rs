//! The delivery loop: dequeue eligible entries, attempt delivery through
//! the client cache, and apply the scheduler's decision.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use postrider_common::{MessageId, Signal, SmtpClient, delivery, internal};
use postrider_spool::{
    Disposition, Entry, MessageRecord, Queue, Spool, SpoolError, SpoolEvent, Status,
};
use tokio::{sync::broadcast, task::JoinSet};

use crate::{
    cache::{CacheControl, ClientCache, ConnectionOutcome, Connector},
    config::DeliveryConfig,
    error::DeliveryError,
    scheduler::{self, SendOutcome},
};

/// Contended entries are someone else's problem this tick.
const CLAIM_GIVE_UP: Duration = Duration::from_millis(500);

enum Claim {
    /// The entry was transitioned to `Sending` and is ours to attempt.
    Sending(Box<MessageRecord>),
    /// The entry had no remaining recipients; it was frozen instead.
    FrozenEmpty(MessageId),
    /// Not eligible right now.
    Skip,
}

/// Drives redelivery of everything in the `Active` queue.
///
/// Entries are considered oldest first. The loop's concurrency is governed
/// entirely by the cache: each in-flight delivery holds one of its
/// `max_concurrent_send_jobs` sessions.
pub struct DeliveryProcessor<N: Connector> {
    spool: Arc<Spool>,
    cache: Arc<ClientCache<N>>,
    config: DeliveryConfig,
}

impl<N> DeliveryProcessor<N>
where
    N: Connector + 'static,
    N::Client: 'static,
{
    pub fn new(spool: Arc<Spool>, cache: Arc<ClientCache<N>>, config: DeliveryConfig) -> Self {
        Self {
            spool,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<ClientCache<N>> {
        &self.cache
    }

    /// Run until shutdown: sweep the active queue on every tick and on
    /// event-bus wakeups for freshly spooled work.
    ///
    /// Shutdown lets the sweep in progress finish its held entries, then
    /// closes the cache; entries left `Sending` by a harder stop are reset
    /// by recovery on the next boot.
    ///
    /// # Errors
    /// Only on fatal spool failures; per-entry errors are logged and
    /// skipped.
    pub async fn serve(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        internal!("Delivery processor starting");

        let mut events = self.spool.events().subscribe();
        let mut tick = tokio::time::interval(self.config.tick());

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = process_queue(&self).await {
                        tracing::error!(target: "postrider", error = %e, "Queue sweep failed");
                    }
                }
                event = events.next() => {
                    if matches!(
                        event,
                        Some(SpoolEvent::Spooled(_) | SpoolEvent::RecipientsUpdated(_))
                    ) {
                        if let Err(e) = process_queue(&self).await {
                            tracing::error!(target: "postrider", error = %e, "Queue sweep failed");
                        }
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "Delivery processor received shutdown signal");
                        }
                        Err(e) => {
                            tracing::error!(target: "postrider", error = %e, "Shutdown channel error");
                        }
                    }
                    break;
                }
            }
        }

        self.cache.close().await;
        internal!(level = INFO, "Delivery processor shutdown complete");
        Ok(())
    }

    /// Attempt delivery of a record already persisted as `Sending`.
    async fn attempt(&self, mut record: MessageRecord) {
        let outcome = self.send(&record).await;

        let now = SystemTime::now();
        let failure = match &outcome {
            SendOutcome::Accepted { .. } => None,
            other => Some(other.describe()),
        };

        let applied = record
            .with_file(&self.spool, |r| {
                let _ = scheduler::apply(r, &outcome, now);
            })
            .await;

        match applied {
            Ok(_) => {
                let id = record.id.clone();
                if let Some(error) = failure {
                    delivery!(
                        level = DEBUG,
                        "Attempt for {id} failed ({error}), now {:?}",
                        record.status
                    );
                    self.spool
                        .events()
                        .publish(SpoolEvent::SendAttemptFailed {
                            id: id.clone(),
                            error,
                        });
                }
                match record.status {
                    Status::Delivered => {
                        self.spool.events().publish(SpoolEvent::Delivered {
                            id,
                            failed_recipients: record.failed_recipients.clone(),
                        });
                    }
                    Status::Frozen => {
                        self.spool.events().publish(SpoolEvent::Frozen(id));
                    }
                    _ => {}
                }
            }
            Err(SpoolError::DiskDivergence(id)) => {
                // An operator mutated the entry mid-flight; their version
                // wins and this attempt's outcome is dropped.
                tracing::warn!(target: "postrider", id = %id, "Record changed during delivery, outcome discarded");
            }
            Err(e) => {
                tracing::warn!(target: "postrider", id = %record.id, error = %e, "Failed to persist delivery outcome");
            }
        }
    }

    async fn send(&self, record: &MessageRecord) -> SendOutcome {
        let entry = match record.entry() {
            Ok(entry) => entry,
            Err(e) => {
                return SendOutcome::Unreachable {
                    error: format!("entry unavailable: {e}"),
                };
            }
        };

        let body: Arc<[u8]> = match self.spool.read_body(&entry).await {
            Ok(body) => body.into(),
            Err(e) => {
                return SendOutcome::Unreachable {
                    error: format!("body unavailable: {e}"),
                };
            }
        };

        let envelope = record
            .envelope_info
            .with_recipients(record.remaining_recipients.clone());
        let flows = record.flows.clone();

        let conn = self
            .cache
            .with_connection(
                &record.next_hop_choices,
                self.config.give_up(),
                move |client| {
                    Box::pin(async move { client.send_envelope(&envelope, body, &flows).await })
                },
            )
            .await;

        match conn {
            ConnectionOutcome::Ok(_, Ok(status)) => SendOutcome::from_status(status),
            ConnectionOutcome::Ok(hop, Err(e)) => SendOutcome::Unreachable {
                error: format!("{hop}: {e}"),
            },
            ConnectionOutcome::ErrorOpeningResource(hop, e) => SendOutcome::Unreachable {
                error: format!("{hop}: {e}"),
            },
            ConnectionOutcome::GaveUpWaiting => SendOutcome::GaveUpWaiting,
            ConnectionOutcome::CacheClosed => SendOutcome::CacheClosed,
        }
    }
}

/// One pass over the active queue, oldest entries first, fanned out up to
/// the cache budget.
///
/// # Errors
/// If the queue cannot be listed; per-entry failures are logged and the
/// entry is retried on the next tick.
pub async fn process_queue<N>(
    processor: &Arc<DeliveryProcessor<N>>,
) -> Result<(), DeliveryError>
where
    N: Connector + 'static,
    N::Client: 'static,
{
    let mut pending = processor.spool.list(Queue::Active).await?.into_iter();
    let mut workers: JoinSet<()> = JoinSet::new();

    for _ in 0..processor.cache.max_concurrent_send_jobs() {
        let Some(entry) = pending.next() else { break };
        let this = Arc::clone(processor);
        workers.spawn(async move { deliver_entry(this, entry).await });
    }

    while workers.join_next().await.is_some() {
        if let Some(entry) = pending.next() {
            let this = Arc::clone(processor);
            workers.spawn(async move { deliver_entry(this, entry).await });
        }
    }

    Ok(())
}

async fn deliver_entry<N>(processor: Arc<DeliveryProcessor<N>>, entry: Entry)
where
    N: Connector + 'static,
    N::Client: 'static,
{
    let now = SystemTime::now();
    let claimed = processor
        .spool
        .with_entry(&entry, CLAIM_GIVE_UP, move |mut record| {
            match record.status.effective(now) {
                Status::SendNow if record.remaining_recipients.is_empty() => {
                    // Nothing left to deliver to; never enters Sending.
                    record.status = Status::Frozen;
                    let id = record.id.clone();
                    (Disposition::Save(record), Claim::FrozenEmpty(id))
                }
                Status::SendNow => {
                    record.status = Status::Sending;
                    (
                        Disposition::Save(record.clone()),
                        Claim::Sending(Box::new(record)),
                    )
                }
                _ => (Disposition::Keep, Claim::Skip),
            }
        })
        .await;

    match claimed {
        Ok(Claim::Skip) => {}
        Ok(Claim::FrozenEmpty(id)) => {
            processor.spool.events().publish(SpoolEvent::Frozen(id));
        }
        Ok(Claim::Sending(record)) => {
            processor
                .spool
                .events()
                .publish(SpoolEvent::SendingStarted(record.id.clone()));
            processor.attempt(*record).await;
        }
        Err(SpoolError::Locked(id)) => {
            delivery!(level = DEBUG, "Entry {id} is locked, retrying next tick");
        }
        Err(SpoolError::NotFound(_)) => {}
        Err(e) => {
            tracing::warn!(target: "postrider", error = %e, id = %entry.id(), "Failed to claim entry");
        }
    }
}
