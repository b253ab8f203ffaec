//! Broadcast of spool lifecycle events to operator subscribers.

use std::time::Duration;

use postrider_common::{EmailAddress, MessageId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default bound on each subscriber's backlog before it starts dropping.
const DEFAULT_CAPACITY: usize = 1024;

/// How often the bus emits a heartbeat so dead subscriptions get noticed.
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);

/// A spool lifecycle event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpoolEvent {
    Spooled(MessageId),
    SendingStarted(MessageId),
    SendAttemptFailed { id: MessageId, error: String },
    /// The record is unlinked by the time this fires, so it carries the
    /// recipients that were permanently failed along the way.
    Delivered {
        id: MessageId,
        failed_recipients: Vec<EmailAddress>,
    },
    Frozen(MessageId),
    Removed(MessageId),
    RecipientsUpdated(MessageId),
    /// Periodic liveness marker.
    Heartbeat,
    /// Synthesized in a slow subscriber's stream in place of the `count`
    /// events it missed. Producers never block.
    Dropped { count: u64 },
}

impl SpoolEvent {
    pub const fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Spooled(id)
            | Self::SendingStarted(id)
            | Self::Frozen(id)
            | Self::Removed(id)
            | Self::RecipientsUpdated(id)
            | Self::Delivered { id, .. }
            | Self::SendAttemptFailed { id, .. } => Some(id),
            Self::Heartbeat | Self::Dropped { .. } => None,
        }
    }
}

/// Multi-producer, multi-subscriber event fan-out.
///
/// Events for a single message id are published in lifecycle order from
/// under that entry's exclusive lock, so every subscriber that keeps up
/// observes them in order.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SpoolEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Never blocks; having no subscribers is fine.
    pub fn publish(&self, event: SpoolEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    /// Emit [`SpoolEvent::Heartbeat`] every 10 seconds, forever.
    ///
    /// [`crate::Spool::open`] spawns this on its bus and aborts the task
    /// when the spool is dropped.
    pub async fn heartbeat(&self) {
        let mut timer = tokio::time::interval(HEARTBEAT_PERIOD);
        timer.tick().await;
        loop {
            timer.tick().await;
            self.publish(SpoolEvent::Heartbeat);
        }
    }
}

/// A subscriber's lazy view of the event sequence.
pub struct EventStream {
    rx: broadcast::Receiver<SpoolEvent>,
}

impl EventStream {
    /// The next event, or `None` once the bus is gone.
    ///
    /// A backlog overflow surfaces as one [`SpoolEvent::Dropped`] record
    /// carrying the number of missed events.
    pub async fn next(&mut self) -> Option<SpoolEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                Some(SpoolEvent::Dropped { count })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use postrider_common::IdSource;

    use super::*;

    async fn test_id() -> MessageId {
        let ids = IdSource::new();
        let envelope = ids.next_envelope_id().await;
        ids.next_message_id(&envelope)
    }

    #[tokio::test]
    async fn subscribers_see_events_in_publish_order() {
        let bus = EventBus::default();
        let mut stream = bus.subscribe();
        let id = test_id().await;

        bus.publish(SpoolEvent::Spooled(id.clone()));
        bus.publish(SpoolEvent::SendingStarted(id.clone()));
        bus.publish(SpoolEvent::Delivered {
            id: id.clone(),
            failed_recipients: Vec::new(),
        });

        assert_eq!(stream.next().await, Some(SpoolEvent::Spooled(id.clone())));
        assert_eq!(
            stream.next().await,
            Some(SpoolEvent::SendingStarted(id.clone()))
        );
        assert_eq!(
            stream.next().await,
            Some(SpoolEvent::Delivered {
                id,
                failed_recipients: Vec::new(),
            })
        );
    }

    #[tokio::test]
    async fn slow_subscriber_gets_a_single_dropped_record() {
        let bus = EventBus::new(2);
        let mut stream = bus.subscribe();
        let id = test_id().await;

        for _ in 0..5 {
            bus.publish(SpoolEvent::Spooled(id.clone()));
        }

        // Three events were pushed out of the backlog of two.
        assert_eq!(stream.next().await, Some(SpoolEvent::Dropped { count: 3 }));
        assert_eq!(stream.next().await, Some(SpoolEvent::Spooled(id.clone())));
        assert_eq!(stream.next().await, Some(SpoolEvent::Spooled(id)));
    }

    #[tokio::test]
    async fn stream_ends_when_the_bus_is_dropped() {
        let bus = EventBus::default();
        let mut stream = bus.subscribe();
        drop(bus);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::default();
        bus.publish(SpoolEvent::Heartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_fires_every_ten_seconds() {
        let bus = EventBus::default();
        let mut stream = bus.subscribe();

        let task = tokio::spawn({
            let bus = bus.clone();
            async move { bus.heartbeat().await }
        });

        // The paused clock advances to each 10 s tick as the test awaits.
        assert_eq!(stream.next().await, Some(SpoolEvent::Heartbeat));
        assert_eq!(stream.next().await, Some(SpoolEvent::Heartbeat));
        task.abort();
    }
}
