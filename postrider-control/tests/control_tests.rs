//! Control surface operations over a real on-disk spool.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use postrider_common::{EmailAddress, Envelope, Flows, IdSource, MessageId};
use postrider_control::{Controller, RecoverFrom, Request, Response};
use postrider_delivery::CacheControl;
use postrider_spool::{Disposition, Queue, Routing, Spool, SpoolConfig, Status};
use tempfile::TempDir;

const GIVE_UP: Duration = Duration::from_secs(5);

struct StubCache {
    jobs: AtomicUsize,
}

impl CacheControl for StubCache {
    fn set_max_concurrent_send_jobs(&self, n: usize) {
        self.jobs.store(n, Ordering::SeqCst);
    }

    fn max_concurrent_send_jobs(&self) -> usize {
        self.jobs.load(Ordering::SeqCst)
    }
}

fn addr(s: &str) -> EmailAddress {
    EmailAddress::parse(s).unwrap()
}

async fn setup(dir: &TempDir) -> (Arc<Spool>, Controller, Arc<StubCache>) {
    let spool = Spool::open(SpoolConfig::new(dir.path()), IdSource::new())
        .await
        .expect("Failed to open spool");
    let cache = Arc::new(StubCache {
        jobs: AtomicUsize::new(10),
    });
    let controller = Controller::new(spool.clone(), cache.clone());
    (spool, controller, cache)
}

async fn spool_message(spool: &Spool, intervals: Vec<Duration>) -> MessageId {
    let envelope = Envelope::new(addr("a@x.com"), vec![addr("b@y.com")]);
    let routing = Routing {
        recipients: envelope.recipients.clone(),
        next_hop_choices: vec!["y.com:25".parse().unwrap()],
        retry_intervals: intervals,
    };
    spool
        .accept(&envelope, b"body", &[routing], &Flows::none())
        .await
        .unwrap()
        .remove(0)
}

async fn status_of(spool: &Spool, id: &MessageId) -> Status {
    let entry = spool.find(id).await.unwrap().expect("entry should exist");
    spool
        .with_entry(&entry, GIVE_UP, |record| {
            (Disposition::Keep, record.status)
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn freeze_moves_the_entry_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (spool, controller, _) = setup(&dir).await;
    let id = spool_message(&spool, vec![]).await;

    let response = controller
        .handle(Request::Freeze {
            ids: vec![id.clone()],
        })
        .await;
    assert!(matches!(response, Response::Ok));
    assert_eq!(status_of(&spool, &id).await, Status::Frozen);
    assert_eq!(spool.list(Queue::Frozen).await.unwrap().len(), 1);

    // Freezing an already frozen entry succeeds as a no-op.
    let response = controller
        .handle(Request::Freeze {
            ids: vec![id.clone()],
        })
        .await;
    assert!(matches!(response, Response::Ok));
    assert_eq!(status_of(&spool, &id).await, Status::Frozen);
}

#[tokio::test]
async fn send_unfreezes_and_prepends_intervals() {
    let dir = TempDir::new().unwrap();
    let (spool, controller, _) = setup(&dir).await;
    let id = spool_message(&spool, vec![Duration::from_secs(300)]).await;

    controller
        .handle(Request::Freeze {
            ids: vec![id.clone()],
        })
        .await;

    let response = controller
        .handle(Request::Send {
            retry_intervals: vec![Duration::from_secs(30)],
            ids: vec![id.clone()],
        })
        .await;
    assert!(matches!(response, Response::Ok));

    let entry = spool.find(&id).await.unwrap().unwrap();
    assert_eq!(entry.queue(), Queue::Active);
    let (status, intervals) = spool
        .with_entry(&entry, GIVE_UP, |record| {
            (
                Disposition::Keep,
                (record.status.clone(), record.retry_intervals.clone()),
            )
        })
        .await
        .unwrap();
    assert_eq!(status, Status::SendNow);
    assert_eq!(
        intervals,
        vec![Duration::from_secs(30), Duration::from_secs(300)]
    );
}

#[tokio::test]
async fn remove_tombstones_and_recover_restores_to_frozen() {
    let dir = TempDir::new().unwrap();
    let (spool, controller, _) = setup(&dir).await;
    let id = spool_message(&spool, vec![]).await;

    let response = controller
        .handle(Request::Remove {
            ids: vec![id.clone()],
        })
        .await;
    assert!(matches!(response, Response::Ok));
    assert_eq!(status_of(&spool, &id).await, Status::Removed);
    // Tombstones stay on disk.
    assert_eq!(spool.list(Queue::Removed).await.unwrap().len(), 1);

    let response = controller
        .handle(Request::Recover {
            from: RecoverFrom::Removed,
            ids: vec![id.clone()],
        })
        .await;
    assert!(matches!(response, Response::Ok));
    assert_eq!(status_of(&spool, &id).await, Status::Frozen);
}

#[tokio::test]
async fn recover_from_quarantine() {
    let dir = TempDir::new().unwrap();
    let (spool, controller, _) = setup(&dir).await;

    let envelope = Envelope::new(addr("a@x.com"), vec![addr("b@y.com")]);
    let id = spool
        .quarantine(&envelope, b"body", "malformed", &Flows::none())
        .await
        .unwrap();

    let response = controller
        .handle(Request::Recover {
            from: RecoverFrom::Quarantine,
            ids: vec![id.clone()],
        })
        .await;
    assert!(matches!(response, Response::Ok));
    assert_eq!(status_of(&spool, &id).await, Status::Frozen);

    // Recovering from the wrong source queue is a no-op.
    let response = controller
        .handle(Request::Recover {
            from: RecoverFrom::Quarantine,
            ids: vec![id.clone()],
        })
        .await;
    assert!(matches!(response, Response::Ok));
    assert_eq!(status_of(&spool, &id).await, Status::Frozen);
}

#[tokio::test]
async fn unknown_ids_are_reported_but_do_not_abort_the_batch() {
    let dir = TempDir::new().unwrap();
    let (spool, controller, _) = setup(&dir).await;
    let known = spool_message(&spool, vec![]).await;
    let unknown: MessageId = {
        // A valid id that was never spooled here.
        let ids = IdSource::new();
        let envelope = ids.next_envelope_id().await;
        ids.next_message_id(&envelope)
    };

    let response = controller
        .handle(Request::Freeze {
            ids: vec![unknown.clone(), known.clone()],
        })
        .await;
    match response {
        Response::Error(message) => {
            assert!(message.contains(unknown.as_str()));
            assert!(message.contains("not found"));
        }
        other => panic!("expected Error, got {other:?}"),
    }
    // The known id was still frozen.
    assert_eq!(status_of(&spool, &known).await, Status::Frozen);
}

#[tokio::test]
async fn status_reports_queue_sizes_and_oldest_age() {
    let dir = TempDir::new().unwrap();
    let (spool, controller, _) = setup(&dir).await;

    let first = spool_message(&spool, vec![]).await;
    let _second = spool_message(&spool, vec![]).await;
    controller
        .handle(Request::Freeze { ids: vec![first] })
        .await;

    let response = controller.handle(Request::Status).await;
    let Response::Status(status) = response else {
        panic!("expected Status response");
    };

    assert_eq!(status.queues["active"].len, 1);
    assert_eq!(status.queues["frozen"].len, 1);
    assert_eq!(status.queues["removed"].len, 0);
    assert_eq!(status.queues["quarantine"].len, 0);
    assert!(status.queues["active"].oldest_age_secs.is_some());
    assert!(status.queues["removed"].oldest_age_secs.is_none());
}

#[tokio::test]
async fn set_max_concurrent_send_jobs_resizes_the_cache() {
    let dir = TempDir::new().unwrap();
    let (_spool, controller, cache) = setup(&dir).await;

    let response = controller
        .handle(Request::SetMaxConcurrentSendJobs { n: 32 })
        .await;
    assert!(matches!(response, Response::Ok));
    assert_eq!(cache.max_concurrent_send_jobs(), 32);
}

#[tokio::test]
async fn events_stream_observes_control_actions() {
    let dir = TempDir::new().unwrap();
    let (spool, controller, _) = setup(&dir).await;
    let mut events = controller.events();

    let id = spool_message(&spool, vec![]).await;
    controller
        .handle(Request::Freeze {
            ids: vec![id.clone()],
        })
        .await;

    assert_eq!(
        events.next().await,
        Some(postrider_spool::SpoolEvent::Spooled(id.clone()))
    );
    assert_eq!(
        events.next().await,
        Some(postrider_spool::SpoolEvent::Frozen(id))
    );
}

#[tokio::test]
async fn freeze_then_send_leaves_the_schedule_intact() {
    // Freezing and releasing with no extra intervals must not add attempts
    // to the schedule.
    let dir = TempDir::new().unwrap();
    let (spool, controller, _) = setup(&dir).await;
    let id = spool_message(&spool, vec![Duration::from_secs(60)]).await;

    controller
        .handle(Request::Freeze {
            ids: vec![id.clone()],
        })
        .await;
    controller
        .handle(Request::Send {
            retry_intervals: vec![],
            ids: vec![id.clone()],
        })
        .await;

    let entry = spool.find(&id).await.unwrap().unwrap();
    assert_eq!(entry.queue(), Queue::Active);
    let intervals = spool
        .with_entry(&entry, GIVE_UP, |record| {
            (Disposition::Keep, record.retry_intervals)
        })
        .await
        .unwrap();
    assert_eq!(intervals, vec![Duration::from_secs(60)]);
}
