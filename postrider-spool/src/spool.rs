//! The on-disk spool: four named queues of record/body file pairs under a
//! process-exclusive root.
//!
//! ```text
//! <root>/active/<id>          <root>/active/<id>.body
//! <root>/frozen/<id>          <root>/frozen/<id>.body
//! <root>/removed/<id>         <root>/removed/<id>.body
//! <root>/quarantine/<id>      <root>/quarantine/<id>.body
//! <root>/registry/<id>        # reservation marker, empty file
//! <root>/.lock                # process exclusivity
//! <root>/.tmp/                # staging area for atomic renames
//! ```

use std::{
    collections::HashMap,
    fmt,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use nix::fcntl::{Flock, FlockArg};
use postrider_common::{Envelope, EnvelopeId, Flows, IdSource, MessageId, internal};
use tokio::{io::AsyncWriteExt, sync::Semaphore};

use crate::{
    config::SpoolConfig,
    error::{Result, SpoolError},
    events::{EventBus, SpoolEvent},
    record::MessageRecord,
    recovery,
    types::{Queue, Status},
};

const REGISTRY_DIR: &str = "registry";
const TMP_DIR: &str = ".tmp";
const LOCK_FILE: &str = ".lock";
const BODY_SUFFIX: &str = "body";

/// A single on-disk record/body pair, addressed by id and current queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    id: MessageId,
    queue: Queue,
}

impl Entry {
    pub const fn new(id: MessageId, queue: Queue) -> Self {
        Self { id, queue }
    }

    pub const fn id(&self) -> &MessageId {
        &self.id
    }

    pub const fn queue(&self) -> Queue {
        self.queue
    }
}

/// Read-only metadata of an entry's record file.
#[derive(Clone, Copy, Debug)]
pub struct EntryStat {
    pub size: u64,
    pub mtime: SystemTime,
}

/// What `with_entry`'s mutation function decided about the record.
///
/// `Save` persists the record into the queue derived from its status;
/// saving a [`Status::Delivered`] record unlinks the entry instead, since
/// delivered messages have no queue.
#[derive(Debug)]
pub enum Disposition {
    Save(MessageRecord),
    Remove,
    Keep,
}

/// Per-recipient-group routing the front-end decided at ingress.
#[derive(Clone, Debug)]
pub struct Routing {
    pub recipients: Vec<postrider_common::EmailAddress>,
    pub next_hop_choices: Vec<postrider_common::NextHop>,
    pub retry_intervals: Vec<Duration>,
}

/// The durable message store. Process-exclusive; see [`Spool::open`].
pub struct Spool {
    root: PathBuf,
    ids: IdSource,
    events: EventBus,
    /// Process-wide bound on simultaneously open record/body files.
    throttle: Arc<Semaphore>,
    locks: StdMutex<HashMap<MessageId, Arc<tokio::sync::Mutex<()>>>>,
    tmp_seq: AtomicU64,
    reserve_attempts: u32,
    heartbeat: tokio::task::JoinHandle<()>,
    _lock: Flock<std::fs::File>,
}

impl Drop for Spool {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

impl fmt::Debug for Spool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spool").field("root", &self.root).finish()
    }
}

impl Spool {
    /// Open (creating if necessary) the spool at `config.path`, take the
    /// process-exclusivity lock, and reconcile entries left `Sending` by a
    /// prior shutdown.
    ///
    /// # Errors
    /// `SpoolBusy` if another process holds the lockfile, `CrossDevice` if
    /// any queue directory is on a different filesystem than the root, or
    /// `IoError`.
    pub async fn open(config: SpoolConfig, ids: IdSource) -> Result<Arc<Self>> {
        internal!("Initialising spool at {:?} ...", config.path);

        let root = config.path.clone();
        std::fs::create_dir_all(&root)?;
        let mut dirs = vec![root.join(REGISTRY_DIR), root.join(TMP_DIR)];
        for queue in Queue::ALL {
            dirs.push(root.join(queue.dir_name()));
        }
        for dir in &dirs {
            std::fs::create_dir_all(dir)?;
        }
        assert_same_device(&root, &dirs)?;

        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(root.join(LOCK_FILE))?;
        let lock = Flock::lock(lock_file, FlockArg::LockExclusiveNonblock)
            .map_err(|_| SpoolError::SpoolBusy(root.clone()))?;
        let mut pid_writer: &std::fs::File = &lock;
        pid_writer.set_len(0)?;
        writeln!(pid_writer, "{}", std::process::id())?;

        let events = EventBus::new(config.event_capacity);
        let heartbeat = tokio::spawn({
            let events = events.clone();
            async move { events.heartbeat().await }
        });

        let spool = Arc::new(Self {
            root,
            ids,
            events,
            throttle: Arc::new(Semaphore::new(config.open_file_limit.max(1))),
            locks: StdMutex::new(HashMap::new()),
            tmp_seq: AtomicU64::new(0),
            reserve_attempts: config.reserve_attempts.max(1),
            heartbeat,
            _lock: lock,
        });

        let report = recovery::recover(&spool).await?;
        if report.reset > 0 {
            internal!(
                level = INFO,
                "Recovery reset {} entries from Sending to SendNow",
                report.reset
            );
        }

        Ok(spool)
    }

    pub const fn root(&self) -> &PathBuf {
        &self.root
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Accept one envelope: reserve a message id per routing group, write
    /// record and body, and publish `Spooled` for each.
    ///
    /// This is the sole ingress used by the SMTP front-end.
    ///
    /// # Errors
    /// `NameCollision` or `IoError`. Groups spooled before a failure stay
    /// spooled.
    pub async fn accept(
        &self,
        envelope: &Envelope,
        body: &[u8],
        routing: &[Routing],
        flows: &Flows,
    ) -> Result<Vec<MessageId>> {
        let envelope_id = self.ids.next_envelope_id().await;
        let mut spooled = Vec::with_capacity(routing.len());
        for group in routing {
            let id = self.reserve(&envelope_id).await?;
            let record = MessageRecord::new(
                id.clone(),
                envelope_id.clone(),
                self.root.clone(),
                group,
                envelope.with_recipients(group.recipients.clone()),
                flows.clone(),
            );
            self.enqueue(Queue::Active, &record, body).await?;
            spooled.push(id);
        }
        Ok(spooled)
    }

    /// Hold a malformed envelope aside, never to be delivered.
    ///
    /// # Errors
    /// `NameCollision` or `IoError`.
    pub async fn quarantine(
        &self,
        envelope: &Envelope,
        body: &[u8],
        reason: impl Into<String>,
        flows: &Flows,
    ) -> Result<MessageId> {
        let envelope_id = self.ids.next_envelope_id().await;
        let id = self.reserve(&envelope_id).await?;
        let routing = Routing {
            recipients: envelope.recipients.clone(),
            next_hop_choices: Vec::new(),
            retry_intervals: Vec::new(),
        };
        let mut record = MessageRecord::new(
            id.clone(),
            envelope_id,
            self.root.clone(),
            &routing,
            envelope.clone(),
            flows.clone(),
        );
        record.status = Status::Quarantined(reason.into());
        self.enqueue(Queue::Quarantine, &record, body).await?;
        Ok(id)
    }

    /// Atomically reserve a fresh unique message name under the envelope.
    ///
    /// # Errors
    /// `NameCollision` after bounded retries, or `IoError`.
    pub async fn reserve(&self, envelope: &EnvelopeId) -> Result<MessageId> {
        for _ in 0..self.reserve_attempts {
            let id = self.ids.next_message_id(envelope);
            let marker = self.root.join(REGISTRY_DIR).join(id.as_str());

            let _permit = self.open_file().await?;
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&marker)
                .await
            {
                Ok(file) => {
                    file.sync_all().await?;
                    return Ok(id);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(SpoolError::NameCollision {
            attempts: self.reserve_attempts,
        })
    }

    /// Write `<queue>/<id>` and `<queue>/<id>.body`, each through a fsynced
    /// temp-file-plus-rename, then consume the reservation. Any partial
    /// file is removed on failure.
    ///
    /// # Errors
    /// `IoError`.
    pub async fn enqueue(&self, queue: Queue, record: &MessageRecord, body: &[u8]) -> Result<Entry> {
        debug_assert_eq!(record.queue(), Some(queue));

        let entry = Entry::new(record.id.clone(), queue);
        let record_path = self.record_path(&entry);
        let body_path = self.body_path(&entry);

        let bytes = record.serialize()?;
        let written: Result<()> = async {
            self.write_atomic(&record_path, &bytes).await?;
            self.write_atomic(&body_path, body).await?;
            Ok(())
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&record_path).await;
            let _ = tokio::fs::remove_file(&body_path).await;
            return Err(e);
        }

        let marker = self.root.join(REGISTRY_DIR).join(record.id.as_str());
        let _ = tokio::fs::remove_file(marker).await;

        self.events.publish(SpoolEvent::Spooled(record.id.clone()));
        Ok(entry)
    }

    /// Snapshot of a queue's entries, oldest first (spool-date order).
    ///
    /// Not restartable across mutations: entries renamed or unlinked after
    /// the snapshot simply fail their later `with_entry` with `NotFound`.
    ///
    /// # Errors
    /// `IoError`.
    pub async fn list(&self, queue: Queue) -> Result<Vec<Entry>> {
        let dir = self.root.join(queue.dir_name());

        let _permit = self.open_file().await?;
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(dirent) = read_dir.next_entry().await? {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(&format!(".{BODY_SUFFIX}")) {
                continue;
            }
            match MessageId::from_filename(name) {
                Some(id) => entries.push(Entry::new(id, queue)),
                None => {
                    internal!(level = WARN, "Ignoring foreign file in {queue:?}: {name}");
                }
            }
        }

        entries.sort_by_key(|entry| entry.id.sort_key());
        Ok(entries)
    }

    /// Run `f` over the entry's record under its exclusive lock and apply
    /// the returned [`Disposition`]. The lock is released on every exit
    /// path.
    ///
    /// # Errors
    /// `Locked` if the lock is still contended when `give_up` elapses,
    /// `NotFound` if the entry vanished, or `IoError`.
    pub async fn with_entry<T, F>(&self, entry: &Entry, give_up: Duration, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(MessageRecord) -> (Disposition, T) + Send,
    {
        let lock = self.entry_lock(&entry.id);
        let Ok(guard) = tokio::time::timeout(give_up, lock.lock_owned()).await else {
            return Err(SpoolError::Locked(entry.id.clone()));
        };

        let result = self.with_entry_locked(entry, f).await;
        drop(guard);
        result
    }

    async fn with_entry_locked<T, F>(&self, entry: &Entry, f: F) -> Result<T>
    where
        F: FnOnce(MessageRecord) -> (Disposition, T) + Send,
    {
        let record = self.read_record(entry).await?;
        let (disposition, value) = f(record);

        match disposition {
            Disposition::Keep => {}
            Disposition::Remove => self.unlink_entry(entry).await?,
            Disposition::Save(record) => match Queue::of_status(&record.status) {
                None => self.unlink_entry(entry).await?,
                Some(new_queue) => {
                    let bytes = record.serialize()?;
                    self.write_atomic(&self.record_path(entry), &bytes).await?;
                    if new_queue != entry.queue {
                        self.move_entry(entry, new_queue).await?;
                    }
                }
            },
        }

        Ok(value)
    }

    /// Record file metadata. Read-only; tolerates a concurrent cross-queue
    /// rename by following the entry to its new queue.
    ///
    /// # Errors
    /// `NotFound` if the entry is gone from every queue, or `IoError`.
    pub async fn stat(&self, entry: &Entry) -> Result<EntryStat> {
        let path = self.locate_record(entry).await?;
        let _permit = self.open_file().await?;
        let meta = tokio::fs::metadata(&path).await?;
        Ok(EntryStat {
            size: meta.len(),
            mtime: meta.modified()?,
        })
    }

    /// The raw message bytes. Read-only; tolerates a concurrent rename.
    ///
    /// # Errors
    /// `NotFound` if the entry is gone from every queue, or `IoError`.
    pub async fn read_body(&self, entry: &Entry) -> Result<Vec<u8>> {
        let record_path = self.locate_record(entry).await?;
        let body_path = record_path.with_extension(BODY_SUFFIX);
        let _permit = self.open_file().await?;
        Ok(tokio::fs::read(&body_path).await?)
    }

    /// Locate an id across all queues.
    ///
    /// # Errors
    /// `IoError`.
    pub async fn find(&self, id: &MessageId) -> Result<Option<Entry>> {
        for queue in Queue::ALL {
            let candidate = Entry::new(id.clone(), queue);
            if tokio::fs::try_exists(self.record_path(&candidate)).await? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    async fn read_record(&self, entry: &Entry) -> Result<MessageRecord> {
        let _permit = self.open_file().await?;
        let bytes = match tokio::fs::read(self.record_path(entry)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SpoolError::NotFound(entry.id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        MessageRecord::parse(&bytes)
    }

    async fn locate_record(&self, entry: &Entry) -> Result<PathBuf> {
        let expected = self.record_path(entry);
        if tokio::fs::try_exists(&expected).await? {
            return Ok(expected);
        }
        match self.find(&entry.id).await? {
            Some(found) => Ok(self.record_path(&found)),
            None => Err(SpoolError::NotFound(entry.id.clone())),
        }
    }

    async fn move_entry(&self, entry: &Entry, new_queue: Queue) -> Result<()> {
        let target = Entry::new(entry.id.clone(), new_queue);

        // Body first: the record file is authoritative, so on a failure in
        // between it must still sit in its prior queue.
        let _permit = self.open_file().await?;
        tokio::fs::rename(self.body_path(entry), self.body_path(&target)).await?;
        if let Err(e) =
            tokio::fs::rename(self.record_path(entry), self.record_path(&target)).await
        {
            let _ = tokio::fs::rename(self.body_path(&target), self.body_path(entry)).await;
            return Err(e.into());
        }
        drop(_permit);

        self.sync_dir(&self.root.join(entry.queue.dir_name())).await?;
        self.sync_dir(&self.root.join(new_queue.dir_name())).await?;
        Ok(())
    }

    async fn unlink_entry(&self, entry: &Entry) -> Result<()> {
        {
            let _permit = self.open_file().await?;
            tokio::fs::remove_file(self.record_path(entry)).await?;
            match tokio::fs::remove_file(self.body_path(entry)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.sync_dir(&self.root.join(entry.queue.dir_name())).await?;

        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&entry.id);
        Ok(())
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SpoolError::Serialization("path has no file name".to_string()))?;
        let staged = self.root.join(TMP_DIR).join(format!(
            "{file_name}.{}",
            self.tmp_seq.fetch_add(1, Ordering::Relaxed)
        ));

        let written: Result<()> = async {
            let _permit = self.open_file().await?;
            let mut file = tokio::fs::File::create(&staged).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&staged, path).await?;
            Ok(())
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }

        self.sync_dir(path.parent().unwrap_or(&self.root)).await
    }

    async fn sync_dir(&self, dir: &Path) -> Result<()> {
        let _permit = self.open_file().await?;
        let dir = tokio::fs::File::open(dir).await?;
        dir.sync_all().await?;
        Ok(())
    }

    async fn open_file(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.throttle.acquire().await.map_err(|_| SpoolError::Closed)
    }

    fn entry_lock(&self, id: &MessageId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.clone())
            .or_default()
            .clone()
    }

    fn record_path(&self, entry: &Entry) -> PathBuf {
        self.root.join(entry.queue.dir_name()).join(entry.id.as_str())
    }

    fn body_path(&self, entry: &Entry) -> PathBuf {
        self.record_path(entry).with_extension(BODY_SUFFIX)
    }
}

#[cfg(unix)]
fn assert_same_device(root: &Path, dirs: &[PathBuf]) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let root_dev = std::fs::metadata(root)?.dev();
    for dir in dirs {
        if std::fs::metadata(dir)?.dev() != root_dev {
            return Err(SpoolError::CrossDevice {
                root: root.to_path_buf(),
                dir: dir.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn assert_same_device(_root: &Path, _dirs: &[PathBuf]) -> Result<()> {
    Ok(())
}
