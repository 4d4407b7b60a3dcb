//! The store: lifecycle, sessions and background checkpointing.
//!
//! One `Store` owns one directory. Opening it takes the directory lock,
//! opens the journal and index, replays the journal tail and starts the
//! checkpoint thread. Everything it opened is owned by an [`Engine`] held
//! behind a single `RwLock`: sessions, recovery and checkpoints take it
//! exclusively, [`Store::read`] shares it.

use crate::checkpoint::{self, checkpoint_update, CheckpointInfo, CheckpointSignal};
use crate::config::StoreConfig;
use crate::entity::RootEntity;
use crate::recovery::{self, RecoveryStats};
use crate::session::{Session, StoreReader};
use brokerstore_core::{Location, StoreError, StoreResult, StoreState};
use brokerstore_durability::{DurableCallback, Journal, JournalCounters, JournalError, Record};
use brokerstore_storage::{IndexCounters, IndexError, PageFile};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lock file name in the store directory.
pub const LOCK_FILE_NAME: &str = "lock";

/// Slice of the wait in [`Store::flush`].
const FLUSH_POLL: Duration = Duration::from_millis(100);

/// Everything an open store owns.
pub(crate) struct Engine {
    pub(crate) journal: Arc<Journal>,
    pub(crate) index: PageFile,
    pub(crate) root: RootEntity,
    pub(crate) recovery: RecoveryStats,
    pub(crate) next_recovery_position: Option<Location>,
    pub(crate) last_recovery_position: Option<Location>,
    /// Set when the journal holds records the index could not take.
    /// Sessions are refused until the store is reopened.
    pub(crate) failure: Option<String>,
}

impl Engine {
    fn close(self) -> StoreResult<()> {
        let flushed = self.index.flush();
        let journal = self.journal.close();
        let index = self.index.close();
        flushed?;
        journal?;
        index?;
        Ok(())
    }

    fn abandon(self) {
        self.index.abandon();
        if let Err(e) = self.journal.close() {
            debug!(target: "brokerstore::store", error = %e, "Journal close after crash failed");
        }
    }
}

/// State shared with the checkpoint thread.
pub(crate) struct Shared {
    pub(crate) config: StoreConfig,
    pub(crate) engine: RwLock<Option<Engine>>,
    pub(crate) signal: CheckpointSignal,
    tracking: AtomicI64,
    holds: Mutex<BTreeSet<u32>>,
    started: AtomicBool,
}

impl Shared {
    /// Checkpoint under the exclusive lock.
    pub(crate) fn checkpoint(&self, cleanup: bool) -> StoreResult<CheckpointInfo> {
        let mut guard = self.engine.write();
        let engine = guard.as_mut().ok_or(StoreError::NotOpen)?;
        let holds = self.holds.lock().clone();
        checkpoint_update(
            engine,
            self.tracking.load(Ordering::SeqCst),
            &holds,
            cleanup,
            self.config.slow_checkpoint_threshold(),
        )
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Journal counters
    pub journal: JournalCounters,
    /// Index counters
    pub index: IndexCounters,
    /// Pages in the index file
    pub page_count: u64,
    /// Location of the last record reflected in the index
    pub last_applied: Option<Location>,
    /// Outcome of the recovery run at open
    pub recovery: RecoveryStats,
}

/// Persistent broker store.
pub struct Store {
    shared: Arc<Shared>,
    /// Held while open; also serializes open and close.
    lock_file: Mutex<Option<File>>,
    checkpoint_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Store {
    /// Create a closed store for `config`.
    pub fn new(config: StoreConfig) -> StoreResult<Store> {
        config.validate()?;
        Ok(Store {
            shared: Arc::new(Shared {
                config,
                engine: RwLock::new(None),
                signal: CheckpointSignal::new(),
                tracking: AtomicI64::new(0),
                holds: Mutex::new(BTreeSet::new()),
                started: AtomicBool::new(false),
            }),
            lock_file: Mutex::new(None),
            checkpoint_thread: Mutex::new(None),
        })
    }

    /// Create and start a store.
    pub fn open_with(config: StoreConfig) -> StoreResult<Store> {
        let store = Store::new(config)?;
        store.start()?;
        Ok(store)
    }

    /// Configuration in use.
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Store directory.
    pub fn directory(&self) -> &Path {
        &self.shared.config.directory
    }

    /// Whether the store is open.
    pub fn is_open(&self) -> bool {
        self.shared.engine.read().is_some()
    }

    /// Whether [`start`](Self::start) ran since the last stop.
    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// Lock the directory, open journal and index, and recover. A no-op
    /// when already open.
    pub fn open(&self) -> StoreResult<()> {
        let mut lock_file = self.lock_file.lock();
        if lock_file.is_some() {
            return Ok(());
        }
        let config = &self.shared.config;
        let started = Instant::now();
        std::fs::create_dir_all(&config.directory)?;
        let file = acquire_lock(config)?;

        // The lock file is dropped, and the lock released, on any error below.
        let engine = open_engine(config)?;
        self.shared
            .tracking
            .store(engine.root.tracking_high_water, Ordering::SeqCst);
        let last_applied = engine.root.last_applied;
        *self.shared.engine.write() = Some(engine);

        self.shared.signal.reset();
        match checkpoint::spawn(Arc::clone(&self.shared)) {
            Ok(handle) => *self.checkpoint_thread.lock() = Some(handle),
            Err(e) => {
                if let Some(engine) = self.shared.engine.write().take() {
                    if let Err(close) = engine.close() {
                        warn!(target: "brokerstore::store", error = %close, "Close after failed open failed");
                    }
                }
                return Err(e.into());
            }
        }

        *lock_file = Some(file);
        info!(
            target: "brokerstore::store",
            dir = %config.directory.display(),
            watermark = ?last_applied,
            duration_ms = started.elapsed().as_millis() as u64,
            "Store opened"
        );
        Ok(())
    }

    /// Open and journal a load marker.
    pub fn start(&self) -> StoreResult<()> {
        self.open()?;
        let marker = Record::trace(format!("LOADED {}", chrono::Utc::now().to_rfc3339()));
        self.journal()?.append(&marker.encode()?, None)?;
        self.shared.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Flush, persist the root as closed, and close.
    pub fn stop(&self) -> StoreResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.flush()?;
        self.shared.started.store(false, Ordering::SeqCst);
        self.unload()?;
        self.close()
    }

    /// Persist the root as cleanly closed and flush the index.
    pub fn unload(&self) -> StoreResult<()> {
        let mut guard = self.shared.engine.write();
        let Some(engine) = guard.as_mut() else {
            return Ok(());
        };
        let mut root = engine.root.clone();
        root.state = StoreState::Closed;
        root.tracking_high_water = root
            .tracking_high_water
            .max(self.shared.tracking.load(Ordering::SeqCst));
        let mut tx = engine.index.tx();
        root.save(&mut tx)?;
        tx.commit()?;
        engine.root = root;
        engine.journal.sync()?;
        engine.index.flush()?;
        debug!(target: "brokerstore::store", watermark = ?engine.root.last_applied, "Unloaded");
        Ok(())
    }

    /// Stop the checkpoint thread, flush and close files, and release the
    /// directory lock.
    pub fn close(&self) -> StoreResult<()> {
        let mut lock_file = self.lock_file.lock();
        let Some(file) = lock_file.take() else {
            return Ok(());
        };
        self.shared.started.store(false, Ordering::SeqCst);
        self.stop_checkpoint_thread();

        let result = match self.shared.engine.write().take() {
            Some(engine) => engine.close(),
            None => Ok(()),
        };
        release_lock(file);
        match &result {
            Ok(()) => info!(target: "brokerstore::store", dir = %self.directory().display(), "Store closed"),
            Err(e) => error!(target: "brokerstore::store", error = %e, "Store closed with errors"),
        }
        result
    }

    /// Simulate a process crash: drop every unflushed index page, close
    /// files without persisting anything, and release the lock.
    #[doc(hidden)]
    pub fn crash(&self) {
        let mut lock_file = self.lock_file.lock();
        let Some(file) = lock_file.take() else {
            return;
        };
        self.shared.started.store(false, Ordering::SeqCst);
        self.stop_checkpoint_thread();
        if let Some(engine) = self.shared.engine.write().take() {
            engine.abandon();
        }
        release_lock(file);
        debug!(target: "brokerstore::store", "Simulated crash");
    }

    fn stop_checkpoint_thread(&self) {
        self.shared.signal.shutdown();
        if let Some(handle) = self.checkpoint_thread.lock().take() {
            if handle.join().is_err() {
                error!(target: "brokerstore::checkpoint", "Checkpoint thread panicked");
            }
        }
    }

    fn journal(&self) -> StoreResult<Arc<Journal>> {
        self.shared
            .engine
            .read()
            .as_ref()
            .map(|engine| Arc::clone(&engine.journal))
            .ok_or(StoreError::NotOpen)
    }

    /// Exclusive session. Blocks while another session, a checkpoint or a
    /// reader holds the engine.
    ///
    /// Fails with `Fatal` after a session left the journal ahead of the
    /// index; reopening the store replays the journal and clears it.
    pub fn session(&self) -> StoreResult<Session<'_>> {
        let guard = self.shared.engine.write();
        let engine = RwLockWriteGuard::try_map(guard, Option::as_mut).map_err(|_| StoreError::NotOpen)?;
        if let Some(reason) = &engine.failure {
            return Err(StoreError::fatal(format!("store must be reopened: {reason}")));
        }
        Ok(Session::new(engine))
    }

    /// Run `op` in a session. Commits on `Ok`, rolls back on `Err`.
    pub fn execute<R>(
        &self,
        op: impl FnOnce(&mut Session<'_>) -> StoreResult<R>,
        on_flush: Option<DurableCallback>,
    ) -> StoreResult<R> {
        let mut session = self.session()?;
        match op(&mut session) {
            Ok(value) => {
                session.commit(on_flush)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = session.rollback() {
                    warn!(target: "brokerstore::store", error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Run read-only queries against the committed index.
    pub fn read<R>(&self, op: impl FnOnce(&StoreReader<'_>) -> StoreResult<R>) -> StoreResult<R> {
        let guard = self.shared.engine.read();
        let engine = guard.as_ref().ok_or(StoreError::NotOpen)?;
        let tx = engine.index.tx();
        let result = op(&StoreReader::new(&engine.journal, &tx, &engine.root));
        tx.rollback();
        result
    }

    /// Next store tracking number.
    ///
    /// The high-water mark is persisted only by checkpoints and
    /// [`unload`](Self::unload). After a crash, numbers handed out since
    /// the last checkpoint can be handed out again.
    pub fn allocate_store_tracking(&self) -> i64 {
        self.shared.tracking.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Wait until everything journaled so far is on stable storage.
    ///
    /// Waits for as long as the store stays open, whether or not it was
    /// started. A store closed during the wait is `NotOpen`.
    pub fn flush(&self) -> StoreResult<()> {
        let journal = self.journal()?;
        let (done, wait) = mpsc::channel();
        let marker = Record::Flush.encode()?;
        journal.append(
            &marker,
            Some(Box::new(move || {
                let _ = done.send(());
            })),
        )?;
        loop {
            match wait.recv_timeout(FLUSH_POLL) {
                Ok(()) => return Ok(()),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if !self.is_open() {
                        return Err(StoreError::NotOpen);
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(StoreError::fatal("journal sync failed before flush completed"));
                }
            }
        }
    }

    /// Force a checkpoint, then run `callback`.
    pub fn checkpoint(&self, callback: Option<Box<dyn FnOnce() + Send>>) -> StoreResult<CheckpointInfo> {
        let info = self.shared.checkpoint(false)?;
        if let Some(callback) = callback {
            callback();
        }
        Ok(info)
    }

    /// Force a checkpoint and reclaim unreferenced journal segments.
    pub fn cleanup(&self) -> StoreResult<CheckpointInfo> {
        self.shared.checkpoint(true)
    }

    /// Apply journal records appended since the last replay.
    pub fn incremental_recover(&self) -> StoreResult<u64> {
        let mut guard = self.shared.engine.write();
        let engine = guard.as_mut().ok_or(StoreError::NotOpen)?;
        recovery::incremental_recover(engine)
    }

    /// Keep a segment from being reclaimed while a replica copies it.
    pub fn replication_hold(&self, segment_id: u32) {
        self.shared.holds.lock().insert(segment_id);
    }

    /// Release a replication hold.
    pub fn replication_release(&self, segment_id: u32) {
        self.shared.holds.lock().remove(&segment_id);
    }

    /// Segments under a replication hold.
    pub fn replicating_segments(&self) -> BTreeSet<u32> {
        self.shared.holds.lock().clone()
    }

    /// Counters of the open store.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let guard = self.shared.engine.read();
        let engine = guard.as_ref().ok_or(StoreError::NotOpen)?;
        let index = engine.index.counters();
        Ok(StoreStats {
            journal: engine.journal.counters(),
            page_count: index.page_count,
            index,
            last_applied: engine.root.last_applied,
            recovery: engine.recovery.clone(),
        })
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(target: "brokerstore::store", error = %e, "Failed to close store on drop");
        }
    }
}

fn lock_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE_NAME)
}

fn acquire_lock(config: &StoreConfig) -> StoreResult<File> {
    let path = lock_path(&config.directory);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)?;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(e) if e.kind() != fs2::lock_contended_error().kind() => return Err(e.into()),
            Err(_) if config.fail_if_locked => return Err(StoreError::Locked(path)),
            Err(_) => {
                warn!(
                    target: "brokerstore::store",
                    path = %path.display(),
                    retry_ms = config.lock_retry_delay_ms,
                    "Store directory is locked; waiting"
                );
                std::thread::sleep(Duration::from_millis(config.lock_retry_delay_ms));
            }
        }
    }
}

fn release_lock(file: File) {
    if let Err(e) = FileExt::unlock(&file) {
        warn!(target: "brokerstore::store", error = %e, "Failed to release store lock");
    }
}

fn journal_sync_hook(journal: Arc<Journal>) -> brokerstore_storage::BeforeFlush {
    Box::new(move || match journal.sync() {
        Ok(()) => Ok(()),
        Err(JournalError::Io(e)) => Err(IndexError::Io(e)),
        Err(e) => Err(IndexError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            e.to_string(),
        ))),
    })
}

fn open_engine(config: &StoreConfig) -> StoreResult<Engine> {
    let dir = &config.directory;
    if config.delete_all_messages {
        PageFile::destroy(dir)?;
        let removed = Journal::destroy(dir)?;
        info!(target: "brokerstore::store", segments = removed, "Deleted all messages");
    }

    let index = PageFile::open(dir, config.page_file_config())?;
    let journal = Arc::new(Journal::open(dir, config.journal_config())?);
    index.set_before_flush(journal_sync_hook(Arc::clone(&journal)));

    let mut tx = index.tx();
    let root = if index.is_empty() {
        RootEntity::allocate(&mut tx)?
    } else {
        RootEntity::load(&tx)?
    };
    tx.commit()?;
    if root.state == StoreState::Open {
        warn!(target: "brokerstore::store", "Store was not closed cleanly");
    }

    let mut engine = Engine {
        journal,
        index,
        root,
        recovery: RecoveryStats::default(),
        next_recovery_position: None,
        last_recovery_position: None,
        failure: None,
    };
    engine.recovery = recovery::recover(&mut engine)?;

    let mut root = engine.root.clone();
    root.state = StoreState::Open;
    let mut tx = engine.index.tx();
    root.save(&mut tx)?;
    tx.commit()?;
    engine.root = root;
    engine.index.flush()?;
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use brokerstore_core::{MessageRecord, QueueDescriptor, QueueRecord};
    use tempfile::tempdir;

    #[test]
    fn test_open_close_reopen() {
        let dir = tempdir().unwrap();
        let store = Store::open_with(StoreConfig::for_testing(dir.path())).unwrap();
        assert!(store.is_open());
        assert!(store.is_started());
        assert!(dir.path().join(LOCK_FILE_NAME).exists());
        store.stop().unwrap();
        assert!(!store.is_open());

        store.open().unwrap();
        store.open().unwrap();
        assert!(store.is_open());
        store.close().unwrap();
    }

    #[test]
    fn test_operations_require_open_store() {
        let dir = tempdir().unwrap();
        let store = Store::new(StoreConfig::for_testing(dir.path())).unwrap();
        assert!(matches!(store.session(), Err(StoreError::NotOpen)));
        assert!(matches!(store.read(|_| Ok(())), Err(StoreError::NotOpen)));
        assert!(matches!(store.flush(), Err(StoreError::NotOpen)));
        assert!(matches!(store.stats(), Err(StoreError::NotOpen)));
        store.close().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path()).with_index_write_batch_size(0);
        assert!(matches!(Store::new(config), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_execute_commits_and_rolls_back() {
        let dir = tempdir().unwrap();
        let store = Store::open_with(StoreConfig::for_testing(dir.path())).unwrap();

        store
            .execute(
                |s| {
                    s.queue_add(QueueDescriptor::new("Q"))?;
                    s.message_add(MessageRecord::new(1, "m1", b"A".to_vec()))?;
                    s.queue_add_message("Q", QueueRecord::new(1, 1, 1))
                },
                None,
            )
            .unwrap();

        let err = store
            .execute(
                |s| {
                    s.message_add(MessageRecord::new(2, "m2", b"B".to_vec()))?;
                    s.queue_add_message("missing", QueueRecord::new(1, 2, 1))
                },
                None,
            )
            .unwrap_err();
        assert!(err.is_not_found());

        store
            .read(|r| {
                assert_eq!(r.message_count()?, 1);
                assert_eq!(r.queue_list_messages("Q", None, None, 10)?.len(), 1);
                assert!(r.message_location(2)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_on_flush_fires() {
        let dir = tempdir().unwrap();
        let store = Store::open_with(StoreConfig::for_testing(dir.path())).unwrap();
        let (tx, rx) = mpsc::channel();
        store
            .execute(
                |s| s.map_entry_put("M", "k", b"v".to_vec()),
                Some(Box::new(move || {
                    let _ = tx.send(());
                })),
            )
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (tx, rx) = mpsc::channel();
        store
            .execute(
                |_| Ok(()),
                Some(Box::new(move || {
                    let _ = tx.send(());
                })),
            )
            .unwrap();
        rx.try_recv().unwrap();
    }

    #[test]
    fn test_tracking_survives_restart() {
        let dir = tempdir().unwrap();
        let store = Store::open_with(StoreConfig::for_testing(dir.path())).unwrap();
        let first = store.allocate_store_tracking();
        let second = store.allocate_store_tracking();
        assert!(second > first);
        store.stop().unwrap();

        store.start().unwrap();
        assert!(store.allocate_store_tracking() > second);
    }

    #[test]
    fn test_flush_and_stats() {
        let dir = tempdir().unwrap();
        let store = Store::open_with(StoreConfig::for_testing(dir.path())).unwrap();
        store
            .execute(|s| s.map_entry_put("M", "k", b"v".to_vec()), None)
            .unwrap();
        store.flush().unwrap();

        let stats = store.stats().unwrap();
        assert!(stats.journal.appends >= 3);
        assert!(stats.page_count > 0);
        assert!(stats.last_applied.is_some());
    }

    #[test]
    fn test_flush_waits_on_opened_store() {
        let dir = tempdir().unwrap();
        let store = Store::new(StoreConfig::for_testing(dir.path())).unwrap();
        store.open().unwrap();
        assert!(!store.is_started());

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        store
            .execute(
                |s| s.map_entry_put("M", "k", b"v".to_vec()),
                Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            )
            .unwrap();
        store.flush().unwrap();
        assert!(fired.load(Ordering::SeqCst));
        store.close().unwrap();
    }

    #[test]
    fn test_tracking_is_not_persisted_until_checkpoint() {
        let dir = tempdir().unwrap();
        let store = Store::open_with(StoreConfig::for_testing(dir.path())).unwrap();
        store.allocate_store_tracking();
        store.checkpoint(None).unwrap();
        let checkpointed = store.allocate_store_tracking();
        store.crash();

        store.start().unwrap();
        assert_eq!(store.allocate_store_tracking(), checkpointed);
    }

    #[test]
    fn test_replication_holds() {
        let dir = tempdir().unwrap();
        let store = Store::new(StoreConfig::for_testing(dir.path())).unwrap();
        store.replication_hold(3);
        store.replication_hold(1);
        assert_eq!(store.replicating_segments(), BTreeSet::from([1, 3]));
        store.replication_release(3);
        assert_eq!(store.replicating_segments(), BTreeSet::from([1]));
    }
}
