//! Segmented append-only journal.
//!
//! The journal is the write-ahead log of the store. Records are framed with
//! a length and CRC32 and appended to the active segment; once a segment
//! reaches the configured length the writer rotates to a new one.
//!
//! # Durability
//!
//! `append` returns as soon as the frame has been handed to the OS. A
//! caller that needs to know when the write is on stable storage passes a
//! [`DurableCallback`]; a dedicated sync thread batches pending callbacks,
//! fsyncs the active segment (unless disk syncs are disabled) and then
//! fires them outside every journal lock.
//!
//! # Concurrency
//!
//! Appends are serialized by the writer mutex. Reads use their own file
//! handles and only briefly consult the segment table, so they proceed
//! alongside appends.

pub mod config;
pub mod segment;

pub use config::{JournalConfig, JournalConfigError};
pub use segment::{ScanResult, ScanStop, SegmentHeader, SEGMENT_HEADER_SIZE};

use brokerstore_core::{Location, StoreError};
use parking_lot::{Condvar, Mutex, RwLock};
use segment::{
    encode_frame, list_segment_ids, read_frame, read_frame_len, scan_frames, segment_path,
    FrameError, SegmentFile, FRAME_HEADER_SIZE,
};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Callback fired once an append is on stable storage.
pub type DurableCallback = Box<dyn FnOnce() + Send + 'static>;

/// Journal errors.
#[derive(Debug, Error)]
pub enum JournalError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Location does not point at a valid frame
    #[error("Corrupt record at {location}: {reason}")]
    CorruptRecord {
        /// Offending location
        location: Location,
        /// What was wrong
        reason: String,
    },

    /// Segment header unreadable
    #[error("Invalid journal segment {segment_id}: {reason}")]
    InvalidSegment {
        /// Segment id from the file name
        segment_id: u32,
        /// What was wrong
        reason: String,
    },

    /// Segment cannot be removed while it may still receive or sync writes
    #[error("Journal segment {0} is still in use")]
    SegmentInUse(u32),

    /// Journal has been closed
    #[error("Journal is closed")]
    Closed,

    /// Durability callback was dropped because the sync failed
    #[error("Journal sync failed; write durability unknown")]
    SyncFailed,

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] JournalConfigError),
}

impl From<JournalError> for StoreError {
    fn from(e: JournalError) -> Self {
        match e {
            JournalError::Io(io) => StoreError::Io(io),
            JournalError::CorruptRecord { location, reason } => StoreError::CorruptRecord {
                location: Some(location),
                reason,
            },
            JournalError::InvalidSegment { .. } => StoreError::CorruptRecord {
                location: None,
                reason: e.to_string(),
            },
            JournalError::SegmentInUse(id) => StoreError::SegmentInUse(id),
            JournalError::Closed => StoreError::NotOpen,
            JournalError::SyncFailed => StoreError::Fatal(e.to_string()),
            JournalError::Config(c) => StoreError::Config(c.to_string()),
        }
    }
}

/// Cumulative journal counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalCounters {
    /// Frames appended
    pub appends: u64,
    /// Fsync calls on segments
    pub syncs: u64,
    /// Frame bytes written
    pub bytes_written: u64,
    /// Durability callbacks fired
    pub callbacks_fired: u64,
}

/// Outcome of a segment removal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupInfo {
    /// Removed segment ids, ascending
    pub segments_removed: Vec<u32>,
    /// Bytes freed on disk
    pub reclaimed_bytes: u64,
}

struct Writer {
    active: Option<SegmentFile>,
    sync_handle: Arc<File>,
    last_append: Option<Location>,
}

struct SyncQueue {
    callbacks: Vec<DurableCallback>,
    shutdown: bool,
}

struct Shared {
    dir: PathBuf,
    config: JournalConfig,
    writer: Mutex<Writer>,
    /// Segment id -> length of its valid frames
    segments: RwLock<BTreeMap<u32, u64>>,
    readers: Mutex<HashMap<u32, File>>,
    queue: Mutex<SyncQueue>,
    work_ready: Condvar,
    appends: AtomicU64,
    syncs: AtomicU64,
    bytes_written: AtomicU64,
    callbacks_fired: AtomicU64,
}

/// Append-only, segment-rotated journal.
pub struct Journal {
    shared: Arc<Shared>,
    sync_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Journal {
    /// Open (or create) the journal in `dir`.
    ///
    /// Existing segments are validated. A torn tail in the newest segment is
    /// truncated; an invalid frame in any older segment is an error because
    /// records after it could never be replayed.
    pub fn open(dir: impl AsRef<Path>, config: JournalConfig) -> Result<Journal, JournalError> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let ids = list_segment_ids(&dir)?;
        let newest = ids.last().copied();
        let mut segments = BTreeMap::new();
        let mut last_append = None;

        for &id in &ids {
            let path = segment_path(&dir, id);
            let data = std::fs::read(&path)?;
            let is_newest = Some(id) == newest;

            match SegmentHeader::from_bytes(&data) {
                Some(header) if header.segment_id == id => {}
                _ if is_newest => {
                    warn!(
                        target: "brokerstore::journal",
                        segment = id,
                        "Discarding newest segment with unreadable header"
                    );
                    std::fs::remove_file(&path)?;
                    continue;
                }
                _ => {
                    return Err(JournalError::InvalidSegment {
                        segment_id: id,
                        reason: "bad segment header".to_string(),
                    })
                }
            }

            let scan = scan_frames(&data);
            if scan.stop != ScanStop::EndOfData {
                if !is_newest {
                    return Err(JournalError::CorruptRecord {
                        location: Location::new(id, scan.valid_end as u32),
                        reason: format!("{:?} inside a rotated segment", scan.stop),
                    });
                }
                warn!(
                    target: "brokerstore::journal",
                    segment = id,
                    valid_end = scan.valid_end,
                    discarded = data.len() as u64 - scan.valid_end,
                    reason = ?scan.stop,
                    "Truncating torn journal tail"
                );
            }
            if let Some(offset) = scan.last_frame {
                last_append = Some(Location::new(id, offset as u32));
            }
            segments.insert(id, scan.valid_end);
        }

        let active = match segments.iter().next_back() {
            Some((&id, &len)) => SegmentFile::open_append(&dir, id, len)?,
            None => {
                let seg = SegmentFile::create(&dir, newest.unwrap_or(1))?;
                segments.insert(seg.segment_id(), seg.len());
                seg
            }
        };

        info!(
            target: "brokerstore::journal",
            dir = %dir.display(),
            segments = segments.len(),
            active = active.segment_id(),
            last_append = ?last_append,
            "Opened journal"
        );

        let shared = Arc::new(Shared {
            dir,
            config,
            writer: Mutex::new(Writer {
                sync_handle: Arc::new(active.sync_handle()?),
                active: Some(active),
                last_append,
            }),
            segments: RwLock::new(segments),
            readers: Mutex::new(HashMap::new()),
            queue: Mutex::new(SyncQueue {
                callbacks: Vec::new(),
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            appends: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            callbacks_fired: AtomicU64::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("brokerstore-journal-sync".to_string())
            .spawn(move || sync_loop(thread_shared))?;

        Ok(Journal {
            shared,
            sync_thread: Mutex::new(Some(handle)),
        })
    }

    /// Remove every segment file in `dir`. Returns how many were removed.
    pub fn destroy(dir: impl AsRef<Path>) -> Result<usize, JournalError> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(0);
        }
        let ids = list_segment_ids(dir)?;
        for &id in &ids {
            std::fs::remove_file(segment_path(dir, id))?;
        }
        Ok(ids.len())
    }

    /// Directory holding the segments.
    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /// Append a payload and return its location.
    ///
    /// The location is returned before the write is necessarily durable.
    /// `on_durable` fires on the sync thread once it is.
    pub fn append(
        &self,
        payload: &[u8],
        on_durable: Option<DurableCallback>,
    ) -> Result<Location, JournalError> {
        let frame = encode_frame(payload);
        let mut writer = self.shared.writer.lock();

        let needs_rotation = match writer.active.as_ref() {
            Some(active) => {
                !active.is_broken()
                    && !active.is_empty()
                    && active.len() + frame.len() as u64 > self.shared.config.max_segment_length
            }
            None => return Err(JournalError::Closed),
        };
        if needs_rotation {
            self.rotate(&mut writer)?;
        }

        let active = writer.active.as_mut().ok_or(JournalError::Closed)?;
        let offset = active.write_frame(&frame)?;
        let location = Location::new(active.segment_id(), offset as u32);
        self.shared
            .segments
            .write()
            .insert(active.segment_id(), active.len());
        writer.last_append = Some(location);

        self.shared.appends.fetch_add(1, Ordering::Relaxed);
        self.shared
            .bytes_written
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        if let Some(callback) = on_durable {
            self.shared.queue.lock().callbacks.push(callback);
            self.shared.work_ready.notify_one();
        }
        Ok(location)
    }

    /// Append a payload and block until it is durable.
    pub fn append_sync(&self, payload: &[u8]) -> Result<Location, JournalError> {
        let (tx, rx) = mpsc::channel();
        let location = self.append(
            payload,
            Some(Box::new(move || {
                let _ = tx.send(());
            })),
        )?;
        rx.recv().map_err(|_| JournalError::SyncFailed)?;
        Ok(location)
    }

    /// Rotate to a new segment. Caller holds the writer lock.
    fn rotate(&self, writer: &mut Writer) -> Result<(), JournalError> {
        let (old_id, old_len) = match writer.active.as_ref() {
            Some(active) => {
                active.sync()?;
                (active.segment_id(), active.len())
            }
            None => return Err(JournalError::Closed),
        };
        self.shared.syncs.fetch_add(1, Ordering::Relaxed);

        let next = SegmentFile::create(&self.shared.dir, old_id + 1)?;
        writer.sync_handle = Arc::new(next.sync_handle()?);
        self.shared
            .segments
            .write()
            .insert(next.segment_id(), next.len());

        debug!(
            target: "brokerstore::journal",
            from = old_id,
            to = next.segment_id(),
            closed_len = old_len,
            "Rotated journal segment"
        );
        writer.active = Some(next);
        Ok(())
    }

    /// Read the payload stored at `location`.
    pub fn read(&self, location: Location) -> Result<Vec<u8>, JournalError> {
        let valid_len = self.valid_len(location)?;
        let mut readers = self.shared.readers.lock();
        let file = self.reader(&mut readers, location.segment_id)?;
        read_frame(file, location.offset as u64, valid_len).map_err(|e| frame_error(location, e))
    }

    /// Location of the record after `after`, or of the first record when
    /// `after` is `None`. Returns `None` at end of journal.
    ///
    /// A location in a segment that no longer exists resumes at the first
    /// record of the next segment.
    pub fn next_location(&self, after: Option<Location>) -> Result<Option<Location>, JournalError> {
        let Some(location) = after else {
            return Ok(self.first_record_after(None));
        };

        let seg_len = self
            .shared
            .segments
            .read()
            .get(&location.segment_id)
            .copied();
        if let Some(valid_len) = seg_len {
            let offset = location.offset as u64;
            if offset < valid_len {
                let payload_len = {
                    let mut readers = self.shared.readers.lock();
                    let file = self.reader(&mut readers, location.segment_id)?;
                    read_frame_len(file, offset, valid_len).map_err(|e| frame_error(location, e))?
                };
                let end = offset + FRAME_HEADER_SIZE + payload_len;
                if end < valid_len {
                    return Ok(Some(Location::new(location.segment_id, end as u32)));
                }
            }
        }
        Ok(self.first_record_after(Some(location.segment_id)))
    }

    fn first_record_after(&self, segment_id: Option<u32>) -> Option<Location> {
        let segments = self.shared.segments.read();
        let lower = match segment_id {
            Some(id) => id.checked_add(1)?,
            None => 0,
        };
        segments
            .range(lower..)
            .find(|&(_, &len)| len > SEGMENT_HEADER_SIZE)
            .map(|(&id, _)| Location::new(id, SEGMENT_HEADER_SIZE as u32))
    }

    /// Location of the most recent append, `None` for an empty journal.
    pub fn last_append_location(&self) -> Option<Location> {
        self.shared.writer.lock().last_append
    }

    /// Ids of all live segments, ascending.
    pub fn segment_ids(&self) -> Vec<u32> {
        self.shared.segments.read().keys().copied().collect()
    }

    /// Id of the segment currently receiving appends.
    pub fn active_segment_id(&self) -> Option<u32> {
        self.shared
            .writer
            .lock()
            .active
            .as_ref()
            .map(SegmentFile::segment_id)
    }

    /// Delete fully superseded segments.
    ///
    /// The whole set is checked before anything is deleted; the active
    /// segment can never be removed. Unknown ids are ignored.
    pub fn remove_segments(&self, ids: &BTreeSet<u32>) -> Result<CleanupInfo, JournalError> {
        let writer = self.shared.writer.lock();
        let active = writer.active.as_ref().map(SegmentFile::segment_id);
        if let Some(&busy) = ids.iter().find(|&&id| Some(id) == active) {
            return Err(JournalError::SegmentInUse(busy));
        }

        let mut info = CleanupInfo::default();
        for &id in ids {
            if self.shared.segments.write().remove(&id).is_none() {
                continue;
            }
            self.shared.readers.lock().remove(&id);
            let path = segment_path(&self.shared.dir, id);
            let bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            std::fs::remove_file(&path)?;
            info.segments_removed.push(id);
            info.reclaimed_bytes += bytes;
        }
        drop(writer);

        if !info.segments_removed.is_empty() {
            info!(
                target: "brokerstore::journal",
                removed = ?info.segments_removed,
                reclaimed_bytes = info.reclaimed_bytes,
                "Removed journal segments"
            );
        }
        Ok(info)
    }

    /// Fsync the active segment, making every prior append durable.
    pub fn sync(&self) -> Result<(), JournalError> {
        self.shared.sync_active()?;
        Ok(())
    }

    /// Snapshot of cumulative counters.
    pub fn counters(&self) -> JournalCounters {
        JournalCounters {
            appends: self.shared.appends.load(Ordering::Relaxed),
            syncs: self.shared.syncs.load(Ordering::Relaxed),
            bytes_written: self.shared.bytes_written.load(Ordering::Relaxed),
            callbacks_fired: self.shared.callbacks_fired.load(Ordering::Relaxed),
        }
    }

    /// Sync and close the journal. Pending callbacks fire before this returns.
    ///
    /// Further appends fail with [`JournalError::Closed`]. Calling close
    /// twice is a no-op.
    pub fn close(&self) -> Result<(), JournalError> {
        let active = self.shared.writer.lock().active.take();
        let result = match &active {
            Some(seg) => seg.sync().map_err(JournalError::from),
            None => Ok(()),
        };

        self.shared.queue.lock().shutdown = true;
        self.shared.work_ready.notify_all();
        if let Some(handle) = self.sync_thread.lock().take() {
            if handle.join().is_err() {
                error!(target: "brokerstore::journal", "Journal sync thread panicked");
            }
        }
        self.shared.readers.lock().clear();

        if active.is_some() {
            debug!(target: "brokerstore::journal", dir = %self.shared.dir.display(), "Closed journal");
        }
        result
    }

    /// Close the journal and remove every segment file.
    pub fn delete(&self) -> Result<usize, JournalError> {
        self.close()?;
        self.shared.segments.write().clear();
        Journal::destroy(&self.shared.dir)
    }

    fn valid_len(&self, location: Location) -> Result<u64, JournalError> {
        self.shared
            .segments
            .read()
            .get(&location.segment_id)
            .copied()
            .ok_or_else(|| JournalError::CorruptRecord {
                location,
                reason: "segment does not exist".to_string(),
            })
    }

    fn reader<'a>(
        &self,
        readers: &'a mut HashMap<u32, File>,
        segment_id: u32,
    ) -> Result<&'a mut File, JournalError> {
        Ok(match readers.entry(segment_id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(File::open(segment_path(&self.shared.dir, segment_id))?),
        })
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(target: "brokerstore::journal", error = %e, "Failed to close journal on drop");
        }
    }
}

impl Shared {
    fn sync_active(&self) -> Result<(), JournalError> {
        let handle = {
            let writer = self.writer.lock();
            if writer.active.is_none() {
                return Err(JournalError::Closed);
            }
            Arc::clone(&writer.sync_handle)
        };
        handle.sync_data()?;
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn frame_error(location: Location, e: FrameError) -> JournalError {
    match e {
        FrameError::Io(io) => JournalError::Io(io),
        FrameError::OutOfBounds => JournalError::CorruptRecord {
            location,
            reason: "frame exceeds segment bounds".to_string(),
        },
        FrameError::Checksum => JournalError::CorruptRecord {
            location,
            reason: "checksum mismatch".to_string(),
        },
    }
}

/// Body of the sync thread: batch callbacks, fsync, fire.
fn sync_loop(shared: Arc<Shared>) {
    loop {
        let (batch, shutdown) = {
            let mut queue = shared.queue.lock();
            while queue.callbacks.is_empty() && !queue.shutdown {
                shared.work_ready.wait(&mut queue);
            }
            (std::mem::take(&mut queue.callbacks), queue.shutdown)
        };

        if !batch.is_empty() {
            let synced = if shared.config.enable_disk_syncs {
                match shared.sync_active() {
                    Ok(()) => true,
                    // Closed: close() already synced the segment itself.
                    Err(JournalError::Closed) => true,
                    Err(e) => {
                        error!(
                            target: "brokerstore::journal",
                            error = %e,
                            dropped = batch.len(),
                            "Journal sync failed; durability callbacks dropped"
                        );
                        false
                    }
                }
            } else {
                true
            };

            if synced {
                let fired = batch.len() as u64;
                for callback in batch {
                    callback();
                }
                shared.callbacks_fired.fetch_add(fired, Ordering::Relaxed);
            }
        }

        if shutdown {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn small_config() -> JournalConfig {
        JournalConfig::for_testing().with_max_segment_length(4 * 1024)
    }

    #[test]
    fn test_empty_journal() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path(), JournalConfig::for_testing()).unwrap();
        assert_eq!(journal.last_append_location(), None);
        assert_eq!(journal.next_location(None).unwrap(), None);
        assert_eq!(journal.segment_ids(), vec![1]);
    }

    #[test]
    fn test_append_read_iterate() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path(), JournalConfig::for_testing()).unwrap();
        let a = journal.append(b"first", None).unwrap();
        let b = journal.append(b"second", None).unwrap();
        assert!(a < b);
        assert_eq!(journal.last_append_location(), Some(b));

        assert_eq!(journal.read(a).unwrap(), b"first");
        assert_eq!(journal.read(b).unwrap(), b"second");

        assert_eq!(journal.next_location(None).unwrap(), Some(a));
        assert_eq!(journal.next_location(Some(a)).unwrap(), Some(b));
        assert_eq!(journal.next_location(Some(b)).unwrap(), None);
    }

    #[test]
    fn test_read_bad_location_is_corrupt() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path(), JournalConfig::for_testing()).unwrap();
        let a = journal.append(b"payload", None).unwrap();
        let bogus = Location::new(a.segment_id, a.offset + 3);
        assert!(matches!(
            journal.read(bogus),
            Err(JournalError::CorruptRecord { .. })
        ));
        assert!(matches!(
            journal.read(Location::new(99, 32)),
            Err(JournalError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_rotation_and_iteration_across_segments() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path(), small_config()).unwrap();
        let payload = vec![7u8; 1000];
        let locations: Vec<Location> = (0..10)
            .map(|_| journal.append(&payload, None).unwrap())
            .collect();
        assert!(journal.segment_ids().len() > 1);

        let mut walked = Vec::new();
        let mut cursor = journal.next_location(None).unwrap();
        while let Some(loc) = cursor {
            walked.push(loc);
            cursor = journal.next_location(Some(loc)).unwrap();
        }
        assert_eq!(walked, locations);
    }

    #[test]
    fn test_reopen_recovers_last_append() {
        let dir = tempdir().unwrap();
        let last = {
            let journal = Journal::open(dir.path(), small_config()).unwrap();
            for i in 0..8u8 {
                journal.append(&[i; 900], None).unwrap();
            }
            journal.last_append_location().unwrap()
        };
        let journal = Journal::open(dir.path(), small_config()).unwrap();
        assert_eq!(journal.last_append_location(), Some(last));
        assert_eq!(journal.read(last).unwrap(), vec![7u8; 900]);
        let next = journal.append(b"after reopen", None).unwrap();
        assert!(next > last);
    }

    #[test]
    fn test_torn_tail_truncated_on_open() {
        let dir = tempdir().unwrap();
        let good = {
            let journal = Journal::open(dir.path(), JournalConfig::for_testing()).unwrap();
            journal.append(b"good", None).unwrap()
        };
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(segment_path(dir.path(), 1))
                .unwrap();
            file.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();
        }
        let journal = Journal::open(dir.path(), JournalConfig::for_testing()).unwrap();
        assert_eq!(journal.last_append_location(), Some(good));
        assert_eq!(journal.next_location(Some(good)).unwrap(), None);
        let next = journal.append(b"next", None).unwrap();
        assert_eq!(journal.next_location(Some(good)).unwrap(), Some(next));
    }

    #[test]
    fn test_corrupt_rotated_segment_is_fatal() {
        let dir = tempdir().unwrap();
        {
            let journal = Journal::open(dir.path(), small_config()).unwrap();
            for _ in 0..10 {
                journal.append(&[1u8; 1000], None).unwrap();
            }
        }
        let path = segment_path(dir.path(), 1);
        let mut data = std::fs::read(&path).unwrap();
        let idx = SEGMENT_HEADER_SIZE as usize + 20;
        data[idx] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        assert!(matches!(
            Journal::open(dir.path(), small_config()),
            Err(JournalError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_durable_callbacks_fire_in_order() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path(), JournalConfig::new()).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            journal
                .append(b"x", Some(Box::new(move || order.lock().push(i))))
                .unwrap();
        }
        journal.append_sync(b"barrier").unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert!(journal.counters().callbacks_fired >= 6);
    }

    #[test]
    fn test_close_fires_pending_callbacks() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path(), JournalConfig::for_testing()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        journal
            .append(
                b"x",
                Some(Box::new(move || {
                    f.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        journal.close().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(
            journal.append(b"late", None),
            Err(JournalError::Closed)
        ));
    }

    #[test]
    fn test_remove_segments() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path(), small_config()).unwrap();
        for _ in 0..10 {
            journal.append(&[3u8; 1000], None).unwrap();
        }
        let ids = journal.segment_ids();
        let active = journal.active_segment_id().unwrap();
        assert_eq!(*ids.last().unwrap(), active);

        let busy: BTreeSet<u32> = [ids[0], active].into_iter().collect();
        assert!(matches!(
            journal.remove_segments(&busy),
            Err(JournalError::SegmentInUse(id)) if id == active
        ));
        assert_eq!(journal.segment_ids(), ids, "nothing removed on refusal");

        let old: BTreeSet<u32> = [ids[0]].into_iter().collect();
        let info = journal.remove_segments(&old).unwrap();
        assert_eq!(info.segments_removed, vec![ids[0]]);
        assert!(info.reclaimed_bytes > 0);
        assert!(!segment_path(dir.path(), ids[0]).exists());

        let first = journal.next_location(None).unwrap().unwrap();
        assert_eq!(first.segment_id, ids[1]);
    }

    #[test]
    fn test_next_location_skips_removed_segment() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path(), small_config()).unwrap();
        let first = journal.append(&[1u8; 1000], None).unwrap();
        for _ in 0..8 {
            journal.append(&[2u8; 1000], None).unwrap();
        }
        journal
            .remove_segments(&[first.segment_id].into_iter().collect())
            .unwrap();
        let next = journal.next_location(Some(first)).unwrap().unwrap();
        assert!(next.segment_id > first.segment_id);
    }

    #[test]
    fn test_destroy_removes_segments() {
        let dir = tempdir().unwrap();
        {
            let journal = Journal::open(dir.path(), small_config()).unwrap();
            for _ in 0..6 {
                journal.append(&[0u8; 1000], None).unwrap();
            }
        }
        assert!(Journal::destroy(dir.path()).unwrap() >= 2);
        assert!(list_segment_ids(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_delete_closes_and_removes() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path(), small_config()).unwrap();
        journal.append(b"gone", None).unwrap();
        assert_eq!(journal.delete().unwrap(), 1);
        assert!(list_segment_ids(dir.path()).unwrap().is_empty());
        assert!(matches!(
            journal.append(b"late", None),
            Err(JournalError::Closed)
        ));
    }
}
