//! Page file with a redo log.
//!
//! Committed page images stay in an in-memory dirty map until a flush
//! writes them out. A flush is atomic with respect to crashes: every image
//! is first written to `db.redo` and synced, then written in place, and
//! only then is the redo file truncated. On open a complete redo file is
//! replayed; a torn one is discarded because the in-place writes never
//! started.
//!
//! # Redo File Layout
//!
//! ```text
//! ┌───────────┬───────────┬──────────────────────────────────┬──────────┐
//! │ "BSRD"(4) │ Count (4) │ Count x [PageId (8)][Image 4096] │ CRC (4)  │
//! └───────────┴───────────┴──────────────────────────────────┴──────────┘
//! ```

use crate::error::{IndexError, IndexResult};
use crate::page::{free_page, peek_kind, PageId, PageKind, PAGE_SIZE};
use crate::tx::PageTx;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Name of the page file inside the index directory
pub const DATA_FILE_NAME: &str = "db.data";

/// Name of the redo file inside the index directory
pub const REDO_FILE_NAME: &str = "db.redo";

const REDO_MAGIC: &[u8; 4] = b"BSRD";
const REDO_ENTRY_SIZE: usize = 8 + PAGE_SIZE;

/// Hook run before every flush writes pages.
///
/// The store installs one that syncs the journal, so no index page ever
/// reaches disk ahead of the journal records it reflects.
pub type BeforeFlush = Box<dyn Fn() -> IndexResult<()> + Send + Sync>;

/// Page file configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFileConfig {
    /// Dirty page count that triggers a flush on commit
    pub write_batch_size: usize,
    /// Hand batch flushes to a background writer instead of the committer
    pub enable_async_writes: bool,
    /// Fsync the redo and page files during a flush
    pub sync_writes: bool,
}

impl Default for PageFileConfig {
    fn default() -> Self {
        PageFileConfig {
            write_batch_size: 1000,
            enable_async_writes: false,
            sync_writes: true,
        }
    }
}

impl PageFileConfig {
    /// Small batches, no fsync.
    pub fn for_testing() -> Self {
        PageFileConfig {
            write_batch_size: 64,
            enable_async_writes: false,
            sync_writes: false,
        }
    }
}

/// Snapshot of page file counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexCounters {
    /// Pages in the file, including free ones
    pub page_count: u64,
    /// Pages available for allocation
    pub free_pages: u64,
    /// Committed pages not yet flushed
    pub dirty_pages: u64,
    /// Completed flushes
    pub flushes: u64,
    /// Page images written in place
    pub pages_written: u64,
}

pub(crate) struct PageState {
    pub(crate) page_count: u64,
    pub(crate) free: BTreeSet<PageId>,
    pub(crate) dirty: BTreeMap<PageId, Arc<[u8]>>,
}

struct WriterSignal {
    pending: bool,
    shutdown: bool,
}

pub(crate) struct Inner {
    dir: PathBuf,
    config: PageFileConfig,
    pub(crate) state: Mutex<PageState>,
    file: Mutex<Option<File>>,
    flush_lock: Mutex<()>,
    before_flush: RwLock<Option<BeforeFlush>>,
    signal: Mutex<WriterSignal>,
    work_ready: Condvar,
    abandoned: AtomicBool,
    flushes: AtomicU64,
    pages_written: AtomicU64,
}

/// Paged index file.
///
/// Pages are read and written through [`PageTx`]; committed images become
/// durable on the next flush.
pub struct PageFile {
    inner: Arc<Inner>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PageFile {
    /// Open (or create) the page file in `dir`, replaying a complete redo
    /// file first.
    pub fn open(dir: impl AsRef<Path>, config: PageFileConfig) -> IndexResult<PageFile> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(DATA_FILE_NAME))?;

        let replayed = replay_redo(&dir, &mut file)?;

        let file_len = file.metadata()?.len();
        let page_count = file_len / PAGE_SIZE as u64;
        if file_len % PAGE_SIZE as u64 != 0 {
            warn!(
                target: "brokerstore::index",
                file_len,
                "Page file length is not a multiple of the page size; ignoring partial page"
            );
        }
        let free = scan_free_pages(&mut file, page_count)?;

        info!(
            target: "brokerstore::index",
            dir = %dir.display(),
            page_count,
            free_pages = free.len(),
            redo_pages = replayed,
            "Opened page file"
        );

        let inner = Arc::new(Inner {
            dir,
            config: config.clone(),
            state: Mutex::new(PageState {
                page_count,
                free,
                dirty: BTreeMap::new(),
            }),
            file: Mutex::new(Some(file)),
            flush_lock: Mutex::new(()),
            before_flush: RwLock::new(None),
            signal: Mutex::new(WriterSignal {
                pending: false,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            abandoned: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
            pages_written: AtomicU64::new(0),
        });

        let writer = if config.enable_async_writes {
            let thread_inner = Arc::clone(&inner);
            Some(
                std::thread::Builder::new()
                    .name("brokerstore-index-writer".to_string())
                    .spawn(move || writer_loop(thread_inner))?,
            )
        } else {
            None
        };

        Ok(PageFile {
            inner,
            writer: Mutex::new(writer),
        })
    }

    /// Remove the page and redo files from `dir`.
    pub fn destroy(dir: impl AsRef<Path>) -> IndexResult<()> {
        let dir = dir.as_ref();
        for name in [DATA_FILE_NAME, REDO_FILE_NAME] {
            let path = dir.join(name);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Directory holding the files.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Install the hook run before each flush.
    pub fn set_before_flush(&self, hook: BeforeFlush) {
        *self.inner.before_flush.write() = Some(hook);
    }

    /// Begin a page transaction.
    pub fn tx(&self) -> PageTx {
        PageTx::new(Arc::clone(&self.inner))
    }

    /// Number of pages, free ones included.
    pub fn page_count(&self) -> u64 {
        self.inner.state.lock().page_count
    }

    /// True when no page has ever been allocated.
    pub fn is_empty(&self) -> bool {
        self.page_count() == 0
    }

    /// Write every committed page to disk.
    pub fn flush(&self) -> IndexResult<()> {
        self.inner.flush()
    }

    /// Snapshot of counters.
    pub fn counters(&self) -> IndexCounters {
        let (page_count, free_pages, dirty_pages) = {
            let state = self.inner.state.lock();
            (
                state.page_count,
                state.free.len() as u64,
                state.dirty.len() as u64,
            )
        };
        IndexCounters {
            page_count,
            free_pages,
            dirty_pages,
            flushes: self.inner.flushes.load(Ordering::Relaxed),
            pages_written: self.inner.pages_written.load(Ordering::Relaxed),
        }
    }

    /// Flush and close. Later transactions fail with [`IndexError::Closed`].
    pub fn close(&self) -> IndexResult<()> {
        self.stop_writer();
        if self.inner.file.lock().is_none() {
            return Ok(());
        }
        let result = if self.inner.abandoned.load(Ordering::Acquire) {
            Ok(())
        } else {
            self.inner.flush()
        };
        self.inner.file.lock().take();
        debug!(target: "brokerstore::index", dir = %self.inner.dir.display(), "Closed page file");
        result
    }

    /// Drop every unflushed page and close without writing, as if the
    /// process had died.
    #[doc(hidden)]
    pub fn abandon(&self) {
        self.inner.abandoned.store(true, Ordering::Release);
        self.stop_writer();
        self.inner.state.lock().dirty.clear();
        self.inner.file.lock().take();
    }

    fn stop_writer(&self) {
        if let Some(handle) = self.writer.lock().take() {
            self.inner.signal.lock().shutdown = true;
            self.inner.work_ready.notify_all();
            if handle.join().is_err() {
                error!(target: "brokerstore::index", "Index writer thread panicked");
            }
        }
    }
}

impl Drop for PageFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(target: "brokerstore::index", error = %e, "Failed to close page file on drop");
        }
    }
}

impl Inner {
    /// Read the current committed image of a page.
    pub(crate) fn read_page(&self, page_id: PageId) -> IndexResult<Arc<[u8]>> {
        {
            let state = self.state.lock();
            if page_id >= state.page_count {
                return Err(IndexError::corrupt(page_id, "page beyond end of file"));
            }
            if let Some(image) = state.dirty.get(&page_id) {
                return Ok(Arc::clone(image));
            }
        }

        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(IndexError::Closed)?;
        let offset = page_id * PAGE_SIZE as u64;
        if offset + PAGE_SIZE as u64 > file.metadata()?.len() {
            // Allocated but never written: reads as free.
            return Ok(Arc::from(free_page()));
        }
        let mut buf = vec![0u8; PAGE_SIZE];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(Arc::from(buf.into_boxed_slice()))
    }

    pub(crate) fn ensure_open(&self) -> IndexResult<()> {
        if self.file.lock().is_none() {
            return Err(IndexError::Closed);
        }
        Ok(())
    }

    /// Called after a commit published its pages.
    pub(crate) fn after_commit(&self, dirty_pages: usize) -> IndexResult<()> {
        if dirty_pages < self.config.write_batch_size {
            return Ok(());
        }
        if self.config.enable_async_writes {
            self.signal.lock().pending = true;
            self.work_ready.notify_one();
            Ok(())
        } else {
            self.flush()
        }
    }

    fn flush(&self) -> IndexResult<()> {
        let _flush = self.flush_lock.lock();
        let batch: Vec<(PageId, Arc<[u8]>)> = {
            let state = self.state.lock();
            state
                .dirty
                .iter()
                .map(|(&id, image)| (id, Arc::clone(image)))
                .collect()
        };
        if batch.is_empty() {
            return Ok(());
        }
        self.ensure_open()?;
        let started = Instant::now();

        if let Some(hook) = self.before_flush.read().as_ref() {
            hook()?;
        }

        write_redo(&self.dir, &batch, self.config.sync_writes)?;
        {
            let mut guard = self.file.lock();
            let file = guard.as_mut().ok_or(IndexError::Closed)?;
            for (page_id, image) in &batch {
                file.seek(SeekFrom::Start(page_id * PAGE_SIZE as u64))?;
                file.write_all(image)?;
            }
            if self.config.sync_writes {
                file.sync_data()?;
            }
        }
        truncate_redo(&self.dir)?;

        {
            let mut state = self.state.lock();
            for (page_id, image) in &batch {
                if state
                    .dirty
                    .get(page_id)
                    .is_some_and(|current| Arc::ptr_eq(current, image))
                {
                    state.dirty.remove(page_id);
                }
            }
        }

        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.pages_written
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        debug!(
            target: "brokerstore::index",
            pages = batch.len(),
            duration_us = started.elapsed().as_micros() as u64,
            "Flushed index pages"
        );
        Ok(())
    }
}

fn writer_loop(inner: Arc<Inner>) {
    loop {
        let shutdown = {
            let mut signal = inner.signal.lock();
            while !signal.pending && !signal.shutdown {
                inner.work_ready.wait(&mut signal);
            }
            signal.pending = false;
            signal.shutdown
        };
        if shutdown {
            break;
        }
        if let Err(e) = inner.flush() {
            error!(target: "brokerstore::index", error = %e, "Background index flush failed");
        }
    }
}

fn scan_free_pages(file: &mut File, page_count: u64) -> IndexResult<BTreeSet<PageId>> {
    let mut free = BTreeSet::new();
    let mut kind = [0u8; 1];
    for page_id in 0..page_count {
        file.seek(SeekFrom::Start(page_id * PAGE_SIZE as u64))?;
        file.read_exact(&mut kind)?;
        match peek_kind(&kind) {
            Some(PageKind::Free) => {
                free.insert(page_id);
            }
            Some(_) => {}
            None => return Err(IndexError::corrupt(page_id, "unknown page kind")),
        }
    }
    Ok(free)
}

fn write_redo(dir: &Path, batch: &[(PageId, Arc<[u8]>)], sync: bool) -> IndexResult<()> {
    let mut buf = Vec::with_capacity(8 + batch.len() * REDO_ENTRY_SIZE + 4);
    buf.extend_from_slice(REDO_MAGIC);
    buf.extend_from_slice(&(batch.len() as u32).to_le_bytes());
    for (page_id, image) in batch {
        buf.extend_from_slice(&page_id.to_le_bytes());
        buf.extend_from_slice(image);
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());

    let mut file = File::create(dir.join(REDO_FILE_NAME))?;
    file.write_all(&buf)?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

fn truncate_redo(dir: &Path) -> IndexResult<()> {
    File::create(dir.join(REDO_FILE_NAME))?;
    Ok(())
}

/// Apply a complete redo file to `file`. Returns the pages restored.
fn replay_redo(dir: &Path, file: &mut File) -> IndexResult<usize> {
    let path = dir.join(REDO_FILE_NAME);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    if data.is_empty() {
        return Ok(0);
    }

    let entries = match parse_redo(&data) {
        Some(entries) => entries,
        None => {
            warn!(
                target: "brokerstore::index",
                bytes = data.len(),
                "Discarding incomplete redo file"
            );
            truncate_redo(dir)?;
            return Ok(0);
        }
    };

    for &(page_id, image) in &entries {
        file.seek(SeekFrom::Start(page_id * PAGE_SIZE as u64))?;
        file.write_all(image)?;
    }
    file.sync_data()?;
    truncate_redo(dir)?;
    info!(
        target: "brokerstore::index",
        pages = entries.len(),
        "Replayed redo file"
    );
    Ok(entries.len())
}

fn parse_redo(data: &[u8]) -> Option<Vec<(PageId, &[u8])>> {
    if data.len() < 12 || &data[0..4] != REDO_MAGIC {
        return None;
    }
    let count = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let body_end = 8 + count.checked_mul(REDO_ENTRY_SIZE)?;
    if data.len() != body_end + 4 {
        return None;
    }
    let stored = u32::from_le_bytes([
        data[body_end],
        data[body_end + 1],
        data[body_end + 2],
        data[body_end + 3],
    ]);
    if crc32fast::hash(&data[..body_end]) != stored {
        return None;
    }

    let mut entries = Vec::with_capacity(count);
    for chunk in data[8..body_end].chunks_exact(REDO_ENTRY_SIZE) {
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&chunk[..8]);
        entries.push((u64::from_le_bytes(id_bytes), &chunk[8..]));
    }
    Some(entries)
}
