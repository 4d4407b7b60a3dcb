//! Page transactions.
//!
//! A [`PageTx`] buffers page writes, allocations and frees. Nothing is
//! visible outside the transaction until [`PageTx::commit`] publishes the
//! images into the page file's dirty map in one step. Dropping an
//! uncommitted transaction rolls it back.

use crate::error::{IndexError, IndexResult};
use crate::page::{
    decode_page, encode_page, free_page, PageId, PageKind, NO_PAGE, PAGE_PAYLOAD_SIZE,
};
use crate::page_file::Inner;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A unit of atomic page updates.
pub struct PageTx {
    inner: Arc<Inner>,
    writes: BTreeMap<PageId, Arc<[u8]>>,
    allocated: BTreeSet<PageId>,
    freed: BTreeSet<PageId>,
    finished: bool,
}

impl PageTx {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        PageTx {
            inner,
            writes: BTreeMap::new(),
            allocated: BTreeSet::new(),
            freed: BTreeSet::new(),
            finished: false,
        }
    }

    /// Reserve a page. The lowest free page is reused before the file grows.
    pub fn allocate(&mut self) -> IndexResult<PageId> {
        self.inner.ensure_open()?;
        let mut state = self.inner.state.lock();
        let page_id = match state.free.pop_first() {
            Some(id) => id,
            None => {
                let id = state.page_count;
                state.page_count += 1;
                id
            }
        };
        drop(state);
        self.allocated.insert(page_id);
        Ok(page_id)
    }

    /// Free the entity chain starting at `page_id`.
    pub fn free(&mut self, page_id: PageId) -> IndexResult<()> {
        for id in self.chain(page_id)? {
            self.writes.remove(&id);
            self.freed.insert(id);
        }
        self.writes.remove(&page_id);
        self.freed.insert(page_id);
        Ok(())
    }

    /// Load the entity stored at `page_id`.
    pub fn load<T: DeserializeOwned>(&self, page_id: PageId) -> IndexResult<T> {
        let bytes = self.read_entity(page_id)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Store `value` at `page_id`, reusing and extending its overflow chain.
    pub fn store<T: Serialize>(&mut self, page_id: PageId, value: &T) -> IndexResult<()> {
        let bytes = bincode::serialize(value)?;
        let mut chunks: Vec<&[u8]> = bytes.chunks(PAGE_PAYLOAD_SIZE).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }

        let mut spare = self.chain(page_id)?.into_iter();
        let mut ids = vec![page_id];
        for _ in 1..chunks.len() {
            let next = match spare.next() {
                Some(id) => id,
                None => self.allocate()?,
            };
            ids.push(next);
        }
        let leftovers: Vec<PageId> = spare.collect();

        for (i, chunk) in chunks.iter().enumerate() {
            let kind = if i == 0 {
                PageKind::Data
            } else {
                PageKind::Overflow
            };
            let next = ids.get(i + 1).copied().unwrap_or(NO_PAGE);
            self.writes
                .insert(ids[i], Arc::from(encode_page(kind, next, chunk)));
            self.freed.remove(&ids[i]);
        }
        for id in leftovers {
            self.writes.remove(&id);
            self.freed.insert(id);
        }
        Ok(())
    }

    /// Pages this transaction will write on commit.
    pub fn pending_writes(&self) -> usize {
        self.writes.len() + self.freed.len()
    }

    /// Publish every write. Triggers a flush when the dirty set reaches the
    /// configured batch size.
    pub fn commit(mut self) -> IndexResult<()> {
        self.inner.ensure_open()?;
        self.finished = true;
        let writes = std::mem::take(&mut self.writes);
        let freed = std::mem::take(&mut self.freed);
        let dirty_pages = {
            let mut state = self.inner.state.lock();
            for (id, image) in writes {
                state.dirty.insert(id, image);
            }
            if !freed.is_empty() {
                let blank: Arc<[u8]> = Arc::from(free_page());
                for id in freed {
                    state.dirty.insert(id, Arc::clone(&blank));
                    state.free.insert(id);
                }
            }
            state.dirty.len()
        };
        self.allocated.clear();
        self.inner.after_commit(dirty_pages)
    }

    /// Discard every write and return allocated pages.
    pub fn rollback(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.writes.clear();
        self.freed.clear();
        if !self.allocated.is_empty() {
            let mut state = self.inner.state.lock();
            state.free.extend(std::mem::take(&mut self.allocated));
        }
    }

    fn read(&self, page_id: PageId) -> IndexResult<Arc<[u8]>> {
        if self.freed.contains(&page_id) {
            return Err(IndexError::corrupt(page_id, "page freed in this transaction"));
        }
        match self.writes.get(&page_id) {
            Some(image) => Ok(Arc::clone(image)),
            None => self.inner.read_page(page_id),
        }
    }

    /// Overflow pages following the head at `page_id`. Empty when the page
    /// holds no entity yet.
    fn chain(&self, page_id: PageId) -> IndexResult<Vec<PageId>> {
        let head = self.read(page_id)?;
        let (header, _) = decode_page(&head).map_err(|f| IndexError::from_fault(page_id, f))?;
        if header.kind != PageKind::Data {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut next = header.next;
        while next != NO_PAGE {
            if ids.contains(&next) || next == page_id {
                return Err(IndexError::corrupt(page_id, "cycle in overflow chain"));
            }
            let image = self.read(next)?;
            let (h, _) = decode_page(&image).map_err(|f| IndexError::from_fault(next, f))?;
            if h.kind != PageKind::Overflow {
                return Err(IndexError::corrupt(next, "expected overflow page"));
            }
            ids.push(next);
            next = h.next;
        }
        Ok(ids)
    }

    fn read_entity(&self, page_id: PageId) -> IndexResult<Vec<u8>> {
        let head = self.read(page_id)?;
        let (header, payload) =
            decode_page(&head).map_err(|f| IndexError::from_fault(page_id, f))?;
        if header.kind != PageKind::Data {
            return Err(IndexError::corrupt(page_id, "no entity stored at page"));
        }
        let mut bytes = payload.to_vec();
        let mut next = header.next;
        let mut hops = 0u64;
        while next != NO_PAGE {
            hops += 1;
            if hops > self.inner.state.lock().page_count {
                return Err(IndexError::corrupt(page_id, "cycle in overflow chain"));
            }
            let image = self.read(next)?;
            let (h, payload) = decode_page(&image).map_err(|f| IndexError::from_fault(next, f))?;
            if h.kind != PageKind::Overflow {
                return Err(IndexError::corrupt(next, "expected overflow page"));
            }
            bytes.extend_from_slice(payload);
            next = h.next;
        }
        Ok(bytes)
    }
}

impl Drop for PageTx {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use crate::page_file::{PageFile, PageFileConfig};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn open(dir: &std::path::Path) -> PageFile {
        PageFile::open(dir, PageFileConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_store_load_within_tx() {
        let dir = tempdir().unwrap();
        let file = open(dir.path());
        let mut tx = file.tx();
        let page = tx.allocate().unwrap();
        tx.store(page, &vec![1u32, 2, 3]).unwrap();
        assert_eq!(tx.load::<Vec<u32>>(page).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_commit_visible_to_next_tx() {
        let dir = tempdir().unwrap();
        let file = open(dir.path());
        let mut tx = file.tx();
        let page = tx.allocate().unwrap();
        tx.store(page, &"hello".to_string()).unwrap();
        tx.commit().unwrap();

        let tx = file.tx();
        assert_eq!(tx.load::<String>(page).unwrap(), "hello");
    }

    #[test]
    fn test_rollback_discards_writes_and_returns_pages() {
        let dir = tempdir().unwrap();
        let file = open(dir.path());

        let mut tx = file.tx();
        let root = tx.allocate().unwrap();
        tx.store(root, &0u8).unwrap();
        tx.commit().unwrap();

        let mut tx = file.tx();
        let page = tx.allocate().unwrap();
        tx.store(page, &1u8).unwrap();
        tx.store(root, &9u8).unwrap();
        tx.rollback();

        let mut tx = file.tx();
        assert_eq!(tx.load::<u8>(root).unwrap(), 0);
        assert_eq!(tx.allocate().unwrap(), page);
    }

    #[test]
    fn test_drop_without_commit_rolls_back() {
        let dir = tempdir().unwrap();
        let file = open(dir.path());
        {
            let mut tx = file.tx();
            let page = tx.allocate().unwrap();
            tx.store(page, &5u64).unwrap();
        }
        assert_eq!(file.counters().dirty_pages, 0);
        assert_eq!(file.counters().free_pages, 1);
    }

    #[test]
    fn test_large_entity_spans_overflow_pages() {
        let dir = tempdir().unwrap();
        let file = open(dir.path());
        let big: BTreeMap<i64, String> = (0..2000).map(|i| (i, format!("value-{i:06}"))).collect();

        let mut tx = file.tx();
        let page = tx.allocate().unwrap();
        tx.store(page, &big).unwrap();
        tx.commit().unwrap();
        assert!(file.page_count() > 3);
        file.flush().unwrap();
        file.close().unwrap();
        drop(file);

        let file = open(dir.path());
        let tx = file.tx();
        assert_eq!(tx.load::<BTreeMap<i64, String>>(page).unwrap(), big);
    }

    #[test]
    fn test_shrinking_entity_frees_overflow() {
        let dir = tempdir().unwrap();
        let file = open(dir.path());
        let big = vec![7u8; 20_000];

        let mut tx = file.tx();
        let page = tx.allocate().unwrap();
        tx.store(page, &big).unwrap();
        tx.commit().unwrap();
        let used = file.page_count();
        assert_eq!(file.counters().free_pages, 0);

        let mut tx = file.tx();
        tx.store(page, &vec![1u8; 10]).unwrap();
        tx.commit().unwrap();
        assert_eq!(file.page_count(), used);
        assert_eq!(file.counters().free_pages, used - 1);

        let tx = file.tx();
        assert_eq!(tx.load::<Vec<u8>>(page).unwrap(), vec![1u8; 10]);
    }

    #[test]
    fn test_free_returns_chain_at_commit() {
        let dir = tempdir().unwrap();
        let file = open(dir.path());

        let mut tx = file.tx();
        let page = tx.allocate().unwrap();
        tx.store(page, &vec![3u8; 10_000]).unwrap();
        tx.commit().unwrap();
        let used = file.page_count();

        let mut tx = file.tx();
        tx.free(page).unwrap();
        assert!(tx.load::<Vec<u8>>(page).is_err());
        tx.commit().unwrap();
        assert_eq!(file.counters().free_pages, used);

        let tx = file.tx();
        assert!(tx.load::<Vec<u8>>(page).is_err());
    }

    #[test]
    fn test_free_pages_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let file = open(dir.path());
            let mut tx = file.tx();
            let a = tx.allocate().unwrap();
            let b = tx.allocate().unwrap();
            tx.store(a, &1u8).unwrap();
            tx.store(b, &2u8).unwrap();
            tx.commit().unwrap();
            let mut tx = file.tx();
            tx.free(a).unwrap();
            tx.commit().unwrap();
            file.close().unwrap();
        }
        let file = open(dir.path());
        assert_eq!(file.page_count(), 2);
        let mut tx = file.tx();
        assert_eq!(tx.allocate().unwrap(), 0);
        assert_eq!(tx.load::<u8>(1).unwrap(), 2);
    }
}
