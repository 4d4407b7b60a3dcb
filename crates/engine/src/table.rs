//! Ordered tables spread over index pages.
//!
//! A table is a header page listing its leaves by lowest key, plus one
//! page chain per leaf holding a `BTreeMap` slice. Leaves split when they
//! grow past [`MAX_LEAF_ENTRIES`] and are freed when emptied, so a point
//! update rewrites one leaf rather than the whole table.

use brokerstore_storage::{IndexResult, PageId, PageTx};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::ops::Bound;

/// Entries per leaf before it splits.
pub(crate) const MAX_LEAF_ENTRIES: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
struct TableHeader<K> {
    len: u64,
    leaves: Vec<LeafRef<K>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LeafRef<K> {
    low: K,
    page: PageId,
}

/// Handle to a table rooted at a header page.
pub(crate) struct Table<K, V> {
    head: PageId,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for Table<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for Table<K, V> {}

impl<K, V> Table<K, V>
where
    K: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    pub(crate) fn at(head: PageId) -> Self {
        Table {
            head,
            _marker: PhantomData,
        }
    }

    /// Allocate an empty table.
    pub(crate) fn create(tx: &mut PageTx) -> IndexResult<Self> {
        let head = tx.allocate()?;
        tx.store(
            head,
            &TableHeader::<K> {
                len: 0,
                leaves: Vec::new(),
            },
        )?;
        Ok(Table::at(head))
    }

    pub(crate) fn head(&self) -> PageId {
        self.head
    }

    fn header(&self, tx: &PageTx) -> IndexResult<TableHeader<K>> {
        tx.load(self.head)
    }

    pub(crate) fn len(&self, tx: &PageTx) -> IndexResult<u64> {
        Ok(self.header(tx)?.len)
    }

    pub(crate) fn get(&self, tx: &PageTx, key: &K) -> IndexResult<Option<V>> {
        let header = self.header(tx)?;
        let Some(idx) = leaf_index(&header.leaves, key) else {
            return Ok(None);
        };
        let leaf: BTreeMap<K, V> = tx.load(header.leaves[idx].page)?;
        Ok(leaf.get(key).cloned())
    }

    pub(crate) fn contains(&self, tx: &PageTx, key: &K) -> IndexResult<bool> {
        Ok(self.get(tx, key)?.is_some())
    }

    /// Insert or replace. Returns the previous value.
    pub(crate) fn insert(&self, tx: &mut PageTx, key: K, value: V) -> IndexResult<Option<V>> {
        let mut header = self.header(tx)?;
        let mut header_dirty = false;
        if header.leaves.is_empty() {
            let page = tx.allocate()?;
            header.leaves.push(LeafRef {
                low: key.clone(),
                page,
            });
            tx.store(page, &BTreeMap::<K, V>::new())?;
            header_dirty = true;
        }

        let idx = leaf_index(&header.leaves, &key).unwrap_or(0);
        let page = header.leaves[idx].page;
        let mut leaf: BTreeMap<K, V> = tx.load(page)?;
        if idx == 0 && key < header.leaves[0].low {
            header.leaves[0].low = key.clone();
            header_dirty = true;
        }
        let previous = leaf.insert(key, value);
        if previous.is_none() {
            header.len += 1;
            header_dirty = true;
        }

        if leaf.len() > MAX_LEAF_ENTRIES {
            if let Some(split) = leaf.keys().nth(leaf.len() / 2).cloned() {
                let upper = leaf.split_off(&split);
                let upper_page = tx.allocate()?;
                tx.store(upper_page, &upper)?;
                header.leaves.insert(
                    idx + 1,
                    LeafRef {
                        low: split,
                        page: upper_page,
                    },
                );
            }
        }
        tx.store(page, &leaf)?;
        if header_dirty {
            tx.store(self.head, &header)?;
        }
        Ok(previous)
    }

    /// Remove a key. Returns the removed value.
    pub(crate) fn remove(&self, tx: &mut PageTx, key: &K) -> IndexResult<Option<V>> {
        let mut header = self.header(tx)?;
        let Some(idx) = leaf_index(&header.leaves, key) else {
            return Ok(None);
        };
        let page = header.leaves[idx].page;
        let mut leaf: BTreeMap<K, V> = tx.load(page)?;
        let Some(removed) = leaf.remove(key) else {
            return Ok(None);
        };

        header.len = header.len.saturating_sub(1);
        if leaf.is_empty() && header.leaves.len() > 1 {
            tx.free(page)?;
            header.leaves.remove(idx);
        } else {
            tx.store(page, &leaf)?;
        }
        tx.store(self.head, &header)?;
        Ok(Some(removed))
    }

    /// Up to `max` entries within the bounds, in key order.
    pub(crate) fn range(
        &self,
        tx: &PageTx,
        start: Bound<&K>,
        end: Bound<&K>,
        max: usize,
    ) -> IndexResult<Vec<(K, V)>> {
        let mut out = Vec::new();
        if max == 0 || is_empty_range(start, end) {
            return Ok(out);
        }
        let header = self.header(tx)?;
        let first = match start {
            Bound::Included(k) | Bound::Excluded(k) => leaf_index(&header.leaves, k),
            Bound::Unbounded => (!header.leaves.is_empty()).then_some(0),
        };
        let Some(first) = first else {
            return Ok(out);
        };

        for (i, leaf_ref) in header.leaves.iter().enumerate().skip(first) {
            if i > first && past_end(&leaf_ref.low, end) {
                break;
            }
            let leaf: BTreeMap<K, V> = tx.load(leaf_ref.page)?;
            for (k, v) in leaf.range((start, end)) {
                out.push((k.clone(), v.clone()));
                if out.len() >= max {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    /// Every entry, in key order.
    pub(crate) fn entries(&self, tx: &PageTx) -> IndexResult<Vec<(K, V)>> {
        self.range(tx, Bound::Unbounded, Bound::Unbounded, usize::MAX)
    }

    pub(crate) fn first(&self, tx: &PageTx) -> IndexResult<Option<(K, V)>> {
        Ok(self
            .range(tx, Bound::Unbounded, Bound::Unbounded, 1)?
            .into_iter()
            .next())
    }

    pub(crate) fn last(&self, tx: &PageTx) -> IndexResult<Option<(K, V)>> {
        let header = self.header(tx)?;
        for leaf_ref in header.leaves.iter().rev() {
            let leaf: BTreeMap<K, V> = tx.load(leaf_ref.page)?;
            if let Some((k, v)) = leaf.last_key_value() {
                return Ok(Some((k.clone(), v.clone())));
            }
        }
        Ok(None)
    }

    /// Free every page of the table, header included.
    pub(crate) fn destroy(self, tx: &mut PageTx) -> IndexResult<()> {
        let header = self.header(tx)?;
        for leaf_ref in &header.leaves {
            tx.free(leaf_ref.page)?;
        }
        tx.free(self.head)
    }
}

/// Leaf that would hold `key`: the last one whose low key is not above it.
fn leaf_index<K: Ord>(leaves: &[LeafRef<K>], key: &K) -> Option<usize> {
    if leaves.is_empty() {
        return None;
    }
    Some(leaves.partition_point(|l| l.low <= *key).saturating_sub(1))
}

fn past_end<K: Ord>(low: &K, end: Bound<&K>) -> bool {
    match end {
        Bound::Included(e) => low > e,
        Bound::Excluded(e) => low >= e,
        Bound::Unbounded => false,
    }
}

// BTreeMap::range panics on inverted bounds.
fn is_empty_range<K: Ord>(start: Bound<&K>, end: Bound<&K>) -> bool {
    match (start, end) {
        (Bound::Included(s), Bound::Included(e)) => s > e,
        (Bound::Included(s), Bound::Excluded(e))
        | (Bound::Excluded(s), Bound::Included(e))
        | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
        _ => false,
    }
}
