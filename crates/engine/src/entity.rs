//! Index entities: the root and per-queue destinations.
//!
//! Entities live in index pages and refer to each other by page id only.
//! The root sits at page 0 and holds the page ids of every top-level table;
//! each destination owns two tables of its own.
//!
//! # Tables
//!
//! | Owner | Table | Key -> Value |
//! |-------|-------|--------------|
//! | root | messages | message key -> journal location of its `MessageAdd` |
//! | root | message refs | message key -> number of queue entries referencing it |
//! | root | destinations | queue name -> destination page |
//! | root | maps | map name -> map table page |
//! | root | subscriptions | subscription name -> record |
//! | destination | entries | queue key -> entry and its location |
//! | destination | by message | message key -> queue key |

use crate::table::Table;
use brokerstore_core::{
    Location, MessageRecord, QueueDescriptor, QueueQueryResult, QueueRecord, StoreError,
    StoreResult, StoreState, SubscriptionRecord,
};
use brokerstore_storage::{PageId, PageTx};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use tracing::{debug, warn};

/// Page holding the root entity.
pub const ROOT_PAGE: PageId = 0;

type MapTable = Table<String, Vec<u8>>;

/// Singleton entity at page 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootEntity {
    /// `Open` while a process uses the store
    pub state: StoreState,
    /// Location of the last journal record reflected in the index
    pub last_applied: Option<Location>,
    /// Highest store tracking number handed out before the last checkpoint
    pub tracking_high_water: i64,
    messages: PageId,
    message_refs: PageId,
    destinations: PageId,
    maps: PageId,
    subscriptions: PageId,
}

impl RootEntity {
    /// Initialize a fresh index. The root must land on page 0.
    pub fn allocate(tx: &mut PageTx) -> StoreResult<RootEntity> {
        let page = tx.allocate()?;
        if page != ROOT_PAGE {
            return Err(StoreError::fatal(format!(
                "root entity allocated at page {page} of a non-empty index"
            )));
        }
        let root = RootEntity {
            state: StoreState::Closed,
            last_applied: None,
            tracking_high_water: 0,
            messages: Table::<i64, Location>::create(tx)?.head(),
            message_refs: Table::<i64, u32>::create(tx)?.head(),
            destinations: Table::<String, PageId>::create(tx)?.head(),
            maps: Table::<String, PageId>::create(tx)?.head(),
            subscriptions: Table::<String, SubscriptionRecord>::create(tx)?.head(),
        };
        root.save(tx)?;
        Ok(root)
    }

    /// Load the root from page 0.
    pub fn load(tx: &PageTx) -> StoreResult<RootEntity> {
        Ok(tx.load(ROOT_PAGE)?)
    }

    /// Write the root to page 0.
    pub fn save(&self, tx: &mut PageTx) -> StoreResult<()> {
        Ok(tx.store(ROOT_PAGE, self)?)
    }

    /// Move the watermark forward. Never moves it back.
    pub fn advance(&mut self, location: Location) {
        if self.last_applied.map_or(true, |current| location > current) {
            self.last_applied = Some(location);
        }
    }

    fn messages(&self) -> Table<i64, Location> {
        Table::at(self.messages)
    }

    fn message_refs(&self) -> Table<i64, u32> {
        Table::at(self.message_refs)
    }

    fn destinations(&self) -> Table<String, PageId> {
        Table::at(self.destinations)
    }

    fn maps(&self) -> Table<String, PageId> {
        Table::at(self.maps)
    }

    fn subscriptions(&self) -> Table<String, SubscriptionRecord> {
        Table::at(self.subscriptions)
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Index a message at `location`. Returns false when a duplicate was
    /// tolerated during recovery.
    pub fn message_add(
        &self,
        tx: &mut PageTx,
        record: &MessageRecord,
        location: Location,
        recovering: bool,
    ) -> StoreResult<bool> {
        if self.messages().contains(tx, &record.key)? {
            if recovering {
                debug!(
                    target: "brokerstore::recovery",
                    key = record.key,
                    %location,
                    "Skipping duplicate message"
                );
                return Ok(false);
            }
            return Err(StoreError::duplicate(format!("message key {}", record.key)));
        }
        self.messages().insert(tx, record.key, location)?;
        Ok(true)
    }

    /// Journal location of a message.
    pub fn message_location(&self, tx: &PageTx, key: i64) -> StoreResult<Option<Location>> {
        Ok(self.messages().get(tx, &key)?)
    }

    /// Number of indexed messages.
    pub fn message_count(&self, tx: &PageTx) -> StoreResult<u64> {
        Ok(self.messages().len(tx)?)
    }

    /// Queue entries referencing a message.
    pub fn message_refs_of(&self, tx: &PageTx, key: i64) -> StoreResult<u32> {
        Ok(self.message_refs().get(tx, &key)?.unwrap_or(0))
    }

    /// Count one more queue entry referencing `key`.
    pub fn add_message_ref(&self, tx: &mut PageTx, key: i64) -> StoreResult<u32> {
        let count = self.message_refs().get(tx, &key)?.unwrap_or(0) + 1;
        self.message_refs().insert(tx, key, count)?;
        Ok(count)
    }

    /// Drop one reference. The message leaves the index with its last one.
    pub fn remove_message_ref(&self, tx: &mut PageTx, key: i64) -> StoreResult<u32> {
        let remaining = self
            .message_refs()
            .get(tx, &key)?
            .unwrap_or(0)
            .saturating_sub(1);
        if remaining == 0 {
            self.message_refs().remove(tx, &key)?;
            self.messages().remove(tx, &key)?;
        } else {
            self.message_refs().insert(tx, key, remaining)?;
        }
        Ok(remaining)
    }

    // ========================================================================
    // Queues
    // ========================================================================

    /// Create a queue. An existing name is left untouched.
    pub fn queue_add(&self, tx: &mut PageTx, descriptor: &QueueDescriptor) -> StoreResult<bool> {
        if self.destinations().contains(tx, &descriptor.name)? {
            debug!(target: "brokerstore::store", queue = %descriptor.name, "Queue already exists");
            return Ok(false);
        }
        let destination = DestinationEntity::create(tx, descriptor.clone())?;
        self.destinations()
            .insert(tx, descriptor.name.clone(), destination.page)?;
        Ok(true)
    }

    /// Drop a queue, releasing the message references of its entries.
    pub fn queue_remove(&self, tx: &mut PageTx, name: &str) -> StoreResult<bool> {
        let Some(destination) = self.destination(tx, name)? else {
            return Ok(false);
        };
        for (_, entry) in destination.entries().entries(tx)? {
            self.remove_message_ref(tx, entry.record.message_key)?;
        }
        destination.destroy(tx)?;
        self.destinations().remove(tx, &name.to_string())?;
        Ok(true)
    }

    /// Look up a queue.
    pub fn destination(&self, tx: &PageTx, name: &str) -> StoreResult<Option<DestinationEntity>> {
        match self.destinations().get(tx, &name.to_string())? {
            Some(page) => Ok(Some(DestinationEntity::load(tx, page)?)),
            None => Ok(None),
        }
    }

    /// Top-level queues from `first` on (inclusive), optionally of one type,
    /// each with its partitions.
    pub fn queue_list(
        &self,
        tx: &PageTx,
        type_filter: Option<i16>,
        first: Option<&str>,
        max: usize,
    ) -> StoreResult<Vec<QueueQueryResult>> {
        let mut top_level = Vec::new();
        let mut partitions: BTreeMap<String, Vec<QueueQueryResult>> = BTreeMap::new();
        for (_, page) in self.destinations().entries(tx)? {
            let destination = DestinationEntity::load(tx, page)?;
            let summary = destination.query_result(tx)?;
            match &destination.descriptor.parent {
                Some(parent) => partitions.entry(parent.clone()).or_default().push(summary),
                None => top_level.push(summary),
            }
        }

        Ok(top_level
            .into_iter()
            .filter(|q| first.map_or(true, |f| q.descriptor.name.as_str() >= f))
            .filter(|q| type_filter.map_or(true, |t| q.descriptor.queue_type == t))
            .take(max)
            .map(|mut q| {
                if let Some(children) = partitions.remove(&q.descriptor.name) {
                    q.partitions = children;
                }
                q
            })
            .collect())
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Add or replace a subscription.
    pub fn subscription_put(&self, tx: &mut PageTx, record: &SubscriptionRecord) -> StoreResult<()> {
        self.subscriptions()
            .insert(tx, record.name.clone(), record.clone())?;
        Ok(())
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn subscription_remove(&self, tx: &mut PageTx, name: &str) -> StoreResult<bool> {
        Ok(self
            .subscriptions()
            .remove(tx, &name.to_string())?
            .is_some())
    }

    /// Look up a subscription.
    pub fn subscription_get(
        &self,
        tx: &PageTx,
        name: &str,
    ) -> StoreResult<Option<SubscriptionRecord>> {
        Ok(self.subscriptions().get(tx, &name.to_string())?)
    }

    /// Every subscription, by name.
    pub fn subscription_list(&self, tx: &PageTx) -> StoreResult<Vec<SubscriptionRecord>> {
        Ok(self
            .subscriptions()
            .entries(tx)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    // ========================================================================
    // Maps
    // ========================================================================

    fn map(&self, tx: &PageTx, name: &str) -> StoreResult<Option<MapTable>> {
        Ok(self.maps().get(tx, &name.to_string())?.map(Table::at))
    }

    fn existing_map(&self, tx: &PageTx, name: &str) -> StoreResult<MapTable> {
        self.map(tx, name)?
            .ok_or_else(|| StoreError::not_found(format!("map {name}")))
    }

    /// Create a map. An existing name is left untouched.
    pub fn map_add(&self, tx: &mut PageTx, name: &str) -> StoreResult<bool> {
        if self.maps().contains(tx, &name.to_string())? {
            return Ok(false);
        }
        let table = MapTable::create(tx)?;
        self.maps().insert(tx, name.to_string(), table.head())?;
        Ok(true)
    }

    /// Drop a map and all its entries.
    pub fn map_remove(&self, tx: &mut PageTx, name: &str) -> StoreResult<bool> {
        match self.maps().remove(tx, &name.to_string())? {
            Some(head) => {
                MapTable::at(head).destroy(tx)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Put an entry, creating the map when it does not exist yet.
    pub fn map_put(&self, tx: &mut PageTx, map: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        self.map_add(tx, map)?;
        let table = self.existing_map(tx, map)?;
        table.insert(tx, key.to_string(), value.to_vec())?;
        Ok(())
    }

    /// Remove an entry. Missing map or key is `KeyNotFound`.
    pub fn map_remove_entry(&self, tx: &mut PageTx, map: &str, key: &str) -> StoreResult<()> {
        let table = self.existing_map(tx, map)?;
        match table.remove(tx, &key.to_string())? {
            Some(_) => Ok(()),
            None => Err(StoreError::not_found(format!("map {map} key {key}"))),
        }
    }

    /// Value of an entry.
    pub fn map_get(&self, tx: &PageTx, map: &str, key: &str) -> StoreResult<Vec<u8>> {
        self.existing_map(tx, map)?
            .get(tx, &key.to_string())?
            .ok_or_else(|| StoreError::not_found(format!("map {map} key {key}")))
    }

    /// Map names from `first` on (inclusive).
    pub fn map_list(&self, tx: &PageTx, first: Option<&str>, max: usize) -> StoreResult<Vec<String>> {
        let first = first.map(str::to_string);
        Ok(self
            .maps()
            .range(tx, lower(first.as_ref()), Bound::Unbounded, max)?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    /// Entry keys of a map from `first` on (inclusive).
    pub fn map_list_keys(
        &self,
        tx: &PageTx,
        map: &str,
        first: Option<&str>,
        max: usize,
    ) -> StoreResult<Vec<String>> {
        let table = self.existing_map(tx, map)?;
        let first = first.map(str::to_string);
        Ok(table
            .range(tx, lower(first.as_ref()), Bound::Unbounded, max)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    // ========================================================================
    // Recovery and cleanup
    // ========================================================================

    /// Undo index entries pointing past the end of the journal.
    ///
    /// `end` is the last valid journal record; `None` means the journal is
    /// empty and every located entry is undone. Returns the number undone.
    pub fn recover_index(&mut self, tx: &mut PageTx, end: Option<Location>) -> StoreResult<u64> {
        let beyond = |location: &Location| end.map_or(true, |e| *location > e);
        let mut undone = 0u64;

        for (key, location) in self.messages().entries(tx)? {
            if beyond(&location) {
                self.messages().remove(tx, &key)?;
                self.message_refs().remove(tx, &key)?;
                undone += 1;
            }
        }

        for (_, page) in self.destinations().entries(tx)? {
            let mut destination = DestinationEntity::load(tx, page)?;
            for (queue_key, entry) in destination.entries().entries(tx)? {
                if beyond(&entry.location) {
                    destination.remove_queue_key(tx, queue_key)?;
                    let key = entry.record.message_key;
                    let remaining = self.message_refs_of(tx, key)?.saturating_sub(1);
                    if remaining == 0 {
                        self.message_refs().remove(tx, &key)?;
                    } else {
                        self.message_refs().insert(tx, key, remaining)?;
                    }
                    undone += 1;
                }
            }
        }

        if let Some(watermark) = self.last_applied {
            if beyond(&watermark) {
                warn!(
                    target: "brokerstore::recovery",
                    %watermark,
                    journal_end = ?end,
                    "Index watermark is past the end of the journal; resetting it"
                );
                self.last_applied = end;
            }
        }
        Ok(undone)
    }

    /// Remove from `candidates` every segment the index still needs: those
    /// holding a live message or queue entry, and the watermark's segment
    /// and everything after it.
    pub fn remove_gc_candidates(
        &self,
        tx: &PageTx,
        candidates: &mut BTreeSet<u32>,
    ) -> StoreResult<()> {
        match self.last_applied {
            Some(watermark) => candidates.retain(|&id| id < watermark.segment_id),
            None => candidates.clear(),
        }
        if candidates.is_empty() {
            return Ok(());
        }

        for (_, location) in self.messages().entries(tx)? {
            candidates.remove(&location.segment_id);
        }
        for (_, page) in self.destinations().entries(tx)? {
            if candidates.is_empty() {
                break;
            }
            let destination = DestinationEntity::load(tx, page)?;
            for (_, entry) in destination.entries().entries(tx)? {
                candidates.remove(&entry.location.segment_id);
            }
        }
        Ok(())
    }
}

fn lower(first: Option<&String>) -> Bound<&String> {
    match first {
        Some(f) => Bound::Included(f),
        None => Bound::Unbounded,
    }
}

/// One queue entry and the location of the record that added it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct QueueEntry {
    pub(crate) record: QueueRecord,
    pub(crate) location: Location,
}

/// Per-queue state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationEntity {
    #[serde(skip)]
    page: PageId,
    descriptor: QueueDescriptor,
    entries: PageId,
    by_message: PageId,
    count: u64,
    size: i64,
}

impl DestinationEntity {
    fn create(tx: &mut PageTx, descriptor: QueueDescriptor) -> StoreResult<DestinationEntity> {
        let page = tx.allocate()?;
        let destination = DestinationEntity {
            page,
            descriptor,
            entries: Table::<i64, QueueEntry>::create(tx)?.head(),
            by_message: Table::<i64, i64>::create(tx)?.head(),
            count: 0,
            size: 0,
        };
        destination.save(tx)?;
        Ok(destination)
    }

    fn load(tx: &PageTx, page: PageId) -> StoreResult<DestinationEntity> {
        let mut destination: DestinationEntity = tx.load(page)?;
        destination.page = page;
        Ok(destination)
    }

    fn save(&self, tx: &mut PageTx) -> StoreResult<()> {
        Ok(tx.store(self.page, self)?)
    }

    fn entries(&self) -> Table<i64, QueueEntry> {
        Table::at(self.entries)
    }

    fn by_message(&self) -> Table<i64, i64> {
        Table::at(self.by_message)
    }

    /// Queue descriptor.
    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    /// Number of entries.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of entry sizes.
    pub fn size(&self) -> i64 {
        self.size
    }

    /// Add an entry. An existing queue key is `DuplicateKey`.
    pub fn add(&mut self, tx: &mut PageTx, record: &QueueRecord, location: Location) -> StoreResult<()> {
        if self.entries().contains(tx, &record.queue_key)? {
            return Err(StoreError::duplicate(format!(
                "queue key {} in {}",
                record.queue_key, self.descriptor.name
            )));
        }
        self.entries().insert(
            tx,
            record.queue_key,
            QueueEntry {
                record: record.clone(),
                location,
            },
        )?;
        self.by_message()
            .insert(tx, record.message_key, record.queue_key)?;
        self.count += 1;
        self.size += i64::from(record.size);
        self.save(tx)
    }

    /// Remove the entry of a message. Returns whether one existed.
    pub fn remove(&mut self, tx: &mut PageTx, message_key: i64) -> StoreResult<bool> {
        match self.by_message().get(tx, &message_key)? {
            Some(queue_key) => self.remove_queue_key(tx, queue_key),
            None => Ok(false),
        }
    }

    fn remove_queue_key(&mut self, tx: &mut PageTx, queue_key: i64) -> StoreResult<bool> {
        let Some(entry) = self.entries().remove(tx, &queue_key)? else {
            return Ok(false);
        };
        self.by_message().remove(tx, &entry.record.message_key)?;
        self.count = self.count.saturating_sub(1);
        self.size -= i64::from(entry.record.size);
        self.save(tx)?;
        Ok(true)
    }

    /// Whether the queue holds an entry for a message.
    pub fn contains_message(&self, tx: &PageTx, message_key: i64) -> StoreResult<bool> {
        Ok(self.by_message().contains(tx, &message_key)?)
    }

    /// Whether the queue holds an entry at a queue key.
    pub fn contains_queue_key(&self, tx: &PageTx, queue_key: i64) -> StoreResult<bool> {
        Ok(self.entries().contains(tx, &queue_key)?)
    }

    /// Entries with `first_queue_key <= queue key <= max_queue_key`, at most `max`.
    pub fn list(
        &self,
        tx: &PageTx,
        first_queue_key: Option<i64>,
        max_queue_key: Option<i64>,
        max: usize,
    ) -> StoreResult<Vec<QueueRecord>> {
        let start = first_queue_key.as_ref().map_or(Bound::Unbounded, Bound::Included);
        let end = max_queue_key.as_ref().map_or(Bound::Unbounded, Bound::Included);
        Ok(self
            .entries()
            .range(tx, start, end, max)?
            .into_iter()
            .map(|(_, entry)| entry.record)
            .collect())
    }

    /// Summary for queue listings, without partitions.
    pub fn query_result(&self, tx: &PageTx) -> StoreResult<QueueQueryResult> {
        Ok(QueueQueryResult {
            descriptor: self.descriptor.clone(),
            count: self.count,
            size: self.size,
            first_sequence: self.entries().first(tx)?.map(|(k, _)| k),
            last_sequence: self.entries().last(tx)?.map(|(k, _)| k),
            partitions: Vec::new(),
        })
    }

    fn destroy(self, tx: &mut PageTx) -> StoreResult<()> {
        self.entries().destroy(tx)?;
        self.by_message().destroy(tx)?;
        Ok(tx.free(self.page)?)
    }
}
