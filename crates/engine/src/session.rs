//! Sessions: grouped updates against the index.
//!
//! A session holds the engine exclusively. Updates are journaled first and
//! then applied to a page transaction that commits with the session.
//!
//! The first update of a session is held back. A session with a single
//! update journals just that record at commit; its location becomes the
//! watermark. A second update upgrades the session to a unit of work:
//! `BeginUnitOfWork` and the held record are journaled, every later update
//! is journaled and applied as it arrives, and commit journals
//! `EndUnitOfWork`, whose location becomes the watermark.
//!
//! Reads first flush a held update into a unit of work, so they observe
//! everything the session has done.
//!
//! A unit of work that does not commit is always closed with
//! `CancelUnitOfWork`, including after a fatal error. When the journal
//! cannot take that marker, or a record outside a unit was journaled but
//! not indexed, the engine is marked failed and refuses new sessions
//! until it is reopened.

use crate::apply::{apply, load_record};
use crate::entity::RootEntity;
use crate::store::Engine;
use brokerstore_core::{
    Location, MessageRecord, QueueDescriptor, QueueQueryResult, QueueRecord, StoreError,
    StoreResult, SubscriptionRecord,
};
use brokerstore_durability::{
    DurableCallback, Journal, MapEntryPut, MapEntryRemove, MapName, QueueAddMessage, QueueRemove,
    QueueRemoveMessage, Record, SubscriptionRemove,
};
use brokerstore_storage::PageTx;
use parking_lot::MappedRwLockWriteGuard;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Journal and index work slower than this is logged.
const SLOW_STORE: Duration = Duration::from_millis(1000);

/// Read-only view of the index at one point in time.
pub struct StoreReader<'a> {
    journal: &'a Journal,
    tx: &'a PageTx,
    root: &'a RootEntity,
}

impl<'a> StoreReader<'a> {
    pub(crate) fn new(journal: &'a Journal, tx: &'a PageTx, root: &'a RootEntity) -> Self {
        StoreReader { journal, tx, root }
    }

    /// Load a message from the journal.
    pub fn message_get(&self, key: i64) -> StoreResult<MessageRecord> {
        let location = self
            .root
            .message_location(self.tx, key)?
            .ok_or_else(|| StoreError::not_found(format!("message key {key}")))?;
        match load_record(self.journal, location)? {
            Record::MessageAdd(message) if message.key == key => Ok(message),
            other => Err(StoreError::CorruptRecord {
                location: Some(location),
                reason: format!(
                    "expected message {key}, found {:?} record",
                    other.kind()
                ),
            }),
        }
    }

    /// Journal location of a message.
    pub fn message_location(&self, key: i64) -> StoreResult<Option<Location>> {
        self.root.message_location(self.tx, key)
    }

    /// Number of indexed messages.
    pub fn message_count(&self) -> StoreResult<u64> {
        self.root.message_count(self.tx)
    }

    /// Queue entries referencing a message.
    pub fn message_refs(&self, key: i64) -> StoreResult<u32> {
        self.root.message_refs_of(self.tx, key)
    }

    /// Top-level queues from `first` on, each with its partitions.
    pub fn queue_list(&self, first: Option<&str>, max: usize) -> StoreResult<Vec<QueueQueryResult>> {
        self.root.queue_list(self.tx, None, first, max)
    }

    /// Like [`queue_list`](Self::queue_list), restricted to one queue type.
    pub fn queue_list_by_type(
        &self,
        queue_type: i16,
        first: Option<&str>,
        max: usize,
    ) -> StoreResult<Vec<QueueQueryResult>> {
        self.root.queue_list(self.tx, Some(queue_type), first, max)
    }

    /// Summary of one queue.
    pub fn queue_query(&self, queue: &str) -> StoreResult<QueueQueryResult> {
        match self.root.destination(self.tx, queue)? {
            Some(destination) => destination.query_result(self.tx),
            None => Err(StoreError::not_found(format!("queue {queue}"))),
        }
    }

    /// Entries of a queue with queue keys in `first_key..=max_key`.
    pub fn queue_list_messages(
        &self,
        queue: &str,
        first_key: Option<i64>,
        max_key: Option<i64>,
        max: usize,
    ) -> StoreResult<Vec<QueueRecord>> {
        match self.root.destination(self.tx, queue)? {
            Some(destination) => destination.list(self.tx, first_key, max_key, max),
            None => Err(StoreError::not_found(format!("queue {queue}"))),
        }
    }

    /// Look up a subscription.
    pub fn subscription_get(&self, name: &str) -> StoreResult<Option<SubscriptionRecord>> {
        self.root.subscription_get(self.tx, name)
    }

    /// Every subscription, by name.
    pub fn subscription_list(&self) -> StoreResult<Vec<SubscriptionRecord>> {
        self.root.subscription_list(self.tx)
    }

    /// Map names from `first` on.
    pub fn map_list(&self, first: Option<&str>, max: usize) -> StoreResult<Vec<String>> {
        self.root.map_list(self.tx, first, max)
    }

    /// Value of a map entry.
    pub fn map_entry_get(&self, map: &str, key: &str) -> StoreResult<Vec<u8>> {
        self.root.map_get(self.tx, map, key)
    }

    /// Entry keys of a map from `first` on.
    pub fn map_entry_list_keys(
        &self,
        map: &str,
        first: Option<&str>,
        max: usize,
    ) -> StoreResult<Vec<String>> {
        self.root.map_list_keys(self.tx, map, first, max)
    }

    /// Watermark as seen by this view.
    pub fn last_applied(&self) -> Option<Location> {
        self.root.last_applied
    }
}

/// Exclusive handle for grouped updates. Dropping it uncommitted rolls back.
pub struct Session<'a> {
    engine: MappedRwLockWriteGuard<'a, Engine>,
    tx: Option<PageTx>,
    root: RootEntity,
    held: Option<Record>,
    updates: usize,
    in_unit: bool,
    aborted: bool,
}

impl<'a> Session<'a> {
    pub(crate) fn new(engine: MappedRwLockWriteGuard<'a, Engine>) -> Self {
        let tx = engine.index.tx();
        let root = engine.root.clone();
        Session {
            engine,
            tx: Some(tx),
            root,
            held: None,
            updates: 0,
            in_unit: false,
            aborted: false,
        }
    }

    /// Updates added since the last commit or rollback.
    pub fn update_count(&self) -> usize {
        self.updates
    }

    /// Whether a fatal error has disabled this session.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn run<T>(&mut self, op: impl FnOnce(&mut Self) -> StoreResult<T>) -> StoreResult<T> {
        if self.aborted {
            return Err(StoreError::fatal("session aborted by an earlier failure"));
        }
        let result = op(self);
        if let Err(e) = &result {
            if e.is_fatal() {
                self.aborted = true;
                error!(target: "brokerstore::store", error = %e, "Session aborted");
            }
        }
        result
    }

    fn journal(&self, record: &Record, on_flush: Option<DurableCallback>) -> StoreResult<Location> {
        let bytes = record.encode()?;
        Ok(self.engine.journal.append(&bytes, on_flush)?)
    }

    /// Mark the engine failed: the journal is ahead of the index.
    fn fail_store(&mut self, error: StoreError) -> StoreError {
        error!(target: "brokerstore::store", error = %error, "Journal and index diverged; store must be reopened");
        self.engine.failure = Some(error.to_string());
        error
    }

    /// Journal a record and apply it to the session transaction.
    fn store(&mut self, record: &Record, on_flush: Option<DurableCallback>) -> StoreResult<Location> {
        let started = Instant::now();
        let location = self.journal(record, on_flush)?;
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| StoreError::fatal("session has no open transaction"))?;
        if let Err(e) = apply(tx, &mut self.root, record, location, false) {
            let e = if e.is_fatal() {
                e
            } else {
                StoreError::fatal(format!("journaled record at {location} could not be indexed: {e}"))
            };
            // Inside a unit the cancel marker on rollback undoes the record.
            return Err(if self.in_unit { e } else { self.fail_store(e) });
        }

        let elapsed = started.elapsed();
        if elapsed > SLOW_STORE {
            warn!(
                target: "brokerstore::store",
                kind = ?record.kind(),
                %location,
                duration_ms = elapsed.as_millis() as u64,
                "Slow journal update"
            );
        }
        Ok(location)
    }

    /// Journal the held update inside a unit of work.
    fn store_atomic(&mut self) -> StoreResult<()> {
        if let Some(held) = self.held.take() {
            self.journal(&Record::BeginUnitOfWork, None)?;
            self.in_unit = true;
            self.store(&held, None)?;
        }
        Ok(())
    }

    fn reader(&self) -> StoreResult<StoreReader<'_>> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| StoreError::fatal("session has no open transaction"))?;
        Ok(StoreReader::new(&self.engine.journal, tx, &self.root))
    }

    fn read<T>(&mut self, op: impl FnOnce(&StoreReader<'_>) -> StoreResult<T>) -> StoreResult<T> {
        self.run(|session| {
            session.store_atomic()?;
            op(&session.reader()?)
        })
    }

    fn reset(&mut self) {
        self.tx = Some(self.engine.index.tx());
        self.root = self.engine.root.clone();
        self.held = None;
        self.updates = 0;
        self.in_unit = false;
    }

    /// Add a logical update. Control markers are rejected.
    pub fn add_update(&mut self, record: Record) -> StoreResult<()> {
        if record.is_control() {
            return Err(StoreError::InvalidArgument(format!(
                "{:?} is a control marker",
                record.kind()
            )));
        }
        self.run(|session| {
            session.updates += 1;
            if session.updates == 1 && !session.in_unit {
                session.held = Some(record);
                return Ok(());
            }
            session.store_atomic()?;
            if !session.in_unit {
                session.journal(&Record::BeginUnitOfWork, None)?;
                session.in_unit = true;
            }
            session.store(&record, None)?;
            Ok(())
        })
    }

    /// Make every update durable-on-flush and visible.
    ///
    /// `on_flush` fires once the session's final journal record is on
    /// stable storage, or immediately when there was nothing to journal.
    pub fn commit(&mut self, on_flush: Option<DurableCallback>) -> StoreResult<()> {
        self.run(|session| {
            let watermark = if let Some(held) = session.held.take() {
                session.store(&held, on_flush)?
            } else if session.in_unit {
                let end = session.journal(&Record::EndUnitOfWork, on_flush)?;
                session.in_unit = false;
                end
            } else {
                if let Some(callback) = on_flush {
                    callback();
                }
                if let Some(tx) = session.tx.take() {
                    tx.rollback();
                }
                session.reset();
                return Ok(());
            };

            // The session is committed in the journal from here on.
            session.publish(watermark).map_err(|e| session.fail_store(e))?;
            session.reset();
            Ok(())
        })
    }

    fn publish(&mut self, watermark: Location) -> StoreResult<()> {
        self.root.advance(watermark);
        let mut tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::fatal("session has no open transaction"))?;
        self.root.save(&mut tx)?;
        tx.commit()?;
        self.engine.root = self.root.clone();
        Ok(())
    }

    /// Discard every update since the last commit.
    ///
    /// An open unit of work is closed with a cancel marker even when the
    /// session was aborted, so replay never folds later sessions into it.
    pub fn rollback(&mut self) -> StoreResult<()> {
        let cancel = if self.in_unit {
            match self.journal(&Record::CancelUnitOfWork, None) {
                Ok(_) => Ok(()),
                Err(e) => Err(self.fail_store(e)),
            }
        } else {
            Ok(())
        };
        if let Some(tx) = self.tx.take() {
            tx.rollback();
        }
        self.reset();
        cancel
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Add a message. Negative and existing keys are rejected.
    pub fn message_add(&mut self, record: MessageRecord) -> StoreResult<()> {
        if record.key < 0 {
            return Err(StoreError::InvalidArgument(format!(
                "message key {} is negative",
                record.key
            )));
        }
        let exists = self.read(|r| r.message_location(record.key))?.is_some();
        if exists {
            return Err(StoreError::duplicate(format!("message key {}", record.key)));
        }
        self.add_update(Record::MessageAdd(record))
    }

    /// Load a message.
    pub fn message_get(&mut self, key: i64) -> StoreResult<MessageRecord> {
        self.read(|r| r.message_get(key))
    }

    // ========================================================================
    // Queues
    // ========================================================================

    /// Create a queue.
    pub fn queue_add(&mut self, descriptor: QueueDescriptor) -> StoreResult<()> {
        self.add_update(Record::QueueAdd(descriptor))
    }

    /// Drop a queue and its entries.
    pub fn queue_remove(&mut self, descriptor: &QueueDescriptor) -> StoreResult<()> {
        self.add_update(Record::QueueRemove(QueueRemove {
            queue_name: descriptor.name.clone(),
        }))
    }

    /// Top-level queues from `first` on.
    pub fn queue_list(&mut self, first: Option<&str>, max: usize) -> StoreResult<Vec<QueueQueryResult>> {
        self.read(|r| r.queue_list(first, max))
    }

    /// Top-level queues of one type from `first` on.
    pub fn queue_list_by_type(
        &mut self,
        queue_type: i16,
        first: Option<&str>,
        max: usize,
    ) -> StoreResult<Vec<QueueQueryResult>> {
        self.read(|r| r.queue_list_by_type(queue_type, first, max))
    }

    /// Enqueue a message reference.
    pub fn queue_add_message(&mut self, queue: &str, record: QueueRecord) -> StoreResult<()> {
        let exists = self.read(|r| match r.root.destination(r.tx, queue)? {
            Some(destination) => destination.contains_queue_key(r.tx, record.queue_key),
            None => Err(StoreError::not_found(format!("queue {queue}"))),
        })?;
        if exists {
            return Err(StoreError::duplicate(format!(
                "queue key {} in {queue}",
                record.queue_key
            )));
        }
        self.add_update(Record::QueueAddMessage(QueueAddMessage {
            queue_name: queue.to_string(),
            record,
        }))
    }

    /// Dequeue a message. Nothing is journaled when it is not queued.
    pub fn queue_remove_message(&mut self, queue: &str, message_key: i64) -> StoreResult<()> {
        let exists = self.read(|r| match r.root.destination(r.tx, queue)? {
            Some(destination) => destination.contains_message(r.tx, message_key),
            None => Err(StoreError::not_found(format!("queue {queue}"))),
        })?;
        if !exists {
            return Err(StoreError::not_found(format!(
                "message key {message_key} in {queue}"
            )));
        }
        self.add_update(Record::QueueRemoveMessage(QueueRemoveMessage {
            queue_name: queue.to_string(),
            message_key,
        }))
    }

    /// Entries of a queue with queue keys in `first_key..=max_key`.
    pub fn queue_list_messages(
        &mut self,
        queue: &str,
        first_key: Option<i64>,
        max_key: Option<i64>,
        max: usize,
    ) -> StoreResult<Vec<QueueRecord>> {
        self.read(|r| r.queue_list_messages(queue, first_key, max_key, max))
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Add a subscription. Re-adding an identical record is an update; a
    /// different record under an existing name is `DuplicateKey`.
    pub fn subscription_add(&mut self, record: SubscriptionRecord) -> StoreResult<()> {
        let existing = self.read(|r| r.subscription_get(&record.name))?;
        if let Some(existing) = existing {
            if existing != record {
                return Err(StoreError::duplicate(format!("subscription {}", record.name)));
            }
        }
        self.add_update(Record::SubscriptionAdd(record))
    }

    /// Replace a subscription unconditionally.
    pub fn subscription_update(&mut self, record: SubscriptionRecord) -> StoreResult<()> {
        self.add_update(Record::SubscriptionAdd(record))
    }

    /// Remove a subscription.
    pub fn subscription_remove(&mut self, name: &str) -> StoreResult<()> {
        self.add_update(Record::SubscriptionRemove(SubscriptionRemove {
            name: name.to_string(),
        }))
    }

    /// Every subscription, by name.
    pub fn subscription_list(&mut self) -> StoreResult<Vec<SubscriptionRecord>> {
        self.read(|r| r.subscription_list())
    }

    // ========================================================================
    // Maps
    // ========================================================================

    /// Create a map.
    pub fn map_add(&mut self, name: &str) -> StoreResult<()> {
        self.add_update(Record::MapAdd(MapName {
            map_name: name.to_string(),
        }))
    }

    /// Drop a map and its entries.
    pub fn map_remove(&mut self, name: &str) -> StoreResult<()> {
        self.add_update(Record::MapRemove(MapName {
            map_name: name.to_string(),
        }))
    }

    /// Map names from `first` on.
    pub fn map_list(&mut self, first: Option<&str>, max: usize) -> StoreResult<Vec<String>> {
        self.read(|r| r.map_list(first, max))
    }

    /// Put a map entry.
    pub fn map_entry_put(&mut self, map: &str, key: &str, value: impl Into<Vec<u8>>) -> StoreResult<()> {
        self.add_update(Record::MapEntryPut(MapEntryPut {
            map_name: map.to_string(),
            key: key.to_string(),
            value: value.into(),
        }))
    }

    /// Value of a map entry.
    pub fn map_entry_get(&mut self, map: &str, key: &str) -> StoreResult<Vec<u8>> {
        self.read(|r| r.map_entry_get(map, key))
    }

    /// Remove a map entry. A missing map or key is `KeyNotFound`.
    pub fn map_entry_remove(&mut self, map: &str, key: &str) -> StoreResult<()> {
        self.read(|r| r.map_entry_get(map, key))?;
        self.add_update(Record::MapEntryRemove(MapEntryRemove {
            map_name: map.to_string(),
            key: key.to_string(),
        }))
    }

    /// Entry keys of a map from `first` on.
    pub fn map_entry_list_keys(
        &mut self,
        map: &str,
        first: Option<&str>,
        max: usize,
    ) -> StoreResult<Vec<String>> {
        self.read(|r| r.map_entry_list_keys(map, first, max))
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.held.is_some() || self.in_unit {
            if let Err(e) = self.rollback() {
                warn!(target: "brokerstore::store", error = %e, "Rollback of dropped session failed");
            }
        }
    }
}
