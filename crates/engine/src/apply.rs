//! Applying journal records to the index.
//!
//! The same path serves live sessions, recovery and incremental recovery,
//! so the index a crash leaves behind can always be rebuilt by replay.

use crate::entity::RootEntity;
use brokerstore_core::{Location, StoreError, StoreResult};
use brokerstore_durability::{Journal, Record};
use brokerstore_storage::PageTx;
use tracing::debug;

/// Read and decode the record at `location`.
pub(crate) fn load_record(journal: &Journal, location: Location) -> StoreResult<Record> {
    let bytes = journal.read(location)?;
    Record::decode(&bytes).map_err(|e| match StoreError::from(e) {
        StoreError::CorruptRecord { location: None, reason } => StoreError::CorruptRecord {
            location: Some(location),
            reason,
        },
        other => other,
    })
}

/// Apply one data record found at `location`.
///
/// With `recovering` set, duplicate message keys and queue keys are skipped
/// instead of failing: the record was already applied before the crash.
/// The watermark is left to the caller.
pub(crate) fn apply(
    tx: &mut PageTx,
    root: &mut RootEntity,
    record: &Record,
    location: Location,
    recovering: bool,
) -> StoreResult<()> {
    match record {
        Record::MessageAdd(message) => {
            root.message_add(tx, message, location, recovering)?;
        }
        Record::QueueAdd(descriptor) => {
            root.queue_add(tx, descriptor)?;
        }
        Record::QueueRemove(r) => {
            root.queue_remove(tx, &r.queue_name)?;
        }
        Record::QueueAddMessage(r) => {
            if let Some(mut destination) = root.destination(tx, &r.queue_name)? {
                match destination.add(tx, &r.record, location) {
                    Ok(()) => {
                        root.add_message_ref(tx, r.record.message_key)?;
                    }
                    Err(e) if recovering && e.is_duplicate() => {
                        debug!(
                            target: "brokerstore::recovery",
                            queue = %r.queue_name,
                            queue_key = r.record.queue_key,
                            %location,
                            "Skipping duplicate queue entry"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Record::QueueRemoveMessage(r) => {
            if let Some(mut destination) = root.destination(tx, &r.queue_name)? {
                if destination.remove(tx, r.message_key)? {
                    root.remove_message_ref(tx, r.message_key)?;
                }
            }
        }
        Record::SubscriptionAdd(subscription) => {
            root.subscription_put(tx, subscription)?;
        }
        Record::SubscriptionRemove(r) => {
            root.subscription_remove(tx, &r.name)?;
        }
        Record::MapAdd(r) => {
            root.map_add(tx, &r.map_name)?;
        }
        Record::MapRemove(r) => {
            root.map_remove(tx, &r.map_name)?;
        }
        Record::MapEntryPut(r) => {
            root.map_put(tx, &r.map_name, &r.key, &r.value)?;
        }
        Record::MapEntryRemove(r) => match root.map_remove_entry(tx, &r.map_name, &r.key) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        },
        Record::Trace(trace) => {
            debug!(target: "brokerstore::store", %location, message = %trace.message, "Trace");
        }
        Record::BeginUnitOfWork
        | Record::EndUnitOfWork
        | Record::CancelUnitOfWork
        | Record::Flush => {
            return Err(StoreError::fatal(format!(
                "control marker {:?} at {} cannot be applied to the index",
                record.kind(),
                location
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use brokerstore_core::{MessageRecord, QueueDescriptor, QueueRecord};
    use brokerstore_durability::{MapEntryRemove, QueueAddMessage, QueueRemoveMessage};
    use brokerstore_storage::{PageFile, PageFileConfig};
    use tempfile::tempdir;

    fn loc(offset: u32) -> Location {
        Location::new(1, offset)
    }

    fn enqueue(queue: &str, queue_key: i64, message_key: i64) -> Record {
        Record::QueueAddMessage(QueueAddMessage {
            queue_name: queue.to_string(),
            record: QueueRecord::new(queue_key, message_key, 1),
        })
    }

    #[test]
    fn test_enqueue_dequeue_tracks_refs() {
        let dir = tempdir().unwrap();
        let file = PageFile::open(dir.path(), PageFileConfig::for_testing()).unwrap();
        let mut tx = file.tx();
        let mut root = RootEntity::allocate(&mut tx).unwrap();

        let records = [
            Record::MessageAdd(MessageRecord::new(1, "m1", b"A".to_vec())),
            Record::QueueAdd(QueueDescriptor::new("Q1")),
            Record::QueueAdd(QueueDescriptor::new("Q2")),
            enqueue("Q1", 1, 1),
            enqueue("Q2", 1, 1),
        ];
        for (i, record) in records.iter().enumerate() {
            apply(&mut tx, &mut root, record, loc(32 + i as u32 * 10), false).unwrap();
        }
        assert_eq!(root.message_refs_of(&tx, 1).unwrap(), 2);

        let dequeue = Record::QueueRemoveMessage(QueueRemoveMessage {
            queue_name: "Q1".into(),
            message_key: 1,
        });
        apply(&mut tx, &mut root, &dequeue, loc(200), false).unwrap();
        // Second dequeue from the same queue is a no-op.
        apply(&mut tx, &mut root, &dequeue, loc(210), false).unwrap();
        assert_eq!(root.message_refs_of(&tx, 1).unwrap(), 1);
        assert!(root.message_location(&tx, 1).unwrap().is_some());
    }

    #[test]
    fn test_duplicate_queue_key_only_tolerated_while_recovering() {
        let dir = tempdir().unwrap();
        let file = PageFile::open(dir.path(), PageFileConfig::for_testing()).unwrap();
        let mut tx = file.tx();
        let mut root = RootEntity::allocate(&mut tx).unwrap();
        apply(&mut tx, &mut root, &Record::QueueAdd(QueueDescriptor::new("Q")), loc(32), false)
            .unwrap();
        apply(&mut tx, &mut root, &enqueue("Q", 1, 9), loc(40), false).unwrap();

        let err = apply(&mut tx, &mut root, &enqueue("Q", 1, 9), loc(50), false).unwrap_err();
        assert!(err.is_duplicate());

        apply(&mut tx, &mut root, &enqueue("Q", 1, 9), loc(50), true).unwrap();
        assert_eq!(root.message_refs_of(&tx, 9).unwrap(), 1);
    }

    #[test]
    fn test_missing_map_entry_remove_is_ignored() {
        let dir = tempdir().unwrap();
        let file = PageFile::open(dir.path(), PageFileConfig::for_testing()).unwrap();
        let mut tx = file.tx();
        let mut root = RootEntity::allocate(&mut tx).unwrap();
        let record = Record::MapEntryRemove(MapEntryRemove {
            map_name: "nope".into(),
            key: "k".into(),
        });
        apply(&mut tx, &mut root, &record, loc(32), false).unwrap();
    }

    #[test]
    fn test_enqueue_to_missing_queue_is_ignored() {
        let dir = tempdir().unwrap();
        let file = PageFile::open(dir.path(), PageFileConfig::for_testing()).unwrap();
        let mut tx = file.tx();
        let mut root = RootEntity::allocate(&mut tx).unwrap();
        apply(&mut tx, &mut root, &enqueue("ghost", 1, 1), loc(32), false).unwrap();
        assert_eq!(root.message_refs_of(&tx, 1).unwrap(), 0);
    }

    #[test]
    fn test_control_markers_rejected() {
        let dir = tempdir().unwrap();
        let file = PageFile::open(dir.path(), PageFileConfig::for_testing()).unwrap();
        let mut tx = file.tx();
        let mut root = RootEntity::allocate(&mut tx).unwrap();
        let err = apply(&mut tx, &mut root, &Record::Flush, loc(32), false).unwrap_err();
        assert!(err.is_fatal());
    }
}
