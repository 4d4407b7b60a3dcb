//! brokerstore - journaled, crash-safe persistent store for a message broker
//!
//! Every update is appended to a segmented journal before it touches the
//! paged index, so a crash at any point recovers to the last committed
//! session. Updates grouped in one session become visible atomically.
//!
//! # Quick Start
//!
//! ```ignore
//! use brokerstore::{MessageRecord, QueueDescriptor, QueueRecord, Store, StoreConfig};
//!
//! let store = Store::open_with(StoreConfig::new("/var/lib/broker/store"))?;
//!
//! store.execute(
//!     |s| {
//!         s.queue_add(QueueDescriptor::new("orders"))?;
//!         s.message_add(MessageRecord::new(1, "ID:1", b"payload".to_vec()))?;
//!         s.queue_add_message("orders", QueueRecord::new(1, 1, 7))
//!     },
//!     None,
//! )?;
//!
//! let depth = store.read(|r| Ok(r.queue_query("orders")?.count))?;
//! ```
//!
//! # Architecture
//!
//! - `brokerstore-core`: locations, record types and the error taxonomy
//! - `brokerstore-durability`: record codec and the journal
//! - `brokerstore-storage`: transactional page file holding the index
//! - `brokerstore-engine`: sessions, recovery, checkpoints and the store lifecycle

pub use brokerstore_core::{
    Location, MessageRecord, QueueDescriptor, QueueQueryResult, QueueRecord, StoreError,
    StoreResult, StoreState, SubscriptionRecord,
};
pub use brokerstore_durability::{CleanupInfo, DurableCallback, Record, RecordKind};
pub use brokerstore_engine::{
    CheckpointInfo, ConfigError, RecoveryStats, Session, Store, StoreConfig, StoreReader,
    StoreStats, CONFIG_FILE_NAME, LOCK_FILE_NAME,
};
