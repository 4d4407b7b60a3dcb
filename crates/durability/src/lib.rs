//! Durability layer for the broker store
//!
//! This crate handles everything that touches the journal:
//!
//! - Record codec: tagged binary form of every logical record and control marker
//! - Journal: segmented, CRC-framed, append-only write-ahead log
//! - Durability callbacks fired from a dedicated sync thread
//! - Segment validation on open and removal of superseded segments

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod journal;
pub mod record;

pub use journal::{
    CleanupInfo, DurableCallback, Journal, JournalConfig, JournalConfigError, JournalCounters,
    JournalError,
};
pub use record::{
    CodecError, MapEntryPut, MapEntryRemove, MapName, QueueAddMessage, QueueRemove,
    QueueRemoveMessage, Record, RecordKind, SubscriptionRemove, Trace,
};
