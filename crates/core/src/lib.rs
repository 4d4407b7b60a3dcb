//! Core types for the broker store
//!
//! This crate defines the foundational types shared by every layer:
//! - Location: ordered position of a journal record
//! - Record-level types: QueueDescriptor, MessageRecord, QueueRecord, SubscriptionRecord
//! - StoreState: lifecycle flag persisted in the root entity
//! - Error taxonomy: StoreError

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod location;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use location::Location;
pub use types::{
    MessageRecord, QueueDescriptor, QueueQueryResult, QueueRecord, StoreState, SubscriptionRecord,
};
