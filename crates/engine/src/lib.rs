//! Store engine for the broker store
//!
//! This crate ties the journal and the paged index together:
//! - Entities: root, destinations, maps and subscriptions laid out in index pages
//! - Record application shared by live sessions and recovery
//! - Recovery: journal replay with unit-of-work handling and index reconciliation
//! - Checkpoint and cleanup on a background thread
//! - Session: grouped updates journaled first, indexed second
//! - Store: directory lock, lifecycle and configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

mod apply;
pub mod checkpoint;
pub mod config;
pub mod entity;
pub mod recovery;
pub mod session;
pub mod store;
mod table;

pub use checkpoint::CheckpointInfo;
pub use config::{ConfigError, StoreConfig, CONFIG_FILE_NAME};
pub use entity::{DestinationEntity, RootEntity};
pub use recovery::RecoveryStats;
pub use session::{Session, StoreReader};
pub use store::{Store, StoreStats, LOCK_FILE_NAME};
