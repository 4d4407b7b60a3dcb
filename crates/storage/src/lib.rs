//! Paged index storage for the broker store
//!
//! This crate implements the transactional page file the index lives in:
//! - Page format: fixed-size, CRC-checked pages chained through overflow links
//! - PageFile: dirty-page cache, redo-protected flushes, free page tracking
//! - PageTx: buffered allocate / store / free with atomic commit and rollback
//! - Optional background writer that flushes full batches off the commit path

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod page;
pub mod page_file;
pub mod tx;

pub use error::{IndexError, IndexResult};
pub use page::{PageId, PageKind, NO_PAGE, PAGE_PAYLOAD_SIZE, PAGE_SIZE};
pub use page_file::{BeforeFlush, IndexCounters, PageFile, PageFileConfig};
pub use tx::PageTx;
