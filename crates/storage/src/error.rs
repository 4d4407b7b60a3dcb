//! Index error type.

use crate::page::{PageFault, PageId};
use brokerstore_core::StoreError;
use thiserror::Error;

/// Result alias for index operations.
pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// Errors raised by the paged index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// I/O error on the page or redo file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Page failed verification or is not what the caller expected
    #[error("Corrupt page {page_id}: {reason}")]
    CorruptPage {
        /// Offending page
        page_id: PageId,
        /// What was wrong
        reason: String,
    },

    /// Entity could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Page file has been closed
    #[error("Page file is closed")]
    Closed,
}

impl IndexError {
    pub(crate) fn corrupt(page_id: PageId, reason: impl Into<String>) -> Self {
        IndexError::CorruptPage {
            page_id,
            reason: reason.into(),
        }
    }

    pub(crate) fn from_fault(page_id: PageId, fault: PageFault) -> Self {
        IndexError::corrupt(page_id, format!("{:?}", fault))
    }
}

impl From<bincode::Error> for IndexError {
    fn from(e: bincode::Error) -> Self {
        IndexError::Serialization(e.to_string())
    }
}

impl From<IndexError> for StoreError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Io(io) => StoreError::Io(io),
            IndexError::Closed => StoreError::NotOpen,
            other => StoreError::Fatal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_page_display() {
        let err = IndexError::from_fault(12, PageFault::Checksum);
        let msg = err.to_string();
        assert!(msg.contains("Corrupt page 12"));
        assert!(msg.contains("Checksum"));
    }

    #[test]
    fn test_into_store_error_is_fatal() {
        let err: StoreError = IndexError::corrupt(3, "bad chain").into();
        assert!(err.is_fatal());
        let err: StoreError = IndexError::Closed.into();
        assert!(matches!(err, StoreError::NotOpen));
    }
}
