//! Error types for the broker store
//!
//! Every layer funnels into [`StoreError`]. Lower crates keep their own
//! narrower error enums and convert with `From`.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::location::Location;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Error taxonomy of the broker store
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error while journaling or indexing (fatal)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Non-retryable store failure; the enclosing session is aborted
    #[error("Fatal store error: {0}")]
    Fatal(String),

    /// Lookup did not resolve (message key, map key, queue, subscription)
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Insert of a key that already exists
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A journal frame could not be read back
    #[error("Corrupt record at {location:?}: {reason}")]
    CorruptRecord {
        /// Where the bad frame was found, if known
        location: Option<Location>,
        /// What was wrong with it
        reason: String,
    },

    /// Unknown type discriminator while decoding a record
    #[error("Unknown record type: {0:#04x}")]
    UnknownRecordType(u8),

    /// Store directory is locked by another process
    #[error("Store directory is locked: {}", .0.display())]
    Locked(PathBuf),

    /// Journal segment cannot be removed yet
    #[error("Journal segment {0} is still in use")]
    SegmentInUse(u32),

    /// Caller supplied an invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation requires an open store
    #[error("Store is not open")]
    NotOpen,
}

impl StoreError {
    /// Shorthand for a missing-key error.
    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::KeyNotFound(what.into())
    }

    /// Shorthand for a duplicate-key error.
    pub fn duplicate(what: impl Into<String>) -> Self {
        StoreError::DuplicateKey(what.into())
    }

    /// Shorthand for a fatal error.
    pub fn fatal(msg: impl Into<String>) -> Self {
        StoreError::Fatal(msg.into())
    }

    /// Whether the error leaves the enclosing transaction unusable.
    ///
    /// Not-found and duplicate-key are expected conditions that the caller
    /// handles; argument and lock errors happen before anything is written.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_)
                | StoreError::Fatal(_)
                | StoreError::CorruptRecord { .. }
                | StoreError::UnknownRecordType(_)
        )
    }

    /// True for [`StoreError::KeyNotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound(_))
    }

    /// True for [`StoreError::DuplicateKey`].
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let err = StoreError::Io(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        assert!(err.to_string().contains("I/O error"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_error_display_key_not_found() {
        let err = StoreError::not_found("message key: 7");
        let msg = err.to_string();
        assert!(msg.contains("Key not found"));
        assert!(msg.contains("message key: 7"));
        assert!(err.is_not_found());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_display_duplicate() {
        let err = StoreError::duplicate("subscription: sub1");
        assert!(err.to_string().contains("Duplicate key"));
        assert!(err.is_duplicate());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_display_corrupt_record() {
        let err = StoreError::CorruptRecord {
            location: Some(Location::new(3, 64)),
            reason: "checksum mismatch".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Corrupt record"));
        assert!(msg.contains("checksum mismatch"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_error_display_unknown_type() {
        let err = StoreError::UnknownRecordType(0x42);
        assert!(err.to_string().contains("0x42"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_error_display_locked() {
        let err = StoreError::Locked(PathBuf::from("/tmp/store"));
        assert!(err.to_string().contains("/tmp/store"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_display_segment_in_use() {
        let err = StoreError::SegmentInUse(4);
        assert_eq!(err.to_string(), "Journal segment 4 is still in use");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: StoreError = io_err.into();
        assert!(matches!(err, StoreError::Io(_)));
    }
}
