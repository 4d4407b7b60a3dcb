//! Store configuration via `brokerstore.toml`
//!
//! Every field except the directory has a default, so a config file only
//! lists what it changes. When the file does not name a directory, the
//! directory containing the file is used.

use brokerstore_core::StoreError;
use brokerstore_durability::JournalConfig;
use brokerstore_storage::PageFileConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Config file name placed in the store directory.
pub const CONFIG_FILE_NAME: &str = "brokerstore.toml";

/// Smallest accepted journal segment length.
pub const MIN_JOURNAL_FILE_LENGTH: u64 = 4 * 1024;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read or written
    #[error("Failed to access config file '{}': {source}", path.display())]
    Io {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this struct
    #[error("Failed to parse config file '{}': {reason}", path.display())]
    Parse {
        /// Config file path
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// A field holds an unusable value
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for StoreError {
    fn from(e: ConfigError) -> Self {
        StoreError::Config(e.to_string())
    }
}

/// Store configuration.
///
/// # Example
///
/// ```toml
/// directory = "/var/lib/broker/store"
/// checkpoint_interval_ms = 5000
/// cleanup_interval_ms = 30000
/// journal_max_file_length = 33554432
/// enable_journal_disk_syncs = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the journal, index and lock file
    pub directory: PathBuf,
    /// Fail immediately when another process holds the lock
    pub fail_if_locked: bool,
    /// Delay between lock attempts when not failing fast
    pub lock_retry_delay_ms: u64,
    /// Wipe journal and index on open
    pub delete_all_messages: bool,
    /// Period of the background checkpoint
    pub checkpoint_interval_ms: u64,
    /// Period of the background cleanup
    pub cleanup_interval_ms: u64,
    /// Journal segment rotation threshold in bytes
    pub journal_max_file_length: u64,
    /// Dirty index pages that trigger a flush
    pub index_write_batch_size: usize,
    /// Flush full index batches on a background thread
    pub enable_index_write_async: bool,
    /// Fsync journal appends before firing durability callbacks
    pub enable_journal_disk_syncs: bool,
    /// Checkpoints slower than this are logged as warnings
    pub slow_checkpoint_threshold_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            directory: PathBuf::new(),
            fail_if_locked: false,
            lock_retry_delay_ms: 10_000,
            delete_all_messages: false,
            checkpoint_interval_ms: 5_000,
            cleanup_interval_ms: 30_000,
            journal_max_file_length: 32 * 1024 * 1024,
            index_write_batch_size: 1000,
            enable_index_write_async: false,
            enable_journal_disk_syncs: true,
            slow_checkpoint_threshold_ms: 1_000,
        }
    }
}

impl StoreConfig {
    /// Defaults for a store in `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        StoreConfig {
            directory: directory.into(),
            ..StoreConfig::default()
        }
    }

    /// Small segments, no fsync, and background intervals long enough that
    /// tests drive checkpoints explicitly.
    pub fn for_testing(directory: impl Into<PathBuf>) -> Self {
        StoreConfig {
            directory: directory.into(),
            fail_if_locked: true,
            lock_retry_delay_ms: 50,
            checkpoint_interval_ms: 60_000,
            cleanup_interval_ms: 600_000,
            journal_max_file_length: 64 * 1024,
            index_write_batch_size: 256,
            enable_journal_disk_syncs: false,
            ..StoreConfig::default()
        }
    }

    /// Read and parse a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: StoreConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if config.directory.as_os_str().is_empty() {
            if let Some(parent) = path.parent() {
                config.directory = parent.to_path_buf();
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML and write to `path`.
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("directory must be set".into()));
        }
        if self.checkpoint_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "checkpoint_interval_ms must be positive".into(),
            ));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "cleanup_interval_ms must be positive".into(),
            ));
        }
        if self.cleanup_interval_ms < self.checkpoint_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "cleanup_interval_ms ({}) is below checkpoint_interval_ms ({})",
                self.cleanup_interval_ms, self.checkpoint_interval_ms
            )));
        }
        if self.journal_max_file_length < MIN_JOURNAL_FILE_LENGTH {
            return Err(ConfigError::Invalid(format!(
                "journal_max_file_length must be at least {} bytes",
                MIN_JOURNAL_FILE_LENGTH
            )));
        }
        if self.journal_max_file_length > u64::from(u32::MAX) {
            return Err(ConfigError::Invalid(
                "journal_max_file_length must fit in 32 bits".into(),
            ));
        }
        if self.index_write_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "index_write_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Fail fast when the store is locked.
    pub fn with_fail_if_locked(mut self, fail: bool) -> Self {
        self.fail_if_locked = fail;
        self
    }

    /// Set the lock retry delay.
    pub fn with_lock_retry_delay(mut self, delay: Duration) -> Self {
        self.lock_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Wipe all data on the next open.
    pub fn with_delete_all_messages(mut self, delete: bool) -> Self {
        self.delete_all_messages = delete;
        self
    }

    /// Set the checkpoint period.
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the cleanup period.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the journal segment length.
    pub fn with_journal_max_file_length(mut self, bytes: u64) -> Self {
        self.journal_max_file_length = bytes;
        self
    }

    /// Set the index write batch size.
    pub fn with_index_write_batch_size(mut self, pages: usize) -> Self {
        self.index_write_batch_size = pages;
        self
    }

    /// Flush index batches in the background.
    pub fn with_index_write_async(mut self, enable: bool) -> Self {
        self.enable_index_write_async = enable;
        self
    }

    /// Enable or disable journal fsync.
    pub fn with_journal_disk_syncs(mut self, enable: bool) -> Self {
        self.enable_journal_disk_syncs = enable;
        self
    }

    pub(crate) fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub(crate) fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub(crate) fn slow_checkpoint_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_checkpoint_threshold_ms)
    }

    pub(crate) fn journal_config(&self) -> JournalConfig {
        JournalConfig::default()
            .with_max_segment_length(self.journal_max_file_length)
            .with_disk_syncs(self.enable_journal_disk_syncs)
    }

    pub(crate) fn page_file_config(&self) -> PageFileConfig {
        PageFileConfig {
            write_batch_size: self.index_write_batch_size,
            enable_async_writes: self.enable_index_write_async,
            sync_writes: self.enable_journal_disk_syncs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::new("/tmp/store");
        assert_eq!(config.checkpoint_interval_ms, 5_000);
        assert_eq!(config.cleanup_interval_ms, 30_000);
        assert_eq!(config.journal_max_file_length, 32 * 1024 * 1024);
        assert_eq!(config.index_write_batch_size, 1000);
        assert_eq!(config.lock_retry_delay_ms, 10_000);
        assert!(config.enable_journal_disk_syncs);
        assert!(!config.fail_if_locked);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = StoreConfig::new("/tmp/store");
        assert!(StoreConfig::default().validate().is_err());
        assert!(base
            .clone()
            .with_checkpoint_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(base
            .clone()
            .with_cleanup_interval(Duration::from_millis(100))
            .validate()
            .is_err());
        assert!(base
            .clone()
            .with_journal_max_file_length(1024)
            .validate()
            .is_err());
        assert!(base
            .clone()
            .with_index_write_batch_size(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_file_partial_uses_defaults_and_parent_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "checkpoint_interval_ms = 1000\nfail_if_locked = true\n").unwrap();

        let config = StoreConfig::from_file(&path).unwrap();
        assert_eq!(config.directory, dir.path());
        assert_eq!(config.checkpoint_interval_ms, 1000);
        assert!(config.fail_if_locked);
        assert_eq!(config.cleanup_interval_ms, 30_000);
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "checkpoint_interval_ms = \"soon\"").unwrap();
        let err = StoreConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        let store_err: StoreError = err.into();
        assert!(matches!(store_err, StoreError::Config(_)));
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = StoreConfig::new(dir.path())
            .with_index_write_async(true)
            .with_journal_max_file_length(1024 * 1024);
        config.write_to_file(&path).unwrap();
        assert_eq!(StoreConfig::from_file(&path).unwrap(), config);
    }
}
