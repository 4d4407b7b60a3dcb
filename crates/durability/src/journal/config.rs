//! Journal configuration.

/// Journal configuration parameters.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Maximum segment size in bytes (default: 32MB).
    ///
    /// An append that would push the active segment past this size
    /// rotates to a new segment first.
    pub max_segment_length: u64,

    /// Fsync segments before firing durability callbacks (default: true).
    ///
    /// When disabled, callbacks fire once the write has reached the OS.
    pub enable_disk_syncs: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig {
            max_segment_length: 32 * 1024 * 1024, // 32MB
            enable_disk_syncs: true,
        }
    }
}

impl JournalConfig {
    /// Create a new journal configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum segment length (builder pattern).
    pub fn with_max_segment_length(mut self, length: u64) -> Self {
        self.max_segment_length = length;
        self
    }

    /// Enable or disable fsync before durability callbacks (builder pattern).
    pub fn with_disk_syncs(mut self, enabled: bool) -> Self {
        self.enable_disk_syncs = enabled;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), JournalConfigError> {
        if self.max_segment_length < MIN_SEGMENT_LENGTH {
            return Err(JournalConfigError::SegmentTooSmall(self.max_segment_length));
        }
        // Locations address frames with a 32-bit offset.
        if self.max_segment_length > u32::MAX as u64 {
            return Err(JournalConfigError::SegmentTooLarge(self.max_segment_length));
        }
        Ok(())
    }

    /// Create a configuration for tests (small segments, no fsync).
    pub fn for_testing() -> Self {
        JournalConfig {
            max_segment_length: 64 * 1024, // 64KB for faster rotation in tests
            enable_disk_syncs: false,
        }
    }
}

/// Smallest accepted segment length.
pub const MIN_SEGMENT_LENGTH: u64 = 4 * 1024;

/// Journal configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JournalConfigError {
    /// Segment length below [`MIN_SEGMENT_LENGTH`].
    #[error("Journal segment length {0} is below the 4KB minimum")]
    SegmentTooSmall(u64),

    /// Segment length not addressable by a location offset.
    #[error("Journal segment length {0} exceeds 4GB")]
    SegmentTooLarge(u64),
}
