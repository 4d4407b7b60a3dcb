//! Journal positions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of one record in the journal.
///
/// Ordered by segment id, then by byte offset inside the segment. The index
/// stores locations as foreign keys back to journal payloads; only the
/// journal can say what the *next* location after a given one is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Journal segment id
    pub segment_id: u32,
    /// Byte offset of the frame inside the segment
    pub offset: u32,
}

impl Location {
    /// Create a location.
    pub const fn new(segment_id: u32, offset: u32) -> Self {
        Location { segment_id, offset }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_segment_first() {
        assert!(Location::new(1, 9000) < Location::new(2, 32));
        assert!(Location::new(2, 32) < Location::new(2, 33));
        assert_eq!(Location::new(5, 5), Location::new(5, 5));
    }

    #[test]
    fn test_display() {
        assert_eq!(Location::new(3, 128).to_string(), "3:128");
    }
}
