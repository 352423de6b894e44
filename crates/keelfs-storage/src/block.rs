//! Core block types for the storage subsystem.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Default block capacity (128MB), the largest size a single block may reach.
pub const DEFAULT_BLOCK_CAPACITY: u64 = 128 * 1024 * 1024;

const FILE_PREFIX: &str = "blk_";

/// Cluster-wide unique identifier of a block.
///
/// Block ids are handed out by the namespace coordinator and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(u64);

impl BlockId {
    /// Creates a BlockId from a raw u64 value.
    pub fn new(id: u64) -> Self {
        BlockId(id)
    }

    /// Returns the raw u64 value of this block ID.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// File name of the replica data file, e.g. `blk_42`.
    pub fn file_name(&self) -> String {
        format!("{}{}", FILE_PREFIX, self.0)
    }

    /// File name of the replica checksum file, e.g. `blk_42.meta`.
    pub fn meta_file_name(&self) -> String {
        format!("{}{}.meta", FILE_PREFIX, self.0)
    }

    /// Parses a replica data file name back into a block ID.
    ///
    /// Returns None for checksum files, temp files and unrelated names.
    pub fn from_file_name(name: &str) -> Option<BlockId> {
        let digits = name.strip_prefix(FILE_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(BlockId)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", FILE_PREFIX, self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(BlockId::new(1073741825).to_string(), "blk_1073741825");
    }

    #[test]
    fn test_file_name_round_trip() {
        let id = BlockId::new(77);
        assert_eq!(BlockId::from_file_name(&id.file_name()), Some(id));
    }

    #[test]
    fn test_from_file_name_rejects_meta_and_tmp() {
        assert_eq!(BlockId::from_file_name("blk_77.meta"), None);
        assert_eq!(BlockId::from_file_name("blk_77.tmp"), None);
        assert_eq!(BlockId::from_file_name("blk_"), None);
        assert_eq!(BlockId::from_file_name("edits_1"), None);
    }

    #[test]
    fn test_ordering_follows_raw_id() {
        assert!(BlockId::new(1) < BlockId::new(2));
    }
}
