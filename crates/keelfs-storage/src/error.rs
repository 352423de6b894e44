//! Error types for the storage subsystem.

use thiserror::Error;

use crate::block::BlockId;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The requested replica does not exist on this node.
    #[error("Block not found: {block_id}")]
    BlockNotFound {
        /// The block ID that was not found.
        block_id: BlockId,
    },

    /// A replica for this block already exists; replicas are write-once.
    #[error("Block already exists: {block_id}")]
    BlockExists {
        /// The block ID that already exists.
        block_id: BlockId,
    },

    /// The replica is not open for writing (never created or already finalized).
    #[error("Block {block_id} is not open for writing")]
    NotWritable {
        /// The block ID.
        block_id: BlockId,
    },

    /// Stored data failed checksum verification.
    #[error("Corrupt block {block_id}: checksum mismatch in chunk {chunk}")]
    CorruptBlock {
        /// The corrupt block.
        block_id: BlockId,
        /// Index of the first chunk that failed verification.
        chunk: usize,
    },

    /// Data handed to `store` does not match the checksum supplied with it.
    #[error("Checksum mismatch on incoming data for {block_id}")]
    ChecksumMismatch {
        /// The block being stored.
        block_id: BlockId,
    },

    /// A write would grow the block past its capacity.
    #[error("Block {block_id} would grow to {size} bytes, capacity is {capacity}")]
    BlockTooLarge {
        /// The block being written.
        block_id: BlockId,
        /// Size the block would have after the write.
        size: u64,
        /// Configured block capacity.
        capacity: u64,
    },

    /// The checksum file of a replica could not be decoded.
    #[error("Invalid checksum file for {block_id}")]
    InvalidMeta {
        /// The block whose `.meta` file is malformed.
        block_id: BlockId,
    },
}

impl StorageError {
    /// Returns true if the error means the replica's bytes cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::CorruptBlock { .. } | StorageError::InvalidMeta { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_block_message() {
        let err = StorageError::CorruptBlock {
            block_id: BlockId::new(9),
            chunk: 3,
        };
        assert_eq!(
            err.to_string(),
            "Corrupt block blk_9: checksum mismatch in chunk 3"
        );
        assert!(err.is_corruption());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StorageError = std_err.into();
        assert!(matches!(err, StorageError::IoError(_)));
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_too_large_message() {
        let err = StorageError::BlockTooLarge {
            block_id: BlockId::new(1),
            size: 200,
            capacity: 100,
        };
        assert!(err.to_string().contains("capacity is 100"));
    }
}
