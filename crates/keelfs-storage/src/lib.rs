#![warn(missing_docs)]

//! KeelFS storage subsystem: local block replica persistence.
//!
//! Each storage node owns one [`BlockStore`]. Replicas are written
//! append-only under `rbw/` while a pipeline streams packets into them and
//! are moved to `finalized/` once complete. Every 512-byte chunk carries a
//! CRC32 that is verified on each read.

pub mod block;
pub mod checksum;
pub mod error;
pub mod store;

pub use block::{BlockId, DEFAULT_BLOCK_CAPACITY};
pub use checksum::{ChunkedChecksum, StreamingChecksum, DEFAULT_BYTES_PER_CHECKSUM};
pub use error::{StorageError, StorageResult};
pub use store::{BlockStore, BlockStoreConfig, ReplicaInfo};
