//! On-disk replica store for a single storage node.
//!
//! Layout under the store root:
//!
//! ```text
//! rbw/blk_<id>              replica being written (append-only)
//! finalized/blk_<id>        complete replica data
//! finalized/blk_<id>.meta   per-chunk CRC32 list for the replica
//! ```
//!
//! A replica becomes visible to reads and block reports only once its data
//! file has been renamed into `finalized/`. The `.meta` file is renamed in
//! first, so a crash between the two renames leaves an invisible replica
//! that the next garbage-collection scan removes.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::{BlockId, DEFAULT_BLOCK_CAPACITY};
use crate::checksum::{ChunkedChecksum, StreamingChecksum, DEFAULT_BYTES_PER_CHECKSUM};
use crate::error::{StorageError, StorageResult};

const RBW_DIR: &str = "rbw";
const FINALIZED_DIR: &str = "finalized";

/// Configuration for a block store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockStoreConfig {
    /// Maximum size of a single block in bytes (default 128MB).
    pub block_capacity: u64,
    /// Data bytes covered by each CRC32 (default 512).
    pub bytes_per_checksum: u32,
    /// fsync replica data and checksums when finalizing.
    pub sync_on_finalize: bool,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            bytes_per_checksum: DEFAULT_BYTES_PER_CHECKSUM,
            sync_on_finalize: true,
        }
    }
}

/// Summary of a finalized replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// The block this replica belongs to.
    pub block_id: BlockId,
    /// Replica length in bytes.
    pub len: u64,
    /// Digest of the replica's chunk checksums.
    pub checksum: u32,
}

struct OpenReplica {
    file: File,
    checksum: StreamingChecksum,
    len: u64,
}

/// Persists block replicas on local storage.
pub struct BlockStore {
    root: PathBuf,
    config: BlockStoreConfig,
    open: Mutex<HashMap<BlockId, Arc<Mutex<OpenReplica>>>>,
}

impl BlockStore {
    /// Opens (creating if needed) a block store rooted at `root`.
    pub fn open(root: impl AsRef<Path>, config: BlockStoreConfig) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(RBW_DIR))?;
        fs::create_dir_all(root.join(FINALIZED_DIR))?;
        info!(root = %root.display(), "opened block store");
        Ok(Self {
            root,
            config,
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The store configuration.
    pub fn config(&self) -> &BlockStoreConfig {
        &self.config
    }

    fn rbw_path(&self, block_id: BlockId) -> PathBuf {
        self.root.join(RBW_DIR).join(block_id.file_name())
    }

    fn finalized_path(&self, block_id: BlockId) -> PathBuf {
        self.root.join(FINALIZED_DIR).join(block_id.file_name())
    }

    fn meta_path(&self, block_id: BlockId) -> PathBuf {
        self.root.join(FINALIZED_DIR).join(block_id.meta_file_name())
    }

    /// Stores a complete block in one call.
    ///
    /// `checksum` must match `data`; the replica is rejected otherwise.
    pub fn store(
        &self,
        block_id: BlockId,
        data: &[u8],
        checksum: &ChunkedChecksum,
    ) -> StorageResult<ReplicaInfo> {
        if !checksum.verify(data) {
            return Err(StorageError::ChecksumMismatch { block_id });
        }
        self.create(block_id)?;
        if let Err(e) = self.append(block_id, data) {
            self.abort(block_id);
            return Err(e);
        }
        self.finalize(block_id)
    }

    /// Opens a new replica for appending.
    pub fn create(&self, block_id: BlockId) -> StorageResult<()> {
        let mut open = self.open.lock();
        if open.contains_key(&block_id) || self.contains(block_id) {
            return Err(StorageError::BlockExists { block_id });
        }
        // A leftover rbw file belongs to an aborted attempt and is discarded.
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.rbw_path(block_id))?;
        open.insert(
            block_id,
            Arc::new(Mutex::new(OpenReplica {
                file,
                checksum: StreamingChecksum::new(self.config.bytes_per_checksum),
                len: 0,
            })),
        );
        debug!(block = %block_id, "created replica");
        Ok(())
    }

    /// Appends data to an open replica, returning its new length.
    pub fn append(&self, block_id: BlockId, data: &[u8]) -> StorageResult<u64> {
        let replica = self
            .open
            .lock()
            .get(&block_id)
            .cloned()
            .ok_or(StorageError::NotWritable { block_id })?;
        let mut replica = replica.lock();

        let size = replica.len + data.len() as u64;
        if size > self.config.block_capacity {
            return Err(StorageError::BlockTooLarge {
                block_id,
                size,
                capacity: self.config.block_capacity,
            });
        }

        replica.file.write_all(data)?;
        replica.checksum.update(data);
        replica.len = size;
        Ok(size)
    }

    /// Length of an open replica, if it is being written.
    pub fn open_len(&self, block_id: BlockId) -> Option<u64> {
        let replica = self.open.lock().get(&block_id).cloned()?;
        let len = replica.lock().len;
        Some(len)
    }

    /// Completes an open replica and makes it visible.
    pub fn finalize(&self, block_id: BlockId) -> StorageResult<ReplicaInfo> {
        let replica = self
            .open
            .lock()
            .remove(&block_id)
            .ok_or(StorageError::NotWritable { block_id })?;
        let replica = match Arc::try_unwrap(replica) {
            Ok(m) => m.into_inner(),
            Err(shared) => {
                // An append raced with finalize; put it back and refuse.
                self.open.lock().insert(block_id, shared);
                return Err(StorageError::NotWritable { block_id });
            }
        };

        if self.config.sync_on_finalize {
            replica.file.sync_all()?;
        }
        drop(replica.file);

        let checksum = replica.checksum.finish();
        let meta_path = self.meta_path(block_id);
        let meta_tmp = meta_path.with_extension("meta.tmp");
        {
            let mut tmp = File::create(&meta_tmp)?;
            tmp.write_all(&checksum.to_bytes())?;
            if self.config.sync_on_finalize {
                tmp.sync_all()?;
            }
        }
        fs::rename(&meta_tmp, &meta_path)?;
        fs::rename(self.rbw_path(block_id), self.finalized_path(block_id))?;

        let info = ReplicaInfo {
            block_id,
            len: replica.len,
            checksum: checksum.digest(),
        };
        debug!(block = %block_id, len = info.len, checksum = info.checksum, "finalized replica");
        Ok(info)
    }

    /// Abandons an open replica. The partial file stays on disk until the
    /// next garbage-collection scan.
    pub fn abort(&self, block_id: BlockId) {
        if self.open.lock().remove(&block_id).is_some() {
            debug!(block = %block_id, "aborted replica");
        }
    }

    /// Reads a finalized replica, verifying every chunk.
    pub fn read(&self, block_id: BlockId) -> StorageResult<Vec<u8>> {
        let data = read_or_missing(&self.finalized_path(block_id), block_id)?;
        let checksum = self.load_meta(block_id)?;
        if let Some(chunk) = checksum.first_mismatch(&data) {
            warn!(block = %block_id, chunk, "replica failed checksum verification");
            return Err(StorageError::CorruptBlock { block_id, chunk });
        }
        Ok(data)
    }

    /// Returns true if the replica passes checksum verification.
    pub fn verify(&self, block_id: BlockId) -> StorageResult<bool> {
        match self.read(block_id) {
            Ok(_) => Ok(true),
            Err(e) if e.is_corruption() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Length and checksum digest of a finalized replica, without reading its data.
    pub fn replica_info(&self, block_id: BlockId) -> StorageResult<ReplicaInfo> {
        let len = match fs::metadata(self.finalized_path(block_id)) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::BlockNotFound { block_id })
            }
            Err(e) => return Err(e.into()),
        };
        let checksum = self.load_meta(block_id)?;
        Ok(ReplicaInfo {
            block_id,
            len,
            checksum: checksum.digest(),
        })
    }

    fn load_meta(&self, block_id: BlockId) -> StorageResult<ChunkedChecksum> {
        let buf = read_or_missing(&self.meta_path(block_id), block_id)?;
        ChunkedChecksum::from_bytes(&buf).ok_or(StorageError::InvalidMeta { block_id })
    }

    /// Returns true if a finalized replica exists.
    pub fn contains(&self, block_id: BlockId) -> bool {
        self.finalized_path(block_id).exists()
    }

    /// Deletes a replica, finalized or partial.
    pub fn delete(&self, block_id: BlockId) -> StorageResult<()> {
        self.abort(block_id);
        let mut removed = false;
        for path in [
            self.finalized_path(block_id),
            self.meta_path(block_id),
            self.rbw_path(block_id),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if !removed {
            return Err(StorageError::BlockNotFound { block_id });
        }
        debug!(block = %block_id, "deleted replica");
        Ok(())
    }

    /// Lists every finalized replica, sorted by block ID.
    pub fn block_report(&self) -> StorageResult<Vec<BlockId>> {
        let mut ids: Vec<BlockId> = list_block_files(&self.root.join(FINALIZED_DIR))?
            .into_iter()
            .filter(|id| self.meta_path(*id).exists())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Deletes every replica whose block is not in `reachable`.
    ///
    /// Replicas currently open for writing are skipped. Returns the removed
    /// block IDs.
    pub fn retain(&self, reachable: &HashSet<BlockId>) -> StorageResult<Vec<BlockId>> {
        let mut candidates = list_block_files(&self.root.join(FINALIZED_DIR))?;
        candidates.extend(list_block_files(&self.root.join(RBW_DIR))?);
        candidates.sort_unstable();
        candidates.dedup();

        let mut removed = Vec::new();
        for block_id in candidates {
            if reachable.contains(&block_id) || self.open.lock().contains_key(&block_id) {
                continue;
            }
            match self.delete(block_id) {
                Ok(()) => removed.push(block_id),
                Err(StorageError::BlockNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if !removed.is_empty() {
            info!(root = %self.root.display(), removed = removed.len(), "removed unreachable replicas");
        }
        Ok(removed)
    }
}

fn read_or_missing(path: &Path, block_id: BlockId) -> StorageResult<Vec<u8>> {
    match fs::read(path) {
        Ok(buf) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::BlockNotFound { block_id }),
        Err(e) => Err(e.into()),
    }
}

fn list_block_files(dir: &Path) -> StorageResult<Vec<BlockId>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(BlockId::from_file_name) {
            ids.push(id);
        }
    }
    Ok(ids)
}
