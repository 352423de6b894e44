//! File-level client: namespace calls plus block writes and reads.
//!
//! Writes go block by block: allocate on the coordinator, stream through the
//! pipeline, commit with the acknowledged replicas. A block whose pipeline
//! breaks is abandoned and allocated afresh after a backoff. If a block
//! cannot be written at all, the partial file is removed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use keelfs_meta::{
    FileStatus, LocatedBlock, LocatedFileStatus, MetaError, NamespaceCoordinator, NodeId,
};
use keelfs_repl::{ReplicaReader, ReplicationPipeline};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClientError, ClientResult};
use crate::retry::{with_retry, RetryConfig};

/// Client for one cluster.
pub struct DfsClient {
    coordinator: Arc<NamespaceCoordinator>,
    pipeline: Arc<ReplicationPipeline>,
    reader: ReplicaReader,
    retry: RetryConfig,
    writer: Option<NodeId>,
    replication: Option<u16>,
    cancel: CancellationToken,
}

impl DfsClient {
    /// Creates a client writing through `pipeline`.
    pub fn new(
        coordinator: Arc<NamespaceCoordinator>,
        pipeline: Arc<ReplicationPipeline>,
        retry: RetryConfig,
    ) -> Self {
        let reader = ReplicaReader::new(Arc::clone(pipeline.transport()))
            .with_reporter(Arc::clone(&coordinator));
        Self {
            coordinator,
            pipeline,
            reader,
            retry,
            writer: None,
            replication: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Treats the client as running on datanode `node`: the first replica
    /// of each written block lands there and reads prefer it.
    pub fn with_writer(mut self, node: NodeId) -> Self {
        self.writer = Some(node);
        self
    }

    /// Replication factor for files this client creates.
    pub fn with_replication(mut self, replication: u16) -> Self {
        self.replication = Some(replication);
        self
    }

    /// Cancels in-flight writes when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Creates a directory whose parent exists.
    pub fn mkdir(&self, path: &str) -> ClientResult<()> {
        Ok(self.coordinator.mkdir(path)?)
    }

    /// Creates a directory and any missing ancestors.
    pub fn mkdirs(&self, path: &str) -> ClientResult<()> {
        Ok(self.coordinator.mkdirs(path)?)
    }

    /// Removes a file or directory; a non-empty directory needs `recursive`.
    pub fn rm(&self, path: &str, recursive: bool) -> ClientResult<()> {
        Ok(self.coordinator.delete(path, recursive)?)
    }

    /// Renames `src` to `dst`.
    pub fn mv(&self, src: &str, dst: &str) -> ClientResult<()> {
        Ok(self.coordinator.rename(src, dst)?)
    }

    /// Status of one path.
    pub fn status(&self, path: &str) -> ClientResult<FileStatus> {
        Ok(self.coordinator.get_file_status(path)?)
    }

    /// Children of a directory, or the file itself.
    pub fn list_status(&self, path: &str) -> ClientResult<Vec<FileStatus>> {
        Ok(self.coordinator.list_status(path)?)
    }

    /// Files under `path` with their block locations.
    pub fn list_files(&self, path: &str, recursive: bool) -> ClientResult<Vec<LocatedFileStatus>> {
        Ok(self.coordinator.list_files(path, recursive)?)
    }

    /// Uploads a local file.
    ///
    /// When `remote` is an existing directory the file lands inside it under
    /// its local name.
    pub async fn put(&self, local: &Path, remote: &str, overwrite: bool) -> ClientResult<FileStatus> {
        let meta = tokio::fs::metadata(local).await?;
        if !meta.is_file() {
            return Err(ClientError::InvalidArgument(format!(
                "{}: not a regular file",
                local.display()
            )));
        }
        let remote = self.upload_target(local, remote)?;
        let remote = remote.as_str();
        let mut file = tokio::fs::File::open(local).await?;
        self.coordinator
            .create_file(remote, self.replication, overwrite)?;

        match self.write_blocks(&mut file, remote).await {
            Ok(written) => {
                info!(local = %local.display(), remote, bytes = written, "upload complete");
                self.status(remote)
            }
            Err(e) => {
                if let Err(cleanup) = self.coordinator.delete(remote, false) {
                    warn!(remote, error = %cleanup, "failed to remove partial file");
                }
                Err(e)
            }
        }
    }

    fn upload_target(&self, local: &Path, remote: &str) -> ClientResult<String> {
        match self.coordinator.get_file_status(remote) {
            Ok(status) if status.is_dir() => {
                let name = local.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
                    ClientError::InvalidArgument(format!("{}: no file name", local.display()))
                })?;
                Ok(child_path(&status.path, name))
            }
            _ => Ok(remote.to_string()),
        }
    }

    /// Writes `data` as a new file.
    pub async fn write(&self, remote: &str, data: Bytes, overwrite: bool) -> ClientResult<FileStatus> {
        self.coordinator
            .create_file(remote, self.replication, overwrite)?;
        let block_size = self.block_size();
        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + block_size).min(data.len());
            if let Err(e) = self.write_block(remote, data.slice(offset..end)).await {
                if let Err(cleanup) = self.coordinator.delete(remote, false) {
                    warn!(remote, error = %cleanup, "failed to remove partial file");
                }
                return Err(e);
            }
            offset = end;
        }
        self.status(remote)
    }

    fn block_size(&self) -> usize {
        usize::try_from(self.coordinator.config().block_size).unwrap_or(usize::MAX)
    }

    async fn write_blocks(&self, file: &mut tokio::fs::File, remote: &str) -> ClientResult<u64> {
        let block_size = self.block_size();
        let mut written = 0u64;
        loop {
            let chunk = read_up_to(file, block_size).await?;
            if chunk.is_empty() {
                return Ok(written);
            }
            written += chunk.len() as u64;
            self.write_block(remote, chunk).await?;
        }
    }

    async fn write_block(&self, remote: &str, data: Bytes) -> ClientResult<()> {
        with_retry(&self.retry, || self.try_write_block(remote, data.clone())).await
    }

    async fn try_write_block(&self, remote: &str, data: Bytes) -> ClientResult<()> {
        let allocated = self.coordinator.allocate_block(remote, self.writer)?;
        let block = allocated.block;
        match self
            .pipeline
            .write_block(block, &allocated.targets, data, &self.cancel)
            .await
        {
            Ok(ack) => {
                if !ack.failed.is_empty() {
                    debug!(block = %block, failed = ?ack.failed, "block written with a shortened pipeline");
                }
                self.coordinator
                    .commit_block(remote, block, ack.len, &ack.replicas)?;
                Ok(())
            }
            Err(e) => {
                warn!(remote, block = %block, error = %e, "block write failed, abandoning");
                if let Err(abandon) = self.coordinator.abandon_block(remote, block) {
                    warn!(remote, block = %block, error = %abandon, "failed to abandon block");
                }
                Err(e.into())
            }
        }
    }

    /// Reads a whole file into memory.
    pub async fn read(&self, remote: &str) -> ClientResult<Bytes> {
        let mut out = BytesMut::new();
        for located in self.committed_blocks(remote)? {
            out.extend_from_slice(&self.read_block(&located).await?);
        }
        Ok(out.freeze())
    }

    /// Downloads a file to `local`, returning the bytes written.
    ///
    /// An existing local directory receives the file under its remote name.
    /// The data goes to a temporary sibling first and is renamed into place
    /// once every block was read; the temporary file never outlives a failure.
    pub async fn get(&self, remote: &str, local: &Path) -> ClientResult<u64> {
        let status = self.status(remote)?;
        if status.is_dir() {
            return Err(MetaError::IsADirectory {
                path: remote.to_string(),
            }
            .into());
        }
        let blocks = self.committed_blocks(remote)?;
        let target = match tokio::fs::metadata(local).await {
            Ok(meta) if meta.is_dir() => local.join(final_component(&status.path)),
            _ => local.to_path_buf(),
        };
        let tmp = part_path(&target)?;

        match self.download(&blocks, &tmp, &target).await {
            Ok(written) => {
                info!(remote, local = %target.display(), bytes = written, "download complete");
                Ok(written)
            }
            Err(e) => {
                match tokio::fs::remove_file(&tmp).await {
                    Ok(()) => {}
                    Err(rm) if rm.kind() == std::io::ErrorKind::NotFound => {}
                    Err(rm) => {
                        warn!(path = %tmp.display(), error = %rm, "failed to remove partial download")
                    }
                }
                Err(e)
            }
        }
    }

    async fn download(&self, blocks: &[LocatedBlock], tmp: &Path, target: &Path) -> ClientResult<u64> {
        let mut file = tokio::fs::File::create(tmp).await?;
        let mut written = 0u64;
        for located in blocks {
            let data = self.read_block(located).await?;
            file.write_all(&data).await?;
            written += data.len() as u64;
        }
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(tmp, target).await?;
        Ok(written)
    }

    fn committed_blocks(&self, remote: &str) -> ClientResult<Vec<LocatedBlock>> {
        let blocks = self.coordinator.get_block_locations(remote, self.writer)?;
        Ok(blocks.into_iter().filter(|b| b.complete).collect())
    }

    async fn read_block(&self, located: &LocatedBlock) -> ClientResult<Bytes> {
        Ok(self.reader.read_block(located).await?.data)
    }
}

fn child_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

fn final_component(path: &str) -> &str {
    path.rsplit('/').find(|c| !c.is_empty()).unwrap_or_default()
}

fn part_path(target: &Path) -> ClientResult<PathBuf> {
    let name = target.file_name().ok_or_else(|| {
        ClientError::InvalidArgument(format!("{}: no file name", target.display()))
    })?;
    let mut part = name.to_os_string();
    part.push(".keelfs-part");
    Ok(target.with_file_name(part))
}

async fn read_up_to(file: &mut tokio::fs::File, limit: usize) -> ClientResult<Bytes> {
    let mut buf = BytesMut::with_capacity(limit.min(8 << 20));
    while buf.len() < limit {
        let mut chunk = (&mut *file).take((limit - buf.len()) as u64);
        let n = chunk.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
    }
    Ok(buf.freeze())
}
