//! The namespace coordinator: single authority over the directory tree and
//! the block-to-node map.
//!
//! Every namespace mutation is validated against the in-memory tree,
//! appended to the edit log, and only then applied, all under one write
//! lock. Readers share the lock and never observe a half-applied mutation.
//! Replica locations, node health and the re-replication queue are soft
//! state kept beside the namespace and rebuilt from datanode reports.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use keelfs_storage::ReplicaInfo;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::blockmap::{BlockManager, NodeCommand, ReplicaLocation, ReplicationTask};
use crate::checkpoint::{self, Checkpoint};
use crate::edit_log::{self, EditLog, LogOp};
use crate::heartbeat::{HeartbeatMonitor, LivenessConfig, LivenessEvent, NodeEntry, NodeHealth};
use crate::namespace::{BlockState, INode, Namespace};
use crate::placement::{
    NetworkTopology, NodeDescriptor, PlacementPolicy, RackAwarePlacement, RackTopology,
};
use crate::types::*;

/// Coordinator configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Directory holding edit log segments and checkpoints
    pub meta_dir: PathBuf,
    /// Replication factor for files created without an explicit one
    pub default_replication: u16,
    /// Maximum block length in bytes
    pub block_size: u64,
    /// fsync every log append
    pub sync_log: bool,
    /// Take a checkpoint at least this often while there are new records
    pub checkpoint_interval_ms: u64,
    /// Take a checkpoint once this many records accumulated
    pub checkpoint_txns: u64,
    /// Number of checkpoints kept on disk
    pub retain_checkpoints: usize,
    /// Re-queue a re-replication task after this long without completion
    pub replication_timeout_ms: u64,
    /// Upper bound on tasks issued by one call to the replication scan
    pub max_replication_tasks_per_tick: usize,
    /// Datanode liveness timing
    pub liveness: LivenessConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            meta_dir: PathBuf::from("/var/lib/keelfs/meta"),
            default_replication: 3,
            block_size: keelfs_storage::DEFAULT_BLOCK_CAPACITY,
            sync_log: true,
            checkpoint_interval_ms: 3_600_000,
            checkpoint_txns: 1_000_000,
            retain_checkpoints: 2,
            replication_timeout_ms: 300_000,
            max_replication_tasks_per_tick: 1_000,
            liveness: LivenessConfig::default(),
        }
    }
}

/// A freshly allocated block and the pipeline that should write it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedBlock {
    /// The new block
    pub block: BlockId,
    /// Offset of the block within the file
    pub offset: u64,
    /// Target nodes in pipeline order
    pub targets: Vec<NodeDescriptor>,
}

/// What one liveness/replication tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Health transitions observed
    pub events: Vec<LivenessEvent>,
    /// Blocks newly queued because a holder died
    pub lost_replicas: Vec<BlockId>,
    /// Re-replication tasks that timed out and were re-queued
    pub expired: Vec<BlockId>,
    /// Re-replication tasks issued
    pub tasks: Vec<ReplicationTask>,
}

struct MetaState {
    namespace: Namespace,
    log: EditLog,
}

/// The namespace coordinator.
pub struct NamespaceCoordinator {
    config: CoordinatorConfig,
    state: RwLock<MetaState>,
    blocks: Mutex<BlockManager>,
    monitor: HeartbeatMonitor,
    placement: Box<dyn PlacementPolicy>,
    topology: Box<dyn NetworkTopology>,
    halted: AtomicBool,
    checkpoint_lock: Mutex<()>,
    last_checkpoint_ms: AtomicU64,
    last_checkpoint_seq: AtomicU64,
}

impl NamespaceCoordinator {
    /// Opens the coordinator with rack-aware placement, recovering the
    /// namespace from `config.meta_dir`.
    pub fn open(config: CoordinatorConfig) -> Result<Self, MetaError> {
        Self::open_with(
            config,
            Box::new(RackAwarePlacement::new()),
            Box::new(RackTopology),
        )
    }

    /// Opens the coordinator with a custom placement policy and topology.
    ///
    /// Recovery loads the newest readable checkpoint and replays every later
    /// log record in order before the coordinator serves requests.
    pub fn open_with(
        config: CoordinatorConfig,
        placement: Box<dyn PlacementPolicy>,
        topology: Box<dyn NetworkTopology>,
    ) -> Result<Self, MetaError> {
        fs::create_dir_all(&config.meta_dir)?;
        let (mut namespace, checkpoint_ms) = match checkpoint::load_latest(&config.meta_dir)? {
            Some(ckpt) => {
                info!(watermark = ckpt.watermark, "loaded checkpoint");
                (ckpt.namespace, ckpt.created_at_ms)
            }
            None => (Namespace::new(), now_ms()),
        };
        let watermark = namespace.last_applied();
        let records = edit_log::replay_after(&config.meta_dir, watermark)?;
        let replayed = records.len();
        for record in &records {
            namespace.apply(record)?;
        }
        let log = EditLog::open(&config.meta_dir, namespace.last_applied(), config.sync_log)?;
        info!(
            meta_dir = %config.meta_dir.display(),
            watermark,
            replayed,
            last_seq = namespace.last_applied(),
            inodes = namespace.inode_count(),
            "namespace recovered"
        );

        let monitor = HeartbeatMonitor::new(config.liveness.clone());
        Ok(Self {
            config,
            state: RwLock::new(MetaState { namespace, log }),
            blocks: Mutex::new(BlockManager::new()),
            monitor,
            placement,
            topology,
            halted: AtomicBool::new(false),
            checkpoint_lock: Mutex::new(()),
            last_checkpoint_ms: AtomicU64::new(checkpoint_ms),
            last_checkpoint_seq: AtomicU64::new(watermark),
        })
    }

    /// The configuration the coordinator runs with.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The datanode liveness monitor.
    pub fn monitor(&self) -> &HeartbeatMonitor {
        &self.monitor
    }

    /// Returns true once a durability failure stopped all mutations.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Sequence number of the last logged mutation.
    pub fn last_seq(&self) -> u64 {
        self.state.read().log.last_seq()
    }

    /// A consistent copy of the namespace.
    pub fn namespace_snapshot(&self) -> Namespace {
        self.state.read().namespace.clone()
    }

    fn check_halted(&self) -> Result<(), MetaError> {
        if self.is_halted() {
            return Err(MetaError::Halted);
        }
        Ok(())
    }

    fn halt(&self, err: MetaError) -> MetaError {
        if !self.halted.swap(true, Ordering::SeqCst) {
            error!(error = %err, "durability failure, coordinator halted");
        }
        err
    }

    fn log_and_apply(&self, state: &mut MetaState, op: LogOp) -> Result<Vec<BlockId>, MetaError> {
        let record = state.log.append(op).map_err(|e| self.halt(e))?;
        let released = state
            .namespace
            .apply(&record)
            .map_err(|e| self.halt(e))?;
        debug!(seq = record.seq, "applied namespace mutation");
        Ok(released)
    }

    fn release_blocks(&self, released: &[BlockId]) {
        if released.is_empty() {
            return;
        }
        let mut bm = self.blocks.lock();
        for block in released {
            for node in bm.remove_block(*block) {
                bm.invalidate(node, *block);
                self.monitor.remove_block(node, *block);
            }
        }
    }

    // Namespace operations

    /// Creates a directory. The parent must already exist.
    pub fn mkdir(&self, path: &str) -> Result<(), MetaError> {
        self.check_halted()?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let (parent, name) = state.namespace.resolve_parent(path)?;
        if state.namespace.resolve(path).is_ok() {
            return Err(MetaError::AlreadyExists {
                path: path.to_string(),
            });
        }
        let inode = state.namespace.next_inode_id();
        self.log_and_apply(
            state,
            LogOp::Create {
                parent,
                name: name.to_string(),
                inode,
                kind: InodeKind::Directory,
                replication: 0,
                mtime_ms: now_ms(),
            },
        )?;
        info!(path, inode = %inode, "created directory");
        Ok(())
    }

    /// Creates a directory and any missing ancestors. Succeeds if the
    /// directory already exists.
    pub fn mkdirs(&self, path: &str) -> Result<(), MetaError> {
        self.check_halted()?;
        let components = split_path(path)?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let mut current = InodeId::ROOT;
        let mut walked = String::from("/");
        for name in components {
            walked = join_path(&walked, name);
            let existing = state
                .namespace
                .inode(current)
                .and_then(|n| n.children.get(name).copied());
            match existing {
                Some(child) => {
                    if state.namespace.inode(child).is_some_and(|n| !n.is_dir()) {
                        return Err(MetaError::NotADirectory { path: walked });
                    }
                    current = child;
                }
                None => {
                    let inode = state.namespace.next_inode_id();
                    self.log_and_apply(
                        state,
                        LogOp::Create {
                            parent: current,
                            name: name.to_string(),
                            inode,
                            kind: InodeKind::Directory,
                            replication: 0,
                            mtime_ms: now_ms(),
                        },
                    )?;
                    debug!(path = %walked, inode = %inode, "created directory");
                    current = inode;
                }
            }
        }
        Ok(())
    }

    /// Creates an empty file ready for block allocation.
    ///
    /// With `overwrite`, an existing file is deleted first and its replicas
    /// invalidated. Directories are never overwritten.
    pub fn create_file(
        &self,
        path: &str,
        replication: Option<u16>,
        overwrite: bool,
    ) -> Result<FileStatus, MetaError> {
        self.check_halted()?;
        let replication = replication.unwrap_or(self.config.default_replication).max(1);
        let mut guard = self.state.write();
        let state = &mut *guard;
        let (parent, name) = state.namespace.resolve_parent(path)?;

        let mut released = Vec::new();
        if let Ok(existing) = state.namespace.resolve(path) {
            let is_dir = state.namespace.inode(existing).is_some_and(INode::is_dir);
            if is_dir {
                return Err(MetaError::IsADirectory {
                    path: path.to_string(),
                });
            }
            if !overwrite {
                return Err(MetaError::AlreadyExists {
                    path: path.to_string(),
                });
            }
            released = self.log_and_apply(
                state,
                LogOp::Delete {
                    inode: existing,
                    mtime_ms: now_ms(),
                },
            )?;
        }

        let inode = state.namespace.next_inode_id();
        self.log_and_apply(
            state,
            LogOp::Create {
                parent,
                name: name.to_string(),
                inode,
                kind: InodeKind::File,
                replication,
                mtime_ms: now_ms(),
            },
        )?;
        self.release_blocks(&released);
        info!(path, inode = %inode, replication, "created file");
        state.namespace.status(inode, self.config.block_size)
    }

    /// Deletes a file or directory. A non-empty directory requires
    /// `recursive`. Replicas of the deleted blocks are invalidated.
    pub fn delete(&self, path: &str, recursive: bool) -> Result<(), MetaError> {
        self.check_halted()?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let inode = state.namespace.resolve(path)?;
        if inode == InodeId::ROOT {
            return Err(MetaError::InvalidPath {
                path: path.to_string(),
                reason: "operation not permitted on the root",
            });
        }
        let non_empty = state
            .namespace
            .inode(inode)
            .is_some_and(|n| !n.children.is_empty());
        if non_empty && !recursive {
            return Err(MetaError::NotEmpty {
                path: path.to_string(),
            });
        }
        let released = self.log_and_apply(
            state,
            LogOp::Delete {
                inode,
                mtime_ms: now_ms(),
            },
        )?;
        self.release_blocks(&released);
        info!(path, blocks = released.len(), "deleted");
        Ok(())
    }

    /// Moves `src` to `dst`.
    ///
    /// If `dst` is an existing directory, `src` moves into it under its own
    /// name. An existing file at the destination is an error, as is moving a
    /// directory into its own subtree.
    pub fn rename(&self, src: &str, dst: &str) -> Result<(), MetaError> {
        self.check_halted()?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let ns = &state.namespace;

        let inode = ns.resolve(src)?;
        let src_name = match ns.inode(inode) {
            Some(node) if node.parent.is_some() => node.name.clone(),
            _ => {
                return Err(MetaError::InvalidPath {
                    path: src.to_string(),
                    reason: "operation not permitted on the root",
                })
            }
        };

        let (new_parent, new_name) = match ns.resolve(dst) {
            Ok(target) if ns.inode(target).is_some_and(INode::is_dir) => (target, src_name),
            Ok(_) => {
                return Err(MetaError::AlreadyExists {
                    path: dst.to_string(),
                })
            }
            Err(MetaError::NotFound { .. }) => {
                let (parent, name) = ns.resolve_parent(dst)?;
                (parent, name.to_string())
            }
            Err(e) => return Err(e),
        };

        if ns.is_ancestor(inode, new_parent) {
            return Err(MetaError::InvalidPath {
                path: dst.to_string(),
                reason: "cannot move a directory into its own subtree",
            });
        }
        let taken = ns
            .inode(new_parent)
            .is_some_and(|p| p.children.contains_key(&new_name));
        if taken {
            return Err(MetaError::AlreadyExists {
                path: join_path(&ns.path_of(new_parent), &new_name),
            });
        }

        self.log_and_apply(
            state,
            LogOp::Rename {
                inode,
                new_parent,
                new_name,
                mtime_ms: now_ms(),
            },
        )?;
        info!(src, dst, "renamed");
        Ok(())
    }

    // Block lifecycle

    fn file_inode<'a>(ns: &'a Namespace, path: &str) -> Result<&'a INode, MetaError> {
        let node = ns.lookup(path)?;
        if node.is_dir() {
            return Err(MetaError::IsADirectory {
                path: path.to_string(),
            });
        }
        Ok(node)
    }

    /// Allocates the next block of a file and chooses its pipeline.
    ///
    /// The previous block must be committed. Placement runs before anything
    /// is logged, so `InsufficientNodes` leaves no trace.
    pub fn allocate_block(
        &self,
        path: &str,
        writer: Option<NodeId>,
    ) -> Result<AllocatedBlock, MetaError> {
        self.check_halted()?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let file = Self::file_inode(&state.namespace, path)?;
        let inode = file.id;
        let offset = file.size;
        let replication = file.replication as usize;
        if let Some(last) = file.blocks.last() {
            let uncommitted = state
                .namespace
                .block(*last)
                .is_some_and(|b| b.state == BlockState::UnderConstruction);
            if uncommitted {
                return Err(MetaError::InvalidBlockState {
                    block: *last,
                    reason: "previous block is not committed",
                });
            }
        }

        let candidates: Vec<NodeDescriptor> = self
            .monitor
            .healthy_nodes()
            .iter()
            .map(NodeEntry::descriptor)
            .collect();
        let targets = self
            .placement
            .choose_targets(writer, replication, &candidates, &[])?;

        let block = state.namespace.next_block_id();
        self.log_and_apply(state, LogOp::AddBlock { inode, block })?;
        info!(
            path,
            block = %block,
            targets = ?targets.iter().map(|t| t.id).collect::<Vec<_>>(),
            "allocated block"
        );
        Ok(AllocatedBlock {
            block,
            offset,
            targets,
        })
    }

    /// Commits an under-construction block with its final length and the
    /// replicas the pipeline acknowledged.
    ///
    /// A block committed with fewer replicas than the file's replication
    /// factor is queued for re-replication.
    pub fn commit_block(
        &self,
        path: &str,
        block: BlockId,
        len: u64,
        replicas: &[ReplicaLocation],
    ) -> Result<(), MetaError> {
        self.check_halted()?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let file = Self::file_inode(&state.namespace, path)?;
        let inode = file.id;
        let replication = file.replication as usize;
        let meta = state
            .namespace
            .block(block)
            .filter(|m| m.inode == inode)
            .ok_or(MetaError::UnknownBlock(block))?;
        if meta.state != BlockState::UnderConstruction {
            return Err(MetaError::InvalidBlockState {
                block,
                reason: "block is already committed",
            });
        }
        if len > self.config.block_size {
            return Err(MetaError::InvalidBlockState {
                block,
                reason: "length exceeds the block size",
            });
        }
        if replicas.is_empty() {
            return Err(MetaError::InvalidBlockState {
                block,
                reason: "no replica acknowledged the block",
            });
        }

        self.log_and_apply(
            state,
            LogOp::CommitBlock {
                inode,
                block,
                size: len,
                mtime_ms: now_ms(),
            },
        )?;

        let mut bm = self.blocks.lock();
        for replica in replicas {
            // The node may have died since the pipeline acked.
            let usable = matches!(
                self.monitor.health(replica.node),
                Some(NodeHealth::Alive | NodeHealth::Stale)
            );
            if usable && self.monitor.add_block(replica.node, block).is_ok() {
                bm.add_replica(block, replica.node, replica.checksum);
            } else {
                warn!(block = %block, node = %replica.node, "ignoring replica on unavailable node");
            }
        }
        let live = bm.replicas(block).len();
        if live < replication {
            bm.mark_under_replicated(block);
            warn!(block = %block, live, replication, "committed under-replicated block");
        }
        info!(path, block = %block, len, replicas = live, "committed block");
        Ok(())
    }

    /// Drops the file's last, uncommitted block after a failed write.
    pub fn abandon_block(&self, path: &str, block: BlockId) -> Result<(), MetaError> {
        self.check_halted()?;
        let mut guard = self.state.write();
        let state = &mut *guard;
        let file = Self::file_inode(&state.namespace, path)?;
        let inode = file.id;
        if file.blocks.last() != Some(&block) {
            return Err(MetaError::InvalidBlockState {
                block,
                reason: "only the last block of a file can be abandoned",
            });
        }
        let committed = state
            .namespace
            .block(block)
            .is_some_and(|m| m.state == BlockState::Complete);
        if committed {
            return Err(MetaError::InvalidBlockState {
                block,
                reason: "block is already committed",
            });
        }
        let released = self.log_and_apply(state, LogOp::AbandonBlock { inode, block })?;
        self.release_blocks(&released);
        info!(path, block = %block, "abandoned block");
        Ok(())
    }

    // Queries

    /// Status of a single path.
    pub fn get_file_status(&self, path: &str) -> Result<FileStatus, MetaError> {
        let state = self.state.read();
        let id = state.namespace.resolve(path)?;
        state.namespace.status(id, self.config.block_size)
    }

    /// Children of a directory in name order, or the file itself.
    pub fn list_status(&self, path: &str) -> Result<Vec<FileStatus>, MetaError> {
        let state = self.state.read();
        let ns = &state.namespace;
        let node = ns.lookup(path)?;
        if !node.is_dir() {
            return Ok(vec![ns.status(node.id, self.config.block_size)?]);
        }
        node.children
            .values()
            .map(|child| ns.status(*child, self.config.block_size))
            .collect()
    }

    /// Files under `path` with their block locations, depth first in name
    /// order. Without `recursive` only direct children are listed.
    pub fn list_files(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<LocatedFileStatus>, MetaError> {
        let state = self.state.read();
        let ns = &state.namespace;
        let root = ns.lookup(path)?;
        let bm = self.blocks.lock();

        let mut out = Vec::new();
        let mut stack = vec![(root.id, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let Some(node) = ns.inode(id) else { continue };
            if !node.is_dir() {
                out.push(LocatedFileStatus {
                    status: ns.status(id, self.config.block_size)?,
                    blocks: self.locate(ns, &bm, node, None),
                });
                continue;
            }
            if depth > 0 && !recursive {
                continue;
            }
            // Reverse so the stack pops children in name order.
            for child in node.children.values().rev() {
                stack.push((*child, depth + 1));
            }
        }
        Ok(out)
    }

    /// Blocks of a file with replicas ordered nearest to `reader` first.
    /// Replicas on stale nodes sort last.
    pub fn get_block_locations(
        &self,
        path: &str,
        reader: Option<NodeId>,
    ) -> Result<Vec<LocatedBlock>, MetaError> {
        let state = self.state.read();
        let file = Self::file_inode(&state.namespace, path)?;
        let reader = reader
            .and_then(|id| self.monitor.node(id))
            .map(|entry| entry.descriptor());
        let bm = self.blocks.lock();
        Ok(self.locate(&state.namespace, &bm, file, reader.as_ref()))
    }

    fn locate(
        &self,
        ns: &Namespace,
        bm: &BlockManager,
        file: &INode,
        reader: Option<&NodeDescriptor>,
    ) -> Vec<LocatedBlock> {
        let mut offset = 0;
        let mut located = Vec::with_capacity(file.blocks.len());
        for block in &file.blocks {
            let Some(meta) = ns.block(*block) else { continue };
            let mut hosts: Vec<(bool, u32, ReplicaHost)> = bm
                .replicas(*block)
                .iter()
                .filter_map(|r| {
                    let entry = self.monitor.node(r.node)?;
                    if entry.health == NodeHealth::Dead {
                        return None;
                    }
                    let descriptor = entry.descriptor();
                    let distance = reader
                        .map(|rd| self.topology.distance(rd, &descriptor))
                        .unwrap_or(RackTopology::OFF_RACK);
                    Some((
                        entry.health != NodeHealth::Alive,
                        distance,
                        ReplicaHost {
                            node: entry.id,
                            address: entry.address,
                            rack: entry.rack,
                            checksum: r.checksum,
                        },
                    ))
                })
                .collect();
            hosts.sort_by_key(|(stale, distance, _)| (*stale, *distance));
            located.push(LocatedBlock {
                block: *block,
                offset,
                len: meta.size,
                complete: meta.state == BlockState::Complete,
                locations: hosts.into_iter().map(|(_, _, h)| h).collect(),
            });
            offset += meta.size;
        }
        located
    }

    /// Every block the namespace references.
    pub fn reachable_blocks(&self) -> HashSet<BlockId> {
        self.state.read().namespace.blocks().map(|b| b.id).collect()
    }

    /// Known replicas of a block.
    pub fn replicas(&self, block: BlockId) -> Vec<ReplicaLocation> {
        self.blocks.lock().replicas(block).to_vec()
    }

    /// Blocks waiting for re-replication.
    pub fn under_replicated_blocks(&self) -> Vec<BlockId> {
        self.blocks.lock().under_replicated()
    }

    /// Re-replication tasks in flight.
    pub fn pending_replications(&self) -> Vec<ReplicationTask> {
        self.blocks.lock().pending_tasks()
    }

    // Datanode protocol

    /// Registers a datanode. It should follow up with a block report.
    pub fn register_node(&self, id: NodeId, address: String, rack: String, now_ms: u64) {
        self.monitor.register_node(id, address, rack, now_ms);
    }

    /// Records a heartbeat and returns the commands queued for the node.
    ///
    /// A dead node that heartbeats again is revived and asked for a block
    /// report before it serves reads again.
    pub fn heartbeat(&self, id: NodeId, now_ms: u64) -> Result<Vec<NodeCommand>, MetaError> {
        let revived = self.monitor.heartbeat(id, now_ms)?;
        let mut bm = self.blocks.lock();
        if revived {
            bm.queue_command(id, NodeCommand::SendBlockReport);
        }
        Ok(bm.drain_commands(id))
    }

    /// Reconciles a full block report with the namespace.
    ///
    /// Replicas of blocks the namespace does not know, or whose length does
    /// not match the committed one, are scheduled for deletion. Blocks the
    /// node no longer reports lose it as a location.
    pub fn block_report(
        &self,
        id: NodeId,
        replicas: &[ReplicaInfo],
        now_ms: u64,
    ) -> Result<(), MetaError> {
        let previous = self
            .monitor
            .node(id)
            .ok_or(MetaError::UnknownNode(id))?
            .blocks;
        self.monitor
            .block_report(id, replicas.iter().map(|r| r.block_id), now_ms)?;

        let state = self.state.read();
        let ns = &state.namespace;
        let mut bm = self.blocks.lock();
        let reported: HashSet<BlockId> = replicas.iter().map(|r| r.block_id).collect();
        let mut invalidated = 0usize;

        for replica in replicas {
            let block = replica.block_id;
            let Some(meta) = ns.block(block) else {
                bm.invalidate(id, block);
                self.monitor.remove_block(id, block);
                invalidated += 1;
                continue;
            };
            if meta.state == BlockState::Complete && replica.len != meta.size {
                warn!(node = %id, block = %block, len = replica.len, expected = meta.size,
                    "reported replica has the wrong length");
                bm.remove_replica(block, id);
                bm.invalidate(id, block);
                self.monitor.remove_block(id, block);
                invalidated += 1;
                continue;
            }
            let expected = Self::expected_replication(ns, meta.inode);
            let added = bm.add_replica(block, id, replica.checksum);
            let count = bm.replicas(block).len();
            if added && meta.state == BlockState::Complete && count > expected {
                bm.remove_replica(block, id);
                bm.invalidate(id, block);
                self.monitor.remove_block(id, block);
                invalidated += 1;
                continue;
            }
            if count >= expected {
                bm.clear_under_replicated(block);
            }
        }

        for block in previous.difference(&reported) {
            if bm.remove_replica(*block, id) {
                Self::requeue_if_short(ns, &mut bm, *block);
            }
        }
        info!(node = %id, reported = replicas.len(), invalidated, "block report reconciled");
        Ok(())
    }

    /// Records a replica written outside a client pipeline, typically by a
    /// re-replication task.
    pub fn block_received(
        &self,
        id: NodeId,
        block: BlockId,
        len: u64,
        checksum: u32,
    ) -> Result<(), MetaError> {
        match self.monitor.health(id) {
            None => return Err(MetaError::UnknownNode(id)),
            Some(NodeHealth::Dead) => return Err(MetaError::StaleNode(id)),
            Some(_) => {}
        }
        let state = self.state.read();
        let ns = &state.namespace;
        let mut bm = self.blocks.lock();
        let Some(meta) = ns.block(block) else {
            bm.invalidate(id, block);
            return Err(MetaError::UnknownBlock(block));
        };
        if meta.state == BlockState::Complete && len != meta.size {
            bm.target_completed(block, id);
            bm.invalidate(id, block);
            return Err(MetaError::InvalidBlockState {
                block,
                reason: "received replica has the wrong length",
            });
        }
        bm.add_replica(block, id, checksum);
        self.monitor.add_block(id, block)?;
        bm.target_completed(block, id);
        let count = bm.replicas(block).len();
        let expected = Self::expected_replication(ns, meta.inode);
        if count >= expected {
            bm.clear_under_replicated(block);
        } else if bm.pending_task(block).is_none() {
            bm.mark_under_replicated(block);
        }
        debug!(node = %id, block = %block, replicas = count, "replica received");
        Ok(())
    }

    /// Handles a replica that failed checksum verification: the location is
    /// dropped, the node told to delete it and the block queued for a fresh
    /// copy.
    pub fn report_corrupt_replica(&self, block: BlockId, id: NodeId) -> Result<(), MetaError> {
        let state = self.state.read();
        let ns = &state.namespace;
        if ns.block(block).is_none() {
            return Err(MetaError::UnknownBlock(block));
        }
        let mut bm = self.blocks.lock();
        bm.remove_replica(block, id);
        bm.invalidate(id, block);
        self.monitor.remove_block(id, block);
        Self::requeue_if_short(ns, &mut bm, block);
        warn!(node = %id, block = %block, remaining = bm.replicas(block).len(), "corrupt replica reported");
        Ok(())
    }

    fn expected_replication(ns: &Namespace, inode: InodeId) -> usize {
        ns.inode(inode).map(|n| n.replication as usize).unwrap_or(0)
    }

    fn requeue_if_short(ns: &Namespace, bm: &mut BlockManager, block: BlockId) {
        let Some(meta) = ns.block(block) else { return };
        if meta.state != BlockState::Complete {
            return;
        }
        if bm.replicas(block).len() < Self::expected_replication(ns, meta.inode) {
            bm.mark_under_replicated(block);
        }
    }

    // Background work

    /// Advances node liveness to `now_ms`, queues blocks that lost replicas,
    /// re-queues timed-out tasks and issues new re-replication work.
    pub fn tick(&self, now_ms: u64) -> TickReport {
        let events = self.monitor.tick(now_ms);
        let mut report = TickReport::default();
        {
            let state = self.state.read();
            let ns = &state.namespace;
            let mut bm = self.blocks.lock();
            for event in &events {
                let LivenessEvent::NodeDead { node, .. } = event else {
                    continue;
                };
                for task in bm.pending_tasks() {
                    if task.source == *node || task.targets.iter().any(|t| t.id == *node) {
                        bm.cancel_task(task.block);
                    }
                }
                for block in bm.forget_node(*node) {
                    Self::requeue_if_short(ns, &mut bm, block);
                    if bm.is_under_replicated(block) {
                        report.lost_replicas.push(block);
                    }
                }
                info!(node = %node, lost = report.lost_replicas.len(), "evicted dead datanode");
            }
            report.expired = bm.expire_tasks(now_ms, self.config.replication_timeout_ms);
        }
        report.tasks = self.compute_replication_work(now_ms);
        report.events = events;
        report
    }

    /// Issues re-replication tasks for queued blocks, at most one in flight
    /// per block.
    pub fn compute_replication_work(&self, now_ms: u64) -> Vec<ReplicationTask> {
        let state = self.state.read();
        let ns = &state.namespace;
        let mut bm = self.blocks.lock();
        let healthy: Vec<NodeDescriptor> = self
            .monitor
            .healthy_nodes()
            .iter()
            .map(NodeEntry::descriptor)
            .collect();

        let mut tasks = Vec::new();
        for block in bm.under_replicated() {
            if tasks.len() >= self.config.max_replication_tasks_per_tick {
                break;
            }
            if bm.pending_task(block).is_some() {
                continue;
            }
            let Some(meta) = ns.block(block) else {
                bm.clear_under_replicated(block);
                continue;
            };
            if meta.state != BlockState::Complete {
                bm.clear_under_replicated(block);
                continue;
            }
            let expected = Self::expected_replication(ns, meta.inode);
            let holders: Vec<NodeEntry> = bm
                .replicas(block)
                .iter()
                .filter_map(|r| self.monitor.node(r.node))
                .collect();
            if holders.len() >= expected {
                bm.clear_under_replicated(block);
                continue;
            }
            let Some(source) = holders.iter().find(|h| h.health == NodeHealth::Alive) else {
                warn!(block = %block, "no live replica to copy from");
                continue;
            };
            let existing: Vec<NodeDescriptor> = holders.iter().map(NodeEntry::descriptor).collect();
            // Nodes still holding a discarded copy cannot take a new one yet.
            let candidates: Vec<NodeDescriptor> = healthy
                .iter()
                .filter(|n| !existing.iter().any(|e| e.id == n.id))
                .filter(|n| !bm.invalidation_pending(n.id, block))
                .cloned()
                .collect();
            let wanted = (expected - holders.len()).min(candidates.len());
            if wanted == 0 {
                continue;
            }
            let targets = match self
                .placement
                .choose_targets(None, wanted, &candidates, &existing)
            {
                Ok(targets) => targets,
                Err(e) => {
                    debug!(block = %block, error = %e, "cannot place re-replication targets");
                    continue;
                }
            };
            let task = ReplicationTask {
                block,
                source: source.id,
                targets,
                issued_at_ms: now_ms,
            };
            if bm.start_task(task.clone()) {
                info!(
                    block = %block,
                    source = %task.source,
                    targets = ?task.targets.iter().map(|t| t.id).collect::<Vec<_>>(),
                    "scheduled re-replication"
                );
                tasks.push(task);
            }
        }
        tasks
    }

    /// Returns true when enough records or enough time accumulated since the
    /// last checkpoint.
    pub fn checkpoint_due(&self, now_ms: u64) -> bool {
        let last_seq = self.last_seq();
        let since = last_seq.saturating_sub(self.last_checkpoint_seq.load(Ordering::SeqCst));
        if since == 0 {
            return false;
        }
        since >= self.config.checkpoint_txns
            || now_ms.saturating_sub(self.last_checkpoint_ms.load(Ordering::SeqCst))
                >= self.config.checkpoint_interval_ms
    }

    /// Writes a checkpoint of the current namespace.
    ///
    /// The mutation lock is held only to roll the log and clone the
    /// namespace. Returns the watermark, or None when nothing changed since
    /// the last checkpoint.
    pub fn checkpoint(&self, now_ms: u64) -> Result<Option<u64>, MetaError> {
        let _single = self.checkpoint_lock.lock();
        self.check_halted()?;
        let snapshot = {
            let mut state = self.state.write();
            if state.namespace.last_applied() == self.last_checkpoint_seq.load(Ordering::SeqCst) {
                return Ok(None);
            }
            state.log.roll().map_err(|e| self.halt(e))?;
            Checkpoint::capture(&state.namespace, now_ms)
        };

        let dir = &self.config.meta_dir;
        checkpoint::write(dir, &snapshot, self.config.sync_log).map_err(|e| self.halt(e))?;
        self.last_checkpoint_seq
            .store(snapshot.watermark, Ordering::SeqCst);
        self.last_checkpoint_ms.store(now_ms, Ordering::SeqCst);

        match checkpoint::purge_older(dir, self.config.retain_checkpoints) {
            Ok(Some(oldest)) => {
                if let Err(e) = edit_log::purge_through(dir, oldest) {
                    warn!(error = %e, "failed to purge edit log segments");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to purge old checkpoints"),
        }
        info!(watermark = snapshot.watermark, "checkpoint complete");
        Ok(Some(snapshot.watermark))
    }
}
