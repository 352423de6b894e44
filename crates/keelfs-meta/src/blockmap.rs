//! Soft-state block map: where replicas live and what nodes must do next.
//!
//! Nothing here is persisted. After a restart locations are rebuilt from
//! datanode block reports, and the re-replication queue refills from the
//! resulting replica counts.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::placement::NodeDescriptor;
use crate::types::*;

/// One replica of a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaLocation {
    /// Node holding the replica
    pub node: NodeId,
    /// Checksum digest reported for the replica
    pub checksum: u32,
}

/// A re-replication order issued to a source node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTask {
    /// The block to copy
    pub block: BlockId,
    /// Node to read the block from
    pub source: NodeId,
    /// Nodes that should receive a copy
    pub targets: Vec<NodeDescriptor>,
    /// When the task was issued
    pub issued_at_ms: u64,
}

/// Work the coordinator hands a datanode in a heartbeat reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeCommand {
    /// Copy a block to other nodes
    Replicate(ReplicationTask),
    /// Delete the listed replicas
    Invalidate {
        /// Blocks to delete
        blocks: Vec<BlockId>,
    },
    /// Send a full block report
    SendBlockReport,
}

/// Replica index, re-replication queue and per-node command queues.
#[derive(Debug, Default)]
pub struct BlockManager {
    locations: HashMap<BlockId, Vec<ReplicaLocation>>,
    under_replicated: BTreeSet<BlockId>,
    pending: BTreeMap<BlockId, ReplicationTask>,
    invalidate: HashMap<NodeId, BTreeSet<BlockId>>,
    commands: HashMap<NodeId, Vec<NodeCommand>>,
}

impl BlockManager {
    /// Creates an empty block manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a replica. Returns false if the node already had one.
    pub fn add_replica(&mut self, block: BlockId, node: NodeId, checksum: u32) -> bool {
        let replicas = self.locations.entry(block).or_default();
        if let Some(existing) = replicas.iter_mut().find(|r| r.node == node) {
            existing.checksum = checksum;
            return false;
        }
        replicas.push(ReplicaLocation { node, checksum });
        true
    }

    /// Forgets a replica. Returns true if it was known.
    pub fn remove_replica(&mut self, block: BlockId, node: NodeId) -> bool {
        let Some(replicas) = self.locations.get_mut(&block) else {
            return false;
        };
        let before = replicas.len();
        replicas.retain(|r| r.node != node);
        let removed = replicas.len() != before;
        if replicas.is_empty() {
            self.locations.remove(&block);
        }
        removed
    }

    /// Known replicas of a block, in insertion order.
    pub fn replicas(&self, block: BlockId) -> &[ReplicaLocation] {
        self.locations.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns true if `node` holds a replica of `block`.
    pub fn has_replica(&self, block: BlockId, node: NodeId) -> bool {
        self.replicas(block).iter().any(|r| r.node == node)
    }

    /// Drops every trace of a block and returns the nodes that held it.
    pub fn remove_block(&mut self, block: BlockId) -> Vec<NodeId> {
        self.under_replicated.remove(&block);
        self.pending.remove(&block);
        self.locations
            .remove(&block)
            .map(|r| r.into_iter().map(|l| l.node).collect())
            .unwrap_or_default()
    }

    /// Removes a node from every replica list. Returns the affected blocks.
    pub fn forget_node(&mut self, node: NodeId) -> Vec<BlockId> {
        let mut affected = Vec::new();
        self.locations.retain(|block, replicas| {
            let before = replicas.len();
            replicas.retain(|r| r.node != node);
            if replicas.len() != before {
                affected.push(*block);
            }
            !replicas.is_empty()
        });
        self.invalidate.remove(&node);
        self.commands.remove(&node);
        affected.sort();
        affected
    }

    /// Queues a block for re-replication.
    pub fn mark_under_replicated(&mut self, block: BlockId) {
        if self.under_replicated.insert(block) {
            debug!(block = %block, "block queued for re-replication");
        }
    }

    /// Removes a block from the re-replication queue.
    pub fn clear_under_replicated(&mut self, block: BlockId) {
        self.under_replicated.remove(&block);
    }

    /// Blocks waiting for re-replication, in id order.
    pub fn under_replicated(&self) -> Vec<BlockId> {
        self.under_replicated.iter().copied().collect()
    }

    /// Returns true if the block is queued for re-replication.
    pub fn is_under_replicated(&self, block: BlockId) -> bool {
        self.under_replicated.contains(&block)
    }

    /// The in-flight task for a block, if any.
    pub fn pending_task(&self, block: BlockId) -> Option<&ReplicationTask> {
        self.pending.get(&block)
    }

    /// In-flight re-replication tasks.
    pub fn pending_tasks(&self) -> Vec<ReplicationTask> {
        self.pending.values().cloned().collect()
    }

    /// Registers a task and queues it on the source node.
    ///
    /// At most one task per block may be in flight; returns false otherwise.
    pub fn start_task(&mut self, task: ReplicationTask) -> bool {
        if self.pending.contains_key(&task.block) {
            return false;
        }
        self.under_replicated.remove(&task.block);
        self.commands
            .entry(task.source)
            .or_default()
            .push(NodeCommand::Replicate(task.clone()));
        self.pending.insert(task.block, task);
        true
    }

    /// Marks one target of a pending task as done. The task is retired once
    /// every target has reported.
    pub fn target_completed(&mut self, block: BlockId, node: NodeId) {
        if let Some(task) = self.pending.get_mut(&block) {
            task.targets.retain(|t| t.id != node);
            if task.targets.is_empty() {
                self.pending.remove(&block);
            }
        }
    }

    /// Abandons a pending task and puts the block back in the queue.
    pub fn cancel_task(&mut self, block: BlockId) {
        if self.pending.remove(&block).is_some() {
            self.under_replicated.insert(block);
        }
    }

    /// Re-queues tasks issued more than `timeout_ms` ago.
    pub fn expire_tasks(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<BlockId> {
        let expired: Vec<BlockId> = self
            .pending
            .values()
            .filter(|t| now_ms.saturating_sub(t.issued_at_ms) >= timeout_ms)
            .map(|t| t.block)
            .collect();
        for block in &expired {
            self.pending.remove(block);
            self.under_replicated.insert(*block);
            debug!(block = %block, "re-replication task timed out");
        }
        expired
    }

    /// Queues a replica deletion on a node.
    pub fn invalidate(&mut self, node: NodeId, block: BlockId) {
        self.invalidate.entry(node).or_default().insert(block);
    }

    /// Returns true if `node` still has to delete its replica of `block`.
    pub fn invalidation_pending(&self, node: NodeId, block: BlockId) -> bool {
        self.invalidate
            .get(&node)
            .is_some_and(|blocks| blocks.contains(&block))
    }

    /// Queues an arbitrary command on a node.
    pub fn queue_command(&mut self, node: NodeId, command: NodeCommand) {
        let queue = self.commands.entry(node).or_default();
        if !queue.contains(&command) {
            queue.push(command);
        }
    }

    /// Takes every command queued for a node, invalidations last.
    pub fn drain_commands(&mut self, node: NodeId) -> Vec<NodeCommand> {
        let mut out = self.commands.remove(&node).unwrap_or_default();
        if let Some(blocks) = self.invalidate.remove(&node) {
            if !blocks.is_empty() {
                out.push(NodeCommand::Invalidate {
                    blocks: blocks.into_iter().collect(),
                });
            }
        }
        out
    }

    /// Number of blocks with at least one known replica.
    pub fn located_blocks(&self) -> usize {
        self.locations.len()
    }
}
