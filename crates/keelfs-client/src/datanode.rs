//! Datanode service: registration, heartbeats, block reports and the
//! commands the coordinator hands back.

use std::sync::Arc;
use std::time::Duration;

use keelfs_meta::{now_ms, NamespaceCoordinator, NodeCommand, NodeId};
use keelfs_repl::ReReplicator;
use keelfs_storage::{BlockId, BlockStore, ReplicaInfo, StorageError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ClientResult;

/// What one round of command processing did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandStats {
    /// Re-replication tasks that completed
    pub replicated: usize,
    /// Re-replication tasks that failed
    pub replication_failures: usize,
    /// Replicas deleted on request
    pub invalidated: usize,
    /// Replicas that could not be deleted
    pub invalidation_failures: usize,
    /// Block reports sent
    pub reports: usize,
}

/// A storage node bound to a coordinator.
pub struct DataNode {
    id: NodeId,
    address: String,
    rack: String,
    store: Arc<BlockStore>,
    coordinator: Arc<NamespaceCoordinator>,
    rereplicator: ReReplicator,
    cancel: CancellationToken,
}

impl DataNode {
    /// Creates a datanode; call [`DataNode::register`] before heartbeating.
    pub fn new(
        id: NodeId,
        address: String,
        rack: String,
        store: Arc<BlockStore>,
        coordinator: Arc<NamespaceCoordinator>,
        rereplicator: ReReplicator,
    ) -> Self {
        Self {
            id,
            address,
            rack,
            store,
            coordinator,
            rereplicator,
            cancel: CancellationToken::new(),
        }
    }

    /// Node ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Rack of the node.
    pub fn rack(&self) -> &str {
        &self.rack
    }

    /// Local replica store.
    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    /// Stops in-flight re-replication and the heartbeat loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Registers with the coordinator and sends a full block report.
    pub fn register(&self, now_ms: u64) -> ClientResult<()> {
        self.coordinator
            .register_node(self.id, self.address.clone(), self.rack.clone(), now_ms);
        self.send_block_report(now_ms)
    }

    /// Reports every finalized replica. Replicas whose checksum file is
    /// unreadable are deleted instead of reported.
    pub fn send_block_report(&self, now_ms: u64) -> ClientResult<()> {
        let mut replicas: Vec<ReplicaInfo> = Vec::new();
        for block in self.store.block_report()? {
            match self.store.replica_info(block) {
                Ok(info) => replicas.push(info),
                Err(e) if e.is_corruption() => {
                    warn!(node = %self.id, block = %block, error = %e, "dropping unreadable replica");
                    self.delete_replica(block)?;
                }
                Err(StorageError::BlockNotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.coordinator.block_report(self.id, &replicas, now_ms)?;
        debug!(node = %self.id, replicas = replicas.len(), "sent block report");
        Ok(())
    }

    /// Sends one heartbeat and carries out the returned commands.
    pub async fn heartbeat(&self, now_ms: u64) -> ClientResult<CommandStats> {
        let commands = self.coordinator.heartbeat(self.id, now_ms)?;
        self.process(commands, now_ms).await
    }

    /// Executes coordinator commands in order.
    pub async fn process(
        &self,
        commands: Vec<NodeCommand>,
        now_ms: u64,
    ) -> ClientResult<CommandStats> {
        let mut stats = CommandStats::default();
        for command in commands {
            match command {
                NodeCommand::Replicate(task) => {
                    match self.rereplicator.execute(&task, &self.cancel).await {
                        Ok(_) => stats.replicated += 1,
                        Err(e) => {
                            warn!(node = %self.id, block = %task.block, error = %e, "re-replication failed");
                            stats.replication_failures += 1;
                        }
                    }
                }
                NodeCommand::Invalidate { blocks } => {
                    for block in blocks {
                        match self.delete_replica(block) {
                            Ok(()) => stats.invalidated += 1,
                            Err(e) => {
                                warn!(node = %self.id, block = %block, error = %e, "invalidation failed");
                                stats.invalidation_failures += 1;
                            }
                        }
                    }
                }
                NodeCommand::SendBlockReport => {
                    self.send_block_report(now_ms)?;
                    stats.reports += 1;
                }
            }
        }
        Ok(stats)
    }

    fn delete_replica(&self, block: BlockId) -> ClientResult<()> {
        match self.store.delete(block) {
            Ok(()) | Err(StorageError::BlockNotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Verifies every finalized replica and reports the corrupt ones.
    /// Returns the blocks found corrupt.
    pub fn scan_replicas(&self) -> ClientResult<Vec<BlockId>> {
        let mut corrupt = Vec::new();
        for block in self.store.block_report()? {
            let intact = match self.store.verify(block) {
                Ok(intact) => intact,
                Err(e) if e.is_corruption() => false,
                Err(StorageError::BlockNotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            if intact {
                continue;
            }
            corrupt.push(block);
            if let Err(e) = self.coordinator.report_corrupt_replica(block, self.id) {
                debug!(node = %self.id, block = %block, error = %e, "corrupt replica not in namespace");
            }
        }
        if !corrupt.is_empty() {
            warn!(node = %self.id, corrupt = corrupt.len(), "replica scan found corrupt replicas");
        }
        Ok(corrupt)
    }

    /// Deletes local replicas of blocks no longer in the namespace,
    /// including partial replicas left by aborted writes.
    pub fn collect_garbage(&self) -> ClientResult<Vec<BlockId>> {
        let reachable = self.coordinator.reachable_blocks();
        Ok(self.store.retain(&reachable)?)
    }

    /// Heartbeats every `period` until [`DataNode::shutdown`].
    pub fn spawn_heartbeat_loop(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if let Err(e) = self.heartbeat(now_ms()).await {
                    warn!(node = %self.id, error = %e, "heartbeat failed");
                }
            }
            info!(node = %self.id, "heartbeat loop stopped");
        })
    }
}
