//! An in-process cluster: one coordinator and a set of datanodes sharing a
//! local transport. Used by the CLI and by integration tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use keelfs_meta::{now_ms, NamespaceCoordinator, NodeId, TickReport};
use keelfs_repl::{LocalTransport, ReReplicator, ReplicationPipeline};
use keelfs_storage::BlockStore;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::client::DfsClient;
use crate::config::ClusterConfig;
use crate::datanode::{CommandStats, DataNode};
use crate::error::{ClientError, ClientResult};

/// A whole cluster in one process.
pub struct MiniCluster {
    config: ClusterConfig,
    coordinator: Arc<NamespaceCoordinator>,
    transport: Arc<LocalTransport>,
    pipeline: Arc<ReplicationPipeline>,
    datanodes: BTreeMap<NodeId, Arc<DataNode>>,
    stopped: RwLock<BTreeSet<NodeId>>,
}

impl MiniCluster {
    /// Recovers the namespace under `config.data_dir`, opens every datanode
    /// store and registers the nodes at the current time.
    pub fn start(config: ClusterConfig) -> ClientResult<Self> {
        Self::start_at(config, now_ms())
    }

    /// Like [`MiniCluster::start`] with an explicit registration time.
    pub fn start_at(config: ClusterConfig, now_ms: u64) -> ClientResult<Self> {
        config.validate()?;
        let coordinator = Arc::new(NamespaceCoordinator::open(config.coordinator_config())?);
        let transport = Arc::new(LocalTransport::new());
        let pipeline = Arc::new(ReplicationPipeline::new(
            transport.clone(),
            config.pipeline.clone(),
        ));

        let mut datanodes = BTreeMap::new();
        for node_spec in &config.nodes {
            let id = node_spec.node_id();
            let store = Arc::new(BlockStore::open(config.node_dir(id), config.store.clone())?);
            transport.add_node(id, Arc::clone(&store));
            let node = DataNode::new(
                id,
                node_spec.address(),
                node_spec.rack.clone(),
                store,
                Arc::clone(&coordinator),
                ReReplicator::new(Arc::clone(&pipeline), Arc::clone(&coordinator)),
            );
            node.register(now_ms)?;
            datanodes.insert(id, Arc::new(node));
        }
        info!(
            data_dir = %config.data_dir.display(),
            nodes = datanodes.len(),
            last_seq = coordinator.last_seq(),
            "cluster started"
        );

        Ok(Self {
            config,
            coordinator,
            transport,
            pipeline,
            datanodes,
            stopped: RwLock::new(BTreeSet::new()),
        })
    }

    /// The configuration the cluster was started with.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The coordinator.
    pub fn coordinator(&self) -> &Arc<NamespaceCoordinator> {
        &self.coordinator
    }

    /// The shared data transport.
    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    /// A datanode by ID.
    pub fn datanode(&self, id: NodeId) -> ClientResult<&Arc<DataNode>> {
        self.datanodes.get(&id).ok_or(ClientError::NoSuchNode(id))
    }

    /// IDs of all configured datanodes.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.datanodes.keys().copied().collect()
    }

    /// True if the node was stopped with [`MiniCluster::kill_node`].
    pub fn is_stopped(&self, id: NodeId) -> bool {
        self.stopped.read().contains(&id)
    }

    /// A client over this cluster's pipeline.
    pub fn client(&self) -> DfsClient {
        DfsClient::new(
            Arc::clone(&self.coordinator),
            Arc::clone(&self.pipeline),
            self.config.retry.clone(),
        )
    }

    /// Takes a node offline: it stops heartbeating and its data becomes
    /// unreachable. Its replicas stay on disk.
    pub fn kill_node(&self, id: NodeId) -> ClientResult<()> {
        self.datanode(id)?;
        self.transport.set_down(id, true);
        self.stopped.write().insert(id);
        warn!(node = %id, "datanode killed");
        Ok(())
    }

    /// Brings a killed node back: it re-registers and sends a block report.
    pub fn restart_node(&self, id: NodeId, now_ms: u64) -> ClientResult<()> {
        let node = self.datanode(id)?;
        self.transport.set_down(id, false);
        self.stopped.write().remove(&id);
        node.register(now_ms)?;
        info!(node = %id, "datanode restarted");
        Ok(())
    }

    /// Heartbeats every running datanode and executes the returned commands.
    pub async fn heartbeat_all(&self, now_ms: u64) -> ClientResult<CommandStats> {
        let mut total = CommandStats::default();
        for (id, node) in &self.datanodes {
            if self.is_stopped(*id) {
                continue;
            }
            let stats = node.heartbeat(now_ms).await?;
            total.replicated += stats.replicated;
            total.replication_failures += stats.replication_failures;
            total.invalidated += stats.invalidated;
            total.invalidation_failures += stats.invalidation_failures;
            total.reports += stats.reports;
        }
        Ok(total)
    }

    /// One round of cluster housekeeping at `now_ms`: heartbeats, the
    /// coordinator tick, then another heartbeat round so freshly issued
    /// commands run.
    pub async fn step(&self, now_ms: u64) -> ClientResult<TickReport> {
        self.heartbeat_all(now_ms).await?;
        let report = self.coordinator.tick(now_ms);
        self.heartbeat_all(now_ms).await?;
        Ok(report)
    }

    /// Runs the garbage-collection scan on every running datanode.
    pub fn collect_garbage(&self) -> ClientResult<usize> {
        let mut removed = 0;
        for (id, node) in &self.datanodes {
            if !self.is_stopped(*id) {
                removed += node.collect_garbage()?.len();
            }
        }
        Ok(removed)
    }

    /// Stops background work on every datanode.
    pub fn shutdown(&self) {
        for node in self.datanodes.values() {
            node.shutdown();
        }
    }
}

impl Drop for MiniCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
