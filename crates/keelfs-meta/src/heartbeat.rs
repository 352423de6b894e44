//! Datanode liveness tracking.
//!
//! Each registered node moves Alive -> Stale -> Dead as time passes without
//! a heartbeat. Heartbeats and block reports may arrive concurrently from
//! many nodes and only touch their own entry in a sharded map; `tick` walks
//! every entry and is serialised so transitions are observed once.

use std::collections::HashSet;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::placement::NodeDescriptor;
use crate::types::*;

/// Timing of the liveness state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Interval at which datanodes send heartbeats
    pub heartbeat_interval_ms: u64,
    /// Silence after which a node is considered stale
    pub stale_after_ms: u64,
    /// Silence after which a node is declared dead
    pub dead_after_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 3_000,
            stale_after_ms: 30_000,
            // 2 * recheck interval (5 min) + 10 * heartbeat interval
            dead_after_ms: 630_000,
        }
    }
}

/// Health of a datanode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeHealth {
    /// Heartbeating normally
    Alive,
    /// Missed heartbeats; not chosen for new writes
    Stale,
    /// Out of the cluster; its replicas are re-replicated
    Dead,
}

/// Everything the coordinator knows about one datanode.
#[derive(Clone, Debug)]
pub struct NodeEntry {
    /// Node identifier
    pub id: NodeId,
    /// Network address
    pub address: String,
    /// Rack (failure domain)
    pub rack: String,
    /// Time of the last heartbeat
    pub last_heartbeat_ms: u64,
    /// Blocks the node is known to host
    pub blocks: HashSet<BlockId>,
    /// Current health
    pub health: NodeHealth,
    /// Time of registration
    pub registered_at_ms: u64,
    /// Time of the last full block report, if any
    pub last_block_report_ms: Option<u64>,
}

impl NodeEntry {
    /// The node's identity for placement and distance computations.
    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            id: self.id,
            address: self.address.clone(),
            rack: self.rack.clone(),
        }
    }
}

/// A health transition observed by [`HeartbeatMonitor::tick`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LivenessEvent {
    /// The node missed heartbeats for `stale_after_ms`.
    NodeStale {
        /// The node
        node: NodeId,
    },
    /// The node missed heartbeats for `dead_after_ms`.
    NodeDead {
        /// The node
        node: NodeId,
        /// Blocks it hosted when it died
        blocks: Vec<BlockId>,
    },
}

/// Tracks registered datanodes and their health.
pub struct HeartbeatMonitor {
    config: LivenessConfig,
    nodes: DashMap<NodeId, NodeEntry>,
    tick_lock: Mutex<()>,
}

impl HeartbeatMonitor {
    /// Creates an empty monitor.
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            nodes: DashMap::new(),
            tick_lock: Mutex::new(()),
        }
    }

    /// The timing configuration.
    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Registers a node, or refreshes address and rack of a known one.
    ///
    /// Re-registration counts as a heartbeat; the node's block set is kept
    /// until its next block report replaces it.
    pub fn register_node(&self, id: NodeId, address: String, rack: String, now_ms: u64) {
        let mut entry = self.nodes.entry(id).or_insert_with(|| NodeEntry {
            id,
            address: address.clone(),
            rack: rack.clone(),
            last_heartbeat_ms: now_ms,
            blocks: HashSet::new(),
            health: NodeHealth::Alive,
            registered_at_ms: now_ms,
            last_block_report_ms: None,
        });
        entry.address = address;
        entry.rack = rack;
        entry.last_heartbeat_ms = now_ms;
        entry.health = NodeHealth::Alive;
        info!(node = %id, rack = %entry.rack, address = %entry.address, "registered datanode");
    }

    /// Records a heartbeat.
    ///
    /// Returns true when the node was dead and has been revived; the caller
    /// should ask it for a fresh block report.
    pub fn heartbeat(&self, id: NodeId, now_ms: u64) -> Result<bool, MetaError> {
        let mut entry = self.nodes.get_mut(&id).ok_or(MetaError::UnknownNode(id))?;
        entry.last_heartbeat_ms = entry.last_heartbeat_ms.max(now_ms);
        let previous = entry.health;
        entry.health = NodeHealth::Alive;
        match previous {
            NodeHealth::Alive => Ok(false),
            NodeHealth::Stale => {
                debug!(node = %id, "stale datanode is heartbeating again");
                Ok(false)
            }
            NodeHealth::Dead => {
                info!(node = %id, "dead datanode revived");
                Ok(true)
            }
        }
    }

    /// Replaces the node's hosted block set with a full report.
    ///
    /// A dead node must heartbeat (and so be revived) before its reports are
    /// accepted.
    pub fn block_report(
        &self,
        id: NodeId,
        blocks: impl IntoIterator<Item = BlockId>,
        now_ms: u64,
    ) -> Result<(), MetaError> {
        let mut entry = self.nodes.get_mut(&id).ok_or(MetaError::UnknownNode(id))?;
        if entry.health == NodeHealth::Dead {
            return Err(MetaError::StaleNode(id));
        }
        entry.blocks = blocks.into_iter().collect();
        entry.last_block_report_ms = Some(now_ms);
        entry.last_heartbeat_ms = entry.last_heartbeat_ms.max(now_ms);
        entry.health = NodeHealth::Alive;
        debug!(node = %id, blocks = entry.blocks.len(), "processed block report");
        Ok(())
    }

    /// Adds a single block to the node's hosted set.
    pub fn add_block(&self, id: NodeId, block: BlockId) -> Result<(), MetaError> {
        let mut entry = self.nodes.get_mut(&id).ok_or(MetaError::UnknownNode(id))?;
        entry.blocks.insert(block);
        Ok(())
    }

    /// Removes a single block from the node's hosted set.
    pub fn remove_block(&self, id: NodeId, block: BlockId) {
        if let Some(mut entry) = self.nodes.get_mut(&id) {
            entry.blocks.remove(&block);
        }
    }

    /// Advances the state machine to `now_ms` and returns the transitions.
    ///
    /// A node silent past both thresholds yields `NodeStale` then `NodeDead`
    /// in the same tick. Events are ordered by node id.
    pub fn tick(&self, now_ms: u64) -> Vec<LivenessEvent> {
        let _guard = self.tick_lock.lock();
        let mut events = Vec::new();
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|e| *e.key()).collect();
        ids.sort();

        for id in ids {
            let Some(mut entry) = self.nodes.get_mut(&id) else {
                continue;
            };
            let silent = now_ms.saturating_sub(entry.last_heartbeat_ms);
            if entry.health == NodeHealth::Alive && silent >= self.config.stale_after_ms {
                entry.health = NodeHealth::Stale;
                warn!(node = %id, silent_ms = silent, "datanode is stale");
                events.push(LivenessEvent::NodeStale { node: id });
            }
            if entry.health == NodeHealth::Stale && silent >= self.config.dead_after_ms {
                entry.health = NodeHealth::Dead;
                let mut blocks: Vec<BlockId> = entry.blocks.drain().collect();
                blocks.sort();
                warn!(node = %id, silent_ms = silent, blocks = blocks.len(), "datanode is dead");
                events.push(LivenessEvent::NodeDead { node: id, blocks });
            }
        }
        events
    }

    /// Current health of a node.
    pub fn health(&self, id: NodeId) -> Option<NodeHealth> {
        self.nodes.get(&id).map(|e| e.health)
    }

    /// Snapshot of a node entry.
    pub fn node(&self, id: NodeId) -> Option<NodeEntry> {
        self.nodes.get(&id).map(|e| e.clone())
    }

    /// Snapshot of every node, ordered by id.
    pub fn nodes(&self) -> Vec<NodeEntry> {
        let mut all: Vec<NodeEntry> = self.nodes.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|n| n.id);
        all
    }

    /// Alive nodes, ordered by id.
    pub fn healthy_nodes(&self) -> Vec<NodeEntry> {
        let mut alive: Vec<NodeEntry> = self
            .nodes
            .iter()
            .filter(|e| e.health == NodeHealth::Alive)
            .map(|e| e.value().clone())
            .collect();
        alive.sort_by_key(|n| n.id);
        alive
    }

    /// Forgets a dead node entirely. Returns false if it is unknown or not dead.
    pub fn remove_node(&self, id: NodeId) -> bool {
        let removed = self
            .nodes
            .remove_if(&id, |_, e| e.health == NodeHealth::Dead)
            .is_some();
        if removed {
            info!(node = %id, "removed dead datanode");
        }
        removed
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no node is registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(LivenessConfig::default())
    }

    fn node(n: u64) -> NodeId {
        NodeId::new(n)
    }

    #[test]
    fn test_defaults() {
        let config = LivenessConfig::default();
        assert_eq!(config.heartbeat_interval_ms, 3_000);
        assert_eq!(config.stale_after_ms, 30_000);
        assert_eq!(config.dead_after_ms, 630_000);
    }

    #[test]
    fn test_alive_stale_dead_sequence() {
        let m = monitor();
        m.register_node(node(1), "127.0.0.1:1".into(), "/r1".into(), 0);
        m.add_block(node(1), BlockId::new(7)).unwrap();

        assert!(m.tick(29_999).is_empty());
        assert_eq!(
            m.tick(30_000),
            vec![LivenessEvent::NodeStale { node: node(1) }]
        );
        assert_eq!(m.health(node(1)), Some(NodeHealth::Stale));
        assert!(m.tick(100_000).is_empty());
        assert_eq!(
            m.tick(630_000),
            vec![LivenessEvent::NodeDead {
                node: node(1),
                blocks: vec![BlockId::new(7)]
            }]
        );
        assert!(m.tick(700_000).is_empty());
    }

    #[test]
    fn test_stale_and_dead_in_one_tick() {
        let m = monitor();
        m.register_node(node(1), "a".into(), "/r1".into(), 0);
        let events = m.tick(1_000_000);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], LivenessEvent::NodeStale { .. }));
        assert!(matches!(events[1], LivenessEvent::NodeDead { .. }));
    }

    #[test]
    fn test_heartbeat_keeps_alive() {
        let m = monitor();
        m.register_node(node(1), "a".into(), "/r1".into(), 0);
        for t in (3_000..=90_000).step_by(3_000) {
            assert!(!m.heartbeat(node(1), t).unwrap());
            assert!(m.tick(t).is_empty());
        }
        assert_eq!(m.health(node(1)), Some(NodeHealth::Alive));
    }

    #[test]
    fn test_stale_recovers_on_heartbeat() {
        let m = monitor();
        m.register_node(node(1), "a".into(), "/r1".into(), 0);
        m.tick(40_000);
        assert!(!m.heartbeat(node(1), 41_000).unwrap());
        assert_eq!(m.health(node(1)), Some(NodeHealth::Alive));
    }

    #[test]
    fn test_dead_node_revived() {
        let m = monitor();
        m.register_node(node(1), "a".into(), "/r1".into(), 0);
        m.tick(700_000);
        assert!(matches!(
            m.block_report(node(1), vec![BlockId::new(1)], 700_001),
            Err(MetaError::StaleNode(_))
        ));
        assert!(m.heartbeat(node(1), 700_002).unwrap());
        assert_eq!(m.health(node(1)), Some(NodeHealth::Alive));
        m.block_report(node(1), vec![BlockId::new(1)], 700_003).unwrap();
        assert_eq!(m.node(node(1)).unwrap().blocks.len(), 1);
    }

    #[test]
    fn test_unknown_node() {
        let m = monitor();
        assert!(matches!(
            m.heartbeat(node(9), 0),
            Err(MetaError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_healthy_nodes_and_remove() {
        let m = monitor();
        m.register_node(node(1), "a".into(), "/r1".into(), 0);
        m.register_node(node(2), "b".into(), "/r2".into(), 620_000);
        m.tick(640_000);
        let healthy: Vec<NodeId> = m.healthy_nodes().iter().map(|n| n.id).collect();
        assert_eq!(healthy, vec![node(2)]);

        assert!(!m.remove_node(node(2)));
        assert!(m.remove_node(node(1)));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_concurrent_heartbeats() {
        let m = Arc::new(monitor());
        for n in 0..8 {
            m.register_node(node(n), format!("n{}", n), "/r".into(), 0);
        }
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for t in 1..100 {
                        m.heartbeat(node(n), t * 1_000).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(m.tick(100_000).is_empty());
        assert_eq!(m.healthy_nodes().len(), 8);
    }
}
