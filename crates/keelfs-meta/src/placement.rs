//! Replica placement and network distance.
//!
//! The default policy spreads replicas over racks: the first replica goes
//! to the writer when it is a healthy datanode, the second to another rack,
//! the third next to the second (or to another rack if the first two ended
//! up sharing one). Every rack rule degrades to "any unused healthy node"
//! when the topology cannot satisfy it.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::*;

/// A datanode as seen by placement and distance computations.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Node identifier
    pub id: NodeId,
    /// Network address
    pub address: String,
    /// Rack (failure domain)
    pub rack: String,
}

/// Distance between two nodes; lower is closer.
pub trait NetworkTopology: Send + Sync {
    /// Returns the distance between `a` and `b`.
    fn distance(&self, a: &NodeDescriptor, b: &NodeDescriptor) -> u32;
}

/// Three-level topology: node, rack, datacenter.
///
/// Rack paths look like `/dc1/r1`; everything before the last component
/// names the datacenter. A single-component path such as `/r1` belongs to
/// the default datacenter.
#[derive(Clone, Copy, Debug, Default)]
pub struct RackTopology;

impl RackTopology {
    /// Distance to self
    pub const SAME_NODE: u32 = 0;
    /// Distance between nodes sharing a rack
    pub const SAME_RACK: u32 = 2;
    /// Distance between racks of one datacenter
    pub const OFF_RACK: u32 = 4;
    /// Distance between datacenters
    pub const OFF_DATACENTER: u32 = 6;

    /// Datacenter part of a rack path.
    pub fn datacenter(rack: &str) -> &str {
        let rack = rack.trim_end_matches('/');
        match rack.rfind('/') {
            Some(idx) => &rack[..idx],
            None => "",
        }
    }
}

impl NetworkTopology for RackTopology {
    fn distance(&self, a: &NodeDescriptor, b: &NodeDescriptor) -> u32 {
        if a.id == b.id {
            Self::SAME_NODE
        } else if a.rack == b.rack {
            Self::SAME_RACK
        } else if Self::datacenter(&a.rack) == Self::datacenter(&b.rack) {
            Self::OFF_RACK
        } else {
            Self::OFF_DATACENTER
        }
    }
}

/// Chooses the nodes that will hold new replicas of a block.
pub trait PlacementPolicy: Send + Sync {
    /// Picks `replicas` distinct targets from `candidates`.
    ///
    /// `existing` lists nodes already holding the block (re-replication);
    /// they are never chosen again but count towards rack spreading.
    /// Targets are returned in pipeline order.
    fn choose_targets(
        &self,
        writer: Option<NodeId>,
        replicas: usize,
        candidates: &[NodeDescriptor],
        existing: &[NodeDescriptor],
    ) -> Result<Vec<NodeDescriptor>, MetaError>;
}

/// Rack-aware default placement.
pub struct RackAwarePlacement {
    rng: Mutex<StdRng>,
}

impl Default for RackAwarePlacement {
    fn default() -> Self {
        Self::new()
    }
}

impl RackAwarePlacement {
    /// Creates a policy seeded from OS entropy.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Creates a deterministic policy, for tests and simulations.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn pick<'a>(
        rng: &mut StdRng,
        free: &[&'a NodeDescriptor],
        filter: impl Fn(&NodeDescriptor) -> bool,
    ) -> Option<&'a NodeDescriptor> {
        let matching: Vec<&'a NodeDescriptor> =
            free.iter().copied().filter(|n| filter(n)).collect();
        matching.choose(rng).copied()
    }
}

impl PlacementPolicy for RackAwarePlacement {
    fn choose_targets(
        &self,
        writer: Option<NodeId>,
        replicas: usize,
        candidates: &[NodeDescriptor],
        existing: &[NodeDescriptor],
    ) -> Result<Vec<NodeDescriptor>, MetaError> {
        let mut free: Vec<&NodeDescriptor> = Vec::new();
        for node in candidates {
            let used = existing.iter().any(|e| e.id == node.id)
                || free.iter().any(|f| f.id == node.id);
            if !used {
                free.push(node);
            }
        }
        if free.len() < replicas {
            return Err(MetaError::InsufficientNodes {
                required: replicas,
                available: free.len(),
            });
        }

        let mut rng = self.rng.lock();
        let mut placed: Vec<NodeDescriptor> = existing.to_vec();
        let mut chosen: Vec<NodeDescriptor> = Vec::with_capacity(replicas);

        while chosen.len() < replicas {
            let preferred = match placed.as_slice() {
                [] => writer
                    .and_then(|w| free.iter().copied().find(|n| n.id == w))
                    .or_else(|| Self::pick(&mut rng, &free, |_| true)),
                [first] => Self::pick(&mut rng, &free, |n| n.rack != first.rack),
                [first, second] if first.rack == second.rack => {
                    Self::pick(&mut rng, &free, |n| n.rack != first.rack)
                }
                [_, second] => Self::pick(&mut rng, &free, |n| n.rack == second.rack),
                _ => None,
            };
            let Some(node) = preferred.or_else(|| Self::pick(&mut rng, &free, |_| true)) else {
                break;
            };
            let node = node.clone();
            free.retain(|n| n.id != node.id);
            placed.push(node.clone());
            chosen.push(node);
        }

        debug!(
            targets = ?chosen.iter().map(|n| n.id).collect::<Vec<_>>(),
            existing = existing.len(),
            "chose replica targets"
        );
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn node(id: u64, rack: &str) -> NodeDescriptor {
        NodeDescriptor {
            id: NodeId::new(id),
            address: format!("10.0.0.{}:9866", id),
            rack: rack.to_string(),
        }
    }

    fn cluster() -> Vec<NodeDescriptor> {
        vec![
            node(1, "/r1"),
            node(2, "/r1"),
            node(3, "/r1"),
            node(4, "/r2"),
            node(5, "/r2"),
            node(6, "/r3"),
            node(7, "/r3"),
        ]
    }

    #[test]
    fn test_distance() {
        let t = RackTopology;
        assert_eq!(t.distance(&node(1, "/r1"), &node(1, "/r1")), 0);
        assert_eq!(t.distance(&node(1, "/r1"), &node(2, "/r1")), 2);
        assert_eq!(t.distance(&node(1, "/r1"), &node(4, "/r2")), 4);
        assert_eq!(t.distance(&node(1, "/dc1/r1"), &node(2, "/dc1/r1")), 2);
        assert_eq!(t.distance(&node(1, "/dc1/r1"), &node(2, "/dc1/r2")), 4);
        assert_eq!(t.distance(&node(1, "/dc1/r1"), &node(2, "/dc2/r1")), 6);
        assert_eq!(t.distance(&node(1, "/r1"), &node(2, "/dc2/r1")), 6);
    }

    #[test]
    fn test_datacenter_of_rack_path() {
        assert_eq!(RackTopology::datacenter("/dc1/r1"), "/dc1");
        assert_eq!(RackTopology::datacenter("/eu/dc1/r7/"), "/eu/dc1");
        assert_eq!(RackTopology::datacenter("/r1"), "");
        assert_eq!(RackTopology::datacenter("r1"), "");
    }

    #[test]
    fn test_writer_first_then_rack_spread() {
        for seed in 0..50 {
            let policy = RackAwarePlacement::with_seed(seed);
            let targets = policy
                .choose_targets(Some(NodeId::new(2)), 3, &cluster(), &[])
                .unwrap();
            assert_eq!(targets.len(), 3);
            assert_eq!(targets[0].id, NodeId::new(2));
            assert_ne!(targets[1].rack, targets[0].rack);
            assert_eq!(targets[2].rack, targets[1].rack);
            assert_ne!(targets[2].id, targets[1].id);
            let racks: HashSet<&str> = targets.iter().map(|n| n.rack.as_str()).collect();
            assert!(racks.len() >= 2);
        }
    }

    #[test]
    fn test_non_datanode_writer_gets_random_first() {
        let policy = RackAwarePlacement::with_seed(7);
        let targets = policy
            .choose_targets(Some(NodeId::new(99)), 3, &cluster(), &[])
            .unwrap();
        assert_eq!(targets.len(), 3);
        let ids: HashSet<NodeId> = targets.iter().map(|n| n.id).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_single_rack_falls_back() {
        let nodes = vec![node(1, "/r1"), node(2, "/r1"), node(3, "/r1")];
        let policy = RackAwarePlacement::with_seed(1);
        let targets = policy.choose_targets(None, 3, &nodes, &[]).unwrap();
        let ids: HashSet<NodeId> = targets.iter().map(|n| n.id).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_insufficient_nodes() {
        let nodes = vec![node(1, "/r1"), node(2, "/r2")];
        let policy = RackAwarePlacement::with_seed(1);
        let err = policy.choose_targets(None, 3, &nodes, &[]).unwrap_err();
        assert!(matches!(
            err,
            MetaError::InsufficientNodes {
                required: 3,
                available: 2
            }
        ));
    }

    #[test]
    fn test_rereplication_excludes_existing() {
        let policy = RackAwarePlacement::with_seed(3);
        let existing = vec![node(1, "/r1"), node(4, "/r2")];
        for _ in 0..20 {
            let targets = policy
                .choose_targets(None, 1, &cluster(), &existing)
                .unwrap();
            assert_eq!(targets.len(), 1);
            // Third replica lands in the second replica's rack.
            assert_eq!(targets[0].id, NodeId::new(5));
        }
    }

    #[test]
    fn test_more_than_three_replicas() {
        let policy = RackAwarePlacement::with_seed(11);
        let targets = policy.choose_targets(None, 5, &cluster(), &[]).unwrap();
        let ids: HashSet<NodeId> = targets.iter().map(|n| n.id).collect();
        assert_eq!(ids.len(), 5);
    }
}
