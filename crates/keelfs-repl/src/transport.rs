//! Data-plane transport between the client, pipeline and datanodes.
//!
//! [`DataTransport`] is the seam where a network implementation would plug
//! in. [`LocalTransport`] delivers straight into in-process block stores and
//! can simulate crashed nodes for tests and the mini cluster.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use keelfs_meta::{BlockId, NodeId};
use keelfs_storage::{BlockStore, ReplicaInfo, StorageError};
use tracing::{debug, warn};

use crate::error::{ReplError, ReplResult};
use crate::packet::Packet;

/// Moves block data to and from datanodes.
#[async_trait]
pub trait DataTransport: Send + Sync + 'static {
    /// Prepares `node` to receive `block`.
    async fn open_block(&self, node: NodeId, block: BlockId) -> ReplResult<()>;

    /// Verifies and stores one packet on `node`; returns the replica length.
    ///
    /// A packet the node already stored is acknowledged without rewriting.
    async fn write_packet(&self, node: NodeId, packet: &Packet) -> ReplResult<u64>;

    /// Seals the replica on `node`.
    async fn finalize_block(&self, node: NodeId, block: BlockId) -> ReplResult<ReplicaInfo>;

    /// Drops an unfinished replica. Best effort.
    async fn abort_block(&self, node: NodeId, block: BlockId);

    /// Reads a finalized replica, verifying its checksums.
    async fn read_block(&self, node: NodeId, block: BlockId) -> ReplResult<Bytes>;
}

#[derive(Clone)]
struct LocalNode {
    store: Arc<BlockStore>,
    down: bool,
    fail_at_packet: Option<u64>,
}

/// In-process transport over per-node block stores.
#[derive(Default)]
pub struct LocalTransport {
    nodes: DashMap<NodeId, LocalNode>,
}

impl LocalTransport {
    /// Creates a transport with no nodes attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a node's block store.
    pub fn add_node(&self, node: NodeId, store: Arc<BlockStore>) {
        self.nodes.insert(
            node,
            LocalNode {
                store,
                down: false,
                fail_at_packet: None,
            },
        );
    }

    /// Detaches a node.
    pub fn remove_node(&self, node: NodeId) {
        self.nodes.remove(&node);
    }

    /// The block store behind a node.
    pub fn store(&self, node: NodeId) -> Option<Arc<BlockStore>> {
        self.nodes.get(&node).map(|n| Arc::clone(&n.store))
    }

    /// Marks a node crashed (`true`) or back up (`false`).
    pub fn set_down(&self, node: NodeId, down: bool) {
        if let Some(mut n) = self.nodes.get_mut(&node) {
            n.down = down;
            n.fail_at_packet = None;
        }
    }

    /// Returns true if the node is unknown or crashed.
    pub fn is_down(&self, node: NodeId) -> bool {
        self.nodes.get(&node).map(|n| n.down).unwrap_or(true)
    }

    /// Crashes the node when it receives packet `seqno`.
    pub fn fail_at_packet(&self, node: NodeId, seqno: u64) {
        if let Some(mut n) = self.nodes.get_mut(&node) {
            n.fail_at_packet = Some(seqno);
        }
    }

    fn live_store(&self, node: NodeId) -> ReplResult<Arc<BlockStore>> {
        match self.nodes.get(&node) {
            Some(n) if !n.down => Ok(Arc::clone(&n.store)),
            _ => Err(ReplError::NodeUnavailable { node }),
        }
    }
}

#[async_trait]
impl DataTransport for LocalTransport {
    async fn open_block(&self, node: NodeId, block: BlockId) -> ReplResult<()> {
        let store = self.live_store(node)?;
        store.create(block)?;
        Ok(())
    }

    async fn write_packet(&self, node: NodeId, packet: &Packet) -> ReplResult<u64> {
        if let Some(mut n) = self.nodes.get_mut(&node) {
            if n.fail_at_packet == Some(packet.seqno) {
                n.down = true;
                n.fail_at_packet = None;
                debug!(node = %node, seqno = packet.seqno, "simulated node crash");
            }
        }
        let store = self.live_store(node)?;

        if let Some(chunk) = packet.first_corrupt_chunk() {
            warn!(node = %node, block = %packet.block, seqno = packet.seqno, chunk, "packet failed checksum");
            return Err(ReplError::CorruptBlock {
                block: packet.block,
                node,
            });
        }
        let stored = store.open_len(packet.block).ok_or(ReplError::Storage(
            StorageError::NotWritable {
                block_id: packet.block,
            },
        ))?;
        if packet.offset + packet.data.len() as u64 <= stored {
            return Ok(stored);
        }
        Ok(store.append(packet.block, &packet.data)?)
    }

    async fn finalize_block(&self, node: NodeId, block: BlockId) -> ReplResult<ReplicaInfo> {
        let store = self.live_store(node)?;
        Ok(store.finalize(block)?)
    }

    async fn abort_block(&self, node: NodeId, block: BlockId) {
        if let Some(store) = self.store(node) {
            store.abort(block);
        }
    }

    async fn read_block(&self, node: NodeId, block: BlockId) -> ReplResult<Bytes> {
        let store = self.live_store(node)?;
        match store.read(block) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.is_corruption() => Err(ReplError::CorruptBlock { block, node }),
            Err(e) => Err(e.into()),
        }
    }
}
