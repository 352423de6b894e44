//! Reading blocks from the nearest healthy replica.

use std::sync::Arc;

use bytes::Bytes;
use keelfs_meta::{BlockId, LocatedBlock, NamespaceCoordinator, NodeId};
use tracing::{debug, warn};

use crate::error::{ReplError, ReplResult};
use crate::transport::DataTransport;

/// A successful block read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    /// The block contents
    pub data: Bytes,
    /// Node that served the read
    pub node: NodeId,
    /// Replicas found corrupt on the way
    pub corrupt: Vec<NodeId>,
}

/// Reads blocks, falling back to the next replica on checksum failures.
pub struct ReplicaReader {
    transport: Arc<dyn DataTransport>,
    reporter: Option<Arc<NamespaceCoordinator>>,
}

impl ReplicaReader {
    /// Creates a reader over `transport`.
    pub fn new(transport: Arc<dyn DataTransport>) -> Self {
        Self {
            transport,
            reporter: None,
        }
    }

    /// Reports corrupt replicas to `coordinator` as they are found.
    pub fn with_reporter(mut self, coordinator: Arc<NamespaceCoordinator>) -> Self {
        self.reporter = Some(coordinator);
        self
    }

    /// Reads a complete block, trying replicas in the order given (nearest
    /// first).
    ///
    /// A replica that fails verification, or has the wrong length, is
    /// reported and skipped. Fails with `CorruptBlock` when every reachable
    /// replica is corrupt and `NoReplicas` when none could be reached.
    pub async fn read_block(&self, located: &LocatedBlock) -> ReplResult<ReadOutcome> {
        let block = located.block;
        let mut corrupt = Vec::new();
        for host in &located.locations {
            match self.transport.read_block(host.node, block).await {
                Ok(data) if data.len() as u64 == located.len => {
                    if !corrupt.is_empty() {
                        debug!(block = %block, node = %host.node, skipped = corrupt.len(), "read served by fallback replica");
                    }
                    return Ok(ReadOutcome {
                        data,
                        node: host.node,
                        corrupt,
                    });
                }
                Ok(data) => {
                    warn!(block = %block, node = %host.node, len = data.len(), expected = located.len,
                        "replica has the wrong length");
                    self.report(block, host.node);
                    corrupt.push(host.node);
                }
                Err(ReplError::CorruptBlock { .. }) => {
                    self.report(block, host.node);
                    corrupt.push(host.node);
                }
                Err(e) => debug!(block = %block, node = %host.node, error = %e, "replica unreachable"),
            }
        }
        match corrupt.last() {
            Some(node) => Err(ReplError::CorruptBlock { block, node: *node }),
            None => Err(ReplError::NoReplicas { block }),
        }
    }

    fn report(&self, block: BlockId, node: NodeId) {
        if let Some(coordinator) = &self.reporter {
            if let Err(e) = coordinator.report_corrupt_replica(block, node) {
                warn!(block = %block, node = %node, error = %e, "failed to report corrupt replica");
            }
        }
    }
}
