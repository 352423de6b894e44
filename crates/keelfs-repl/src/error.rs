//! Error types for the replication subsystem.

use keelfs_meta::{BlockId, MetaError, NodeId};
use keelfs_storage::StorageError;
use thiserror::Error;

/// Errors that can occur while moving block data between nodes.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Every node of a write pipeline failed.
    #[error("pipeline for {block} broken, failed nodes: {failed:?}")]
    PipelineBroken {
        /// Block being written
        block: BlockId,
        /// Nodes removed from the pipeline, in failure order
        failed: Vec<NodeId>,
    },

    /// A replica (or a packet in flight) failed checksum verification.
    #[error("corrupt replica of {block} on {node}")]
    CorruptBlock {
        /// The block
        block: BlockId,
        /// Node serving the corrupt data
        node: NodeId,
    },

    /// No replica of the block could be read.
    #[error("no readable replica of {block}")]
    NoReplicas {
        /// The block
        block: BlockId,
    },

    /// The node did not answer.
    #[error("node {node} unavailable")]
    NodeUnavailable {
        /// The node
        node: NodeId,
    },

    /// The operation was aborted through its cancellation token.
    #[error("write of {block} cancelled")]
    Cancelled {
        /// The block
        block: BlockId,
    },

    /// Local replica storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The coordinator rejected a request.
    #[error(transparent)]
    Meta(#[from] MetaError),
}

impl ReplError {
    /// Returns true for failures a client may retry with a fresh pipeline.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplError::PipelineBroken { .. } | ReplError::NodeUnavailable { .. } => true,
            ReplError::Meta(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result alias for replication operations.
pub type ReplResult<T> = std::result::Result<T, ReplError>;
