//! Execution of re-replication tasks issued by the coordinator.

use std::sync::Arc;

use keelfs_meta::{NamespaceCoordinator, ReplicationTask};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ReplError, ReplResult};
use crate::pipeline::{ReplicationPipeline, WriteAck};

/// Copies a block from a surviving replica to new targets.
pub struct ReReplicator {
    pipeline: Arc<ReplicationPipeline>,
    coordinator: Arc<NamespaceCoordinator>,
}

impl ReReplicator {
    /// Creates an executor that writes through `pipeline` and reports to
    /// `coordinator`.
    pub fn new(pipeline: Arc<ReplicationPipeline>, coordinator: Arc<NamespaceCoordinator>) -> Self {
        Self {
            pipeline,
            coordinator,
        }
    }

    /// Runs one task: read from the source, pipeline to the targets, then
    /// report each new replica.
    ///
    /// A corrupt source is reported so the coordinator can pick another
    /// source on a later tick.
    pub async fn execute(
        &self,
        task: &ReplicationTask,
        cancel: &CancellationToken,
    ) -> ReplResult<WriteAck> {
        let data = match self
            .pipeline
            .transport()
            .read_block(task.source, task.block)
            .await
        {
            Ok(data) => data,
            Err(e @ ReplError::CorruptBlock { .. }) => {
                self.coordinator
                    .report_corrupt_replica(task.block, task.source)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let ack = self
            .pipeline
            .write_block(task.block, &task.targets, data, cancel)
            .await?;
        for replica in &ack.replicas {
            if let Err(e) =
                self.coordinator
                    .block_received(replica.node, task.block, ack.len, replica.checksum)
            {
                warn!(block = %task.block, node = %replica.node, error = %e, "coordinator rejected new replica");
            }
        }
        info!(
            block = %task.block,
            source = %task.source,
            copies = ack.replicas.len(),
            "re-replication complete"
        );
        Ok(ack)
    }
}
