//! Chained write pipeline.
//!
//! The pipeline is set up hop by hop before any data moves. Packets then
//! travel down the chain in order (node 1, node 2, ...) and each packet is
//! acknowledged from the last node back to the first. A node that fails is
//! dropped from the chain; the survivors are brought up to date with any
//! packets they missed and the write continues with them. The write fails
//! only when no node is left.

use std::sync::Arc;

use bytes::Bytes;
use keelfs_meta::{BlockId, NodeDescriptor, NodeId, ReplicaLocation};
use keelfs_storage::DEFAULT_BYTES_PER_CHECKSUM;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ReplError, ReplResult};
use crate::packet::{Packet, PacketAck, DEFAULT_PACKET_SIZE};
use crate::transport::DataTransport;

/// Configuration for write pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Payload bytes per packet
    pub packet_size: usize,
    /// Data bytes covered by each packet checksum
    pub bytes_per_checksum: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            bytes_per_checksum: DEFAULT_BYTES_PER_CHECKSUM,
        }
    }
}

/// Outcome of a successful block write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    /// The block written
    pub block: BlockId,
    /// Bytes written
    pub len: u64,
    /// Replicas that hold the complete block, in pipeline order
    pub replicas: Vec<ReplicaLocation>,
    /// Nodes dropped from the pipeline, in failure order
    pub failed: Vec<NodeId>,
    /// Per-packet acknowledgements
    pub acks: Vec<PacketAck>,
}

struct Hop {
    node: NodeId,
    // Packets this node has stored.
    stored: usize,
}

/// Writes blocks to chains of datanodes.
pub struct ReplicationPipeline {
    transport: Arc<dyn DataTransport>,
    config: PipelineConfig,
}

impl ReplicationPipeline {
    /// Creates a pipeline driver over `transport`.
    pub fn new(transport: Arc<dyn DataTransport>, config: PipelineConfig) -> Self {
        Self { transport, config }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn DataTransport> {
        &self.transport
    }

    /// The pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Writes `data` as `block` to `nodes`, in chain order.
    ///
    /// Returns once every node still in the chain has stored and sealed the
    /// whole block. Nodes lost along the way are listed in the ack so the
    /// coordinator can re-replicate. A cancelled write leaves partial
    /// replicas behind for the garbage-collection scan.
    pub async fn write_block(
        &self,
        block: BlockId,
        nodes: &[NodeDescriptor],
        data: Bytes,
        cancel: &CancellationToken,
    ) -> ReplResult<WriteAck> {
        let mut failed = Vec::new();
        let mut chain = Vec::with_capacity(nodes.len());

        for node in nodes {
            if cancel.is_cancelled() {
                self.abort(block, &chain).await;
                return Err(ReplError::Cancelled { block });
            }
            match self.transport.open_block(node.id, block).await {
                Ok(()) => chain.push(Hop {
                    node: node.id,
                    stored: 0,
                }),
                Err(e) => {
                    warn!(block = %block, node = %node.id, error = %e, "pipeline setup failed for node");
                    failed.push(node.id);
                }
            }
        }
        if chain.is_empty() {
            return Err(ReplError::PipelineBroken { block, failed });
        }
        debug!(
            block = %block,
            chain = ?chain.iter().map(|h| h.node).collect::<Vec<_>>(),
            "pipeline established"
        );

        let packets = Packet::split(
            block,
            &data,
            self.config.packet_size,
            self.config.bytes_per_checksum,
        );
        let mut acks = Vec::with_capacity(packets.len());
        for seq in 0..packets.len() {
            if cancel.is_cancelled() {
                self.abort(block, &chain).await;
                info!(block = %block, packets_sent = seq, "pipeline write cancelled");
                return Err(ReplError::Cancelled { block });
            }
            self.deliver(block, &mut chain, &mut failed, &packets, seq)
                .await?;
            acks.push(PacketAck {
                seqno: packets[seq].seqno,
                acked_by: chain.iter().rev().map(|h| h.node).collect(),
            });
        }

        let mut replicas = Vec::with_capacity(chain.len());
        for hop in &chain {
            match self.transport.finalize_block(hop.node, block).await {
                Ok(info) if info.len == data.len() as u64 => replicas.push(ReplicaLocation {
                    node: hop.node,
                    checksum: info.checksum,
                }),
                Ok(info) => {
                    warn!(block = %block, node = %hop.node, len = info.len, "sealed replica has the wrong length");
                    failed.push(hop.node);
                }
                Err(e) => {
                    warn!(block = %block, node = %hop.node, error = %e, "failed to seal replica");
                    failed.push(hop.node);
                }
            }
        }
        if replicas.is_empty() {
            return Err(ReplError::PipelineBroken { block, failed });
        }

        info!(
            block = %block,
            len = data.len(),
            replicas = replicas.len(),
            failed = failed.len(),
            "block written"
        );
        Ok(WriteAck {
            block,
            len: data.len() as u64,
            replicas,
            failed,
            acks,
        })
    }

    /// Brings every node in the chain up to packet `upto`, dropping nodes
    /// that fail. Downstream survivors receive whatever they missed.
    async fn deliver(
        &self,
        block: BlockId,
        chain: &mut Vec<Hop>,
        failed: &mut Vec<NodeId>,
        packets: &[Packet],
        upto: usize,
    ) -> ReplResult<()> {
        let mut i = 0;
        while i < chain.len() {
            let mut error = None;
            while chain[i].stored <= upto {
                let packet = &packets[chain[i].stored];
                match self.transport.write_packet(chain[i].node, packet).await {
                    Ok(_) => chain[i].stored += 1,
                    Err(e) => {
                        error = Some(e);
                        break;
                    }
                }
            }
            let Some(e) = error else {
                i += 1;
                continue;
            };

            let lost = chain.remove(i);
            failed.push(lost.node);
            self.transport.abort_block(lost.node, block).await;
            warn!(
                block = %block,
                node = %lost.node,
                seqno = upto,
                error = %e,
                survivors = chain.len(),
                "node dropped from pipeline"
            );
            if chain.is_empty() {
                return Err(ReplError::PipelineBroken {
                    block,
                    failed: failed.clone(),
                });
            }
        }
        Ok(())
    }

    async fn abort(&self, block: BlockId, chain: &[Hop]) {
        for hop in chain {
            self.transport.abort_block(hop.node, block).await;
        }
    }
}
