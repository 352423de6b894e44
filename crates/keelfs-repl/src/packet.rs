//! Data packets exchanged along a write pipeline.
//!
//! A block is streamed as a sequence of packets. Each packet carries a slice
//! of the block together with one CRC32 per checksum chunk, so every node in
//! the chain can verify the bytes before storing and forwarding them.

use bytes::Bytes;
use keelfs_meta::{BlockId, NodeId};
use keelfs_storage::ChunkedChecksum;
use serde::{Deserialize, Serialize};

/// Default payload carried by one packet.
pub const DEFAULT_PACKET_SIZE: usize = 64 * 1024;

/// A slice of a block in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Block the data belongs to
    pub block: BlockId,
    /// Position of the packet in the stream, from 0
    pub seqno: u64,
    /// Offset of `data` within the block
    pub offset: u64,
    /// Per-chunk checksums of `data`
    pub checksum: ChunkedChecksum,
    /// Payload
    pub data: Bytes,
    /// True for the final packet of the block
    pub last: bool,
}

impl Packet {
    /// Splits block data into packets of at most `packet_size` bytes.
    ///
    /// The packet size is rounded down to a whole number of checksum chunks.
    /// Empty data still yields one (empty, last) packet.
    pub fn split(
        block: BlockId,
        data: &Bytes,
        packet_size: usize,
        bytes_per_checksum: u32,
    ) -> Vec<Packet> {
        let chunk = bytes_per_checksum.max(1) as usize;
        let packet_size = (packet_size / chunk).max(1) * chunk;
        let mut packets = Vec::with_capacity(data.len() / packet_size + 1);
        let mut offset = 0;
        loop {
            let end = (offset + packet_size).min(data.len());
            let payload = data.slice(offset..end);
            packets.push(Packet {
                block,
                seqno: packets.len() as u64,
                offset: offset as u64,
                checksum: ChunkedChecksum::compute(&payload, bytes_per_checksum),
                data: payload,
                last: end == data.len(),
            });
            if end == data.len() {
                break;
            }
            offset = end;
        }
        packets
    }

    /// Index of the first chunk whose data does not match its checksum.
    pub fn first_corrupt_chunk(&self) -> Option<usize> {
        self.checksum.first_mismatch(&self.data)
    }
}

/// Acknowledgement of one packet, collected from the tail of the chain back
/// to its head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketAck {
    /// Packet acknowledged
    pub seqno: u64,
    /// Nodes that stored the packet, last pipeline node first
    pub acked_by: Vec<NodeId>,
}
