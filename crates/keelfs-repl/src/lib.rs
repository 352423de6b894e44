#![warn(missing_docs)]

//! KeelFS replication subsystem: the chained write pipeline that stores a
//! block on several datanodes, the replica reader with checksum fallback,
//! and execution of re-replication tasks.

pub mod error;
pub mod packet;
pub mod pipeline;
pub mod reader;
pub mod rereplicate;
pub mod transport;

pub use error::{ReplError, ReplResult};
pub use packet::{Packet, PacketAck};
pub use pipeline::{PipelineConfig, ReplicationPipeline, WriteAck};
pub use reader::{ReadOutcome, ReplicaReader};
pub use rereplicate::ReReplicator;
pub use transport::{DataTransport, LocalTransport};
