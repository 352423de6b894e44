#![warn(missing_docs)]

//! KeelFS metadata subsystem: namespace coordinator, edit log, checkpoints and datanode liveness.

pub mod blockmap;
pub mod checkpoint;
pub mod coordinator;
pub mod edit_log;
pub mod heartbeat;
pub mod namespace;
pub mod placement;
pub mod scheduler;
pub mod types;

pub use blockmap::{BlockManager, NodeCommand, ReplicaLocation, ReplicationTask};
pub use checkpoint::Checkpoint;
pub use coordinator::{AllocatedBlock, CoordinatorConfig, NamespaceCoordinator, TickReport};
pub use edit_log::{EditLog, LogOp, LogRecord};
pub use heartbeat::{HeartbeatMonitor, LivenessConfig, LivenessEvent, NodeEntry, NodeHealth};
pub use namespace::{BlockMeta, BlockState, INode, Namespace};
pub use placement::{NetworkTopology, NodeDescriptor, PlacementPolicy, RackAwarePlacement, RackTopology};
pub use types::*;
