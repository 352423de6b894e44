#![warn(missing_docs)]

//! KeelFS client subsystem: file client, datanode service, in-process
//! cluster and the `keelfs` command line.

#[allow(missing_docs)]
pub mod cli;
pub mod client;
pub mod cluster;
pub mod config;
pub mod datanode;
pub mod error;
pub mod retry;

pub use client::DfsClient;
pub use cluster::MiniCluster;
pub use config::{ClusterConfig, NodeSpec};
pub use datanode::{CommandStats, DataNode};
pub use error::{ClientError, ClientResult};
pub use retry::{with_retry, RetryConfig};
