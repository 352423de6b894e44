use serde::{Deserialize, Serialize};
use std::fmt;

pub use keelfs_storage::BlockId;

/// Unique identifier of an inode in the namespace.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    /// The root inode ID (always 1)
    pub const ROOT: InodeId = InodeId(1);

    /// Creates a new InodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Returns the raw u64 value of this inode ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a storage node (datanode).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a new NodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Returns the raw u64 value of this node ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dn{}", self.0)
    }
}

/// Kind of an inode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeKind {
    /// Regular file made of blocks
    File,
    /// Directory holding named children
    Directory,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Splits an absolute path into its components.
///
/// `/` yields no components; repeated and trailing slashes are ignored.
/// Relative paths and `.`/`..` components are rejected.
pub fn split_path(path: &str) -> Result<Vec<&str>, MetaError> {
    if !path.starts_with('/') {
        return Err(MetaError::InvalidPath {
            path: path.to_string(),
            reason: "path must be absolute",
        });
    }
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.iter().any(|c| *c == "." || *c == "..") {
        return Err(MetaError::InvalidPath {
            path: path.to_string(),
            reason: "relative components are not allowed",
        });
    }
    Ok(components)
}

/// Joins a parent path and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Error types for namespace and cluster-management operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The path does not exist.
    #[error("{path}: no such file or directory")]
    NotFound {
        /// The missing path
        path: String,
    },

    /// The path already exists.
    #[error("{path}: already exists")]
    AlreadyExists {
        /// The existing path
        path: String,
    },

    /// Non-recursive delete of a directory that has children.
    #[error("{path}: directory is not empty")]
    NotEmpty {
        /// The directory path
        path: String,
    },

    /// A directory was required.
    #[error("{path}: not a directory")]
    NotADirectory {
        /// The offending path
        path: String,
    },

    /// A file was required.
    #[error("{path}: is a directory")]
    IsADirectory {
        /// The offending path
        path: String,
    },

    /// The path is malformed or names something that cannot be modified.
    #[error("{path}: invalid path ({reason})")]
    InvalidPath {
        /// The offending path
        path: String,
        /// Why the path was rejected
        reason: &'static str,
    },

    /// Fewer healthy nodes than the requested replication factor.
    #[error("insufficient nodes: need {required}, {available} available")]
    InsufficientNodes {
        /// Nodes the placement needed
        required: usize,
        /// Healthy candidate nodes
        available: usize,
    },

    /// The node is not alive and may not take part in the request.
    #[error("node {0} is stale or dead")]
    StaleNode(NodeId),

    /// The node has never registered.
    #[error("node {0} is not registered")]
    UnknownNode(NodeId),

    /// The block is not part of the namespace.
    #[error("unknown block {0}")]
    UnknownBlock(BlockId),

    /// The block exists but is not in the state the request requires.
    #[error("block {block}: {reason}")]
    InvalidBlockState {
        /// The block
        block: BlockId,
        /// What was wrong
        reason: &'static str,
    },

    /// A durability failure occurred earlier; mutations are refused until restart.
    #[error("coordinator halted after a durability failure")]
    Halted,

    /// The edit log or a checkpoint is unreadable.
    #[error("metadata corrupted: {0}")]
    Corrupted(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl MetaError {
    /// Returns true for placement failures a caller may retry after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MetaError::InsufficientNodes { .. })
    }
}

/// Metadata summary of a single inode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    /// Absolute path
    pub path: String,
    /// Last path component ("" for the root)
    pub name: String,
    /// File or directory
    pub kind: InodeKind,
    /// Length in bytes of committed blocks (0 for directories)
    pub len: u64,
    /// Modification time, ms since epoch
    pub mtime_ms: u64,
    /// Replication factor (0 for directories)
    pub replication: u16,
    /// Block capacity used for the file
    pub block_size: u64,
}

impl FileStatus {
    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }
}

/// One replica location handed to readers, ordered nearest first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaHost {
    /// Node holding the replica
    pub node: NodeId,
    /// Network address of the node
    pub address: String,
    /// Rack (failure domain) of the node
    pub rack: String,
    /// Replica checksum digest as reported by the node
    pub checksum: u32,
}

/// A block of a file together with where its replicas live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatedBlock {
    /// Block identifier
    pub block: BlockId,
    /// Offset of the block within the file
    pub offset: u64,
    /// Committed length of the block
    pub len: u64,
    /// True once the block was committed
    pub complete: bool,
    /// Replicas, nearest to the reader first
    pub locations: Vec<ReplicaHost>,
}

/// File metadata plus block locations, as returned by a recursive file listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatedFileStatus {
    /// File metadata
    pub status: FileStatus,
    /// Blocks in file order
    pub blocks: Vec<LocatedBlock>,
}
