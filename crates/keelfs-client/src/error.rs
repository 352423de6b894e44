//! Client error types.

use keelfs_meta::{MetaError, NodeId};
use keelfs_repl::ReplError;
use keelfs_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the file client, datanodes and the mini cluster.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Namespace or cluster-management failure.
    #[error(transparent)]
    Meta(#[from] MetaError),

    /// Data path failure.
    #[error(transparent)]
    Repl(#[from] ReplError),

    /// Local replica storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Local file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed TOML configuration.
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// Malformed JSON configuration.
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    /// Bad argument or configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The cluster has no datanode with this ID.
    #[error("no such datanode: {0}")]
    NoSuchNode(NodeId),

    /// A retryable operation kept failing.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made, including the first
        attempts: u32,
        /// The final error
        last: Box<ClientError>,
    },
}

impl ClientError {
    /// Returns true for transient failures worth retrying after backoff:
    /// placement shortfalls and broken pipelines.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Meta(e) => e.is_retryable(),
            ClientError::Repl(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// The error underneath any retry wrapper.
    pub fn root(&self) -> &ClientError {
        match self {
            ClientError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

/// Result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
