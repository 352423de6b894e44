//! Cluster configuration, loadable from TOML or JSON.

use std::path::{Path, PathBuf};

use keelfs_meta::{CoordinatorConfig, NodeId};
use keelfs_repl::PipelineConfig;
use keelfs_storage::BlockStoreConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};
use crate::retry::RetryConfig;

/// One datanode of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Datanode ID
    pub id: u64,
    /// Rack (failure domain) path, e.g. `/dc1/r1`
    pub rack: String,
    /// Advertised address; defaults to `local:<id>`
    #[serde(default)]
    pub address: Option<String>,
}

impl NodeSpec {
    /// A node with the default address.
    pub fn new(id: u64, rack: impl Into<String>) -> Self {
        Self {
            id,
            rack: rack.into(),
            address: None,
        }
    }

    /// The node ID.
    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.id)
    }

    /// Advertised address.
    pub fn address(&self) -> String {
        self.address
            .clone()
            .unwrap_or_else(|| format!("local:{}", self.id))
    }
}

/// Everything needed to bring up a cluster.
///
/// `coordinator.meta_dir` is ignored; metadata always lives under
/// `data_dir/meta` and each datanode under `data_dir/dn<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Root directory for metadata and replicas
    pub data_dir: PathBuf,
    /// Datanodes to run
    pub nodes: Vec<NodeSpec>,
    /// Coordinator settings
    pub coordinator: CoordinatorConfig,
    /// Replica store settings, shared by every datanode
    pub store: BlockStoreConfig,
    /// Write pipeline settings
    pub pipeline: PipelineConfig,
    /// Client retry policy
    pub retry: RetryConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/keelfs"),
            nodes: vec![
                NodeSpec::new(1, "/r1"),
                NodeSpec::new(2, "/r1"),
                NodeSpec::new(3, "/r2"),
                NodeSpec::new(4, "/r2"),
            ],
            coordinator: CoordinatorConfig::default(),
            store: BlockStoreConfig::default(),
            pipeline: PipelineConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Loads a config file; the format follows the extension (`.toml` or `.json`).
    pub fn from_file(path: &Path) -> ClientResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ClusterConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(ClientError::InvalidArgument(format!(
                    "unsupported config file extension: {:?}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the cluster cannot run with.
    pub fn validate(&self) -> ClientResult<()> {
        if self.nodes.is_empty() {
            return Err(ClientError::InvalidArgument(
                "at least one datanode is required".into(),
            ));
        }
        let mut ids: Vec<u64> = self.nodes.iter().map(|n| n.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.nodes.len() {
            return Err(ClientError::InvalidArgument("duplicate datanode id".into()));
        }
        if self.coordinator.default_replication == 0 {
            return Err(ClientError::InvalidArgument(
                "default_replication must be at least 1".into(),
            ));
        }
        if self.coordinator.block_size == 0 || self.coordinator.block_size > self.store.block_capacity
        {
            return Err(ClientError::InvalidArgument(format!(
                "block_size must be in 1..={}",
                self.store.block_capacity
            )));
        }
        if self.pipeline.packet_size < self.pipeline.bytes_per_checksum as usize {
            return Err(ClientError::InvalidArgument(
                "packet_size must hold at least one checksum chunk".into(),
            ));
        }
        Ok(())
    }

    /// Coordinator settings with the metadata directory resolved.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            meta_dir: self.meta_dir(),
            ..self.coordinator.clone()
        }
    }

    /// Directory holding the edit log and checkpoints.
    pub fn meta_dir(&self) -> PathBuf {
        self.data_dir.join("meta")
    }

    /// Replica directory of one datanode.
    pub fn node_dir(&self, id: NodeId) -> PathBuf {
        self.data_dir.join(format!("dn{}", id.as_u64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ClusterConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/keelfs"));
        assert_eq!(config.nodes.len(), 4);
        assert_eq!(config.coordinator.default_replication, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_meta_dir_overrides_coordinator_setting() {
        let config = ClusterConfig {
            data_dir: PathBuf::from("/data"),
            ..Default::default()
        };
        assert_eq!(config.coordinator_config().meta_dir, PathBuf::from("/data/meta"));
        assert_eq!(config.node_dir(NodeId::new(3)), PathBuf::from("/data/dn3"));
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
data_dir = "/tmp/keel"

[[nodes]]
id = 1
rack = "/a"

[[nodes]]
id = 2
rack = "/b"
address = "10.0.0.2:9866"

[coordinator]
default_replication = 2
block_size = 1048576

[coordinator.liveness]
stale_after_ms = 5000

[retry]
max_retries = 5
"#
        )
        .unwrap();

        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/keel"));
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].address(), "local:1");
        assert_eq!(config.nodes[1].address(), "10.0.0.2:9866");
        assert_eq!(config.coordinator.default_replication, 2);
        assert_eq!(config.coordinator.block_size, 1_048_576);
        assert_eq!(config.coordinator.liveness.stale_after_ms, 5_000);
        assert_eq!(config.coordinator.liveness.dead_after_ms, 630_000);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_backoff_ms, 100);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "data_dir": "/json/keel",
                "nodes": [{{"id": 7, "rack": "/r7"}}],
                "coordinator": {{"default_replication": 1}},
                "pipeline": {{"packet_size": 8192}}
            }}"#
        )
        .unwrap();

        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/json/keel"));
        assert_eq!(config.nodes, vec![NodeSpec::new(7, "/r7")]);
        assert_eq!(config.pipeline.packet_size, 8_192);
        assert_eq!(config.pipeline.bytes_per_checksum, 512);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            ClusterConfig::from_file(file.path()),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ClusterConfig::default();
        config.nodes.push(NodeSpec::new(1, "/r9"));
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.nodes.clear();
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.coordinator.block_size = config.store.block_capacity + 1;
        assert!(config.validate().is_err());
    }
}
