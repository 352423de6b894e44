//! End-to-end tests over an in-process cluster.

use std::collections::HashSet;

use bytes::Bytes;
use keelfs_client::{ClientError, ClusterConfig, MiniCluster, NodeSpec, RetryConfig};
use keelfs_meta::{
    BlockId, CoordinatorConfig, LivenessEvent, MetaError, NodeHealth, NodeId,
};
use keelfs_repl::PipelineConfig;
use keelfs_storage::{BlockStore, BlockStoreConfig};
use tempfile::TempDir;

const T0: u64 = 10_000_000;
const BLOCK: usize = 64 * 1024;

fn config(dir: &TempDir) -> ClusterConfig {
    ClusterConfig {
        data_dir: dir.path().to_path_buf(),
        nodes: vec![
            NodeSpec::new(1, "/r1"),
            NodeSpec::new(2, "/r1"),
            NodeSpec::new(3, "/r2"),
            NodeSpec::new(4, "/r2"),
        ],
        coordinator: CoordinatorConfig {
            sync_log: false,
            block_size: BLOCK as u64,
            ..Default::default()
        },
        store: BlockStoreConfig {
            sync_on_finalize: false,
            ..Default::default()
        },
        pipeline: PipelineConfig {
            packet_size: 4_096,
            ..Default::default()
        },
        retry: RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            jitter: false,
            ..Default::default()
        },
    }
}

fn payload(len: usize, seed: u8) -> Bytes {
    Bytes::from(
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect::<Vec<u8>>(),
    )
}

fn blocks_of(cluster: &MiniCluster, path: &str) -> Vec<BlockId> {
    cluster
        .coordinator()
        .get_block_locations(path, None)
        .unwrap()
        .iter()
        .map(|b| b.block)
        .collect()
}

fn corrupt_replica(store: &BlockStore, block: BlockId) {
    let path = store.root().join("finalized").join(block.file_name());
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[0] ^= 0x01;
    std::fs::write(&path, bytes).unwrap();
}

#[tokio::test]
async fn test_write_is_replicated_three_times_with_matching_checksums() {
    let dir = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    let client = cluster.client();
    let data = payload(BLOCK * 2 + 1_000, 1);

    client.mkdirs("/data").unwrap();
    let status = client.write("/data/f", data.clone(), false).await.unwrap();
    assert_eq!(status.len, data.len() as u64);
    assert_eq!(status.replication, 3);

    let files = client.list_files("/data", false).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].blocks.len(), 3);
    for block in &files[0].blocks {
        assert!(block.complete);
        assert_eq!(block.locations.len(), 3);
        let sums: HashSet<u32> = block.locations.iter().map(|h| h.checksum).collect();
        assert_eq!(sums.len(), 1, "replicas of {} disagree", block.block);
        let racks: HashSet<&str> = block.locations.iter().map(|h| h.rack.as_str()).collect();
        assert_eq!(racks.len(), 2);
        for host in &block.locations {
            let store = cluster.transport().store(host.node).unwrap();
            assert!(store.verify(block.block).unwrap());
        }
    }
    assert_eq!(files[0].blocks[2].len, 1_000);
    assert_eq!(client.read("/data/f").await.unwrap(), data);
}

#[tokio::test]
async fn test_put_and_get_local_files() {
    let dir = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    let client = cluster.client();

    let src = local.path().join("in.bin");
    let data = payload(BLOCK + 17, 2);
    std::fs::write(&src, &data).unwrap();

    let status = client.put(&src, "/in.bin", false).await.unwrap();
    assert_eq!(status.len, data.len() as u64);

    let dst = local.path().join("out.bin");
    let written = client.get("/in.bin", &dst).await.unwrap();
    assert_eq!(written, data.len() as u64);
    assert_eq!(std::fs::read(&dst).unwrap(), data.to_vec());

    let empty = local.path().join("empty");
    std::fs::write(&empty, b"").unwrap();
    let status = client.put(&empty, "/empty", false).await.unwrap();
    assert_eq!(status.len, 0);
    assert!(client.read("/empty").await.unwrap().is_empty());

    assert!(matches!(
        client.put(local.path(), "/dir", false).await,
        Err(ClientError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_put_into_existing_directory_uses_local_name() {
    let dir = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    let client = cluster.client();

    let src = local.path().join("role.txt");
    std::fs::write(&src, b"admin,reader").unwrap();
    client.mkdir("/input").unwrap();

    let status = client.put(&src, "/input", false).await.unwrap();
    assert_eq!(status.path, "/input/role.txt");
    assert!(client.status("/input").unwrap().is_dir());
    assert_eq!(client.read("/input/role.txt").await.unwrap(), &b"admin,reader"[..]);

    // Same rule at the root, and the usual overwrite check still applies.
    client.put(&src, "/", false).await.unwrap();
    assert_eq!(client.read("/role.txt").await.unwrap(), &b"admin,reader"[..]);
    assert!(matches!(
        client.put(&src, "/input", false).await,
        Err(ClientError::Meta(MetaError::AlreadyExists { .. }))
    ));
}

#[tokio::test]
async fn test_get_into_existing_directory_uses_remote_name() {
    let dir = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    let client = cluster.client();
    client.mkdirs("/sanguo").unwrap();
    client
        .write("/sanguo/shuguo.txt", payload(2_000, 4), false)
        .await
        .unwrap();

    let downloads = local.path().join("Downloads");
    std::fs::create_dir(&downloads).unwrap();
    let written = client.get("/sanguo/shuguo.txt", &downloads).await.unwrap();
    assert_eq!(written, 2_000);
    assert_eq!(
        std::fs::read(downloads.join("shuguo.txt")).unwrap(),
        payload(2_000, 4).to_vec()
    );
    assert!(!downloads.join("shuguo.txt.keelfs-part").exists());
}

#[tokio::test]
async fn test_failed_get_leaves_no_partial_file() {
    let dir = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    let client = cluster.client();
    client.write("/a.txt", payload(1_000, 5), false).await.unwrap();

    // The final rename hits a non-empty directory of the same name.
    let downloads = local.path().join("Downloads");
    std::fs::create_dir_all(downloads.join("a.txt").join("keep")).unwrap();
    assert!(matches!(
        client.get("/a.txt", &downloads).await,
        Err(ClientError::Io(_))
    ));
    assert!(!downloads.join("a.txt.keelfs-part").exists());

    // A read failure cleans up too.
    let block = blocks_of(&cluster, "/a.txt")[0];
    for node in cluster.node_ids() {
        let store = cluster.transport().store(node).unwrap();
        if store.contains(block) {
            corrupt_replica(&store, block);
        }
    }
    let out = local.path().join("out.txt");
    assert!(client.get("/a.txt", &out).await.is_err());
    assert!(!local.path().join("out.txt.keelfs-part").exists());
    assert!(!out.exists());
}

#[tokio::test]
async fn test_namespace_errors() {
    let dir = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    let client = cluster.client();

    client.mkdirs("/a/b").unwrap();
    client.write("/a/b/f", payload(100, 3), false).await.unwrap();

    assert!(matches!(
        client.write("/a/b/f", payload(10, 4), false).await,
        Err(ClientError::Meta(MetaError::AlreadyExists { .. }))
    ));
    assert!(matches!(
        client.mkdir("/a"),
        Err(ClientError::Meta(MetaError::AlreadyExists { .. }))
    ));
    assert!(matches!(
        client.mkdir("/x/y"),
        Err(ClientError::Meta(MetaError::NotFound { .. }))
    ));
    assert!(matches!(
        client.rm("/a", false),
        Err(ClientError::Meta(MetaError::NotEmpty { .. }))
    ));
    // The failed overwrite left the original in place.
    assert_eq!(client.read("/a/b/f").await.unwrap(), payload(100, 3));

    let replaced = client.write("/a/b/f", payload(10, 4), true).await.unwrap();
    assert_eq!(replaced.len, 10);

    client.mkdir("/c").unwrap();
    client.mv("/a/b/f", "/c").unwrap();
    assert_eq!(client.read("/c/f").await.unwrap(), payload(10, 4));
    assert!(client.list_status("/a/b").unwrap().is_empty());

    client.rm("/a", true).unwrap();
    let names: Vec<String> = client
        .list_status("/")
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["c"]);
}

#[tokio::test]
async fn test_dead_node_is_flagged_and_rereplicated_once() {
    let dir = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    let client = cluster.client();
    client.write("/f", payload(BLOCK / 2, 5), false).await.unwrap();

    let block = blocks_of(&cluster, "/f")[0];
    let holders: Vec<NodeId> = cluster
        .coordinator()
        .replicas(block)
        .iter()
        .map(|r| r.node)
        .collect();
    assert_eq!(holders.len(), 3);
    let victim = holders[0];
    cluster.kill_node(victim).unwrap();

    let dead_after = cluster.config().coordinator.liveness.dead_after_ms;
    let now = T0 + dead_after + 1;
    let report = cluster.step(now).await.unwrap();

    assert!(report.events.iter().any(
        |e| matches!(e, LivenessEvent::NodeDead { node, blocks } if *node == victim && blocks.contains(&block))
    ));
    assert_eq!(report.lost_replicas, vec![block]);
    assert_eq!(report.tasks.len(), 1);
    assert_eq!(report.tasks[0].block, block);
    assert!(!report.tasks[0].targets.iter().any(|t| holders.contains(&t.id)));

    // The task ran in the second heartbeat round of the step.
    let replicas = cluster.coordinator().replicas(block);
    assert_eq!(replicas.len(), 3);
    assert!(!replicas.iter().any(|r| r.node == victim));
    assert!(cluster.coordinator().pending_replications().is_empty());
    assert!(cluster.coordinator().under_replicated_blocks().is_empty());

    let again = cluster.step(now + 1_000).await.unwrap();
    assert!(again.tasks.is_empty());

    // The revived node reports a copy that is now surplus and is told to drop it.
    cluster.restart_node(victim, now + 2_000).unwrap();
    assert_eq!(
        cluster.coordinator().monitor().health(victim),
        Some(NodeHealth::Alive)
    );
    cluster.step(now + 3_000).await.unwrap();
    assert_eq!(cluster.coordinator().replicas(block).len(), 3);
    assert!(!cluster.transport().store(victim).unwrap().contains(block));
    assert_eq!(client.read("/f").await.unwrap(), payload(BLOCK / 2, 5));
}

#[tokio::test]
async fn test_dead_node_blocks_flagged_within_one_tick() {
    let dir = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    let client = cluster.client();
    for i in 0..4u8 {
        client
            .write(&format!("/f{}", i), payload(1_000, i), false)
            .await
            .unwrap();
    }
    let victim = cluster.coordinator().replicas(blocks_of(&cluster, "/f0")[0])[0].node;
    let held: HashSet<BlockId> = cluster
        .coordinator()
        .monitor()
        .node(victim)
        .unwrap()
        .blocks;
    assert!(!held.is_empty());

    cluster.kill_node(victim).unwrap();
    let now = T0 + cluster.config().coordinator.liveness.dead_after_ms + 1;
    cluster.heartbeat_all(now).await.unwrap();
    let report = cluster.coordinator().tick(now);

    let lost: HashSet<BlockId> = report.lost_replicas.iter().copied().collect();
    assert_eq!(lost, held);
    assert_eq!(report.tasks.len(), held.len());
}

#[tokio::test]
async fn test_corrupt_replica_falls_back_and_is_replaced() {
    let dir = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    let client = cluster.client();
    let data = payload(20_000, 6);
    client.write("/f", data.clone(), false).await.unwrap();

    let located = cluster.coordinator().get_block_locations("/f", None).unwrap();
    let block = located[0].block;
    let bad = located[0].locations[0].node;
    let store = cluster.transport().store(bad).unwrap();
    let path = store.root().join("finalized").join(block.file_name());
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[100] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    assert_eq!(client.read("/f").await.unwrap(), data);
    let replicas = cluster.coordinator().replicas(block);
    assert_eq!(replicas.len(), 2);
    assert!(!replicas.iter().any(|r| r.node == bad));
    assert_eq!(cluster.coordinator().under_replicated_blocks(), vec![block]);

    cluster.step(T0 + 3_000).await.unwrap();
    assert_eq!(cluster.coordinator().replicas(block).len(), 3);
    for r in cluster.coordinator().replicas(block) {
        assert!(cluster
            .transport()
            .store(r.node)
            .unwrap()
            .verify(block)
            .unwrap());
    }
}

#[tokio::test]
async fn test_all_replicas_corrupt_surfaces_error() {
    let dir = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    let client = cluster.client();
    client.write("/f", payload(5_000, 7), false).await.unwrap();

    let block = blocks_of(&cluster, "/f")[0];
    for r in cluster.coordinator().replicas(block) {
        let store = cluster.transport().store(r.node).unwrap();
        let path = store.root().join("finalized").join(block.file_name());
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();
    }
    let err = client.read("/f").await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Repl(keelfs_repl::ReplError::CorruptBlock { .. })
    ));
}

#[tokio::test]
async fn test_node_crash_mid_write_shortens_pipeline() {
    let dir = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    let writer = NodeId::new(1);
    let client = cluster.client().with_writer(writer);
    let data = payload(BLOCK, 8);

    cluster.transport().fail_at_packet(writer, 3);
    client.write("/f", data.clone(), false).await.unwrap();

    let block = blocks_of(&cluster, "/f")[0];
    let replicas = cluster.coordinator().replicas(block);
    assert_eq!(replicas.len(), 2);
    assert!(!replicas.iter().any(|r| r.node == writer));
    assert_eq!(cluster.coordinator().under_replicated_blocks(), vec![block]);
    assert_eq!(client.read("/f").await.unwrap(), data);

    // Once the crashed node goes stale the copy lands on the remaining node.
    cluster.kill_node(writer).unwrap();
    let stale = T0 + cluster.config().coordinator.liveness.stale_after_ms + 1;
    let report = cluster.step(stale).await.unwrap();
    assert_eq!(report.tasks.len(), 1);
    assert_eq!(cluster.coordinator().replicas(block).len(), 3);
}

#[tokio::test]
async fn test_insufficient_nodes_retries_then_removes_file() {
    let dir = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    cluster.kill_node(NodeId::new(2)).unwrap();
    cluster.kill_node(NodeId::new(4)).unwrap();
    let stale = T0 + cluster.config().coordinator.liveness.stale_after_ms + 1;
    cluster.step(stale).await.unwrap();

    let client = cluster.client();
    let err = client.write("/f", payload(100, 9), false).await.unwrap_err();
    match &err {
        ClientError::RetriesExhausted { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(
        err.root(),
        ClientError::Meta(MetaError::InsufficientNodes {
            required: 3,
            available: 2
        })
    ));
    assert!(matches!(
        client.status("/f"),
        Err(ClientError::Meta(MetaError::NotFound { .. }))
    ));

    // A lower replication factor fits on the surviving nodes.
    let client = cluster.client().with_replication(2);
    client.write("/g", payload(100, 9), false).await.unwrap();
    let block = blocks_of(&cluster, "/g")[0];
    assert_eq!(cluster.coordinator().replicas(block).len(), 2);
}

#[tokio::test]
async fn test_deleted_blocks_are_removed_from_datanodes() {
    let dir = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    let client = cluster.client();
    client.write("/f", payload(3_000, 10), false).await.unwrap();
    let block = blocks_of(&cluster, "/f")[0];
    let holders: Vec<NodeId> = cluster
        .coordinator()
        .replicas(block)
        .iter()
        .map(|r| r.node)
        .collect();

    client.rm("/f", false).unwrap();
    let stats = cluster.heartbeat_all(T0 + 1_000).await.unwrap();
    assert_eq!(stats.invalidated, 3);
    for node in holders {
        assert!(!cluster.transport().store(node).unwrap().contains(block));
    }

    // A partial replica left by an aborted write is collected by the scan.
    let store = cluster.transport().store(NodeId::new(1)).unwrap();
    let stray = BlockId::new(999);
    store.create(stray).unwrap();
    store.append(stray, b"partial").unwrap();
    store.abort(stray);
    assert_eq!(cluster.collect_garbage().unwrap(), 1);
}

#[tokio::test]
async fn test_failed_invalidation_does_not_drop_the_rest() {
    let dir = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    let client = cluster.client();
    client.write("/a", payload(3_000, 11), false).await.unwrap();
    client.write("/b", payload(3_000, 12), false).await.unwrap();
    let a = blocks_of(&cluster, "/a")[0];
    let b = blocks_of(&cluster, "/b")[0];

    // Three of four nodes hold each block, so some node holds both.
    let holds = |node: NodeId, block: BlockId| {
        cluster
            .coordinator()
            .replicas(block)
            .iter()
            .any(|r| r.node == node)
    };
    let node = cluster
        .node_ids()
        .into_iter()
        .find(|n| holds(*n, a) && holds(*n, b))
        .unwrap();
    let store = cluster.transport().store(node).unwrap();
    let stuck = store.root().join("finalized").join(a.file_name());
    std::fs::remove_file(&stuck).unwrap();
    std::fs::create_dir_all(stuck.join("pinned")).unwrap();

    client.rm("/a", false).unwrap();
    client.rm("/b", false).unwrap();
    let stats = cluster.heartbeat_all(T0 + 1_000).await.unwrap();
    assert_eq!(stats.invalidation_failures, 1);
    assert_eq!(stats.invalidated, 5);
    assert!(!store.contains(b));
    for other in cluster.node_ids() {
        let other_store = cluster.transport().store(other).unwrap();
        assert!(!other_store.contains(b));
        if other != node {
            assert!(!other_store.contains(a));
        }
    }
}

#[tokio::test]
async fn test_restart_recovers_namespace_and_locations() {
    let dir = TempDir::new().unwrap();
    let a = payload(BLOCK + 5, 11);
    let b = payload(777, 12);
    {
        let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
        let client = cluster.client();
        client.mkdirs("/logs").unwrap();
        client.write("/logs/a", a.clone(), false).await.unwrap();
        assert!(cluster.coordinator().checkpoint(T0 + 1).unwrap().is_some());
        client.write("/logs/b", b.clone(), false).await.unwrap();
        client.mkdir("/archive").unwrap();
        client.mv("/logs/a", "/archive/a").unwrap();
    }

    let cluster = MiniCluster::start_at(config(&dir), T0 + 60_000).unwrap();
    let client = cluster.client();
    assert_eq!(client.read("/archive/a").await.unwrap(), a);
    assert_eq!(client.read("/logs/b").await.unwrap(), b);
    let names: Vec<String> = client
        .list_status("/logs")
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["b"]);
    for block in blocks_of(&cluster, "/archive/a") {
        assert_eq!(cluster.coordinator().replicas(block).len(), 3);
    }

    // New blocks do not collide with recovered ones.
    let before: HashSet<BlockId> = cluster.coordinator().reachable_blocks();
    client.write("/logs/c", payload(10, 13), false).await.unwrap();
    let new = blocks_of(&cluster, "/logs/c")[0];
    assert!(!before.contains(&new));
}

#[tokio::test]
async fn test_replica_scan_reports_corruption() {
    let dir = TempDir::new().unwrap();
    let cluster = MiniCluster::start_at(config(&dir), T0).unwrap();
    let client = cluster.client();
    client.write("/f", payload(9_000, 14), false).await.unwrap();

    let block = blocks_of(&cluster, "/f")[0];
    let node = cluster.coordinator().replicas(block)[1].node;
    let datanode = cluster.datanode(node).unwrap();
    assert!(datanode.scan_replicas().unwrap().is_empty());

    let path = datanode
        .store()
        .root()
        .join("finalized")
        .join(block.file_name());
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[8_999] ^= 0x80;
    std::fs::write(&path, bytes).unwrap();

    assert_eq!(datanode.scan_replicas().unwrap(), vec![block]);
    assert!(!cluster
        .coordinator()
        .replicas(block)
        .iter()
        .any(|r| r.node == node));
    assert_eq!(cluster.coordinator().under_replicated_blocks(), vec![block]);
}

#[tokio::test]
async fn test_heartbeat_loop_delivers_commands_until_shutdown() {
    let dir = TempDir::new().unwrap();
    let cluster = MiniCluster::start(config(&dir)).unwrap();
    let client = cluster.client();
    client.write("/f", payload(2_000, 15), false).await.unwrap();
    let block = blocks_of(&cluster, "/f")[0];
    let node = cluster.coordinator().replicas(block)[0].node;
    client.rm("/f", false).unwrap();

    let datanode = std::sync::Arc::clone(cluster.datanode(node).unwrap());
    let handle = std::sync::Arc::clone(&datanode)
        .spawn_heartbeat_loop(std::time::Duration::from_millis(10));
    for _ in 0..200 {
        if !datanode.store().contains(block) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(!datanode.store().contains(block));

    datanode.shutdown();
    handle.await.unwrap();
}
