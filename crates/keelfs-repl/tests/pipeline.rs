//! Pipeline, reader and re-replication tests over in-process block stores.

use std::sync::Arc;

use bytes::Bytes;
use keelfs_meta::{
    BlockId, CoordinatorConfig, LocatedBlock, NamespaceCoordinator, NodeDescriptor, NodeId,
    RackAwarePlacement, RackTopology, ReplicaHost,
};
use keelfs_repl::{
    DataTransport, LocalTransport, PipelineConfig, ReReplicator, ReplError, ReplicaReader,
    ReplicationPipeline,
};
use keelfs_storage::{BlockStore, BlockStoreConfig};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Fixture {
    _dir: TempDir,
    transport: Arc<LocalTransport>,
    pipeline: ReplicationPipeline,
    nodes: Vec<NodeDescriptor>,
}

fn fixture(count: u64) -> Fixture {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(LocalTransport::new());
    let mut nodes = Vec::new();
    for n in 1..=count {
        let store = BlockStore::open(
            dir.path().join(format!("dn{}", n)),
            BlockStoreConfig {
                sync_on_finalize: false,
                ..Default::default()
            },
        )
        .unwrap();
        transport.add_node(NodeId::new(n), Arc::new(store));
        nodes.push(NodeDescriptor {
            id: NodeId::new(n),
            address: format!("127.0.0.1:{}", 9000 + n),
            rack: format!("/r{}", n % 2),
        });
    }
    let config = PipelineConfig {
        packet_size: 4_096,
        ..Default::default()
    };
    let pipeline = ReplicationPipeline::new(transport.clone(), config);
    Fixture {
        _dir: dir,
        transport,
        pipeline,
        nodes,
    }
}

fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i * 7 % 253) as u8).collect::<Vec<u8>>())
}

fn located(block: BlockId, len: usize, nodes: &[NodeId]) -> LocatedBlock {
    LocatedBlock {
        block,
        offset: 0,
        len: len as u64,
        complete: true,
        locations: nodes
            .iter()
            .map(|n| ReplicaHost {
                node: *n,
                address: String::new(),
                rack: String::new(),
                checksum: 0,
            })
            .collect(),
    }
}

#[tokio::test]
async fn test_three_replicas_with_matching_checksums() {
    let f = fixture(3);
    let block = BlockId::new(100);
    let data = payload(10_000);
    let ack = f
        .pipeline
        .write_block(block, &f.nodes, data.clone(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ack.len, 10_000);
    assert_eq!(ack.replicas.len(), 3);
    assert!(ack.failed.is_empty());
    let first = ack.replicas[0].checksum;
    assert!(ack.replicas.iter().all(|r| r.checksum == first));

    // 10_000 bytes in 4 KiB packets, acked last node first.
    assert_eq!(ack.acks.len(), 3);
    assert_eq!(
        ack.acks[0].acked_by,
        vec![NodeId::new(3), NodeId::new(2), NodeId::new(1)]
    );

    for n in 1..=3 {
        let stored = f.transport.read_block(NodeId::new(n), block).await.unwrap();
        assert_eq!(stored, data);
    }
}

#[tokio::test]
async fn test_mid_pipeline_failure_continues_with_survivors() {
    let f = fixture(3);
    let block = BlockId::new(101);
    let data = payload(20_000);
    f.transport.fail_at_packet(NodeId::new(2), 2);

    let ack = f
        .pipeline
        .write_block(block, &f.nodes, data.clone(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ack.failed, vec![NodeId::new(2)]);
    let holders: Vec<NodeId> = ack.replicas.iter().map(|r| r.node).collect();
    assert_eq!(holders, vec![NodeId::new(1), NodeId::new(3)]);
    assert_eq!(ack.acks[1].acked_by.len(), 3);
    assert_eq!(
        ack.acks[2].acked_by,
        vec![NodeId::new(3), NodeId::new(1)]
    );
    // The tail node received every packet despite losing its upstream.
    let stored = f.transport.read_block(NodeId::new(3), block).await.unwrap();
    assert_eq!(stored, data);
}

#[tokio::test]
async fn test_setup_skips_dead_node() {
    let f = fixture(3);
    f.transport.set_down(NodeId::new(1), true);
    let ack = f
        .pipeline
        .write_block(BlockId::new(5), &f.nodes, payload(100), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ack.failed, vec![NodeId::new(1)]);
    assert_eq!(ack.replicas.len(), 2);
}

#[tokio::test]
async fn test_all_nodes_fail() {
    let f = fixture(2);
    f.transport.fail_at_packet(NodeId::new(1), 0);
    f.transport.fail_at_packet(NodeId::new(2), 1);
    let err = f
        .pipeline
        .write_block(BlockId::new(6), &f.nodes, payload(9_000), &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ReplError::PipelineBroken { failed, .. } => {
            assert_eq!(failed, vec![NodeId::new(1), NodeId::new(2)]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_cancelled_write() {
    let f = fixture(3);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let block = BlockId::new(7);
    let err = f
        .pipeline
        .write_block(block, &f.nodes, payload(1_000), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ReplError::Cancelled { .. }));
    let store = f.transport.store(NodeId::new(1)).unwrap();
    assert!(!store.contains(block));
}

#[tokio::test]
async fn test_parallel_pipelines() {
    let f = fixture(3);
    let token = CancellationToken::new();
    let a = f
        .pipeline
        .write_block(BlockId::new(20), &f.nodes, payload(30_000), &token);
    let b = f
        .pipeline
        .write_block(BlockId::new(21), &f.nodes[1..], payload(5_000), &token);
    let (a, b) = tokio::join!(a, b);
    assert_eq!(a.unwrap().replicas.len(), 3);
    assert_eq!(b.unwrap().replicas.len(), 2);
}

#[tokio::test]
async fn test_reader_falls_back_on_corruption() {
    let f = fixture(3);
    let block = BlockId::new(30);
    let data = payload(3_000);
    f.pipeline
        .write_block(block, &f.nodes, data.clone(), &CancellationToken::new())
        .await
        .unwrap();

    // Flip a byte in the first replica's data file.
    let store = f.transport.store(NodeId::new(1)).unwrap();
    let path = store.root().join("finalized").join(block.file_name());
    let mut raw = std::fs::read(&path).unwrap();
    raw[100] ^= 0xFF;
    std::fs::write(&path, raw).unwrap();

    let reader = ReplicaReader::new(f.transport.clone());
    let nodes = [NodeId::new(1), NodeId::new(2), NodeId::new(3)];
    let outcome = reader
        .read_block(&located(block, 3_000, &nodes))
        .await
        .unwrap();
    assert_eq!(outcome.data, data);
    assert_eq!(outcome.node, NodeId::new(2));
    assert_eq!(outcome.corrupt, vec![NodeId::new(1)]);

    let err = reader
        .read_block(&located(block, 3_000, &nodes[..1]))
        .await
        .unwrap_err();
    assert!(matches!(err, ReplError::CorruptBlock { .. }));

    f.transport.set_down(NodeId::new(2), true);
    let err = reader
        .read_block(&located(block, 3_000, &nodes[1..2]))
        .await
        .unwrap_err();
    assert!(matches!(err, ReplError::NoReplicas { .. }));
}

#[tokio::test]
async fn test_reader_skips_replica_with_wrong_length() {
    let f = fixture(3);
    let block = BlockId::new(31);
    let cancel = CancellationToken::new();
    // Node 1 holds a longer copy than the committed length.
    f.pipeline
        .write_block(block, &f.nodes[..1], payload(4_000), &cancel)
        .await
        .unwrap();
    f.pipeline
        .write_block(block, &f.nodes[1..], payload(3_000), &cancel)
        .await
        .unwrap();

    let reader = ReplicaReader::new(f.transport.clone());
    let nodes = [NodeId::new(1), NodeId::new(2), NodeId::new(3)];
    let outcome = reader
        .read_block(&located(block, 3_000, &nodes))
        .await
        .unwrap();
    assert_eq!(outcome.data, payload(3_000));
    assert_eq!(outcome.node, NodeId::new(2));
    assert_eq!(outcome.corrupt, vec![NodeId::new(1)]);

    let err = reader
        .read_block(&located(block, 2_000, &nodes))
        .await
        .unwrap_err();
    assert!(matches!(err, ReplError::CorruptBlock { .. }));
}

#[tokio::test]
async fn test_rereplication_restores_count() {
    let f = fixture(4);
    let meta_dir = TempDir::new().unwrap();
    let coordinator = Arc::new(
        NamespaceCoordinator::open_with(
            CoordinatorConfig {
                meta_dir: meta_dir.path().to_path_buf(),
                sync_log: false,
                ..Default::default()
            },
            Box::new(RackAwarePlacement::with_seed(9)),
            Box::new(RackTopology),
        )
        .unwrap(),
    );
    for node in &f.nodes {
        coordinator.register_node(node.id, node.address.clone(), node.rack.clone(), 0);
    }
    coordinator.create_file("/f", None, false).unwrap();
    let alloc = coordinator.allocate_block("/f", None).unwrap();
    let data = payload(8_192);
    let ack = f
        .pipeline
        .write_block(alloc.block, &alloc.targets, data.clone(), &CancellationToken::new())
        .await
        .unwrap();
    coordinator
        .commit_block("/f", alloc.block, ack.len, &ack.replicas)
        .unwrap();

    // One holder reports corruption; the coordinator schedules a new copy.
    let bad = ack.replicas[0].node;
    coordinator.report_corrupt_replica(alloc.block, bad).unwrap();
    let tasks = coordinator.compute_replication_work(0);
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].targets.iter().all(|t| t.id != bad
        && !ack.replicas.iter().any(|r| r.node == t.id)));

    let pipeline = Arc::new(ReplicationPipeline::new(
        f.transport.clone(),
        PipelineConfig::default(),
    ));
    let executor = ReReplicator::new(pipeline, coordinator.clone());
    executor
        .execute(&tasks[0], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(coordinator.replicas(alloc.block).len(), 3);
    assert!(coordinator.pending_replications().is_empty());
    assert!(coordinator.under_replicated_blocks().is_empty());
}
