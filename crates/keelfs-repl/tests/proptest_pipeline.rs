//! Property tests: packetization and pipeline writes under node crashes.

use std::sync::Arc;

use bytes::Bytes;
use keelfs_meta::{BlockId, NodeDescriptor, NodeId};
use keelfs_repl::{LocalTransport, Packet, PipelineConfig, ReplicationPipeline};
use keelfs_storage::{BlockStore, BlockStoreConfig};
use proptest::prelude::*;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_packets_cover_data_in_order(
        data in prop::collection::vec(any::<u8>(), 0..20_000),
        packet_size in 1usize..9_000,
        bpc in prop::sample::select(vec![64u32, 512, 4096]),
    ) {
        let data = Bytes::from(data);
        let packets = Packet::split(BlockId::new(1), &data, packet_size, bpc);
        let mut joined = Vec::new();
        for (i, p) in packets.iter().enumerate() {
            prop_assert_eq!(p.seqno, i as u64);
            prop_assert_eq!(p.offset, joined.len() as u64);
            prop_assert_eq!(p.last, i + 1 == packets.len());
            prop_assert!(p.first_corrupt_chunk().is_none());
            if !p.last {
                prop_assert_eq!(p.data.len() % bpc as usize, 0);
            }
            joined.extend_from_slice(&p.data);
        }
        prop_assert_eq!(Bytes::from(joined), data);
    }

    #[test]
    fn prop_survivors_hold_identical_replicas(
        len in 1usize..40_000,
        crash in prop::option::of((0usize..3, 0u64..12)),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(LocalTransport::new());
        let mut nodes = Vec::new();
        for n in 1..=3u64 {
            let store = BlockStore::open(
                dir.path().join(format!("dn{}", n)),
                BlockStoreConfig { sync_on_finalize: false, ..Default::default() },
            ).unwrap();
            transport.add_node(NodeId::new(n), Arc::new(store));
            nodes.push(NodeDescriptor {
                id: NodeId::new(n),
                address: format!("local:{}", n),
                rack: "/r1".to_string(),
            });
        }
        if let Some((idx, seqno)) = crash {
            transport.fail_at_packet(nodes[idx].id, seqno);
        }
        let pipeline = ReplicationPipeline::new(
            transport.clone(),
            PipelineConfig { packet_size: 4_096, ..Default::default() },
        );
        let data = Bytes::from((0..len).map(|i| (i % 239) as u8).collect::<Vec<u8>>());
        let block = BlockId::new(7);

        let ack = rt
            .block_on(pipeline.write_block(block, &nodes, data.clone(), &CancellationToken::new()))
            .unwrap();

        prop_assert_eq!(ack.len, len as u64);
        prop_assert_eq!(ack.replicas.len() + ack.failed.len(), 3);
        prop_assert!(ack.failed.len() <= 1);
        let digest = ack.replicas[0].checksum;
        for replica in &ack.replicas {
            prop_assert_eq!(replica.checksum, digest);
            let stored = transport.store(replica.node).unwrap().read(block).unwrap();
            prop_assert_eq!(Bytes::from(stored), data.clone());
        }
    }
}
