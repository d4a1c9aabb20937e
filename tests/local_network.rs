//! Two in-process nodes on loopback finding each other and syncing

use quidnode::config::{CoreConfig, NetConfig};
use quidnode::currency::Currency;
use quidnode::node::local::{genesis_block, HEADERS_FILE};
use quidnode::node::stack::{BlockSummary, ConsensusCore, NodeStack};
use quidnode::node::{event_channel, EventReceiver, InProcessNode, Node, NodeEvent, NodeState};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const NETWORK_ID: &str = "quid-loopback";

fn net_config(seeds: Vec<String>) -> NetConfig {
    NetConfig {
        listen: "127.0.0.1:0".to_string(),
        network_id: NETWORK_ID.to_string(),
        seeds,
        max_peers: 4,
        connect_timeout_secs: 2,
    }
}

fn chain(length: u64) -> Vec<BlockSummary> {
    let mut blocks = vec![genesis_block()];
    for i in 1..length {
        let prev = &blocks[blocks.len() - 1];
        let next = prev.next(format!("{:064x}", 0xa000 + i), prev.timestamp + 120);
        blocks.push(next);
    }
    blocks
}

fn start(
    data_dir: &Path,
    seeds: Vec<String>,
) -> (InProcessNode, Arc<dyn ConsensusCore>, EventReceiver) {
    let stack = NodeStack::local(NETWORK_ID);
    let core = stack.core.clone();
    let (sender, events) = event_channel();
    let node = InProcessNode::new(
        Currency::default(),
        CoreConfig {
            data_dir: data_dir.to_path_buf(),
            enforce_checkpoints: true,
        },
        net_config(seeds),
        stack,
        sender,
    );
    (node, core, events)
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("gave up waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nodes_sync_and_relay() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        // node A starts two blocks ahead of genesis
        let blocks = chain(3);
        std::fs::write(
            dir_a.path().join(HEADERS_FILE),
            serde_json::to_string(&blocks).unwrap(),
        )
        .unwrap();

        let (node_a, core_a, _events_a) = start(dir_a.path(), Vec::new());
        node_a.init().await.expect("node A should start");
        assert_eq!(node_a.last_local_block_height(), 2);
        let addr_a = node_a.p2p_addr().expect("node A is listening");

        let (node_b, _core_b, mut events_b) = start(dir_b.path(), vec![addr_a.to_string()]);
        node_b.init().await.expect("node B should start");

        wait_for("the nodes to peer", || {
            node_a.peer_count() == 1 && node_b.peer_count() == 1
        })
        .await;
        wait_for("node B to catch up", || node_b.last_local_block_height() == 2).await;
        assert_eq!(node_b.last_known_block_height(), 2);

        // a block found on A reaches B as an announcement
        let next = blocks[2].next("ff".repeat(32), blocks[2].timestamp + 120);
        assert!(core_a.handle_block(&next, None).unwrap());
        wait_for("the new block to reach B", || node_b.last_local_block_height() == 3).await;
        assert_eq!(node_b.last_local_block_timestamp(), next.timestamp);

        let mut seen = Vec::new();
        while let Ok(event) = events_b.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&NodeEvent::PeerCountUpdated(1)));
        assert!(seen.contains(&NodeEvent::LastKnownBlockHeightUpdated(2)));
        let local: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                NodeEvent::LocalBlockchainUpdated(h) => Some(*h),
                _ => None,
            })
            .collect();
        assert_eq!(local, vec![1, 2, 3]);

        node_b.deinit();
        node_b.join().await;
        node_a.deinit();
        node_a.join().await;
        assert_eq!(node_a.state(), NodeState::Stopped);
        assert_eq!(node_b.state(), NodeState::Stopped);

        let stored: Vec<BlockSummary> = serde_json::from_str(
            &std::fs::read_to_string(dir_b.path().join(HEADERS_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[3], next);
    })
    .await
    .expect("test_nodes_sync_and_relay timed out");
}

#[tokio::test]
async fn test_bind_failure_is_not_initialized() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let (node_a, _, _events) = start(dir_a.path(), Vec::new());
        node_a.init().await.unwrap();
        let taken = node_a.p2p_addr().unwrap();

        let stack = NodeStack::local(NETWORK_ID);
        let (sender, _receiver) = event_channel();
        let mut config = net_config(Vec::new());
        config.listen = taken.to_string();
        let node_b = InProcessNode::new(
            Currency::default(),
            CoreConfig {
                data_dir: dir_b.path().to_path_buf(),
                enforce_checkpoints: true,
            },
            config,
            stack,
            sender,
        );
        assert_eq!(node_b.init().await, Err(quidnode::NodeError::NotInitialized));
        assert!(matches!(node_b.state(), NodeState::Failed(_)));

        node_a.deinit();
        node_a.join().await;
    })
    .await
    .expect("test_bind_failure_is_not_initialized timed out");
}
