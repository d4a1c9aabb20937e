//! Integration tests for the in-process bootstrap sequence
//!
//! The collaborators here are spies that record what they saw, so the tests
//! can check ordering and failure handling without real networking.

use async_trait::async_trait;
use parking_lot::Mutex;
use quidnode::checkpoints::Checkpoints;
use quidnode::config::{CoreConfig, NetConfig};
use quidnode::currency::Currency;
use quidnode::node::stack::{
    BlockSummary, ConsensusCore, NodeServer, NodeStack, P2pEndpoint, PeerId, ProtocolHandler,
    WireMessage,
};
use quidnode::node::{event_channel, InProcessNode, Node, NodeEvent, NodeState};
use quidnode::{NodeError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, PartialEq)]
enum InitOutcome {
    Succeed,
    Fail,
    Panic,
}

struct SpyCore {
    outcome: InitOutcome,
    protocol: Mutex<Option<Weak<dyn ProtocolHandler>>>,
    checkpoints_loaded: AtomicBool,
    init_called: AtomicBool,
    deinit_called: AtomicBool,
    /// When set, init meets the test twice on this barrier.
    gate: Option<Arc<Barrier>>,
    notifier: broadcast::Sender<NodeEvent>,
}

impl ConsensusCore for SpyCore {
    fn set_protocol(&self, protocol: Arc<dyn ProtocolHandler>) {
        *self.protocol.lock() = Some(Arc::downgrade(&protocol));
    }
    fn has_protocol(&self) -> bool {
        self.protocol
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some()
    }
    fn set_checkpoints(&self, checkpoints: Checkpoints) {
        self.checkpoints_loaded
            .store(!checkpoints.is_empty(), Ordering::SeqCst);
    }
    fn init(&self, _config: &CoreConfig) -> Result<()> {
        self.init_called.store(true, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
            gate.wait();
        }
        // nobody is subscribed yet, this one must not reach the caller
        let _ = self.notifier.send(NodeEvent::LocalBlockchainUpdated(99));
        match self.outcome {
            InitOutcome::Succeed => Ok(()),
            InitOutcome::Fail => Err(NodeError::IoError("disk on fire".to_string())),
            InitOutcome::Panic => panic!("core exploded"),
        }
    }
    fn deinit(&self) {
        self.deinit_called.store(true, Ordering::SeqCst);
    }
    fn top_block(&self) -> BlockSummary {
        BlockSummary {
            height: 3,
            hash: "cc".repeat(32),
            prev_hash: "bb".repeat(32),
            timestamp: 1_650_000_000,
        }
    }
    fn handle_block(&self, _block: &BlockSummary, _source: Option<&PeerId>) -> Result<bool> {
        Ok(false)
    }
    fn blocks_from(&self, _height: u64, _max: usize) -> Vec<BlockSummary> {
        Vec::new()
    }
}

#[derive(Default)]
struct SpyProtocol {
    endpoint: Mutex<Option<Weak<dyn P2pEndpoint>>>,
}

impl ProtocolHandler for SpyProtocol {
    fn set_p2p_endpoint(&self, endpoint: Arc<dyn P2pEndpoint>) {
        *self.endpoint.lock() = Some(Arc::downgrade(&endpoint));
    }
    fn has_p2p_endpoint(&self) -> bool {
        self.endpoint
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some()
    }
    fn peer_count(&self) -> usize {
        2
    }
    fn observed_height(&self) -> u64 {
        10
    }
    fn on_connection_opened(&self, _peer: &PeerId) {}
    fn on_message(&self, _peer: &PeerId, _message: WireMessage) -> Result<()> {
        Ok(())
    }
    fn on_connection_closed(&self, _peer: &PeerId) {}
    fn relay_block(&self, _block: &BlockSummary, _source: Option<&PeerId>) {}
    fn on_idle(&self) {}
}

struct SpyServer {
    core: Arc<SpyCore>,
    protocol: Arc<SpyProtocol>,
    fail_run: bool,
    init_called: AtomicBool,
    wired_at_init: AtomicBool,
    wired_at_run: AtomicBool,
    deinit_called: AtomicBool,
    notifier: broadcast::Sender<NodeEvent>,
}

impl SpyServer {
    fn wired(&self) -> bool {
        self.core.has_protocol() && self.protocol.has_p2p_endpoint()
    }
}

impl P2pEndpoint for SpyServer {
    fn send(&self, _peer: &PeerId, _message: WireMessage) -> bool {
        false
    }
    fn broadcast(&self, _message: WireMessage, _except: Option<&PeerId>) -> usize {
        0
    }
    fn drop_connection(&self, _peer: &PeerId) {}
}

#[async_trait]
impl NodeServer for SpyServer {
    fn init(&self, _config: &NetConfig) -> Result<()> {
        self.init_called.store(true, Ordering::SeqCst);
        self.wired_at_init.store(self.wired(), Ordering::SeqCst);
        Ok(())
    }
    async fn run(&self, stop: CancellationToken) -> Result<()> {
        self.wired_at_run.store(self.wired(), Ordering::SeqCst);
        let _ = self.notifier.send(NodeEvent::PeerCountUpdated(2));
        if self.fail_run {
            return Err(NodeError::NetworkError("listener lost".to_string()));
        }
        stop.cancelled().await;
        Ok(())
    }
    fn deinit(&self) {
        self.deinit_called.store(true, Ordering::SeqCst);
    }
    fn as_endpoint(self: Arc<Self>) -> Arc<dyn P2pEndpoint> {
        self
    }
}

struct Harness {
    node: Arc<InProcessNode>,
    core: Arc<SpyCore>,
    server: Arc<SpyServer>,
    events: quidnode::node::EventReceiver,
    _data: tempfile::TempDir,
}

fn harness(outcome: InitOutcome, fail_run: bool) -> Harness {
    gated_harness(outcome, fail_run, None)
}

fn gated_harness(outcome: InitOutcome, fail_run: bool, gate: Option<Arc<Barrier>>) -> Harness {
    let notifier = NodeStack::notifier();
    let core = Arc::new(SpyCore {
        outcome,
        protocol: Mutex::new(None),
        checkpoints_loaded: AtomicBool::new(false),
        init_called: AtomicBool::new(false),
        deinit_called: AtomicBool::new(false),
        gate,
        notifier: notifier.clone(),
    });
    let protocol = Arc::new(SpyProtocol::default());
    let server = Arc::new(SpyServer {
        core: core.clone(),
        protocol: protocol.clone(),
        fail_run,
        init_called: AtomicBool::new(false),
        wired_at_init: AtomicBool::new(false),
        wired_at_run: AtomicBool::new(false),
        deinit_called: AtomicBool::new(false),
        notifier: notifier.clone(),
    });
    let stack = NodeStack::new(core.clone(), protocol, server.clone(), notifier);

    let data = tempfile::tempdir().unwrap();
    let core_config = CoreConfig {
        data_dir: data.path().to_path_buf(),
        enforce_checkpoints: true,
    };
    let (sender, events) = event_channel();
    let node = Arc::new(InProcessNode::new(
        Currency::default(),
        core_config,
        NetConfig::default(),
        stack,
        sender,
    ));
    Harness {
        node,
        core,
        server,
        events,
        _data: data,
    }
}

#[tokio::test]
async fn test_bootstrap_wires_before_running() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let mut h = harness(InitOutcome::Succeed, false);
        assert_eq!(h.node.state(), NodeState::Uninitialized);
        assert_eq!(h.node.peer_count(), 0);

        h.node.init().await.expect("bootstrap should succeed");
        assert_eq!(h.node.state(), NodeState::Running);
        assert!(h.core.checkpoints_loaded.load(Ordering::SeqCst));
        assert!(h.server.wired_at_init.load(Ordering::SeqCst));

        // only events raised after init reach the observer
        assert_eq!(h.events.recv().await, Some(NodeEvent::PeerCountUpdated(2)));
        assert!(h.server.wired_at_run.load(Ordering::SeqCst));

        let snapshot = h.node.snapshot();
        assert_eq!(snapshot.last_local_block_height, 3);
        assert_eq!(snapshot.last_known_block_height, 10);
        assert_eq!(snapshot.last_local_block_timestamp, 1_650_000_000);
        assert_eq!(snapshot.peer_count, 2);
        assert_eq!(h.node.create_wallet().chain_snapshot(), snapshot);

        h.node.deinit();
        h.node.join().await;
        assert_eq!(h.node.state(), NodeState::Stopped);
        assert!(h.server.deinit_called.load(Ordering::SeqCst));
        assert_eq!(h.node.peer_count(), 0);
    })
    .await
    .expect("test_bootstrap_wires_before_running timed out");
}

#[tokio::test]
async fn test_core_failure_skips_server() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let mut h = harness(InitOutcome::Fail, false);
        assert_eq!(h.node.init().await, Err(NodeError::NotInitialized));
        assert!(h.core.init_called.load(Ordering::SeqCst));
        assert!(!h.server.init_called.load(Ordering::SeqCst));
        assert!(matches!(h.node.state(), NodeState::Failed(_)));
        assert!(h.events.try_recv().is_err());
    })
    .await
    .expect("test_core_failure_skips_server timed out");
}

#[tokio::test]
async fn test_core_panic_is_not_initialized() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let h = harness(InitOutcome::Panic, false);
        assert_eq!(h.node.init().await, Err(NodeError::NotInitialized));
        assert!(!h.server.init_called.load(Ordering::SeqCst));
        assert!(matches!(h.node.state(), NodeState::Failed(_)));
    })
    .await
    .expect("test_core_panic_is_not_initialized timed out");
}

#[tokio::test]
async fn test_second_init_rejected() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let h = harness(InitOutcome::Succeed, false);
        h.node.init().await.unwrap();
        assert_eq!(h.node.init().await, Err(NodeError::AlreadyInitialized));
        assert_eq!(h.node.state(), NodeState::Running);
        h.node.deinit();
        h.node.join().await;

        let failed = harness(InitOutcome::Fail, false);
        assert!(failed.node.init().await.is_err());
        assert_eq!(
            failed.node.init().await,
            Err(NodeError::AlreadyInitialized)
        );
    })
    .await
    .expect("test_second_init_rejected timed out");
}

#[tokio::test]
async fn test_run_loop_error_marks_failed() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let h = harness(InitOutcome::Succeed, true);
        h.node.init().await.expect("bootstrap should succeed");
        h.node.join().await;
        assert!(matches!(h.node.state(), NodeState::Failed(reason) if reason.contains("listener lost")));
        assert!(h.server.deinit_called.load(Ordering::SeqCst));
    })
    .await
    .expect("test_run_loop_error_marks_failed timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deinit_during_bootstrap_stops_node() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let gate = Arc::new(Barrier::new(2));
        let h = gated_harness(InitOutcome::Succeed, false, Some(gate.clone()));

        let init = tokio::spawn({
            let node = h.node.clone();
            async move { node.init().await }
        });

        // core init is parked on the gate while the node gets told to stop
        let stopper = tokio::task::spawn_blocking({
            let node = h.node.clone();
            move || {
                gate.wait();
                assert_eq!(node.state(), NodeState::Initializing);
                node.deinit();
                assert_eq!(node.state(), NodeState::ShuttingDown);
                gate.wait();
            }
        });
        stopper.await.unwrap();

        assert_eq!(init.await.unwrap(), Err(NodeError::NotInitialized));
        assert_eq!(h.node.state(), NodeState::Stopped);
        assert!(!h.server.wired_at_run.load(Ordering::SeqCst));
        assert!(h.server.deinit_called.load(Ordering::SeqCst));
        assert!(h.core.deinit_called.load(Ordering::SeqCst));
        assert_eq!(h.node.peer_count(), 0);

        // nothing left running to wait for
        h.node.join().await;
        assert_eq!(h.node.state(), NodeState::Stopped);
    })
    .await
    .expect("test_deinit_during_bootstrap_stops_node timed out");
}

#[tokio::test]
async fn test_deinit_before_init_is_ignored() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let h = harness(InitOutcome::Succeed, false);
        h.node.deinit();
        assert_eq!(h.node.state(), NodeState::Uninitialized);

        h.node.init().await.expect("bootstrap should succeed");
        assert_eq!(h.node.state(), NodeState::Running);
        h.node.deinit();
        h.node.join().await;
        assert_eq!(h.node.state(), NodeState::Stopped);
    })
    .await
    .expect("test_deinit_before_init_is_ignored timed out");
}
