//! Bundled collaborators for the in-process node
//!
//! Small but working stand-ins for a full daemon:
//!
//! - [`LocalCore`] tracks the header chain from genesis, checks it against
//!   the checkpoints and keeps it in `headers.json` under the data directory.
//! - [`LocalProtocolHandler`] keeps the peer table, learns the network height
//!   from handshakes and pulls missing headers from peers that are ahead.
//! - [`TcpNodeServer`] moves newline-delimited JSON [`WireMessage`]s over TCP,
//!   accepting inbound peers and keeping seed connections alive.

use crate::checkpoints::{CheckpointCheck, Checkpoints};
use crate::config::{CoreConfig, NetConfig};
use crate::error::{NodeError, Result};
use crate::extra::HASH_SIZE;
use crate::node::stack::{
    BlockSummary, ConsensusCore, NodeServer, P2pEndpoint, PeerId, ProtocolHandler, WireMessage,
};
use crate::node::NodeEvent;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const GENESIS_HASH: &str = "b5a807ec7263fba0afa89004056f2537b08d834e59438209055bf0a1e25439c3";
pub const GENESIS_TIMESTAMP: u64 = 1_514_764_800;
pub const HEADERS_FILE: &str = "headers.json";

pub const MAX_BLOCKS_PER_REPLY: usize = 200;
pub const IDLE_INTERVAL: Duration = Duration::from_secs(30);
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const MAX_PEER_FAILURES: u32 = 3;
const STALE_PEER_AFTER: Duration = Duration::from_secs(300);

pub fn genesis_block() -> BlockSummary {
    BlockSummary {
        height: 0,
        hash: GENESIS_HASH.to_string(),
        prev_hash: "0".repeat(HASH_SIZE * 2),
        timestamp: GENESIS_TIMESTAMP,
    }
}

// ============================================================================
// Core
// ============================================================================

pub struct LocalCore {
    protocol: RwLock<Option<Weak<dyn ProtocolHandler>>>,
    checkpoints: RwLock<Checkpoints>,
    headers: RwLock<Vec<BlockSummary>>,
    data_dir: RwLock<Option<PathBuf>>,
    enforce_checkpoints: AtomicBool,
    initialized: AtomicBool,
    notifier: broadcast::Sender<NodeEvent>,
}

impl LocalCore {
    pub fn new(notifier: broadcast::Sender<NodeEvent>) -> Self {
        Self {
            protocol: RwLock::new(None),
            checkpoints: RwLock::new(Checkpoints::new()),
            headers: RwLock::new(Vec::new()),
            data_dir: RwLock::new(None),
            enforce_checkpoints: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
            notifier,
        }
    }

    fn protocol(&self) -> Option<Arc<dyn ProtocolHandler>> {
        self.protocol.read().as_ref().and_then(Weak::upgrade)
    }

    fn load_headers(path: &Path) -> Result<Vec<BlockSummary>> {
        let text = fs::read_to_string(path)?;
        let headers: Vec<BlockSummary> = serde_json::from_str(&text)
            .map_err(|e| NodeError::IoError(format!("{}: {}", path.display(), e)))?;

        if headers.first() != Some(&genesis_block()) {
            return Err(NodeError::IoError(format!(
                "{} does not start at genesis",
                path.display()
            )));
        }
        for pair in headers.windows(2) {
            if pair[1].height != pair[0].height + 1 || pair[1].prev_hash != pair[0].hash {
                return Err(NodeError::IoError(format!(
                    "{} breaks at height {}",
                    path.display(),
                    pair[1].height
                )));
            }
        }
        Ok(headers)
    }

    fn save_headers(&self) -> Result<()> {
        let Some(dir) = self.data_dir.read().clone() else {
            return Ok(());
        };
        let json = serde_json::to_string(&*self.headers.read())
            .map_err(|e| NodeError::IoError(e.to_string()))?;
        fs::write(dir.join(HEADERS_FILE), json)?;
        Ok(())
    }
}

impl ConsensusCore for LocalCore {
    fn set_protocol(&self, protocol: Arc<dyn ProtocolHandler>) {
        *self.protocol.write() = Some(Arc::downgrade(&protocol));
    }

    fn has_protocol(&self) -> bool {
        self.protocol().is_some()
    }

    fn set_checkpoints(&self, checkpoints: Checkpoints) {
        *self.checkpoints.write() = checkpoints;
    }

    fn init(&self, config: &CoreConfig) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Err(NodeError::AlreadyInitialized);
        }

        fs::create_dir_all(&config.data_dir).map_err(|e| {
            NodeError::IoError(format!("cannot create {}: {}", config.data_dir.display(), e))
        })?;

        let path = config.data_dir.join(HEADERS_FILE);
        let headers = if path.exists() {
            Self::load_headers(&path)?
        } else {
            vec![genesis_block()]
        };
        let height = headers.len() as u64 - 1;

        *self.headers.write() = headers;
        *self.data_dir.write() = Some(config.data_dir.clone());
        self.enforce_checkpoints
            .store(config.enforce_checkpoints, Ordering::Release);
        self.initialized.store(true, Ordering::Release);

        info!(
            "Core initialized at height {} ({})",
            height,
            config.data_dir.display()
        );
        Ok(())
    }

    fn deinit(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.save_headers() {
            error!("Failed to store headers: {}", e);
        }
    }

    fn top_block(&self) -> BlockSummary {
        self.headers.read().last().cloned().unwrap_or_default()
    }

    fn handle_block(&self, block: &BlockSummary, source: Option<&PeerId>) -> Result<bool> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(NodeError::NotInitialized);
        }

        let mut hash = [0u8; HASH_SIZE];
        hex::decode_to_slice(&block.hash, &mut hash).map_err(|e| {
            NodeError::ProtocolError(format!("block at height {} has bad hash: {}", block.height, e))
        })?;

        {
            let mut headers = self.headers.write();
            let Some(tip) = headers.last().cloned() else {
                return Err(NodeError::NotInitialized);
            };

            if block.height <= tip.height {
                let known = headers
                    .get(block.height as usize)
                    .is_some_and(|h| h.hash == block.hash);
                if !known {
                    if self
                        .checkpoints
                        .read()
                        .is_alternative_block_allowed(tip.height, block.height)
                    {
                        debug!("Ignoring alternative block {} at height {}", block.hash, block.height);
                    } else {
                        warn!(
                            "Block {} at height {} is below a checkpoint, rejected",
                            block.hash, block.height
                        );
                    }
                }
                return Ok(false);
            }

            if block.height != tip.height + 1 || block.prev_hash != tip.hash {
                debug!(
                    "Block {} at height {} does not extend tip {} at {}",
                    block.hash, block.height, tip.hash, tip.height
                );
                return Ok(false);
            }

            let checkpoints = self.checkpoints.read();
            if self.enforce_checkpoints.load(Ordering::Acquire)
                && checkpoints.is_in_checkpoint_zone(block.height)
                && checkpoints.check_block(block.height, &hash) == CheckpointCheck::Failed
            {
                return Err(NodeError::CheckpointError(format!(
                    "block {} at height {} contradicts checkpoint",
                    block.hash, block.height
                )));
            }

            headers.push(block.clone());
        }

        info!("Block {} added at height {}", block.hash, block.height);
        let _ = self
            .notifier
            .send(NodeEvent::LocalBlockchainUpdated(block.height));
        if let Some(protocol) = self.protocol() {
            protocol.relay_block(block, source);
        }
        Ok(true)
    }

    fn blocks_from(&self, height: u64, max: usize) -> Vec<BlockSummary> {
        let headers = self.headers.read();
        let start = usize::try_from(height).unwrap_or(usize::MAX);
        headers.iter().skip(start).take(max).cloned().collect()
    }
}

// ============================================================================
// Protocol handler
// ============================================================================

/// What the protocol handler knows about one connected peer
#[derive(Debug, Clone)]
pub struct PeerSyncInfo {
    pub peer: PeerId,
    pub height: u64,
    pub top_hash: String,
    pub last_seen: Instant,
    pub blocks_received: u64,
    pub failures: u32,
    pub handshaked: bool,
}

impl PeerSyncInfo {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            height: 0,
            top_hash: String::new(),
            last_seen: Instant::now(),
            blocks_received: 0,
            failures: 0,
            handshaked: false,
        }
    }

    pub fn is_unreliable(&self) -> bool {
        self.failures >= MAX_PEER_FAILURES
    }

    /// Not heard from in five minutes
    pub fn is_stale(&self) -> bool {
        self.last_seen.elapsed() > STALE_PEER_AFTER
    }
}

pub struct LocalProtocolHandler {
    core: Arc<dyn ConsensusCore>,
    endpoint: RwLock<Option<Weak<dyn P2pEndpoint>>>,
    network_id: String,
    peers: RwLock<HashMap<PeerId, PeerSyncInfo>>,
    observed_height: AtomicU64,
    notifier: broadcast::Sender<NodeEvent>,
}

impl LocalProtocolHandler {
    pub fn new(
        core: Arc<dyn ConsensusCore>,
        network_id: &str,
        notifier: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            core,
            endpoint: RwLock::new(None),
            network_id: network_id.to_string(),
            peers: RwLock::new(HashMap::new()),
            observed_height: AtomicU64::new(0),
            notifier,
        }
    }

    fn endpoint(&self) -> Option<Arc<dyn P2pEndpoint>> {
        self.endpoint.read().as_ref().and_then(Weak::upgrade)
    }

    fn send(&self, peer: &PeerId, message: WireMessage) {
        if let Some(endpoint) = self.endpoint() {
            endpoint.send(peer, message);
        }
    }

    fn handshake(&self) -> WireMessage {
        let top = self.core.top_block();
        WireMessage::Handshake {
            network_id: self.network_id.clone(),
            height: top.height,
            top_hash: top.hash,
        }
    }

    fn note_height(&self, height: u64) {
        let previous = self.observed_height.fetch_max(height, Ordering::AcqRel);
        if height > previous {
            let _ = self
                .notifier
                .send(NodeEvent::LastKnownBlockHeightUpdated(height));
        }
    }

    fn note_peer_height(&self, peer: &PeerId, height: u64) {
        if let Some(info) = self.peers.write().get_mut(peer) {
            info.height = info.height.max(height);
        }
        self.note_height(height);
    }

    fn request_missing(&self, peer: &PeerId, peer_height: u64) {
        let local = self.core.top_block().height;
        if peer_height > local {
            debug!("Requesting blocks from {} starting at {}", peer, local + 1);
            self.send(peer, WireMessage::GetBlocks { from_height: local + 1 });
        }
    }

    fn on_handshake(&self, peer: &PeerId, network_id: &str, height: u64, top_hash: String) -> Result<()> {
        if network_id != self.network_id {
            return Err(NodeError::ProtocolError(format!(
                "{} is on network {}, expected {}",
                peer, network_id, self.network_id
            )));
        }

        let (first, count) = {
            let mut peers = self.peers.write();
            let info = peers
                .get_mut(peer)
                .ok_or_else(|| NodeError::ProtocolError(format!("unknown peer {}", peer)))?;
            let first = !info.handshaked;
            info.handshaked = true;
            info.height = height;
            info.top_hash = top_hash;
            (first, peers.values().filter(|p| p.handshaked).count())
        };

        if first {
            info!("Peer {} connected at height {}", peer, height);
            let _ = self.notifier.send(NodeEvent::PeerCountUpdated(count));
        }
        self.note_height(height);
        self.request_missing(peer, height);
        Ok(())
    }

    /// Feed blocks to the core, returning how many extended the chain.
    fn accept_blocks(&self, peer: &PeerId, blocks: &[BlockSummary]) -> Result<u64> {
        let mut accepted = 0u64;
        let mut failure = None;
        for block in blocks {
            match self.core.handle_block(block, Some(peer)) {
                Ok(true) => accepted += 1,
                Ok(false) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let unreliable = match self.peers.write().get_mut(peer) {
            Some(info) => {
                info.blocks_received += accepted;
                if failure.is_some() {
                    info.failures += 1;
                }
                info.is_unreliable()
            }
            None => false,
        };

        if let Some(e) = failure {
            warn!("Rejected block from {}: {}", peer, e);
            if unreliable {
                return Err(NodeError::ProtocolError(format!(
                    "{} sent too many bad blocks",
                    peer
                )));
            }
        }
        Ok(accepted)
    }

    fn peer_height(&self, peer: &PeerId) -> u64 {
        self.peers.read().get(peer).map_or(0, |p| p.height)
    }
}

impl ProtocolHandler for LocalProtocolHandler {
    fn set_p2p_endpoint(&self, endpoint: Arc<dyn P2pEndpoint>) {
        *self.endpoint.write() = Some(Arc::downgrade(&endpoint));
    }

    fn has_p2p_endpoint(&self) -> bool {
        self.endpoint().is_some()
    }

    fn peer_count(&self) -> usize {
        self.peers.read().values().filter(|p| p.handshaked).count()
    }

    fn observed_height(&self) -> u64 {
        self.observed_height.load(Ordering::Acquire)
    }

    fn on_connection_opened(&self, peer: &PeerId) {
        self.peers.write().insert(*peer, PeerSyncInfo::new(*peer));
        self.send(peer, self.handshake());
    }

    fn on_message(&self, peer: &PeerId, message: WireMessage) -> Result<()> {
        let handshaked = {
            let mut peers = self.peers.write();
            let info = peers
                .get_mut(peer)
                .ok_or_else(|| NodeError::ProtocolError(format!("unknown peer {}", peer)))?;
            info.last_seen = Instant::now();
            info.handshaked
        };

        match message {
            WireMessage::Handshake {
                network_id,
                height,
                top_hash,
            } => self.on_handshake(peer, &network_id, height, top_hash),
            _ if !handshaked => Err(NodeError::ProtocolError(format!(
                "{} skipped the handshake",
                peer
            ))),
            WireMessage::NewBlock { block } => {
                self.note_peer_height(peer, block.height);
                let local = self.core.top_block().height;
                let accepted = self.accept_blocks(peer, std::slice::from_ref(&block))?;
                if accepted == 0 && block.height > local + 1 {
                    self.request_missing(peer, block.height);
                }
                Ok(())
            }
            WireMessage::GetBlocks { from_height } => {
                let blocks = self.core.blocks_from(from_height, MAX_BLOCKS_PER_REPLY);
                self.send(peer, WireMessage::Blocks { blocks });
                Ok(())
            }
            WireMessage::Blocks { blocks } => {
                if let Some(last) = blocks.last() {
                    self.note_peer_height(peer, last.height);
                }
                if self.accept_blocks(peer, &blocks)? > 0 {
                    self.request_missing(peer, self.peer_height(peer));
                }
                Ok(())
            }
            WireMessage::Ping => Ok(()),
        }
    }

    fn on_connection_closed(&self, peer: &PeerId) {
        let (was_handshaked, count) = {
            let mut peers = self.peers.write();
            let was = peers.remove(peer).is_some_and(|p| p.handshaked);
            (was, peers.values().filter(|p| p.handshaked).count())
        };
        if was_handshaked {
            info!("Peer {} disconnected", peer);
            let _ = self.notifier.send(NodeEvent::PeerCountUpdated(count));
        }
    }

    fn relay_block(&self, block: &BlockSummary, source: Option<&PeerId>) {
        if let Some(endpoint) = self.endpoint() {
            let relayed = endpoint.broadcast(
                WireMessage::NewBlock {
                    block: block.clone(),
                },
                source,
            );
            debug!("Relayed block {} to {} peers", block.height, relayed);
        }
    }

    fn on_idle(&self) {
        let Some(endpoint) = self.endpoint() else {
            return;
        };
        let dead: Vec<PeerId> = self
            .peers
            .read()
            .values()
            .filter(|p| p.is_stale() || p.is_unreliable())
            .map(|p| p.peer)
            .collect();
        for peer in &dead {
            info!("Dropping stale peer {}", peer);
            endpoint.drop_connection(peer);
        }
        endpoint.broadcast(WireMessage::Ping, None);
    }
}

// ============================================================================
// P2P server
// ============================================================================

struct ServerInner {
    protocol: Arc<dyn ProtocolHandler>,
    connections: RwLock<HashMap<PeerId, mpsc::UnboundedSender<WireMessage>>>,
    settings: RwLock<NetConfig>,
}

impl ServerInner {
    async fn serve(self: Arc<Self>, stream: TcpStream, peer: PeerId, stop: CancellationToken) {
        let (tx, mut outgoing) = mpsc::unbounded_channel();
        {
            let max_peers = self.settings.read().max_peers;
            let mut connections = self.connections.write();
            if connections.len() >= max_peers {
                debug!("Refusing {}: {} peers already", peer, max_peers);
                return;
            }
            if connections.contains_key(&peer) {
                return;
            }
            connections.insert(peer, tx);
        }

        self.protocol.on_connection_opened(&peer);

        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                message = outgoing.recv() => {
                    let Some(message) = message else { break };
                    let mut line = match serde_json::to_string(&message) {
                        Ok(line) => line,
                        Err(e) => {
                            error!("Cannot encode message for {}: {}", peer, e);
                            break;
                        }
                    };
                    line.push('\n');
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        debug!("Write to {} failed: {}", peer, e);
                        break;
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let message = match serde_json::from_str::<WireMessage>(&line) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!("Malformed message from {}: {}", peer, e);
                                break;
                            }
                        };
                        if let Err(e) = self.protocol.on_message(&peer, message) {
                            warn!("Dropping {}: {}", peer, e);
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Read from {} failed: {}", peer, e);
                        break;
                    }
                },
            }
        }

        self.connections.write().remove(&peer);
        self.protocol.on_connection_closed(&peer);
    }

    async fn maintain_seed(self: Arc<Self>, addr: SocketAddr, timeout: Duration, stop: CancellationToken) {
        while !stop.is_cancelled() {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!("Connected to seed {}", addr);
                    self.clone().serve(stream, addr, stop.clone()).await;
                }
                Ok(Err(e)) => debug!("Seed {} unreachable: {}", addr, e),
                Err(_) => debug!("Connecting to seed {} timed out", addr),
            }
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }
}

pub struct TcpNodeServer {
    inner: Arc<ServerInner>,
    listener: Mutex<Option<std::net::TcpListener>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl TcpNodeServer {
    pub fn new(protocol: Arc<dyn ProtocolHandler>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                protocol,
                connections: RwLock::new(HashMap::new()),
                settings: RwLock::new(NetConfig::default()),
            }),
            listener: Mutex::new(None),
            local_addr: RwLock::new(None),
        }
    }
}

impl P2pEndpoint for TcpNodeServer {
    fn send(&self, peer: &PeerId, message: WireMessage) -> bool {
        self.inner
            .connections
            .read()
            .get(peer)
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    fn broadcast(&self, message: WireMessage, except: Option<&PeerId>) -> usize {
        self.inner
            .connections
            .read()
            .iter()
            .filter(|(peer, _)| Some(*peer) != except)
            .filter(|(_, tx)| tx.send(message.clone()).is_ok())
            .count()
    }

    fn drop_connection(&self, peer: &PeerId) {
        self.inner.connections.write().remove(peer);
    }
}

#[async_trait]
impl NodeServer for TcpNodeServer {
    fn init(&self, config: &NetConfig) -> Result<()> {
        let addr = config.listen_addr()?;
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| NodeError::NetworkError(format!("cannot bind {}: {}", addr, e)))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;

        *self.inner.settings.write() = config.clone();
        *self.local_addr.write() = Some(local);
        *self.listener.lock() = Some(listener);
        info!("P2P server bound to {}", local);
        Ok(())
    }

    async fn run(&self, stop: CancellationToken) -> Result<()> {
        let listener = self.listener.lock().take().ok_or(NodeError::NotInitialized)?;
        let listener = TcpListener::from_std(listener)?;
        let own_addr = listener.local_addr().ok();
        let settings = self.inner.settings.read().clone();

        let mut tasks = JoinSet::new();
        for seed in &settings.seeds {
            match seed.parse::<SocketAddr>() {
                Ok(addr) if Some(addr) == own_addr => debug!("Skipping seed {}, it is us", addr),
                Ok(addr) => {
                    tasks.spawn(self.inner.clone().maintain_seed(
                        addr,
                        settings.connect_timeout(),
                        stop.clone(),
                    ));
                }
                Err(e) => warn!("Ignoring seed {}: {}", seed, e),
            }
        }

        let mut idle = tokio::time::interval(IDLE_INTERVAL);
        idle.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tasks.spawn(self.inner.clone().serve(stream, peer, stop.clone()));
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                _ = idle.tick() => self.inner.protocol.on_idle(),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        info!("P2P server stopping, {} connection tasks left", tasks.len());
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    fn deinit(&self) {
        self.listener.lock().take();
        self.inner.connections.write().clear();
        info!("P2P server deinitialized");
    }

    fn as_endpoint(self: Arc<Self>) -> Arc<dyn P2pEndpoint> {
        self
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }
}
