//! Node backend proxying a running daemon over its HTTP/JSON interface

use crate::currency::Currency;
use crate::error::{NodeError, Result};
use crate::node::{ChainSnapshot, EventSender, Node, NodeEvent, NodeState};
use crate::wallet::{ChainSource, Wallet};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Reply of `GET /getinfo`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    #[serde(default)]
    pub status: String,
    pub height: u64,
    #[serde(default)]
    pub incoming_connections_count: u64,
    #[serde(default)]
    pub outgoing_connections_count: u64,
    #[serde(default)]
    pub last_known_block_index: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderInfo {
    pub height: u64,
    pub timestamp: u64,
    pub hash: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcReply<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct LastBlockHeaderResult {
    block_header: BlockHeaderInfo,
}

/// What the proxy needs from a daemon
#[async_trait]
pub trait DaemonClient: Send + Sync {
    fn endpoint(&self) -> String;
    async fn get_info(&self) -> Result<DaemonInfo>;
    async fn get_last_block_header(&self) -> Result<BlockHeaderInfo>;
}

pub struct HttpDaemonClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDaemonClient {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        if host.is_empty() {
            return Err(NodeError::ConfigError("daemon host is empty".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: format!("http://{}:{}", host, port),
        })
    }
}

#[async_trait]
impl DaemonClient for HttpDaemonClient {
    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    async fn get_info(&self) -> Result<DaemonInfo> {
        let response = self
            .http
            .get(format!("{}/getinfo", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<DaemonInfo>().await?)
    }

    async fn get_last_block_header(&self) -> Result<BlockHeaderInfo> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": "0",
            "method": "getlastblockheader",
            "params": {},
        });
        let reply: JsonRpcReply<LastBlockHeaderResult> = self
            .http
            .post(format!("{}/json_rpc", self.base_url))
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = reply.error {
            return Err(NodeError::ProtocolError(format!(
                "getlastblockheader failed ({}): {}",
                err.code, err.message
            )));
        }
        reply
            .result
            .map(|r| r.block_header)
            .ok_or_else(|| NodeError::ProtocolError("getlastblockheader: empty reply".to_string()))
    }
}

/// Values last synchronized from the daemon
#[derive(Debug, Clone, Default)]
struct ProxyState {
    known_height: u64,
    local_height: u64,
    local_timestamp: u64,
    top_hash: String,
    peer_count: usize,
}

impl ProxyState {
    fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            last_known_block_height: self.known_height,
            last_local_block_height: self.local_height,
            last_local_block_timestamp: self.local_timestamp,
            peer_count: self.peer_count,
        }
    }
}

struct ProxyView(Arc<RwLock<ProxyState>>);

impl ChainSource for ProxyView {
    fn snapshot(&self) -> ChainSnapshot {
        self.0.read().snapshot()
    }
}

async fn refresh_status(
    client: &dyn DaemonClient,
    proxy: &RwLock<ProxyState>,
    events: &EventSender,
) -> Result<()> {
    let info = client.get_info().await?;
    let header = client.get_last_block_header().await?;
    let connections = info
        .incoming_connections_count
        .saturating_add(info.outgoing_connections_count);
    let peers = usize::try_from(connections).unwrap_or(usize::MAX);
    let known = info.last_known_block_index.max(info.height.saturating_sub(1));

    let mut pending = Vec::new();
    {
        let mut state = proxy.write();
        if state.top_hash != header.hash {
            state.top_hash = header.hash;
            state.local_height = header.height;
            state.local_timestamp = header.timestamp;
            pending.push(NodeEvent::LocalBlockchainUpdated(header.height));
        }
        if state.peer_count != peers {
            state.peer_count = peers;
            pending.push(NodeEvent::PeerCountUpdated(peers));
        }
        if state.known_height != known {
            state.known_height = known;
            pending.push(NodeEvent::LastKnownBlockHeightUpdated(known));
        }
    }

    for event in pending {
        debug!("Daemon update: {:?}", event);
        // a closed channel means nobody is listening
        let _ = events.send(event);
    }
    Ok(())
}

pub struct RpcNode {
    currency: Currency,
    client: Arc<dyn DaemonClient>,
    proxy: Arc<RwLock<ProxyState>>,
    events: EventSender,
    poll_interval: Duration,
    state: Arc<RwLock<NodeState>>,
    stop: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl RpcNode {
    pub fn new(
        currency: Currency,
        client: Arc<dyn DaemonClient>,
        events: EventSender,
        poll_interval: Duration,
    ) -> Self {
        Self {
            currency,
            client,
            proxy: Arc::new(RwLock::new(ProxyState::default())),
            events,
            poll_interval,
            state: Arc::new(RwLock::new(NodeState::Uninitialized)),
            stop: CancellationToken::new(),
            poller: Mutex::new(None),
        }
    }

    /// Proxy for the daemon at `host:port` over HTTP.
    pub fn connect(
        currency: Currency,
        host: &str,
        port: u16,
        events: EventSender,
        poll_interval: Duration,
    ) -> Result<Self> {
        let client = HttpDaemonClient::new(host, port)?;
        Ok(Self::new(currency, Arc::new(client), events, poll_interval))
    }
}

#[async_trait]
impl Node for RpcNode {
    async fn init(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != NodeState::Uninitialized {
                return Err(NodeError::AlreadyInitialized);
            }
            *state = NodeState::Initializing;
        }
        info!("Connecting to daemon at {}", self.client.endpoint());

        if let Err(e) = refresh_status(self.client.as_ref(), &self.proxy, &self.events).await {
            error!("Daemon at {} unreachable: {}", self.client.endpoint(), e);
            let mut state = self.state.write();
            if *state == NodeState::Initializing {
                *state = NodeState::Failed(e.to_string());
            }
            drop(state);
            return Err(match e {
                NodeError::NetworkError(_) => e,
                other => NodeError::NetworkError(other.to_string()),
            });
        }

        // deinit may have landed while the first refresh was in flight
        let mut state = self.state.write();
        if *state != NodeState::Initializing || self.stop.is_cancelled() {
            info!("Init of daemon proxy interrupted, node is {}", *state);
            return Err(NodeError::NotInitialized);
        }

        let client = self.client.clone();
        let proxy = self.proxy.clone();
        let events = self.events.clone();
        let stop = self.stop.clone();
        let period = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = refresh_status(client.as_ref(), &proxy, &events).await {
                            warn!("Daemon poll failed: {}", e);
                        }
                    }
                }
            }
            debug!("Daemon poller stopped");
        });
        *self.poller.lock() = Some(handle);
        *state = NodeState::Running;
        drop(state);

        info!("Connected to daemon at {}", self.client.endpoint());
        Ok(())
    }

    fn deinit(&self) {
        let mut state = self.state.write();
        match *state {
            NodeState::Running | NodeState::Initializing => {
                *state = NodeState::Stopped;
                self.stop.cancel();
                info!("Disconnected from daemon at {}", self.client.endpoint());
            }
            _ => warn!("deinit ignored, daemon proxy is {}", *state),
        }
    }

    async fn join(&self) {
        let handle = self.poller.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Daemon poller task failed: {}", e);
            }
        }
    }

    fn state(&self) -> NodeState {
        self.state.read().clone()
    }

    fn last_known_block_height(&self) -> u64 {
        self.proxy.read().known_height
    }

    fn last_local_block_height(&self) -> u64 {
        self.proxy.read().local_height
    }

    fn last_local_block_timestamp(&self) -> u64 {
        self.proxy.read().local_timestamp
    }

    fn peer_count(&self) -> usize {
        self.proxy.read().peer_count
    }

    fn snapshot(&self) -> ChainSnapshot {
        self.proxy.read().snapshot()
    }

    fn create_wallet(&self) -> Wallet {
        Wallet::new(
            self.currency.clone(),
            Arc::new(ProxyView(self.proxy.clone())),
        )
    }
}

impl Drop for RpcNode {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
