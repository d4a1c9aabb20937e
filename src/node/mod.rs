//! Node abstraction
//!
//! A [`Node`] hands wallet code chain state and wallet handles without
//! revealing where the chain lives: in a daemon reached over the network
//! ([`RpcNode`]) or in a node stack booted inside this process
//! ([`InProcessNode`]).
//!
//! Notifications (peer count, local height, network height) are not
//! callbacks run on the backend's tasks. The backend pushes [`NodeEvent`]s
//! into a channel the caller created; the caller drains it whenever it
//! likes, through [`dispatch_events`] or [`drain_events`] if it prefers the
//! [`NodeCallback`] shape. Events from one node arrive in the order they
//! happened. Getters may lag behind the most recent event.

pub mod facade;
pub mod inprocess;
pub mod local;
pub mod rpc;
pub mod stack;

pub use facade::ChainFacade;
pub use inprocess::InProcessNode;
pub use rpc::{DaemonClient, HttpDaemonClient, RpcNode};
pub use stack::NodeStack;

use crate::config::{Config, CoreConfig, NetConfig, NodeMode};
use crate::currency::Currency;
use crate::error::Result;
use crate::payment_id;
use crate::wallet::Wallet;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
    Failed(String),
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeState::Uninitialized => write!(f, "uninitialized"),
            NodeState::Initializing => write!(f, "initializing"),
            NodeState::Running => write!(f, "running"),
            NodeState::ShuttingDown => write!(f, "shutting down"),
            NodeState::Stopped => write!(f, "stopped"),
            NodeState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Chain state as last observed by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainSnapshot {
    pub last_known_block_height: u64,
    pub last_local_block_height: u64,
    pub last_local_block_timestamp: u64,
    pub peer_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    PeerCountUpdated(usize),
    LocalBlockchainUpdated(u64),
    LastKnownBlockHeightUpdated(u64),
}

impl NodeEvent {
    pub fn dispatch<C: NodeCallback + ?Sized>(self, sink: &mut C) {
        match self {
            NodeEvent::PeerCountUpdated(count) => sink.peer_count_updated(count),
            NodeEvent::LocalBlockchainUpdated(height) => sink.local_blockchain_updated(height),
            NodeEvent::LastKnownBlockHeightUpdated(height) => {
                sink.last_known_block_height_updated(height)
            }
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<NodeEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<NodeEvent>;

/// Channel a node reports to. Dropping the receiver detaches the observer.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Sink for node notifications, run in the caller's context.
pub trait NodeCallback {
    fn peer_count_updated(&mut self, count: usize);
    fn local_blockchain_updated(&mut self, height: u64);
    fn last_known_block_height_updated(&mut self, height: u64);
}

/// Deliver events to `sink` until every sender is gone.
pub async fn dispatch_events<C: NodeCallback + ?Sized>(events: &mut EventReceiver, sink: &mut C) {
    while let Some(event) = events.recv().await {
        event.dispatch(sink);
    }
}

/// Deliver whatever is queued right now and return how many events that was.
pub fn drain_events<C: NodeCallback + ?Sized>(events: &mut EventReceiver, sink: &mut C) -> usize {
    let mut delivered = 0;
    while let Ok(event) = events.try_recv() {
        event.dispatch(sink);
        delivered += 1;
    }
    delivered
}

/// What every backend offers to wallet code.
#[async_trait]
pub trait Node: Send + Sync {
    /// Bring the backend up. The returned future completes once the node is
    /// usable; it does not wait for the node to stop.
    async fn init(&self) -> Result<()>;

    /// Ask the backend to stop. Returns immediately.
    fn deinit(&self);

    /// Wait until the backend's background work has finished.
    async fn join(&self);

    fn state(&self) -> NodeState;

    fn convert_payment_id(&self, payment_id: &str) -> Result<Vec<u8>> {
        payment_id::to_extra_bytes(payment_id)
    }

    fn extract_payment_id(&self, extra: &[u8]) -> Result<String> {
        payment_id::from_extra_bytes(extra)
    }

    fn last_known_block_height(&self) -> u64;
    fn last_local_block_height(&self) -> u64;
    fn last_local_block_timestamp(&self) -> u64;
    fn peer_count(&self) -> usize;

    fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            last_known_block_height: self.last_known_block_height(),
            last_local_block_height: self.last_local_block_height(),
            last_local_block_timestamp: self.last_local_block_timestamp(),
            peer_count: self.peer_count(),
        }
    }

    fn create_wallet(&self) -> Wallet;
}

pub fn create_rpc_node(
    currency: Currency,
    events: EventSender,
    host: &str,
    port: u16,
) -> Result<Box<dyn Node>> {
    let node = RpcNode::connect(currency, host, port, events, DEFAULT_POLL_INTERVAL)?;
    Ok(Box::new(node))
}

pub fn create_inprocess_node(
    currency: Currency,
    core_config: CoreConfig,
    net_config: NetConfig,
    events: EventSender,
) -> Box<dyn Node> {
    Box::new(InProcessNode::with_local_stack(
        currency,
        core_config,
        net_config,
        events,
    ))
}

/// Build the backend selected by `config.node.mode`.
pub fn create_node(config: &Config, events: EventSender) -> Result<Box<dyn Node>> {
    match config.node.mode {
        NodeMode::Remote => {
            let node = RpcNode::connect(
                config.currency.clone(),
                &config.remote.host,
                config.remote.port,
                events,
                config.remote.poll_interval(),
            )?;
            Ok(Box::new(node))
        }
        NodeMode::Local => Ok(create_inprocess_node(
            config.currency.clone(),
            config.core.clone(),
            config.network.clone(),
            events,
        )),
    }
}
