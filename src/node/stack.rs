//! Collaborators of an in-process node
//!
//! The in-process backend neither validates blocks nor speaks the wire
//! protocol itself. It owns three collaborators and wires them together
//! before any of them runs:
//!
//! ```text
//!   ConsensusCore ──> ProtocolHandler ──> P2pEndpoint (the NodeServer)
//! ```
//!
//! All three report through one broadcast notifier so that events from a
//! single node keep their order. Implementations hold their cross
//! references weakly; [`NodeStack`] and the node that consumes it own them.

use crate::checkpoints::Checkpoints;
use crate::config::{CoreConfig, NetConfig};
use crate::error::Result;
use crate::node::local::{LocalCore, LocalProtocolHandler, TcpNodeServer};
use crate::node::NodeEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub const NOTIFIER_CAPACITY: usize = 1024;

pub type PeerId = SocketAddr;

/// Header-level view of a block as exchanged between nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    pub timestamp: u64,
}

impl BlockSummary {
    /// Block on top of this one.
    pub fn next(&self, hash: impl Into<String>, timestamp: u64) -> BlockSummary {
        BlockSummary {
            height: self.height + 1,
            hash: hash.into(),
            prev_hash: self.hash.clone(),
            timestamp,
        }
    }
}

/// Messages on the peer-to-peer wire, one JSON object per line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Handshake {
        network_id: String,
        height: u64,
        top_hash: String,
    },
    NewBlock {
        block: BlockSummary,
    },
    GetBlocks {
        from_height: u64,
    },
    Blocks {
        blocks: Vec<BlockSummary>,
    },
    Ping,
}

pub trait ConsensusCore: Send + Sync {
    fn set_protocol(&self, protocol: Arc<dyn ProtocolHandler>);
    fn has_protocol(&self) -> bool;
    fn set_checkpoints(&self, checkpoints: Checkpoints);
    fn init(&self, config: &CoreConfig) -> Result<()>;
    fn deinit(&self);
    fn top_block(&self) -> BlockSummary;
    /// Offer a block. `Ok(true)` when it extended the chain.
    fn handle_block(&self, block: &BlockSummary, source: Option<&PeerId>) -> Result<bool>;
    fn blocks_from(&self, height: u64, max: usize) -> Vec<BlockSummary>;
}

pub trait ProtocolHandler: Send + Sync {
    fn set_p2p_endpoint(&self, endpoint: Arc<dyn P2pEndpoint>);
    fn has_p2p_endpoint(&self) -> bool;
    fn peer_count(&self) -> usize;
    /// Highest chain height any peer has claimed.
    fn observed_height(&self) -> u64;
    fn on_connection_opened(&self, peer: &PeerId);
    /// An error asks the server to drop the connection.
    fn on_message(&self, peer: &PeerId, message: WireMessage) -> Result<()>;
    fn on_connection_closed(&self, peer: &PeerId);
    fn relay_block(&self, block: &BlockSummary, source: Option<&PeerId>);
    /// Called periodically by the server's run loop.
    fn on_idle(&self);
}

pub trait P2pEndpoint: Send + Sync {
    fn send(&self, peer: &PeerId, message: WireMessage) -> bool;
    fn broadcast(&self, message: WireMessage, except: Option<&PeerId>) -> usize;
    fn drop_connection(&self, peer: &PeerId);
}

#[async_trait]
pub trait NodeServer: P2pEndpoint {
    fn init(&self, config: &NetConfig) -> Result<()>;
    /// Serve until `stop` is cancelled.
    async fn run(&self, stop: CancellationToken) -> Result<()>;
    fn deinit(&self);
    fn as_endpoint(self: Arc<Self>) -> Arc<dyn P2pEndpoint>;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// The collaborators one in-process node owns
pub struct NodeStack {
    pub core: Arc<dyn ConsensusCore>,
    pub protocol: Arc<dyn ProtocolHandler>,
    pub server: Arc<dyn NodeServer>,
    pub notifier: broadcast::Sender<NodeEvent>,
}

impl NodeStack {
    pub fn new(
        core: Arc<dyn ConsensusCore>,
        protocol: Arc<dyn ProtocolHandler>,
        server: Arc<dyn NodeServer>,
        notifier: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            core,
            protocol,
            server,
            notifier,
        }
    }

    pub fn notifier() -> broadcast::Sender<NodeEvent> {
        broadcast::channel(NOTIFIER_CAPACITY).0
    }

    /// Stack made of the bundled collaborators.
    pub fn local(network_id: &str) -> Self {
        let notifier = Self::notifier();
        let core = Arc::new(LocalCore::new(notifier.clone()));
        let protocol = Arc::new(LocalProtocolHandler::new(
            core.clone(),
            network_id,
            notifier.clone(),
        ));
        let server = Arc::new(TcpNodeServer::new(protocol.clone()));
        Self::new(core, protocol, server, notifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_message_json_shape() {
        let msg = WireMessage::GetBlocks { from_height: 7 };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"get_blocks","from_height":7}"#);

        let ping: WireMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, WireMessage::Ping);
    }
}
