//! Read-side view over a running node stack
//!
//! The facade answers chain-state queries straight from the collaborators
//! and forwards the stack's notifier into observer channels.

use crate::error::{NodeError, Result};
use crate::node::stack::{ConsensusCore, ProtocolHandler};
use crate::node::{ChainSnapshot, EventSender, NodeEvent};
use crate::wallet::ChainSource;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct ChainFacade {
    core: Arc<dyn ConsensusCore>,
    protocol: Arc<dyn ProtocolHandler>,
    notifier: broadcast::Sender<NodeEvent>,
    ready: AtomicBool,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl ChainFacade {
    pub fn new(
        core: Arc<dyn ConsensusCore>,
        protocol: Arc<dyn ProtocolHandler>,
        notifier: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            core,
            protocol,
            notifier,
            ready: AtomicBool::new(false),
            forwarders: Mutex::new(Vec::new()),
        }
    }

    pub fn init(&self) -> Result<()> {
        if self.ready.swap(true, Ordering::AcqRel) {
            return Err(NodeError::AlreadyInitialized);
        }
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Forward every notifier event into `observer` until either side closes.
    /// Must be called from within a tokio runtime.
    pub fn add_observer(&self, observer: EventSender) {
        let mut events = self.notifier.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if observer.send(event).is_err() {
                            debug!("Observer went away, detaching");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Observer lagged behind, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.forwarders.lock().push(handle);
    }

    /// Stop answering and detach all observers.
    pub fn shutdown(&self) {
        self.ready.store(false, Ordering::Release);
        for handle in self.forwarders.lock().drain(..) {
            handle.abort();
        }
    }
}

impl ChainSource for ChainFacade {
    fn snapshot(&self) -> ChainSnapshot {
        if !self.is_ready() {
            return ChainSnapshot::default();
        }
        let top = self.core.top_block();
        ChainSnapshot {
            last_known_block_height: self.protocol.observed_height().max(top.height),
            last_local_block_height: top.height,
            last_local_block_timestamp: top.timestamp,
            peer_count: self.protocol.peer_count(),
        }
    }
}
