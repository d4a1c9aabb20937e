//! Node backend that boots a full node stack inside this process
//!
//! Bootstrap order:
//!
//! 1. wire core -> protocol handler -> P2P endpoint (at construction)
//! 2. load the compiled-in checkpoints into the core
//! 3. core init, then P2P server init; any failure or panic here fails the
//!    node with `NotInitialized` and leaves later steps untouched
//! 4. facade init and observer registration
//! 5. the P2P run loop is spawned and `init` returns
//!
//! A `deinit` that lands during bootstrap is honoured once bootstrap is done:
//! everything is torn down, `init` reports `NotInitialized` and the node
//! ends `Stopped`.
//!
//! When the run loop exits the server and facade are torn down and the
//! state settles at `Stopped`, or `Failed` if the loop returned an error.

use crate::checkpoints::Checkpoints;
use crate::config::{CoreConfig, NetConfig};
use crate::currency::Currency;
use crate::error::{NodeError, Result};
use crate::node::facade::ChainFacade;
use crate::node::stack::{ConsensusCore, NodeServer, NodeStack};
use crate::node::{ChainSnapshot, EventSender, Node, NodeState};
use crate::wallet::{ChainSource, Wallet};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct InProcessNode {
    currency: Currency,
    core_config: CoreConfig,
    net_config: NetConfig,
    core: Arc<dyn ConsensusCore>,
    server: Arc<dyn NodeServer>,
    facade: Arc<ChainFacade>,
    events: EventSender,
    state: Arc<RwLock<NodeState>>,
    stop: CancellationToken,
    run_loop: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessNode {
    pub fn new(
        currency: Currency,
        core_config: CoreConfig,
        net_config: NetConfig,
        stack: NodeStack,
        events: EventSender,
    ) -> Self {
        let NodeStack {
            core,
            protocol,
            server,
            notifier,
        } = stack;

        core.set_protocol(protocol.clone());
        protocol.set_p2p_endpoint(server.clone().as_endpoint());
        let facade = Arc::new(ChainFacade::new(core.clone(), protocol, notifier));

        Self {
            currency,
            core_config,
            net_config,
            core,
            server,
            facade,
            events,
            state: Arc::new(RwLock::new(NodeState::Uninitialized)),
            stop: CancellationToken::new(),
            run_loop: Mutex::new(None),
        }
    }

    /// Node running the bundled core, protocol handler and TCP server.
    pub fn with_local_stack(
        currency: Currency,
        core_config: CoreConfig,
        net_config: NetConfig,
        events: EventSender,
    ) -> Self {
        let stack = NodeStack::local(&net_config.network_id);
        Self::new(currency, core_config, net_config, stack, events)
    }

    /// Address the P2P server is listening on, once initialized.
    pub fn p2p_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    fn bootstrap(&self) -> Result<()> {
        self.core.set_checkpoints(Checkpoints::builtin()?);
        guarded("core init", || self.core.init(&self.core_config))?;
        guarded("p2p server init", || self.server.init(&self.net_config))?;
        Ok(())
    }

    fn fail(&self, reason: String) -> NodeError {
        error!("In-process node failed to start: {}", reason);
        *self.state.write() = NodeState::Failed(reason);
        NodeError::NotInitialized
    }
}

/// Run a bootstrap step, turning a panic into an error.
fn guarded<F>(step: &str, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(NodeError::IoError(format!("{} panicked: {}", step, message)))
        }
    }
}

#[async_trait]
impl Node for InProcessNode {
    async fn init(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != NodeState::Uninitialized {
                return Err(NodeError::AlreadyInitialized);
            }
            *state = NodeState::Initializing;
        }
        info!("Initializing in-process node");

        if let Err(e) = self.bootstrap() {
            self.core.deinit();
            return Err(self.fail(e.to_string()));
        }
        if let Err(e) = self.facade.init() {
            self.server.deinit();
            self.core.deinit();
            return Err(self.fail(e.to_string()));
        }
        self.facade.add_observer(self.events.clone());

        // a deinit that arrived during bootstrap is honoured here
        let mut state_guard = self.state.write();
        if *state_guard != NodeState::Initializing || self.stop.is_cancelled() {
            *state_guard = NodeState::Stopped;
            drop(state_guard);
            info!("In-process node stopped before it started running");
            self.server.deinit();
            self.facade.shutdown();
            self.core.deinit();
            return Err(NodeError::NotInitialized);
        }
        *state_guard = NodeState::Running;

        let server = self.server.clone();
        let core = self.core.clone();
        let facade = self.facade.clone();
        let state = self.state.clone();
        let stop = self.stop.clone();
        let handle = tokio::spawn(async move {
            let outcome = server.run(stop).await;
            server.deinit();
            facade.shutdown();
            core.deinit();

            let next = match outcome {
                Ok(()) => {
                    info!("In-process node stopped");
                    NodeState::Stopped
                }
                Err(e) => {
                    error!("In-process node run loop failed: {}", e);
                    NodeState::Failed(e.to_string())
                }
            };
            *state.write() = next;
        });
        *self.run_loop.lock() = Some(handle);
        drop(state_guard);

        info!("In-process node running");
        Ok(())
    }

    fn deinit(&self) {
        {
            let mut state = self.state.write();
            if !matches!(*state, NodeState::Running | NodeState::Initializing) {
                warn!("deinit ignored, node is {}", *state);
                return;
            }
            *state = NodeState::ShuttingDown;
        }
        info!("Shutting down in-process node");
        self.stop.cancel();
    }

    async fn join(&self) {
        let handle = self.run_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("In-process run loop task failed: {}", e);
            }
        }
    }

    fn state(&self) -> NodeState {
        self.state.read().clone()
    }

    fn last_known_block_height(&self) -> u64 {
        self.facade.snapshot().last_known_block_height
    }

    fn last_local_block_height(&self) -> u64 {
        self.facade.snapshot().last_local_block_height
    }

    fn last_local_block_timestamp(&self) -> u64 {
        self.facade.snapshot().last_local_block_timestamp
    }

    fn peer_count(&self) -> usize {
        self.facade.snapshot().peer_count
    }

    fn snapshot(&self) -> ChainSnapshot {
        self.facade.snapshot()
    }

    fn create_wallet(&self) -> Wallet {
        Wallet::new(self.currency.clone(), self.facade.clone())
    }
}

impl Drop for InProcessNode {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_folds_panics() {
        let err = guarded("step", || panic!("kaboom")).unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        assert!(guarded("step", || Ok(())).is_ok());
        assert_eq!(
            guarded("step", || Err(NodeError::NotInitialized)),
            Err(NodeError::NotInitialized)
        );
    }
}
