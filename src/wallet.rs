//! Wallet handles minted by a node
//!
//! A [`Wallet`] does not own keys or history here. It is bound to the chain
//! connection of the node that created it and knows the currency it counts in.

use crate::currency::Currency;
use crate::error::Result;
use crate::node::ChainSnapshot;
use crate::payment_id;
use std::fmt;
use std::sync::Arc;

/// Anything that can report the chain state a wallet syncs against
pub trait ChainSource: Send + Sync {
    fn snapshot(&self) -> ChainSnapshot;
}

#[derive(Clone)]
pub struct Wallet {
    currency: Currency,
    chain: Arc<dyn ChainSource>,
}

impl Wallet {
    pub fn new(currency: Currency, chain: Arc<dyn ChainSource>) -> Self {
        Self { currency, chain }
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn chain_snapshot(&self) -> ChainSnapshot {
        self.chain.snapshot()
    }

    pub fn is_synchronized(&self) -> bool {
        let snapshot = self.chain.snapshot();
        snapshot.last_known_block_height > 0
            && snapshot.last_local_block_height >= snapshot.last_known_block_height
    }

    /// Fraction of the known chain the node already has, in `0.0..=1.0`.
    pub fn sync_progress(&self) -> f64 {
        let snapshot = self.chain.snapshot();
        if snapshot.last_known_block_height == 0 {
            return 0.0;
        }
        let ratio =
            snapshot.last_local_block_height as f64 / snapshot.last_known_block_height as f64;
        ratio.min(1.0)
    }

    /// Extra bytes a transfer tagged with `payment_id` should carry.
    pub fn transfer_extra(&self, payment_id: &str) -> Result<Vec<u8>> {
        payment_id::to_extra_bytes(payment_id)
    }

    pub fn payment_id_of(&self, extra: &[u8]) -> Result<String> {
        payment_id::from_extra_bytes(extra)
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("currency", &self.currency.ticker)
            .field("chain", &self.chain.snapshot())
            .finish()
    }
}
