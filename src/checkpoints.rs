//! Checkpoints: known-good block hashes at fixed heights
//!
//! The list is compiled into the binary. The core refuses blocks that
//! contradict it and refuses reorganizations reaching below the highest
//! checkpoint it has already passed.

use crate::error::{NodeError, Result};
use crate::extra::{Hash, HASH_SIZE};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub struct CheckpointData {
    pub height: u64,
    pub block_id: &'static str,
}

pub const CHECKPOINTS: &[CheckpointData] = &[
    CheckpointData { height: 10_000, block_id: "e7f72ae2e3095289cd74b371dab15a7c7d3fb268cfac22ddb593ebdee06383b8" },
    CheckpointData { height: 25_000, block_id: "9cd404d3f0197354f99e78f7d8a66ade9f198a037efbe37add39a8a2ff266e1e" },
    CheckpointData { height: 50_000, block_id: "dc3cec141df7b282b539e74e054eb27cedcfb68f8e4ff89b6304e9baae1263aa" },
    CheckpointData { height: 100_000, block_id: "37ab99cb41f2007e9807603211547288f81810d12cf8d38b33f16e5fe7cc3a1c" },
    CheckpointData { height: 150_000, block_id: "79cdd3a89f84929248751ceaef5c3abe54a0923b1a4896c0a9c2956e39a99414" },
    CheckpointData { height: 200_000, block_id: "37b95ecb615d02d8d3045712f8784a90b68d293f83360ec25732053bd8fda3ca" },
    CheckpointData { height: 250_000, block_id: "b9856b024dd071238122eb6ebf1ca153bba3c9135b8f25555de3be27d43a3437" },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointCheck {
    /// No checkpoint at this height
    NotCheckpoint,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct Checkpoints {
    points: BTreeMap<u64, Hash>,
}

impl Checkpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifier loaded with the compiled-in list.
    pub fn builtin() -> Result<Self> {
        let mut checkpoints = Self::new();
        for checkpoint in CHECKPOINTS {
            checkpoints.add_checkpoint(checkpoint.height, checkpoint.block_id)?;
        }
        Ok(checkpoints)
    }

    pub fn add_checkpoint(&mut self, height: u64, block_id: &str) -> Result<()> {
        let mut hash = [0u8; HASH_SIZE];
        hex::decode_to_slice(block_id, &mut hash).map_err(|e| {
            NodeError::CheckpointError(format!("bad hash at height {}: {}", height, e))
        })?;

        match self.points.get(&height) {
            Some(existing) if *existing != hash => Err(NodeError::CheckpointError(format!(
                "conflicting checkpoint at height {}",
                height
            ))),
            _ => {
                self.points.insert(height, hash);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn top_height(&self) -> Option<u64> {
        self.points.keys().next_back().copied()
    }

    pub fn is_in_checkpoint_zone(&self, height: u64) -> bool {
        self.top_height().is_some_and(|top| height <= top)
    }

    pub fn check_block(&self, height: u64, hash: &Hash) -> CheckpointCheck {
        match self.points.get(&height) {
            None => CheckpointCheck::NotCheckpoint,
            Some(expected) if expected == hash => {
                info!("CHECKPOINT PASSED FOR HEIGHT {} {}", height, hex::encode(hash));
                CheckpointCheck::Passed
            }
            Some(expected) => {
                warn!(
                    "CHECKPOINT FAILED FOR HEIGHT {}. EXPECTED HASH {}, FETCHED HASH {}",
                    height,
                    hex::encode(expected),
                    hex::encode(hash)
                );
                CheckpointCheck::Failed
            }
        }
    }

    /// Whether an alternative block at `block_height` may replace the chain
    /// when the local chain is `blockchain_height` high.
    pub fn is_alternative_block_allowed(&self, blockchain_height: u64, block_height: u64) -> bool {
        if block_height == 0 {
            return false;
        }
        match self.points.range(..=blockchain_height).next_back() {
            None => true,
            Some((checkpoint_height, _)) => *checkpoint_height < block_height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_list_loads() {
        let checkpoints = Checkpoints::builtin().unwrap();
        assert_eq!(checkpoints.len(), CHECKPOINTS.len());
        assert_eq!(checkpoints.top_height(), Some(250_000));
        assert!(checkpoints.is_in_checkpoint_zone(250_000));
        assert!(!checkpoints.is_in_checkpoint_zone(250_001));
    }

    #[test]
    fn test_check_block() {
        let mut checkpoints = Checkpoints::new();
        checkpoints.add_checkpoint(5, &"11".repeat(32)).unwrap();

        assert_eq!(checkpoints.check_block(4, &[0x11; 32]), CheckpointCheck::NotCheckpoint);
        assert_eq!(checkpoints.check_block(5, &[0x11; 32]), CheckpointCheck::Passed);
        assert_eq!(checkpoints.check_block(5, &[0x12; 32]), CheckpointCheck::Failed);
    }

    #[test]
    fn test_conflicting_and_malformed_checkpoints() {
        let mut checkpoints = Checkpoints::new();
        checkpoints.add_checkpoint(5, &"11".repeat(32)).unwrap();
        // same hash again is fine
        checkpoints.add_checkpoint(5, &"11".repeat(32)).unwrap();
        assert!(checkpoints.add_checkpoint(5, &"22".repeat(32)).is_err());
        assert!(checkpoints.add_checkpoint(6, "not-hex").is_err());
        assert!(checkpoints.add_checkpoint(7, "abcd").is_err());
    }

    #[test]
    fn test_alternative_blocks_below_checkpoint_refused() {
        let mut checkpoints = Checkpoints::new();
        checkpoints.add_checkpoint(100, &"11".repeat(32)).unwrap();

        assert!(!checkpoints.is_alternative_block_allowed(150, 0));
        assert!(checkpoints.is_alternative_block_allowed(50, 10));
        assert!(!checkpoints.is_alternative_block_allowed(150, 90));
        assert!(!checkpoints.is_alternative_block_allowed(150, 100));
        assert!(checkpoints.is_alternative_block_allowed(150, 101));
    }
}
