//! Chain parameters

use serde::{Deserialize, Serialize};

use crate::constants::{
    BLOCK_SUBSIDY, CONFIRMATION_DEPTH, DEFAULT_DIFFICULTY, MAX_FUTURE_BLOCK_TIME, MIN_FEE,
    TX_PER_BLOCK,
};

/// Consensus and policy parameters shared by validators, reorg and miner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    /// Blocks a block must be buried under before it is committed
    pub confirmation_depth: u64,
    /// Difficulty every non-genesis block must carry
    pub difficulty: u8,
    /// Transactions per block including the coinbase
    pub tx_per_block: usize,
    pub block_subsidy: u64,
    pub min_fee: u64,
    /// Seconds a block timestamp may run ahead of the local clock
    pub max_future_block_time: i64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            confirmation_depth: CONFIRMATION_DEPTH,
            difficulty: DEFAULT_DIFFICULTY,
            tx_per_block: TX_PER_BLOCK,
            block_subsidy: BLOCK_SUBSIDY,
            min_fee: MIN_FEE,
            max_future_block_time: MAX_FUTURE_BLOCK_TIME,
        }
    }
}

impl ChainParams {
    /// Parameters with trivially minable blocks, for tests and local networks
    pub fn regtest() -> Self {
        Self {
            difficulty: 0,
            ..Self::default()
        }
    }

    pub fn with_difficulty(mut self, difficulty: u8) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_confirmation_depth(mut self, depth: u64) -> Self {
        self.confirmation_depth = depth;
        self
    }

    pub fn with_tx_per_block(mut self, tx_per_block: usize) -> Self {
        self.tx_per_block = tx_per_block;
        self
    }
}
