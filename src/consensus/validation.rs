//! Block validation
//!
//! Context-free checks on blocks. Transaction checks need a UTXO view at the
//! block's parent and live in the multi-chain service.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use super::{calculate_block_reward, meets_target, Block, BlockHeader, ChainParams};
use crate::crypto::Hash;

/// Reasons a block is rejected
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockRejection {
    #[error("Block has no transactions")]
    EmptyTransactions,
    #[error("First transaction is not a coinbase")]
    FirstTxNotCoinbase,
    #[error("Block hash {0} exceeds the difficulty target")]
    HashExceedsTarget(Hash),
    #[error("Timestamp {timestamp} is too far in the future (now {now})")]
    TimestampTooFarInFuture { timestamp: i64, now: i64 },
    #[error("Merkle root mismatch")]
    MerkleMismatch,
    #[error("Unexpected difficulty {got}, expected {expected}")]
    UnexpectedDifficulty { expected: u8, got: u8 },
    #[error("Coinbase transaction at position {0}")]
    MultipleCoinbase(usize),
    #[error("Coinbase pays {value}, at most {max} allowed")]
    ExcessiveCoinbase { value: u64, max: u64 },
}

/// Current Unix time in seconds
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct BlockValidator {
    params: ChainParams,
}

impl BlockValidator {
    pub fn new(params: ChainParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Non-empty and coinbase first
    pub fn sanity_check(&self, block: &Block) -> Result<(), BlockRejection> {
        let first = block
            .transactions
            .first()
            .ok_or(BlockRejection::EmptyTransactions)?;
        if !first.is_coinbase() {
            return Err(BlockRejection::FirstTxNotCoinbase);
        }
        Ok(())
    }

    /// Proof of work and timestamp drift
    pub fn header_only(&self, header: &BlockHeader, now: i64) -> Result<(), BlockRejection> {
        let hash = header.hash();
        if !meets_target(&hash, header.difficulty) {
            return Err(BlockRejection::HashExceedsTarget(hash));
        }
        if header.timestamp > now.saturating_add(self.params.max_future_block_time) {
            return Err(BlockRejection::TimestampTooFarInFuture {
                timestamp: header.timestamp,
                now,
            });
        }
        Ok(())
    }

    /// Non-genesis blocks must carry the network difficulty
    pub fn check_difficulty(&self, header: &BlockHeader) -> Result<(), BlockRejection> {
        if header.prev_hash.is_zero() || header.difficulty == self.params.difficulty {
            return Ok(());
        }
        Err(BlockRejection::UnexpectedDifficulty {
            expected: self.params.difficulty,
            got: header.difficulty,
        })
    }

    /// Merkle root commits to the transaction list
    pub fn full_validation(&self, block: &Block) -> Result<(), BlockRejection> {
        if block.compute_merkle_root() != block.header.merkle_root {
            return Err(BlockRejection::MerkleMismatch);
        }
        Ok(())
    }

    /// Only one coinbase, paying at most subsidy plus `fees`
    pub fn check_coinbase(&self, block: &Block, fees: u64) -> Result<(), BlockRejection> {
        if let Some(position) = block
            .transactions
            .iter()
            .skip(1)
            .position(|tx| tx.is_coinbase())
        {
            return Err(BlockRejection::MultipleCoinbase(position + 1));
        }

        let coinbase = block
            .transactions
            .first()
            .ok_or(BlockRejection::EmptyTransactions)?;
        let max = calculate_block_reward(self.params.block_subsidy, fees).unwrap_or(u64::MAX);
        let value = coinbase.total_output_value().unwrap_or(u64::MAX);
        if value > max {
            return Err(BlockRejection::ExcessiveCoinbase { value, max });
        }
        Ok(())
    }
}
