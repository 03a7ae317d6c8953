//! Block miner implementation
//!
//! Assembles candidate blocks from the mempool and performs PoW.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info};

use crate::chain::{Blockchain, ChainError};
use crate::consensus::{calculate_block_reward, current_timestamp, meets_target, Block, BlockHeader};
use crate::crypto::PubKeyHash;
use crate::validation::{Transaction, TransactionValidator};

/// Mining result
#[derive(Debug)]
pub enum MiningResult {
    /// Successfully mined a block
    Success(Block),
    /// Mining was interrupted
    Interrupted,
}

/// Block miner
#[derive(Clone)]
pub struct Miner {
    /// Miner's public key hash (for coinbase)
    miner_pubkey_hash: PubKeyHash,
    /// Stop signal
    stop_signal: Arc<AtomicBool>,
}

impl Miner {
    pub fn new(miner_pubkey_hash: PubKeyHash) -> Self {
        Self {
            miner_pubkey_hash,
            stop_signal: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_signal)
    }

    /// Cancel the current search; the loop notices on its next nonce
    pub fn stop_mining(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Clear the stop signal before a new search
    pub fn reset(&self) {
        self.stop_signal.store(false, Ordering::SeqCst);
    }

    /// Assemble a candidate block on top of the current main-chain tip
    ///
    /// Pooled transactions are priced against the tip's UTXO view; those
    /// that do not resolve are skipped. The highest fees win, up to
    /// `tx_per_block - 1`, and the coinbase collects subsidy plus fees.
    pub fn assemble_block(&self, chain: &Blockchain) -> Result<Block, ChainError> {
        let params = chain.params();
        let (tip, height) = chain.main_chain_tip();
        let multichain = chain.multichain();
        let validator = TransactionValidator::new();

        let pricing_view = multichain.view_at(&tip)?;
        let mut candidates: Vec<(u64, Transaction)> = chain
            .mempool()
            .get_transactions_for_mining()
            .into_iter()
            .filter_map(|tx| {
                let fee = validator.validate(&tx, &pricing_view).ok()?;
                Some((fee, tx))
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        // Apply in fee order so conflicting candidates drop out
        let block_height = height + 1;
        let limit = params.tx_per_block.saturating_sub(1);
        let mut view = multichain.view_at(&tip)?;
        let mut selected = Vec::with_capacity(limit.min(candidates.len()));
        let mut fees: u64 = 0;
        for (fee, tx) in candidates {
            if selected.len() >= limit {
                break;
            }
            if view.apply_tx(&tx, &tx.hash(), block_height, false).is_err() {
                continue;
            }
            fees = fees.saturating_add(fee);
            selected.push(tx);
        }

        let reward = calculate_block_reward(params.block_subsidy, fees).unwrap_or(u64::MAX);
        let mut transactions = Vec::with_capacity(selected.len() + 1);
        transactions.push(Transaction::coinbase(block_height, reward, self.miner_pubkey_hash));
        transactions.extend(selected);

        let mut block = Block::new(
            BlockHeader::new(
                tip,
                Default::default(),
                current_timestamp(),
                params.difficulty,
                rand::thread_rng().gen(),
            ),
            transactions,
        );
        block.header.merkle_root = block.compute_merkle_root();

        debug!(
            height = block_height,
            txs = block.transactions.len(),
            fees,
            "Assembled candidate block"
        );
        Ok(block)
    }

    /// Mine a block (find valid nonce)
    ///
    /// This performs the PoW loop, incrementing the nonce until
    /// a valid hash is found or mining is interrupted.
    pub fn mine_block(&self, mut block: Block) -> MiningResult {
        loop {
            if self.stop_signal.load(Ordering::SeqCst) {
                return MiningResult::Interrupted;
            }
            if meets_target(&block.header.hash(), block.header.difficulty) {
                return MiningResult::Success(block);
            }
            advance_nonce(&mut block.header);
        }
    }

    /// Assemble, mine and submit one block
    pub fn start_mining(&self, chain: &Blockchain) -> Result<MiningResult, ChainError> {
        let candidate = self.assemble_block(chain)?;
        match self.mine_block(candidate) {
            MiningResult::Success(block) => {
                info!(
                    block = %block.hash(),
                    nonce = block.header.nonce,
                    txs = block.transactions.len(),
                    "Mined block"
                );
                chain.add_self_mined_block(block.clone())?;
                Ok(MiningResult::Success(block))
            }
            MiningResult::Interrupted => Ok(MiningResult::Interrupted),
        }
    }
}

/// Next nonce; on wrap-around the timestamp moves one second forward
pub fn advance_nonce(header: &mut BlockHeader) {
    header.nonce = header.nonce.wrapping_add(1);
    if header.nonce == 0 {
        header.timestamp += 1;
    }
}
