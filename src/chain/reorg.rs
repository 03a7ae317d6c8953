//! Chain reorganization
//!
//! Moves the node's UTXO state from the current main-chain tip to a new
//! one. The reorganizer keeps its own commit watermark: the chainstate only
//! holds main-chain blocks at or below `tip - confirmation_depth`. A switch
//! first disconnects committed blocks that the new tip does not keep and
//! then commits the new chain up to that height. Main-chain blocks above it
//! and pooled transactions are rebuilt in the mempool layer afterwards.
//! Side-chain deltas forking below the new committed height are dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{ChainError, MainChainState, MultiChainUtxoService};
use crate::consensus::Block;
use crate::crypto::Hash;
use crate::mempool::Mempool;
use crate::storage::BlockUndo;
use crate::validation::TransactionValidator;

/// One chainstate step taken during a reorganization, kept so a failure
/// can be unwound
enum JournalStep {
    Reverted { block: Block, height: u64 },
    Committed { block: Block, undo: BlockUndo },
}

pub struct Reorganizer {
    multichain: Arc<MultiChainUtxoService>,
    mempool: Arc<Mempool>,
    tx_validator: TransactionValidator,
    min_fee: u64,
    last_known_tip: Mutex<Hash>,
}

impl Reorganizer {
    pub fn new(multichain: Arc<MultiChainUtxoService>, mempool: Arc<Mempool>, min_fee: u64) -> Self {
        Self {
            multichain,
            mempool,
            tx_validator: TransactionValidator::new(),
            min_fee,
            last_known_tip: Mutex::new(Hash::zero()),
        }
    }

    pub fn last_known_tip(&self) -> Hash {
        *self.last_known_tip.lock()
    }

    /// Switch the UTXO state to `new_tip`
    ///
    /// Returns whether anything changed. The first call only records the
    /// tip. On failure every chainstate step already taken is undone and the
    /// last known tip stays where it was.
    pub fn check_and_reorganize(&self, new_tip: &Hash) -> Result<bool, ChainError> {
        let mut last_known = self.last_known_tip.lock();
        if last_known.is_zero() {
            *last_known = *new_tip;
            return Ok(false);
        }
        if *last_known == *new_tip {
            return Ok(false);
        }

        let mut state = self.multichain.lock_state();
        let forest = self.multichain.forest();
        let full_node = self.multichain.full_node();

        let new_height = forest
            .get_block_height(new_tip)
            .ok_or(ChainError::OrphanBlockUnexpected(*new_tip))?;
        let fork_point = forest.find_fork_point(&state.tip, new_tip)?;
        let fork_height = forest
            .get_block_height(&fork_point)
            .ok_or(ChainError::OrphanBlockUnexpected(fork_point))?;

        let disconnected = forest.chain_segment(&state.tip, fork_height, state.height)?;
        let connected = forest.chain_segment(new_tip, fork_height, new_height)?;
        if disconnected.is_empty() {
            debug!(tip = %new_tip, height = new_height, "Extending main chain");
        } else {
            info!(
                old_tip = %state.tip,
                new_tip = %new_tip,
                %fork_point,
                fork_height,
                disconnected = disconnected.len(),
                connected = connected.len(),
                "Reorganizing chain"
            );
        }

        let target = new_height.saturating_sub(full_node.confirmation_depth());

        let mut journal = Vec::new();
        let outcome = self
            .commit(&state, new_tip, target, &mut journal)
            .and_then(|committed| {
                self.rebuild_unconfirmed(new_tip, committed.1, new_height)?;
                Ok(committed)
            });

        let (committed_tip, committed_height) = match outcome {
            Ok(committed) => committed,
            Err(e) => {
                error!(new_tip = %new_tip, error = %e, "Reorganization failed, unwinding");
                self.unwind(journal);
                if let Err(rebuild) =
                    self.rebuild_unconfirmed(&state.tip, state.committed_height, state.height)
                {
                    error!(error = %rebuild, "Could not restore the mempool layer");
                }
                self.restore_pool();
                return Err(e);
            }
        };

        self.multichain
            .promote_locked(&mut state, *new_tip, fork_point, &disconnected, &connected)?;
        state.committed_tip = committed_tip;
        state.committed_height = committed_height;
        self.multichain.prune_buried_deltas(&state);

        let disconnected: Vec<Block> = disconnected.into_iter().map(|(b, _)| b).collect();
        let connected: Vec<Block> = connected.into_iter().map(|(b, _)| b).collect();
        let cleanup = self.mempool.clean_mempool(
            &disconnected,
            &connected,
            full_node,
            &self.tx_validator,
            self.min_fee,
        );

        *last_known = *new_tip;
        if !disconnected.is_empty() {
            info!(
                tip = %new_tip,
                height = new_height,
                committed_height,
                evicted = cleanup.evicted,
                readmitted = cleanup.readmitted,
                "Reorganization complete"
            );
        }
        Ok(true)
    }

    /// Bring the chainstate to the chain of `new_tip` at height `target`
    ///
    /// Returns the new committed tip and height.
    fn commit(
        &self,
        state: &MainChainState,
        new_tip: &Hash,
        target: u64,
        journal: &mut Vec<JournalStep>,
    ) -> Result<(Hash, u64), ChainError> {
        let forest = self.multichain.forest();
        let full_node = self.multichain.full_node();
        let undo_store = self.multichain.undo_store();

        let mut committed_tip = state.committed_tip;
        let mut committed_height = state.committed_height;

        // Disconnect committed blocks the new chain does not keep
        while committed_height > 0
            && (committed_height > target || !forest.is_ancestor(&committed_tip, new_tip))
        {
            let block = forest.get_block_by_hash(&committed_tip)?;
            let undo = undo_store
                .get(&committed_tip)
                .ok_or(ChainError::CannotReconstructView(committed_tip))?;

            for (index, tx) in block.transactions.iter().enumerate().rev() {
                full_node.revert_transaction(tx, &tx.hash(), undo.spent_for(index))?;
            }
            undo_store.remove(&committed_tip);
            debug!(block = %committed_tip, height = committed_height, "Disconnected committed block");

            committed_tip = *block.prev_hash();
            committed_height -= 1;
            journal.push(JournalStep::Reverted {
                block,
                height: committed_height + 1,
            });
        }

        // Commit the new chain up to its confirmed height
        for (block, height) in forest.chain_segment(new_tip, committed_height, target)? {
            let block_hash = block.hash();
            let undo = self.apply_block(&block, height)?;
            undo_store.insert(block_hash, undo.clone());
            debug!(block = %block_hash, height, "Committed block");

            committed_tip = block_hash;
            committed_height = height;
            journal.push(JournalStep::Committed { block, undo });
        }

        Ok((committed_tip, committed_height))
    }

    /// Apply every transaction of `block`, undoing the ones already applied
    /// if one fails
    fn apply_block(&self, block: &Block, height: u64) -> Result<BlockUndo, ChainError> {
        let full_node = self.multichain.full_node();
        let mut undo = BlockUndo::default();

        for (index, tx) in block.transactions.iter().enumerate() {
            match full_node.commit_transaction(tx, &tx.hash(), height, index == 0) {
                Ok(spent) => undo.spent.push(spent),
                Err(e) => {
                    for (applied, spent) in undo.spent.iter().enumerate().rev() {
                        let tx = &block.transactions[applied];
                        full_node.revert_transaction(tx, &tx.hash(), spent)?;
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(undo)
    }

    /// Reverse the journal. Best effort: failures are logged.
    fn unwind(&self, journal: Vec<JournalStep>) {
        let full_node = self.multichain.full_node();
        let undo_store = self.multichain.undo_store();

        for step in journal.into_iter().rev() {
            match step {
                JournalStep::Committed { block, undo } => {
                    for (index, tx) in block.transactions.iter().enumerate().rev() {
                        if let Err(e) = full_node.revert_transaction(tx, &tx.hash(), undo.spent_for(index)) {
                            error!(block = %block.hash(), error = %e, "Unwind revert failed");
                        }
                    }
                    undo_store.remove(&block.hash());
                }
                JournalStep::Reverted { block, height } => match self.apply_block(&block, height) {
                    Ok(undo) => undo_store.insert(block.hash(), undo),
                    Err(e) => error!(block = %block.hash(), error = %e, "Unwind reapply failed"),
                },
            }
        }
    }

    /// Refill the mempool layer with the main-chain blocks above the
    /// committed height
    fn rebuild_unconfirmed(
        &self,
        tip: &Hash,
        committed_height: u64,
        tip_height: u64,
    ) -> Result<(), ChainError> {
        let forest = self.multichain.forest();
        let full_node = self.multichain.full_node();

        full_node.mempool().clear();
        for (block, height) in forest.chain_segment(tip, committed_height, tip_height)? {
            for (index, tx) in block.transactions.iter().enumerate() {
                full_node.stage_transaction(tx, &tx.hash(), height, index == 0)?;
            }
        }
        Ok(())
    }

    /// Re-apply pooled transactions after the mempool layer was rebuilt
    fn restore_pool(&self) {
        let cleanup = self.mempool.clean_mempool(
            &[],
            &[],
            self.multichain.full_node(),
            &self.tx_validator,
            self.min_fee,
        );
        if cleanup.evicted > 0 {
            warn!(evicted = cleanup.evicted, "Transactions lost while restoring mempool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BlockForest;
    use crate::consensus::{BlockHeader, BlockValidator, ChainParams};
    use crate::crypto::PubKeyHash;
    use crate::storage::{BlockUndoStore, Chainstate, FullNodeUtxoService, MemoryUtxoDao, MempoolUtxo};
    use crate::validation::{Outpoint, Transaction};

    struct Fixture {
        multichain: Arc<MultiChainUtxoService>,
        reorganizer: Reorganizer,
        genesis: Block,
    }

    fn fixture(depth: u64) -> Fixture {
        let genesis = block_on(Hash::zero(), 0, 0);
        let forest = Arc::new(BlockForest::new());
        forest.add_block(genesis.clone());
        let chainstate = Arc::new(Chainstate::with_default_cache(Box::new(MemoryUtxoDao::new())));
        let full_node = Arc::new(FullNodeUtxoService::new(
            chainstate,
            Arc::new(MempoolUtxo::new()),
            depth,
        ));
        let multichain = Arc::new(MultiChainUtxoService::new(
            forest,
            full_node,
            Arc::new(BlockUndoStore::new()),
            BlockValidator::new(ChainParams::regtest()),
            genesis.hash(),
        ));
        let reorganizer = Reorganizer::new(multichain.clone(), Arc::new(Mempool::new()), 1);
        reorganizer.check_and_reorganize(&genesis.hash()).unwrap();
        Fixture {
            multichain,
            reorganizer,
            genesis,
        }
    }

    fn block_on(prev: Hash, height: u64, tag: u8) -> Block {
        let coinbase = Transaction::coinbase_with_data(height, 50, PubKeyHash([tag; 20]), &[tag]);
        let mut block = Block::new(
            BlockHeader::new(prev, Hash::zero(), i64::from(tag), 0, 0),
            vec![coinbase],
        );
        block.header.merkle_root = block.compute_merkle_root();
        block
    }

    fn extend(f: &Fixture, parent: &Block, height: u64, tag: u8) -> Block {
        let block = block_on(parent.hash(), height, tag);
        f.multichain.forest().add_block(block.clone());
        block
    }

    fn reward(block: &Block) -> Outpoint {
        Outpoint::new(block.transactions[0].hash(), 0)
    }

    #[test]
    fn test_first_call_records_tip() {
        let f = fixture(2);
        assert_eq!(f.reorganizer.last_known_tip(), f.genesis.hash());
        assert!(!f.reorganizer.check_and_reorganize(&f.genesis.hash()).unwrap());
    }

    #[test]
    fn test_extension_commits_confirmed_blocks() {
        let f = fixture(2);
        let mut parent = f.genesis.clone();
        let mut blocks = Vec::new();
        for height in 1..=4 {
            let block = extend(&f, &parent, height, height as u8);
            assert!(f.reorganizer.check_and_reorganize(&block.hash()).unwrap());
            blocks.push(block.clone());
            parent = block;
        }

        let state = f.multichain.state();
        assert_eq!((state.tip, state.height), (blocks[3].hash(), 4));
        assert_eq!(state.committed_height, 2);
        assert_eq!(state.committed_tip, blocks[1].hash());

        let full_node = f.multichain.full_node();
        assert!(full_node.chainstate().get(&reward(&blocks[1])).is_ok());
        assert!(full_node.chainstate().get(&reward(&blocks[2])).is_err());
        assert!(full_node.mempool().contains(&reward(&blocks[2])));
        assert!(f.multichain.undo_store().contains(&blocks[0].hash()));
    }

    #[test]
    fn test_switch_to_heavier_branch_and_back() {
        let f = fixture(1);
        let a1 = extend(&f, &f.genesis, 1, 1);
        let a2 = extend(&f, &a1, 2, 2);
        let a3 = extend(&f, &a2, 3, 3);
        f.reorganizer.check_and_reorganize(&a3.hash()).unwrap();
        assert_eq!(f.multichain.state().committed_height, 2);

        // Fork below the committed height
        let b2 = extend(&f, &a1, 2, 12);
        let b3 = extend(&f, &b2, 3, 13);
        let b4 = extend(&f, &b3, 4, 14);
        assert!(f.reorganizer.check_and_reorganize(&b4.hash()).unwrap());

        let state = f.multichain.state();
        assert_eq!(state.tip, b4.hash());
        assert_eq!(state.committed_tip, b3.hash());
        let chainstate = f.multichain.full_node().chainstate().clone();
        assert!(chainstate.get(&reward(&a2)).is_err());
        assert!(chainstate.get(&reward(&b2)).is_ok());
        assert!(chainstate.get(&reward(&b3)).is_ok());
        assert!(!f.multichain.undo_store().contains(&a2.hash()));

        // The old branch forks below the committed height, so its deltas are
        // dropped, but it can still be viewed
        assert!(f.multichain.side_chains().is_empty());
        let view = f.multichain.view_at(&a3.hash()).unwrap();
        assert!(view.get(&reward(&a2)).is_ok());
        assert!(view.get(&reward(&b2)).is_err());

        // And reorganized back to once it outgrows the new one
        let a4 = extend(&f, &a3, 4, 4);
        let a5 = extend(&f, &a4, 5, 5);
        assert!(f.reorganizer.check_and_reorganize(&a5.hash()).unwrap());
        assert!(chainstate.get(&reward(&b2)).is_err());
        assert!(chainstate.get(&reward(&a4)).is_ok());
    }

    #[test]
    fn test_reorg_prunes_buried_deltas() {
        let f = fixture(1);
        let a1 = extend(&f, &f.genesis, 1, 1);
        let a2 = extend(&f, &a1, 2, 2);
        let a3 = extend(&f, &a2, 3, 3);
        f.reorganizer.check_and_reorganize(&a3.hash()).unwrap();
        assert_eq!(f.multichain.state().committed_height, 2);

        let s2 = extend(&f, &a1, 2, 22);
        let t3 = extend(&f, &a2, 3, 23);
        let u4 = extend(&f, &a3, 4, 24);
        for (block, height) in [(&s2, 2), (&t3, 3), (&u4, 4)] {
            f.multichain
                .validate_and_apply_side_chain_block(block, height)
                .unwrap();
        }
        let side_chains = f.multichain.side_chains();
        assert_eq!(side_chains.len(), 3);

        let a4 = extend(&f, &a3, 4, 4);
        assert!(f.reorganizer.check_and_reorganize(&a4.hash()).unwrap());
        assert_eq!(f.multichain.state().committed_height, 3);

        // Fork points a1 and a2 are below the committed height, a3 is not
        assert_eq!(side_chains.len(), 1);
        assert!(side_chains.contains(&u4.hash()));
        assert!(!side_chains.contains(&s2.hash()));
        assert!(!side_chains.contains(&t3.hash()));

        let view = f.multichain.view_at(&s2.hash()).unwrap();
        assert!(view.get(&reward(&s2)).is_ok());
        assert!(view.get(&reward(&a1)).is_ok());
        assert!(view.get(&reward(&a2)).is_err());
        let view = f.multichain.view_at(&t3.hash()).unwrap();
        assert!(view.get(&reward(&a2)).is_ok());
        assert!(view.get(&reward(&a3)).is_err());
    }

    #[test]
    fn test_missing_undo_fails_and_keeps_state() {
        let f = fixture(1);
        let a1 = extend(&f, &f.genesis, 1, 1);
        let a2 = extend(&f, &a1, 2, 2);
        f.reorganizer.check_and_reorganize(&a2.hash()).unwrap();
        assert_eq!(f.multichain.state().committed_tip, a1.hash());

        f.multichain.undo_store().remove(&a1.hash());
        let b1 = extend(&f, &f.genesis, 1, 11);
        let b2 = extend(&f, &b1, 2, 12);
        let b3 = extend(&f, &b2, 3, 13);

        assert!(matches!(
            f.reorganizer.check_and_reorganize(&b3.hash()),
            Err(ChainError::CannotReconstructView(_))
        ));
        assert_eq!(f.reorganizer.last_known_tip(), a2.hash());
        assert_eq!(f.multichain.main_chain_tip(), (a2.hash(), 2));
        assert_eq!(f.multichain.state().committed_height, 1);
        assert!(f
            .multichain
            .full_node()
            .chainstate()
            .get(&reward(&a1))
            .is_ok());
    }
}
