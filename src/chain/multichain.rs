//! Multi-chain UTXO service
//!
//! Builds a UTXO view at any connected block, main chain or side chain,
//! without keeping a full UTXO set per chain. The chainstate holds the main
//! chain up to the committed height; everything above it (and every side
//! chain) is expressed as deltas layered over it.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::{debug, trace};

use super::{
    BlockForest, ChainError, ChainedDeltaBaseProvider, DeltaBaseProvider, SideChainDelta,
    SideChainDeltaStore, UtxoView,
};
use crate::consensus::{Block, BlockRejection, BlockValidator};
use crate::crypto::Hash;
use crate::storage::{BlockUndoStore, FullNodeUtxoService, UtxoProvider};
use crate::validation::{TransactionValidator, TxRejection};

/// Main-chain pointers guarded together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainChainState {
    pub tip: Hash,
    pub height: u64,
    /// Highest block whose transactions are in the chainstate
    pub committed_tip: Hash,
    pub committed_height: u64,
}

impl MainChainState {
    pub fn at_genesis(genesis: Hash) -> Self {
        Self {
            tip: genesis,
            height: 0,
            committed_tip: genesis,
            committed_height: 0,
        }
    }
}

pub struct MultiChainUtxoService {
    forest: Arc<BlockForest>,
    full_node: Arc<FullNodeUtxoService>,
    undo: Arc<BlockUndoStore>,
    side_chains: SideChainDeltaStore,
    block_validator: BlockValidator,
    tx_validator: TransactionValidator,
    state: RwLock<MainChainState>,
}

impl MultiChainUtxoService {
    pub fn new(
        forest: Arc<BlockForest>,
        full_node: Arc<FullNodeUtxoService>,
        undo: Arc<BlockUndoStore>,
        block_validator: BlockValidator,
        genesis: Hash,
    ) -> Self {
        Self {
            forest,
            full_node,
            undo,
            side_chains: SideChainDeltaStore::new(),
            block_validator,
            tx_validator: TransactionValidator::new(),
            state: RwLock::new(MainChainState::at_genesis(genesis)),
        }
    }

    pub fn forest(&self) -> &Arc<BlockForest> {
        &self.forest
    }

    pub fn full_node(&self) -> &Arc<FullNodeUtxoService> {
        &self.full_node
    }

    pub fn undo_store(&self) -> &Arc<BlockUndoStore> {
        &self.undo
    }

    pub fn side_chains(&self) -> &SideChainDeltaStore {
        &self.side_chains
    }

    pub fn block_validator(&self) -> &BlockValidator {
        &self.block_validator
    }

    /// Hash and height of the main-chain tip
    pub fn main_chain_tip(&self) -> (Hash, u64) {
        let state = self.state.read();
        (state.tip, state.height)
    }

    pub fn state(&self) -> MainChainState {
        *self.state.read()
    }

    /// Exclusive access to the main-chain pointers for a reorganization
    pub(crate) fn lock_state(&self) -> RwLockWriteGuard<'_, MainChainState> {
        self.state.write()
    }

    /// Whether `hash` is on the chain ending at the current main tip
    pub fn is_on_main_chain(&self, hash: &Hash) -> bool {
        let state = self.state.read();
        self.forest.is_ancestor(hash, &state.tip)
    }

    /// A fresh view of the UTXO set as of `tip`
    pub fn view_at(&self, tip: &Hash) -> Result<UtxoView, ChainError> {
        let state = self.state.read();
        Ok(UtxoView::new(self.provider_at(tip, &state)?))
    }

    fn provider_at(
        &self,
        tip: &Hash,
        state: &MainChainState,
    ) -> Result<Arc<dyn UtxoProvider>, ChainError> {
        if *tip == state.tip {
            return self.main_base_at(tip, state.height, state);
        }
        if self.forest.is_ancestor(tip, &state.tip) {
            let height = self.height_of(tip)?;
            return self.main_base_at(tip, height, state);
        }
        Ok(self.side_base(tip, state)?.0)
    }

    fn height_of(&self, hash: &Hash) -> Result<u64, ChainError> {
        self.forest
            .get_block_height(hash)
            .ok_or(ChainError::OrphanBlockUnexpected(*hash))
    }

    /// State at main-chain block `hash`, expressed against the chainstate
    ///
    /// Above the committed height the missing blocks are replayed; below it
    /// committed blocks are rolled back from their undo data.
    fn main_base_at(
        &self,
        hash: &Hash,
        height: u64,
        state: &MainChainState,
    ) -> Result<Arc<dyn UtxoProvider>, ChainError> {
        let chainstate: Arc<dyn UtxoProvider> = self.full_node.chainstate().clone();
        let committed = state.committed_height;
        if height == committed {
            return Ok(chainstate);
        }

        let mut delta = SideChainDelta::new(state.committed_tip);
        if height > committed {
            for (block, h) in self.forest.chain_segment(hash, committed, height)? {
                delta.replay_block(&block, h);
                delta.advance(block.hash());
            }
        } else {
            let segment = self
                .forest
                .chain_segment(&state.committed_tip, height, committed)?;
            for (block, _) in segment.iter().rev() {
                let block_hash = block.hash();
                let undo = self
                    .undo
                    .get(&block_hash)
                    .ok_or(ChainError::CannotReconstructView(block_hash))?;
                delta.rollback_block(block, &undo);
            }
        }
        trace!(%hash, height, committed, "Built main-chain base");
        Ok(Arc::new(DeltaBaseProvider::new(chainstate, Arc::new(delta))))
    }

    /// Base for a block off the main chain, with the cumulative delta that
    /// leads to it from its fork point
    fn side_base(
        &self,
        tip: &Hash,
        state: &MainChainState,
    ) -> Result<(Arc<dyn UtxoProvider>, Arc<SideChainDelta>), ChainError> {
        if let Some(delta) = self.side_chains.get(tip) {
            if let Some(provider) = self.stacked_provider(delta.clone(), state)? {
                return Ok((provider, delta));
            }
            debug!(%tip, "Stored delta no longer reaches the main chain, replaying");
        }

        let delta = Arc::new(self.replay_from_main(tip, state)?);
        let fork_height = self.height_of(&delta.fork_point)?;
        let base = self.main_base_at(&delta.fork_point, fork_height, state)?;
        Ok((Arc::new(DeltaBaseProvider::new(base, delta.clone())), delta))
    }

    /// Follow fork points through stored deltas until one sits on the main
    /// chain. `None` when the chain of deltas is broken.
    fn stacked_provider(
        &self,
        top: Arc<SideChainDelta>,
        state: &MainChainState,
    ) -> Result<Option<Arc<dyn UtxoProvider>>, ChainError> {
        let mut deltas = vec![top];
        loop {
            let fork_point = match deltas.last() {
                Some(delta) => delta.fork_point,
                None => return Ok(None),
            };
            if self.forest.is_ancestor(&fork_point, &state.tip) {
                let height = self.height_of(&fork_point)?;
                let base = self.main_base_at(&fork_point, height, state)?;
                if deltas.len() == 1 {
                    let delta = deltas.swap_remove(0);
                    return Ok(Some(Arc::new(DeltaBaseProvider::new(base, delta))));
                }
                return Ok(Some(Arc::new(ChainedDeltaBaseProvider::new(base, deltas))));
            }
            match self.side_chains.get(&fork_point) {
                Some(delta) => deltas.push(delta),
                None => return Ok(None),
            }
        }
    }

    /// Cumulative delta for `tip` built by replaying its blocks from the
    /// nearest main-chain ancestor
    fn replay_from_main(
        &self,
        tip: &Hash,
        state: &MainChainState,
    ) -> Result<SideChainDelta, ChainError> {
        let fork_point = self.forest.find_fork_point(tip, &state.tip)?;
        let fork_height = self.height_of(&fork_point)?;
        let tip_height = self.height_of(tip)?;

        let mut delta = SideChainDelta::new(fork_point);
        for (block, height) in self.forest.chain_segment(tip, fork_height, tip_height)? {
            delta.replay_block(&block, height);
            delta.advance(block.hash());
        }
        Ok(delta)
    }

    /// Validate every transaction of `block` against `view`, applying them
    /// as it goes. Returns the total fees.
    pub fn validate_block_transactions(
        &self,
        block: &Block,
        height: u64,
        view: &mut UtxoView,
    ) -> Result<u64, ChainError> {
        let coinbase = block
            .transactions
            .first()
            .ok_or(BlockRejection::EmptyTransactions)?;
        view.apply_tx(coinbase, &coinbase.hash(), height, true)?;

        let mut fees: u64 = 0;
        for (index, tx) in block.transactions.iter().enumerate().skip(1) {
            if tx.is_coinbase() {
                return Err(BlockRejection::MultipleCoinbase(index).into());
            }
            let txid = tx.hash();
            let fee = self
                .tx_validator
                .validate(tx, &*view)
                .map_err(|reason| ChainError::InvalidTransaction { txid, reason })?;
            view.apply_tx(tx, &txid, height, false)
                .map_err(|e| ChainError::InvalidTransaction {
                    txid,
                    reason: e.into(),
                })?;
            fees = fees
                .checked_add(fee)
                .ok_or(ChainError::InvalidTransaction {
                    txid,
                    reason: TxRejection::ValueOverflow,
                })?;
        }

        self.block_validator.check_coinbase(block, fees)?;
        Ok(fees)
    }

    /// Validate a block whose parent is not the main tip and store the
    /// extended delta under its hash
    pub fn validate_and_apply_side_chain_block(
        &self,
        block: &Block,
        height: u64,
    ) -> Result<u64, ChainError> {
        let state = self.state.read();
        let parent = *block.prev_hash();

        let (base, mut delta) = if self.forest.is_ancestor(&parent, &state.tip) {
            let parent_height = self.height_of(&parent)?;
            (
                self.main_base_at(&parent, parent_height, &state)?,
                SideChainDelta::new(parent),
            )
        } else {
            let (base, delta) = self.side_base(&parent, &state)?;
            (base, (*delta).clone())
        };

        let mut view = UtxoView::new(base);
        let fees = self.validate_block_transactions(block, height, &mut view)?;

        let (added, spent) = view.into_parts();
        delta.merge_view(added, spent);
        delta.advance(block.hash());
        debug!(
            block = %block.hash(),
            fork_point = %delta.fork_point,
            blocks = delta.block_count,
            "Stored side-chain delta"
        );
        self.side_chains.insert(delta);
        Ok(fees)
    }

    /// Record a completed reorganization
    ///
    /// Deltas of the newly connected blocks are dropped. The old main-chain
    /// segment above the fork point becomes a run of cumulative side-chain
    /// deltas so it can still be validated and reorganized back to.
    pub fn promote_side_chain_to_main(
        &self,
        new_tip: Hash,
        fork_point: Hash,
        disconnected: &[(Block, u64)],
        connected: &[(Block, u64)],
    ) -> Result<(), ChainError> {
        let mut state = self.state.write();
        self.promote_locked(&mut state, new_tip, fork_point, disconnected, connected)
    }

    pub(crate) fn promote_locked(
        &self,
        state: &mut MainChainState,
        new_tip: Hash,
        fork_point: Hash,
        disconnected: &[(Block, u64)],
        connected: &[(Block, u64)],
    ) -> Result<(), ChainError> {
        let new_height = self.height_of(&new_tip)?;

        for (block, _) in connected {
            self.side_chains.remove(&block.hash());
        }

        let mut delta = SideChainDelta::new(fork_point);
        for (block, height) in disconnected {
            delta.replay_block(block, *height);
            delta.advance(block.hash());
            self.side_chains.insert(delta.clone());
        }

        state.tip = new_tip;
        state.height = new_height;
        Ok(())
    }

    /// Drop deltas forked off the main chain below the committed height
    ///
    /// Views at their tips are rebuilt by replaying from the main chain.
    pub(crate) fn prune_buried_deltas(&self, state: &MainChainState) -> usize {
        let mut pruned = 0;
        for fork_point in self.side_chains.fork_points() {
            let buried = self
                .forest
                .get_block_height(&fork_point)
                .is_some_and(|height| height < state.committed_height)
                && self.forest.is_ancestor(&fork_point, &state.tip);
            if buried {
                pruned += self.side_chains.prune_fork_point(&fork_point);
            }
        }
        if pruned > 0 {
            debug!(
                pruned,
                committed_height = state.committed_height,
                remaining = self.side_chains.len(),
                "Pruned side-chain deltas"
            );
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{BlockHeader, ChainParams};
    use crate::crypto::PubKeyHash;
    use crate::storage::{Chainstate, MemoryUtxoDao, MempoolUtxo, UtxoError};
    use crate::validation::{Outpoint, Transaction};

    fn service(genesis: &Block) -> MultiChainUtxoService {
        let forest = Arc::new(BlockForest::new());
        forest.add_block(genesis.clone());
        let chainstate = Arc::new(Chainstate::with_default_cache(Box::new(MemoryUtxoDao::new())));
        let full_node = Arc::new(FullNodeUtxoService::new(
            chainstate,
            Arc::new(MempoolUtxo::new()),
            5,
        ));
        MultiChainUtxoService::new(
            forest,
            full_node,
            Arc::new(BlockUndoStore::new()),
            BlockValidator::new(ChainParams::regtest()),
            genesis.hash(),
        )
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

    #[test]
    fn test_view_at_genesis_is_empty() {
        let genesis = block_on(Hash::zero(), 0, 0);
        let multichain = service(&genesis);
        let view = multichain.view_at(&genesis.hash()).unwrap();
        let coinbase = Outpoint::new(genesis.transactions[0].hash(), 0);
        assert!(matches!(view.get(&coinbase), Err(UtxoError::NotFound(_))));
    }

    #[test]
    fn test_side_chain_delta_is_stored() {
        let genesis = block_on(Hash::zero(), 0, 0);
        let multichain = service(&genesis);
        let side = block_on(genesis.hash(), 1, 1);
        multichain.forest().add_block(side.clone());

        let fees = multichain.validate_and_apply_side_chain_block(&side, 1).unwrap();
        assert_eq!(fees, 0);

        let delta = multichain.side_chains().get(&side.hash()).unwrap();
        assert_eq!(delta.fork_point, genesis.hash());
        assert_eq!(delta.parent_tip, genesis.hash());
        assert_eq!(delta.block_count, 1);

        let child = block_on(side.hash(), 2, 2);
        multichain.forest().add_block(child.clone());
        multichain.validate_and_apply_side_chain_block(&child, 2).unwrap();
        let delta = multichain.side_chains().get(&child.hash()).unwrap();
        assert_eq!(delta.block_count, 2);
        assert_eq!(delta.fork_point, genesis.hash());

        let view = multichain.view_at(&child.hash()).unwrap();
        let reward = Outpoint::new(side.transactions[0].hash(), 0);
        assert_eq!(view.get(&reward).unwrap().block_height, 1);
    }

    #[test]
    fn test_excessive_coinbase_rejected() {
        let genesis = block_on(Hash::zero(), 0, 0);
        let multichain = service(&genesis);
        let coinbase = Transaction::coinbase(1, 51, PubKeyHash([1; 20]));
        let mut greedy = Block::new(
            BlockHeader::new(genesis.hash(), Hash::zero(), 0, 0, 0),
            vec![coinbase],
        );
        greedy.header.merkle_root = greedy.compute_merkle_root();

        let mut view = multichain.view_at(&genesis.hash()).unwrap();
        assert!(matches!(
            multichain.validate_block_transactions(&greedy, 1, &mut view),
            Err(ChainError::InvalidBlock(BlockRejection::ExcessiveCoinbase { .. }))
        ));
    }

    #[test]
    fn test_unseen_tip_is_replayed() {
        let genesis = block_on(Hash::zero(), 0, 0);
        let multichain = service(&genesis);
        let a = block_on(genesis.hash(), 1, 1);
        let b = block_on(a.hash(), 2, 2);
        multichain.forest().add_block(a.clone());
        multichain.forest().add_block(b.clone());

        // Never validated, so no delta exists for either block
        let view = multichain.view_at(&b.hash()).unwrap();
        assert!(view
            .get(&Outpoint::new(a.transactions[0].hash(), 0))
            .is_ok());
    }

    #[test]
    fn test_orphan_view_fails() {
        let genesis = block_on(Hash::zero(), 0, 0);
        let multichain = service(&genesis);
        let orphan = block_on(Hash([8; 32]), 5, 1);
        multichain.forest().add_block(orphan.clone());
        assert!(multichain.view_at(&orphan.hash()).is_err());
    }

    #[test]
    fn test_promote_turns_old_main_into_deltas() {
        let genesis = block_on(Hash::zero(), 0, 0);
        let multichain = service(&genesis);
        let old = block_on(genesis.hash(), 1, 1);
        let new = block_on(genesis.hash(), 1, 2);
        multichain.forest().add_block(old.clone());
        multichain.forest().add_block(new.clone());

        multichain
            .promote_side_chain_to_main(old.hash(), genesis.hash(), &[], &[(old.clone(), 1)])
            .unwrap();
        assert_eq!(multichain.main_chain_tip(), (old.hash(), 1));

        multichain.validate_and_apply_side_chain_block(&new, 1).unwrap();
        assert!(multichain.side_chains().contains(&new.hash()));

        multichain
            .promote_side_chain_to_main(
                new.hash(),
                genesis.hash(),
                &[(old.clone(), 1)],
                &[(new.clone(), 1)],
            )
            .unwrap();
        assert!(!multichain.side_chains().contains(&new.hash()));
        let delta = multichain.side_chains().get(&old.hash()).unwrap();
        assert!(delta
            .added
            .contains_key(&Outpoint::new(old.transactions[0].hash(), 0)));
        assert!(multichain.is_on_main_chain(&new.hash()));
        assert!(!multichain.is_on_main_chain(&old.hash()));
    }
}
