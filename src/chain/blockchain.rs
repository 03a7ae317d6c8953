//! Blockchain orchestrator
//!
//! Entry point for blocks and transactions, whether they come from peers or
//! the local miner. A block passes the context-free checks, is stored in the
//! forest, has its transactions validated against the UTXO state of its
//! parent, and may trigger a reorganization to the best tip. One processing
//! lock serializes all of this so a block and the reorganization it causes
//! are observed as one step.

use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{BlockForest, ChainError, MultiChainUtxoService, Reorganizer};
use crate::consensus::{current_timestamp, Block, BlockValidator, ChainParams};
use crate::crypto::{Hash, PubKeyHash};
use crate::mempool::Mempool;
use crate::node::{create_genesis_block, verify_genesis};
use crate::p2p::{build_block_locator, BlockchainMessageSender, InvItem, NullMessageSender, PeerId};
use crate::storage::{
    BlockArchive, BlockUndoStore, ChainDb, Chainstate, FullNodeUtxoService, MemoryUtxoDao,
    MempoolUtxo, Utxo, UtxoEntryDao,
};
use crate::validation::{Transaction, TransactionId, TransactionValidator};

/// What happened to a submitted block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockStatus {
    /// Already stored
    Duplicate,
    /// Stored, waiting for its parent
    Orphan,
    /// Connected to genesis together with `connected` adopted orphans
    Connected {
        connected: Vec<Hash>,
        tip_changed: bool,
    },
}

pub struct Blockchain {
    params: ChainParams,
    validator: BlockValidator,
    tx_validator: TransactionValidator,
    forest: Arc<BlockForest>,
    full_node: Arc<FullNodeUtxoService>,
    multichain: Arc<MultiChainUtxoService>,
    reorganizer: Reorganizer,
    mempool: Arc<Mempool>,
    archive: Option<BlockArchive>,
    sender: Arc<dyn BlockchainMessageSender>,
    genesis_hash: Hash,
    processing: Mutex<()>,
}

impl Blockchain {
    /// Open a node over `db`, or purely in memory when `db` is `None`
    ///
    /// The chainstate is rebuilt from genesis by replaying the block
    /// archive, so undo data for committed blocks is always available.
    pub fn open(
        params: ChainParams,
        db: Option<&ChainDb>,
        cache_size: NonZeroUsize,
        sender: Arc<dyn BlockchainMessageSender>,
    ) -> Result<Self, ChainError> {
        let genesis = create_genesis_block();
        let genesis_hash = verify_genesis(&genesis).map_err(ChainError::Genesis)?;

        let (dao, archive): (Box<dyn UtxoEntryDao>, Option<BlockArchive>) = match db {
            Some(db) => (Box::new(db.utxo_dao()), Some(db.block_archive())),
            None => (Box::new(MemoryUtxoDao::new()), None),
        };
        let chainstate = Arc::new(Chainstate::new(dao, cache_size));
        chainstate.clear()?;

        let forest = Arc::new(BlockForest::new());
        forest.add_block(genesis);

        let full_node = Arc::new(FullNodeUtxoService::new(
            chainstate,
            Arc::new(MempoolUtxo::new()),
            params.confirmation_depth,
        ));
        let validator = BlockValidator::new(params.clone());
        let multichain = Arc::new(MultiChainUtxoService::new(
            forest.clone(),
            full_node.clone(),
            Arc::new(BlockUndoStore::new()),
            validator.clone(),
            genesis_hash,
        ));
        let mempool = Arc::new(Mempool::new());
        let reorganizer = Reorganizer::new(multichain.clone(), mempool.clone(), params.min_fee);
        reorganizer.check_and_reorganize(&genesis_hash)?;

        let chain = Self {
            params,
            validator,
            tx_validator: TransactionValidator::new(),
            forest,
            full_node,
            multichain,
            reorganizer,
            mempool,
            archive,
            sender,
            genesis_hash,
            processing: Mutex::new(()),
        };
        chain.replay_archive()?;

        let (tip, height) = chain.main_chain_tip();
        info!(genesis = %genesis_hash, %tip, height, "Blockchain opened");
        Ok(chain)
    }

    /// In-memory node without a network
    pub fn in_memory(params: ChainParams) -> Result<Self, ChainError> {
        let cache_size = NonZeroUsize::new(crate::constants::DEFAULT_CACHE_SIZE)
            .unwrap_or(NonZeroUsize::MIN);
        Self::open(params, None, cache_size, Arc::new(NullMessageSender))
    }

    fn replay_archive(&self) -> Result<(), ChainError> {
        let Some(archive) = &self.archive else {
            return Ok(());
        };
        let blocks = archive.load_all()?;
        if blocks.is_empty() {
            return Ok(());
        }

        info!(blocks = blocks.len(), "Replaying block archive");
        let _guard = self.processing.lock();
        for block in blocks {
            let hash = block.hash();
            if let Err(e) = self.process_block(block, None, false) {
                debug!(block = %hash, error = %e, "Archived block rejected on replay");
            }
        }
        Ok(())
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn forest(&self) -> &Arc<BlockForest> {
        &self.forest
    }

    pub fn full_node(&self) -> &Arc<FullNodeUtxoService> {
        &self.full_node
    }

    pub fn multichain(&self) -> &Arc<MultiChainUtxoService> {
        &self.multichain
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }

    /// Hash and height of the tip the UTXO state reflects
    pub fn main_chain_tip(&self) -> (Hash, u64) {
        self.multichain.main_chain_tip()
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Block, ChainError> {
        self.forest.get_block_by_hash(hash)
    }

    /// Confirmed outputs paying `pkh`
    pub fn get_confirmed_utxos(&self, pkh: &PubKeyHash) -> Result<Vec<Utxo>, ChainError> {
        Ok(self.full_node.chainstate().get_utxos_by_pubkey_hash(pkh)?)
    }

    /// Locator for the current main chain, newest first
    pub fn block_locator(&self) -> Vec<Hash> {
        let (tip, height) = self.main_chain_tip();
        build_block_locator(height, |h| self.forest.ancestor_at_height(&tip, h))
    }

    /// Handle a block received from `from_peer`
    pub fn add_block(&self, block: Block, from_peer: Option<PeerId>) -> Result<BlockStatus, ChainError> {
        let _guard = self.processing.lock();
        self.process_block(block, from_peer, true)
    }

    /// Handle a block found by the local miner
    pub fn add_self_mined_block(&self, block: Block) -> Result<BlockStatus, ChainError> {
        info!(block = %block.hash(), txs = block.transactions.len(), "Submitting mined block");
        self.add_block(block, None)
    }

    fn process_block(
        &self,
        block: Block,
        from_peer: Option<PeerId>,
        archive: bool,
    ) -> Result<BlockStatus, ChainError> {
        let hash = block.hash();
        if self.forest.contains(&hash) {
            return Ok(BlockStatus::Duplicate);
        }

        self.validator.sanity_check(&block)?;
        self.validator.header_only(&block.header, current_timestamp())?;
        self.validator.check_difficulty(&block.header)?;

        if archive {
            if let Some(archive) = &self.archive {
                archive.append(&block)?;
            }
        }

        let parent = *block.prev_hash();
        let connected = self.forest.add_block(block);
        if connected.is_empty() {
            debug!(block = %hash, %parent, "Stored orphan block");
            let locator = self.block_locator();
            self.sender
                .request_missing_block_headers(from_peer, &locator, parent);
            return Ok(BlockStatus::Orphan);
        }

        let mut accepted = Vec::with_capacity(connected.len());
        let mut rejection = None;
        for connected_hash in connected {
            if self.forest.is_invalid(&connected_hash) {
                if connected_hash == hash {
                    warn!(block = %hash, %parent, "Block descends from an invalid block");
                    rejection = Some(ChainError::InvalidBlockParent(hash));
                }
                continue;
            }
            match self.validate_connected(&connected_hash) {
                Ok(()) => accepted.push(connected_hash),
                Err(e) => {
                    warn!(block = %connected_hash, error = %e, "Rejected block");
                    self.forest.mark_invalid(&connected_hash)?;
                    if connected_hash == hash {
                        rejection = Some(e);
                    }
                }
            }
        }

        let tip_changed = self.reorganize_to_best()?;
        if !accepted.is_empty() {
            self.sender.broadcast_added_blocks(&accepted, from_peer);
        }
        if let Some(e) = rejection {
            return Err(e);
        }

        let (tip, height) = self.main_chain_tip();
        debug!(block = %hash, connected = accepted.len(), %tip, height, "Accepted block");
        Ok(BlockStatus::Connected {
            connected: accepted,
            tip_changed,
        })
    }

    /// Full validation of a block that was just connected to genesis
    fn validate_connected(&self, hash: &Hash) -> Result<(), ChainError> {
        let block = self.forest.get_block_by_hash(hash)?;
        let height = self
            .forest
            .get_block_height(hash)
            .ok_or(ChainError::OrphanBlockUnexpected(*hash))?;
        self.validator.full_validation(&block)?;

        let (tip, _) = self.multichain.main_chain_tip();
        if *block.prev_hash() == tip {
            let mut view = self.multichain.view_at(&tip)?;
            self.multichain
                .validate_block_transactions(&block, height, &mut view)?;
        } else {
            self.multichain
                .validate_and_apply_side_chain_block(&block, height)?;
        }
        Ok(())
    }

    /// Reorganize to the forest's best tip, invalidating tips that fail
    /// until one succeeds
    fn reorganize_to_best(&self) -> Result<bool, ChainError> {
        loop {
            let Some((best, _)) = self.forest.main_chain_tip() else {
                return Ok(false);
            };
            match self.reorganizer.check_and_reorganize(&best) {
                Ok(changed) => return Ok(changed),
                Err(e) if best != self.genesis_hash => {
                    warn!(tip = %best, error = %e, "Cannot switch to tip, invalidating it");
                    self.forest.mark_invalid(&best)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Validate `tx` against the main chain and pool it
    ///
    /// Returns `false` when the transaction is already pooled.
    pub fn add_transaction(&self, tx: Transaction, from_peer: Option<PeerId>) -> Result<bool, ChainError> {
        let _guard = self.processing.lock();
        let txid = tx.hash();
        if self.mempool.is_known_transaction_id(&txid) {
            return Ok(false);
        }

        let fee = self
            .tx_validator
            .validate_for_mempool(&tx, self.full_node.as_ref(), self.params.min_fee)
            .map_err(|reason| ChainError::InvalidTransaction { txid, reason })?;
        self.full_node.apply_transaction(&tx, &txid, 0, 0, false)?;
        self.mempool.add_transaction(tx);

        debug!(%txid, fee, pooled = self.mempool.len(), "Accepted transaction");
        self.sender
            .broadcast_inv_exclusionary(&[InvItem::transaction(txid)], from_peer);
        Ok(true)
    }

    pub fn is_known_transaction(&self, txid: &TransactionId) -> bool {
        self.mempool.is_known_transaction_id(txid)
    }

    /// Announce our tip and pooled transactions to a new peer
    pub fn on_peer_connected(&self, peer: PeerId) {
        let (tip, height) = self.main_chain_tip();
        let mut items = vec![InvItem::block(tip)];
        items.extend(
            self.mempool
                .get_all_transaction_hashes()
                .into_iter()
                .map(InvItem::transaction),
        );
        debug!(%peer, height, items = items.len(), "Peer connected");
        self.sender.send_inv(peer, &items);
    }

    /// Flush and close the chainstate
    pub fn close(&self) -> Result<(), ChainError> {
        let _guard = self.processing.lock();
        let chainstate = self.full_node.chainstate();
        chainstate.flush()?;
        chainstate.close()?;
        info!("Blockchain closed");
        Ok(())
    }
}
