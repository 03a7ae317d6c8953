//! Side-chain deltas
//!
//! A [`SideChainDelta`] is the net effect of a run of blocks on top of the
//! UTXO state at its fork point: outputs it created and outputs it consumed
//! from below. Deltas are cumulative, so the delta stored for a side block
//! covers every block from the fork point up to and including it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::consensus::Block;
use crate::crypto::Hash;
use crate::storage::{BlockUndo, UtxoEntry, UtxoError, UtxoProvider};
use crate::validation::{Outpoint, Transaction};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SideChainDelta {
    pub fork_point: Hash,
    pub chain_tip: Hash,
    pub parent_tip: Hash,
    pub added: HashMap<Outpoint, UtxoEntry>,
    pub spent: HashSet<Outpoint>,
    pub block_count: u64,
}

impl SideChainDelta {
    /// Empty delta sitting on `fork_point`
    pub fn new(fork_point: Hash) -> Self {
        Self {
            fork_point,
            chain_tip: fork_point,
            parent_tip: fork_point,
            ..Self::default()
        }
    }

    /// `Some` when this delta decides the outpoint, `None` to fall through
    pub fn lookup(&self, outpoint: &Outpoint) -> Option<Result<UtxoEntry, UtxoError>> {
        if self.spent.contains(outpoint) {
            return Some(Err(UtxoError::AlreadySpent(*outpoint)));
        }
        self.added.get(outpoint).map(|entry| Ok(*entry))
    }

    /// Fold a view's net effect into the delta
    pub fn merge_view(
        &mut self,
        added: HashMap<Outpoint, UtxoEntry>,
        spent: HashSet<Outpoint>,
    ) {
        for outpoint in spent {
            self.consume(outpoint);
        }
        self.added.extend(added);
    }

    /// Move the tip forward by one block
    pub fn advance(&mut self, block_hash: Hash) {
        self.parent_tip = self.chain_tip;
        self.chain_tip = block_hash;
        self.block_count += 1;
    }

    /// Apply an already validated block without existence checks
    pub fn replay_block(&mut self, block: &Block, height: u64) {
        for (index, tx) in block.transactions.iter().enumerate() {
            self.replay_tx(tx, height, index == 0);
        }
    }

    fn replay_tx(&mut self, tx: &Transaction, height: u64, is_coinbase: bool) {
        if !is_coinbase {
            for input in &tx.inputs {
                self.consume(input.outpoint());
            }
        }
        let txid = tx.hash();
        for (i, output) in tx.outputs.iter().enumerate() {
            self.added.insert(
                Outpoint::new(txid, i as u32),
                UtxoEntry::new(*output, height, is_coinbase && i == 0),
            );
        }
    }

    /// Undo a block that is part of the state below this delta
    ///
    /// `undo` holds the entries the block consumed when it was committed.
    pub fn rollback_block(&mut self, block: &Block, undo: &BlockUndo) {
        for (index, tx) in block.transactions.iter().enumerate().rev() {
            let txid = tx.hash();
            for i in 0..tx.outputs.len() {
                self.consume(Outpoint::new(txid, i as u32));
            }
            for (outpoint, entry) in undo.spent_for(index) {
                self.spent.remove(outpoint);
                self.added.insert(*outpoint, *entry);
            }
        }
    }

    fn consume(&mut self, outpoint: Outpoint) {
        // Created and consumed on top of the fork point: net zero
        if self.added.remove(&outpoint).is_none() {
            self.spent.insert(outpoint);
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    deltas: HashMap<Hash, Arc<SideChainDelta>>,
    by_fork_point: HashMap<Hash, HashSet<Hash>>,
    by_parent: HashMap<Hash, HashSet<Hash>>,
}

impl StoreInner {
    fn remove(&mut self, tip: &Hash) -> Option<Arc<SideChainDelta>> {
        let delta = self.deltas.remove(tip)?;
        Self::unindex(&mut self.by_fork_point, &delta.fork_point, tip);
        Self::unindex(&mut self.by_parent, &delta.parent_tip, tip);
        Some(delta)
    }

    fn unindex(index: &mut HashMap<Hash, HashSet<Hash>>, key: &Hash, tip: &Hash) {
        if let Some(tips) = index.get_mut(key) {
            tips.remove(tip);
            if tips.is_empty() {
                index.remove(key);
            }
        }
    }
}

fn sorted(tips: Option<&HashSet<Hash>>) -> Vec<Hash> {
    let mut tips: Vec<Hash> = tips.map(|t| t.iter().copied().collect()).unwrap_or_default();
    tips.sort_unstable();
    tips
}

/// Deltas keyed by chain tip, indexed by fork point and by parent tip
#[derive(Debug, Default)]
pub struct SideChainDeltaStore {
    inner: RwLock<StoreInner>,
}

impl SideChainDeltaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `delta` under its chain tip, replacing any previous one
    pub fn insert(&self, delta: SideChainDelta) {
        let mut inner = self.inner.write();
        let tip = delta.chain_tip;
        inner.remove(&tip);
        inner
            .by_fork_point
            .entry(delta.fork_point)
            .or_default()
            .insert(tip);
        inner.by_parent.entry(delta.parent_tip).or_default().insert(tip);
        inner.deltas.insert(tip, Arc::new(delta));
    }

    pub fn get(&self, tip: &Hash) -> Option<Arc<SideChainDelta>> {
        self.inner.read().deltas.get(tip).cloned()
    }

    pub fn contains(&self, tip: &Hash) -> bool {
        self.inner.read().deltas.contains_key(tip)
    }

    pub fn remove(&self, tip: &Hash) -> Option<Arc<SideChainDelta>> {
        self.inner.write().remove(tip)
    }

    /// Drop every delta forked at `fork_point`, returning how many went
    pub fn prune_fork_point(&self, fork_point: &Hash) -> usize {
        let mut inner = self.inner.write();
        let tips = sorted(inner.by_fork_point.get(fork_point));
        for tip in &tips {
            inner.remove(tip);
        }
        tips.len()
    }

    /// Every fork point with at least one stored delta
    pub fn fork_points(&self) -> Vec<Hash> {
        let mut points: Vec<Hash> = self.inner.read().by_fork_point.keys().copied().collect();
        points.sort_unstable();
        points
    }

    pub fn tips_for_fork_point(&self, fork_point: &Hash) -> Vec<Hash> {
        sorted(self.inner.read().by_fork_point.get(fork_point))
    }

    pub fn children_of(&self, parent_tip: &Hash) -> Vec<Hash> {
        sorted(self.inner.read().by_parent.get(parent_tip))
    }

    pub fn len(&self) -> usize {
        self.inner.read().deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A base provider seen through one delta
pub struct DeltaBaseProvider {
    base: Arc<dyn UtxoProvider>,
    delta: Arc<SideChainDelta>,
}

impl DeltaBaseProvider {
    pub fn new(base: Arc<dyn UtxoProvider>, delta: Arc<SideChainDelta>) -> Self {
        Self { base, delta }
    }
}

impl UtxoProvider for DeltaBaseProvider {
    fn get(&self, outpoint: &Outpoint) -> Result<UtxoEntry, UtxoError> {
        match self.delta.lookup(outpoint) {
            Some(result) => result,
            None => self.base.get(outpoint),
        }
    }
}

/// A base provider seen through a stack of deltas, topmost first
pub struct ChainedDeltaBaseProvider {
    base: Arc<dyn UtxoProvider>,
    deltas: Vec<Arc<SideChainDelta>>,
}

impl ChainedDeltaBaseProvider {
    pub fn new(base: Arc<dyn UtxoProvider>, deltas: Vec<Arc<SideChainDelta>>) -> Self {
        Self { base, deltas }
    }

    pub fn depth(&self) -> usize {
        self.deltas.len()
    }
}

impl UtxoProvider for ChainedDeltaBaseProvider {
    fn get(&self, outpoint: &Outpoint) -> Result<UtxoEntry, UtxoError> {
        for delta in &self.deltas {
            if let Some(result) = delta.lookup(outpoint) {
                return result;
            }
        }
        self.base.get(outpoint)
    }
}
