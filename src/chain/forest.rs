//! Block forest store
//!
//! Every received block lives in an arena of nodes linked by parent and
//! child indices. The tree rooted at genesis holds the connected blocks; any
//! other root is an orphan waiting for its parent. Connected nodes carry a
//! height and the accumulated work of their chain, orphans carry neither.
//!
//! The main-chain tip is the valid node with the most accumulated work. On
//! equal work the earliest received node wins; callers must not rely on
//! which of several tied tips is returned.

use std::collections::{HashMap, HashSet};

use num_bigint::BigUint;
use parking_lot::RwLock;

use super::ChainError;
use crate::consensus::{block_work, Block};
use crate::crypto::Hash;

/// Index of a node in the arena
pub type NodeId = usize;

#[derive(Debug)]
struct BlockNode {
    block: Block,
    hash: Hash,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    height: Option<u64>,
    accumulated_work: Option<BigUint>,
    invalid: bool,
}

/// A stored block and where it sits in the forest
#[derive(Debug, Clone)]
pub struct BlockMetadata {
    pub block: Block,
    pub hash: Hash,
    /// `None` for orphans
    pub height: Option<u64>,
    pub is_main_chain: bool,
    pub is_invalid: bool,
}

#[derive(Debug, Default)]
struct ForestInner {
    nodes: Vec<BlockNode>,
    index: HashMap<Hash, NodeId>,
    roots: HashSet<NodeId>,
    leaves: HashSet<NodeId>,
    /// Orphan roots keyed by the missing parent hash
    orphans_by_parent: HashMap<Hash, Vec<NodeId>>,
    genesis: Option<NodeId>,
    best: Option<NodeId>,
}

impl ForestInner {
    fn lookup(&self, hash: &Hash) -> Result<NodeId, ChainError> {
        self.index.get(hash).copied().ok_or(ChainError::NotFound(*hash))
    }

    fn insert(&mut self, block: Block) -> Vec<Hash> {
        let hash = block.hash();
        if self.index.contains_key(&hash) {
            return Vec::new();
        }

        let prev = block.header.prev_hash;
        let parent = self.index.get(&prev).copied();
        let id = self.nodes.len();
        self.nodes.push(BlockNode {
            block,
            hash,
            parent,
            children: Vec::new(),
            height: None,
            accumulated_work: None,
            invalid: false,
        });
        self.index.insert(hash, id);
        self.leaves.insert(id);

        // Orphans that were waiting for this block become its children
        if let Some(waiting) = self.orphans_by_parent.remove(&hash) {
            for child in waiting {
                self.roots.remove(&child);
                self.nodes[child].parent = Some(id);
                self.nodes[id].children.push(child);
            }
            if !self.nodes[id].children.is_empty() {
                self.leaves.remove(&id);
            }
        }

        match parent {
            Some(p) => {
                self.nodes[p].children.push(id);
                self.leaves.remove(&p);
                if self.nodes[p].height.is_some() {
                    self.connect_subtree(id)
                } else {
                    Vec::new()
                }
            }
            None if prev.is_zero() && self.genesis.is_none() => {
                self.genesis = Some(id);
                self.roots.insert(id);
                self.connect_subtree(id)
            }
            None => {
                self.roots.insert(id);
                self.orphans_by_parent.entry(prev).or_default().push(id);
                Vec::new()
            }
        }
    }

    /// Assign height and work to `start` and everything below it, parent first
    fn connect_subtree(&mut self, start: NodeId) -> Vec<Hash> {
        let mut connected = Vec::new();
        let mut stack = vec![start];

        while let Some(id) = stack.pop() {
            let own_work = block_work(self.nodes[id].block.header.difficulty);
            let (height, work, parent_invalid) = match self.nodes[id].parent {
                Some(p) => {
                    let parent = &self.nodes[p];
                    let (Some(height), Some(work)) = (parent.height, &parent.accumulated_work)
                    else {
                        continue;
                    };
                    (height + 1, work + own_work, parent.invalid)
                }
                None => (0, own_work, false),
            };

            let node = &mut self.nodes[id];
            node.height = Some(height);
            node.accumulated_work = Some(work);
            node.invalid |= parent_invalid;
            connected.push(node.hash);

            self.consider_best(id);
            stack.extend(self.nodes[id].children.iter().rev().copied());
        }

        connected
    }

    fn consider_best(&mut self, id: NodeId) {
        let node = &self.nodes[id];
        if node.invalid {
            return;
        }
        let Some(work) = &node.accumulated_work else {
            return;
        };
        let better = match self.best {
            None => true,
            Some(best) => self.nodes[best]
                .accumulated_work
                .as_ref()
                .map_or(true, |best_work| work > best_work),
        };
        if better {
            self.best = Some(id);
        }
    }

    fn recompute_best(&mut self) {
        self.best = None;
        for id in 0..self.nodes.len() {
            self.consider_best(id);
        }
    }

    fn ancestor_at(&self, mut id: NodeId, height: u64) -> Option<NodeId> {
        loop {
            let node = &self.nodes[id];
            match node.height {
                Some(h) if h == height => return Some(id),
                Some(h) if h > height => id = node.parent?,
                _ => return None,
            }
        }
    }

    fn is_main(&self, id: NodeId) -> bool {
        let (Some(best), Some(height)) = (self.best, self.nodes[id].height) else {
            return false;
        };
        self.ancestor_at(best, height) == Some(id)
    }

    fn fork_point(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let (mut a, mut b) = (a, b);
        loop {
            if a == b {
                return Some(a);
            }
            let (ha, hb) = (self.nodes[a].height?, self.nodes[b].height?);
            if ha >= hb {
                a = self.nodes[a].parent?;
            }
            if hb >= ha {
                b = self.nodes[b].parent?;
            }
        }
    }

    fn height_of(&self, id: NodeId) -> Result<u64, ChainError> {
        self.nodes[id]
            .height
            .ok_or(ChainError::OrphanBlockUnexpected(self.nodes[id].hash))
    }
}

/// Thread-safe forest of received blocks
#[derive(Debug, Default)]
pub struct BlockForest {
    inner: RwLock<ForestInner>,
}

impl BlockForest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `block`
    ///
    /// Returns the hashes newly connected to genesis: the block itself and
    /// any orphan descendants it adopts, parents before children. Orphans
    /// and already-known blocks return an empty list.
    pub fn add_block(&self, block: Block) -> Vec<Hash> {
        self.inner.write().insert(block)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.read().index.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the block is not connected to genesis
    pub fn is_orphan_block(&self, hash: &Hash) -> Result<bool, ChainError> {
        let inner = self.inner.read();
        let id = inner.lookup(hash)?;
        Ok(inner.nodes[id].height.is_none())
    }

    pub fn is_part_of_main_chain(&self, hash: &Hash) -> bool {
        let inner = self.inner.read();
        inner.index.get(hash).is_some_and(|id| inner.is_main(*id))
    }

    /// Copy of a stored block, orphans included
    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Block, ChainError> {
        let inner = self.inner.read();
        let id = inner.lookup(hash)?;
        Ok(inner.nodes[id].block.clone())
    }

    /// Height of a connected block, `None` for orphans and unknown blocks
    pub fn get_block_height(&self, hash: &Hash) -> Option<u64> {
        let inner = self.inner.read();
        inner.index.get(hash).and_then(|id| inner.nodes[*id].height)
    }

    pub fn get_accumulated_work(&self, hash: &Hash) -> Option<BigUint> {
        let inner = self.inner.read();
        inner
            .index
            .get(hash)
            .and_then(|id| inner.nodes[*id].accumulated_work.clone())
    }

    pub fn is_invalid(&self, hash: &Hash) -> bool {
        let inner = self.inner.read();
        inner.index.get(hash).is_some_and(|id| inner.nodes[*id].invalid)
    }

    /// Connected blocks at `height` on any chain
    ///
    /// Walks up from the leaves, so recent heights are cheap.
    pub fn get_blocks_by_height(&self, height: u64) -> Vec<Block> {
        let inner = self.inner.read();
        let mut found: Vec<NodeId> = Vec::new();
        let mut seen = HashSet::new();

        for &leaf in &inner.leaves {
            if let Some(id) = inner.ancestor_at(leaf, height) {
                if seen.insert(id) {
                    found.push(id);
                }
            }
        }

        found.sort_unstable();
        found
            .into_iter()
            .map(|id| inner.nodes[id].block.clone())
            .collect()
    }

    /// Maximum height among connected leaves
    pub fn get_current_height(&self) -> u64 {
        let inner = self.inner.read();
        inner
            .leaves
            .iter()
            .filter_map(|id| inner.nodes[*id].height)
            .max()
            .unwrap_or(0)
    }

    pub fn get_main_chain_tip(&self) -> Option<Block> {
        let inner = self.inner.read();
        inner.best.map(|id| inner.nodes[id].block.clone())
    }

    /// Hash and height of the main-chain tip
    pub fn main_chain_tip(&self) -> Option<(Hash, u64)> {
        let inner = self.inner.read();
        let id = inner.best?;
        Some((inner.nodes[id].hash, inner.nodes[id].height?))
    }

    pub fn genesis_hash(&self) -> Option<Hash> {
        let inner = self.inner.read();
        inner.genesis.map(|id| inner.nodes[id].hash)
    }

    /// Every stored block in arrival order
    pub fn get_all_blocks_with_metadata(&self) -> Vec<BlockMetadata> {
        let inner = self.inner.read();
        inner
            .nodes
            .iter()
            .enumerate()
            .map(|(id, node)| BlockMetadata {
                block: node.block.clone(),
                hash: node.hash,
                height: node.height,
                is_main_chain: inner.is_main(id),
                is_invalid: node.invalid,
            })
            .collect()
    }

    /// Exclude a block and all of its descendants from tip selection
    pub fn mark_invalid(&self, hash: &Hash) -> Result<(), ChainError> {
        let mut inner = self.inner.write();
        let start = inner.lookup(hash)?;

        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            inner.nodes[id].invalid = true;
            stack.extend(inner.nodes[id].children.iter().copied());
        }

        inner.recompute_best();
        Ok(())
    }

    /// Lowest common ancestor of two connected blocks
    pub fn find_fork_point(&self, a: &Hash, b: &Hash) -> Result<Hash, ChainError> {
        let inner = self.inner.read();
        let (ia, ib) = (inner.lookup(a)?, inner.lookup(b)?);
        inner
            .fork_point(ia, ib)
            .map(|id| inner.nodes[id].hash)
            .ok_or(ChainError::ForkPointNotFound(*a, *b))
    }

    /// Ancestor of `tip` at `height` (the tip itself at its own height)
    pub fn ancestor_at_height(&self, tip: &Hash, height: u64) -> Option<Hash> {
        let inner = self.inner.read();
        let id = *inner.index.get(tip)?;
        inner.ancestor_at(id, height).map(|a| inner.nodes[a].hash)
    }

    /// Whether `ancestor` lies on the path from `tip` to genesis
    pub fn is_ancestor(&self, ancestor: &Hash, tip: &Hash) -> bool {
        let inner = self.inner.read();
        let (Some(&a), Some(&t)) = (inner.index.get(ancestor), inner.index.get(tip)) else {
            return false;
        };
        match inner.nodes[a].height {
            Some(height) => inner.ancestor_at(t, height) == Some(a),
            None => false,
        }
    }

    /// Blocks of the chain ending at `tip` with heights in `(from, to]`,
    /// paired with their heights, parent first
    pub fn chain_segment(
        &self,
        tip: &Hash,
        from_exclusive: u64,
        to_inclusive: u64,
    ) -> Result<Vec<(Block, u64)>, ChainError> {
        let inner = self.inner.read();
        let tip_id = inner.lookup(tip)?;
        if to_inclusive <= from_exclusive {
            return Ok(Vec::new());
        }

        let mut id = inner
            .ancestor_at(tip_id, to_inclusive)
            .ok_or(ChainError::NotFound(*tip))?;
        let mut segment = Vec::new();
        loop {
            let height = inner.height_of(id)?;
            if height <= from_exclusive {
                break;
            }
            segment.push((inner.nodes[id].block.clone(), height));
            match inner.nodes[id].parent {
                Some(parent) => id = parent,
                None => break,
            }
        }

        segment.reverse();
        Ok(segment)
    }
}
