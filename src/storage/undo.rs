//! Undo data for blocks committed to the chainstate

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{SpentEntries, UtxoEntry};
use crate::crypto::Hash;
use crate::validation::Outpoint;

/// Entries consumed by each transaction of a committed block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUndo {
    /// Indexed by transaction position in the block
    pub spent: Vec<SpentEntries>,
}

impl BlockUndo {
    pub fn spent_for(&self, tx_index: usize) -> &[(Outpoint, UtxoEntry)] {
        self.spent.get(tx_index).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Default)]
pub struct BlockUndoStore {
    inner: RwLock<HashMap<Hash, BlockUndo>>,
}

impl BlockUndoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, block_hash: Hash, undo: BlockUndo) {
        self.inner.write().insert(block_hash, undo);
    }

    pub fn get(&self, block_hash: &Hash) -> Option<BlockUndo> {
        self.inner.read().get(block_hash).cloned()
    }

    pub fn remove(&self, block_hash: &Hash) -> Option<BlockUndo> {
        self.inner.write().remove(block_hash)
    }

    pub fn contains(&self, block_hash: &Hash) -> bool {
        self.inner.read().contains_key(block_hash)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PubKeyHash;
    use crate::validation::TxOutput;

    #[test]
    fn test_spent_for_out_of_range_is_empty() {
        let outpoint = Outpoint::new(Hash([1; 32]), 0);
        let entry = UtxoEntry::new(TxOutput::new(5, PubKeyHash::default()), 3, false);
        let undo = BlockUndo {
            spent: vec![vec![], vec![(outpoint, entry)]],
        };

        assert!(undo.spent_for(0).is_empty());
        assert_eq!(undo.spent_for(1), &[(outpoint, entry)]);
        assert!(undo.spent_for(9).is_empty());
    }

    #[test]
    fn test_store_roundtrip() {
        let store = BlockUndoStore::new();
        let hash = Hash([2; 32]);
        store.insert(hash, BlockUndo::default());

        assert!(store.contains(&hash));
        assert_eq!(store.get(&hash), Some(BlockUndo::default()));
        assert!(store.remove(&hash).is_some());
        assert!(store.is_empty());
    }
}
