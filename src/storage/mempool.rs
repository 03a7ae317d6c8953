//! Unconfirmed UTXO layer
//!
//! Holds outputs created by unconfirmed transactions and spend markers for
//! chainstate outputs those transactions consume. Both collections sit
//! behind a single lock so a spend and its marker are never observed apart.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use super::{UtxoEntry, UtxoError, UtxoProvider};
use crate::validation::Outpoint;

#[derive(Debug, Default)]
struct MempoolTables {
    utxos: HashMap<Outpoint, UtxoEntry>,
    spent: HashSet<Outpoint>,
}

/// In-memory pool of unconfirmed outputs
#[derive(Debug, Default)]
pub struct MempoolUtxo {
    inner: RwLock<MempoolTables>,
}

impl MempoolUtxo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an unconfirmed output, clearing any spend marker on it
    pub fn add(&self, outpoint: Outpoint, entry: UtxoEntry) {
        let mut guard = self.inner.write();
        guard.spent.remove(&outpoint);
        guard.utxos.insert(outpoint, entry);
    }

    /// Delete an unconfirmed output; spend markers are left alone
    pub fn remove(&self, outpoint: &Outpoint) -> Option<UtxoEntry> {
        self.inner.write().utxos.remove(outpoint)
    }

    /// Consume `outpoint`
    ///
    /// An unconfirmed output is simply deleted. Anything else is assumed to
    /// live in the chainstate and gets a spend marker.
    pub fn mark_spent(&self, outpoint: Outpoint) {
        let mut guard = self.inner.write();
        if guard.utxos.remove(&outpoint).is_none() {
            guard.spent.insert(outpoint);
        }
    }

    pub fn unmark_spent(&self, outpoint: &Outpoint) -> bool {
        self.inner.write().spent.remove(outpoint)
    }

    pub fn is_spent(&self, outpoint: &Outpoint) -> bool {
        self.inner.read().spent.contains(outpoint)
    }

    pub fn contains(&self, outpoint: &Outpoint) -> bool {
        self.inner.read().utxos.contains_key(outpoint)
    }

    pub fn get(&self, outpoint: &Outpoint) -> Option<UtxoEntry> {
        self.inner.read().utxos.get(outpoint).copied()
    }

    /// Empty both collections
    pub fn clear(&self) {
        let mut guard = self.inner.write();
        guard.utxos.clear();
        guard.spent.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spent_len(&self) -> usize {
        self.inner.read().spent.len()
    }
}

impl UtxoProvider for MempoolUtxo {
    fn get(&self, outpoint: &Outpoint) -> Result<UtxoEntry, UtxoError> {
        let guard = self.inner.read();
        if guard.spent.contains(outpoint) {
            return Err(UtxoError::AlreadySpent(*outpoint));
        }
        guard
            .utxos
            .get(outpoint)
            .copied()
            .ok_or(UtxoError::NotFound(*outpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Hash, PubKeyHash};
    use crate::validation::TxOutput;

    fn entry(value: u64) -> UtxoEntry {
        UtxoEntry::new(TxOutput::new(value, PubKeyHash::default()), 0, false)
    }

    fn outpoint(n: u8) -> Outpoint {
        Outpoint::new(Hash([n; 32]), 0)
    }

    #[test]
    fn test_mark_spent_unconfirmed_deletes() {
        let pool = MempoolUtxo::new();
        pool.add(outpoint(1), entry(10));
        pool.mark_spent(outpoint(1));

        assert!(!pool.contains(&outpoint(1)));
        assert!(!pool.is_spent(&outpoint(1)));
    }

    #[test]
    fn test_mark_spent_confirmed_records_marker() {
        let pool = MempoolUtxo::new();
        pool.mark_spent(outpoint(2));

        assert!(pool.is_spent(&outpoint(2)));
        assert!(matches!(
            UtxoProvider::get(&pool, &outpoint(2)),
            Err(UtxoError::AlreadySpent(_))
        ));
    }

    #[test]
    fn test_add_clears_marker() {
        let pool = MempoolUtxo::new();
        pool.mark_spent(outpoint(3));
        pool.add(outpoint(3), entry(5));

        assert!(!pool.is_spent(&outpoint(3)));
        assert_eq!(pool.get(&outpoint(3)), Some(entry(5)));
    }

    #[test]
    fn test_remove_leaves_marker() {
        let pool = MempoolUtxo::new();
        pool.mark_spent(outpoint(4));
        assert_eq!(pool.remove(&outpoint(4)), None);
        assert!(pool.is_spent(&outpoint(4)));

        assert!(pool.unmark_spent(&outpoint(4)));
        assert!(!pool.is_spent(&outpoint(4)));
    }

    #[test]
    fn test_clear() {
        let pool = MempoolUtxo::new();
        pool.add(outpoint(1), entry(1));
        pool.mark_spent(outpoint(2));
        pool.clear();

        assert!(pool.is_empty());
        assert_eq!(pool.spent_len(), 0);
    }
}
