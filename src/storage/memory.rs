//! In-memory [`UtxoEntryDao`], used for ephemeral nodes and tests

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::{StorageError, Utxo, UtxoEntry, UtxoEntryDao};
use crate::crypto::PubKeyHash;
use crate::validation::Outpoint;

#[derive(Default)]
struct MemoryTables {
    utxos: BTreeMap<Outpoint, UtxoEntry>,
    index: HashMap<PubKeyHash, BTreeSet<Outpoint>>,
}

#[derive(Default)]
pub struct MemoryUtxoDao {
    inner: RwLock<MemoryTables>,
    closed: AtomicBool,
}

impl MemoryUtxoDao {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl MemoryTables {
    fn unindex(&mut self, pkh: &PubKeyHash, outpoint: &Outpoint) {
        if let Some(set) = self.index.get_mut(pkh) {
            set.remove(outpoint);
            if set.is_empty() {
                self.index.remove(pkh);
            }
        }
    }
}

impl UtxoEntryDao for MemoryUtxoDao {
    fn update(&self, outpoint: &Outpoint, entry: &UtxoEntry) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut guard = self.inner.write();
        if let Some(previous) = guard.utxos.insert(*outpoint, *entry) {
            guard.unindex(previous.pubkey_hash(), outpoint);
        }
        guard
            .index
            .entry(*entry.pubkey_hash())
            .or_default()
            .insert(*outpoint);
        Ok(())
    }

    fn delete(&self, outpoint: &Outpoint) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let mut guard = self.inner.write();
        match guard.utxos.remove(outpoint) {
            Some(previous) => {
                guard.unindex(previous.pubkey_hash(), outpoint);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn find(&self, outpoint: &Outpoint) -> Result<Option<UtxoEntry>, StorageError> {
        self.ensure_open()?;
        Ok(self.inner.read().utxos.get(outpoint).copied())
    }

    fn find_by_pubkey_hash(&self, pkh: &PubKeyHash) -> Result<Vec<Utxo>, StorageError> {
        self.ensure_open()?;
        let guard = self.inner.read();
        let Some(outpoints) = guard.index.get(pkh) else {
            return Ok(Vec::new());
        };
        outpoints
            .iter()
            .map(|outpoint| {
                let entry = guard.utxos.get(outpoint).copied().ok_or_else(|| {
                    StorageError::Corrupt(format!("Index points at missing UTXO {outpoint}"))
                })?;
                Ok(Utxo {
                    outpoint: *outpoint,
                    entry,
                })
            })
            .collect()
    }

    fn persist(&self) -> Result<(), StorageError> {
        self.ensure_open()
    }

    fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        *self.inner.write() = MemoryTables::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash;
    use crate::validation::TxOutput;

    #[test]
    fn test_index_follows_overwrite_and_delete() {
        let dao = MemoryUtxoDao::new();
        let outpoint = Outpoint::new(Hash([1; 32]), 0);
        let a = PubKeyHash([0xaa; 20]);
        let b = PubKeyHash([0xbb; 20]);

        dao.update(&outpoint, &UtxoEntry::new(TxOutput::new(1, a), 1, false))
            .unwrap();
        dao.update(&outpoint, &UtxoEntry::new(TxOutput::new(1, b), 1, false))
            .unwrap();

        assert!(dao.find_by_pubkey_hash(&a).unwrap().is_empty());
        assert_eq!(dao.find_by_pubkey_hash(&b).unwrap().len(), 1);

        assert!(dao.delete(&outpoint).unwrap());
        assert!(dao.find_by_pubkey_hash(&b).unwrap().is_empty());
    }

    #[test]
    fn test_close() {
        let dao = MemoryUtxoDao::new();
        dao.close().unwrap();
        assert!(matches!(dao.persist(), Err(StorageError::Closed)));
    }
}
