//! Chainstate: the persistent set of confirmed UTXOs
//!
//! A [`UtxoEntryDao`] fronted by an LRU of decoded entries. Reads consult the
//! cache first and populate it on a miss; writes go to the store first and
//! then to the cache, so a failed write never leaves a cached ghost.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{StorageError, Utxo, UtxoEntry, UtxoEntryDao, UtxoError, UtxoProvider};
use crate::constants::DEFAULT_CACHE_SIZE;
use crate::crypto::PubKeyHash;
use crate::validation::Outpoint;

/// Confirmed UTXO set
pub struct Chainstate {
    dao: Box<dyn UtxoEntryDao>,
    cache: Mutex<LruCache<Outpoint, UtxoEntry>>,
    closed: AtomicBool,
}

impl Chainstate {
    /// Create a chainstate over `dao` caching up to `cache_size` entries
    pub fn new(dao: Box<dyn UtxoEntryDao>, cache_size: NonZeroUsize) -> Self {
        info!(cache_size = cache_size.get(), "Chainstate opened");
        Self {
            dao,
            cache: Mutex::new(LruCache::new(cache_size)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_default_cache(dao: Box<dyn UtxoEntryDao>) -> Self {
        let cache_size = NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self::new(dao, cache_size)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Look up a confirmed UTXO
    pub fn get(&self, outpoint: &Outpoint) -> Result<UtxoEntry, UtxoError> {
        self.ensure_open()?;
        if let Some(entry) = self.cache.lock().get(outpoint) {
            return Ok(*entry);
        }

        let entry = self
            .dao
            .find(outpoint)?
            .ok_or(UtxoError::NotFound(*outpoint))?;
        self.cache.lock().put(*outpoint, entry);
        Ok(entry)
    }

    /// Insert or overwrite a confirmed UTXO
    pub fn add(&self, outpoint: &Outpoint, entry: UtxoEntry) -> Result<(), UtxoError> {
        self.ensure_open()?;
        self.dao.update(outpoint, &entry)?;
        self.cache.lock().put(*outpoint, entry);
        Ok(())
    }

    /// Remove a UTXO; removing an absent outpoint is not an error
    pub fn remove(&self, outpoint: &Outpoint) -> Result<(), UtxoError> {
        self.ensure_open()?;
        if !self.dao.delete(outpoint)? {
            debug!(%outpoint, "Removing absent chainstate UTXO");
        }
        self.cache.lock().pop(outpoint);
        Ok(())
    }

    /// Every confirmed UTXO paying `pkh`
    pub fn get_utxos_by_pubkey_hash(&self, pkh: &PubKeyHash) -> Result<Vec<Utxo>, UtxoError> {
        self.ensure_open()?;
        Ok(self.dao.find_by_pubkey_hash(pkh)?)
    }

    /// Persist pending writes
    pub fn flush(&self) -> Result<(), UtxoError> {
        self.ensure_open()?;
        Ok(self.dao.persist()?)
    }

    /// Drop every entry, used before replaying the block archive
    pub fn clear(&self) -> Result<(), UtxoError> {
        self.ensure_open()?;
        self.dao.clear()?;
        self.cache.lock().clear();
        Ok(())
    }

    /// Close the store and drop the cache; later calls fail with `Closed`
    pub fn close(&self) -> Result<(), UtxoError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cache.lock().clear();
        self.dao.close()?;
        info!("Chainstate closed");
        Ok(())
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}

impl UtxoProvider for Chainstate {
    fn get(&self, outpoint: &Outpoint) -> Result<UtxoEntry, UtxoError> {
        Chainstate::get(self, outpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash;
    use crate::storage::{ChainDb, MemoryUtxoDao};
    use crate::validation::TxOutput;

    fn entry(value: u64) -> UtxoEntry {
        UtxoEntry::new(TxOutput::new(value, PubKeyHash([0xab; 20])), 100, true)
    }

    fn outpoint(n: u8) -> Outpoint {
        Outpoint::new(Hash([n; 32]), 0)
    }

    #[test]
    fn test_add_get_remove() {
        let db = ChainDb::temporary().unwrap();
        let chainstate = Chainstate::with_default_cache(Box::new(db.utxo_dao()));

        chainstate.add(&outpoint(1), entry(5000)).unwrap();
        let fetched = chainstate.get(&outpoint(1)).unwrap();
        assert_eq!(fetched.to_bytes(), entry(5000).to_bytes());

        chainstate.remove(&outpoint(1)).unwrap();
        assert!(matches!(
            chainstate.get(&outpoint(1)),
            Err(UtxoError::NotFound(_))
        ));

        // Removing again is tolerated
        chainstate.remove(&outpoint(1)).unwrap();
    }

    #[test]
    fn test_cache_eviction_falls_back_to_store() {
        let cache_size = NonZeroUsize::new(2).unwrap();
        let chainstate = Chainstate::new(Box::new(MemoryUtxoDao::new()), cache_size);

        for n in 0..5 {
            chainstate.add(&outpoint(n), entry(n as u64)).unwrap();
        }
        assert_eq!(chainstate.cached_len(), 2);

        for n in 0..5 {
            assert_eq!(chainstate.get(&outpoint(n)).unwrap().value(), n as u64);
        }
    }

    #[test]
    fn test_address_query() {
        let chainstate = Chainstate::with_default_cache(Box::new(MemoryUtxoDao::new()));
        chainstate.add(&outpoint(1), entry(10)).unwrap();
        chainstate.add(&outpoint(2), entry(20)).unwrap();

        let utxos = chainstate
            .get_utxos_by_pubkey_hash(&PubKeyHash([0xab; 20]))
            .unwrap();
        assert_eq!(utxos.len(), 2);
        assert!(chainstate
            .get_utxos_by_pubkey_hash(&PubKeyHash([0xcd; 20]))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_close_rejects_later_calls() {
        let chainstate = Chainstate::with_default_cache(Box::new(MemoryUtxoDao::new()));
        chainstate.add(&outpoint(1), entry(10)).unwrap();
        chainstate.close().unwrap();

        assert!(matches!(
            chainstate.get(&outpoint(1)),
            Err(UtxoError::Storage(StorageError::Closed))
        ));
        // Second close is a no-op
        chainstate.close().unwrap();
    }
}
