//! Database persistence layer using Sled
//!
//! Three trees live in one sled database:
//! - `utxos`: 36-byte outpoint key -> 37-byte [`UtxoEntry`]
//! - `utxo_index`: 20-byte pubkey hash -> concatenated outpoint keys
//! - `blocks`: big-endian arrival sequence -> bincode [`Block`]
//!
//! The primary and index trees are always written in one multi-tree
//! transaction so the secondary index never drifts from the entries.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};
use thiserror::Error;
use tracing::info;

use super::{Utxo, UtxoEntry};
use crate::consensus::Block;
use crate::crypto::PubKeyHash;
use crate::validation::{Outpoint, OUTPOINT_KEY_LEN};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("Store is closed")]
    Closed,
}

impl From<TransactionError<StorageError>> for StorageError {
    fn from(err: TransactionError<StorageError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StorageError::Sled(e),
        }
    }
}

/// Key-value access for confirmed UTXO entries
///
/// Implementations keep a secondary index by pubkey hash that is updated
/// atomically with every write.
pub trait UtxoEntryDao: Send + Sync {
    /// Insert or overwrite an entry
    fn update(&self, outpoint: &Outpoint, entry: &UtxoEntry) -> Result<(), StorageError>;

    /// Delete an entry, returning whether it existed
    fn delete(&self, outpoint: &Outpoint) -> Result<bool, StorageError>;

    fn find(&self, outpoint: &Outpoint) -> Result<Option<UtxoEntry>, StorageError>;

    /// All entries paying `pkh`, resolved through the secondary index
    fn find_by_pubkey_hash(&self, pkh: &PubKeyHash) -> Result<Vec<Utxo>, StorageError>;

    /// Flush pending writes to durable storage
    fn persist(&self) -> Result<(), StorageError>;

    fn close(&self) -> Result<(), StorageError>;

    /// Drop every entry and index record
    fn clear(&self) -> Result<(), StorageError>;
}

/// Database wrapper
#[derive(Debug, Clone)]
pub struct ChainDb {
    db: Db,
    utxos_tree: Tree,
    index_tree: Tree,
    blocks_tree: Tree,
}

impl ChainDb {
    /// Open or create the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened chain database");
        Self::from_db(db)
    }

    /// A database that is deleted when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let utxos_tree = db.open_tree("utxos")?;
        let index_tree = db.open_tree("utxo_index")?;
        let blocks_tree = db.open_tree("blocks")?;

        Ok(Self {
            db,
            utxos_tree,
            index_tree,
            blocks_tree,
        })
    }

    /// UTXO DAO over the `utxos` and `utxo_index` trees
    pub fn utxo_dao(&self) -> SledUtxoDao {
        SledUtxoDao {
            db: self.db.clone(),
            utxos_tree: self.utxos_tree.clone(),
            index_tree: self.index_tree.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Archive of every block accepted into the forest
    pub fn block_archive(&self) -> BlockArchive {
        BlockArchive {
            db: self.db.clone(),
            blocks_tree: self.blocks_tree.clone(),
        }
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// sled-backed [`UtxoEntryDao`]
#[derive(Debug, Clone)]
pub struct SledUtxoDao {
    db: Db,
    utxos_tree: Tree,
    index_tree: Tree,
    closed: Arc<AtomicBool>,
}

impl SledUtxoDao {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

type TxResult<T> = Result<T, ConflictableTransactionError<StorageError>>;

fn abort(err: StorageError) -> ConflictableTransactionError<StorageError> {
    ConflictableTransactionError::Abort(err)
}

fn index_add(index: &TransactionalTree, pkh: &PubKeyHash, key: &[u8]) -> TxResult<()> {
    let mut keys = index.get(pkh.0)?.map(|v| v.to_vec()).unwrap_or_default();
    if !keys.chunks(OUTPOINT_KEY_LEN).any(|k| k == key) {
        keys.extend_from_slice(key);
        index.insert(&pkh.0[..], keys)?;
    }
    Ok(())
}

fn index_remove(index: &TransactionalTree, pkh: &PubKeyHash, key: &[u8]) -> TxResult<()> {
    let Some(existing) = index.get(pkh.0)? else {
        return Ok(());
    };
    let remaining: Vec<u8> = existing
        .chunks(OUTPOINT_KEY_LEN)
        .filter(|k| *k != key)
        .flatten()
        .copied()
        .collect();

    if remaining.is_empty() {
        index.remove(&pkh.0[..])?;
    } else {
        index.insert(&pkh.0[..], remaining)?;
    }
    Ok(())
}

fn decode_entry(bytes: &[u8]) -> TxResult<UtxoEntry> {
    UtxoEntry::from_bytes(bytes).map_err(abort)
}

impl UtxoEntryDao for SledUtxoDao {
    fn update(&self, outpoint: &Outpoint, entry: &UtxoEntry) -> Result<(), StorageError> {
        self.ensure_open()?;
        let key = outpoint.to_key();
        let value = entry.to_bytes();

        (&self.utxos_tree, &self.index_tree).transaction(|(utxos, index)| {
            if let Some(previous) = utxos.insert(&key[..], &value[..])? {
                let previous = decode_entry(&previous)?;
                if previous.pubkey_hash() != entry.pubkey_hash() {
                    index_remove(index, previous.pubkey_hash(), &key[..])?;
                }
            }
            index_add(index, entry.pubkey_hash(), &key[..])?;
            Ok(())
        })?;
        Ok(())
    }

    fn delete(&self, outpoint: &Outpoint) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let key = outpoint.to_key();

        let existed = (&self.utxos_tree, &self.index_tree).transaction(|(utxos, index)| {
            match utxos.remove(&key[..])? {
                Some(previous) => {
                    let previous = decode_entry(&previous)?;
                    index_remove(index, previous.pubkey_hash(), &key[..])?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })?;
        Ok(existed)
    }

    fn find(&self, outpoint: &Outpoint) -> Result<Option<UtxoEntry>, StorageError> {
        self.ensure_open()?;
        match self.utxos_tree.get(outpoint.to_key())? {
            Some(bytes) => Ok(Some(UtxoEntry::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn find_by_pubkey_hash(&self, pkh: &PubKeyHash) -> Result<Vec<Utxo>, StorageError> {
        self.ensure_open()?;
        let Some(keys) = self.index_tree.get(pkh.0)? else {
            return Ok(Vec::new());
        };

        let mut utxos = Vec::new();
        for key in keys.chunks(OUTPOINT_KEY_LEN) {
            let outpoint = Outpoint::from_key(key)
                .ok_or_else(|| StorageError::Corrupt("Truncated index record".to_string()))?;
            let bytes = self.utxos_tree.get(key)?.ok_or_else(|| {
                StorageError::Corrupt(format!("Index points at missing UTXO {outpoint}"))
            })?;
            utxos.push(Utxo {
                outpoint,
                entry: UtxoEntry::from_bytes(&bytes)?,
            });
        }
        Ok(utxos)
    }

    fn persist(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.db.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.db.flush()?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.utxos_tree.clear()?;
        self.index_tree.clear()?;
        Ok(())
    }
}

/// Append-only log of accepted blocks, replayed on startup
#[derive(Debug, Clone)]
pub struct BlockArchive {
    db: Db,
    blocks_tree: Tree,
}

impl BlockArchive {
    /// Append a block
    pub fn append(&self, block: &Block) -> Result<(), StorageError> {
        let sequence = self.db.generate_id()?;
        let value = bincode::serialize(block)?;
        self.blocks_tree.insert(sequence.to_be_bytes(), value)?;
        Ok(())
    }

    /// Every archived block in arrival order
    pub fn load_all(&self) -> Result<Vec<Block>, StorageError> {
        self.blocks_tree
            .iter()
            .values()
            .map(|value| Ok(bincode::deserialize(&value?)?))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.blocks_tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks_tree.is_empty()
    }
}
