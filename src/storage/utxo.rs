//! UTXO entries and the provider capability
//!
//! Every layer of the UTXO engine (chainstate, mempool overlay, views,
//! side-chain deltas) answers lookups through [`UtxoProvider`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::StorageError;
use crate::crypto::PubKeyHash;
use crate::validation::{Outpoint, TxOutput};

/// Length of the on-disk entry encoding
pub const UTXO_ENTRY_LEN: usize = 37;

/// UTXO lookup errors
#[derive(Debug, Error)]
pub enum UtxoError {
    #[error("UTXO not found: {0}")]
    NotFound(Outpoint),
    #[error("UTXO already spent: {0}")]
    AlreadySpent(Outpoint),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Unspent output together with where it was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub output: TxOutput,
    /// Height of the creating block, 0 for mempool transactions
    pub block_height: u64,
    pub is_coinbase: bool,
}

impl UtxoEntry {
    pub fn new(output: TxOutput, block_height: u64, is_coinbase: bool) -> Self {
        Self {
            output,
            block_height,
            is_coinbase,
        }
    }

    pub fn value(&self) -> u64 {
        self.output.value
    }

    pub fn pubkey_hash(&self) -> &PubKeyHash {
        &self.output.pubkey_hash
    }

    /// `BE(value) ‖ pkh ‖ BE(height) ‖ coinbase`
    pub fn to_bytes(&self) -> [u8; UTXO_ENTRY_LEN] {
        let mut bytes = [0u8; UTXO_ENTRY_LEN];
        bytes[..8].copy_from_slice(&self.output.value.to_be_bytes());
        bytes[8..28].copy_from_slice(&self.output.pubkey_hash.0);
        bytes[28..36].copy_from_slice(&self.block_height.to_be_bytes());
        bytes[36] = u8::from(self.is_coinbase);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() != UTXO_ENTRY_LEN {
            return Err(StorageError::Corrupt(format!(
                "UTXO entry is {} bytes, expected {}",
                bytes.len(),
                UTXO_ENTRY_LEN
            )));
        }

        let mut value = [0u8; 8];
        value.copy_from_slice(&bytes[..8]);
        let mut pkh = [0u8; 20];
        pkh.copy_from_slice(&bytes[8..28]);
        let mut height = [0u8; 8];
        height.copy_from_slice(&bytes[28..36]);

        let is_coinbase = match bytes[36] {
            0 => false,
            1 => true,
            other => {
                return Err(StorageError::Corrupt(format!(
                    "Invalid coinbase flag {other:#04x}"
                )))
            }
        };

        Ok(Self {
            output: TxOutput::new(u64::from_be_bytes(value), PubKeyHash(pkh)),
            block_height: u64::from_be_bytes(height),
            is_coinbase,
        })
    }
}

/// An outpoint with its entry, as returned by address queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: Outpoint,
    pub entry: UtxoEntry,
}

/// Read capability shared by every UTXO layer
pub trait UtxoProvider: Send + Sync {
    /// Look up an unspent output
    fn get(&self, outpoint: &Outpoint) -> Result<UtxoEntry, UtxoError>;

    /// Whether `outpoint` is unspent in this layer
    fn contains(&self, outpoint: &Outpoint) -> Result<bool, UtxoError> {
        match self.get(outpoint) {
            Ok(_) => Ok(true),
            Err(UtxoError::NotFound(_)) | Err(UtxoError::AlreadySpent(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl UtxoProvider for HashMap<Outpoint, UtxoEntry> {
    fn get(&self, outpoint: &Outpoint) -> Result<UtxoEntry, UtxoError> {
        HashMap::get(self, outpoint)
            .copied()
            .ok_or(UtxoError::NotFound(*outpoint))
    }
}
