//! Chain-level errors

use thiserror::Error;

use crate::consensus::BlockRejection;
use crate::crypto::Hash;
use crate::storage::{StorageError, UtxoError};
use crate::validation::{TransactionId, TxRejection};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Block not found: {0}")]
    NotFound(Hash),
    #[error("Invalid block: {0}")]
    InvalidBlock(#[from] BlockRejection),
    #[error("Invalid transaction {txid}: {reason}")]
    InvalidTransaction {
        txid: TransactionId,
        reason: TxRejection,
    },
    #[error("Block {0} descends from an invalid block")]
    InvalidBlockParent(Hash),
    #[error("Block {0} is unexpectedly an orphan")]
    OrphanBlockUnexpected(Hash),
    #[error("No common ancestor between {0} and {1}")]
    ForkPointNotFound(Hash, Hash),
    #[error("Cannot reconstruct UTXO view at {0}")]
    CannotReconstructView(Hash),
    #[error("UTXO error: {0}")]
    Utxo(#[from] UtxoError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Genesis mismatch: {0}")]
    Genesis(String),
}
