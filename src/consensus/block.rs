//! Block structure
//!
//! Defines the block and block header structures and the canonical header
//! serialization used for the block hash.

use serde::{Deserialize, Serialize};

use crate::crypto::{compute_merkle_root, double_sha256, Hash};
use crate::validation::Transaction;

/// Length of the canonical header serialization
pub const HEADER_LEN: usize = 32 + 32 + 8 + 4 + 1;

/// Block header containing all metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hash of the previous block
    pub prev_hash: Hash,
    /// Merkle root of all transactions
    pub merkle_root: Hash,
    /// Block timestamp (seconds since Unix epoch)
    pub timestamp: i64,
    /// Required leading zero bits of the block hash
    pub difficulty: u8,
    /// Nonce used for PoW
    pub nonce: u32,
}

impl BlockHeader {
    /// Create a new block header
    pub fn new(
        prev_hash: Hash,
        merkle_root: Hash,
        timestamp: i64,
        difficulty: u8,
        nonce: u32,
    ) -> Self {
        Self {
            prev_hash,
            merkle_root,
            timestamp,
            difficulty,
            nonce,
        }
    }

    /// Serialize the header for hashing
    ///
    /// `prev ‖ merkle ‖ LE64(timestamp) ‖ LE32(nonce) ‖ difficulty`
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..32].copy_from_slice(&self.prev_hash.0);
        bytes[32..64].copy_from_slice(&self.merkle_root.0);
        bytes[64..72].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[72..76].copy_from_slice(&self.nonce.to_le_bytes());
        bytes[76] = self.difficulty;
        bytes
    }

    /// Calculate the hash of this header
    pub fn hash(&self) -> Hash {
        double_sha256(&self.to_bytes())
    }
}

/// A complete block containing header and transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// List of transactions in this block, coinbase first
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a new block
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// Get the block hash
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn prev_hash(&self) -> &Hash {
        &self.header.prev_hash
    }

    /// Check if this block has no parent
    pub fn is_genesis(&self) -> bool {
        self.header.prev_hash.is_zero()
    }

    /// Merkle root computed from the transactions
    pub fn compute_merkle_root(&self) -> Hash {
        let tx_hashes: Vec<Hash> = self.transactions.iter().map(|tx| tx.hash()).collect();
        compute_merkle_root(&tx_hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{hash_pair, PubKeyHash};

    #[test]
    fn test_block_header_serialization() {
        let header = BlockHeader::new(Hash([1; 32]), Hash([2; 32]), 1_234_567_890, 28, 7);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 77);
        assert_eq!(&bytes[64..72], &1_234_567_890i64.to_le_bytes());
        assert_eq!(&bytes[72..76], &7u32.to_le_bytes());
        assert_eq!(bytes[76], 28);
    }

    #[test]
    fn test_header_hash_covers_every_field() {
        let base = BlockHeader::new(Hash::zero(), Hash::zero(), 100, 10, 0);
        let mut other = base.clone();
        other.difficulty = 11;
        assert_ne!(base.hash(), other.hash());

        let mut other = base.clone();
        other.nonce = 1;
        assert_ne!(base.hash(), other.hash());
    }

    #[test]
    fn test_genesis_block_detection() {
        let coinbase = Transaction::coinbase_with_data(0, 50, PubKeyHash::default(), b"");
        let header = BlockHeader::new(Hash::zero(), Hash::zero(), 0, 0, 0);
        let block = Block::new(header, vec![coinbase]);
        assert!(block.is_genesis());
        let txid = block.transactions[0].hash();
        assert_eq!(block.compute_merkle_root(), hash_pair(&txid, &txid));
    }
}
