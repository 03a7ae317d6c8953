//! Genesis block
//!
//! The genesis block is fixed. Its hash is hard-coded and checked at
//! startup so a node built with a different genesis refuses to run. Its
//! coinbase output is never added to the UTXO set.

use crate::consensus::{meets_target, Block, BlockHeader};
use crate::crypto::{Hash, PubKeyHash};
use crate::validation::Transaction;

pub const GENESIS_TIMESTAMP: i64 = 1_700_000_000;

/// Genesis difficulty, independent of the network difficulty
pub const GENESIS_DIFFICULTY: u8 = 16;

pub const GENESIS_NONCE: u32 = 22_660;

pub const GENESIS_REWARD: u64 = 50;

/// Message carried in the genesis coinbase
pub const GENESIS_MESSAGE: &[u8] = b"bitforest genesis: every block a tree, every tree a forest";

pub const GENESIS_HASH_HEX: &str =
    "00007fc8b5d9d95fddfb60c251c55a5c35f5c4e54970d76bbc7622fe8cc0eacc";

/// Build the genesis block
pub fn create_genesis_block() -> Block {
    let coinbase =
        Transaction::coinbase_with_data(0, GENESIS_REWARD, PubKeyHash::default(), GENESIS_MESSAGE);
    let mut block = Block::new(
        BlockHeader::new(
            Hash::zero(),
            Hash::zero(),
            GENESIS_TIMESTAMP,
            GENESIS_DIFFICULTY,
            GENESIS_NONCE,
        ),
        vec![coinbase],
    );
    block.header.merkle_root = block.compute_merkle_root();
    block
}

/// The hard-coded genesis hash
pub fn genesis_hash() -> Result<Hash, hex::FromHexError> {
    Hash::from_hex(GENESIS_HASH_HEX)
}

/// Check a genesis block against the hard-coded hash and its own proof of work
pub fn verify_genesis(block: &Block) -> Result<Hash, String> {
    let expected = genesis_hash().map_err(|e| format!("bad genesis constant: {e}"))?;
    let hash = block.hash();
    if hash != expected {
        return Err(format!("genesis hash {hash} does not match {expected}"));
    }
    if !block.is_genesis() {
        return Err("genesis block has a parent".to_string());
    }
    if !meets_target(&hash, block.header.difficulty) {
        return Err("genesis block fails its proof of work".to_string());
    }
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_is_deterministic() {
        assert_eq!(create_genesis_block(), create_genesis_block());
    }

    #[test]
    fn test_genesis_matches_constant() {
        let genesis = create_genesis_block();
        assert_eq!(verify_genesis(&genesis).unwrap(), genesis_hash().unwrap());
        assert_eq!(
            genesis.transactions[0].hash().to_hex(),
            "a218b3968e1f70786e78967d6a4e2eebf87b9715e363ebd253024800e6d9830e"
        );
        assert_eq!(
            genesis.header.merkle_root.to_hex(),
            "1a8df1ff820d6c20eda4d1cc2604447fcf11a67e51071191c7e9cd3f9fc13fe5"
        );
    }

    #[test]
    fn test_genesis_shape() {
        let genesis = create_genesis_block();
        assert!(genesis.is_genesis());
        assert_eq!(genesis.transactions.len(), 1);
        assert!(genesis.transactions[0].is_coinbase());
        assert_eq!(genesis.transactions[0].coinbase_height(), Some(0));
    }

    #[test]
    fn test_tampered_genesis_rejected() {
        let mut genesis = create_genesis_block();
        genesis.header.timestamp += 1;
        assert!(verify_genesis(&genesis).is_err());
    }
}
