//! Bitforest Core Library
//!
//! Consensus core of a PoW full node: a forest of received blocks with
//! accumulated-work chain selection, a layered UTXO engine (persistent
//! chainstate, unconfirmed mempool layer, ephemeral views and side-chain
//! deltas), chain reorganization, validators, the transaction mempool and
//! the miner.

pub mod chain;
pub mod consensus;
pub mod crypto;
pub mod mempool;
pub mod mining;
pub mod node;
pub mod p2p;
pub mod storage;
pub mod validation;
pub mod wallet;

/// Protocol constants - compile-time defaults for `ChainParams`
pub mod constants {
    /// Blocks buried deeper than this are committed to the chainstate
    pub const CONFIRMATION_DEPTH: u64 = 5;

    /// Leading zero bits required of a block hash
    pub const DEFAULT_DIFFICULTY: u8 = 28;

    /// Transactions per block, coinbase included
    pub const TX_PER_BLOCK: usize = 100;

    /// Fixed block subsidy in base units
    pub const BLOCK_SUBSIDY: u64 = 50;

    /// Minimum fee accepted into the mempool
    pub const MIN_FEE: u64 = 1;

    /// Chainstate LRU capacity
    pub const DEFAULT_CACHE_SIZE: usize = 10_000;

    /// Allowed clock drift for block timestamps (seconds)
    pub const MAX_FUTURE_BLOCK_TIME: i64 = 5 * 60;

    /// Coinbase "signature": 8-byte LE height followed by entropy
    pub const COINBASE_SIGNATURE_LEN: usize = 100;

    /// Output index carried by the coinbase input
    pub const COINBASE_OUTPUT_INDEX: u32 = 0xFFFF_FFFF;

    pub const DEFAULT_P2P_PORT: u16 = 50051;
    pub const DEFAULT_APP_PORT: u16 = 50050;
}
