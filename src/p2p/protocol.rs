//! P2P protocol items
//!
//! The wire layer lives outside this crate. These are the values the core
//! hands to it: inventory references, peer ids and header-sync locators.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::Hash;

/// Opaque identifier the transport assigns to a connected peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Inventory item type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InvType {
    Transaction,
    Block,
}

/// Inventory item (reference to tx or block)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub inv_type: InvType,
    pub hash: Hash,
}

impl InvItem {
    pub fn block(hash: Hash) -> Self {
        Self {
            inv_type: InvType::Block,
            hash,
        }
    }

    pub fn transaction(hash: Hash) -> Self {
        Self {
            inv_type: InvType::Transaction,
            hash,
        }
    }
}

/// Block locator hashes for header sync, newest first
///
/// The first ten heights below `tip_height` are listed one by one, then the
/// step doubles. Genesis is always last.
pub fn build_block_locator(tip_height: u64, get_hash: impl Fn(u64) -> Option<Hash>) -> Vec<Hash> {
    let mut locator = Vec::new();
    let mut step = 1u64;
    let mut height = tip_height;

    while height > 0 {
        if let Some(hash) = get_hash(height) {
            locator.push(hash);
        }
        if height < step {
            break;
        }
        height -= step;
        if locator.len() > 10 {
            step *= 2;
        }
    }

    if let Some(hash) = get_hash(0) {
        if locator.last() != Some(&hash) {
            locator.push(hash);
        }
    }

    locator
}
