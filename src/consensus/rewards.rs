//! Block reward calculation
//!
//! A flat subsidy plus the fees of the block's transactions.

/// Maximum coinbase value for a block collecting `fees`
///
/// `None` on overflow, which no valid block can reach.
pub fn calculate_block_reward(subsidy: u64, fees: u64) -> Option<u64> {
    subsidy.checked_add(fees)
}
