//! Difficulty, target and work
//!
//! A difficulty `d` demands `d` leading zero bits: the block hash, read as a
//! big-endian 256-bit integer, must be below `2^(256 - d)`. Each block
//! contributes `2^d` to its chain's accumulated work.

use num_bigint::BigUint;
use num_traits::One;

use crate::crypto::Hash;

/// Numeric target for `difficulty`
///
/// The target is exclusive, so difficulty 255 gives `2^1` and admits the
/// hash values 0 and 1, not only 0.
pub fn difficulty_to_target(difficulty: u8) -> BigUint {
    BigUint::one() << (256 - u32::from(difficulty))
}

/// Interpret a hash as a big-endian unsigned integer
pub fn hash_to_biguint(hash: &Hash) -> BigUint {
    BigUint::from_bytes_be(&hash.0)
}

/// Whether `hash` satisfies `difficulty`
pub fn meets_target(hash: &Hash, difficulty: u8) -> bool {
    hash_to_biguint(hash) < difficulty_to_target(difficulty)
}

/// Work contributed by one block at `difficulty`
pub fn block_work(difficulty: u8) -> BigUint {
    BigUint::one() << u32::from(difficulty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::Zero;

    #[test]
    fn test_zero_difficulty_accepts_everything() {
        assert!(meets_target(&Hash([0xff; 32]), 0));
        assert!(meets_target(&Hash::zero(), 0));
    }

    #[test]
    fn test_max_difficulty() {
        assert_eq!(difficulty_to_target(255), BigUint::from(2u8));
        assert!(meets_target(&Hash::zero(), 255));

        let mut one = [0u8; 32];
        one[31] = 1;
        assert!(meets_target(&Hash(one), 255));

        let mut two = [0u8; 32];
        two[31] = 2;
        assert!(!meets_target(&Hash(two), 255));
    }

    #[test]
    fn test_leading_zero_bits() {
        // 8 leading zero bits required
        let mut ok = [0xff; 32];
        ok[0] = 0x00;
        assert!(meets_target(&Hash(ok), 8));

        let mut bad = [0xff; 32];
        bad[0] = 0x01;
        assert!(!meets_target(&Hash(bad), 8));
        assert!(meets_target(&Hash(bad), 7));
    }

    #[test]
    fn test_block_work() {
        assert_eq!(block_work(0), BigUint::one());
        assert_eq!(block_work(10), BigUint::from(1024u32));
        assert!(!block_work(255).is_zero());
        assert!(block_work(29) > block_work(28));
    }
}
