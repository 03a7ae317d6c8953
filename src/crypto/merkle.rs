//! Merkle tree implementation
//!
//! Used for computing transaction merkle roots in blocks.

use super::{hash_pair, Hash};

/// Compute the merkle root of a list of hashes
///
/// If the list is empty, returns zero hash. Every level with an odd number
/// of elements duplicates its last element before pairing, a single hash
/// included.
pub fn compute_merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return Hash::zero();
    }

    let mut current_level: Vec<Hash> = hashes.to_vec();

    loop {
        if current_level.len() % 2 == 1 {
            let last = current_level[current_level.len() - 1];
            current_level.push(last);
        }

        current_level = current_level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();

        if let [root] = current_level[..] {
            return root;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::double_sha256;

    fn make_hashes(n: usize) -> Vec<Hash> {
        (0..n).map(|i| double_sha256(&i.to_le_bytes())).collect()
    }

    #[test]
    fn test_empty_merkle_root() {
        assert_eq!(compute_merkle_root(&[]), Hash::zero());
    }

    #[test]
    fn test_single_element_pairs_with_itself() {
        let hashes = make_hashes(1);
        let root = compute_merkle_root(&hashes);
        assert_eq!(root, hash_pair(&hashes[0], &hashes[0]));
        assert_ne!(root, hashes[0]);
    }

    #[test]
    fn test_two_elements() {
        let hashes = make_hashes(2);
        let expected = hash_pair(&hashes[0], &hashes[1]);
        assert_eq!(compute_merkle_root(&hashes), expected);
    }

    #[test]
    fn test_three_elements_duplicates_last() {
        let h = make_hashes(3);
        let expected = hash_pair(&hash_pair(&h[0], &h[1]), &hash_pair(&h[2], &h[2]));
        assert_eq!(compute_merkle_root(&h), expected);
    }

    #[test]
    fn test_five_elements_duplicates_on_every_odd_level() {
        let h = make_hashes(5);
        let l1 = [
            hash_pair(&h[0], &h[1]),
            hash_pair(&h[2], &h[3]),
            hash_pair(&h[4], &h[4]),
        ];
        let l2 = [hash_pair(&l1[0], &l1[1]), hash_pair(&l1[2], &l1[2])];
        let expected = hash_pair(&l2[0], &l2[1]);
        assert_eq!(compute_merkle_root(&h), expected);
    }
}
