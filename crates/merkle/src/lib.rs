//! stepvm-merkle: sparse Merkle tree over the 2^64-byte physical address
//! space of a machine.
//!
//! Leaves are 64-bit words (8 bytes, little-endian); interior nodes hash the
//! concatenation of their children. Pages (4 KiB) are the unit of update:
//! the tree materialises one hash per touched page and folds everything
//! above page level on demand, substituting precomputed pristine hashes for
//! untouched subtrees. Proofs are sibling chains from a target node up to
//! the root and can be re-folded by a verifier that holds no state at all.

pub mod proof;
pub mod tree;

pub use proof::MerkleProof;
pub use tree::{MerkleTree, MerkleTreeError};

/// A 32-byte digest.
pub type Hash = [u8; 32];

/// log2 of the leaf (word) size in bytes.
pub const LOG2_WORD_SIZE: u32 = 3;

/// log2 of the page size in bytes.
pub const LOG2_PAGE_SIZE: u32 = 12;

/// log2 of the full address space.
pub const LOG2_ROOT_SIZE: u32 = 64;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 1 << LOG2_PAGE_SIZE;

/// Hash two sibling nodes into their parent.
#[inline]
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// Hash a 64-bit word leaf (little-endian byte order).
#[inline]
pub fn hash_word(word: u64) -> Hash {
    *blake3::hash(&word.to_le_bytes()).as_bytes()
}

/// Hash an aligned power-of-two span of raw bytes down to a single digest.
///
/// `data.len()` must be a power of two and at least a word.
pub fn hash_span(data: &[u8]) -> Hash {
    debug_assert!(data.len().is_power_of_two());
    debug_assert!(data.len() >= 8);
    if data.len() == 8 {
        *blake3::hash(data).as_bytes()
    } else {
        let (lo, hi) = data.split_at(data.len() / 2);
        hash_pair(&hash_span(lo), &hash_span(hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_hash_matches_span_hash() {
        let word = 0x1122334455667788u64;
        assert_eq!(hash_word(word), hash_span(&word.to_le_bytes()));
    }

    #[test]
    fn span_hash_is_pairwise() {
        let data = [0xabu8; 16];
        let half = hash_span(&data[..8]);
        assert_eq!(hash_span(&data), hash_pair(&half, &half));
    }
}
