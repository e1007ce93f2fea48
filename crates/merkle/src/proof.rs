//! Merkle inclusion proofs.

use serde::{Deserialize, Serialize};

use crate::{hash_pair, Hash, LOG2_ROOT_SIZE};

/// Sibling chain from a target node up to the root.
///
/// `sibling_hashes[63 - level]` is the sibling of the rolling node at
/// `level`, for `level` in `log2_size..64`: index 0 holds the sibling just
/// below the root and the last entry holds the sibling of the target itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Target address, aligned to `1 << log2_size`.
    pub address: u64,
    /// log2 of the size subtended by the target node (3..=64).
    pub log2_size: u32,
    /// Hash of the target node.
    pub target_hash: Hash,
    /// Sibling hashes, top down (`64 - log2_size` of them).
    pub sibling_hashes: Vec<Hash>,
    /// Root hash the proof was generated against.
    pub root_hash: Hash,
}

impl MerkleProof {
    /// Fold a hash for the target node up through the sibling chain,
    /// returning the root it implies.
    ///
    /// At each level the rolling hash goes on the side selected by the
    /// corresponding address bit.
    pub fn roll_up(&self, target: Hash) -> Hash {
        let mut rolling = target;
        for level in self.log2_size..LOG2_ROOT_SIZE {
            let sibling = &self.sibling_hashes[(63 - level) as usize];
            rolling = if self.address & (1u64 << level) != 0 {
                hash_pair(sibling, &rolling)
            } else {
                hash_pair(&rolling, sibling)
            };
        }
        rolling
    }

    /// Check internal consistency: folding `target_hash` up the sibling
    /// chain must reproduce `root_hash`.
    pub fn verify(&self) -> bool {
        self.sibling_hashes.len() == (LOG2_ROOT_SIZE - self.log2_size) as usize
            && self.roll_up(self.target_hash) == self.root_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hash_word, MerkleTree};

    #[test]
    fn tampered_sibling_fails() {
        let mut tree = MerkleTree::new();
        let mut page = [0u8; crate::PAGE_SIZE];
        page[..8].copy_from_slice(&7u64.to_le_bytes());
        tree.update_page(0, &page).unwrap();

        let mut proof = tree.get_proof(Some(&page), 0, 3).unwrap();
        assert!(proof.verify());
        proof.sibling_hashes[0][0] ^= 0xff;
        assert!(!proof.verify());
    }

    #[test]
    fn tampered_target_fails() {
        let tree = MerkleTree::new();
        let proof = tree.get_proof(None, 0x1000, 3).unwrap();
        assert!(proof.verify());
        assert_ne!(proof.roll_up(hash_word(1)), proof.root_hash);
    }
}
