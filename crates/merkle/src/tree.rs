//! The sparse state hash tree.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    hash_pair, hash_span, Hash, MerkleProof, LOG2_PAGE_SIZE, LOG2_ROOT_SIZE, LOG2_WORD_SIZE,
    PAGE_SIZE,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MerkleTreeError {
    #[error("address {address:#x} is not aligned to 2^{log2_size}")]
    MisalignedAddress { address: u64, log2_size: u32 },

    #[error("log2_size {0} out of range (must be 3..=64)")]
    InvalidLog2Size(u32),

    #[error("page update requires exactly {PAGE_SIZE} bytes, got {0}")]
    WrongPageSize(usize),
}

/// Precomputed hashes of all-zero subtrees, one per level.
///
/// `at(k)` is the hash of 2^k zero bytes.
struct Pristine {
    hashes: [Hash; (LOG2_ROOT_SIZE + 1) as usize],
}

impl Pristine {
    fn new() -> Self {
        let mut hashes = [[0u8; 32]; (LOG2_ROOT_SIZE + 1) as usize];
        hashes[LOG2_WORD_SIZE as usize] = crate::hash_word(0);
        for level in (LOG2_WORD_SIZE + 1)..=LOG2_ROOT_SIZE {
            let child = hashes[(level - 1) as usize];
            hashes[level as usize] = hash_pair(&child, &child);
        }
        Self { hashes }
    }

    #[inline]
    fn at(&self, log2_size: u32) -> Hash {
        self.hashes[log2_size as usize]
    }
}

/// Merkle tree over the full 2^64-byte physical address space.
///
/// Only page hashes are materialised; everything between page level and the
/// root is folded on demand, with pristine substitutes for untouched
/// subtrees. Nodes below page level are hashed from page bytes supplied by
/// the caller, so the tree never duplicates machine memory.
pub struct MerkleTree {
    /// Page index (`paddr >> 12`) to page hash, for non-pristine pages.
    pages: BTreeMap<u64, Hash>,
    pristine: Pristine,
}

impl MerkleTree {
    /// A tree over an all-zero address space.
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
            pristine: Pristine::new(),
        }
    }

    /// Recompute the hash of the page covering `paddr` from its bytes.
    pub fn update_page(&mut self, paddr: u64, page: &[u8]) -> Result<(), MerkleTreeError> {
        if paddr & (PAGE_SIZE as u64 - 1) != 0 {
            return Err(MerkleTreeError::MisalignedAddress {
                address: paddr,
                log2_size: LOG2_PAGE_SIZE,
            });
        }
        if page.len() != PAGE_SIZE {
            return Err(MerkleTreeError::WrongPageSize(page.len()));
        }
        let hash = hash_span(page);
        let index = paddr >> LOG2_PAGE_SIZE;
        if hash == self.pristine.at(LOG2_PAGE_SIZE) {
            self.pages.remove(&index);
        } else {
            self.pages.insert(index, hash);
        }
        Ok(())
    }

    /// Hash of the whole address space.
    pub fn get_root_hash(&self) -> Hash {
        self.subtree_hash(0, LOG2_ROOT_SIZE)
    }

    /// Build a proof for the node of size `2^log2_size` at `address`.
    ///
    /// For targets below page granularity the bytes of the containing page
    /// must be supplied in `page` (pass `None` only for untouched pages,
    /// which are all zeros).
    pub fn get_proof(
        &self,
        page: Option<&[u8]>,
        address: u64,
        log2_size: u32,
    ) -> Result<MerkleProof, MerkleTreeError> {
        if !(LOG2_WORD_SIZE..=LOG2_ROOT_SIZE).contains(&log2_size) {
            return Err(MerkleTreeError::InvalidLog2Size(log2_size));
        }
        let aligned = if log2_size == LOG2_ROOT_SIZE {
            address == 0
        } else {
            address & ((1u64 << log2_size) - 1) == 0
        };
        if !aligned {
            return Err(MerkleTreeError::MisalignedAddress { address, log2_size });
        }

        let mut sibling_hashes = vec![[0u8; 32]; (LOG2_ROOT_SIZE - log2_size) as usize];
        for level in log2_size..LOG2_ROOT_SIZE {
            let base = address & !((1u64 << level) - 1);
            let sibling = base ^ (1u64 << level);
            let hash = if level < LOG2_PAGE_SIZE {
                self.page_node_hash(page, sibling, level)
            } else {
                self.subtree_hash(sibling, level)
            };
            sibling_hashes[(63 - level) as usize] = hash;
        }

        let target_hash = if log2_size < LOG2_PAGE_SIZE {
            self.page_node_hash(page, address, log2_size)
        } else {
            self.subtree_hash(address, log2_size)
        };

        Ok(MerkleProof {
            address,
            log2_size,
            target_hash,
            sibling_hashes,
            root_hash: self.get_root_hash(),
        })
    }

    /// Hash of the in-page node of size `2^log2_size` whose first byte is at
    /// physical address `address`.
    fn page_node_hash(&self, page: Option<&[u8]>, address: u64, log2_size: u32) -> Hash {
        match page {
            Some(bytes) => {
                let offset = (address & (PAGE_SIZE as u64 - 1)) as usize;
                hash_span(&bytes[offset..offset + (1usize << log2_size)])
            }
            None => self.pristine.at(log2_size),
        }
    }

    /// Hash of the subtree of size `2^log2_size` rooted at `address`
    /// (page level and above).
    fn subtree_hash(&self, address: u64, log2_size: u32) -> Hash {
        if log2_size == LOG2_PAGE_SIZE {
            let index = address >> LOG2_PAGE_SIZE;
            return self
                .pages
                .get(&index)
                .copied()
                .unwrap_or_else(|| self.pristine.at(LOG2_PAGE_SIZE));
        }
        let first = address >> LOG2_PAGE_SIZE;
        let count = 1u64 << (log2_size - LOG2_PAGE_SIZE);
        if self.pages.range(first..first + count).next().is_none() {
            return self.pristine.at(log2_size);
        }
        let half = 1u64 << (log2_size - 1);
        let left = self.subtree_hash(address, log2_size - 1);
        let right = self.subtree_hash(address + half, log2_size - 1);
        hash_pair(&left, &right)
    }
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash_word;

    #[test]
    fn pristine_root_is_stable() {
        let tree = MerkleTree::new();
        assert_eq!(tree.get_root_hash(), MerkleTree::new().get_root_hash());
    }

    #[test]
    fn update_changes_root() {
        let mut tree = MerkleTree::new();
        let before = tree.get_root_hash();
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 1;
        tree.update_page(0x80000000, &page).unwrap();
        assert_ne!(tree.get_root_hash(), before);
        // Zeroing the page restores the pristine root.
        tree.update_page(0x80000000, &[0u8; PAGE_SIZE]).unwrap();
        assert_eq!(tree.get_root_hash(), before);
    }

    #[test]
    fn word_proof_verifies_everywhere_in_page() {
        let mut tree = MerkleTree::new();
        let mut page = [0u8; PAGE_SIZE];
        for i in 0..512u64 {
            page[(i * 8) as usize..(i * 8 + 8) as usize].copy_from_slice(&i.to_le_bytes());
        }
        tree.update_page(0x2000, &page).unwrap();
        for offset in [0u64, 8, 0x7f8, 0xff8] {
            let proof = tree.get_proof(Some(&page), 0x2000 + offset, 3).unwrap();
            assert!(proof.verify(), "proof failed at offset {offset:#x}");
            assert_eq!(proof.target_hash, hash_word(offset / 8));
        }
    }

    #[test]
    fn proof_for_untouched_address_verifies() {
        let mut tree = MerkleTree::new();
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0xaa;
        tree.update_page(0x1000, &page).unwrap();
        let proof = tree.get_proof(None, 0xdead_beef_0000_1000, 3).unwrap();
        assert!(proof.verify());
        assert_eq!(proof.target_hash, hash_word(0));
    }

    #[test]
    fn full_space_proof_is_the_root() {
        let tree = MerkleTree::new();
        let proof = tree.get_proof(None, 0, LOG2_ROOT_SIZE).unwrap();
        assert!(proof.sibling_hashes.is_empty());
        assert_eq!(proof.target_hash, tree.get_root_hash());
        assert!(proof.verify());
    }

    #[test]
    fn page_level_proof_verifies() {
        let mut tree = MerkleTree::new();
        let mut page = [0u8; PAGE_SIZE];
        page[100] = 7;
        tree.update_page(0x5000, &page).unwrap();
        let proof = tree.get_proof(Some(&page), 0x5000, LOG2_PAGE_SIZE).unwrap();
        assert!(proof.verify());
        assert_eq!(proof.target_hash, hash_span(&page));
    }

    #[test]
    fn rejects_bad_arguments() {
        let tree = MerkleTree::new();
        assert_eq!(
            tree.get_proof(None, 4, 3),
            Err(MerkleTreeError::MisalignedAddress {
                address: 4,
                log2_size: 3
            })
        );
        assert_eq!(tree.get_proof(None, 0, 2), Err(MerkleTreeError::InvalidLog2Size(2)));
        assert_eq!(tree.get_proof(None, 0, 65), Err(MerkleTreeError::InvalidLog2Size(65)));
    }
}
