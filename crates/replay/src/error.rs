//! Step and verification errors.
//!
//! Verification errors carry the 1-based index of the offending access so a
//! failed replay points at the exact log position; the replayer state is
//! left untouched by a thrown error.

use thiserror::Error;

/// Errors of the logging side of a step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("hash tree update failed: {0}")]
    Merkle(#[from] stepvm_merkle::MerkleTreeError),
}

/// Log verification errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("too few word accesses in log")]
    TooFewAccesses,

    #[error("too many word accesses in log")]
    TooManyAccesses,

    #[error("verification requested proofs but log has none")]
    MissingProofs,

    #[error("expected access {index} to read {what}")]
    ExpectedRead { index: usize, what: &'static str },

    #[error("expected access {index} to write {what}")]
    ExpectedWrite { index: usize, what: &'static str },

    #[error("expected access {index} to touch {what} at address {address:#x}")]
    AddressMismatch {
        index: usize,
        what: &'static str,
        address: u64,
    },

    #[error("mismatch in access {index} address and its proof address")]
    ProofAddressMismatch { index: usize },

    #[error("mismatch in access {index} root hash")]
    RootHashMismatch { index: usize },

    #[error("word value in access {index} does not match target hash")]
    TargetHashMismatch { index: usize },

    #[error("word value in access {index} fails proof")]
    ProofFailed { index: usize },

    #[error("word value written in access {index} does not match log")]
    WrittenValueMismatch { index: usize },

    #[error("invalid flags in access {index} to PMA ({reason})")]
    InvalidPmaFlags { index: usize, reason: String },

    #[error("too many PMA accesses (access {index})")]
    TooManyPmaEntries { index: usize },

    #[error("rolling root hash does not match the log after-root")]
    FinalRootMismatch,
}
