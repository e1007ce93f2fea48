//! The access log: the ordered record of word accesses of one step.
//!
//! A log is built empty at the start of a logged step, sealed at its end,
//! and immutable from then on; it can be serialised, transported, and
//! replayed anywhere.

use serde::{Deserialize, Serialize};
use stepvm_machine::BracketType;
use stepvm_merkle::{Hash, MerkleProof};

/// Direction of one word access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    Read,
    Write,
}

/// One 64-bit word access. `read` always holds the word as it was before
/// the access; `written` is zero for reads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WordAccess {
    pub access_type: AccessType,
    /// Physical address, 8-byte aligned.
    pub address: u64,
    /// Word value before the access.
    pub read: u64,
    /// Word value written (zero for reads).
    pub written: u64,
    /// Pre-access inclusion proof, when the log carries proofs.
    pub proof: Option<MerkleProof>,
}

/// What a log carries beyond the bare accesses. Fixed at construction:
/// proof-bearing and proofless entries are never mixed in one log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogType {
    pub proofs: bool,
    pub annotations: bool,
}

impl LogType {
    pub fn with_proofs() -> Self {
        Self {
            proofs: true,
            annotations: false,
        }
    }

    pub fn has_proofs(&self) -> bool {
        self.proofs
    }
}

/// Kind of a log structuring bracket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BracketKind {
    Begin,
    End,
}

impl From<BracketType> for BracketKind {
    fn from(ty: BracketType) -> Self {
        match ty {
            BracketType::Begin => Self::Begin,
            BracketType::End => Self::End,
        }
    }
}

/// A structuring bracket, anchored between accesses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bracket {
    pub kind: BracketKind,
    pub text: String,
    /// Index into `accesses` where the bracket sits.
    pub location: usize,
}

/// A free-form annotation, anchored to an access index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub text: String,
    pub location: usize,
}

/// The sealed record of one step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessLog {
    pub log_type: LogType,
    pub accesses: Vec<WordAccess>,
    pub brackets: Vec<Bracket>,
    pub notes: Vec<Note>,
    /// State root before the step.
    pub before_root: Hash,
    /// State root after the step.
    pub after_root: Hash,
}

impl AccessLog {
    pub fn new(log_type: LogType) -> Self {
        Self {
            log_type,
            accesses: Vec::new(),
            brackets: Vec::new(),
            notes: Vec::new(),
            before_root: [0; 32],
            after_root: [0; 32],
        }
    }

    pub fn len(&self) -> usize {
        self.accesses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accesses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_round_trip() {
        let mut log = AccessLog::new(LogType::with_proofs());
        log.accesses.push(WordAccess {
            access_type: AccessType::Read,
            address: 0x120,
            read: 7,
            written: 0,
            proof: None,
        });
        log.brackets.push(Bracket {
            kind: BracketKind::Begin,
            text: "step".into(),
            location: 0,
        });
        let json = serde_json::to_string(&log).unwrap();
        let back: AccessLog = serde_json::from_str(&json).unwrap();
        assert_eq!(back.accesses, log.accesses);
        assert_eq!(back.brackets, log.brackets);
        assert_eq!(back.log_type, log.log_type);
    }
}
