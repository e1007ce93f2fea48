//! The replay state access: a verifier that holds no machine state.
//!
//! Every operation the interpreter performs computes the physical address
//! the logger would have used, consumes the next log entry, and checks it
//! positionally: direction, address, and (when proofs are on) the inclusion
//! proof against a rolling root hash. Writes fold the written word's hash
//! up the same sibling chain to advance the root. PMA entries are
//! reconstructed from the logged istart/ilength words into a
//! static-capacity buffer of mocks.

use stepvm_machine::access::{BracketType, MemoryWord, StateAccess};
use stepvm_machine::clint;
use stepvm_machine::htif;
use stepvm_machine::layout::{HTIF_START, PMA_MAX, SHADOW_START};
use stepvm_machine::pma::{split_istart, PmaView};
use stepvm_machine::shadow::{csr_rel_addr, pma_rel_addr, register_rel_addr, ShadowCsr};
use stepvm_machine::state::{
    IFLAGS_H_MASK, IFLAGS_I_MASK, IFLAGS_PRV_MASK, IFLAGS_PRV_SHIFT, IFLAGS_Y_MASK,
};
use stepvm_merkle::{hash_word, Hash};

use crate::error::ReplayError;
use crate::log::{AccessLog, AccessType, WordAccess};

const WORD_MASK: u64 = !7;

/// State access that consumes a log instead of a machine.
pub struct ReplayAccess<'a> {
    accesses: &'a [WordAccess],
    verify_proofs: bool,
    /// Cursor into `accesses`.
    next: usize,
    /// Root hash before the next access.
    root_hash: Hash,
    /// Mock PMA entries reconstructed from logged istart/ilength pairs.
    mock_pmas: Vec<PmaView>,
    /// One-shot flag making the interpreter run exactly one iteration.
    done_once: bool,
}

impl<'a> ReplayAccess<'a> {
    /// Build a verifier over `log`, starting from `before_root`.
    pub fn new(
        log: &'a AccessLog,
        before_root: Hash,
        verify_proofs: bool,
    ) -> Result<Self, ReplayError> {
        if verify_proofs && !log.log_type.has_proofs() {
            return Err(ReplayError::MissingProofs);
        }
        Ok(Self {
            accesses: &log.accesses,
            verify_proofs,
            next: 0,
            root_hash: before_root,
            mock_pmas: Vec::with_capacity(PMA_MAX),
            done_once: false,
        })
    }

    /// Finish verification: the log must be fully consumed. Returns the
    /// rolling root hash.
    pub fn finish(self) -> Result<Hash, ReplayError> {
        if self.next != self.accesses.len() {
            return Err(ReplayError::TooManyAccesses);
        }
        Ok(self.root_hash)
    }

    /// Rolling root hash before the next access.
    pub fn root_hash(&self) -> Hash {
        self.root_hash
    }

    /// 1-based index of the access about to be checked.
    fn index(&self) -> usize {
        self.next + 1
    }

    /// Check the next entry as a read of `paligned` and return its value.
    fn check_read(&mut self, paligned: u64, what: &'static str) -> Result<u64, ReplayError> {
        debug_assert_eq!(paligned & 7, 0);
        let index = self.index();
        let access = self
            .accesses
            .get(self.next)
            .ok_or(ReplayError::TooFewAccesses)?;
        if access.access_type != AccessType::Read {
            return Err(ReplayError::ExpectedRead { index, what });
        }
        if access.address != paligned {
            return Err(ReplayError::AddressMismatch {
                index,
                what,
                address: paligned,
            });
        }
        if self.verify_proofs {
            Self::check_proof(access, self.root_hash, index)?;
        }
        self.next += 1;
        Ok(access.read)
    }

    /// Check the next two entries as the read+write pair of a write of
    /// `val` to `paligned`, and advance the rolling root.
    fn check_write(
        &mut self,
        paligned: u64,
        val: u64,
        what: &'static str,
    ) -> Result<(), ReplayError> {
        self.check_read(paligned, what)?;
        let index = self.index();
        let access = self
            .accesses
            .get(self.next)
            .ok_or(ReplayError::TooFewAccesses)?;
        if access.access_type != AccessType::Write {
            return Err(ReplayError::ExpectedWrite { index, what });
        }
        if access.address != paligned {
            return Err(ReplayError::AddressMismatch {
                index,
                what,
                address: paligned,
            });
        }
        if access.written != val {
            return Err(ReplayError::WrittenValueMismatch { index });
        }
        if self.verify_proofs {
            let proof = Self::check_proof(access, self.root_hash, index)?;
            self.root_hash = proof.roll_up(hash_word(access.written));
        }
        self.next += 1;
        Ok(())
    }

    /// Check an entry's proof against the rolling root: the proof address
    /// matches the entry, the proof root matches the rolling root, and the
    /// pre-access word folds up to it.
    fn check_proof(
        access: &'a WordAccess,
        root_hash: Hash,
        index: usize,
    ) -> Result<&'a stepvm_merkle::MerkleProof, ReplayError> {
        let proof = access.proof.as_ref().ok_or(ReplayError::MissingProofs)?;
        if proof.address != access.address {
            return Err(ReplayError::ProofAddressMismatch { index });
        }
        if proof.root_hash != root_hash {
            return Err(ReplayError::RootHashMismatch { index });
        }
        let target = hash_word(access.read);
        if target != proof.target_hash {
            return Err(ReplayError::TargetHashMismatch { index });
        }
        if proof.roll_up(target) != proof.root_hash {
            return Err(ReplayError::ProofFailed { index });
        }
        Ok(proof)
    }

    fn iflags_addr() -> u64 {
        SHADOW_START + csr_rel_addr(ShadowCsr::Iflags)
    }

    fn read_iflags_word(&mut self, what: &'static str) -> Result<u64, ReplayError> {
        self.check_read(Self::iflags_addr(), what)
    }

    /// Reconstruct a mock PMA entry from its logged shadow words.
    fn build_mock_pma_entry(&mut self, istart: u64, ilength: u64) -> Result<PmaView, ReplayError> {
        let index = self.next;
        let (start, flags) = split_istart(istart).map_err(|e| ReplayError::InvalidPmaFlags {
            index,
            reason: e.to_string(),
        })?;
        if self.mock_pmas.len() == PMA_MAX {
            return Err(ReplayError::TooManyPmaEntries { index });
        }
        let view = PmaView {
            start,
            length: ilength,
            flags,
        };
        self.mock_pmas.push(view);
        Ok(view)
    }
}

macro_rules! replay_shadow_csr {
    ($($read:ident, $write:ident, $csr:ident, $name:literal;)*) => {$(
        fn $read(&mut self) -> Result<u64, ReplayError> {
            self.check_read(SHADOW_START + csr_rel_addr(ShadowCsr::$csr), $name)
        }
        fn $write(&mut self, val: u64) -> Result<(), ReplayError> {
            self.check_write(SHADOW_START + csr_rel_addr(ShadowCsr::$csr), val, $name)
        }
    )*};
}

impl StateAccess for ReplayAccess<'_> {
    type Error = ReplayError;

    fn done(&mut self, _mcycle_end: u64) -> bool {
        let done = self.done_once;
        self.done_once = true;
        done
    }

    fn brk(&self) -> bool {
        true
    }

    fn read_x(&mut self, i: usize) -> Result<u64, ReplayError> {
        self.check_read(SHADOW_START + register_rel_addr(i), "x")
    }

    fn write_x(&mut self, i: usize, val: u64) -> Result<(), ReplayError> {
        debug_assert!(i != 0);
        self.check_write(SHADOW_START + register_rel_addr(i), val, "x")
    }

    fn read_pc(&mut self) -> Result<u64, ReplayError> {
        self.check_read(SHADOW_START + csr_rel_addr(ShadowCsr::Pc), "pc")
    }

    fn write_pc(&mut self, val: u64) -> Result<(), ReplayError> {
        self.check_write(SHADOW_START + csr_rel_addr(ShadowCsr::Pc), val, "pc")
    }

    replay_shadow_csr! {
        read_minstret, write_minstret, Minstret, "minstret";
        read_mcycle, write_mcycle, Mcycle, "mcycle";
        read_mstatus, write_mstatus, Mstatus, "mstatus";
        read_mtvec, write_mtvec, Mtvec, "mtvec";
        read_mscratch, write_mscratch, Mscratch, "mscratch";
        read_mepc, write_mepc, Mepc, "mepc";
        read_mcause, write_mcause, Mcause, "mcause";
        read_mtval, write_mtval, Mtval, "mtval";
        read_mie, write_mie, Mie, "mie";
        read_mip, write_mip, Mip, "mip";
        read_medeleg, write_medeleg, Medeleg, "medeleg";
        read_mideleg, write_mideleg, Mideleg, "mideleg";
        read_mcounteren, write_mcounteren, Mcounteren, "mcounteren";
        read_stvec, write_stvec, Stvec, "stvec";
        read_sscratch, write_sscratch, Sscratch, "sscratch";
        read_sepc, write_sepc, Sepc, "sepc";
        read_scause, write_scause, Scause, "scause";
        read_stval, write_stval, Stval, "stval";
        read_satp, write_satp, Satp, "satp";
        read_scounteren, write_scounteren, Scounteren, "scounteren";
        read_ilrsc, write_ilrsc, Ilrsc, "ilrsc";
    }

    fn read_mvendorid(&mut self) -> Result<u64, ReplayError> {
        self.check_read(SHADOW_START + csr_rel_addr(ShadowCsr::Mvendorid), "mvendorid")
    }

    fn read_marchid(&mut self) -> Result<u64, ReplayError> {
        self.check_read(SHADOW_START + csr_rel_addr(ShadowCsr::Marchid), "marchid")
    }

    fn read_mimpid(&mut self) -> Result<u64, ReplayError> {
        self.check_read(SHADOW_START + csr_rel_addr(ShadowCsr::Mimpid), "mimpid")
    }

    fn read_misa(&mut self) -> Result<u64, ReplayError> {
        self.check_read(SHADOW_START + csr_rel_addr(ShadowCsr::Misa), "misa")
    }

    fn read_iflags_h(&mut self) -> Result<bool, ReplayError> {
        Ok(self.read_iflags_word("iflags.H")? & IFLAGS_H_MASK != 0)
    }

    fn read_iflags_y(&mut self) -> Result<bool, ReplayError> {
        Ok(self.read_iflags_word("iflags.Y")? & IFLAGS_Y_MASK != 0)
    }

    fn read_iflags_i(&mut self) -> Result<bool, ReplayError> {
        Ok(self.read_iflags_word("iflags.I")? & IFLAGS_I_MASK != 0)
    }

    fn set_iflags_h(&mut self) -> Result<(), ReplayError> {
        let old = self.read_iflags_word("iflags.H (superfluous)")?;
        self.check_write(Self::iflags_addr(), old | IFLAGS_H_MASK, "iflags.H")
    }

    fn set_iflags_y(&mut self) -> Result<(), ReplayError> {
        let old = self.read_iflags_word("iflags.Y (superfluous)")?;
        self.check_write(Self::iflags_addr(), old | IFLAGS_Y_MASK, "iflags.Y")
    }

    fn set_iflags_i(&mut self) -> Result<(), ReplayError> {
        let old = self.read_iflags_word("iflags.I (superfluous)")?;
        self.check_write(Self::iflags_addr(), old | IFLAGS_I_MASK, "iflags.I")
    }

    fn reset_iflags_y(&mut self) -> Result<(), ReplayError> {
        let old = self.read_iflags_word("iflags.Y (superfluous)")?;
        self.check_write(Self::iflags_addr(), old & !IFLAGS_Y_MASK, "iflags.Y")
    }

    fn reset_iflags_i(&mut self) -> Result<(), ReplayError> {
        let old = self.read_iflags_word("iflags.I (superfluous)")?;
        self.check_write(Self::iflags_addr(), old & !IFLAGS_I_MASK, "iflags.I")
    }

    fn read_iflags_prv(&mut self) -> Result<u8, ReplayError> {
        let val = self.read_iflags_word("iflags.PRV")?;
        Ok(((val & IFLAGS_PRV_MASK) >> IFLAGS_PRV_SHIFT) as u8)
    }

    fn write_iflags_prv(&mut self, val: u8) -> Result<(), ReplayError> {
        let old = self.read_iflags_word("iflags.PRV (superfluous)")?;
        let new = (old & !IFLAGS_PRV_MASK) | (((val as u64) << IFLAGS_PRV_SHIFT) & IFLAGS_PRV_MASK);
        self.check_write(Self::iflags_addr(), new, "iflags.PRV")
    }

    fn read_clint_mtimecmp(&mut self) -> Result<u64, ReplayError> {
        self.check_read(clint::mtimecmp_abs_addr(), "clint.mtimecmp")
    }

    fn write_clint_mtimecmp(&mut self, val: u64) -> Result<(), ReplayError> {
        self.check_write(clint::mtimecmp_abs_addr(), val, "clint.mtimecmp")
    }

    fn read_htif_tohost(&mut self) -> Result<u64, ReplayError> {
        self.check_read(htif::tohost_abs_addr(), "htif.tohost")
    }

    fn write_htif_tohost(&mut self, val: u64) -> Result<(), ReplayError> {
        self.check_write(htif::tohost_abs_addr(), val, "htif.tohost")
    }

    fn read_htif_fromhost(&mut self) -> Result<u64, ReplayError> {
        self.check_read(htif::fromhost_abs_addr(), "htif.fromhost")
    }

    fn write_htif_fromhost(&mut self, val: u64) -> Result<(), ReplayError> {
        self.check_write(htif::fromhost_abs_addr(), val, "htif.fromhost")
    }

    fn read_htif_ihalt(&mut self) -> Result<u64, ReplayError> {
        self.check_read(HTIF_START + htif::HTIF_IHALT_REL_ADDR, "htif.ihalt")
    }

    fn read_htif_iconsole(&mut self) -> Result<u64, ReplayError> {
        self.check_read(HTIF_START + htif::HTIF_ICONSOLE_REL_ADDR, "htif.iconsole")
    }

    fn read_htif_iyield(&mut self) -> Result<u64, ReplayError> {
        self.check_read(HTIF_START + htif::HTIF_IYIELD_REL_ADDR, "htif.iyield")
    }

    fn read_pma_istart(&mut self, i: usize) -> Result<u64, ReplayError> {
        self.check_read(SHADOW_START + pma_rel_addr(i), "pma.istart")
    }

    fn read_pma_ilength(&mut self, i: usize) -> Result<u64, ReplayError> {
        self.check_read(SHADOW_START + pma_rel_addr(i) + 8, "pma.ilength")
    }

    fn find_pma_entry<T: MemoryWord>(&mut self, paddr: u64) -> Result<PmaView, ReplayError> {
        for i in 0..PMA_MAX {
            let istart = self.read_pma_istart(i)?;
            let ilength = self.read_pma_ilength(i)?;
            if ilength == 0 {
                return self.build_mock_pma_entry(istart, ilength);
            }
            let start = istart & stepvm_machine::pma::ISTART_START_MASK;
            if paddr >= start && ilength >= T::SIZE && paddr - start <= ilength - T::SIZE {
                return self.build_mock_pma_entry(istart, ilength);
            }
        }
        Ok(PmaView::empty())
    }

    fn read_memory<T: MemoryWord>(&mut self, paddr: u64) -> Result<T, ReplayError> {
        let paligned = paddr & WORD_MASK;
        let val64 = self.check_read(paligned, "memory")?;
        let shift = 8 * (paddr & 7);
        Ok(T::from_u64(val64 >> shift))
    }

    fn write_memory<T: MemoryWord>(&mut self, paddr: u64, val: T) -> Result<(), ReplayError> {
        if T::SIZE == 8 {
            return self.check_write(paddr, val.to_u64(), "memory");
        }
        let paligned = paddr & WORD_MASK;
        let old64 = self.check_read(paligned, "memory (superfluous)")?;
        let shift = 8 * (paddr & 7);
        let mask = ((1u128 << (8 * T::SIZE)) - 1) as u64;
        let new64 = (old64 & !(mask << shift)) | ((val.to_u64() & mask) << shift);
        self.check_write(paligned, new64, "memory")
    }

    fn push_bracket(&mut self, _ty: BracketType, _text: &str) {}

    fn make_scoped_note(&mut self, _text: &str) {}
}
