//! The logging state access: executes against the machine state while
//! appending every word touch to an access log.
//!
//! Reads append one entry carrying the pre-access word and its proof.
//! Writes append the pre-image read entry followed by the write entry, both
//! proved against the pre-write tree; the touched tree page is then
//! refreshed so the next proof reflects the new root. Read-modify-write
//! operations log their extra read explicitly.

use stepvm_machine::access::{BracketType, MemoryWord, StateAccess};
use stepvm_machine::clint;
use stepvm_machine::htif;
use stepvm_machine::layout::{HTIF_START, PMA_MAX, SHADOW_START};
use stepvm_machine::machine::peek_page;
use stepvm_machine::pma::PmaView;
use stepvm_machine::shadow::{csr_rel_addr, pma_rel_addr, register_rel_addr, ShadowCsr};
use stepvm_machine::state::{
    MachineState, IFLAGS_H_MASK, IFLAGS_I_MASK, IFLAGS_PRV_MASK, IFLAGS_PRV_SHIFT, IFLAGS_Y_MASK,
};
use stepvm_merkle::{MerkleProof, MerkleTree, PAGE_SIZE};

use crate::error::StepError;
use crate::log::{AccessLog, AccessType, Bracket, LogType, Note, WordAccess};

const WORD_MASK: u64 = !7;
const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// State access that executes and logs.
pub struct LoggedAccess<'a> {
    machine: &'a mut MachineState,
    tree: &'a mut MerkleTree,
    log: AccessLog,
}

impl<'a> LoggedAccess<'a> {
    /// `tree` must be in sync with `machine` (the step driver guarantees
    /// it); proofs are generated iff `log_type.proofs`.
    pub fn new(machine: &'a mut MachineState, tree: &'a mut MerkleTree, log_type: LogType) -> Self {
        Self {
            machine,
            tree,
            log: AccessLog::new(log_type),
        }
    }

    /// Seal and return the log. Roots are filled in by the step driver.
    pub fn finish(self) -> AccessLog {
        self.log
    }

    fn proof_for(&self, paligned: u64) -> Result<Option<MerkleProof>, StepError> {
        if !self.log.log_type.proofs {
            return Ok(None);
        }
        let page = peek_page(self.machine, paligned & PAGE_MASK);
        Ok(Some(self.tree.get_proof(page.as_deref(), paligned, 3)?))
    }

    fn note(&mut self, text: &'static str) {
        if self.log.log_type.annotations {
            self.log.notes.push(Note {
                text: text.to_owned(),
                location: self.log.accesses.len(),
            });
        }
    }

    fn log_read(&mut self, paligned: u64, val: u64, text: &'static str) -> Result<(), StepError> {
        debug_assert_eq!(paligned & 7, 0);
        let proof = self.proof_for(paligned)?;
        self.note(text);
        self.log.accesses.push(WordAccess {
            access_type: AccessType::Read,
            address: paligned,
            read: val,
            written: 0,
            proof,
        });
        Ok(())
    }

    /// Append the pre-image read entry and the write entry, both proved
    /// against the pre-write tree. The caller mutates the state afterwards
    /// and refreshes the page with [`Self::touch`].
    fn log_write(
        &mut self,
        paligned: u64,
        old: u64,
        new: u64,
        text: &'static str,
    ) -> Result<(), StepError> {
        debug_assert_eq!(paligned & 7, 0);
        let proof = self.proof_for(paligned)?;
        self.note(text);
        self.log.accesses.push(WordAccess {
            access_type: AccessType::Read,
            address: paligned,
            read: old,
            written: 0,
            proof: proof.clone(),
        });
        self.log.accesses.push(WordAccess {
            access_type: AccessType::Write,
            address: paligned,
            read: old,
            written: new,
            proof,
        });
        Ok(())
    }

    /// Re-hash the tree page covering `paddr` from the post-write state.
    fn touch(&mut self, paddr: u64) -> Result<(), StepError> {
        let page_start = paddr & PAGE_MASK;
        if let Some(page) = peek_page(self.machine, page_start) {
            self.tree.update_page(page_start, &page)?;
        }
        Ok(())
    }

    fn read_machine_word(&self, paligned: u64) -> u64 {
        self.machine
            .pmas
            .find(paligned, 8)
            .and_then(|e| {
                let offset = (paligned - e.start()) as usize;
                e.memory().map(|m| {
                    u64::from_le_bytes(m.bytes()[offset..offset + 8].try_into().unwrap_or([0; 8]))
                })
            })
            .unwrap_or(0)
    }

    fn write_machine_word(&mut self, paligned: u64, val: u64) {
        if let Some(entry) = self.machine.pmas.find_mut(paligned, 8) {
            let start = entry.start();
            if let Some(memory) = entry.memory_mut() {
                let offset = paligned - start;
                memory.bytes_mut()[offset as usize..offset as usize + 8]
                    .copy_from_slice(&val.to_le_bytes());
                memory.mark_dirty(offset);
            }
        }
    }

    fn iflags_addr() -> u64 {
        SHADOW_START + csr_rel_addr(ShadowCsr::Iflags)
    }

    fn read_iflags_word(&mut self, text: &'static str) -> Result<u64, StepError> {
        let val = self.machine.read_iflags();
        self.log_read(Self::iflags_addr(), val, text)?;
        Ok(val)
    }

    fn write_iflags_word(
        &mut self,
        old: u64,
        new: u64,
        text: &'static str,
    ) -> Result<(), StepError> {
        self.log_write(Self::iflags_addr(), old, new, text)?;
        self.machine.write_iflags(new);
        self.touch(Self::iflags_addr())
    }

    fn shadow_csr_read(
        &mut self,
        csr: ShadowCsr,
        val: u64,
        text: &'static str,
    ) -> Result<u64, StepError> {
        self.log_read(SHADOW_START + csr_rel_addr(csr), val, text)?;
        Ok(val)
    }
}

macro_rules! logged_shadow_csr {
    ($($read:ident, $write:ident, $field:ident, $csr:ident, $name:literal;)*) => {$(
        fn $read(&mut self) -> Result<u64, StepError> {
            let val = self.machine.$field;
            self.shadow_csr_read(ShadowCsr::$csr, val, $name)
        }
        fn $write(&mut self, val: u64) -> Result<(), StepError> {
            let addr = SHADOW_START + csr_rel_addr(ShadowCsr::$csr);
            let old = self.machine.$field;
            self.log_write(addr, old, val, $name)?;
            self.machine.$field = val;
            self.touch(addr)
        }
    )*};
}

impl StateAccess for LoggedAccess<'_> {
    type Error = StepError;

    fn done(&mut self, mcycle_end: u64) -> bool {
        self.machine.is_done(mcycle_end)
    }

    fn brk(&self) -> bool {
        self.machine.brk
    }

    fn read_x(&mut self, i: usize) -> Result<u64, StepError> {
        let val = self.machine.x[i];
        self.log_read(SHADOW_START + register_rel_addr(i), val, "x")?;
        Ok(val)
    }

    fn write_x(&mut self, i: usize, val: u64) -> Result<(), StepError> {
        debug_assert!(i != 0);
        let addr = SHADOW_START + register_rel_addr(i);
        let old = self.machine.x[i];
        self.log_write(addr, old, val, "x")?;
        self.machine.x[i] = val;
        self.touch(addr)
    }

    fn read_pc(&mut self) -> Result<u64, StepError> {
        let val = self.machine.pc;
        self.shadow_csr_read(ShadowCsr::Pc, val, "pc")
    }

    fn write_pc(&mut self, val: u64) -> Result<(), StepError> {
        let addr = SHADOW_START + csr_rel_addr(ShadowCsr::Pc);
        let old = self.machine.pc;
        self.log_write(addr, old, val, "pc")?;
        self.machine.pc = val;
        self.touch(addr)
    }

    logged_shadow_csr! {
        read_minstret, write_minstret, minstret, Minstret, "minstret";
        read_mcycle, write_mcycle, mcycle, Mcycle, "mcycle";
        read_mstatus, write_mstatus, mstatus, Mstatus, "mstatus";
        read_mtvec, write_mtvec, mtvec, Mtvec, "mtvec";
        read_mscratch, write_mscratch, mscratch, Mscratch, "mscratch";
        read_mepc, write_mepc, mepc, Mepc, "mepc";
        read_mcause, write_mcause, mcause, Mcause, "mcause";
        read_mtval, write_mtval, mtval, Mtval, "mtval";
        read_medeleg, write_medeleg, medeleg, Medeleg, "medeleg";
        read_mideleg, write_mideleg, mideleg, Mideleg, "mideleg";
        read_mcounteren, write_mcounteren, mcounteren, Mcounteren, "mcounteren";
        read_stvec, write_stvec, stvec, Stvec, "stvec";
        read_sscratch, write_sscratch, sscratch, Sscratch, "sscratch";
        read_sepc, write_sepc, sepc, Sepc, "sepc";
        read_scause, write_scause, scause, Scause, "scause";
        read_stval, write_stval, stval, Stval, "stval";
        read_satp, write_satp, satp, Satp, "satp";
        read_scounteren, write_scounteren, scounteren, Scounteren, "scounteren";
        read_ilrsc, write_ilrsc, ilrsc, Ilrsc, "ilrsc";
    }

    fn read_mie(&mut self) -> Result<u64, StepError> {
        let val = self.machine.mie;
        self.shadow_csr_read(ShadowCsr::Mie, val, "mie")
    }

    fn write_mie(&mut self, val: u64) -> Result<(), StepError> {
        let addr = SHADOW_START + csr_rel_addr(ShadowCsr::Mie);
        let old = self.machine.mie;
        self.log_write(addr, old, val, "mie")?;
        self.machine.mie = val;
        self.machine.set_brk_from_all();
        self.touch(addr)
    }

    fn read_mip(&mut self) -> Result<u64, StepError> {
        let val = self.machine.mip;
        self.shadow_csr_read(ShadowCsr::Mip, val, "mip")
    }

    fn write_mip(&mut self, val: u64) -> Result<(), StepError> {
        let addr = SHADOW_START + csr_rel_addr(ShadowCsr::Mip);
        let old = self.machine.mip;
        self.log_write(addr, old, val, "mip")?;
        self.machine.mip = val;
        self.machine.set_brk_from_all();
        self.touch(addr)
    }

    fn read_mvendorid(&mut self) -> Result<u64, StepError> {
        self.shadow_csr_read(
            ShadowCsr::Mvendorid,
            stepvm_machine::riscv::MVENDORID_INIT,
            "mvendorid",
        )
    }

    fn read_marchid(&mut self) -> Result<u64, StepError> {
        self.shadow_csr_read(
            ShadowCsr::Marchid,
            stepvm_machine::riscv::MARCHID_INIT,
            "marchid",
        )
    }

    fn read_mimpid(&mut self) -> Result<u64, StepError> {
        self.shadow_csr_read(
            ShadowCsr::Mimpid,
            stepvm_machine::riscv::MIMPID_INIT,
            "mimpid",
        )
    }

    fn read_misa(&mut self) -> Result<u64, StepError> {
        let val = self.machine.misa;
        self.shadow_csr_read(ShadowCsr::Misa, val, "misa")
    }

    fn read_iflags_h(&mut self) -> Result<bool, StepError> {
        Ok(self.read_iflags_word("iflags.H")? & IFLAGS_H_MASK != 0)
    }

    fn read_iflags_y(&mut self) -> Result<bool, StepError> {
        Ok(self.read_iflags_word("iflags.Y")? & IFLAGS_Y_MASK != 0)
    }

    fn read_iflags_i(&mut self) -> Result<bool, StepError> {
        Ok(self.read_iflags_word("iflags.I")? & IFLAGS_I_MASK != 0)
    }

    fn set_iflags_h(&mut self) -> Result<(), StepError> {
        let old = self.read_iflags_word("iflags.H (superfluous)")?;
        self.write_iflags_word(old, old | IFLAGS_H_MASK, "iflags.H")?;
        self.machine.or_brk_with_iflags_h();
        Ok(())
    }

    fn set_iflags_y(&mut self) -> Result<(), StepError> {
        let old = self.read_iflags_word("iflags.Y (superfluous)")?;
        self.write_iflags_word(old, old | IFLAGS_Y_MASK, "iflags.Y")?;
        self.machine.or_brk_with_iflags_y();
        Ok(())
    }

    fn set_iflags_i(&mut self) -> Result<(), StepError> {
        let old = self.read_iflags_word("iflags.I (superfluous)")?;
        self.write_iflags_word(old, old | IFLAGS_I_MASK, "iflags.I")
    }

    fn reset_iflags_y(&mut self) -> Result<(), StepError> {
        let old = self.read_iflags_word("iflags.Y (superfluous)")?;
        self.write_iflags_word(old, old & !IFLAGS_Y_MASK, "iflags.Y")
    }

    fn reset_iflags_i(&mut self) -> Result<(), StepError> {
        let old = self.read_iflags_word("iflags.I (superfluous)")?;
        self.write_iflags_word(old, old & !IFLAGS_I_MASK, "iflags.I")
    }

    fn read_iflags_prv(&mut self) -> Result<u8, StepError> {
        let val = self.read_iflags_word("iflags.PRV")?;
        Ok(((val & IFLAGS_PRV_MASK) >> IFLAGS_PRV_SHIFT) as u8)
    }

    fn write_iflags_prv(&mut self, val: u8) -> Result<(), StepError> {
        let old = self.read_iflags_word("iflags.PRV (superfluous)")?;
        let new = (old & !IFLAGS_PRV_MASK) | (((val as u64) << IFLAGS_PRV_SHIFT) & IFLAGS_PRV_MASK);
        self.write_iflags_word(old, new, "iflags.PRV")
    }

    fn read_clint_mtimecmp(&mut self) -> Result<u64, StepError> {
        let val = self.machine.clint_mtimecmp;
        self.log_read(clint::mtimecmp_abs_addr(), val, "clint.mtimecmp")?;
        Ok(val)
    }

    fn write_clint_mtimecmp(&mut self, val: u64) -> Result<(), StepError> {
        let addr = clint::mtimecmp_abs_addr();
        let old = self.machine.clint_mtimecmp;
        self.log_write(addr, old, val, "clint.mtimecmp")?;
        self.machine.clint_mtimecmp = val;
        self.touch(addr)
    }

    fn read_htif_tohost(&mut self) -> Result<u64, StepError> {
        let val = self.machine.htif_tohost;
        self.log_read(htif::tohost_abs_addr(), val, "htif.tohost")?;
        Ok(val)
    }

    fn write_htif_tohost(&mut self, val: u64) -> Result<(), StepError> {
        let addr = htif::tohost_abs_addr();
        let old = self.machine.htif_tohost;
        self.log_write(addr, old, val, "htif.tohost")?;
        self.machine.htif_tohost = val;
        self.machine.or_brk_with_iflags_y();
        self.touch(addr)
    }

    fn read_htif_fromhost(&mut self) -> Result<u64, StepError> {
        let val = self.machine.htif_fromhost;
        self.log_read(htif::fromhost_abs_addr(), val, "htif.fromhost")?;
        Ok(val)
    }

    fn write_htif_fromhost(&mut self, val: u64) -> Result<(), StepError> {
        let addr = htif::fromhost_abs_addr();
        let old = self.machine.htif_fromhost;
        self.log_write(addr, old, val, "htif.fromhost")?;
        self.machine.htif_fromhost = val;
        self.touch(addr)
    }

    fn read_htif_ihalt(&mut self) -> Result<u64, StepError> {
        let val = self.machine.htif_ihalt;
        self.log_read(HTIF_START + htif::HTIF_IHALT_REL_ADDR, val, "htif.ihalt")?;
        Ok(val)
    }

    fn read_htif_iconsole(&mut self) -> Result<u64, StepError> {
        let val = self.machine.htif_iconsole;
        self.log_read(
            HTIF_START + htif::HTIF_ICONSOLE_REL_ADDR,
            val,
            "htif.iconsole",
        )?;
        Ok(val)
    }

    fn read_htif_iyield(&mut self) -> Result<u64, StepError> {
        let val = self.machine.htif_iyield;
        self.log_read(HTIF_START + htif::HTIF_IYIELD_REL_ADDR, val, "htif.iyield")?;
        Ok(val)
    }

    fn write_console_byte(&mut self, byte: u8) -> Result<(), StepError> {
        self.machine.console.putchar(byte);
        Ok(())
    }

    fn read_pma_istart(&mut self, i: usize) -> Result<u64, StepError> {
        let val = self
            .machine
            .pmas
            .get(i)
            .map_or_else(stepvm_machine::pma::empty_istart, |e| e.istart());
        self.log_read(SHADOW_START + pma_rel_addr(i), val, "pma.istart")?;
        Ok(val)
    }

    fn read_pma_ilength(&mut self, i: usize) -> Result<u64, StepError> {
        let val = self.machine.pmas.get(i).map_or(0, |e| e.ilength());
        self.log_read(SHADOW_START + pma_rel_addr(i) + 8, val, "pma.ilength")?;
        Ok(val)
    }

    fn find_pma_entry<T: MemoryWord>(&mut self, paddr: u64) -> Result<PmaView, StepError> {
        for i in 0..PMA_MAX {
            let istart = self.read_pma_istart(i)?;
            let ilength = self.read_pma_ilength(i)?;
            if ilength == 0 {
                return Ok(PmaView::empty());
            }
            let view = self
                .machine
                .pmas
                .get(i)
                .map_or_else(PmaView::empty, |e| e.view());
            debug_assert_eq!(view.start | view.flags.pack(), istart);
            if view.contains(paddr, T::SIZE) {
                return Ok(view);
            }
        }
        Ok(PmaView::empty())
    }

    fn read_memory<T: MemoryWord>(&mut self, paddr: u64) -> Result<T, StepError> {
        let paligned = paddr & WORD_MASK;
        let val64 = self.read_machine_word(paligned);
        self.log_read(paligned, val64, "memory")?;
        let shift = 8 * (paddr & 7);
        Ok(T::from_u64(val64 >> shift))
    }

    fn write_memory<T: MemoryWord>(&mut self, paddr: u64, val: T) -> Result<(), StepError> {
        if T::SIZE == 8 {
            let old = self.read_machine_word(paddr);
            self.log_write(paddr, old, val.to_u64(), "memory")?;
            self.write_machine_word(paddr, val.to_u64());
            return self.touch(paddr);
        }
        // Sub-word writes are lowered to an explicit read-modify-write of
        // the enclosing word: the verifier needs the pre-image.
        let paligned = paddr & WORD_MASK;
        let old64 = self.read_machine_word(paligned);
        self.log_read(paligned, old64, "memory (superfluous)")?;
        let shift = 8 * (paddr & 7);
        let mask = ((1u128 << (8 * T::SIZE)) - 1) as u64;
        let new64 = (old64 & !(mask << shift)) | ((val.to_u64() & mask) << shift);
        self.log_write(paligned, old64, new64, "memory")?;
        self.write_machine_word(paligned, new64);
        self.touch(paligned)
    }

    fn push_bracket(&mut self, ty: BracketType, text: &str) {
        if self.log.log_type.annotations {
            self.log.brackets.push(Bracket {
                kind: ty.into(),
                text: text.to_owned(),
                location: self.log.accesses.len(),
            });
        }
    }

    fn make_scoped_note(&mut self, text: &str) {
        if self.log.log_type.annotations {
            self.log.notes.push(Note {
                text: text.to_owned(),
                location: self.log.accesses.len(),
            });
        }
    }
}
