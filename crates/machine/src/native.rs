//! Native state access: straight-through reads and writes on the machine
//! state, no log. This is the implementation the ordinary run loop uses.

use std::convert::Infallible;

use crate::access::{BracketType, MemoryWord, StateAccess};
use crate::pma::{PmaBody, PmaView};
use crate::riscv::mip;
use crate::state::MachineState;

pub struct NativeAccess<'a> {
    s: &'a mut MachineState,
}

impl<'a> NativeAccess<'a> {
    pub fn new(s: &'a mut MachineState) -> Self {
        Self { s }
    }
}

macro_rules! native_csr {
    ($($read:ident, $write:ident, $field:ident;)*) => {$(
        fn $read(&mut self) -> Result<u64, Infallible> {
            Ok(self.s.$field)
        }
        fn $write(&mut self, val: u64) -> Result<(), Infallible> {
            self.s.$field = val;
            Ok(())
        }
    )*};
}

impl StateAccess for NativeAccess<'_> {
    type Error = Infallible;

    fn done(&mut self, mcycle_end: u64) -> bool {
        self.s.is_done(mcycle_end)
    }

    fn brk(&self) -> bool {
        self.s.brk
    }

    fn read_x(&mut self, i: usize) -> Result<u64, Infallible> {
        Ok(self.s.x[i])
    }

    fn write_x(&mut self, i: usize, val: u64) -> Result<(), Infallible> {
        debug_assert!(i != 0);
        self.s.x[i] = val;
        Ok(())
    }

    fn read_pc(&mut self) -> Result<u64, Infallible> {
        Ok(self.s.pc)
    }

    fn write_pc(&mut self, val: u64) -> Result<(), Infallible> {
        self.s.pc = val;
        Ok(())
    }

    native_csr! {
        read_minstret, write_minstret, minstret;
        read_mcycle, write_mcycle, mcycle;
        read_mstatus, write_mstatus, mstatus;
        read_mtvec, write_mtvec, mtvec;
        read_mscratch, write_mscratch, mscratch;
        read_mepc, write_mepc, mepc;
        read_mcause, write_mcause, mcause;
        read_mtval, write_mtval, mtval;
        read_medeleg, write_medeleg, medeleg;
        read_mideleg, write_mideleg, mideleg;
        read_mcounteren, write_mcounteren, mcounteren;
        read_stvec, write_stvec, stvec;
        read_sscratch, write_sscratch, sscratch;
        read_sepc, write_sepc, sepc;
        read_scause, write_scause, scause;
        read_stval, write_stval, stval;
        read_satp, write_satp, satp;
        read_scounteren, write_scounteren, scounteren;
        read_ilrsc, write_ilrsc, ilrsc;
    }

    fn read_mie(&mut self) -> Result<u64, Infallible> {
        Ok(self.s.mie)
    }

    fn write_mie(&mut self, val: u64) -> Result<(), Infallible> {
        self.s.mie = val;
        self.s.set_brk_from_all();
        Ok(())
    }

    fn read_mip(&mut self) -> Result<u64, Infallible> {
        Ok(self.s.mip)
    }

    fn write_mip(&mut self, val: u64) -> Result<(), Infallible> {
        self.s.mip = val & mip::ALL;
        self.s.set_brk_from_all();
        Ok(())
    }

    fn read_mvendorid(&mut self) -> Result<u64, Infallible> {
        Ok(crate::riscv::MVENDORID_INIT)
    }

    fn read_marchid(&mut self) -> Result<u64, Infallible> {
        Ok(crate::riscv::MARCHID_INIT)
    }

    fn read_mimpid(&mut self) -> Result<u64, Infallible> {
        Ok(crate::riscv::MIMPID_INIT)
    }

    fn read_misa(&mut self) -> Result<u64, Infallible> {
        Ok(self.s.misa)
    }

    fn read_iflags_h(&mut self) -> Result<bool, Infallible> {
        Ok(self.s.iflags.h)
    }

    fn read_iflags_y(&mut self) -> Result<bool, Infallible> {
        Ok(self.s.iflags.y)
    }

    fn read_iflags_i(&mut self) -> Result<bool, Infallible> {
        Ok(self.s.iflags.i)
    }

    fn set_iflags_h(&mut self) -> Result<(), Infallible> {
        self.s.iflags.h = true;
        self.s.or_brk_with_iflags_h();
        Ok(())
    }

    fn set_iflags_y(&mut self) -> Result<(), Infallible> {
        self.s.iflags.y = true;
        self.s.or_brk_with_iflags_y();
        Ok(())
    }

    fn set_iflags_i(&mut self) -> Result<(), Infallible> {
        self.s.iflags.i = true;
        Ok(())
    }

    fn reset_iflags_y(&mut self) -> Result<(), Infallible> {
        self.s.iflags.y = false;
        Ok(())
    }

    fn reset_iflags_i(&mut self) -> Result<(), Infallible> {
        self.s.iflags.i = false;
        Ok(())
    }

    fn read_iflags_prv(&mut self) -> Result<u8, Infallible> {
        Ok(self.s.iflags.prv)
    }

    fn write_iflags_prv(&mut self, val: u8) -> Result<(), Infallible> {
        self.s.iflags.prv = val & 3;
        Ok(())
    }

    fn read_clint_mtimecmp(&mut self) -> Result<u64, Infallible> {
        Ok(self.s.clint_mtimecmp)
    }

    fn write_clint_mtimecmp(&mut self, val: u64) -> Result<(), Infallible> {
        self.s.clint_mtimecmp = val;
        Ok(())
    }

    fn read_htif_tohost(&mut self) -> Result<u64, Infallible> {
        Ok(self.s.htif_tohost)
    }

    fn write_htif_tohost(&mut self, val: u64) -> Result<(), Infallible> {
        self.s.htif_tohost = val;
        self.s.or_brk_with_iflags_y();
        Ok(())
    }

    fn read_htif_fromhost(&mut self) -> Result<u64, Infallible> {
        Ok(self.s.htif_fromhost)
    }

    fn write_htif_fromhost(&mut self, val: u64) -> Result<(), Infallible> {
        self.s.htif_fromhost = val;
        Ok(())
    }

    fn read_htif_ihalt(&mut self) -> Result<u64, Infallible> {
        Ok(self.s.htif_ihalt)
    }

    fn read_htif_iconsole(&mut self) -> Result<u64, Infallible> {
        Ok(self.s.htif_iconsole)
    }

    fn read_htif_iyield(&mut self) -> Result<u64, Infallible> {
        Ok(self.s.htif_iyield)
    }

    fn write_console_byte(&mut self, byte: u8) -> Result<(), Infallible> {
        self.s.console.putchar(byte);
        Ok(())
    }

    fn read_pma_istart(&mut self, i: usize) -> Result<u64, Infallible> {
        Ok(self
            .s
            .pmas
            .get(i)
            .map_or_else(crate::pma::empty_istart, |e| e.istart()))
    }

    fn read_pma_ilength(&mut self, i: usize) -> Result<u64, Infallible> {
        Ok(self.s.pmas.get(i).map_or(0, |e| e.ilength()))
    }

    fn find_pma_entry<T: MemoryWord>(&mut self, paddr: u64) -> Result<PmaView, Infallible> {
        Ok(self
            .s
            .pmas
            .find(paddr, T::SIZE)
            .map_or_else(PmaView::empty, |e| e.view()))
    }

    fn read_memory<T: MemoryWord>(&mut self, paddr: u64) -> Result<T, Infallible> {
        let entry = match self.s.pmas.find(paddr, T::SIZE) {
            Some(e) => e,
            None => unreachable!("memory read outside any registered range"),
        };
        let offset = (paddr - entry.start()) as usize;
        let bytes = match entry.body() {
            PmaBody::Memory(m) => m.bytes(),
            _ => unreachable!("memory read on a non-memory range"),
        };
        let mut val = 0u64;
        for (i, b) in bytes[offset..offset + T::SIZE as usize].iter().enumerate() {
            val |= (*b as u64) << (8 * i);
        }
        Ok(T::from_u64(val))
    }

    fn write_memory<T: MemoryWord>(&mut self, paddr: u64, val: T) -> Result<(), Infallible> {
        let entry = match self.s.pmas.find_mut(paddr, T::SIZE) {
            Some(e) => e,
            None => unreachable!("memory write outside any registered range"),
        };
        let start = entry.start();
        let memory = match entry.memory_mut() {
            Some(m) => m,
            None => unreachable!("memory write on a non-memory range"),
        };
        let offset = paddr - start;
        let raw = val.to_u64();
        let dst = &mut memory.bytes_mut()[offset as usize..(offset + T::SIZE) as usize];
        dst.copy_from_slice(&raw.to_le_bytes()[..T::SIZE as usize]);
        memory.mark_dirty(offset);
        Ok(())
    }

    fn push_bracket(&mut self, _ty: BracketType, _text: &str) {}

    fn make_scoped_note(&mut self, _text: &str) {}
}
