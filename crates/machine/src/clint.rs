//! CLINT: the core-local interrupter.
//!
//! Provides the target's view of time (`mtime`, derived from `mcycle`) and
//! the timer compare register. The handlers run generically over the
//! state-access surface, so a logged step records CLINT traffic as the same
//! word accesses the verifier replays.

use crate::access::StateAccess;
use crate::layout::{CLINT_LENGTH, CLINT_START, PAGE_SIZE};
use crate::riscv::mip;
use crate::rtc;
use crate::state::MachineState;

/// Relative addresses within the CLINT range.
pub const CLINT_MSIP0_REL_ADDR: u64 = 0;
pub const CLINT_MTIMECMP_REL_ADDR: u64 = 0x4000;
pub const CLINT_MTIME_REL_ADDR: u64 = 0xbff8;

/// Handle a read from the CLINT range. Returns `None` for offsets or sizes
/// the device does not serve (the caller turns that into a target fault).
pub fn mmio_read<A: StateAccess>(
    a: &mut A,
    offset: u64,
    log2_size: u32,
) -> Result<Option<u64>, A::Error> {
    match (offset, log2_size) {
        (CLINT_MSIP0_REL_ADDR, 2) => {
            let mip_val = a.read_mip()?;
            Ok(Some((mip_val & mip::MSIP != 0) as u64))
        }
        (CLINT_MTIMECMP_REL_ADDR, 3) => Ok(Some(a.read_clint_mtimecmp()?)),
        (CLINT_MTIMECMP_REL_ADDR, 2) => Ok(Some(a.read_clint_mtimecmp()? & 0xffff_ffff)),
        (0x4004, 2) => Ok(Some(a.read_clint_mtimecmp()? >> 32)),
        (CLINT_MTIME_REL_ADDR, 3) => Ok(Some(rtc::cycles_to_time(a.read_mcycle()?))),
        (CLINT_MTIME_REL_ADDR, 2) => Ok(Some(rtc::cycles_to_time(a.read_mcycle()?) & 0xffff_ffff)),
        (0xbffc, 2) => Ok(Some(rtc::cycles_to_time(a.read_mcycle()?) >> 32)),
        _ => Ok(None),
    }
}

/// Handle a write to the CLINT range. Returns `false` for offsets or sizes
/// the device does not serve. Writing `mtimecmp` clears `MIP.MTIP`
/// synchronously.
pub fn mmio_write<A: StateAccess>(
    a: &mut A,
    offset: u64,
    val: u64,
    log2_size: u32,
) -> Result<bool, A::Error> {
    match (offset, log2_size) {
        (CLINT_MSIP0_REL_ADDR, 2) => {
            let mip_val = a.read_mip()?;
            if val & 1 != 0 {
                a.write_mip(mip_val | mip::MSIP)?;
            } else {
                a.write_mip(mip_val & !mip::MSIP)?;
            }
            Ok(true)
        }
        (CLINT_MTIMECMP_REL_ADDR, 3) => {
            a.write_clint_mtimecmp(val)?;
            reset_mtip(a)?;
            Ok(true)
        }
        (CLINT_MTIMECMP_REL_ADDR, 2) => {
            let old = a.read_clint_mtimecmp()?;
            a.write_clint_mtimecmp((old & !0xffff_ffff) | (val & 0xffff_ffff))?;
            reset_mtip(a)?;
            Ok(true)
        }
        (0x4004, 2) => {
            let old = a.read_clint_mtimecmp()?;
            a.write_clint_mtimecmp((old & 0xffff_ffff) | (val << 32))?;
            reset_mtip(a)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn reset_mtip<A: StateAccess>(a: &mut A) -> Result<(), A::Error> {
    let mip_val = a.read_mip()?;
    a.write_mip(mip_val & !mip::MTIP)
}

/// Materialise a page of the CLINT range for hashing. The only state the
/// range carries is `mtimecmp`; `mtime` is derived from `mcycle`, which is
/// already hashed in the shadow.
pub fn clint_peek(s: &MachineState, page_offset: u64) -> Option<[u8; PAGE_SIZE as usize]> {
    if page_offset >= CLINT_LENGTH || page_offset & (PAGE_SIZE - 1) != 0 {
        return None;
    }
    let mut page = [0u8; PAGE_SIZE as usize];
    if page_offset == CLINT_MTIMECMP_REL_ADDR & !(PAGE_SIZE - 1) {
        let rel = (CLINT_MTIMECMP_REL_ADDR & (PAGE_SIZE - 1)) as usize;
        page[rel..rel + 8].copy_from_slice(&s.clint_mtimecmp.to_le_bytes());
    }
    Some(page)
}

/// Physical address of `mtimecmp`.
pub const fn mtimecmp_abs_addr() -> u64 {
    CLINT_START + CLINT_MTIMECMP_REL_ADDR
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeAccess;
    use crate::state::MachineState;

    #[test]
    fn timer_halves_and_mtime_derivation() {
        let mut s = MachineState::new();
        s.mcycle = 12_345;
        s.clint_mtimecmp = 0x1111_2222_3333_4444;
        let mut a = NativeAccess::new(&mut s);
        assert_eq!(
            mmio_read(&mut a, CLINT_MTIMECMP_REL_ADDR, 3).unwrap(),
            Some(0x1111_2222_3333_4444)
        );
        assert_eq!(
            mmio_read(&mut a, CLINT_MTIMECMP_REL_ADDR, 2).unwrap(),
            Some(0x3333_4444)
        );
        assert_eq!(mmio_read(&mut a, 0x4004, 2).unwrap(), Some(0x1111_2222));
        assert_eq!(mmio_read(&mut a, CLINT_MTIME_REL_ADDR, 3).unwrap(), Some(123));
        assert_eq!(mmio_read(&mut a, 0xbffc, 2).unwrap(), Some(0));
        assert_eq!(mmio_read(&mut a, 0x10, 3).unwrap(), None, "unmapped offset");
    }

    #[test]
    fn half_writes_update_mtimecmp_and_clear_mtip() {
        let mut s = MachineState::new();
        s.mip = mip::MTIP;
        let mut a = NativeAccess::new(&mut s);
        assert!(mmio_write(&mut a, CLINT_MTIMECMP_REL_ADDR, 0x4444_3333, 2).unwrap());
        assert!(mmio_write(&mut a, 0x4004, 0x2222_1111, 2).unwrap());
        assert_eq!(s.clint_mtimecmp, 0x2222_1111_4444_3333);
        assert_eq!(s.mip & mip::MTIP, 0);
    }

    #[test]
    fn msip_bit_tracks_mip() {
        let mut s = MachineState::new();
        let mut a = NativeAccess::new(&mut s);
        assert_eq!(mmio_read(&mut a, 0, 2).unwrap(), Some(0));
        assert!(mmio_write(&mut a, 0, 1, 2).unwrap());
        assert_eq!(mmio_read(&mut a, 0, 2).unwrap(), Some(1));
        assert!(mmio_write(&mut a, 0, 0, 2).unwrap());
        assert_eq!(s.mip & mip::MSIP, 0);
    }

    #[test]
    fn peek_exposes_only_mtimecmp() {
        let mut s = MachineState::new();
        s.clint_mtimecmp = 0xabcd;
        let page = clint_peek(&s, CLINT_MTIMECMP_REL_ADDR).unwrap();
        assert_eq!(u64::from_le_bytes(page[0..8].try_into().unwrap()), 0xabcd);
        let page = clint_peek(&s, 0).unwrap();
        assert!(page.iter().all(|&b| b == 0));
        assert!(clint_peek(&s, CLINT_LENGTH).is_none());
    }
}
