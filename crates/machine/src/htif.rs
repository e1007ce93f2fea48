//! HTIF: the host/target interface.
//!
//! A two-word mailbox (`tohost`, `fromhost`) plus three read-only masks
//! describing which commands the host accepts. Command encoding:
//! `device[63:56] | cmd[55:48] | payload[47:0]`.

use crate::access::StateAccess;
use crate::layout::{HTIF_LENGTH, HTIF_START, PAGE_SIZE};
use crate::state::MachineState;

/// Relative addresses within the HTIF range.
pub const HTIF_TOHOST_REL_ADDR: u64 = 0x00;
pub const HTIF_FROMHOST_REL_ADDR: u64 = 0x08;
pub const HTIF_IHALT_REL_ADDR: u64 = 0x10;
pub const HTIF_ICONSOLE_REL_ADDR: u64 = 0x18;
pub const HTIF_IYIELD_REL_ADDR: u64 = 0x20;

/// Device numbers.
pub const DEV_HALT: u64 = 0;
pub const DEV_CONSOLE: u64 = 1;
pub const DEV_YIELD: u64 = 2;

/// Console commands.
pub const CONSOLE_GETCHAR: u64 = 0;
pub const CONSOLE_PUTCHAR: u64 = 1;

#[inline]
pub const fn dev_field(tohost: u64) -> u64 {
    tohost >> 56
}

#[inline]
pub const fn cmd_field(tohost: u64) -> u64 {
    (tohost >> 48) & 0xff
}

#[inline]
pub const fn payload_field(tohost: u64) -> u64 {
    tohost & ((1 << 48) - 1)
}

#[inline]
pub const fn build(dev: u64, cmd: u64, payload: u64) -> u64 {
    (dev << 56) | (cmd << 48) | (payload & ((1 << 48) - 1))
}

/// Handle a read from the HTIF range.
pub fn mmio_read<A: StateAccess>(
    a: &mut A,
    offset: u64,
    log2_size: u32,
) -> Result<Option<u64>, A::Error> {
    match (offset, log2_size) {
        (HTIF_TOHOST_REL_ADDR, 3) => Ok(Some(a.read_htif_tohost()?)),
        (HTIF_TOHOST_REL_ADDR, 2) => Ok(Some(a.read_htif_tohost()? & 0xffff_ffff)),
        (0x04, 2) => Ok(Some(a.read_htif_tohost()? >> 32)),
        (HTIF_FROMHOST_REL_ADDR, 3) => Ok(Some(a.read_htif_fromhost()?)),
        (HTIF_FROMHOST_REL_ADDR, 2) => Ok(Some(a.read_htif_fromhost()? & 0xffff_ffff)),
        (0x0c, 2) => Ok(Some(a.read_htif_fromhost()? >> 32)),
        (HTIF_IHALT_REL_ADDR, 3) => Ok(Some(a.read_htif_ihalt()?)),
        (HTIF_ICONSOLE_REL_ADDR, 3) => Ok(Some(a.read_htif_iconsole()?)),
        (HTIF_IYIELD_REL_ADDR, 3) => Ok(Some(a.read_htif_iyield()?)),
        _ => Ok(None),
    }
}

/// Handle a write to the HTIF range. A completed `tohost` write (the full
/// word, or its high half) triggers command handling.
pub fn mmio_write<A: StateAccess>(
    a: &mut A,
    offset: u64,
    val: u64,
    log2_size: u32,
) -> Result<bool, A::Error> {
    match (offset, log2_size) {
        (HTIF_TOHOST_REL_ADDR, 3) => {
            a.write_htif_tohost(val)?;
            handle_tohost(a, val)?;
            Ok(true)
        }
        (HTIF_TOHOST_REL_ADDR, 2) => {
            let old = a.read_htif_tohost()?;
            a.write_htif_tohost((old & !0xffff_ffff) | (val & 0xffff_ffff))?;
            Ok(true)
        }
        (0x04, 2) => {
            let old = a.read_htif_tohost()?;
            let new = (old & 0xffff_ffff) | (val << 32);
            a.write_htif_tohost(new)?;
            handle_tohost(a, new)?;
            Ok(true)
        }
        (HTIF_FROMHOST_REL_ADDR, 3) => {
            a.write_htif_fromhost(val)?;
            Ok(true)
        }
        (HTIF_FROMHOST_REL_ADDR, 2) => {
            let old = a.read_htif_fromhost()?;
            a.write_htif_fromhost((old & !0xffff_ffff) | (val & 0xffff_ffff))?;
            Ok(true)
        }
        (0x0c, 2) => {
            let old = a.read_htif_fromhost()?;
            a.write_htif_fromhost((old & 0xffff_ffff) | (val << 32))?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Decode and execute a completed `tohost` command.
fn handle_tohost<A: StateAccess>(a: &mut A, tohost: u64) -> Result<(), A::Error> {
    let dev = dev_field(tohost);
    let cmd = cmd_field(tohost);
    let payload = payload_field(tohost);
    match (dev, cmd) {
        (DEV_HALT, 0) if payload & 1 != 0 => {
            a.set_iflags_h()?;
        }
        (DEV_CONSOLE, CONSOLE_PUTCHAR) => {
            a.write_console_byte(payload as u8)?;
            a.write_htif_tohost(0)?;
            a.write_htif_fromhost(build(DEV_CONSOLE, CONSOLE_PUTCHAR, 0))?;
        }
        (DEV_CONSOLE, CONSOLE_GETCHAR) => {
            // Keyboard interrupt request; input arrives via fromhost.
            a.write_htif_tohost(0)?;
        }
        (DEV_YIELD, _) => {
            let iyield = a.read_htif_iyield()?;
            if (iyield >> cmd) & 1 != 0 {
                // tohost keeps the command: the wake-up derivation reads it.
                a.set_iflags_y()?;
            }
        }
        _ => {
            tracing::warn!(tohost, dev, cmd, "unsupported HTIF command");
        }
    }
    Ok(())
}

/// Materialise the HTIF page for hashing.
pub fn htif_peek(s: &MachineState, page_offset: u64) -> Option<[u8; PAGE_SIZE as usize]> {
    if page_offset >= HTIF_LENGTH || page_offset & (PAGE_SIZE - 1) != 0 {
        return None;
    }
    let mut page = [0u8; PAGE_SIZE as usize];
    let mut put = |rel: u64, val: u64| {
        page[rel as usize..rel as usize + 8].copy_from_slice(&val.to_le_bytes());
    };
    put(HTIF_TOHOST_REL_ADDR, s.htif_tohost);
    put(HTIF_FROMHOST_REL_ADDR, s.htif_fromhost);
    put(HTIF_IHALT_REL_ADDR, s.htif_ihalt);
    put(HTIF_ICONSOLE_REL_ADDR, s.htif_iconsole);
    put(HTIF_IYIELD_REL_ADDR, s.htif_iyield);
    Some(page)
}

/// Physical address of `tohost`.
pub const fn tohost_abs_addr() -> u64 {
    HTIF_START + HTIF_TOHOST_REL_ADDR
}

/// Physical address of `fromhost`.
pub const fn fromhost_abs_addr() -> u64 {
    HTIF_START + HTIF_FROMHOST_REL_ADDR
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeAccess;
    use crate::state::{Console, MachineState};

    fn quiet_state() -> MachineState {
        let mut s = MachineState::new();
        s.console = Console::new(Box::new(std::io::sink()));
        s
    }

    #[test]
    fn field_encoding_round_trips() {
        let word = build(2, 3, 0x41);
        assert_eq!(dev_field(word), 2);
        assert_eq!(cmd_field(word), 3);
        assert_eq!(payload_field(word), 0x41);
    }

    #[test]
    fn halt_command_sets_the_halt_flag() {
        let mut s = quiet_state();
        let mut a = NativeAccess::new(&mut s);
        assert!(mmio_write(&mut a, 0, 1, 3).unwrap());
        assert!(s.iflags.h);
        assert!(s.brk);
    }

    #[test]
    fn putchar_in_two_half_writes() {
        let mut s = quiet_state();
        let word = build(DEV_CONSOLE, CONSOLE_PUTCHAR, b'Z' as u64);
        let mut a = NativeAccess::new(&mut s);
        assert!(mmio_write(&mut a, 0, word & 0xffff_ffff, 2).unwrap());
        // The command runs only once the high half lands.
        assert!(mmio_write(&mut a, 4, word >> 32, 2).unwrap());
        assert_eq!(s.htif_tohost, 0);
        assert_eq!(s.htif_fromhost, build(DEV_CONSOLE, CONSOLE_PUTCHAR, 0));
    }

    #[test]
    fn getchar_request_clears_tohost() {
        let mut s = quiet_state();
        let word = build(DEV_CONSOLE, CONSOLE_GETCHAR, 0);
        let mut a = NativeAccess::new(&mut s);
        assert!(mmio_write(&mut a, 0, word, 3).unwrap());
        assert_eq!(s.htif_tohost, 0);
        assert_eq!(s.htif_fromhost, 0);
    }

    #[test]
    fn yield_respects_the_mask() {
        let mut s = quiet_state();
        let word = build(DEV_YIELD, 1, 0);
        let mut a = NativeAccess::new(&mut s);
        assert!(mmio_write(&mut a, 0, word, 3).unwrap());
        assert!(!s.iflags.y, "command not accepted by the mask");

        let mut s = quiet_state();
        s.htif_iyield = 1 << 1;
        let mut a = NativeAccess::new(&mut s);
        assert!(mmio_write(&mut a, 0, word, 3).unwrap());
        assert!(s.iflags.y);
        assert_eq!(s.htif_tohost, word, "tohost keeps the yield command");
        assert!(s.brk);
    }
}
