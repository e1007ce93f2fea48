//! Machine-level scenarios: boot, HTIF, CLINT timer, traps, flash drives.

use std::io::Write;
use std::sync::{Arc, Mutex};

use stepvm_machine::asm::*;
use stepvm_machine::layout::{HTIF_START, RAM_START};
use stepvm_machine::riscv::{cause, csr, mip};
use stepvm_machine::state::Console;
use stepvm_machine::{Machine, MachineConfig, MachineError, RunStatus};

/// Console sink capturing bytes for inspection.
#[derive(Clone, Default)]
struct CaptureSink(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn machine_with_boot(insns: &[u32]) -> Machine {
    let config = MachineConfig {
        ram_size: 4 << 20,
        boot_image: assemble_image(insns),
        ..MachineConfig::default()
    };
    Machine::new(config).unwrap()
}

/// `li rd, imm` for a 12-bit immediate.
fn li(rd: u32, imm: i32) -> u32 {
    assemble_addi(rd, 0, imm)
}

/// `slli rd, rs1, shamt`.
fn slli(rd: u32, rs1: u32, shamt: i32) -> u32 {
    assemble_i(0b0010011, rd, 0b001, rs1, shamt)
}

/// The HTIF shutdown sequence: `tohost = 1`.
fn halt_insns() -> [u32; 3] {
    [
        li(5, 1),
        assemble_lui(6, 0x4000_8000),
        assemble_sd(6, 5, 0),
    ]
}

#[test]
fn boot_trampoline_reaches_ram() {
    // The boot image halts immediately; reaching the halt proves the
    // trampoline jumped to RAM_START with the FDT address in a1 and the
    // hart id in a0.
    let [h0, h1, h2] = halt_insns();
    let mut machine = machine_with_boot(&[h0, h1, h2, assemble_self_loop()]);
    assert_eq!(machine.state.pc, 0x1000);
    let status = machine.run(100_000);
    assert_eq!(status, RunStatus::Halted);
    assert_eq!(machine.state.x[11], 0x1040, "a1 points at the FDT");
    assert_eq!(machine.state.x[10], 0, "a0 holds mhartid");
}

#[test]
fn htif_shutdown_halts_before_bound() {
    let [h0, h1, h2] = halt_insns();
    let mut machine = machine_with_boot(&[h0, h1, h2, assemble_self_loop()]);
    let status = machine.run(1_000_000);
    assert_eq!(status, RunStatus::Halted);
    assert!(machine.state.iflags.h);
    assert!(machine.state.mcycle < 1_000_000);
}

#[test]
fn htif_putchar_emits_byte_and_acknowledges() {
    // tohost = (1 << 56) | (1 << 48) | 'A', then halt.
    let [h0, h1, h2] = halt_insns();
    let mut machine = machine_with_boot(&[
        li(5, 0x101),
        slli(5, 5, 48),
        assemble_addi(5, 5, 0x41),
        assemble_lui(6, 0x4000_8000),
        assemble_sd(6, 5, 0),
        h0,
        h1,
        h2,
        assemble_self_loop(),
    ]);
    let sink = CaptureSink::default();
    machine.state.console = Console::new(Box::new(sink.clone()));

    let status = machine.run(100_000);
    assert_eq!(status, RunStatus::Halted);
    assert_eq!(*sink.0.lock().unwrap(), b"A");
    assert_eq!(machine.state.htif_fromhost, (1 << 56) | (1 << 48));
}

#[test]
fn htif_putchar_clears_tohost() {
    let mut machine = machine_with_boot(&[
        li(5, 0x101),
        slli(5, 5, 48),
        assemble_addi(5, 5, 0x41),
        assemble_lui(6, 0x4000_8000),
        assemble_sd(6, 5, 0),
        assemble_self_loop(),
    ]);
    let sink = CaptureSink::default();
    machine.state.console = Console::new(Box::new(sink.clone()));
    machine.run(10_000);
    assert_eq!(machine.state.htif_tohost, 0);
    assert_eq!(machine.state.htif_fromhost, (1 << 56) | (1 << 48));
    assert_eq!(*sink.0.lock().unwrap(), b"A");
}

#[test]
fn clint_timer_sets_mtip_after_deadline() {
    // mtimecmp = 5 ticks = 500 cycles.
    let mut machine = machine_with_boot(&[
        li(5, 5),
        assemble_lui(6, 0x0200_4000),
        assemble_sd(6, 5, 0),
        assemble_self_loop(),
    ]);
    machine.run(400);
    assert_eq!(machine.state.mip & mip::MTIP, 0, "timer not due yet");
    machine.run(600);
    assert_ne!(machine.state.mip & mip::MTIP, 0, "timer due at mcycle 500");
}

#[test]
fn mtimecmp_write_clears_mtip() {
    // A machine that never programs the timer sees MTIP from the start
    // (mtimecmp defaults to zero, so the deadline has long passed).
    let mut machine = machine_with_boot(&[assemble_self_loop()]);
    machine.run(10);
    assert_ne!(machine.state.mip & mip::MTIP, 0);

    // Writing a future deadline clears a pending MTIP synchronously.
    let mut machine = machine_with_boot(&[
        assemble_lui(6, 0x0200_4000),
        li(5, 0x7ff),
        slli(5, 5, 40),
        assemble_sd(6, 5, 0),
        assemble_self_loop(),
    ]);
    machine.state.pc = RAM_START;
    machine.state.set_mip(mip::MTIP);
    machine.run(10);
    assert_eq!(machine.state.mip & mip::MTIP, 0, "write cleared MTIP");
}

#[test]
fn wfi_skips_idle_time() {
    // Program the timer, point mtvec at a halt stub, enable the machine
    // timer interrupt, and go to sleep.
    let [h0, h1, h2] = halt_insns();
    let mut machine = machine_with_boot(&[
        li(5, 5),
        assemble_lui(6, 0x0200_4000),
        assemble_sd(6, 5, 0), // mtimecmp = 5 ticks
        li(7, 1),
        slli(7, 7, 31),
        assemble_addi(7, 7, 0x40), // t2 = RAM_START + 0x40
        assemble_csrrw(0, csr::MTVEC, 7),
        li(5, 0x80),
        assemble_csrrw(0, csr::MIE, 5), // mie = MTIP
        li(5, 8),
        assemble_csrrw(0, csr::MSTATUS, 5), // mstatus.MIE = 1
        assemble_wfi(),
        assemble_self_loop(),
        assemble_nop(),
        assemble_nop(),
        assemble_nop(),
        // 0x40: timer handler halts the machine.
        h0,
        h1,
        h2,
        assemble_self_loop(),
    ]);
    machine.state.pc = RAM_START;
    let status = machine.run(1_000_000);
    assert_eq!(status, RunStatus::Halted);
    assert!(machine.state.mcycle >= 500, "slept to the timer deadline");
    assert!(
        machine.state.minstret < 50,
        "idle time was skipped, not executed ({} retired)",
        machine.state.minstret
    );
    assert_eq!(
        machine.state.mcause,
        cause::INTERRUPT_FLAG | 7,
        "machine timer interrupt was delivered"
    );
}

#[test]
fn misaligned_load_traps() {
    let mut machine = machine_with_boot(&[
        assemble_lw(5, 0, 1), // lw t0, 1(x0): misaligned
        assemble_self_loop(),
    ]);
    machine.state.pc = RAM_START;
    machine.run(1);
    assert_eq!(machine.state.mcause, cause::LOAD_ADDRESS_MISALIGNED);
    assert_eq!(machine.state.mtval, 1);
    assert_eq!(machine.state.mepc, RAM_START);
    assert_eq!(machine.state.iflags.prv, 3, "still in machine mode");
}

#[test]
fn unmapped_load_faults() {
    let mut machine = machine_with_boot(&[
        assemble_lui(6, 0x6000_0000),
        assemble_ld(5, 6, 0), // no range covers 0x60000000
        assemble_self_loop(),
    ]);
    machine.state.pc = RAM_START;
    machine.run(2);
    assert_eq!(machine.state.mcause, cause::LOAD_ACCESS_FAULT);
    assert_eq!(machine.state.mtval, 0x6000_0000);
}

#[test]
fn shadow_is_not_guest_accessible() {
    let mut machine = machine_with_boot(&[
        assemble_ld(5, 0, 0), // ld t0, 0(x0): the shadow range
        assemble_self_loop(),
    ]);
    machine.state.pc = RAM_START;
    machine.run(1);
    assert_eq!(machine.state.mcause, cause::LOAD_ACCESS_FAULT);
}

#[test]
fn ecall_from_machine_mode() {
    let mut machine = machine_with_boot(&[assemble_ecall(), assemble_self_loop()]);
    machine.state.pc = RAM_START;
    machine.run(1);
    assert_eq!(machine.state.mcause, cause::ECALL_FROM_M);
    assert_eq!(machine.state.mepc, RAM_START);
}

#[test]
fn x0_writes_have_no_effect() {
    let mut machine = machine_with_boot(&[assemble_addi(0, 0, 1), assemble_self_loop()]);
    machine.state.pc = RAM_START;
    machine.run(1);
    assert_eq!(machine.state.x[0], 0);
}

#[test]
fn mcycle_is_monotonic() {
    let mut machine = machine_with_boot(&[assemble_self_loop()]);
    let mut last = machine.state.mcycle;
    for bound in [10u64, 100, 1000] {
        machine.run(bound);
        assert!(machine.state.mcycle >= last);
        last = machine.state.mcycle;
    }
}

#[test]
fn loads_and_stores_round_trip() {
    let mut machine = machine_with_boot(&[
        assemble_auipc(6, 0x1000), // t1 = RAM_START + 0x1000
        li(5, 0x42),
        assemble_sd(6, 5, 0),
        assemble_ld(7, 6, 0),
        assemble_sb(6, 5, 9),
        assemble_self_loop(),
    ]);
    machine.state.pc = RAM_START;
    machine.run(5);
    assert_eq!(machine.state.x[7], 0x42);
    assert_eq!(machine.read_word(0x8000_1000), Some(0x42));
    assert_eq!(machine.read_word(0x8000_1008), Some(0x42 << 8));
}

#[test]
fn private_flash_leaves_backing_untouched() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[0xabu8; 4096]).unwrap();
    file.flush().unwrap();

    let flash_start = 0x9000_0000u64;
    let config = MachineConfig {
        ram_size: 4 << 20,
        boot_image: assemble_image(&[
            assemble_auipc(6, 0x1000_0000), // t1 = flash_start (pc = RAM_START)
            li(5, 0x55),
            assemble_sd(6, 5, 0),
            assemble_self_loop(),
        ]),
        flash: vec![stepvm_machine::FlashConfig {
            start: flash_start,
            length: 4096,
            backing: file.path().to_owned(),
            label: "test".into(),
            shared: false,
        }],
        ..MachineConfig::default()
    };
    let mut machine = Machine::new(config).unwrap();
    machine.state.pc = RAM_START;
    machine.run(3);
    // The target sees its write...
    assert_eq!(machine.read_word(flash_start), Some(0x55));
    // ...but the backing file is untouched (copy-on-write).
    let content = std::fs::read(file.path()).unwrap();
    assert!(content.iter().all(|&b| b == 0xab));
}

#[test]
fn flash_content_is_visible_to_the_guest() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let mut content = vec![0u8; 4096];
    content[..8].copy_from_slice(&0xfeed_face_u64.to_le_bytes());
    file.write_all(&content).unwrap();
    file.flush().unwrap();

    let config = MachineConfig {
        ram_size: 4 << 20,
        boot_image: assemble_image(&[
            assemble_auipc(6, 0x1000_0000),
            assemble_ld(5, 6, 0),
            assemble_self_loop(),
        ]),
        flash: vec![stepvm_machine::FlashConfig {
            start: 0x9000_0000,
            length: 4096,
            backing: file.path().to_owned(),
            label: "test".into(),
            shared: false,
        }],
        ..MachineConfig::default()
    };
    let mut machine = Machine::new(config).unwrap();
    machine.state.pc = RAM_START;
    machine.run(2);
    assert_eq!(machine.state.x[5], 0xfeed_face);
}

#[test]
fn flash_length_must_match_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[0u8; 4096]).unwrap();
    file.flush().unwrap();

    let config = MachineConfig {
        ram_size: 4 << 20,
        boot_image: vec![0x13, 0, 0, 0],
        flash: vec![stepvm_machine::FlashConfig {
            start: 0x9000_0000,
            length: 8192,
            backing: file.path().to_owned(),
            label: "test".into(),
            shared: false,
        }],
        ..MachineConfig::default()
    };
    assert!(matches!(
        Machine::new(config),
        Err(MachineError::BackingSizeMismatch { .. })
    ));
}

#[test]
fn missing_boot_image_is_fatal() {
    let config = MachineConfig::default();
    assert!(matches!(Machine::new(config), Err(MachineError::NoBootImage)));
}

#[test]
fn oversized_boot_image_is_fatal() {
    let config = MachineConfig {
        ram_size: 4096,
        boot_image: vec![0u8; 8192],
        ..MachineConfig::default()
    };
    assert!(matches!(
        Machine::new(config),
        Err(MachineError::BootImageTooBig { .. })
    ));
}

#[test]
fn fromhost_is_readable_by_the_guest() {
    let mut machine = machine_with_boot(&[
        assemble_lui(6, 0x4000_8000),
        assemble_ld(5, 6, 8), // t0 = fromhost
        assemble_self_loop(),
    ]);
    machine.state.htif_fromhost = 0x1234;
    machine.state.pc = RAM_START;
    machine.run(2);
    assert_eq!(machine.state.x[5], 0x1234);
}

#[test]
fn htif_control_words_are_fixed() {
    let machine = machine_with_boot(&[assemble_nop()]);
    assert_eq!(machine.state.htif_ihalt, 1);
    assert_eq!(machine.state.htif_iconsole, 3);
    assert_eq!(machine.read_word(HTIF_START + 0x10), Some(1));
}
