//! Step logging and replay verification scenarios.

use stepvm_machine::asm::*;
use stepvm_machine::layout::RAM_START;
use stepvm_machine::shadow::{csr_rel_addr, register_rel_addr, ShadowCsr};
use stepvm_machine::{Machine, MachineConfig};
use stepvm_merkle::MerkleTree;
use stepvm_replay::{step, verify_step, AccessType, LogType, ReplayError};

/// Machine with the given program at RAM_START and the pc already there.
fn boot_machine(insns: &[u32]) -> Machine {
    let config = MachineConfig {
        ram_size: 1 << 20,
        boot_image: assemble_image(insns),
        ..MachineConfig::default()
    };
    let mut machine = Machine::new(config).unwrap();
    machine.state.pc = RAM_START;
    machine
}

fn proofs() -> LogType {
    LogType {
        proofs: true,
        annotations: true,
    }
}

#[test]
fn single_step_log_round_trips() {
    let mut machine = boot_machine(&[assemble_addi(1, 0, 7), assemble_self_loop()]);
    let mut tree = MerkleTree::new();

    let log = step(&mut machine, &mut tree, proofs()).unwrap();
    assert_eq!(machine.state.x[1], 7);
    assert_eq!(machine.state.minstret, 1);
    assert!(!log.is_empty());
    assert_ne!(log.before_root, log.after_root);

    let root = verify_step(&log, log.before_root, true).unwrap();
    assert_eq!(root, log.after_root);
}

#[test]
fn replaying_twice_gives_the_same_outcome() {
    let mut machine = boot_machine(&[assemble_addi(1, 0, 7), assemble_self_loop()]);
    let mut tree = MerkleTree::new();
    let log = step(&mut machine, &mut tree, proofs()).unwrap();

    let first = verify_step(&log, log.before_root, true).unwrap();
    let second = verify_step(&log, log.before_root, true).unwrap();
    assert_eq!(first, second);
}

#[test]
fn identical_machines_produce_identical_roots() {
    let program = [assemble_addi(1, 0, 7), assemble_self_loop()];
    let mut proved = boot_machine(&program);
    let mut proved_tree = MerkleTree::new();
    let mut plain = boot_machine(&program);
    let mut plain_tree = MerkleTree::new();

    let with_proofs = step(&mut proved, &mut proved_tree, proofs()).unwrap();
    let without = step(
        &mut plain,
        &mut plain_tree,
        LogType {
            proofs: false,
            annotations: false,
        },
    )
    .unwrap();

    // Roots are a pure function of the state, with or without proofs.
    assert_eq!(with_proofs.before_root, without.before_root);
    assert_eq!(with_proofs.after_root, without.after_root);
    assert_eq!(with_proofs.len(), without.len());
}

#[test]
fn tampered_written_value_is_detected() {
    let mut machine = boot_machine(&[assemble_addi(1, 0, 7), assemble_self_loop()]);
    let mut tree = MerkleTree::new();
    let mut log = step(&mut machine, &mut tree, proofs()).unwrap();

    let x1_addr = register_rel_addr(1);
    let target = log
        .accesses
        .iter()
        .position(|a| a.access_type == AccessType::Write && a.address == x1_addr)
        .expect("the step writes x1");
    log.accesses[target].written = 9;

    let err = verify_step(&log, log.before_root, true).unwrap_err();
    assert!(
        matches!(err, ReplayError::WrittenValueMismatch { .. }),
        "unexpected error: {err}"
    );
}

#[test]
fn tampered_read_value_is_detected() {
    let mut machine = boot_machine(&[assemble_addi(1, 0, 7), assemble_self_loop()]);
    let mut tree = MerkleTree::new();
    let mut log = step(&mut machine, &mut tree, proofs()).unwrap();

    let target = log
        .accesses
        .iter()
        .position(|a| a.access_type == AccessType::Read)
        .expect("the step reads something");
    log.accesses[target].read ^= 1;

    let err = verify_step(&log, log.before_root, true).unwrap_err();
    assert!(
        matches!(err, ReplayError::TargetHashMismatch { index: i } if i == target + 1),
        "unexpected error: {err}"
    );
}

#[test]
fn truncated_log_is_detected() {
    let mut machine = boot_machine(&[assemble_addi(1, 0, 7), assemble_self_loop()]);
    let mut tree = MerkleTree::new();
    let mut log = step(&mut machine, &mut tree, proofs()).unwrap();

    log.accesses.pop();
    let err = verify_step(&log, log.before_root, true).unwrap_err();
    assert_eq!(err, ReplayError::TooFewAccesses);
}

#[test]
fn wrong_before_root_is_detected() {
    let mut machine = boot_machine(&[assemble_addi(1, 0, 7), assemble_self_loop()]);
    let mut tree = MerkleTree::new();
    let log = step(&mut machine, &mut tree, proofs()).unwrap();

    let err = verify_step(&log, [0x55u8; 32], true).unwrap_err();
    assert_eq!(err, ReplayError::RootHashMismatch { index: 1 });
}

#[test]
fn x0_never_appears_in_the_log() {
    // addi x0, x0, 1: both operand and destination are x0.
    let mut machine = boot_machine(&[assemble_addi(0, 0, 1), assemble_self_loop()]);
    let mut tree = MerkleTree::new();
    let log = step(&mut machine, &mut tree, proofs()).unwrap();

    assert_eq!(machine.state.x[0], 0);
    let x0_addr = register_rel_addr(0);
    assert!(
        log.accesses.iter().all(|a| a.address != x0_addr),
        "no access may touch the x0 shadow word"
    );
    let root = verify_step(&log, log.before_root, true).unwrap();
    assert_eq!(root, log.after_root);
}

#[test]
fn proofless_log_verifies_without_proofs_only() {
    let mut machine = boot_machine(&[assemble_addi(1, 0, 7), assemble_self_loop()]);
    let mut tree = MerkleTree::new();
    let log_type = LogType {
        proofs: false,
        annotations: false,
    };
    let log = step(&mut machine, &mut tree, log_type).unwrap();
    assert!(log.accesses.iter().all(|a| a.proof.is_none()));

    verify_step(&log, log.before_root, false).unwrap();
    let err = verify_step(&log, log.before_root, true).unwrap_err();
    assert_eq!(err, ReplayError::MissingProofs);
}

#[test]
fn serialised_log_still_verifies() {
    let mut machine = boot_machine(&[assemble_addi(1, 0, 7), assemble_self_loop()]);
    let mut tree = MerkleTree::new();
    let log = step(&mut machine, &mut tree, proofs()).unwrap();

    let json = serde_json::to_string(&log).unwrap();
    let back: stepvm_replay::AccessLog = serde_json::from_str(&json).unwrap();
    let root = verify_step(&back, back.before_root, true).unwrap();
    assert_eq!(root, log.after_root);
}

#[test]
fn chained_steps_verify_against_each_other() {
    let mut machine = boot_machine(&[
        assemble_addi(1, 0, 7),
        assemble_addi(2, 1, 1),
        assemble_add(3, 1, 2),
        assemble_mul(4, 3, 3),
        assemble_self_loop(),
    ]);
    let mut tree = MerkleTree::new();

    let mut prev_root = None;
    for _ in 0..5 {
        let log = step(&mut machine, &mut tree, proofs()).unwrap();
        if let Some(prev) = prev_root {
            assert_eq!(log.before_root, prev, "roots chain across steps");
        }
        let root = verify_step(&log, log.before_root, true).unwrap();
        assert_eq!(root, log.after_root);
        prev_root = Some(root);
    }
    assert_eq!(machine.state.x[3], 15);
    assert_eq!(machine.state.x[4], 225);
}

#[test]
fn sub_word_store_replays_the_read_modify_write() {
    let mut machine = boot_machine(&[
        assemble_auipc(6, 0x1000), // t1 = RAM_START + 0x1000
        assemble_addi(5, 0, 0x41),
        assemble_sb(6, 5, 1), // sb t0, 1(t1)
        assemble_self_loop(),
    ]);
    let mut tree = MerkleTree::new();

    for _ in 0..2 {
        let log = step(&mut machine, &mut tree, proofs()).unwrap();
        verify_step(&log, log.before_root, true).unwrap();
    }
    // The store step: its enclosing-word read must be in the log.
    let log = step(&mut machine, &mut tree, proofs()).unwrap();
    let word_addr = RAM_START + 0x1000;
    let reads = log
        .accesses
        .iter()
        .filter(|a| a.access_type == AccessType::Read && a.address == word_addr)
        .count();
    let writes = log
        .accesses
        .iter()
        .filter(|a| a.access_type == AccessType::Write && a.address == word_addr)
        .count();
    assert!(reads >= 2, "explicit pre-image read plus the write pair");
    assert_eq!(writes, 1);
    let root = verify_step(&log, log.before_root, true).unwrap();
    assert_eq!(root, log.after_root);
    assert_eq!(machine.read_word(word_addr), Some(0x41 << 8));
}

#[test]
fn htif_store_step_replays_device_writes() {
    let mut machine = boot_machine(&[
        assemble_addi(5, 0, 0x101),
        assemble_i(0b0010011, 5, 0b001, 5, 48), // slli t0, t0, 48
        assemble_addi(5, 5, 0x41),
        assemble_lui(6, 0x4000_8000),
        assemble_sd(6, 5, 0),
        assemble_self_loop(),
    ]);
    let mut tree = MerkleTree::new();

    for _ in 0..4 {
        let log = step(&mut machine, &mut tree, proofs()).unwrap();
        verify_step(&log, log.before_root, true).unwrap();
    }
    // The tohost store: putchar clears tohost and acknowledges on fromhost.
    let log = step(&mut machine, &mut tree, proofs()).unwrap();
    let root = verify_step(&log, log.before_root, true).unwrap();
    assert_eq!(root, log.after_root);
    assert_eq!(machine.state.htif_tohost, 0);
    assert_eq!(machine.state.htif_fromhost, (1 << 56) | (1 << 48));
}

#[test]
fn halted_machine_step_is_a_single_read() {
    let mut machine = boot_machine(&[assemble_self_loop()]);
    machine.state.iflags.h = true;
    machine.state.set_brk_from_all();
    let mut tree = MerkleTree::new();

    let log = step(&mut machine, &mut tree, proofs()).unwrap();
    assert_eq!(log.len(), 1, "only the iflags.H read");
    assert_eq!(
        log.accesses[0].address,
        csr_rel_addr(ShadowCsr::Iflags),
        "the halt check reads iflags"
    );
    assert_eq!(log.before_root, log.after_root);
    let root = verify_step(&log, log.before_root, true).unwrap();
    assert_eq!(root, log.after_root);
}

#[test]
fn trap_step_verifies() {
    // A load from an unmapped address: the step is the trap delivery.
    let mut machine = boot_machine(&[
        assemble_lui(6, 0x6000_0000),
        assemble_ld(5, 6, 0),
        assemble_self_loop(),
    ]);
    let mut tree = MerkleTree::new();

    let log = step(&mut machine, &mut tree, proofs()).unwrap();
    verify_step(&log, log.before_root, true).unwrap();
    let log = step(&mut machine, &mut tree, proofs()).unwrap();
    let root = verify_step(&log, log.before_root, true).unwrap();
    assert_eq!(root, log.after_root);
    assert_eq!(machine.state.mcause, 5, "load access fault was delivered");
    assert_eq!(machine.state.minstret, 1, "the faulting load did not retire");
}
