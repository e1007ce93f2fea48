//! The RV64IMA interpreter, generic over the state-access surface.
//!
//! Every architectural touch goes through [`StateAccess`], so the same code
//! drives the native run loop, the logging step, and the replay
//! verification; the three are monomorphised separately and must issue
//! accesses in identical order. Host-side loop control (`done`, `brk`) is
//! the only state the access surface exposes without logging.
//!
//! Target faults never escape to the host: they become RISC-V exceptions
//! delivered to M or S mode with proper `mcause`/`mepc`/`mtval`.

use crate::access::{MemoryWord, StateAccess};
use crate::decode::{
    amo_funct5, branch_funct3, funct7, load_funct3, op_funct3, opcode, priv_imm, store_funct3,
    system_funct3, Insn,
};
use crate::pma::{PmaDid, PmaView};
use crate::riscv::{cause, csr, mip, mstatus, prv, MISA_INIT};
use crate::{clint, htif, rtc};

/// Why the interpreter loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunBreak {
    /// mcycle reached the requested bound.
    ReachedTarget,
    /// The machine is permanently halted.
    Halted,
    /// A WFI went to sleep; the host may skip time.
    Idle,
    /// The brk flag fired (yield or pending interrupt work).
    Broke,
}

/// A target-visible fault, delivered as a RISC-V exception.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Exception {
    pub cause: u64,
    pub tval: u64,
}

impl Exception {
    pub fn new(cause: u64, tval: u64) -> Self {
        Self { cause, tval }
    }

    fn illegal(insn: Insn) -> Self {
        Self::new(cause::ILLEGAL_INSN, insn.0 as u64)
    }
}

enum StepOutcome {
    Retired,
    Trapped,
    Idled,
}

enum Next {
    Pc(u64),
    Idle(u64),
}

/// Unwrap the guest layer of a nested `Result`, propagating an exception to
/// the caller's guest layer.
macro_rules! guest {
    ($e:expr) => {
        match $e? {
            Ok(v) => v,
            Err(exc) => return Ok(Err(exc)),
        }
    };
}

/// Run the interpreter until `mcycle_end`, halt, idle, or brk.
///
/// Each iteration is one step: a halt check, interrupt delivery if one is
/// pending and enabled, and one fetch-decode-execute (which may itself trap).
/// `mcycle` advances once per iteration; `minstret` only on retirement.
pub fn interpret<A: StateAccess>(a: &mut A, mcycle_end: u64) -> Result<RunBreak, A::Error> {
    while !a.done(mcycle_end) {
        if a.read_iflags_h()? {
            return Ok(RunBreak::Halted);
        }
        raise_interrupt_if_any(a)?;
        let outcome = execute_insn(a)?;
        let mcycle = a.read_mcycle()?;
        a.write_mcycle(mcycle.wrapping_add(1))?;
        match outcome {
            StepOutcome::Retired => retire(a)?,
            StepOutcome::Trapped => {}
            StepOutcome::Idled => {
                retire(a)?;
                return Ok(RunBreak::Idle);
            }
        }
        if a.brk() {
            return Ok(RunBreak::Broke);
        }
    }
    Ok(RunBreak::ReachedTarget)
}

fn retire<A: StateAccess>(a: &mut A) -> Result<(), A::Error> {
    let minstret = a.read_minstret()?;
    a.write_minstret(minstret.wrapping_add(1))
}

#[inline]
fn read_register<A: StateAccess>(a: &mut A, i: usize) -> Result<u64, A::Error> {
    // x0 short-circuits to zero without touching the access surface, so no
    // log entry ever carries its shadow address.
    if i == 0 {
        Ok(0)
    } else {
        a.read_x(i)
    }
}

#[inline]
fn write_register<A: StateAccess>(a: &mut A, i: usize, val: u64) -> Result<(), A::Error> {
    if i == 0 {
        Ok(())
    } else {
        a.write_x(i, val)
    }
}

/// Deliver the highest-priority pending-and-enabled interrupt, if any.
fn raise_interrupt_if_any<A: StateAccess>(a: &mut A) -> Result<(), A::Error> {
    let pending = a.read_mip()? & a.read_mie()?;
    if pending == 0 {
        return Ok(());
    }
    let cur_prv = a.read_iflags_prv()?;
    let status = a.read_mstatus()?;
    let mideleg = a.read_mideleg()?;
    let m_enabled = cur_prv < prv::M || status & mstatus::MIE != 0;
    let s_enabled = cur_prv < prv::S || (cur_prv == prv::S && status & mstatus::SIE != 0);
    let mask = (if m_enabled { pending & !mideleg } else { 0 })
        | (if cur_prv <= prv::S && s_enabled {
            pending & mideleg
        } else {
            0
        });
    if mask == 0 {
        return Ok(());
    }
    const PRIORITY: [u64; 6] = [
        mip::MEIP,
        mip::MSIP,
        mip::MTIP,
        mip::SEIP,
        mip::SSIP,
        mip::STIP,
    ];
    for bit in PRIORITY {
        if mask & bit != 0 {
            a.reset_iflags_i()?;
            let pc = a.read_pc()?;
            let irq = bit.trailing_zeros() as u64;
            take_trap(a, pc, Exception::new(cause::INTERRUPT_FLAG | irq, 0))?;
            break;
        }
    }
    Ok(())
}

/// Deliver a trap to M or S mode per the delegation registers, updating the
/// status stack and redirecting the pc to the trap vector.
fn take_trap<A: StateAccess>(a: &mut A, pc: u64, e: Exception) -> Result<(), A::Error> {
    a.make_scoped_note("raise_exception");
    let cur_prv = a.read_iflags_prv()?;
    let is_interrupt = e.cause & cause::INTERRUPT_FLAG != 0;
    let deleg = if is_interrupt {
        a.read_mideleg()?
    } else {
        a.read_medeleg()?
    };
    let bit = e.cause & 63;
    if cur_prv <= prv::S && (deleg >> bit) & 1 != 0 {
        let status = a.read_mstatus()?;
        let sie = status & mstatus::SIE != 0;
        let mut new_status = status & !(mstatus::SIE | mstatus::SPIE | mstatus::SPP);
        if sie {
            new_status |= mstatus::SPIE;
        }
        if cur_prv == prv::S {
            new_status |= mstatus::SPP;
        }
        a.write_mstatus(new_status)?;
        a.write_scause(e.cause)?;
        a.write_sepc(pc)?;
        a.write_stval(e.tval)?;
        if cur_prv != prv::S {
            a.write_iflags_prv(prv::S)?;
        }
        let stvec = a.read_stvec()?;
        a.write_pc(trap_vector(stvec, e.cause))?;
    } else {
        let status = a.read_mstatus()?;
        let mie = status & mstatus::MIE != 0;
        let mut new_status = status & !(mstatus::MIE | mstatus::MPIE | mstatus::MPP);
        if mie {
            new_status |= mstatus::MPIE;
        }
        new_status |= (cur_prv as u64) << mstatus::MPP_SHIFT;
        a.write_mstatus(new_status)?;
        a.write_mcause(e.cause)?;
        a.write_mepc(pc)?;
        a.write_mtval(e.tval)?;
        if cur_prv != prv::M {
            a.write_iflags_prv(prv::M)?;
        }
        let mtvec = a.read_mtvec()?;
        a.write_pc(trap_vector(mtvec, e.cause))?;
    }
    Ok(())
}

fn trap_vector(tvec: u64, cause_val: u64) -> u64 {
    let base = tvec & !3;
    if tvec & 3 == 1 && cause_val & cause::INTERRUPT_FLAG != 0 {
        base + 4 * (cause_val & 63)
    } else {
        base
    }
}

/// Fetch, decode, and execute one instruction.
fn execute_insn<A: StateAccess>(a: &mut A) -> Result<StepOutcome, A::Error> {
    let pc = a.read_pc()?;
    let insn = match fetch(a, pc)? {
        Ok(insn) => insn,
        Err(e) => {
            take_trap(a, pc, e)?;
            return Ok(StepOutcome::Trapped);
        }
    };
    match execute(a, pc, insn)? {
        Ok(Next::Pc(next)) => {
            a.write_pc(next)?;
            Ok(StepOutcome::Retired)
        }
        Ok(Next::Idle(next)) => {
            a.write_pc(next)?;
            Ok(StepOutcome::Idled)
        }
        Err(e) => {
            take_trap(a, pc, e)?;
            Ok(StepOutcome::Trapped)
        }
    }
}

fn fetch<A: StateAccess>(a: &mut A, pc: u64) -> Result<Result<Insn, Exception>, A::Error> {
    if pc & 3 != 0 {
        return Ok(Err(Exception::new(cause::INSN_ADDRESS_MISALIGNED, pc)));
    }
    let view = a.find_pma_entry::<u32>(pc)?;
    if view.is_empty() || !view.is_memory() || !view.flags.x {
        return Ok(Err(Exception::new(cause::INSN_ACCESS_FAULT, pc)));
    }
    Ok(Ok(Insn(a.read_memory::<u32>(pc)?)))
}

fn device_read<A: StateAccess>(
    a: &mut A,
    view: &PmaView,
    offset: u64,
    log2_size: u32,
) -> Result<Option<u64>, A::Error> {
    match view.flags.did {
        PmaDid::Clint => clint::mmio_read(a, offset, log2_size),
        PmaDid::Htif => htif::mmio_read(a, offset, log2_size),
        _ => Ok(None),
    }
}

fn device_write<A: StateAccess>(
    a: &mut A,
    view: &PmaView,
    offset: u64,
    val: u64,
    log2_size: u32,
) -> Result<bool, A::Error> {
    match view.flags.did {
        PmaDid::Clint => clint::mmio_write(a, offset, val, log2_size),
        PmaDid::Htif => htif::mmio_write(a, offset, val, log2_size),
        _ => Ok(false),
    }
}

/// Read target data of width `T` at `vaddr`, zero-extended into a u64.
fn read_data<A: StateAccess, T: MemoryWord>(
    a: &mut A,
    vaddr: u64,
) -> Result<Result<u64, Exception>, A::Error> {
    if vaddr & (T::SIZE - 1) != 0 {
        return Ok(Err(Exception::new(cause::LOAD_ADDRESS_MISALIGNED, vaddr)));
    }
    let view = a.find_pma_entry::<T>(vaddr)?;
    if view.is_empty() || !view.flags.r {
        return Ok(Err(Exception::new(cause::LOAD_ACCESS_FAULT, vaddr)));
    }
    if view.is_memory() {
        return Ok(Ok(a.read_memory::<T>(vaddr)?.to_u64()));
    }
    match device_read(a, &view, vaddr - view.start, T::LOG2_SIZE)? {
        Some(val) => Ok(Ok(val)),
        None => Ok(Err(Exception::new(cause::LOAD_ACCESS_FAULT, vaddr))),
    }
}

/// Write target data of width `T` at `vaddr`.
fn write_data<A: StateAccess, T: MemoryWord>(
    a: &mut A,
    vaddr: u64,
    val: u64,
) -> Result<Result<(), Exception>, A::Error> {
    if vaddr & (T::SIZE - 1) != 0 {
        return Ok(Err(Exception::new(cause::STORE_ADDRESS_MISALIGNED, vaddr)));
    }
    let view = a.find_pma_entry::<T>(vaddr)?;
    if view.is_empty() || !view.flags.w {
        return Ok(Err(Exception::new(cause::STORE_ACCESS_FAULT, vaddr)));
    }
    if view.is_memory() {
        a.write_memory::<T>(vaddr, T::from_u64(val))?;
        return Ok(Ok(()));
    }
    let val = T::from_u64(val).to_u64();
    if device_write(a, &view, vaddr - view.start, val, T::LOG2_SIZE)? {
        Ok(Ok(()))
    } else {
        Ok(Err(Exception::new(cause::STORE_ACCESS_FAULT, vaddr)))
    }
}

fn execute<A: StateAccess>(
    a: &mut A,
    pc: u64,
    insn: Insn,
) -> Result<Result<Next, Exception>, A::Error> {
    match insn.opcode() {
        opcode::LUI => {
            write_register(a, insn.rd(), insn.imm_u() as u64)?;
            Ok(Ok(Next::Pc(pc.wrapping_add(4))))
        }

        opcode::AUIPC => {
            write_register(a, insn.rd(), pc.wrapping_add(insn.imm_u() as u64))?;
            Ok(Ok(Next::Pc(pc.wrapping_add(4))))
        }

        opcode::JAL => {
            write_register(a, insn.rd(), pc.wrapping_add(4))?;
            Ok(Ok(Next::Pc(pc.wrapping_add(insn.imm_j() as u64))))
        }

        opcode::JALR => {
            if insn.funct3() != 0 {
                return Ok(Err(Exception::illegal(insn)));
            }
            let base = read_register(a, insn.rs1())?;
            write_register(a, insn.rd(), pc.wrapping_add(4))?;
            Ok(Ok(Next::Pc(base.wrapping_add(insn.imm_i() as u64) & !1)))
        }

        opcode::BRANCH => {
            let rs1 = read_register(a, insn.rs1())?;
            let rs2 = read_register(a, insn.rs2())?;
            let taken = match insn.funct3() {
                branch_funct3::BEQ => rs1 == rs2,
                branch_funct3::BNE => rs1 != rs2,
                branch_funct3::BLT => (rs1 as i64) < (rs2 as i64),
                branch_funct3::BGE => (rs1 as i64) >= (rs2 as i64),
                branch_funct3::BLTU => rs1 < rs2,
                branch_funct3::BGEU => rs1 >= rs2,
                _ => return Ok(Err(Exception::illegal(insn))),
            };
            let next = if taken {
                pc.wrapping_add(insn.imm_b() as u64)
            } else {
                pc.wrapping_add(4)
            };
            Ok(Ok(Next::Pc(next)))
        }

        opcode::LOAD => {
            let vaddr = read_register(a, insn.rs1())?.wrapping_add(insn.imm_i() as u64);
            let val = match insn.funct3() {
                load_funct3::LB => guest!(read_data::<A, u8>(a, vaddr)) as i8 as i64 as u64,
                load_funct3::LH => guest!(read_data::<A, u16>(a, vaddr)) as i16 as i64 as u64,
                load_funct3::LW => guest!(read_data::<A, u32>(a, vaddr)) as i32 as i64 as u64,
                load_funct3::LD => guest!(read_data::<A, u64>(a, vaddr)),
                load_funct3::LBU => guest!(read_data::<A, u8>(a, vaddr)),
                load_funct3::LHU => guest!(read_data::<A, u16>(a, vaddr)),
                load_funct3::LWU => guest!(read_data::<A, u32>(a, vaddr)),
                _ => return Ok(Err(Exception::illegal(insn))),
            };
            write_register(a, insn.rd(), val)?;
            Ok(Ok(Next::Pc(pc.wrapping_add(4))))
        }

        opcode::STORE => {
            let vaddr = read_register(a, insn.rs1())?.wrapping_add(insn.imm_s() as u64);
            let val = read_register(a, insn.rs2())?;
            match insn.funct3() {
                store_funct3::SB => guest!(write_data::<A, u8>(a, vaddr, val)),
                store_funct3::SH => guest!(write_data::<A, u16>(a, vaddr, val)),
                store_funct3::SW => guest!(write_data::<A, u32>(a, vaddr, val)),
                store_funct3::SD => guest!(write_data::<A, u64>(a, vaddr, val)),
                _ => return Ok(Err(Exception::illegal(insn))),
            }
            Ok(Ok(Next::Pc(pc.wrapping_add(4))))
        }

        opcode::OP_IMM => {
            let rs1 = read_register(a, insn.rs1())?;
            let imm = insn.imm_i() as u64;
            let val = match insn.funct3() {
                0b000 => rs1.wrapping_add(imm),
                0b010 => ((rs1 as i64) < (imm as i64)) as u64,
                0b011 => (rs1 < imm) as u64,
                0b100 => rs1 ^ imm,
                0b110 => rs1 | imm,
                0b111 => rs1 & imm,
                0b001 => {
                    if insn.0 >> 26 != 0 {
                        return Ok(Err(Exception::illegal(insn)));
                    }
                    rs1 << insn.shamt6()
                }
                0b101 => match insn.0 >> 26 {
                    0x00 => rs1 >> insn.shamt6(),
                    0x10 => ((rs1 as i64) >> insn.shamt6()) as u64,
                    _ => return Ok(Err(Exception::illegal(insn))),
                },
                _ => return Ok(Err(Exception::illegal(insn))),
            };
            write_register(a, insn.rd(), val)?;
            Ok(Ok(Next::Pc(pc.wrapping_add(4))))
        }

        opcode::OP_IMM_32 => {
            let rs1 = read_register(a, insn.rs1())?;
            let imm = insn.imm_i();
            let val = match insn.funct3() {
                0b000 => (rs1.wrapping_add(imm as u64) as i32) as i64 as u64,
                0b001 => {
                    if insn.funct7() != funct7::NORMAL {
                        return Ok(Err(Exception::illegal(insn)));
                    }
                    (((rs1 as u32) << insn.shamt5()) as i32) as i64 as u64
                }
                0b101 => match insn.funct7() {
                    funct7::NORMAL => (((rs1 as u32) >> insn.shamt5()) as i32) as i64 as u64,
                    funct7::SUB_SRA => ((rs1 as i32) >> insn.shamt5()) as i64 as u64,
                    _ => return Ok(Err(Exception::illegal(insn))),
                },
                _ => return Ok(Err(Exception::illegal(insn))),
            };
            write_register(a, insn.rd(), val)?;
            Ok(Ok(Next::Pc(pc.wrapping_add(4))))
        }

        opcode::OP => {
            let rs1 = read_register(a, insn.rs1())?;
            let rs2 = read_register(a, insn.rs2())?;
            let val = if insn.funct7() == funct7::MULDIV {
                match insn.funct3() {
                    op_funct3::ADD_SUB_MUL => rs1.wrapping_mul(rs2),
                    op_funct3::SLL_MULH => {
                        (((rs1 as i64 as i128) * (rs2 as i64 as i128)) >> 64) as u64
                    }
                    op_funct3::SLT_MULHSU => {
                        (((rs1 as i64 as i128) * (rs2 as u128 as i128)) >> 64) as u64
                    }
                    op_funct3::SLTU_MULHU => (((rs1 as u128) * (rs2 as u128)) >> 64) as u64,
                    op_funct3::XOR_DIV => {
                        if rs2 == 0 {
                            u64::MAX
                        } else if rs1 == i64::MIN as u64 && rs2 as i64 == -1 {
                            rs1
                        } else {
                            ((rs1 as i64).wrapping_div(rs2 as i64)) as u64
                        }
                    }
                    op_funct3::SRL_SRA_DIVU => {
                        if rs2 == 0 {
                            u64::MAX
                        } else {
                            rs1 / rs2
                        }
                    }
                    op_funct3::OR_REM => {
                        if rs2 == 0 {
                            rs1
                        } else if rs1 == i64::MIN as u64 && rs2 as i64 == -1 {
                            0
                        } else {
                            ((rs1 as i64).wrapping_rem(rs2 as i64)) as u64
                        }
                    }
                    op_funct3::AND_REMU => {
                        if rs2 == 0 {
                            rs1
                        } else {
                            rs1 % rs2
                        }
                    }
                    _ => return Ok(Err(Exception::illegal(insn))),
                }
            } else {
                match (insn.funct3(), insn.funct7()) {
                    (op_funct3::ADD_SUB_MUL, funct7::NORMAL) => rs1.wrapping_add(rs2),
                    (op_funct3::ADD_SUB_MUL, funct7::SUB_SRA) => rs1.wrapping_sub(rs2),
                    (op_funct3::SLL_MULH, funct7::NORMAL) => rs1 << (rs2 & 0x3f),
                    (op_funct3::SLT_MULHSU, funct7::NORMAL) => {
                        ((rs1 as i64) < (rs2 as i64)) as u64
                    }
                    (op_funct3::SLTU_MULHU, funct7::NORMAL) => (rs1 < rs2) as u64,
                    (op_funct3::XOR_DIV, funct7::NORMAL) => rs1 ^ rs2,
                    (op_funct3::SRL_SRA_DIVU, funct7::NORMAL) => rs1 >> (rs2 & 0x3f),
                    (op_funct3::SRL_SRA_DIVU, funct7::SUB_SRA) => {
                        ((rs1 as i64) >> (rs2 & 0x3f)) as u64
                    }
                    (op_funct3::OR_REM, funct7::NORMAL) => rs1 | rs2,
                    (op_funct3::AND_REMU, funct7::NORMAL) => rs1 & rs2,
                    _ => return Ok(Err(Exception::illegal(insn))),
                }
            };
            write_register(a, insn.rd(), val)?;
            Ok(Ok(Next::Pc(pc.wrapping_add(4))))
        }

        opcode::OP_32 => {
            let rs1 = read_register(a, insn.rs1())?;
            let rs2 = read_register(a, insn.rs2())?;
            let val = if insn.funct7() == funct7::MULDIV {
                let (a32, b32) = (rs1 as i32, rs2 as i32);
                match insn.funct3() {
                    op_funct3::ADD_SUB_MUL => a32.wrapping_mul(b32) as i64 as u64,
                    op_funct3::XOR_DIV => {
                        if b32 == 0 {
                            u64::MAX
                        } else if a32 == i32::MIN && b32 == -1 {
                            a32 as i64 as u64
                        } else {
                            a32.wrapping_div(b32) as i64 as u64
                        }
                    }
                    op_funct3::SRL_SRA_DIVU => {
                        if b32 == 0 {
                            u64::MAX
                        } else {
                            ((rs1 as u32 / rs2 as u32) as i32) as i64 as u64
                        }
                    }
                    op_funct3::OR_REM => {
                        if b32 == 0 {
                            a32 as i64 as u64
                        } else if a32 == i32::MIN && b32 == -1 {
                            0
                        } else {
                            a32.wrapping_rem(b32) as i64 as u64
                        }
                    }
                    op_funct3::AND_REMU => {
                        if b32 == 0 {
                            a32 as i64 as u64
                        } else {
                            ((rs1 as u32 % rs2 as u32) as i32) as i64 as u64
                        }
                    }
                    _ => return Ok(Err(Exception::illegal(insn))),
                }
            } else {
                match (insn.funct3(), insn.funct7()) {
                    (op_funct3::ADD_SUB_MUL, funct7::NORMAL) => {
                        ((rs1 as u32).wrapping_add(rs2 as u32) as i32) as i64 as u64
                    }
                    (op_funct3::ADD_SUB_MUL, funct7::SUB_SRA) => {
                        ((rs1 as u32).wrapping_sub(rs2 as u32) as i32) as i64 as u64
                    }
                    (op_funct3::SLL_MULH, funct7::NORMAL) => {
                        (((rs1 as u32) << (rs2 & 0x1f)) as i32) as i64 as u64
                    }
                    (op_funct3::SRL_SRA_DIVU, funct7::NORMAL) => {
                        (((rs1 as u32) >> (rs2 & 0x1f)) as i32) as i64 as u64
                    }
                    (op_funct3::SRL_SRA_DIVU, funct7::SUB_SRA) => {
                        ((rs1 as i32) >> (rs2 & 0x1f)) as i64 as u64
                    }
                    _ => return Ok(Err(Exception::illegal(insn))),
                }
            };
            write_register(a, insn.rd(), val)?;
            Ok(Ok(Next::Pc(pc.wrapping_add(4))))
        }

        opcode::MISC_MEM => match insn.funct3() {
            // FENCE and FENCE.I: single hart, no caches.
            0b000 | 0b001 => Ok(Ok(Next::Pc(pc.wrapping_add(4)))),
            _ => Ok(Err(Exception::illegal(insn))),
        },

        opcode::AMO => execute_amo(a, pc, insn),

        opcode::SYSTEM => execute_system(a, pc, insn),

        _ => Ok(Err(Exception::illegal(insn))),
    }
}

fn execute_amo<A: StateAccess>(
    a: &mut A,
    pc: u64,
    insn: Insn,
) -> Result<Result<Next, Exception>, A::Error> {
    let is_d = match insn.funct3() {
        0b010 => false,
        0b011 => true,
        _ => return Ok(Err(Exception::illegal(insn))),
    };
    let vaddr = read_register(a, insn.rs1())?;

    match insn.funct5() {
        amo_funct5::LR => {
            if insn.rs2() != 0 {
                return Ok(Err(Exception::illegal(insn)));
            }
            let val = if is_d {
                guest!(read_data::<A, u64>(a, vaddr))
            } else {
                guest!(read_data::<A, u32>(a, vaddr)) as i32 as i64 as u64
            };
            a.write_ilrsc(vaddr)?;
            write_register(a, insn.rd(), val)?;
            return Ok(Ok(Next::Pc(pc.wrapping_add(4))));
        }
        amo_funct5::SC => {
            let reserved = a.read_ilrsc()?;
            let success = reserved == vaddr;
            if success {
                let val = read_register(a, insn.rs2())?;
                if is_d {
                    guest!(write_data::<A, u64>(a, vaddr, val));
                } else {
                    guest!(write_data::<A, u32>(a, vaddr, val));
                }
            }
            a.write_ilrsc(u64::MAX)?;
            write_register(a, insn.rd(), (!success) as u64)?;
            return Ok(Ok(Next::Pc(pc.wrapping_add(4))));
        }
        _ => {}
    }

    let rs2 = read_register(a, insn.rs2())?;
    let old = if is_d {
        guest!(read_data::<A, u64>(a, vaddr))
    } else {
        guest!(read_data::<A, u32>(a, vaddr)) as i32 as i64 as u64
    };
    let (x, y) = if is_d {
        (old, rs2)
    } else {
        (old as i32 as i64 as u64, rs2 as i32 as i64 as u64)
    };
    let new = match insn.funct5() {
        amo_funct5::AMOSWAP => y,
        amo_funct5::AMOADD => x.wrapping_add(y),
        amo_funct5::AMOXOR => x ^ y,
        amo_funct5::AMOAND => x & y,
        amo_funct5::AMOOR => x | y,
        amo_funct5::AMOMIN => {
            if (x as i64) < (y as i64) {
                x
            } else {
                y
            }
        }
        amo_funct5::AMOMAX => {
            if (x as i64) > (y as i64) {
                x
            } else {
                y
            }
        }
        amo_funct5::AMOMINU => {
            if is_d {
                x.min(y)
            } else {
                ((x as u32).min(y as u32)) as u64
            }
        }
        amo_funct5::AMOMAXU => {
            if is_d {
                x.max(y)
            } else {
                ((x as u32).max(y as u32)) as u64
            }
        }
        _ => return Ok(Err(Exception::illegal(insn))),
    };
    if is_d {
        guest!(write_data::<A, u64>(a, vaddr, new));
    } else {
        guest!(write_data::<A, u32>(a, vaddr, new));
    }
    write_register(a, insn.rd(), old)?;
    Ok(Ok(Next::Pc(pc.wrapping_add(4))))
}

fn execute_system<A: StateAccess>(
    a: &mut A,
    pc: u64,
    insn: Insn,
) -> Result<Result<Next, Exception>, A::Error> {
    if insn.funct3() == system_funct3::PRIV {
        if insn.funct7() == funct7::SFENCE_VMA {
            // No address translation: nothing to flush.
            return Ok(Ok(Next::Pc(pc.wrapping_add(4))));
        }
        if insn.rd() != 0 || insn.rs1() != 0 {
            return Ok(Err(Exception::illegal(insn)));
        }
        return match insn.csr() {
            priv_imm::ECALL => {
                let cur_prv = a.read_iflags_prv()?;
                Ok(Err(Exception::new(
                    cause::ECALL_FROM_U + cur_prv as u64,
                    0,
                )))
            }
            priv_imm::EBREAK => Ok(Err(Exception::new(cause::BREAKPOINT, pc))),
            priv_imm::SRET => execute_sret(a, insn),
            priv_imm::MRET => execute_mret(a, insn),
            priv_imm::WFI => {
                let pending = a.read_mip()? & a.read_mie()?;
                if pending != 0 {
                    Ok(Ok(Next::Pc(pc.wrapping_add(4))))
                } else {
                    a.set_iflags_i()?;
                    Ok(Ok(Next::Idle(pc.wrapping_add(4))))
                }
            }
            _ => Ok(Err(Exception::illegal(insn))),
        };
    }
    execute_csr(a, pc, insn)
}

fn execute_sret<A: StateAccess>(
    a: &mut A,
    insn: Insn,
) -> Result<Result<Next, Exception>, A::Error> {
    let cur_prv = a.read_iflags_prv()?;
    if cur_prv < prv::S {
        return Ok(Err(Exception::illegal(insn)));
    }
    let status = a.read_mstatus()?;
    let spp = ((status & mstatus::SPP) != 0) as u8;
    let spie = status & mstatus::SPIE != 0;
    let mut new_status = status & !(mstatus::SIE | mstatus::SPIE | mstatus::SPP);
    if spie {
        new_status |= mstatus::SIE;
    }
    new_status |= mstatus::SPIE;
    a.write_mstatus(new_status)?;
    if spp != cur_prv {
        a.write_iflags_prv(spp)?;
    }
    let sepc = a.read_sepc()?;
    Ok(Ok(Next::Pc(sepc)))
}

fn execute_mret<A: StateAccess>(
    a: &mut A,
    insn: Insn,
) -> Result<Result<Next, Exception>, A::Error> {
    let cur_prv = a.read_iflags_prv()?;
    if cur_prv < prv::M {
        return Ok(Err(Exception::illegal(insn)));
    }
    let status = a.read_mstatus()?;
    let mpp = ((status & mstatus::MPP) >> mstatus::MPP_SHIFT) as u8;
    let mpie = status & mstatus::MPIE != 0;
    let mut new_status = status & !(mstatus::MIE | mstatus::MPIE | mstatus::MPP);
    if mpie {
        new_status |= mstatus::MIE;
    }
    new_status |= mstatus::MPIE;
    a.write_mstatus(new_status)?;
    if mpp != cur_prv {
        a.write_iflags_prv(mpp)?;
    }
    let mepc = a.read_mepc()?;
    Ok(Ok(Next::Pc(mepc)))
}

fn execute_csr<A: StateAccess>(
    a: &mut A,
    pc: u64,
    insn: Insn,
) -> Result<Result<Next, Exception>, A::Error> {
    let csraddr = insn.csr();
    let funct3 = insn.funct3();
    let rd = insn.rd();
    let rs1 = insn.rs1();
    let is_imm = funct3 & 0b100 != 0;
    let operand = if is_imm {
        rs1 as u64
    } else {
        read_register(a, rs1)?
    };
    let cur_prv = a.read_iflags_prv()?;
    if ((csraddr >> 8) & 3) as u8 > cur_prv {
        return Ok(Err(Exception::illegal(insn)));
    }
    let is_write = match funct3 & 0b011 {
        0b001 => true,
        0b010 | 0b011 => rs1 != 0,
        _ => return Ok(Err(Exception::illegal(insn))),
    };
    if is_write && (csraddr >> 10) & 3 == 3 {
        // Writes to the read-only range never reach the state, so the
        // paired read never emits an access either.
        return Ok(Err(Exception::illegal(insn)));
    }
    if is_write && csraddr == csr::MISA {
        // misa is WARL-fixed: the write is ignored and the paired read
        // resolves to the build-time constant.
        write_register(a, rd, MISA_INIT)?;
        return Ok(Ok(Next::Pc(pc.wrapping_add(4))));
    }
    let wants_read = funct3 & 0b011 != 0b001 || rd != 0;
    let old = if wants_read {
        guest!(csr_read(a, csraddr, cur_prv, insn))
    } else {
        0
    };
    if is_write {
        let new = match funct3 & 0b011 {
            0b001 => operand,
            0b010 => old | operand,
            _ => old & !operand,
        };
        guest!(csr_write(a, csraddr, new, insn));
    }
    write_register(a, rd, old)?;
    Ok(Ok(Next::Pc(pc.wrapping_add(4))))
}

fn counter_enabled<A: StateAccess>(a: &mut A, bit: u32, cur_prv: u8) -> Result<bool, A::Error> {
    if cur_prv < prv::M && a.read_mcounteren()? >> bit & 1 == 0 {
        return Ok(false);
    }
    if cur_prv < prv::S && a.read_scounteren()? >> bit & 1 == 0 {
        return Ok(false);
    }
    Ok(true)
}

fn csr_read<A: StateAccess>(
    a: &mut A,
    csraddr: u32,
    cur_prv: u8,
    insn: Insn,
) -> Result<Result<u64, Exception>, A::Error> {
    let val = match csraddr {
        csr::CYCLE => {
            if !counter_enabled(a, 0, cur_prv)? {
                return Ok(Err(Exception::illegal(insn)));
            }
            a.read_mcycle()?
        }
        csr::TIME => {
            if !counter_enabled(a, 1, cur_prv)? {
                return Ok(Err(Exception::illegal(insn)));
            }
            rtc::cycles_to_time(a.read_mcycle()?)
        }
        csr::INSTRET => {
            if !counter_enabled(a, 2, cur_prv)? {
                return Ok(Err(Exception::illegal(insn)));
            }
            a.read_minstret()?
        }
        csr::SSTATUS => a.read_mstatus()? & mstatus::SSTATUS_MASK,
        csr::SIE => a.read_mie()? & a.read_mideleg()?,
        csr::STVEC => a.read_stvec()?,
        csr::SCOUNTEREN => a.read_scounteren()?,
        csr::SSCRATCH => a.read_sscratch()?,
        csr::SEPC => a.read_sepc()?,
        csr::SCAUSE => a.read_scause()?,
        csr::STVAL => a.read_stval()?,
        csr::SIP => a.read_mip()? & a.read_mideleg()?,
        csr::SATP => a.read_satp()?,
        csr::MSTATUS => a.read_mstatus()?,
        csr::MISA => a.read_misa()?,
        csr::MEDELEG => a.read_medeleg()?,
        csr::MIDELEG => a.read_mideleg()?,
        csr::MIE => a.read_mie()?,
        csr::MTVEC => a.read_mtvec()?,
        csr::MCOUNTEREN => a.read_mcounteren()?,
        csr::MSCRATCH => a.read_mscratch()?,
        csr::MEPC => a.read_mepc()?,
        csr::MCAUSE => a.read_mcause()?,
        csr::MTVAL => a.read_mtval()?,
        csr::MIP => a.read_mip()?,
        csr::MCYCLE => a.read_mcycle()?,
        csr::MINSTRET => a.read_minstret()?,
        csr::MVENDORID => a.read_mvendorid()?,
        csr::MARCHID => a.read_marchid()?,
        csr::MIMPID => a.read_mimpid()?,
        csr::MHARTID => 0,
        _ => return Ok(Err(Exception::illegal(insn))),
    };
    Ok(Ok(val))
}

fn csr_write<A: StateAccess>(
    a: &mut A,
    csraddr: u32,
    val: u64,
    insn: Insn,
) -> Result<Result<(), Exception>, A::Error> {
    match csraddr {
        csr::SSTATUS => {
            let old = a.read_mstatus()?;
            a.write_mstatus((old & !mstatus::SSTATUS_MASK) | (val & mstatus::SSTATUS_MASK))?;
        }
        csr::SIE => {
            let mask = a.read_mideleg()?;
            let old = a.read_mie()?;
            a.write_mie((old & !mask) | (val & mask))?;
        }
        csr::STVEC => a.write_stvec(val & !2)?,
        csr::SCOUNTEREN => a.write_scounteren(val & 0b111)?,
        csr::SSCRATCH => a.write_sscratch(val)?,
        csr::SEPC => a.write_sepc(val & !1)?,
        csr::SCAUSE => a.write_scause(val)?,
        csr::STVAL => a.write_stval(val)?,
        csr::SIP => {
            let mask = a.read_mideleg()? & mip::SSIP;
            let old = a.read_mip()?;
            a.write_mip((old & !mask) | (val & mask))?;
        }
        csr::SATP => a.write_satp(val)?,
        csr::MSTATUS => {
            let old = a.read_mstatus()?;
            let mut new = (old & !mstatus::WRITE_MASK) | (val & mstatus::WRITE_MASK);
            // MPP is WARL over {U, S, M}.
            if (new & mstatus::MPP) >> mstatus::MPP_SHIFT == 2 {
                new = (new & !mstatus::MPP) | (old & mstatus::MPP);
            }
            a.write_mstatus(new)?;
        }
        csr::MEDELEG => a.write_medeleg(val & !(1u64 << cause::ECALL_FROM_M) & 0xffff)?,
        csr::MIDELEG => a.write_mideleg(val & mip::DELEGABLE)?,
        csr::MIE => a.write_mie(val & mip::ALL)?,
        csr::MTVEC => a.write_mtvec(val & !2)?,
        csr::MCOUNTEREN => a.write_mcounteren(val & 0b111)?,
        csr::MSCRATCH => a.write_mscratch(val)?,
        csr::MEPC => a.write_mepc(val & !1)?,
        csr::MCAUSE => a.write_mcause(val)?,
        csr::MTVAL => a.write_mtval(val)?,
        csr::MIP => {
            let old = a.read_mip()?;
            a.write_mip((old & !mip::WRITABLE) | (val & mip::WRITABLE))?;
        }
        csr::MCYCLE => a.write_mcycle(val)?,
        csr::MINSTRET => a.write_minstret(val)?,
        _ => return Ok(Err(Exception::illegal(insn))),
    }
    Ok(Ok(()))
}
