//! Tiny RV64 instruction assembler.
//!
//! Enough to hand-assemble boot images and test programs; not a general
//! assembler.

use crate::decode::opcode;

/// Assemble an R-type instruction.
pub fn assemble_r(opcode: u32, rd: u32, funct3: u32, rs1: u32, rs2: u32, funct7: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

/// Assemble an I-type instruction.
pub fn assemble_i(opcode: u32, rd: u32, funct3: u32, rs1: u32, imm: i32) -> u32 {
    (((imm as u32) & 0xfff) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

/// Assemble an S-type instruction.
pub fn assemble_s(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 5 & 0x7f) << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | ((imm & 0x1f) << 7) | opcode
}

/// Assemble a B-type instruction.
pub fn assemble_b(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 12 & 1) << 31)
        | ((imm >> 5 & 0x3f) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | ((imm >> 1 & 0xf) << 8)
        | ((imm >> 11 & 1) << 7)
        | opcode
}

/// Assemble a U-type instruction. `imm` carries the value with the low 12
/// bits already zero.
pub fn assemble_u(opcode: u32, rd: u32, imm: u32) -> u32 {
    (imm & 0xffff_f000) | (rd << 7) | opcode
}

/// Assemble a J-type instruction.
pub fn assemble_j(opcode: u32, rd: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 20 & 1) << 31)
        | ((imm >> 1 & 0x3ff) << 21)
        | ((imm >> 11 & 1) << 20)
        | ((imm >> 12 & 0xff) << 12)
        | (rd << 7)
        | opcode
}

pub fn assemble_addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    assemble_i(opcode::OP_IMM, rd, 0b000, rs1, imm)
}

pub fn assemble_add(rd: u32, rs1: u32, rs2: u32) -> u32 {
    assemble_r(opcode::OP, rd, 0b000, rs1, rs2, 0x00)
}

pub fn assemble_sub(rd: u32, rs1: u32, rs2: u32) -> u32 {
    assemble_r(opcode::OP, rd, 0b000, rs1, rs2, 0x20)
}

pub fn assemble_mul(rd: u32, rs1: u32, rs2: u32) -> u32 {
    assemble_r(opcode::OP, rd, 0b000, rs1, rs2, 0x01)
}

pub fn assemble_div(rd: u32, rs1: u32, rs2: u32) -> u32 {
    assemble_r(opcode::OP, rd, 0b100, rs1, rs2, 0x01)
}

pub fn assemble_lui(rd: u32, imm: u32) -> u32 {
    assemble_u(opcode::LUI, rd, imm)
}

pub fn assemble_auipc(rd: u32, imm: u32) -> u32 {
    assemble_u(opcode::AUIPC, rd, imm)
}

pub fn assemble_jal(rd: u32, imm: i32) -> u32 {
    assemble_j(opcode::JAL, rd, imm)
}

pub fn assemble_jalr(rd: u32, rs1: u32, imm: i32) -> u32 {
    assemble_i(opcode::JALR, rd, 0b000, rs1, imm)
}

pub fn assemble_beq(rs1: u32, rs2: u32, imm: i32) -> u32 {
    assemble_b(opcode::BRANCH, 0b000, rs1, rs2, imm)
}

pub fn assemble_bne(rs1: u32, rs2: u32, imm: i32) -> u32 {
    assemble_b(opcode::BRANCH, 0b001, rs1, rs2, imm)
}

pub fn assemble_lw(rd: u32, rs1: u32, imm: i32) -> u32 {
    assemble_i(opcode::LOAD, rd, 0b010, rs1, imm)
}

pub fn assemble_ld(rd: u32, rs1: u32, imm: i32) -> u32 {
    assemble_i(opcode::LOAD, rd, 0b011, rs1, imm)
}

pub fn assemble_sb(rs1: u32, rs2: u32, imm: i32) -> u32 {
    assemble_s(opcode::STORE, 0b000, rs1, rs2, imm)
}

pub fn assemble_sw(rs1: u32, rs2: u32, imm: i32) -> u32 {
    assemble_s(opcode::STORE, 0b010, rs1, rs2, imm)
}

pub fn assemble_sd(rs1: u32, rs2: u32, imm: i32) -> u32 {
    assemble_s(opcode::STORE, 0b011, rs1, rs2, imm)
}

pub fn assemble_csrrw(rd: u32, csr: u32, rs1: u32) -> u32 {
    assemble_i(opcode::SYSTEM, rd, 0b001, rs1, csr as i32)
}

pub fn assemble_csrrs(rd: u32, csr: u32, rs1: u32) -> u32 {
    assemble_i(opcode::SYSTEM, rd, 0b010, rs1, csr as i32)
}

pub fn assemble_ecall() -> u32 {
    0x0000_0073
}

pub fn assemble_ebreak() -> u32 {
    0x0010_0073
}

pub fn assemble_wfi() -> u32 {
    0x1050_0073
}

pub fn assemble_mret() -> u32 {
    0x3020_0073
}

pub fn assemble_nop() -> u32 {
    assemble_addi(0, 0, 0)
}

/// `j 0`: a tight loop on itself.
pub fn assemble_self_loop() -> u32 {
    assemble_jal(0, 0)
}

/// Flatten instruction words into a little-endian byte image.
pub fn assemble_image(insns: &[u32]) -> Vec<u8> {
    insns.iter().flat_map(|i| i.to_le_bytes()).collect()
}
