//! Compressed (C) extension
//!
//! Every 16-bit instruction expands to its 32-bit equivalent; the expanded
//! form runs through the normal interpreter and the PC advance (and the
//! link register for C.JAL/C.JALR) is fixed up afterwards. The JIT frontend
//! uses the same expander so both executors agree by construction.

use super::decode::*;
use super::trap::Trap;
use super::{Hart, Xlen};
use crate::machine::Machine;

impl Hart {
    pub(crate) fn execute_compressed(
        &mut self,
        machine: &Machine,
        inst16: u16,
    ) -> Result<(), Trap> {
        let expanded =
            expand(inst16, self.xlen).ok_or(Trap::IllegalInstruction(inst16 as u64))?;
        let pc_before = self.pc;
        self.execute(machine, expanded)?;

        // The expansion executes as a 4-byte instruction; a compressed one
        // is 2 bytes, so both the fall-through PC and any link value need
        // to come back by 2.
        if self.pc == pc_before.wrapping_add(4) {
            self.pc = pc_before.wrapping_add(2);
            self.normalize_pc();
        }
        let opcode = expanded & 0x7F;
        let rd = (expanded >> 7) & 0x1F;
        if (opcode == OP_JAL || opcode == OP_JALR) && rd != 0 {
            let fixed = self.read_reg(rd).wrapping_sub(2);
            self.write_reg(rd, fixed);
        }
        Ok(())
    }
}

/// Expand a compressed instruction to its 32-bit form, or None if the
/// encoding is reserved (including RV64-only forms in RV32 mode).
pub(crate) fn expand(inst: u16, xlen: Xlen) -> Option<u32> {
    let opcode = inst & 0b11;
    let funct3 = (inst >> 13) & 0b111;

    match (funct3, opcode) {
        (0b000, 0b00) => c_addi4spn(inst),
        (0b001, 0b00) => c_fld(inst),
        (0b010, 0b00) => c_lw(inst),
        (0b011, 0b00) => match xlen {
            Xlen::Rv64 => c_ld(inst),
            Xlen::Rv32 => c_flw(inst),
        },
        (0b101, 0b00) => c_fsd(inst),
        (0b110, 0b00) => c_sw(inst),
        (0b111, 0b00) => match xlen {
            Xlen::Rv64 => c_sd(inst),
            Xlen::Rv32 => c_fsw(inst),
        },

        (0b000, 0b01) => c_addi(inst),
        (0b001, 0b01) => match xlen {
            Xlen::Rv64 => c_addiw(inst),
            Xlen::Rv32 => c_jal(inst),
        },
        (0b010, 0b01) => c_li(inst),
        (0b011, 0b01) => c_addi16sp_lui(inst),
        (0b100, 0b01) => c_alu(inst, xlen),
        (0b101, 0b01) => c_j(inst),
        (0b110, 0b01) => c_beqz(inst),
        (0b111, 0b01) => c_bnez(inst),

        (0b000, 0b10) => c_slli(inst, xlen),
        (0b001, 0b10) => c_fldsp(inst),
        (0b010, 0b10) => c_lwsp(inst),
        (0b011, 0b10) => match xlen {
            Xlen::Rv64 => c_ldsp(inst),
            Xlen::Rv32 => c_flwsp(inst),
        },
        (0b100, 0b10) => c_jr_mv_add(inst),
        (0b101, 0b10) => c_fsdsp(inst),
        (0b110, 0b10) => c_swsp(inst),
        (0b111, 0b10) => match xlen {
            Xlen::Rv64 => c_sdsp(inst),
            Xlen::Rv32 => c_fswsp(inst),
        },
        _ => None,
    }
}

// x8..x15, addressable from the 3-bit register fields
fn reg_prime(val: u16) -> u32 {
    8 + (val as u32 & 0x7)
}

fn sign_extend(val: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((val << shift) as i32) >> shift
}

fn encode_i(op: u32, rd: u32, rs1: u32, funct3: u32, imm: i32) -> u32 {
    ((imm as u32 & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | op
}

fn encode_u(op: u32, rd: u32, imm: i32) -> u32 {
    (imm as u32 & 0xFFFF_F000) | (rd << 7) | op
}

fn encode_r(op: u32, rd: u32, rs1: u32, rs2: u32, funct3: u32, funct7: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | op
}

fn encode_s(op: u32, rs1: u32, rs2: u32, funct3: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    (((imm >> 5) & 0x7F) << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | ((imm & 0x1F) << 7) | op
}

fn encode_b(op: u32, rs1: u32, rs2: u32, funct3: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    (((imm >> 12) & 1) << 31)
        | (((imm >> 5) & 0x3F) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | (((imm >> 1) & 0xF) << 8)
        | (((imm >> 11) & 1) << 7)
        | op
}

fn encode_j(op: u32, rd: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xFF) << 12)
        | (rd << 7)
        | op
}

// Quadrant 0

fn c_addi4spn(inst: u16) -> Option<u32> {
    let rd = reg_prime((inst >> 2) & 0x7);
    let i = inst as u32;
    let imm = ((i >> 7) & 0xF) << 6 | ((i >> 11) & 0x3) << 4 | ((i >> 5) & 1) << 3 | ((i >> 6) & 1) << 2;
    if imm == 0 {
        return None; // includes the all-zero illegal encoding
    }
    Some(encode_i(OP_OP_IMM, rd, 2, FUNCT3_ADD_SUB, imm as i32))
}

fn uimm_w(inst: u16) -> u32 {
    let i = inst as u32;
    ((i >> 10) & 0x7) << 3 | ((i >> 6) & 1) << 2 | ((i >> 5) & 1) << 6
}

fn uimm_d(inst: u16) -> u32 {
    let i = inst as u32;
    ((i >> 10) & 0x7) << 3 | ((i >> 5) & 0x3) << 6
}

fn c_lw(inst: u16) -> Option<u32> {
    Some(encode_i(OP_LOAD, reg_prime((inst >> 2) & 0x7), reg_prime((inst >> 7) & 0x7), FUNCT3_LW, uimm_w(inst) as i32))
}

fn c_ld(inst: u16) -> Option<u32> {
    Some(encode_i(OP_LOAD, reg_prime((inst >> 2) & 0x7), reg_prime((inst >> 7) & 0x7), FUNCT3_LD, uimm_d(inst) as i32))
}

fn c_fld(inst: u16) -> Option<u32> {
    Some(encode_i(OP_LOAD_FP, reg_prime((inst >> 2) & 0x7), reg_prime((inst >> 7) & 0x7), 0b011, uimm_d(inst) as i32))
}

fn c_flw(inst: u16) -> Option<u32> {
    Some(encode_i(OP_LOAD_FP, reg_prime((inst >> 2) & 0x7), reg_prime((inst >> 7) & 0x7), 0b010, uimm_w(inst) as i32))
}

fn c_sw(inst: u16) -> Option<u32> {
    Some(encode_s(OP_STORE, reg_prime((inst >> 7) & 0x7), reg_prime((inst >> 2) & 0x7), FUNCT3_LW, uimm_w(inst) as i32))
}

fn c_sd(inst: u16) -> Option<u32> {
    Some(encode_s(OP_STORE, reg_prime((inst >> 7) & 0x7), reg_prime((inst >> 2) & 0x7), FUNCT3_LD, uimm_d(inst) as i32))
}

fn c_fsd(inst: u16) -> Option<u32> {
    Some(encode_s(OP_STORE_FP, reg_prime((inst >> 7) & 0x7), reg_prime((inst >> 2) & 0x7), 0b011, uimm_d(inst) as i32))
}

fn c_fsw(inst: u16) -> Option<u32> {
    Some(encode_s(OP_STORE_FP, reg_prime((inst >> 7) & 0x7), reg_prime((inst >> 2) & 0x7), 0b010, uimm_w(inst) as i32))
}

// Quadrant 1

fn imm6(inst: u16) -> i32 {
    let i = inst as u32;
    sign_extend(((i >> 12) & 1) << 5 | ((i >> 2) & 0x1F), 6)
}

fn c_addi(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    // rd=0, imm=0 is the canonical NOP; other hint forms execute the same.
    Some(encode_i(OP_OP_IMM, rd, rd, FUNCT3_ADD_SUB, imm6(inst)))
}

fn c_addiw(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    if rd == 0 {
        return None;
    }
    Some(encode_i(OP_OP_IMM_32, rd, rd, FUNCT3_ADD_SUB, imm6(inst)))
}

fn jump_imm(inst: u16) -> i32 {
    let i = inst as u32;
    sign_extend(
        ((i >> 12) & 1) << 11
            | ((i >> 11) & 1) << 4
            | ((i >> 9) & 0x3) << 8
            | ((i >> 8) & 1) << 10
            | ((i >> 7) & 1) << 6
            | ((i >> 6) & 1) << 7
            | ((i >> 3) & 0x7) << 1
            | ((i >> 2) & 1) << 5,
        12,
    )
}

fn c_jal(inst: u16) -> Option<u32> {
    Some(encode_j(OP_JAL, 1, jump_imm(inst)))
}

fn c_j(inst: u16) -> Option<u32> {
    Some(encode_j(OP_JAL, 0, jump_imm(inst)))
}

fn c_li(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    Some(encode_i(OP_OP_IMM, rd, 0, FUNCT3_ADD_SUB, imm6(inst)))
}

fn c_addi16sp_lui(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    if rd == 2 {
        let i = inst as u32;
        let imm = sign_extend(
            ((i >> 12) & 1) << 9
                | ((i >> 6) & 1) << 4
                | ((i >> 5) & 1) << 6
                | ((i >> 3) & 0x3) << 7
                | ((i >> 2) & 1) << 5,
            10,
        );
        if imm == 0 {
            return None;
        }
        Some(encode_i(OP_OP_IMM, 2, 2, FUNCT3_ADD_SUB, imm))
    } else {
        let imm = imm6(inst);
        if imm == 0 {
            return None;
        }
        Some(encode_u(OP_LUI, rd, imm << 12))
    }
}

fn c_alu(inst: u16, xlen: Xlen) -> Option<u32> {
    let rd = reg_prime((inst >> 7) & 0x7);
    let funct2 = (inst >> 10) & 0x3;
    match funct2 {
        0b00 | 0b01 => {
            // c.srli / c.srai
            let shamt = shamt6(inst, xlen)?;
            let funct7 = if funct2 == 0 { 0 } else { 0b0100000 };
            Some(encode_r_shift(rd, shamt, funct7))
        }
        0b10 => Some(encode_i(OP_OP_IMM, rd, rd, FUNCT3_AND, imm6(inst))),
        _ => {
            let rs2 = reg_prime((inst >> 2) & 0x7);
            let word = (inst >> 12) & 1 != 0;
            match ((inst >> 5) & 0x3, word) {
                (0b00, false) => Some(encode_r(OP_OP, rd, rd, rs2, FUNCT3_ADD_SUB, 0b0100000)),
                (0b01, false) => Some(encode_r(OP_OP, rd, rd, rs2, FUNCT3_XOR, 0)),
                (0b10, false) => Some(encode_r(OP_OP, rd, rd, rs2, FUNCT3_OR, 0)),
                (0b11, false) => Some(encode_r(OP_OP, rd, rd, rs2, FUNCT3_AND, 0)),
                (0b00, true) if xlen == Xlen::Rv64 => {
                    Some(encode_r(OP_OP_32, rd, rd, rs2, FUNCT3_ADD_SUB, 0b0100000))
                }
                (0b01, true) if xlen == Xlen::Rv64 => {
                    Some(encode_r(OP_OP_32, rd, rd, rs2, FUNCT3_ADD_SUB, 0))
                }
                _ => None,
            }
        }
    }
}

fn shamt6(inst: u16, xlen: Xlen) -> Option<u32> {
    let shamt = (((inst >> 12) & 1) << 5 | ((inst >> 2) & 0x1F)) as u32;
    if xlen == Xlen::Rv32 && shamt >= 32 {
        return None;
    }
    Some(shamt)
}

fn encode_r_shift(rd: u32, shamt: u32, funct7: u32) -> u32 {
    (funct7 << 25) | (shamt << 20) | (rd << 15) | (FUNCT3_SRL_SRA << 12) | (rd << 7) | OP_OP_IMM
}

fn branch_imm(inst: u16) -> i32 {
    let i = inst as u32;
    sign_extend(
        ((i >> 12) & 1) << 8
            | ((i >> 10) & 0x3) << 3
            | ((i >> 5) & 0x3) << 6
            | ((i >> 3) & 0x3) << 1
            | ((i >> 2) & 1) << 5,
        9,
    )
}

fn c_beqz(inst: u16) -> Option<u32> {
    Some(encode_b(OP_BRANCH, reg_prime((inst >> 7) & 0x7), 0, FUNCT3_BEQ, branch_imm(inst)))
}

fn c_bnez(inst: u16) -> Option<u32> {
    Some(encode_b(OP_BRANCH, reg_prime((inst >> 7) & 0x7), 0, FUNCT3_BNE, branch_imm(inst)))
}

// Quadrant 2

fn c_slli(inst: u16, xlen: Xlen) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    let shamt = shamt6(inst, xlen)?;
    Some(encode_i(OP_OP_IMM, rd, rd, FUNCT3_SLL, shamt as i32))
}

fn c_lwsp(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    if rd == 0 {
        return None;
    }
    let i = inst as u32;
    let imm = ((i >> 12) & 1) << 5 | ((i >> 4) & 0x7) << 2 | ((i >> 2) & 0x3) << 6;
    Some(encode_i(OP_LOAD, rd, 2, FUNCT3_LW, imm as i32))
}

fn uimm_sp_d(inst: u16) -> u32 {
    let i = inst as u32;
    ((i >> 12) & 1) << 5 | ((i >> 5) & 0x3) << 3 | ((i >> 2) & 0x7) << 6
}

fn c_ldsp(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    if rd == 0 {
        return None;
    }
    Some(encode_i(OP_LOAD, rd, 2, FUNCT3_LD, uimm_sp_d(inst) as i32))
}

fn c_fldsp(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    Some(encode_i(OP_LOAD_FP, rd, 2, 0b011, uimm_sp_d(inst) as i32))
}

fn c_flwsp(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    let i = inst as u32;
    let imm = ((i >> 12) & 1) << 5 | ((i >> 4) & 0x7) << 2 | ((i >> 2) & 0x3) << 6;
    Some(encode_i(OP_LOAD_FP, rd, 2, 0b010, imm as i32))
}

fn c_jr_mv_add(inst: u16) -> Option<u32> {
    let bit12 = (inst >> 12) & 1;
    let rs1 = ((inst >> 7) & 0x1F) as u32;
    let rs2 = ((inst >> 2) & 0x1F) as u32;
    match (bit12, rs1, rs2) {
        (0, 0, _) => None,
        (0, _, 0) => Some(encode_i(OP_JALR, 0, rs1, 0, 0)), // c.jr
        (0, _, _) => Some(encode_r(OP_OP, rs1, 0, rs2, FUNCT3_ADD_SUB, 0)), // c.mv
        (1, 0, 0) => Some(INST_EBREAK),
        (1, _, 0) => Some(encode_i(OP_JALR, 1, rs1, 0, 0)), // c.jalr
        (1, _, _) => Some(encode_r(OP_OP, rs1, rs1, rs2, FUNCT3_ADD_SUB, 0)), // c.add
        _ => None,
    }
}

fn sp_store_imm_w(inst: u16) -> u32 {
    let i = inst as u32;
    ((i >> 9) & 0xF) << 2 | ((i >> 7) & 0x3) << 6
}

fn sp_store_imm_d(inst: u16) -> u32 {
    let i = inst as u32;
    ((i >> 10) & 0x7) << 3 | ((i >> 7) & 0x7) << 6
}

fn c_swsp(inst: u16) -> Option<u32> {
    let rs2 = ((inst >> 2) & 0x1F) as u32;
    Some(encode_s(OP_STORE, 2, rs2, FUNCT3_LW, sp_store_imm_w(inst) as i32))
}

fn c_sdsp(inst: u16) -> Option<u32> {
    let rs2 = ((inst >> 2) & 0x1F) as u32;
    Some(encode_s(OP_STORE, 2, rs2, FUNCT3_LD, sp_store_imm_d(inst) as i32))
}

fn c_fsdsp(inst: u16) -> Option<u32> {
    let rs2 = ((inst >> 2) & 0x1F) as u32;
    Some(encode_s(OP_STORE_FP, 2, rs2, 0b011, sp_store_imm_d(inst) as i32))
}

fn c_fswsp(inst: u16) -> Option<u32> {
    let rs2 = ((inst >> 2) & 0x1F) as u32;
    Some(encode_s(OP_STORE_FP, 2, rs2, 0b010, sp_store_imm_w(inst) as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addi_expansion() {
        // c.addi x10, -1  => 0x157d
        let e = expand(0x157D, Xlen::Rv64).unwrap();
        assert_eq!(e & 0x7F, OP_OP_IMM);
        assert_eq!((e >> 7) & 0x1F, 10);
        assert_eq!((e >> 15) & 0x1F, 10);
        assert_eq!(DecodedInst::imm_i(e), -1);
    }

    #[test]
    fn li_and_lui() {
        // c.li a0, 1 => 0x4505
        let e = expand(0x4505, Xlen::Rv64).unwrap();
        assert_eq!(e & 0x7F, OP_OP_IMM);
        assert_eq!((e >> 15) & 0x1F, 0);
        assert_eq!(DecodedInst::imm_i(e), 1);
        // c.lui a1, 0x1f => 0x65fd
        let e = expand(0x65FD, Xlen::Rv64).unwrap();
        assert_eq!(e & 0x7F, OP_LUI);
        assert_eq!(DecodedInst::imm_u(e), 0x1F << 12);
    }

    #[test]
    fn memory_forms() {
        // c.lw a2, 0(a0) => 0x4110
        let e = expand(0x4110, Xlen::Rv64).unwrap();
        assert_eq!(e & 0x7F, OP_LOAD);
        assert_eq!((e >> 12) & 7, FUNCT3_LW);
        assert_eq!((e >> 15) & 0x1F, 10);
        assert_eq!((e >> 7) & 0x1F, 12);
        // c.sd a2, 8(a0) => 0xe510
        let e = expand(0xE510, Xlen::Rv64).unwrap();
        assert_eq!(e & 0x7F, OP_STORE);
        assert_eq!((e >> 12) & 7, FUNCT3_LD);
        assert_eq!(DecodedInst::imm_s(e), 8);
        // The same encoding is c.fsw on RV32.
        let e = expand(0xE510, Xlen::Rv32).unwrap();
        assert_eq!(e & 0x7F, OP_STORE_FP);
    }

    #[test]
    fn jr_mv_add_group() {
        // c.jr ra => 0x8082
        let e = expand(0x8082, Xlen::Rv64).unwrap();
        assert_eq!(e & 0x7F, OP_JALR);
        assert_eq!((e >> 7) & 0x1F, 0);
        assert_eq!((e >> 15) & 0x1F, 1);
        // c.ebreak => 0x9002
        assert_eq!(expand(0x9002, Xlen::Rv64).unwrap(), INST_EBREAK);
        // c.add a0, a1 => 0x952e
        let e = expand(0x952E, Xlen::Rv64).unwrap();
        assert_eq!(e & 0x7F, OP_OP);
        assert_eq!((e >> 7) & 0x1F, 10);
        assert_eq!((e >> 20) & 0x1F, 11);
    }

    #[test]
    fn rv64_only_forms_reserved_on_rv32() {
        // c.addiw a0, 1 is c.jal on RV32.
        let e = expand(0x2505, Xlen::Rv64).unwrap();
        assert_eq!(e & 0x7F, OP_OP_IMM_32);
        let e = expand(0x2505, Xlen::Rv32).unwrap();
        assert_eq!(e & 0x7F, OP_JAL);
        assert_eq!((e >> 7) & 0x1F, 1);
        // Wide shift amounts are reserved on RV32.
        assert!(expand(0x1502, Xlen::Rv64).is_some()); // c.slli a0, 32
        assert!(expand(0x1502, Xlen::Rv32).is_none());
    }

    #[test]
    fn illegal_all_zero() {
        assert!(expand(0x0000, Xlen::Rv64).is_none());
    }

    #[test]
    fn branch_offsets() {
        // c.beqz s0, +8 => 0xc401
        let e = expand(0xC401, Xlen::Rv64).unwrap();
        assert_eq!(e & 0x7F, OP_BRANCH);
        assert_eq!((e >> 15) & 0x1F, 8);
        assert_eq!(DecodedInst::imm_b(e), 8);
        // c.j -4 => 0xbff5
        let e = expand(0xBFF5, Xlen::Rv64).unwrap();
        assert_eq!(e & 0x7F, OP_JAL);
        assert_eq!(DecodedInst::imm_j(e), -4);
    }
}
