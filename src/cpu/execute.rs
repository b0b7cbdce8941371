//! Instruction execution: RV64/RV32 I, M, A and the system instructions
//!
//! The interpreter works on the 32-bit instruction forms; compressed
//! instructions are expanded by `execute_c` first. RV32 mode rides on the
//! RV64 datapath by keeping every register value sign-extended to 64 bits,
//! which makes the W-shaped operations serve as the RV32 ALU.

use super::csr::*;
use super::decode::*;
use super::mmu::Access;
use super::trap::Trap;
use super::{Hart, PrivilegeLevel, Xlen};
use crate::machine::{AmoOp, Machine};

impl Hart {
    pub(crate) fn execute(&mut self, machine: &Machine, inst: u32) -> Result<(), Trap> {
        let d = DecodedInst::decode(inst);

        match d.opcode {
            OP_LUI => {
                self.write_reg(d.rd, DecodedInst::imm_u(inst) as i64 as u64);
                self.advance_pc(4);
            }
            OP_AUIPC => {
                let imm = DecodedInst::imm_u(inst) as i64 as u64;
                self.write_reg(d.rd, self.pc.wrapping_add(imm));
                self.advance_pc(4);
            }
            OP_JAL => {
                let imm = DecodedInst::imm_j(inst) as i64 as u64;
                let link = self.pc.wrapping_add(4);
                self.pc = self.pc.wrapping_add(imm);
                self.normalize_pc();
                self.write_reg(d.rd, link);
            }
            OP_JALR => {
                let imm = DecodedInst::imm_i(inst) as i64 as u64;
                let target = self.read_reg(d.rs1).wrapping_add(imm) & !1;
                let link = self.pc.wrapping_add(4);
                self.pc = target;
                self.normalize_pc();
                self.write_reg(d.rd, link);
            }
            OP_BRANCH => {
                let rs1 = self.read_reg(d.rs1);
                let rs2 = self.read_reg(d.rs2);
                let taken = match d.funct3 {
                    FUNCT3_BEQ => rs1 == rs2,
                    FUNCT3_BNE => rs1 != rs2,
                    FUNCT3_BLT => (rs1 as i64) < (rs2 as i64),
                    FUNCT3_BGE => (rs1 as i64) >= (rs2 as i64),
                    FUNCT3_BLTU => rs1 < rs2,
                    FUNCT3_BGEU => rs1 >= rs2,
                    _ => return Err(Trap::IllegalInstruction(inst as u64)),
                };
                if taken {
                    let imm = DecodedInst::imm_b(inst) as i64 as u64;
                    self.pc = self.pc.wrapping_add(imm);
                    self.normalize_pc();
                } else {
                    self.advance_pc(4);
                }
            }
            OP_LOAD => {
                let imm = DecodedInst::imm_i(inst) as i64 as u64;
                let vaddr = self.read_reg(d.rs1).wrapping_add(imm);
                let value = match d.funct3 {
                    FUNCT3_LB => self.load_virt(machine, vaddr, 1)? as i8 as i64 as u64,
                    FUNCT3_LH => self.load_virt(machine, vaddr, 2)? as i16 as i64 as u64,
                    FUNCT3_LW => self.load_virt(machine, vaddr, 4)? as i32 as i64 as u64,
                    FUNCT3_LBU => self.load_virt(machine, vaddr, 1)?,
                    FUNCT3_LHU => self.load_virt(machine, vaddr, 2)?,
                    FUNCT3_LWU if self.xlen == Xlen::Rv64 => self.load_virt(machine, vaddr, 4)?,
                    FUNCT3_LD if self.xlen == Xlen::Rv64 => self.load_virt(machine, vaddr, 8)?,
                    _ => return Err(Trap::IllegalInstruction(inst as u64)),
                };
                self.write_reg(d.rd, value);
                self.advance_pc(4);
            }
            OP_STORE => {
                let imm = DecodedInst::imm_s(inst) as i64 as u64;
                let vaddr = self.read_reg(d.rs1).wrapping_add(imm);
                let value = self.read_reg(d.rs2);
                match d.funct3 {
                    0b000 => self.store_virt(machine, vaddr, 1, value)?,
                    0b001 => self.store_virt(machine, vaddr, 2, value)?,
                    0b010 => self.store_virt(machine, vaddr, 4, value)?,
                    0b011 if self.xlen == Xlen::Rv64 => self.store_virt(machine, vaddr, 8, value)?,
                    _ => return Err(Trap::IllegalInstruction(inst as u64)),
                }
                self.advance_pc(4);
            }
            OP_OP_IMM => {
                let result = self.op_imm(inst, &d)?;
                self.write_reg(d.rd, result);
                self.advance_pc(4);
            }
            OP_OP => {
                let result = self.op_reg(inst, &d)?;
                self.write_reg(d.rd, result);
                self.advance_pc(4);
            }
            OP_OP_IMM_32 if self.xlen == Xlen::Rv64 => {
                let rs1 = self.read_reg(d.rs1) as u32;
                let imm = DecodedInst::imm_i(inst);
                let shamt = (imm & 0x1F) as u32;
                let funct7 = (inst >> 25) & 0x7F;
                let result = match d.funct3 {
                    FUNCT3_ADD_SUB => (rs1 as i32).wrapping_add(imm) as u32,
                    FUNCT3_SLL if funct7 == 0 => rs1 << shamt,
                    FUNCT3_SRL_SRA if funct7 == 0 => rs1 >> shamt,
                    FUNCT3_SRL_SRA if funct7 == 0b0100000 => ((rs1 as i32) >> shamt) as u32,
                    _ => return Err(Trap::IllegalInstruction(inst as u64)),
                };
                self.write_reg(d.rd, result as i32 as i64 as u64);
                self.advance_pc(4);
            }
            OP_OP_32 if self.xlen == Xlen::Rv64 => {
                let rs1 = self.read_reg(d.rs1) as u32;
                let rs2 = self.read_reg(d.rs2) as u32;
                let result = if d.funct7 == 0b0000001 {
                    alu32_m(d.funct3, rs1, rs2).ok_or(Trap::IllegalInstruction(inst as u64))?
                } else {
                    match (d.funct3, d.funct7) {
                        (FUNCT3_ADD_SUB, 0b0000000) => rs1.wrapping_add(rs2),
                        (FUNCT3_ADD_SUB, 0b0100000) => rs1.wrapping_sub(rs2),
                        (FUNCT3_SLL, 0b0000000) => rs1 << (rs2 & 0x1F),
                        (FUNCT3_SRL_SRA, 0b0000000) => rs1 >> (rs2 & 0x1F),
                        (FUNCT3_SRL_SRA, 0b0100000) => ((rs1 as i32) >> (rs2 & 0x1F)) as u32,
                        _ => return Err(Trap::IllegalInstruction(inst as u64)),
                    }
                };
                self.write_reg(d.rd, result as i32 as i64 as u64);
                self.advance_pc(4);
            }
            OP_AMO => {
                self.execute_amo(machine, inst, &d)?;
                self.advance_pc(4);
            }
            OP_MISC_MEM => {
                match d.funct3 {
                    0b000 => {
                        // FENCE: guest rw ordering maps onto a host fence.
                        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
                    }
                    0b001 => {
                        // FENCE.I: every compiled block translated from RAM
                        // may now be stale, on every hart.
                        machine.fence_i(self.id);
                        self.mmu.flush_all();
                    }
                    _ => return Err(Trap::IllegalInstruction(inst as u64)),
                }
                self.advance_pc(4);
            }
            OP_SYSTEM => self.execute_system(machine, inst, &d)?,
            OP_LOAD_FP => {
                self.execute_load_fp(machine, inst, &d)?;
                self.advance_pc(4);
            }
            OP_STORE_FP => {
                self.execute_store_fp(machine, inst, &d)?;
                self.advance_pc(4);
            }
            OP_OP_FP => {
                self.execute_op_fp(inst, &d)?;
                self.advance_pc(4);
            }
            OP_MADD | OP_MSUB | OP_NMSUB | OP_NMADD => {
                self.execute_fma(inst, &d)?;
                self.advance_pc(4);
            }
            _ => return Err(Trap::IllegalInstruction(inst as u64)),
        }

        Ok(())
    }

    #[inline(always)]
    pub(crate) fn advance_pc(&mut self, len: u64) {
        self.pc = self.pc.wrapping_add(len);
        self.normalize_pc();
    }

    fn op_imm(&mut self, inst: u32, d: &DecodedInst) -> Result<u64, Trap> {
        let rs1 = self.read_reg(d.rs1);
        let imm = DecodedInst::imm_i(inst) as i64 as u64;
        let shamt = (imm & 0x3F) as u32;
        // Legal shift encodings: imm[11:6] must be 000000 (logical) or
        // 010000 (arithmetic); RV32 additionally requires shamt < 32.
        let upper = (imm >> 6) & 0x3F;
        let sra_bit = upper == 0b010000;
        let shamt_ok = match self.xlen {
            Xlen::Rv32 => shamt < 32,
            Xlen::Rv64 => true,
        };

        let result = match d.funct3 {
            FUNCT3_ADD_SUB => rs1.wrapping_add(imm),
            FUNCT3_SLT => ((rs1 as i64) < (imm as i64)) as u64,
            FUNCT3_SLTU => (rs1 < imm) as u64,
            FUNCT3_XOR => rs1 ^ imm,
            FUNCT3_OR => rs1 | imm,
            FUNCT3_AND => rs1 & imm,
            FUNCT3_SLL => {
                if upper != 0 || !shamt_ok {
                    return Err(Trap::IllegalInstruction(inst as u64));
                }
                self.shift_left(rs1, shamt)
            }
            FUNCT3_SRL_SRA => {
                if (upper != 0 && !sra_bit) || !shamt_ok {
                    return Err(Trap::IllegalInstruction(inst as u64));
                }
                if sra_bit {
                    self.shift_right_arith(rs1, shamt)
                } else {
                    self.shift_right(rs1, shamt)
                }
            }
            _ => return Err(Trap::IllegalInstruction(inst as u64)),
        };
        Ok(result)
    }

    fn op_reg(&mut self, inst: u32, d: &DecodedInst) -> Result<u64, Trap> {
        let rs1 = self.read_reg(d.rs1);
        let rs2 = self.read_reg(d.rs2);
        let shamt = match self.xlen {
            Xlen::Rv32 => (rs2 & 0x1F) as u32,
            Xlen::Rv64 => (rs2 & 0x3F) as u32,
        };

        if d.funct7 == 0b0000001 {
            let result = match self.xlen {
                Xlen::Rv64 => {
                    alu64_m(d.funct3, rs1, rs2).ok_or(Trap::IllegalInstruction(inst as u64))?
                }
                Xlen::Rv32 => alu32_m(d.funct3, rs1 as u32, rs2 as u32)
                    .map(|v| v as i32 as i64 as u64)
                    .ok_or(Trap::IllegalInstruction(inst as u64))?,
            };
            return Ok(result);
        }

        let result = match (d.funct3, d.funct7) {
            (FUNCT3_ADD_SUB, 0b0000000) => rs1.wrapping_add(rs2),
            (FUNCT3_ADD_SUB, 0b0100000) => rs1.wrapping_sub(rs2),
            (FUNCT3_SLL, 0b0000000) => self.shift_left(rs1, shamt),
            (FUNCT3_SLT, 0b0000000) => ((rs1 as i64) < (rs2 as i64)) as u64,
            (FUNCT3_SLTU, 0b0000000) => (rs1 < rs2) as u64,
            (FUNCT3_XOR, 0b0000000) => rs1 ^ rs2,
            (FUNCT3_SRL_SRA, 0b0000000) => self.shift_right(rs1, shamt),
            (FUNCT3_SRL_SRA, 0b0100000) => self.shift_right_arith(rs1, shamt),
            (FUNCT3_OR, 0b0000000) => rs1 | rs2,
            (FUNCT3_AND, 0b0000000) => rs1 & rs2,
            _ => return Err(Trap::IllegalInstruction(inst as u64)),
        };
        Ok(result)
    }

    // On RV32 the register file holds sign-extended 32-bit values; shifts
    // must operate on the 32-bit view to stay within that invariant.
    #[inline(always)]
    fn shift_left(&self, v: u64, shamt: u32) -> u64 {
        match self.xlen {
            Xlen::Rv32 => ((v as u32) << shamt) as u64,
            Xlen::Rv64 => v << shamt,
        }
    }

    #[inline(always)]
    fn shift_right(&self, v: u64, shamt: u32) -> u64 {
        match self.xlen {
            Xlen::Rv32 => ((v as u32) >> shamt) as u64,
            Xlen::Rv64 => v >> shamt,
        }
    }

    #[inline(always)]
    fn shift_right_arith(&self, v: u64, shamt: u32) -> u64 {
        match self.xlen {
            Xlen::Rv32 => ((v as u32 as i32) >> shamt) as u64,
            Xlen::Rv64 => ((v as i64) >> shamt) as u64,
        }
    }

    fn execute_system(&mut self, machine: &Machine, inst: u32, d: &DecodedInst) -> Result<(), Trap> {
        match d.funct3 {
            FUNCT3_PRIV => match inst {
                INST_ECALL => Err(match self.priv_level {
                    PrivilegeLevel::User => Trap::EnvironmentCallFromU,
                    PrivilegeLevel::Supervisor => Trap::EnvironmentCallFromS,
                    PrivilegeLevel::Machine => Trap::EnvironmentCallFromM,
                }),
                INST_EBREAK => Err(Trap::Breakpoint(self.pc)),
                INST_SRET => {
                    if self.priv_level < PrivilegeLevel::Supervisor
                        || (self.priv_level == PrivilegeLevel::Supervisor
                            && self.csr.mstatus & MSTATUS_TSR != 0)
                    {
                        return Err(Trap::IllegalInstruction(inst as u64));
                    }
                    super::trap::sret(self);
                    Ok(())
                }
                INST_MRET => {
                    if self.priv_level < PrivilegeLevel::Machine {
                        return Err(Trap::IllegalInstruction(inst as u64));
                    }
                    super::trap::mret(self);
                    Ok(())
                }
                INST_WFI => {
                    if self.priv_level < PrivilegeLevel::Machine
                        && self.csr.mstatus & MSTATUS_TW != 0
                    {
                        return Err(Trap::IllegalInstruction(inst as u64));
                    }
                    self.advance_pc(4);
                    self.enter_wfi();
                    Ok(())
                }
                _ if d.funct7 == FUNCT7_SFENCE_VMA => {
                    if self.priv_level < PrivilegeLevel::Supervisor
                        || (self.priv_level == PrivilegeLevel::Supervisor
                            && self.csr.mstatus & MSTATUS_TVM != 0)
                    {
                        return Err(Trap::IllegalInstruction(inst as u64));
                    }
                    let vaddr = (d.rs1 != 0).then(|| self.read_reg(d.rs1));
                    let asid = (d.rs2 != 0).then(|| self.read_reg(d.rs2) as u16);
                    self.mmu.fence(vaddr, asid);
                    self.advance_pc(4);
                    Ok(())
                }
                _ => Err(Trap::IllegalInstruction(inst as u64)),
            },
            FUNCT3_CSRRW | FUNCT3_CSRRS | FUNCT3_CSRRC | FUNCT3_CSRRWI | FUNCT3_CSRRSI
            | FUNCT3_CSRRCI => self.execute_csr(machine, inst, d),
            _ => Err(Trap::IllegalInstruction(inst as u64)),
        }
    }

    fn execute_csr(&mut self, machine: &Machine, inst: u32, d: &DecodedInst) -> Result<(), Trap> {
        let csr_addr = DecodedInst::csr(inst);
        let is_imm = d.funct3 >= FUNCT3_CSRRWI;
        let rs1_val = if is_imm { d.rs1 as u64 } else { self.read_reg(d.rs1) };
        let kind = d.funct3 & 0x3;

        let old_val = match csr_addr {
            CSR_FFLAGS | CSR_FRM | CSR_FCSR => {
                if !self.fs_enabled() {
                    return Err(Trap::IllegalInstruction(inst as u64));
                }
                match csr_addr {
                    CSR_FFLAGS => self.fpu.fflags.to_bits() as u64,
                    CSR_FRM => self.fpu.frm as u64,
                    _ => self.fpu.read_fcsr() as u64,
                }
            }
            CSR_TIME => {
                self.csr.time = machine.intc.mtime();
                self.csr
                    .read(csr_addr, self.priv_level)
                    .ok_or(Trap::IllegalInstruction(inst as u64))?
            }
            _ => self
                .csr
                .read(csr_addr, self.priv_level)
                .ok_or(Trap::IllegalInstruction(inst as u64))?,
        };

        let new_val = match kind {
            0b01 => rs1_val,
            0b10 => old_val | rs1_val,
            0b11 => old_val & !rs1_val,
            _ => old_val,
        };

        // Set-type and clear-type forms with rs1=x0 must not write at all.
        let writes = kind == 0b01 || rs1_val != 0;
        if writes {
            match csr_addr {
                CSR_FFLAGS => {
                    self.fpu.fflags = super::fpu::FFlags::from_bits(new_val as u32 & 0x1F);
                    self.set_fs_dirty();
                }
                CSR_FRM => {
                    self.fpu.frm = super::fpu::RoundingMode::from_bits(new_val as u32 & 0b111)
                        .unwrap_or(super::fpu::RoundingMode::Rne);
                    self.set_fs_dirty();
                }
                CSR_FCSR => {
                    self.fpu.write_fcsr(new_val as u32);
                    self.set_fs_dirty();
                }
                _ => {
                    let effect = self
                        .csr
                        .write(csr_addr, new_val, self.priv_level)
                        .ok_or(Trap::IllegalInstruction(inst as u64))?;
                    if effect.flush_tlb {
                        self.mmu.flush_all();
                    }
                }
            }
        }

        self.write_reg(d.rd, old_val);
        self.advance_pc(4);
        Ok(())
    }

    pub(crate) fn fs_enabled(&self) -> bool {
        self.csr.mstatus & MSTATUS_FS != 0
    }

    pub(crate) fn set_fs_dirty(&mut self) {
        self.csr.mstatus |= MSTATUS_FS;
    }

    fn execute_amo(&mut self, machine: &Machine, inst: u32, d: &DecodedInst) -> Result<(), Trap> {
        let funct5 = (inst >> 27) & 0x1F;
        let width = match d.funct3 {
            0b010 => 4,
            0b011 if self.xlen == Xlen::Rv64 => 8,
            _ => return Err(Trap::IllegalInstruction(inst as u64)),
        };
        let vaddr = self.wrap_addr(self.read_reg(d.rs1));

        if vaddr & (width as u64 - 1) != 0 {
            // Misaligned AMO/SC is a store-class fault; LR is a load.
            return Err(if funct5 == FUNCT5_LR {
                Trap::LoadAddressMisaligned(vaddr)
            } else {
                Trap::StoreAddressMisaligned(vaddr)
            });
        }

        match funct5 {
            FUNCT5_LR => {
                let paddr = self.translate(machine, vaddr, Access::Load)?;
                let value =
                    machine.lr(self.id, paddr, width).map_err(|_| Trap::LoadAccessFault(vaddr))?;
                self.write_reg(d.rd, sext(value, width));
            }
            FUNCT5_SC => {
                let paddr = self.translate(machine, vaddr, Access::Store)?;
                let src = self.read_reg(d.rs2);
                let outcome = machine
                    .sc(self.id, paddr, width, src)
                    .map_err(|_| Trap::StoreAccessFault(vaddr))?;
                self.write_reg(d.rd, outcome);
            }
            _ => {
                let op = AmoOp::from_funct5(funct5)
                    .ok_or(Trap::IllegalInstruction(inst as u64))?;
                let paddr = self.translate(machine, vaddr, Access::Store)?;
                let src = self.read_reg(d.rs2);
                let old = machine
                    .amo(self.id, paddr, width, op, src)
                    .map_err(|_| Trap::StoreAccessFault(vaddr))?;
                self.write_reg(d.rd, sext(old, width));
            }
        }
        Ok(())
    }
}

#[inline(always)]
fn sext(value: u64, width: usize) -> u64 {
    if width == 4 {
        value as u32 as i32 as i64 as u64
    } else {
        value
    }
}

// M-extension arithmetic, shared with the JIT out-of-line helpers.

pub(crate) fn alu64_m(funct3: u32, rs1: u64, rs2: u64) -> Option<u64> {
    Some(match funct3 {
        FUNCT3_MUL => rs1.wrapping_mul(rs2),
        FUNCT3_MULH => (((rs1 as i64 as i128) * (rs2 as i64 as i128)) >> 64) as u64,
        FUNCT3_MULHSU => (((rs1 as i64 as i128) * (rs2 as u128 as i128)) >> 64) as u64,
        FUNCT3_MULHU => (((rs1 as u128) * (rs2 as u128)) >> 64) as u64,
        FUNCT3_DIV => {
            let (a, b) = (rs1 as i64, rs2 as i64);
            if b == 0 {
                u64::MAX
            } else if a == i64::MIN && b == -1 {
                a as u64
            } else {
                (a / b) as u64
            }
        }
        FUNCT3_DIVU => {
            if rs2 == 0 {
                u64::MAX
            } else {
                rs1 / rs2
            }
        }
        FUNCT3_REM => {
            let (a, b) = (rs1 as i64, rs2 as i64);
            if b == 0 {
                rs1
            } else if a == i64::MIN && b == -1 {
                0
            } else {
                (a % b) as u64
            }
        }
        FUNCT3_REMU => {
            if rs2 == 0 {
                rs1
            } else {
                rs1 % rs2
            }
        }
        _ => return None,
    })
}

pub(crate) fn alu32_m(funct3: u32, rs1: u32, rs2: u32) -> Option<u32> {
    Some(match funct3 {
        FUNCT3_MUL => rs1.wrapping_mul(rs2),
        FUNCT3_MULH => (((rs1 as i32 as i64) * (rs2 as i32 as i64)) >> 32) as u32,
        FUNCT3_MULHSU => (((rs1 as i32 as i64) * (rs2 as u64 as i64)) >> 32) as u32,
        FUNCT3_MULHU => (((rs1 as u64) * (rs2 as u64)) >> 32) as u32,
        FUNCT3_DIV => {
            let (a, b) = (rs1 as i32, rs2 as i32);
            if b == 0 {
                u32::MAX
            } else if a == i32::MIN && b == -1 {
                a as u32
            } else {
                (a / b) as u32
            }
        }
        FUNCT3_DIVU => {
            if rs2 == 0 {
                u32::MAX
            } else {
                rs1 / rs2
            }
        }
        FUNCT3_REM => {
            let (a, b) = (rs1 as i32, rs2 as i32);
            if b == 0 {
                rs1
            } else if a == i32::MIN && b == -1 {
                0
            } else {
                (a % b) as u32
            }
        }
        FUNCT3_REMU => {
            if rs2 == 0 {
                rs1
            } else {
                rs1 % rs2
            }
        }
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn division_by_zero_semantics() {
        assert_eq!(alu64_m(FUNCT3_DIV, 42, 0), Some(u64::MAX));
        assert_eq!(alu64_m(FUNCT3_DIVU, 42, 0), Some(u64::MAX));
        assert_eq!(alu64_m(FUNCT3_REM, 42, 0), Some(42));
        assert_eq!(alu64_m(FUNCT3_REMU, 42, 0), Some(42));
        assert_eq!(alu32_m(FUNCT3_DIV, 7, 0), Some(u32::MAX));
        assert_eq!(alu32_m(FUNCT3_REM, 7, 0), Some(7));
    }

    #[test]
    fn division_overflow() {
        assert_eq!(alu64_m(FUNCT3_DIV, i64::MIN as u64, -1i64 as u64), Some(i64::MIN as u64));
        assert_eq!(alu64_m(FUNCT3_REM, i64::MIN as u64, -1i64 as u64), Some(0));
        assert_eq!(alu32_m(FUNCT3_DIV, i32::MIN as u32, -1i32 as u32), Some(i32::MIN as u32));
    }

    #[test]
    fn mulh_variants() {
        assert_eq!(alu64_m(FUNCT3_MULH, -1i64 as u64, -1i64 as u64), Some(0));
        assert_eq!(alu64_m(FUNCT3_MULHU, u64::MAX, u64::MAX), Some(u64::MAX - 1));
        assert_eq!(alu64_m(FUNCT3_MULHSU, -1i64 as u64, u64::MAX), Some(u64::MAX));
    }
}
