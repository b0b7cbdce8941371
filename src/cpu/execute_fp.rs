//! Floating-point instruction execution (F and D)
//!
//! All FP instructions require `mstatus.FS` to be on and mark it dirty on
//! any FP state write. Arithmetic goes through the flag-accumulating
//! helpers in `fpu`.

use super::decode::*;
use super::fpu::{self, FpCompare, RoundingMode};
use super::trap::Trap;
use super::{Hart, Xlen};
use crate::machine::Machine;

impl Hart {
    pub(crate) fn execute_load_fp(
        &mut self,
        machine: &Machine,
        inst: u32,
        d: &DecodedInst,
    ) -> Result<(), Trap> {
        if !self.fs_enabled() {
            return Err(Trap::IllegalInstruction(inst as u64));
        }
        let imm = DecodedInst::imm_i(inst) as i64 as u64;
        let vaddr = self.read_reg(d.rs1).wrapping_add(imm);
        match d.funct3 {
            0b010 => {
                let bits = self.load_virt(machine, vaddr, 4)? as u32;
                self.fpu.write_f32(d.rd, bits);
            }
            0b011 => {
                let bits = self.load_virt(machine, vaddr, 8)?;
                self.fpu.write_f64(d.rd, bits);
            }
            _ => return Err(Trap::IllegalInstruction(inst as u64)),
        }
        self.set_fs_dirty();
        Ok(())
    }

    pub(crate) fn execute_store_fp(
        &mut self,
        machine: &Machine,
        inst: u32,
        d: &DecodedInst,
    ) -> Result<(), Trap> {
        if !self.fs_enabled() {
            return Err(Trap::IllegalInstruction(inst as u64));
        }
        let imm = DecodedInst::imm_s(inst) as i64 as u64;
        let vaddr = self.read_reg(d.rs1).wrapping_add(imm);
        match d.funct3 {
            // Stores write the raw register bits; NaN boxing is preserved.
            0b010 => self.store_virt(machine, vaddr, 4, self.fpu.fregs[d.rs2 as usize] as u64)?,
            0b011 => self.store_virt(machine, vaddr, 8, self.fpu.read_f64(d.rs2))?,
            _ => return Err(Trap::IllegalInstruction(inst as u64)),
        }
        Ok(())
    }

    pub(crate) fn execute_op_fp(&mut self, inst: u32, d: &DecodedInst) -> Result<(), Trap> {
        if !self.fs_enabled() {
            return Err(Trap::IllegalInstruction(inst as u64));
        }
        let illegal = Trap::IllegalInstruction(inst as u64);

        match d.funct7 {
            FUNCT7_FADD_S => {
                self.check_rm(d.funct3, inst)?;
                let (r, f) = fpu::f32_add(self.fpu.read_f32(d.rs1), self.fpu.read_f32(d.rs2));
                self.write_f32_result(d.rd, r, f);
            }
            FUNCT7_FSUB_S => {
                self.check_rm(d.funct3, inst)?;
                let (r, f) = fpu::f32_sub(self.fpu.read_f32(d.rs1), self.fpu.read_f32(d.rs2));
                self.write_f32_result(d.rd, r, f);
            }
            FUNCT7_FMUL_S => {
                self.check_rm(d.funct3, inst)?;
                let (r, f) = fpu::f32_mul(self.fpu.read_f32(d.rs1), self.fpu.read_f32(d.rs2));
                self.write_f32_result(d.rd, r, f);
            }
            FUNCT7_FDIV_S => {
                self.check_rm(d.funct3, inst)?;
                let (r, f) = fpu::f32_div(self.fpu.read_f32(d.rs1), self.fpu.read_f32(d.rs2));
                self.write_f32_result(d.rd, r, f);
            }
            FUNCT7_FSQRT_S => {
                if d.rs2 != 0 {
                    return Err(illegal);
                }
                self.check_rm(d.funct3, inst)?;
                let (r, f) = fpu::f32_sqrt(self.fpu.read_f32(d.rs1));
                self.write_f32_result(d.rd, r, f);
            }
            FUNCT7_FSGNJ_S => {
                let a = self.fpu.read_f32(d.rs1);
                let b = self.fpu.read_f32(d.rs2);
                let r = match d.funct3 {
                    FUNCT3_FSGNJ => (a & 0x7FFF_FFFF) | (b & 0x8000_0000),
                    FUNCT3_FSGNJN => (a & 0x7FFF_FFFF) | (!b & 0x8000_0000),
                    FUNCT3_FSGNJX => a ^ (b & 0x8000_0000),
                    _ => return Err(illegal),
                };
                self.fpu.write_f32(d.rd, r);
                self.set_fs_dirty();
            }
            FUNCT7_FMINMAX_S => {
                let is_max = match d.funct3 {
                    FUNCT3_FMIN => false,
                    FUNCT3_FMAX => true,
                    _ => return Err(illegal),
                };
                let (r, f) =
                    fpu::f32_minmax(self.fpu.read_f32(d.rs1), self.fpu.read_f32(d.rs2), is_max);
                self.write_f32_result(d.rd, r, f);
            }
            FUNCT7_FCMP_S => {
                let op = match d.funct3 {
                    FUNCT3_FEQ => FpCompare::Eq,
                    FUNCT3_FLT => FpCompare::Lt,
                    FUNCT3_FLE => FpCompare::Le,
                    _ => return Err(illegal),
                };
                let (r, f) =
                    fpu::f32_compare(self.fpu.read_f32(d.rs1), self.fpu.read_f32(d.rs2), op);
                self.fpu.fflags.merge(f);
                self.write_reg(d.rd, r as u64);
            }
            FUNCT7_FCVT_W_S => {
                let rm = self.check_rm(d.funct3, inst)?;
                let a = self.fpu.read_f32(d.rs1);
                let (v, f) = match d.rs2 {
                    0 => fpu::f32_to_i32(a, rm),
                    1 => fpu::f32_to_u32(a, rm),
                    2 if self.xlen == Xlen::Rv64 => fpu::f32_to_i64(a, rm),
                    3 if self.xlen == Xlen::Rv64 => fpu::f32_to_u64(a, rm),
                    _ => return Err(illegal),
                };
                self.fpu.fflags.merge(f);
                let v = if d.rs2 < 2 { v as i32 as i64 } else { v };
                self.write_reg(d.rd, v as u64);
            }
            FUNCT7_FCVT_S_W => {
                let _ = self.check_rm(d.funct3, inst)?;
                let x = self.read_reg(d.rs1);
                let (r, f) = match d.rs2 {
                    0 => fpu::i32_to_f32(x as i32),
                    1 => fpu::u32_to_f32(x as u32),
                    2 if self.xlen == Xlen::Rv64 => fpu::i64_to_f32(x as i64),
                    3 if self.xlen == Xlen::Rv64 => fpu::u64_to_f32(x),
                    _ => return Err(illegal),
                };
                self.write_f32_result(d.rd, r, f);
            }
            FUNCT7_FMV_X_W => match d.funct3 {
                0b000 => {
                    // Raw bit move, sign-extended.
                    let bits = self.fpu.fregs[d.rs1 as usize] as u32;
                    self.write_reg(d.rd, bits as i32 as i64 as u64);
                }
                0b001 => {
                    self.write_reg(d.rd, fpu::f32_classify(self.fpu.read_f32(d.rs1)));
                }
                _ => return Err(illegal),
            },
            FUNCT7_FMV_W_X => {
                if d.funct3 != 0 {
                    return Err(illegal);
                }
                self.fpu.write_f32(d.rd, self.read_reg(d.rs1) as u32);
                self.set_fs_dirty();
            }

            FUNCT7_FADD_D => {
                self.check_rm(d.funct3, inst)?;
                let (r, f) = fpu::f64_add(self.fpu.read_f64(d.rs1), self.fpu.read_f64(d.rs2));
                self.write_f64_result(d.rd, r, f);
            }
            FUNCT7_FSUB_D => {
                self.check_rm(d.funct3, inst)?;
                let (r, f) = fpu::f64_sub(self.fpu.read_f64(d.rs1), self.fpu.read_f64(d.rs2));
                self.write_f64_result(d.rd, r, f);
            }
            FUNCT7_FMUL_D => {
                self.check_rm(d.funct3, inst)?;
                let (r, f) = fpu::f64_mul(self.fpu.read_f64(d.rs1), self.fpu.read_f64(d.rs2));
                self.write_f64_result(d.rd, r, f);
            }
            FUNCT7_FDIV_D => {
                self.check_rm(d.funct3, inst)?;
                let (r, f) = fpu::f64_div(self.fpu.read_f64(d.rs1), self.fpu.read_f64(d.rs2));
                self.write_f64_result(d.rd, r, f);
            }
            FUNCT7_FSQRT_D => {
                if d.rs2 != 0 {
                    return Err(illegal);
                }
                self.check_rm(d.funct3, inst)?;
                let (r, f) = fpu::f64_sqrt(self.fpu.read_f64(d.rs1));
                self.write_f64_result(d.rd, r, f);
            }
            FUNCT7_FSGNJ_D => {
                let a = self.fpu.read_f64(d.rs1);
                let b = self.fpu.read_f64(d.rs2);
                let r = match d.funct3 {
                    FUNCT3_FSGNJ => (a & !(1 << 63)) | (b & (1 << 63)),
                    FUNCT3_FSGNJN => (a & !(1 << 63)) | (!b & (1 << 63)),
                    FUNCT3_FSGNJX => a ^ (b & (1 << 63)),
                    _ => return Err(illegal),
                };
                self.fpu.write_f64(d.rd, r);
                self.set_fs_dirty();
            }
            FUNCT7_FMINMAX_D => {
                let is_max = match d.funct3 {
                    FUNCT3_FMIN => false,
                    FUNCT3_FMAX => true,
                    _ => return Err(illegal),
                };
                let (r, f) =
                    fpu::f64_minmax(self.fpu.read_f64(d.rs1), self.fpu.read_f64(d.rs2), is_max);
                self.write_f64_result(d.rd, r, f);
            }
            FUNCT7_FCMP_D => {
                let op = match d.funct3 {
                    FUNCT3_FEQ => FpCompare::Eq,
                    FUNCT3_FLT => FpCompare::Lt,
                    FUNCT3_FLE => FpCompare::Le,
                    _ => return Err(illegal),
                };
                let (r, f) =
                    fpu::f64_compare(self.fpu.read_f64(d.rs1), self.fpu.read_f64(d.rs2), op);
                self.fpu.fflags.merge(f);
                self.write_reg(d.rd, r as u64);
            }
            FUNCT7_FCVT_S_D => {
                if d.rs2 != 1 {
                    return Err(illegal);
                }
                self.check_rm(d.funct3, inst)?;
                let (r, f) = fpu::f64_to_f32(self.fpu.read_f64(d.rs1));
                self.write_f32_result(d.rd, r, f);
            }
            FUNCT7_FCVT_D_S => {
                if d.rs2 != 0 {
                    return Err(illegal);
                }
                let (r, f) = fpu::f32_to_f64(self.fpu.read_f32(d.rs1));
                self.write_f64_result(d.rd, r, f);
            }
            FUNCT7_FCVT_W_D => {
                let rm = self.check_rm(d.funct3, inst)?;
                let a = self.fpu.read_f64(d.rs1);
                let (v, f) = match d.rs2 {
                    0 => fpu::f64_to_i32(a, rm),
                    1 => fpu::f64_to_u32(a, rm),
                    2 if self.xlen == Xlen::Rv64 => fpu::f64_to_i64(a, rm),
                    3 if self.xlen == Xlen::Rv64 => fpu::f64_to_u64(a, rm),
                    _ => return Err(illegal),
                };
                self.fpu.fflags.merge(f);
                let v = if d.rs2 < 2 { v as i32 as i64 } else { v };
                self.write_reg(d.rd, v as u64);
            }
            FUNCT7_FCVT_D_W => {
                let _ = self.check_rm(d.funct3, inst)?;
                let x = self.read_reg(d.rs1);
                let (r, f) = match d.rs2 {
                    0 => fpu::i32_to_f64(x as i32),
                    1 => fpu::u32_to_f64(x as u32),
                    2 if self.xlen == Xlen::Rv64 => fpu::i64_to_f64(x as i64),
                    3 if self.xlen == Xlen::Rv64 => fpu::u64_to_f64(x),
                    _ => return Err(illegal),
                };
                self.write_f64_result(d.rd, r, f);
            }
            FUNCT7_FCLASS_D => match d.funct3 {
                0b001 => {
                    self.write_reg(d.rd, fpu::f64_classify(self.fpu.read_f64(d.rs1)));
                }
                0b000 if self.xlen == Xlen::Rv64 => {
                    // FMV.X.D
                    self.write_reg(d.rd, self.fpu.read_f64(d.rs1));
                }
                _ => return Err(illegal),
            },
            FUNCT7_FMV_D_X => {
                if d.funct3 != 0 || self.xlen != Xlen::Rv64 {
                    return Err(illegal);
                }
                self.fpu.write_f64(d.rd, self.read_reg(d.rs1));
                self.set_fs_dirty();
            }
            _ => return Err(illegal),
        }
        Ok(())
    }

    pub(crate) fn execute_fma(&mut self, inst: u32, d: &DecodedInst) -> Result<(), Trap> {
        if !self.fs_enabled() {
            return Err(Trap::IllegalInstruction(inst as u64));
        }
        let illegal = Trap::IllegalInstruction(inst as u64);
        self.fpu.effective_rm(d.funct3).ok_or(illegal)?;
        let fmt = (inst >> 25) & 0x3;
        // neg_product negates a*b, neg_c negates the addend:
        //   FMADD  = a*b + c      FMSUB  = a*b - c
        //   FNMSUB = -(a*b) + c   FNMADD = -(a*b) - c
        let (neg_product, neg_c) = match d.opcode {
            OP_MADD => (false, false),
            OP_MSUB => (false, true),
            OP_NMSUB => (true, false),
            OP_NMADD => (true, true),
            _ => return Err(illegal),
        };
        match fmt {
            FMT_S => {
                let (r, f) = fpu::f32_muladd(
                    self.fpu.read_f32(d.rs1),
                    self.fpu.read_f32(d.rs2),
                    self.fpu.read_f32(d.rs3),
                    neg_product,
                    neg_c,
                );
                self.write_f32_result(d.rd, r, f);
            }
            FMT_D => {
                let (r, f) = fpu::f64_muladd(
                    self.fpu.read_f64(d.rs1),
                    self.fpu.read_f64(d.rs2),
                    self.fpu.read_f64(d.rs3),
                    neg_product,
                    neg_c,
                );
                self.write_f64_result(d.rd, r, f);
            }
            _ => return Err(illegal),
        }
        Ok(())
    }

    fn check_rm(&self, funct3: u32, inst: u32) -> Result<RoundingMode, Trap> {
        self.fpu.effective_rm(funct3).ok_or(Trap::IllegalInstruction(inst as u64))
    }

    fn write_f32_result(&mut self, rd: u32, bits: u32, flags: fpu::FFlags) {
        self.fpu.fflags.merge(flags);
        self.fpu.write_f32(rd, bits);
        self.set_fs_dirty();
    }

    fn write_f64_result(&mut self, rd: u32, bits: u64, flags: fpu::FFlags) {
        self.fpu.fflags.merge(flags);
        self.fpu.write_f64(rd, bits);
        self.set_fs_dirty();
    }
}
