//! x86_64 (System V) backend
//!
//! Guest registers are held in the callee-saved set {rbx, rbp, r12..r14};
//! r15 is pinned to the hart pointer. rax/rcx/rdx/rsi/rdi are scratch and
//! double as the helper-call argument registers, so no guest state needs
//! saving around an out-of-line call.

use super::{AluOp, Backend, CodeBuf, Cond, PatchSite};
use crate::cpu::{Xlen, HART_KICK_PTR_OFFSET, HART_PC_OFFSET, HART_REGS_OFFSET};

pub struct X64Backend;

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R15: u8 = 15;

#[inline(always)]
fn rex(w: bool, reg: u8, rm: u8) -> u8 {
    0x40 | ((w as u8) << 3) | (((reg >> 3) & 1) << 2) | ((rm >> 3) & 1)
}

#[inline(always)]
fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

fn mov_rr(buf: &mut CodeBuf, dst: u8, src: u8) {
    buf.emit_u8(rex(true, src, dst));
    buf.emit_u8(0x89);
    buf.emit_u8(modrm(0b11, src, dst));
}

/// mov dst, [base + disp32]; base must not be rsp/r12-encoded.
fn mov_load(buf: &mut CodeBuf, dst: u8, base: u8, disp: i32) {
    debug_assert!(base & 7 != 4);
    buf.emit_u8(rex(true, dst, base));
    buf.emit_u8(0x8B);
    buf.emit_u8(modrm(0b10, dst, base));
    buf.emit_u32(disp as u32);
}

fn mov_store(buf: &mut CodeBuf, base: u8, disp: i32, src: u8) {
    debug_assert!(base & 7 != 4);
    buf.emit_u8(rex(true, src, base));
    buf.emit_u8(0x89);
    buf.emit_u8(modrm(0b10, src, base));
    buf.emit_u32(disp as u32);
}

fn mov_imm64(buf: &mut CodeBuf, dst: u8, imm: u64) {
    buf.emit_u8(rex(true, 0, dst));
    buf.emit_u8(0xB8 | (dst & 7));
    buf.emit_u64(imm);
}

/// Two-operand ALU in the `op r/m, reg` form.
fn alu_rr(buf: &mut CodeBuf, opcode: u8, w: bool, dst: u8, src: u8) {
    buf.emit_u8(rex(w, src, dst));
    buf.emit_u8(opcode);
    buf.emit_u8(modrm(0b11, src, dst));
}

fn alu_ri(buf: &mut CodeBuf, group: u8, w: bool, dst: u8, imm: i32) {
    buf.emit_u8(rex(w, 0, dst));
    buf.emit_u8(0x81);
    buf.emit_u8(modrm(0b11, group, dst));
    buf.emit_u32(imm as u32);
}

fn shift_cl(buf: &mut CodeBuf, group: u8, w: bool, dst: u8) {
    buf.emit_u8(rex(w, 0, dst));
    buf.emit_u8(0xD3);
    buf.emit_u8(modrm(0b11, group, dst));
}

fn shift_imm(buf: &mut CodeBuf, group: u8, w: bool, dst: u8, imm: u8) {
    buf.emit_u8(rex(w, 0, dst));
    buf.emit_u8(0xC1);
    buf.emit_u8(modrm(0b11, group, dst));
    buf.emit_u8(imm);
}

/// movsxd dst, dst32: re-establish the W-op sign extension.
fn sext32(buf: &mut CodeBuf, dst: u8) {
    buf.emit_u8(rex(true, dst, dst));
    buf.emit_u8(0x63);
    buf.emit_u8(modrm(0b11, dst, dst));
}

fn setcc(buf: &mut CodeBuf, cc: u8, dst: u8) {
    // setcc dst8; low-byte access to rbx/rbp/r12.. needs a REX prefix.
    buf.emit_u8(rex(false, 0, dst));
    buf.emit_u8(0x0F);
    buf.emit_u8(0x90 | cc);
    buf.emit_u8(modrm(0b11, 0, dst));
    // movzx dst, dst8
    buf.emit_u8(rex(true, dst, dst));
    buf.emit_u8(0x0F);
    buf.emit_u8(0xB6);
    buf.emit_u8(modrm(0b11, dst, dst));
}

fn cmp_rr(buf: &mut CodeBuf, lhs: u8, rhs: u8) {
    alu_rr(buf, 0x39, true, lhs, rhs);
}

fn call_absolute(buf: &mut CodeBuf, target: usize) {
    mov_imm64(buf, RAX, target as u64);
    buf.emit_u8(0xFF);
    buf.emit_u8(modrm(0b11, 2, RAX));
}

fn test_rax(buf: &mut CodeBuf) {
    buf.emit_u8(0x48);
    buf.emit_u8(0x85);
    buf.emit_u8(0xC0);
}

/// jcc rel32 with a zero placeholder; returns the rel32 field offset.
fn jcc(buf: &mut CodeBuf, cc: u8) -> PatchSite {
    buf.emit_u8(0x0F);
    buf.emit_u8(0x80 | cc);
    let site = buf.len();
    buf.emit_u32(0);
    PatchSite(site)
}

fn cond_cc(cond: Cond) -> u8 {
    match cond {
        Cond::Eq => 0x4,
        Cond::Ne => 0x5,
        Cond::Ltu => 0x2,
        Cond::Geu => 0x3,
        Cond::Lt => 0xC,
        Cond::Ge => 0xD,
    }
}

fn push(buf: &mut CodeBuf, reg: u8) {
    if reg >= 8 {
        buf.emit_u8(0x41);
    }
    buf.emit_u8(0x50 | (reg & 7));
}

fn pop(buf: &mut CodeBuf, reg: u8) {
    if reg >= 8 {
        buf.emit_u8(0x41);
    }
    buf.emit_u8(0x58 | (reg & 7));
}

fn saved_regs(used_mask: u32) -> Vec<u8> {
    let mut regs = vec![R15];
    for r in 0..16u8 {
        if used_mask & (1 << r) != 0 && r != R15 {
            regs.push(r);
        }
    }
    regs
}

impl Backend for X64Backend {
    const NAME: &'static str = "x86_64";
    const REG_POOL: u32 = (1 << 3) | (1 << 5) | (1 << 12) | (1 << 13) | (1 << 14);
    const HART_REG: u8 = R15;
    const RET0: u8 = RAX;
    const RET1: u8 = RDX;
    const NATIVE_LINKER: bool = true;

    fn prologue(buf: &mut CodeBuf, used_mask: u32) {
        let regs = saved_regs(used_mask);
        for &r in &regs {
            push(buf, r);
        }
        if regs.len() % 2 == 0 {
            // Keep rsp 16-aligned at helper call sites.
            buf.emit_bytes(&[0x48, 0x83, 0xEC, 0x08]); // sub rsp, 8
        }
        mov_rr(buf, R15, RDI);
    }

    fn restores(buf: &mut CodeBuf, used_mask: u32) {
        let regs = saved_regs(used_mask);
        if regs.len() % 2 == 0 {
            buf.emit_bytes(&[0x48, 0x83, 0xC4, 0x08]); // add rsp, 8
        }
        for &r in regs.iter().rev() {
            pop(buf, r);
        }
    }

    fn ret(buf: &mut CodeBuf) {
        buf.emit_u8(0xC3);
    }

    fn kick_check(buf: &mut CodeBuf) -> PatchSite {
        mov_load(buf, RAX, R15, HART_KICK_PTR_OFFSET as i32);
        // mov eax, [rax]
        buf.emit_u8(0x8B);
        buf.emit_u8(modrm(0b00, RAX, RAX));
        // test eax, eax
        buf.emit_u8(0x85);
        buf.emit_u8(0xC0);
        jcc(buf, 0x5) // jnz
    }

    fn load_greg(buf: &mut CodeBuf, hreg: u8, greg: u8) {
        mov_load(buf, hreg, R15, (HART_REGS_OFFSET + 8 * greg as usize) as i32);
    }

    fn store_greg(buf: &mut CodeBuf, hreg: u8, greg: u8) {
        mov_store(buf, R15, (HART_REGS_OFFSET + 8 * greg as usize) as i32, hreg);
    }

    fn li(buf: &mut CodeBuf, hreg: u8, imm: i64) {
        if imm as i32 as i64 == imm {
            buf.emit_u8(rex(true, 0, hreg));
            buf.emit_u8(0xC7);
            buf.emit_u8(modrm(0b11, 0, hreg));
            buf.emit_u32(imm as u32);
        } else {
            mov_imm64(buf, hreg, imm as u64);
        }
    }

    fn mov(buf: &mut CodeBuf, dst: u8, src: u8) {
        if dst != src {
            mov_rr(buf, dst, src);
        }
    }

    fn alu(buf: &mut CodeBuf, op: AluOp, word: bool, dst: u8, lhs: u8, rhs: u8) {
        let w = !word;
        match op {
            AluOp::Add | AluOp::Sub | AluOp::And | AluOp::Or | AluOp::Xor => {
                let opcode = match op {
                    AluOp::Add => 0x01,
                    AluOp::Sub => 0x29,
                    AluOp::And => 0x21,
                    AluOp::Or => 0x09,
                    _ => 0x31,
                };
                if dst == lhs {
                    alu_rr(buf, opcode, w, dst, rhs);
                } else if dst == rhs {
                    if op == AluOp::Sub {
                        // dst = lhs - dst
                        mov_rr(buf, RAX, rhs);
                        mov_rr(buf, dst, lhs);
                        alu_rr(buf, opcode, w, dst, RAX);
                    } else {
                        alu_rr(buf, opcode, w, dst, lhs);
                    }
                } else {
                    mov_rr(buf, dst, lhs);
                    alu_rr(buf, opcode, w, dst, rhs);
                }
                if word {
                    sext32(buf, dst);
                }
            }
            AluOp::Sll | AluOp::Srl | AluOp::Sra => {
                let group = match op {
                    AluOp::Sll => 4,
                    AluOp::Srl => 5,
                    _ => 7,
                };
                // Shift amount must sit in cl; x86 masks it to 63/31,
                // matching the RISC-V shamt rules for each width.
                mov_rr(buf, RCX, rhs);
                if dst != lhs {
                    mov_rr(buf, dst, lhs);
                }
                shift_cl(buf, group, w, dst);
                if word {
                    sext32(buf, dst);
                }
            }
            AluOp::Slt => {
                cmp_rr(buf, lhs, rhs);
                setcc(buf, 0xC, dst);
            }
            AluOp::Sltu => {
                cmp_rr(buf, lhs, rhs);
                setcc(buf, 0x2, dst);
            }
            AluOp::Mul => {
                let (a, b) = if dst == rhs { (rhs, lhs) } else { (lhs, rhs) };
                if dst != a {
                    mov_rr(buf, dst, a);
                }
                // imul dst, b
                buf.emit_u8(rex(w, dst, b));
                buf.emit_u8(0x0F);
                buf.emit_u8(0xAF);
                buf.emit_u8(modrm(0b11, dst, b));
                if word {
                    sext32(buf, dst);
                }
            }
        }
    }

    fn alu_imm(buf: &mut CodeBuf, op: AluOp, word: bool, dst: u8, lhs: u8, imm: i32) {
        let w = !word;
        match op {
            AluOp::Add | AluOp::And | AluOp::Or | AluOp::Xor => {
                let group = match op {
                    AluOp::Add => 0,
                    AluOp::Or => 1,
                    AluOp::And => 4,
                    _ => 6,
                };
                if dst != lhs {
                    mov_rr(buf, dst, lhs);
                }
                alu_ri(buf, group, w, dst, imm);
                if word {
                    sext32(buf, dst);
                }
            }
            AluOp::Sll | AluOp::Srl | AluOp::Sra => {
                let group = match op {
                    AluOp::Sll => 4,
                    AluOp::Srl => 5,
                    _ => 7,
                };
                if dst != lhs {
                    mov_rr(buf, dst, lhs);
                }
                shift_imm(buf, group, w, dst, imm as u8);
                if word {
                    sext32(buf, dst);
                }
            }
            AluOp::Slt => {
                alu_ri(buf, 7, true, lhs, imm); // cmp lhs, imm
                setcc(buf, 0xC, dst);
            }
            AluOp::Sltu => {
                alu_ri(buf, 7, true, lhs, imm);
                setcc(buf, 0x2, dst);
            }
            AluOp::Sub | AluOp::Mul => unreachable!("no immediate form"),
        }
    }

    fn store_pc_imm(buf: &mut CodeBuf, pc: u64) {
        mov_imm64(buf, RAX, pc);
        mov_store(buf, R15, HART_PC_OFFSET as i32, RAX);
    }

    fn store_pc_reg(buf: &mut CodeBuf, src: u8) {
        mov_store(buf, R15, HART_PC_OFFSET as i32, src);
    }

    fn call_alu_m(buf: &mut CodeBuf, helper: usize, a: u8, b: u8, ctl: u64) {
        mov_rr(buf, RDI, a);
        mov_rr(buf, RSI, b);
        mov_imm64(buf, RDX, ctl);
        call_absolute(buf, helper);
    }

    fn call_load(buf: &mut CodeBuf, helper: usize, base: u8, offset: i32, ctl: u64) -> PatchSite {
        mov_rr(buf, RSI, base);
        if offset != 0 {
            alu_ri(buf, 0, true, RSI, offset);
        }
        mov_rr(buf, RDI, R15);
        mov_imm64(buf, RDX, ctl);
        call_absolute(buf, helper);
        test_rax(buf);
        jcc(buf, 0x5)
    }

    fn call_store(
        buf: &mut CodeBuf,
        helper: usize,
        base: u8,
        offset: i32,
        value: u8,
        ctl: u64,
    ) -> PatchSite {
        mov_rr(buf, RSI, base);
        if offset != 0 {
            alu_ri(buf, 0, true, RSI, offset);
        }
        mov_rr(buf, RDX, value);
        mov_rr(buf, RDI, R15);
        mov_imm64(buf, RCX, ctl);
        call_absolute(buf, helper);
        test_rax(buf);
        jcc(buf, 0x5)
    }

    fn jalr_target(buf: &mut CodeBuf, dst: u8, rs1: u8, imm: i32, xlen: Xlen) {
        mov_rr(buf, dst, rs1);
        if imm != 0 {
            alu_ri(buf, 0, true, dst, imm);
        }
        // and dst, -2
        buf.emit_u8(rex(true, 0, dst));
        buf.emit_u8(0x83);
        buf.emit_u8(modrm(0b11, 4, dst));
        buf.emit_u8(0xFE);
        if xlen == Xlen::Rv32 {
            sext32(buf, dst);
        }
    }

    fn cmp_branch(buf: &mut CodeBuf, cond: Cond, lhs: u8, rhs: u8) -> PatchSite {
        cmp_rr(buf, lhs, rhs);
        jcc(buf, cond_cc(cond))
    }

    fn jmp(buf: &mut CodeBuf) -> PatchSite {
        buf.emit_u8(0xE9);
        let site = buf.len();
        buf.emit_u32(0); // rel 0: falls through
        PatchSite(site)
    }

    fn patch_local(buf: &mut CodeBuf, site: PatchSite, target: usize) {
        let rel = target as i64 - (site.0 as i64 + 4);
        buf.patch_u32(site.0, rel as i32 as u32);
    }

    unsafe fn patch_jump(site: *mut u8, target: *const u8) {
        let rel = target as i64 - (site as i64 + 4);
        debug_assert!(rel >= i32::MIN as i64 && rel <= i32::MAX as i64);
        (site as *mut i32).write_unaligned(rel as i32);
    }

    fn flush_icache(_ptr: *const u8, _len: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_and_li_encodings() {
        let mut buf = CodeBuf::new();
        mov_rr(&mut buf, 3, 15); // mov rbx, r15
        assert_eq!(buf.as_slice(), &[0x4C, 0x89, 0xFB]);

        let mut buf = CodeBuf::new();
        X64Backend::li(&mut buf, 3, 1); // mov rbx, 1 (imm32 form)
        assert_eq!(buf.as_slice(), &[0x48, 0xC7, 0xC3, 0x01, 0x00, 0x00, 0x00]);

        let mut buf = CodeBuf::new();
        X64Backend::li(&mut buf, 12, 0x1122_3344_5566_7788);
        assert_eq!(buf.as_slice()[0], 0x49); // REX.W+B
        assert_eq!(buf.as_slice()[1], 0xB8 | 4); // movabs r12
    }

    #[test]
    fn greg_traffic_uses_hart_base() {
        let mut buf = CodeBuf::new();
        X64Backend::load_greg(&mut buf, 3, 10); // mov rbx, [r15 + 80]
        assert_eq!(buf.as_slice(), &[0x49, 0x8B, 0x9F, 0x50, 0x00, 0x00, 0x00]);
        let mut buf = CodeBuf::new();
        X64Backend::store_greg(&mut buf, 3, 10);
        assert_eq!(buf.as_slice(), &[0x49, 0x89, 0x9F, 0x50, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn add_rr_and_word_form() {
        let mut buf = CodeBuf::new();
        X64Backend::alu(&mut buf, AluOp::Add, false, 3, 3, 5); // add rbx, rbp
        assert_eq!(buf.as_slice(), &[0x48, 0x01, 0xEB]);

        let mut buf = CodeBuf::new();
        // addw: 32-bit add then movsxd
        X64Backend::alu(&mut buf, AluOp::Add, true, 3, 3, 5);
        assert_eq!(buf.as_slice(), &[0x40, 0x01, 0xEB, 0x48, 0x63, 0xDB]);
    }

    #[test]
    fn local_patching() {
        let mut buf = CodeBuf::new();
        let site = X64Backend::jmp(&mut buf);
        X64Backend::ret(&mut buf);
        let target = buf.len();
        X64Backend::patch_local(&mut buf, site, target);
        // rel = target - (site + 4) = 5 - 5 = ... jmp at 0, rel field at 1,
        // ret at 5, target 6 -> rel 1.
        assert_eq!(buf.read_u32(site.0), 1);
    }

    #[test]
    fn prologue_alignment_parity() {
        // Odd saved-register count: no pad.
        let mut buf = CodeBuf::new();
        X64Backend::prologue(&mut buf, 0); // saves r15 only
        assert!(!buf.as_slice().windows(4).any(|w| w == [0x48, 0x83, 0xEC, 0x08]));
        // Even count: pad present.
        let mut buf = CodeBuf::new();
        X64Backend::prologue(&mut buf, 1 << 3); // r15 + rbx
        assert!(buf.as_slice().windows(4).any(|w| w == [0x48, 0x83, 0xEC, 0x08]));
    }
}
