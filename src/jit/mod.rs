//! Tracing JIT: frontend, helpers and dispatch
//!
//! The tracer walks straight-line guest code from the current PC, driving
//! the register allocator and the native backend. Loads, stores and the
//! non-trivial M-extension ops go through out-of-line helpers; a helper
//! that faults records the trap on the hart, rewinds the PC to the
//! faulting instruction and makes the block bail out through a shared
//! epilogue. Blocks terminate on any control transfer, page crossing,
//! size cap or unsupported instruction.
//!
//! The heap lock doubles as the flush barrier: dispatch holds it shared
//! for the duration of one block, compile and flush take it exclusively
//! after kicking every hart out of emitted code.

pub mod backend;
mod heap;
mod regalloc;

use std::marker::PhantomData;
use std::sync::RwLock;

use backend::{AluOp, Backend, CodeBuf, Cond, NativeBackend, PatchSite, HAVE_BACKEND};
use heap::{BuiltBlock, CodeHeap};
use regalloc::RegAlloc;

use crate::cpu::decode::*;
use crate::cpu::{execute_c_expand, Hart, Xlen};
use crate::machine::{Machine, MachineConfig};
use crate::memory::{PAGE_MASK, PAGE_SHIFT};

/// Machine-scoped JIT state: the code heap behind its reader/writer lock.
/// Absent when the JIT is disabled by config or unsupported on this host.
pub struct JitEngine {
    heap: Option<RwLock<CodeHeap>>,
}

impl JitEngine {
    pub fn new(config: &MachineConfig) -> Result<Self, String> {
        if !config.jit || !HAVE_BACKEND {
            if config.jit {
                log::debug!("JIT unavailable on this host, falling back to interpreter");
            }
            return Ok(JitEngine { heap: None });
        }
        let heap = CodeHeap::new(config.jit_heap_size)?;
        log::debug!(
            "JIT enabled: {} backend, {} MiB heap",
            NativeBackend::NAME,
            config.jit_heap_size >> 20
        );
        Ok(JitEngine { heap: Some(RwLock::new(heap)) })
    }

    #[inline(always)]
    pub fn enabled(&self) -> bool {
        self.heap.is_some()
    }

    /// Number of whole-heap flushes so far (test and diagnostics hook).
    pub fn flush_count(&self) -> u64 {
        self.heap.as_ref().map(|h| h.read().unwrap().flushes).unwrap_or(0)
    }
}

// ----------------------------------------------------------------------
// Dispatch
// ----------------------------------------------------------------------

fn ram_page(machine: &Machine, phys: u64) -> Option<usize> {
    machine.mem.ram().offset_of(phys, 1).map(|off| off >> PAGE_SHIFT)
}

/// Enter the compiled block for `phys_pc` if one exists and its page is
/// clean. Returns false on cache miss (the caller interprets or compiles).
pub(crate) fn lookup_and_enter(hart: &mut Hart, machine: &Machine, phys_pc: u64) -> bool {
    let Some(lock) = machine.jit.heap.as_ref() else { return false };
    let heap = lock.read().unwrap();

    // Re-arm the entry poll, then yield to any queued compile/flush. The
    // order matters: a writer announcing itself after the check is
    // guaranteed to kick after this clear, so linked chains still bail.
    hart.clear_kick();
    if machine.jit_writer_waiting() {
        return false;
    }
    // An interrupt that raced the loop-top check would have its kick
    // swallowed by the clear above; give it back to the hart loop.
    hart.sync_pending_interrupts();
    if crate::cpu::trap::check_pending(hart).is_some() {
        return false;
    }

    let Some((entry, info)) = heap.lookup(phys_pc, hart.pc, hart.xlen) else { return false };

    match ram_page(machine, phys_pc) {
        Some(page) if machine.mem.dirty().is_dirty(page) => {
            // Stale translation somewhere on this page: dump everything
            // and let the caller retranslate.
            drop(heap);
            flush_heap(machine, "dirty page hit");
            return false;
        }
        _ => {}
    }

    let f: unsafe extern "C" fn(*mut Hart) = unsafe { std::mem::transmute(entry) };
    unsafe { f(hart as *mut Hart) };
    drop(heap);

    // Block instruction counts are credited wholesale; an early bail
    // (kick or fault) overcounts slightly, which the counters tolerate.
    hart.instret += info.insts as u64;
    hart.csr.instret = hart.instret;
    hart.csr.cycle = hart.csr.cycle.wrapping_add(info.insts as u64);

    if let Some(trap) = hart.jit_trap.take() {
        hart.handle_trap(trap);
    }
    true
}

/// Compile the block starting at `phys_pc`, install it and run it. Falls
/// back to interpreting a single instruction when the PC is not
/// JIT-able (MMIO, unsupported leading instruction, install failure).
pub(crate) fn compile_and_enter(hart: &mut Hart, machine: &Machine, phys_pc: u64) {
    let compiled = try_compile(hart, machine, phys_pc);
    if !compiled || !lookup_and_enter(hart, machine, phys_pc) {
        if let Err(trap) = hart.step_interpret(machine) {
            hart.handle_trap(trap);
        }
    }
}

fn try_compile(hart: &mut Hart, machine: &Machine, phys_pc: u64) -> bool {
    let Some(lock) = machine.jit.heap.as_ref() else { return false };
    // Only RAM-backed code is translated.
    let Some(page) = ram_page(machine, phys_pc) else { return false };

    machine.jit_writer_begin();
    let outcome = try_compile_locked(hart, machine, phys_pc, page, lock);
    machine.jit_writer_end();
    outcome
}

fn try_compile_locked(
    hart: &mut Hart,
    machine: &Machine,
    phys_pc: u64,
    page: usize,
    lock: &RwLock<CodeHeap>,
) -> bool {
    let mut heap = lock.write().unwrap();
    if heap.lookup(phys_pc, hart.pc, hart.xlen).is_some() {
        // Another hart won the race.
        return true;
    }

    // Translation only starts from a clean page. A dirty page may hold
    // stale blocks elsewhere on it, and the whole-heap flush is the only
    // thing that removes them; the bit must not be cleared before that.
    if machine.mem.dirty().is_dirty(page) {
        heap.flush();
        machine.mem.dirty().clear_all();
        machine.bump_epoch();
        log::debug!("code heap flush #{} (compile on dirty page)", heap.flushes);
    }

    let Some(built) = build_block::<NativeBackend>(hart, machine, phys_pc) else {
        return false;
    };

    heap.make_writable();
    let mut installed = heap.install::<NativeBackend>(&built);
    if installed.is_none() {
        // Heap exhausted mid-emission: flush and retry once.
        log::debug!("code heap full ({} bytes), flushing", heap.used());
        heap.flush();
        machine.mem.dirty().clear_all();
        machine.bump_epoch();
        installed = heap.install::<NativeBackend>(&built);
    }
    heap.make_executable();

    match installed {
        Some(_) => {
            log::trace!(
                "hart{}: compiled block pc={:#x} ({} insts, {} bytes)",
                hart.id,
                phys_pc,
                built.insts,
                built.code.len()
            );
            true
        }
        None => {
            log::warn!("block at {:#x} larger than the code heap, interpreting", phys_pc);
            false
        }
    }
}

/// Whole-heap invalidation: kick every hart to its safe point, reset the
/// arena and maps, clear the dirty map and advance the machine epoch.
pub(crate) fn flush_heap(machine: &Machine, reason: &str) {
    let Some(lock) = machine.jit.heap.as_ref() else { return };
    machine.jit_writer_begin();
    {
        let mut heap = lock.write().unwrap();
        heap.flush();
        machine.mem.dirty().clear_all();
        let epoch = machine.bump_epoch();
        log::debug!("code heap flush #{} ({}), epoch {}", heap.flushes, reason, epoch);
    }
    machine.jit_writer_end();
}

// ----------------------------------------------------------------------
// Out-of-line helpers called from emitted code
// ----------------------------------------------------------------------

/// Two-register return of the load helper; `status` nonzero means a trap
/// was recorded on the hart.
#[repr(C)]
pub(crate) struct MemResult {
    pub status: usize,
    pub value: u64,
}

const CTL_SIGNED: u64 = 4;

fn ctl_mem(width: usize, signed: bool, pc_off: u64) -> u64 {
    (width.trailing_zeros() as u64) | ((signed as u64) << 2) | (pc_off << 3)
}

// The returned lifetime is detached from the hart borrow on purpose: the
// helper needs the machine and `&mut Hart` simultaneously, and the Arc in
// the hart keeps the machine alive for the whole call.
unsafe fn machine_of<'a>(hart: &Hart) -> &'a Machine {
    &*std::sync::Arc::as_ptr(&hart.machine)
}

fn record_fault(hart: &mut Hart, trap: crate::cpu::Trap, pc_off: u64) {
    hart.pc = hart.pc.wrapping_add(pc_off);
    hart.normalize_pc();
    hart.jit_trap = Some(trap);
}

pub(crate) unsafe extern "C" fn helper_load(hart: *mut Hart, vaddr: u64, ctl: u64) -> MemResult {
    let hart = &mut *hart;
    let machine = machine_of(hart);
    let width = 1usize << (ctl & 3);
    match hart.load_virt(machine, vaddr, width) {
        Ok(v) => {
            let value = if ctl & CTL_SIGNED != 0 {
                match width {
                    1 => v as i8 as i64 as u64,
                    2 => v as i16 as i64 as u64,
                    4 => v as i32 as i64 as u64,
                    _ => v,
                }
            } else {
                v
            };
            MemResult { status: 0, value }
        }
        Err(trap) => {
            record_fault(hart, trap, ctl >> 3);
            MemResult { status: 1, value: 0 }
        }
    }
}

pub(crate) unsafe extern "C" fn helper_store(
    hart: *mut Hart,
    vaddr: u64,
    value: u64,
    ctl: u64,
) -> usize {
    let hart = &mut *hart;
    let machine = machine_of(hart);
    let width = 1usize << (ctl & 3);
    match hart.store_virt(machine, vaddr, width, value) {
        Ok(()) => 0,
        Err(trap) => {
            record_fault(hart, trap, ctl >> 3);
            1
        }
    }
}

const CTL_WORD: u64 = 8;

pub(crate) extern "C" fn helper_alu_m(a: u64, b: u64, ctl: u64) -> u64 {
    let funct3 = (ctl & 7) as u32;
    if ctl & CTL_WORD != 0 {
        crate::cpu::alu32_m(funct3, a as u32, b as u32).unwrap_or(0) as i32 as i64 as u64
    } else {
        crate::cpu::alu64_m(funct3, a, b).unwrap_or(0)
    }
}

// ----------------------------------------------------------------------
// Frontend: the tracer
// ----------------------------------------------------------------------

enum Step {
    Continue,
    Done,
    Unsupported,
}

/// How a finished block transfers control, driving what the finalizer
/// registers with the linker: `Tail` has two patchable exits (branch),
/// `Jmp` one (direct jump), `None` wrote the next PC to memory and only
/// returns to the dispatcher.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Linkage {
    None,
    Tail,
    Jmp,
}

struct BlockBuilder<B: Backend> {
    buf: CodeBuf,
    regs: RegAlloc,
    virt_pc: u64,
    phys_pc: u64,
    pc_off: u64,
    xlen: Xlen,
    insts: u32,
    links: Vec<(u64, usize)>,
    bail_sites: Vec<PatchSite>,
    linkage: Option<Linkage>,
    _backend: PhantomData<B>,
}

fn build_block<B: Backend>(hart: &Hart, machine: &Machine, phys_pc: u64) -> Option<BuiltBlock> {
    let max_insts = machine.config().jit_max_block as u32;
    let mut b = BlockBuilder::<B>::new(hart.pc, phys_pc, hart.xlen);

    loop {
        let phys = phys_pc + b.pc_off;
        // Blocks never cross a guest physical page.
        if phys >> PAGE_SHIFT != phys_pc >> PAGE_SHIFT {
            b.end_none();
            break;
        }
        let low = match machine.mem.phys_read(phys, 2) {
            Ok(v) => v as u16,
            Err(_) => {
                b.end_none();
                break;
            }
        };
        let (inst, len) = if DecodedInst::is_compressed(low) {
            match execute_c_expand(low, b.xlen) {
                Some(e) => (e, 2),
                None => {
                    // Reserved encoding: leave it to the interpreter.
                    b.end_none();
                    break;
                }
            }
        } else {
            if phys & PAGE_MASK == PAGE_MASK - 1 {
                b.end_none();
                break;
            }
            match machine.mem.phys_read(phys + 2, 2) {
                Ok(high) => (((high as u32) << 16) | low as u32, 4),
                Err(_) => {
                    b.end_none();
                    break;
                }
            }
        };

        match b.emit_inst(inst, len) {
            Step::Continue => {
                if b.insts >= max_insts {
                    b.end_none();
                    break;
                }
            }
            Step::Done => break,
            Step::Unsupported => {
                b.end_none();
                break;
            }
        }
    }

    if b.insts == 0 {
        return None;
    }
    Some(b.assemble())
}

impl<B: Backend> BlockBuilder<B> {
    fn new(virt_pc: u64, phys_pc: u64, xlen: Xlen) -> Self {
        let mut buf = CodeBuf::new();
        let mut bail_sites = Vec::new();
        // Entry poll: interrupts, flush requests and cross-hart messages
        // break directly-linked chains here.
        bail_sites.push(B::kick_check(&mut buf));
        BlockBuilder {
            buf,
            regs: RegAlloc::new(B::REG_POOL),
            virt_pc,
            phys_pc,
            pc_off: 0,
            xlen,
            insts: 0,
            links: Vec::new(),
            bail_sites,
            linkage: None,
            _backend: PhantomData,
        }
    }

    fn wrap(&self, addr: u64) -> u64 {
        match self.xlen {
            Xlen::Rv32 => addr as u32 as i32 as i64 as u64,
            Xlen::Rv64 => addr,
        }
    }

    fn cur_virt(&self) -> u64 {
        self.wrap(self.virt_pc.wrapping_add(self.pc_off))
    }

    fn word_for(&self, op: AluOp) -> bool {
        self.xlen == Xlen::Rv32
            && matches!(op, AluOp::Add | AluOp::Sub | AluOp::Sll | AluOp::Srl | AluOp::Sra | AluOp::Mul)
    }

    fn emit_inst(&mut self, inst: u32, len: u64) -> Step {
        let d = DecodedInst::decode(inst);
        self.regs.begin_inst();
        let step = match d.opcode {
            OP_LUI => {
                if d.rd != 0 {
                    let value = DecodedInst::imm_u(inst) as i64 as u64;
                    let wrapped = self.wrap(value);
                    let rd = self.regs.map_write::<B>(&mut self.buf, d.rd);
                    B::li(&mut self.buf, rd, wrapped as i64);
                    self.regs.set_auipc(d.rd, wrapped);
                }
                Step::Continue
            }
            OP_AUIPC => {
                if d.rd != 0 {
                    let value =
                        self.wrap(self.cur_virt().wrapping_add(DecodedInst::imm_u(inst) as i64 as u64));
                    let rd = self.regs.map_write::<B>(&mut self.buf, d.rd);
                    B::li(&mut self.buf, rd, value as i64);
                    self.regs.set_auipc(d.rd, value);
                }
                Step::Continue
            }
            OP_OP_IMM => self.emit_op_imm(inst, &d),
            OP_OP_IMM_32 if self.xlen == Xlen::Rv64 => self.emit_op_imm32(inst, &d),
            OP_OP => self.emit_op(inst, &d),
            OP_OP_32 if self.xlen == Xlen::Rv64 => self.emit_op32(inst, &d),
            OP_LOAD => self.emit_load(inst, &d),
            OP_STORE => self.emit_store(inst, &d),
            OP_BRANCH => return self.emit_branch(inst, &d, len),
            OP_JAL => return self.emit_jal(inst, &d, len),
            OP_JALR if d.funct3 == 0 => return self.emit_jalr(inst, &d, len),
            _ => Step::Unsupported,
        };
        if let Step::Continue = step {
            self.pc_off += len;
            self.insts += 1;
        }
        step
    }

    fn emit_op_imm(&mut self, inst: u32, d: &DecodedInst) -> Step {
        let imm = DecodedInst::imm_i(inst);
        if d.rd == 0 {
            return Step::Continue;
        }
        // Fold addi on a register holding a known constant (auipc/lui/li
        // chains) into a fresh constant load.
        if d.funct3 == FUNCT3_ADD_SUB {
            if let Some(base) = self.regs.auipc_of(d.rs1) {
                let value = self.wrap(base.wrapping_add(imm as i64 as u64));
                let rd = self.regs.map_write::<B>(&mut self.buf, d.rd);
                B::li(&mut self.buf, rd, value as i64);
                self.regs.set_auipc(d.rd, value);
                return Step::Continue;
            }
        }

        let shamt_bits = if self.xlen == Xlen::Rv32 { 5 } else { 6 };
        let shamt = imm & ((1 << shamt_bits) - 1);
        let upper = (imm >> 6) & 0x3F;
        let op = match d.funct3 {
            FUNCT3_ADD_SUB => AluOp::Add,
            FUNCT3_SLT => AluOp::Slt,
            FUNCT3_SLTU => AluOp::Sltu,
            FUNCT3_XOR => AluOp::Xor,
            FUNCT3_OR => AluOp::Or,
            FUNCT3_AND => AluOp::And,
            FUNCT3_SLL if upper == 0 && (self.xlen == Xlen::Rv64 || imm & 0x20 == 0) => AluOp::Sll,
            FUNCT3_SRL_SRA if upper == 0 && (self.xlen == Xlen::Rv64 || imm & 0x20 == 0) => {
                AluOp::Srl
            }
            FUNCT3_SRL_SRA
                if upper == 0b010000 && (self.xlen == Xlen::Rv64 || imm & 0x20 == 0) =>
            {
                AluOp::Sra
            }
            _ => return Step::Unsupported,
        };
        let imm = if matches!(op, AluOp::Sll | AluOp::Srl | AluOp::Sra) { shamt } else { imm };
        let word = self.word_for(op);
        let rs1 = self.regs.map_read::<B>(&mut self.buf, d.rs1);
        let rd = self.regs.map_write::<B>(&mut self.buf, d.rd);
        B::alu_imm(&mut self.buf, op, word, rd, rs1, imm);
        Step::Continue
    }

    fn emit_op_imm32(&mut self, inst: u32, d: &DecodedInst) -> Step {
        let imm = DecodedInst::imm_i(inst);
        let shamt = imm & 0x1F;
        let funct7 = (inst >> 25) & 0x7F;
        let (op, imm) = match d.funct3 {
            FUNCT3_ADD_SUB => (AluOp::Add, imm),
            FUNCT3_SLL if funct7 == 0 => (AluOp::Sll, shamt),
            FUNCT3_SRL_SRA if funct7 == 0 => (AluOp::Srl, shamt),
            FUNCT3_SRL_SRA if funct7 == 0b0100000 => (AluOp::Sra, shamt),
            _ => return Step::Unsupported,
        };
        if d.rd == 0 {
            return Step::Continue;
        }
        let rs1 = self.regs.map_read::<B>(&mut self.buf, d.rs1);
        let rd = self.regs.map_write::<B>(&mut self.buf, d.rd);
        B::alu_imm(&mut self.buf, op, true, rd, rs1, imm);
        Step::Continue
    }

    fn emit_op(&mut self, inst: u32, d: &DecodedInst) -> Step {
        if d.funct7 == 0b0000001 {
            return self.emit_m(d, self.xlen == Xlen::Rv32);
        }
        let op = match (d.funct3, d.funct7) {
            (FUNCT3_ADD_SUB, 0b0000000) => AluOp::Add,
            (FUNCT3_ADD_SUB, 0b0100000) => AluOp::Sub,
            (FUNCT3_SLL, 0b0000000) => AluOp::Sll,
            (FUNCT3_SLT, 0b0000000) => AluOp::Slt,
            (FUNCT3_SLTU, 0b0000000) => AluOp::Sltu,
            (FUNCT3_XOR, 0b0000000) => AluOp::Xor,
            (FUNCT3_SRL_SRA, 0b0000000) => AluOp::Srl,
            (FUNCT3_SRL_SRA, 0b0100000) => AluOp::Sra,
            (FUNCT3_OR, 0b0000000) => AluOp::Or,
            (FUNCT3_AND, 0b0000000) => AluOp::And,
            _ => return Step::Unsupported,
        };
        let _ = inst;
        if d.rd == 0 {
            return Step::Continue;
        }
        let word = self.word_for(op);
        let rs1 = self.regs.map_read::<B>(&mut self.buf, d.rs1);
        let rs2 = self.regs.map_read::<B>(&mut self.buf, d.rs2);
        let rd = self.regs.map_write::<B>(&mut self.buf, d.rd);
        B::alu(&mut self.buf, op, word, rd, rs1, rs2);
        Step::Continue
    }

    fn emit_op32(&mut self, inst: u32, d: &DecodedInst) -> Step {
        if d.funct7 == 0b0000001 {
            return self.emit_m(d, true);
        }
        let op = match (d.funct3, d.funct7) {
            (FUNCT3_ADD_SUB, 0b0000000) => AluOp::Add,
            (FUNCT3_ADD_SUB, 0b0100000) => AluOp::Sub,
            (FUNCT3_SLL, 0b0000000) => AluOp::Sll,
            (FUNCT3_SRL_SRA, 0b0000000) => AluOp::Srl,
            (FUNCT3_SRL_SRA, 0b0100000) => AluOp::Sra,
            _ => return Step::Unsupported,
        };
        let _ = inst;
        if d.rd == 0 {
            return Step::Continue;
        }
        let rs1 = self.regs.map_read::<B>(&mut self.buf, d.rs1);
        let rs2 = self.regs.map_read::<B>(&mut self.buf, d.rs2);
        let rd = self.regs.map_write::<B>(&mut self.buf, d.rd);
        B::alu(&mut self.buf, op, true, rd, rs1, rs2);
        Step::Continue
    }

    fn emit_m(&mut self, d: &DecodedInst, word: bool) -> Step {
        if d.rd == 0 {
            return Step::Continue;
        }
        let rs1 = self.regs.map_read::<B>(&mut self.buf, d.rs1);
        let rs2 = self.regs.map_read::<B>(&mut self.buf, d.rs2);
        if d.funct3 == FUNCT3_MUL {
            let rd = self.regs.map_write::<B>(&mut self.buf, d.rd);
            B::alu(&mut self.buf, AluOp::Mul, word, rd, rs1, rs2);
        } else {
            // mulh/div/rem family: out-of-line, cannot fault.
            let ctl = d.funct3 as u64 | if word { CTL_WORD } else { 0 };
            B::call_alu_m(&mut self.buf, helper_alu_m as usize, rs1, rs2, ctl);
            let rd = self.regs.map_write::<B>(&mut self.buf, d.rd);
            B::mov(&mut self.buf, rd, B::RET0);
        }
        Step::Continue
    }

    fn emit_load(&mut self, inst: u32, d: &DecodedInst) -> Step {
        let (width, signed) = match d.funct3 {
            FUNCT3_LB => (1, true),
            FUNCT3_LH => (2, true),
            FUNCT3_LW => (4, true),
            FUNCT3_LBU => (1, false),
            FUNCT3_LHU => (2, false),
            FUNCT3_LWU if self.xlen == Xlen::Rv64 => (4, false),
            FUNCT3_LD if self.xlen == Xlen::Rv64 => (8, false),
            _ => return Step::Unsupported,
        };
        let imm = DecodedInst::imm_i(inst);
        let rs1 = self.regs.map_read::<B>(&mut self.buf, d.rs1);
        // Every mapping must be clean before a call that can fault: the
        // bail epilogue restores host state without writing back.
        self.regs.writeback_all::<B>(&mut self.buf);
        let ctl = ctl_mem(width, signed, self.pc_off);
        let site = B::call_load(&mut self.buf, helper_load as usize, rs1, imm, ctl);
        self.bail_sites.push(site);
        if d.rd != 0 {
            let rd = self.regs.map_write::<B>(&mut self.buf, d.rd);
            B::mov(&mut self.buf, rd, B::RET1);
        }
        Step::Continue
    }

    fn emit_store(&mut self, inst: u32, d: &DecodedInst) -> Step {
        let width = match d.funct3 {
            0b000 => 1,
            0b001 => 2,
            0b010 => 4,
            0b011 if self.xlen == Xlen::Rv64 => 8,
            _ => return Step::Unsupported,
        };
        let imm = DecodedInst::imm_s(inst);
        let rs1 = self.regs.map_read::<B>(&mut self.buf, d.rs1);
        let rs2 = self.regs.map_read::<B>(&mut self.buf, d.rs2);
        self.regs.writeback_all::<B>(&mut self.buf);
        let ctl = ctl_mem(width, false, self.pc_off);
        let site = B::call_store(&mut self.buf, helper_store as usize, rs1, imm, rs2, ctl);
        self.bail_sites.push(site);
        Step::Continue
    }

    fn emit_branch(&mut self, inst: u32, d: &DecodedInst, len: u64) -> Step {
        let cond = match d.funct3 {
            FUNCT3_BEQ => Cond::Eq,
            FUNCT3_BNE => Cond::Ne,
            FUNCT3_BLT => Cond::Lt,
            FUNCT3_BGE => Cond::Ge,
            FUNCT3_BLTU => Cond::Ltu,
            FUNCT3_BGEU => Cond::Geu,
            _ => return Step::Unsupported,
        };
        let taken = self.wrap(self.cur_virt().wrapping_add(DecodedInst::imm_b(inst) as i64 as u64));
        let fallthrough = self.wrap(self.cur_virt().wrapping_add(len));
        let rs1 = self.regs.map_read::<B>(&mut self.buf, d.rs1);
        let rs2 = self.regs.map_read::<B>(&mut self.buf, d.rs2);
        self.regs.writeback_all::<B>(&mut self.buf);

        // Two patchable exits: fall-through first, taken leg second.
        let to_taken = B::cmp_branch(&mut self.buf, cond, rs1, rs2);
        self.exit_leg(fallthrough);
        let taken_off = self.buf.len();
        B::patch_local(&mut self.buf, to_taken, taken_off);
        self.exit_leg(taken);

        self.insts += 1;
        self.pc_off += len;
        self.linkage = Some(Linkage::Tail);
        Step::Done
    }

    fn emit_jal(&mut self, inst: u32, d: &DecodedInst, len: u64) -> Step {
        let target = self.wrap(self.cur_virt().wrapping_add(DecodedInst::imm_j(inst) as i64 as u64));
        if d.rd != 0 {
            let link = self.wrap(self.cur_virt().wrapping_add(len));
            let rd = self.regs.map_write::<B>(&mut self.buf, d.rd);
            B::li(&mut self.buf, rd, link as i64);
        }
        self.regs.writeback_all::<B>(&mut self.buf);
        self.exit_leg(target);
        self.insts += 1;
        self.pc_off += len;
        self.linkage = Some(Linkage::Jmp);
        Step::Done
    }

    fn emit_jalr(&mut self, inst: u32, d: &DecodedInst, len: u64) -> Step {
        let imm = DecodedInst::imm_i(inst);
        let rs1 = self.regs.map_read::<B>(&mut self.buf, d.rs1);
        // Compute the target into scratch before the link write, in case
        // rd aliases rs1.
        B::jalr_target(&mut self.buf, B::RET0, rs1, imm, self.xlen);
        if d.rd != 0 {
            let link = self.wrap(self.cur_virt().wrapping_add(len));
            let rd = self.regs.map_write::<B>(&mut self.buf, d.rd);
            B::li(&mut self.buf, rd, link as i64);
        }
        self.regs.writeback_all::<B>(&mut self.buf);
        B::store_pc_reg(&mut self.buf, B::RET0);
        B::restores(&mut self.buf, self.regs.used_mask());
        B::ret(&mut self.buf);
        self.insts += 1;
        self.pc_off += len;
        self.linkage = Some(Linkage::None);
        Step::Done
    }

    /// One block exit: write the target PC, restore host registers and
    /// leave through a patchable direct-link jump.
    fn exit_leg(&mut self, target_virt: u64) {
        debug_assert!(!self.regs.any_dirty());
        B::store_pc_imm(&mut self.buf, target_virt);
        B::restores(&mut self.buf, self.regs.used_mask());
        if B::NATIVE_LINKER {
            let site = B::jmp(&mut self.buf);
            // Only same-page targets have a known physical address at
            // compile time, and only strictly forward ones are linked:
            // every loop back-edge returns to the dispatcher, so a linked
            // chain is finite and a spinning guest still reaches the
            // interrupt/flush checks.
            if target_virt & !PAGE_MASK == self.virt_pc & !PAGE_MASK {
                let phys_target = (self.phys_pc & !PAGE_MASK) | (target_virt & PAGE_MASK);
                if phys_target > self.phys_pc {
                    self.links.push((phys_target, site.0));
                }
            }
        }
        B::ret(&mut self.buf);
    }

    /// Terminate without a control transfer: the next PC is the first
    /// untranslated instruction.
    fn end_none(&mut self) {
        if self.linkage.is_some() {
            return;
        }
        self.regs.writeback_all::<B>(&mut self.buf);
        let cur_virt = self.cur_virt();
        B::store_pc_imm(&mut self.buf, cur_virt);
        B::restores(&mut self.buf, self.regs.used_mask());
        B::ret(&mut self.buf);
        self.linkage = Some(Linkage::None);
    }

    fn assemble(mut self) -> BuiltBlock {
        // The recorded linkage bounds how many patch sites the linker may
        // see from this block.
        let max_links = match self.linkage {
            Some(Linkage::Tail) => 2,
            Some(Linkage::Jmp) => 1,
            Some(Linkage::None) => 0,
            None => unreachable!("block not terminated"),
        };
        debug_assert!(self.links.len() <= max_links);
        let _ = max_links;
        let mut out = CodeBuf::new();
        B::prologue(&mut out, self.regs.used_mask());
        let body_base = out.len();
        out.emit_bytes(self.buf.as_slice());

        // Shared bail epilogue: helpers have already written the PC and
        // every mapping was clean, so this only unwinds host state.
        let bail = out.len();
        B::restores(&mut out, self.regs.used_mask());
        B::ret(&mut out);
        for site in &self.bail_sites {
            B::patch_local(&mut out, PatchSite(site.0 + body_base), bail);
        }

        for link in &mut self.links {
            link.1 += body_base;
        }

        BuiltBlock {
            code: out.as_slice().to_vec(),
            phys_pc: self.phys_pc,
            virt_pc: self.virt_pc,
            xlen: self.xlen,
            insts: self.insts,
            links: std::mem::take(&mut self.links),
        }
    }
}

#[cfg(all(test, unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
mod tests {
    use super::*;
    use crate::machine::MachineConfig;

    fn setup(program: &[u32]) -> (std::sync::Arc<Machine>, crate::cpu::Hart, u64) {
        let config = MachineConfig { ram_size_mb: 1, ..Default::default() };
        let (machine, mut harts) = Machine::new(config).unwrap();
        let base = machine.config().ram_base;
        let bytes: Vec<u8> = program.iter().flat_map(|w| w.to_le_bytes()).collect();
        machine.ram_write(base, &bytes).unwrap();
        let hart = harts.remove(0);
        (machine, hart, base)
    }

    #[test]
    fn straight_line_block_executes() {
        // addi x1, x0, 5 ; addi x2, x1, 7 ; jal x0, +8
        let program = [0x0050_0093, 0x0070_8113, 0x0080_006F];
        let (machine, mut hart, base) = setup(&program);
        compile_and_enter(&mut hart, &machine, base);
        assert_eq!(hart.regs[1], 5);
        assert_eq!(hart.regs[2], 12);
        assert_eq!(hart.pc, base + 8 + 8);
        assert_eq!(machine.jit.flush_count(), 0);
    }

    #[test]
    fn jit_matches_interpreter_on_alu_mix() {
        // A handful of ALU shapes: lui, auipc-fold, xor, sltu, sub, srai.
        let program = [
            0x000AB0B7u32, // lui x1, 0xAB
            0x00000117,    // auipc x2, 0
            0x0FF14193,    // xori x3, x2, 0xFF
            0x0030B233,    // sltu x4, x1, x3
            0x401182B3,    // sub x5, x3, x1
            0x4050D313,    // srai x6, x1, 5
            0x0000006F,    // jal x0, 0 (self loop, terminal)
        ];
        let (m1, mut jit_hart, base) = setup(&program);
        compile_and_enter(&mut jit_hart, &m1, base);

        let config =
            MachineConfig { ram_size_mb: 1, jit: false, ..Default::default() };
        let (m2, mut harts) = Machine::new(config).unwrap();
        let bytes: Vec<u8> = program.iter().flat_map(|w| w.to_le_bytes()).collect();
        m2.ram_write(base, &bytes).unwrap();
        let int_hart = &mut harts[0];
        for _ in 0..program.len() {
            int_hart.step_interpret(&m2).unwrap();
        }

        assert_eq!(jit_hart.regs, int_hart.regs);
        assert_eq!(jit_hart.pc, int_hart.pc);
    }

    #[test]
    fn load_store_through_helpers() {
        let program = [
            0x0004_2503u32, // lw a0, 0(s0)
            0x00A4_2223,    // sw a0, 4(s0)
            0x0000_006F,    // jal x0, 0
        ];
        let (machine, mut hart, base) = setup(&program);
        let data = base + 0x1000;
        machine.ram_write(data, &0x1234_5678u32.to_le_bytes()).unwrap();
        hart.regs[8] = data;
        compile_and_enter(&mut hart, &machine, base);
        assert_eq!(hart.regs[10], 0x1234_5678);
        assert_eq!(machine.mem.phys_read(data + 4, 4).unwrap(), 0x1234_5678);
        assert_eq!(hart.pc, base + 8);
    }

    #[test]
    fn faulting_load_bails_precisely() {
        let program = [
            0x0050_0093u32, // addi x1, x0, 5
            0x0004_2503,    // lw a0, 0(s0)  <- faults, s0 points outside RAM
            0x0000_006F,    // jal x0, 0
        ];
        let (machine, mut hart, base) = setup(&program);
        hart.regs[8] = 0x4000; // no RAM, no device
        hart.regs[10] = 77;
        compile_and_enter(&mut hart, &machine, base);
        // The trap was delivered: mepc points at the load, a0 is intact
        // and the earlier addi committed.
        assert_eq!(hart.csr.mcause, 5); // load access fault
        assert_eq!(hart.csr.mepc, base + 4);
        assert_eq!(hart.csr.mtval, 0x4000);
        assert_eq!(hart.regs[1], 5);
        assert_eq!(hart.regs[10], 77);
    }
}
