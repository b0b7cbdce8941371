//! Hart: one RISC-V hardware thread
//!
//! Carries the architectural state (integer and FP register files, PC,
//! privilege, CSR bank, TLB, reservation) plus the execution-loop plumbing:
//! request draining, interrupt sampling, block dispatch and the
//! interpreter fallback. Harts borrow the shared [`Machine`] through an
//! `Arc`; compiled blocks receive a raw pointer to the hart and return to
//! the loop on every exit.

pub mod csr;
pub mod decode;
mod execute;
mod execute_c;
mod execute_fp;
pub mod fpu;
pub mod mmu;
pub mod trap;

pub use csr::Csr;
pub use fpu::Fpu;
pub use mmu::{Access, Mmu};
pub use trap::Trap;

pub(crate) use execute::{alu32_m, alu64_m};
pub(crate) use execute_c::expand as execute_c_expand;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use crate::machine::{HartRequest, HartShared, Machine};
use crate::memory::PAGE_MASK;

/// Privilege levels
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum PrivilegeLevel {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

impl From<u8> for PrivilegeLevel {
    fn from(val: u8) -> Self {
        match val & 3 {
            0 => PrivilegeLevel::User,
            1 => PrivilegeLevel::Supervisor,
            _ => PrivilegeLevel::Machine,
        }
    }
}

/// Guest register width.
#[derive(Clone, Copy, PartialEq, Eq, Debug, serde::Serialize, serde::Deserialize)]
pub enum Xlen {
    Rv32,
    Rv64,
}

/// Hart run states. `Trapped` only exists inside one loop iteration, while
/// a trap is being delivered.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunState {
    Running,
    Trapped,
    WaitingForInterrupt,
    Paused,
    Stopped,
}

/// Interrupt bits owned by the platform (devices/timer), merged into the
/// hart's `mip` view at every safe point.
pub const HW_INTERRUPT_BITS: u64 =
    csr::MIP_MEIP | csr::MIP_MTIP | csr::MIP_MSIP | csr::MIP_SEIP | csr::MIP_STIP;

/// One hardware thread.
///
/// The leading fields are `repr(C)`-addressed by emitted code: the integer
/// register file, the PC and the kick-flag pointer. Everything after
/// `kick_ptr` is only touched from Rust.
#[repr(C)]
pub struct Hart {
    pub regs: [u64; 32],
    pub pc: u64,
    /// Points at `shared.kick`; polled by block prologues to break out of
    /// directly-linked chains when an interrupt or flush request arrives.
    kick_ptr: *const AtomicU32,

    pub fpu: Fpu,
    pub csr: Csr,
    pub mmu: Mmu,
    pub priv_level: PrivilegeLevel,
    pub xlen: Xlen,
    pub id: usize,
    pub state: RunState,

    /// Trap recorded by a JIT memory helper; delivered when the block exits.
    pub(crate) jit_trap: Option<Trap>,

    pub machine: Arc<Machine>,
    shared: Arc<HartShared>,
    req_rx: Receiver<HartRequest>,
    epoch_seen: u64,

    /// Per-physical-page execution counters driving JIT promotion.
    hot_pages: HashMap<u64, u32>,

    pub instret: u64,
}

// The raw kick_ptr aliases shared state that is atomic; the Hart itself
// moves onto its OS thread once and stays there.
unsafe impl Send for Hart {}

pub(crate) const HART_REGS_OFFSET: usize = std::mem::offset_of!(Hart, regs);
pub(crate) const HART_PC_OFFSET: usize = std::mem::offset_of!(Hart, pc);
pub(crate) const HART_KICK_PTR_OFFSET: usize = std::mem::offset_of!(Hart, kick_ptr);

impl Hart {
    pub(crate) fn new(
        id: usize,
        machine: Arc<Machine>,
        shared: Arc<HartShared>,
        req_rx: Receiver<HartRequest>,
    ) -> Self {
        let xlen = machine.config().xlen;
        let kick_ptr = &shared.kick as *const AtomicU32;
        let mut hart = Hart {
            regs: [0; 32],
            pc: machine.config().reset_vector,
            kick_ptr,
            fpu: Fpu::new(),
            csr: Csr::new(id as u64, xlen),
            mmu: Mmu::new(xlen),
            priv_level: PrivilegeLevel::Machine,
            xlen,
            id,
            state: RunState::Running,
            jit_trap: None,
            machine,
            shared,
            req_rx,
            epoch_seen: 0,
            hot_pages: HashMap::new(),
            instret: 0,
        };
        hart.normalize_pc();
        hart
    }

    /// Read register; x0 always reads zero.
    #[inline(always)]
    pub fn read_reg(&self, reg: u32) -> u64 {
        if reg == 0 {
            0
        } else {
            self.regs[reg as usize & 0x1F]
        }
    }

    /// Write register; x0 writes are discarded. In RV32 mode values are
    /// kept sign-extended to 64 bits, which makes RV64 W-op semantics and
    /// RV32 semantics coincide.
    #[inline(always)]
    pub fn write_reg(&mut self, reg: u32, value: u64) {
        if reg != 0 {
            self.regs[reg as usize & 0x1F] = match self.xlen {
                Xlen::Rv32 => value as u32 as i32 as i64 as u64,
                Xlen::Rv64 => value,
            };
        }
    }

    #[inline(always)]
    pub(crate) fn normalize_pc(&mut self) {
        if self.xlen == Xlen::Rv32 {
            self.pc = self.pc as u32 as i32 as i64 as u64;
        }
    }

    #[inline(always)]
    pub(crate) fn wrap_addr(&self, addr: u64) -> u64 {
        match self.xlen {
            Xlen::Rv32 => addr as u32 as u64,
            Xlen::Rv64 => addr,
        }
    }

    pub fn set_priv(&mut self, level: PrivilegeLevel) {
        if self.priv_level != level {
            self.priv_level = level;
            self.mmu.flush_all();
        }
    }

    pub fn clear_reservation(&mut self) {
        self.machine.clear_reservation(self.id);
    }

    /// Re-arm the block-entry poll. Only called with the code-heap read
    /// guard held, so the ordering argument in `jit::lookup_and_enter`
    /// holds.
    pub(crate) fn clear_kick(&self) {
        self.shared.kick.store(0, Ordering::SeqCst);
    }

    /// Effective privilege for data accesses, honouring `mstatus.MPRV`.
    fn data_priv(&self) -> PrivilegeLevel {
        if self.priv_level == PrivilegeLevel::Machine && self.csr.mstatus & csr::MSTATUS_MPRV != 0 {
            PrivilegeLevel::from(((self.csr.mstatus >> 11) & 3) as u8)
        } else {
            self.priv_level
        }
    }

    pub(crate) fn translate(
        &mut self,
        machine: &Machine,
        vaddr: u64,
        access: Access,
    ) -> Result<u64, Trap> {
        let priv_level = match access {
            Access::Fetch => self.priv_level,
            _ => self.data_priv(),
        };
        let (satp, mstatus, asid) = (self.csr.satp, self.csr.mstatus, self.csr.asid());
        self.mmu
            .translate(vaddr, access, priv_level, &machine.mem, satp, mstatus, asid)
            .map_err(|cause| Trap::from_cause(cause, self.wrap_addr(vaddr)))
    }

    /// Virtual load. Misaligned accesses are assembled bytewise so the
    /// page-crossing halves translate (and fault) independently.
    pub(crate) fn load_virt(
        &mut self,
        machine: &Machine,
        vaddr: u64,
        width: usize,
    ) -> Result<u64, Trap> {
        let vaddr = self.wrap_addr(vaddr);
        if vaddr & (width as u64 - 1) == 0 {
            let paddr = self.translate(machine, vaddr, Access::Load)?;
            machine.mem.phys_read(paddr, width).map_err(|_| Trap::LoadAccessFault(vaddr))
        } else {
            let mut value = 0u64;
            for i in 0..width {
                let va = self.wrap_addr(vaddr.wrapping_add(i as u64));
                let paddr = self.translate(machine, va, Access::Load)?;
                let byte =
                    machine.mem.phys_read(paddr, 1).map_err(|_| Trap::LoadAccessFault(va))?;
                value |= byte << (8 * i);
            }
            Ok(value)
        }
    }

    /// Virtual store; notifies the reservation registry.
    pub(crate) fn store_virt(
        &mut self,
        machine: &Machine,
        vaddr: u64,
        width: usize,
        value: u64,
    ) -> Result<(), Trap> {
        let vaddr = self.wrap_addr(vaddr);
        if vaddr & (width as u64 - 1) == 0 {
            let paddr = self.translate(machine, vaddr, Access::Store)?;
            machine
                .mem
                .phys_write(paddr, width, value)
                .map_err(|_| Trap::StoreAccessFault(vaddr))?;
            machine.store_notify(paddr, width, self.id);
        } else {
            // Translate every byte before committing any, so a page fault
            // in the middle leaves memory untouched.
            let mut paddrs = [0u64; 8];
            for (i, slot) in paddrs.iter_mut().take(width).enumerate() {
                let va = self.wrap_addr(vaddr.wrapping_add(i as u64));
                *slot = self.translate(machine, va, Access::Store)?;
            }
            for (i, &paddr) in paddrs.iter().take(width).enumerate() {
                let va = self.wrap_addr(vaddr.wrapping_add(i as u64));
                machine
                    .mem
                    .phys_write(paddr, 1, value >> (8 * i))
                    .map_err(|_| Trap::StoreAccessFault(va))?;
                machine.store_notify(paddr, 1, self.id);
            }
        }
        Ok(())
    }

    /// Fetch the instruction at PC. Returns `(instruction, phys_pc, len)`;
    /// a 32-bit instruction straddling a page boundary translates each half
    /// separately so the fault is reported on the second page.
    pub(crate) fn fetch(&mut self, machine: &Machine) -> Result<(u32, u64, u64), Trap> {
        let pc = self.pc;
        let paddr = self.translate(machine, pc, Access::Fetch)?;
        let low = machine.mem.phys_read(paddr, 2).map_err(|_| Trap::InstructionAccessFault(pc))?
            as u16;
        if decode::DecodedInst::is_compressed(low) {
            return Ok((low as u32, paddr, 2));
        }
        let high_va = self.wrap_addr(pc.wrapping_add(2));
        let high_pa = if pc.wrapping_add(2) & PAGE_MASK == 0 {
            self.translate(machine, high_va, Access::Fetch)?
        } else {
            paddr + 2
        };
        let high = machine
            .mem
            .phys_read(high_pa, 2)
            .map_err(|_| Trap::InstructionAccessFault(high_va))? as u32;
        Ok(((high << 16) | low as u32, paddr, 4))
    }

    /// Execute exactly one instruction through the interpreter.
    pub(crate) fn step_interpret(&mut self, machine: &Machine) -> Result<(), Trap> {
        let (inst, _paddr, len) = self.fetch(machine)?;
        if len == 2 {
            self.execute_compressed(machine, inst as u16)?;
        } else {
            self.execute(machine, inst)?;
        }
        self.instret += 1;
        self.csr.instret = self.instret;
        self.csr.cycle = self.csr.cycle.wrapping_add(1);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Hart loop
    // ------------------------------------------------------------------

    /// Run until the hart powers off.
    pub fn run(&mut self) {
        let machine = self.machine.clone();
        while self.state != RunState::Stopped {
            self.run_slice(&machine, 10_000);
        }
        log::debug!("hart{}: stopped at pc={:#x}", self.id, self.pc);
    }

    /// Run a bounded number of instructions (block entries count their
    /// instructions). Returns the number retired. Useful for embedders
    /// driving harts cooperatively and for tests.
    pub fn run_steps(&mut self, max: u64) -> u64 {
        let machine = self.machine.clone();
        self.run_slice(&machine, max)
    }

    fn run_slice(&mut self, machine: &Machine, max: u64) -> u64 {
        let start = self.instret;
        while self.instret - start < max && self.state != RunState::Stopped {
            // 1. External requests and global invalidation events.
            self.drain_requests();
            if self.state == RunState::Stopped {
                break;
            }
            if self.state == RunState::Paused {
                self.park_paused();
                continue;
            }
            self.observe_epoch(machine);

            // 2. Interrupts.
            self.csr.time = machine.intc.mtime();
            self.sync_pending_interrupts();
            if let Some(irq) = trap::check_pending(self) {
                self.state = RunState::Trapped;
                trap::deliver(self, irq);
                self.state = RunState::Running;
                continue;
            }

            if self.state == RunState::WaitingForInterrupt {
                self.park_wfi();
                continue;
            }

            // 3-5. Dispatch: compiled block if possible, else interpret.
            self.dispatch(machine);
        }
        self.instret - start
    }

    fn dispatch(&mut self, machine: &Machine) {
        if machine.jit_enabled() {
            match self.translate(machine, self.pc, Access::Fetch) {
                Ok(phys_pc) => {
                    if self.try_enter_block(machine, phys_pc) {
                        return;
                    }
                    if self.bump_hotness(phys_pc, machine.config().jit_hot_threshold) {
                        crate::jit::compile_and_enter(self, machine, phys_pc);
                        return;
                    }
                }
                Err(trap) => {
                    self.state = RunState::Trapped;
                    trap::deliver(self, trap);
                    self.state = RunState::Running;
                    return;
                }
            }
        }

        if let Err(trap) = self.step_interpret(machine) {
            self.handle_trap(trap);
        }
    }

    fn try_enter_block(&mut self, machine: &Machine, phys_pc: u64) -> bool {
        crate::jit::lookup_and_enter(self, machine, phys_pc)
    }

    pub(crate) fn handle_trap(&mut self, trap: Trap) {
        self.state = RunState::Trapped;
        trap::deliver(self, trap);
        self.state = RunState::Running;
    }

    fn bump_hotness(&mut self, phys_pc: u64, threshold: u32) -> bool {
        let page = phys_pc >> crate::memory::PAGE_SHIFT;
        let count = self.hot_pages.entry(page).or_insert(0);
        *count += 1;
        if *count >= threshold {
            *count = 0;
            true
        } else {
            false
        }
    }

    fn observe_epoch(&mut self, machine: &Machine) {
        let epoch = machine.epoch();
        if epoch != self.epoch_seen {
            self.epoch_seen = epoch;
            self.mmu.flush_all();
            self.hot_pages.clear();
        }
    }

    pub(crate) fn sync_pending_interrupts(&mut self) {
        let hw = self.shared.pending.load(Ordering::Acquire);
        self.csr.mip = (self.csr.mip & !HW_INTERRUPT_BITS) | (hw & HW_INTERRUPT_BITS);
    }

    fn drain_requests(&mut self) {
        while let Ok(req) = self.req_rx.try_recv() {
            self.handle_request(req);
        }
    }

    fn handle_request(&mut self, req: HartRequest) {
        match req {
            HartRequest::FenceVma { vaddr, asid, ack } => {
                self.mmu.fence(vaddr, asid);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            HartRequest::FenceI => {
                // The dirty map was marked before this message was sent;
                // dropping the TLB fetch entries is all that remains.
                self.mmu.flush_all();
            }
            HartRequest::Pause { ack } => {
                log::debug!("hart{}: paused", self.id);
                self.state = RunState::Paused;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            HartRequest::Resume => {
                if self.state == RunState::Paused {
                    self.state = RunState::Running;
                }
            }
            HartRequest::Reset { pc, ack } => {
                self.reset(pc);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            HartRequest::PowerOff => {
                self.state = RunState::Stopped;
            }
            HartRequest::Start { pc, arg } => {
                self.pc = pc;
                self.normalize_pc();
                self.regs[10] = self.id as u64; // a0 = hartid
                self.regs[11] = arg; // a1 = boot argument
                if self.state == RunState::WaitingForInterrupt {
                    self.state = RunState::Running;
                }
            }
        }
    }

    /// Blocks the paused hart until it is resumed, reset or powered off.
    fn park_paused(&mut self) {
        match self.req_rx.recv() {
            Ok(req) => self.handle_request(req),
            Err(_) => self.state = RunState::Stopped,
        }
    }

    /// Park in WFI until an interrupt may be pending or a request arrives.
    fn park_wfi(&mut self) {
        self.sync_pending_interrupts();
        if self.csr.mip & self.csr.mie != 0 {
            self.state = RunState::Running;
            return;
        }
        self.shared.park_wait(std::time::Duration::from_millis(1));
        self.drain_requests();
        self.sync_pending_interrupts();
        if self.csr.mip & self.csr.mie != 0 {
            self.state = RunState::Running;
        }
    }

    pub(crate) fn enter_wfi(&mut self) {
        if self.state == RunState::Running {
            self.state = RunState::WaitingForInterrupt;
        }
    }

    pub fn reset(&mut self, pc: u64) {
        self.regs = [0; 32];
        self.pc = pc;
        self.normalize_pc();
        self.fpu.reset();
        self.csr.reset();
        self.mmu.reset();
        self.priv_level = PrivilegeLevel::Machine;
        self.state = RunState::Running;
        self.jit_trap = None;
        self.hot_pages.clear();
        self.clear_reservation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Machine, MachineConfig};

    fn hart() -> Hart {
        let (machine, mut harts) = Machine::new(MachineConfig::default()).unwrap();
        let _ = machine;
        harts.remove(0)
    }

    #[test]
    fn x0_always_zero() {
        let mut h = hart();
        h.write_reg(0, 0xDEAD_BEEF);
        assert_eq!(h.read_reg(0), 0);
        h.write_reg(1, 0x1234_5678);
        assert_eq!(h.read_reg(1), 0x1234_5678);
    }

    #[test]
    fn reset_state() {
        let h = hart();
        assert_eq!(h.priv_level, PrivilegeLevel::Machine);
        assert_eq!(h.pc, MachineConfig::default().reset_vector);
        assert!(h.regs.iter().all(|&r| r == 0));
    }

    #[test]
    fn jit_visible_offsets() {
        assert_eq!(HART_REGS_OFFSET, 0);
        assert_eq!(HART_PC_OFFSET, 32 * 8);
        assert_eq!(HART_KICK_PTR_OFFSET, 33 * 8);
    }
}
