//! Machine: the shared container every hart borrows
//!
//! Owns guest RAM and MMIO, the JIT engine (code heap, block cache, dirty
//! tracking), the interrupt controller and the per-hart request channels.
//! Harts and device models hold `Arc<Machine>`; the machine-wide epoch
//! counter versions every global invalidation event.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cpu::{Hart, Xlen};
use crate::jit::JitEngine;
use crate::memory::{BusError, Memory, MmioHandler};

/// Construction-time knobs. Defaults mirror the architectural reset state:
/// one RV64 hart waking up at the bottom of RAM in M-mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub ram_base: u64,
    pub ram_size_mb: u32,
    pub harts: usize,
    pub xlen: Xlen,
    pub reset_vector: u64,
    /// Master switch; the JIT also stays off on hosts with no backend.
    pub jit: bool,
    pub jit_heap_size: usize,
    /// Per-page execution count that promotes a PC to a compile candidate.
    /// TODO: retune against OpenSBI+Linux boot once the bench harness lands.
    pub jit_hot_threshold: u32,
    /// Maximum guest instructions traced into one block.
    pub jit_max_block: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            ram_base: 0x8000_0000,
            ram_size_mb: 128,
            harts: 1,
            xlen: Xlen::Rv64,
            reset_vector: 0x8000_0000,
            jit: true,
            jit_heap_size: 32 * 1024 * 1024,
            jit_hot_threshold: 32,
            jit_max_block: 256,
        }
    }
}

/// Typed cross-hart messages (§ hart-request channel). Synchronous senders
/// attach an ack channel and wait on it.
pub enum HartRequest {
    FenceVma { vaddr: Option<u64>, asid: Option<u16>, ack: Option<SyncSender<()>> },
    FenceI,
    Pause { ack: Option<SyncSender<()>> },
    Resume,
    Reset { pc: u64, ack: Option<SyncSender<()>> },
    PowerOff,
    /// Boot protocol: point a parked hart at an entry point.
    Start { pc: u64, arg: u64 },
}

/// Per-hart state shared with device threads and the other harts.
pub struct HartShared {
    /// Set to break a hart out of directly-linked JIT chains; polled by
    /// every block prologue and re-armed when the hart enters a block.
    pub kick: AtomicU32,
    /// Level-triggered interrupt lines (MIP bits), OR-merged into the
    /// hart's mip view at safe points.
    pub pending: AtomicU64,
    park: Mutex<bool>,
    park_cv: Condvar,
}

impl HartShared {
    fn new() -> Self {
        HartShared {
            kick: AtomicU32::new(0),
            pending: AtomicU64::new(0),
            park: Mutex::new(false),
            park_cv: Condvar::new(),
        }
    }

    /// Park until woken or the timeout passes; returns true when woken.
    pub(crate) fn park_wait(&self, timeout: Duration) -> bool {
        let mut woken = self.park.lock().unwrap();
        if !*woken {
            let (guard, res) = self.park_cv.wait_timeout(woken, timeout).unwrap();
            woken = guard;
            if res.timed_out() && !*woken {
                return false;
            }
        }
        *woken = false;
        true
    }

    pub(crate) fn wake(&self) {
        let mut woken = self.park.lock().unwrap();
        *woken = true;
        self.park_cv.notify_all();
    }
}

/// Atomic memory operations, mapped from the AMO funct5 space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmoOp {
    Swap,
    Add,
    Xor,
    And,
    Or,
    Min,
    Max,
    MinU,
    MaxU,
}

impl AmoOp {
    pub fn from_funct5(funct5: u32) -> Option<Self> {
        use crate::cpu::decode::*;
        Some(match funct5 {
            FUNCT5_AMOSWAP => AmoOp::Swap,
            FUNCT5_AMOADD => AmoOp::Add,
            FUNCT5_AMOXOR => AmoOp::Xor,
            FUNCT5_AMOAND => AmoOp::And,
            FUNCT5_AMOOR => AmoOp::Or,
            FUNCT5_AMOMIN => AmoOp::Min,
            FUNCT5_AMOMAX => AmoOp::Max,
            FUNCT5_AMOMINU => AmoOp::MinU,
            FUNCT5_AMOMAXU => AmoOp::MaxU,
            _ => return None,
        })
    }

    fn apply(self, old: u64, src: u64, width: usize) -> u64 {
        let (old_s, src_s) = if width == 4 {
            (old as u32 as i32 as i64, src as u32 as i32 as i64)
        } else {
            (old as i64, src as i64)
        };
        match self {
            AmoOp::Swap => src,
            AmoOp::Add => old.wrapping_add(src),
            AmoOp::Xor => old ^ src,
            AmoOp::And => old & src,
            AmoOp::Or => old | src,
            AmoOp::Min => {
                if old_s < src_s {
                    old
                } else {
                    src
                }
            }
            AmoOp::Max => {
                if old_s > src_s {
                    old
                } else {
                    src
                }
            }
            AmoOp::MinU => {
                let (o, s) = if width == 4 { (old as u32 as u64, src as u32 as u64) } else { (old, src) };
                if o < s {
                    old
                } else {
                    src
                }
            }
            AmoOp::MaxU => {
                let (o, s) = if width == 4 { (old as u32 as u64, src as u32 as u64) } else { (old, src) };
                if o > s {
                    old
                } else {
                    src
                }
            }
        }
    }
}

/// Lock-free pending-interrupt fan-in plus the platform timebase.
pub struct InterruptController {
    harts: Vec<Arc<HartShared>>,
    mtime: AtomicU64,
}

impl InterruptController {
    fn new(harts: Vec<Arc<HartShared>>) -> Self {
        InterruptController { harts, mtime: AtomicU64::new(0) }
    }

    /// Raise MIP bits on one hart. Device threads may call this freely.
    pub fn irq_raise(&self, hart: usize, bits: u64) {
        if let Some(shared) = self.harts.get(hart) {
            shared.pending.fetch_or(bits, Ordering::Release);
            shared.kick.store(1, Ordering::Release);
            shared.wake();
        }
    }

    /// Lower MIP bits on one hart.
    pub fn irq_clear(&self, hart: usize, bits: u64) {
        if let Some(shared) = self.harts.get(hart) {
            shared.pending.fetch_and(!bits, Ordering::Release);
        }
    }

    pub fn mtime(&self) -> u64 {
        self.mtime.load(Ordering::Acquire)
    }

    /// Advance the timebase; the timer device drives this.
    pub fn tick(&self, delta: u64) -> u64 {
        self.mtime.fetch_add(delta, Ordering::AcqRel) + delta
    }
}

const RESV_NONE: u64 = u64::MAX;

/// The shared machine.
pub struct Machine {
    config: MachineConfig,
    pub mem: Memory,
    pub intc: InterruptController,
    pub(crate) jit: JitEngine,
    epoch: AtomicU64,
    hart_txs: Vec<Sender<HartRequest>>,
    shared: Vec<Arc<HartShared>>,

    // LR/SC reservation registry: one slot per hart holding the reserved
    // physical address (width folded into bit 1), RESV_NONE when empty.
    resv: Vec<AtomicU64>,
    resv_active: AtomicUsize,
    resv_lock: Mutex<()>,

    // Writers (compile/flush) queued on the code-heap lock. Harts consult
    // this before entering compiled code so a spinning guest loop cannot
    // starve an invalidation.
    jit_writers: AtomicUsize,
}

impl Machine {
    /// Build a machine and its harts. The harts are returned separately so
    /// the embedder can move each onto its own thread.
    pub fn new(config: MachineConfig) -> Result<(Arc<Machine>, Vec<Hart>), String> {
        if config.ram_size_mb == 0 || config.ram_size_mb > 16 * 1024 {
            return Err(format!("invalid RAM size: {}MB", config.ram_size_mb));
        }
        if config.harts == 0 || config.harts > 64 {
            return Err(format!("invalid hart count: {}", config.harts));
        }

        let mem = Memory::new(config.ram_base, config.ram_size_mb as usize * 1024 * 1024)?;
        let jit = JitEngine::new(&config)?;

        let shared: Vec<Arc<HartShared>> =
            (0..config.harts).map(|_| Arc::new(HartShared::new())).collect();
        let intc = InterruptController::new(shared.clone());

        let mut txs = Vec::with_capacity(config.harts);
        let mut rxs = Vec::with_capacity(config.harts);
        for _ in 0..config.harts {
            let (tx, rx) = mpsc::channel();
            txs.push(tx);
            rxs.push(rx);
        }

        let mut resv = Vec::with_capacity(config.harts);
        resv.resize_with(config.harts, || AtomicU64::new(RESV_NONE));

        let machine = Arc::new(Machine {
            config,
            mem,
            intc,
            jit,
            epoch: AtomicU64::new(1),
            hart_txs: txs,
            shared: shared.clone(),
            resv,
            resv_active: AtomicUsize::new(0),
            resv_lock: Mutex::new(()),
            jit_writers: AtomicUsize::new(0),
        });

        let harts = rxs
            .into_iter()
            .enumerate()
            .map(|(id, rx)| Hart::new(id, machine.clone(), shared[id].clone(), rx))
            .collect();

        Ok((machine, harts))
    }

    #[inline(always)]
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    #[inline(always)]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline(always)]
    pub fn jit_enabled(&self) -> bool {
        self.jit.enabled()
    }

    /// Whole-heap flushes so far; observability hook for embedders and
    /// the self-modifying-code tests.
    pub fn jit_flush_count(&self) -> u64 {
        self.jit.flush_count()
    }

    pub fn num_harts(&self) -> usize {
        self.shared.len()
    }

    // ------------------------------------------------------------------
    // Embedder/device API (§ external interfaces)
    // ------------------------------------------------------------------

    pub fn mmio_register(
        &self,
        base: u64,
        size: u64,
        handler: Box<dyn MmioHandler>,
    ) -> Result<(), String> {
        self.mem.mmio_register(base, size, handler)
    }

    pub fn mmio_unregister(&self, base: u64) -> bool {
        self.mem.mmio_unregister(base)
    }

    pub fn ram_read(&self, addr: u64, buf: &mut [u8]) {
        self.mem.ram_read(addr, buf)
    }

    pub fn ram_write(&self, addr: u64, buf: &[u8]) -> Result<(), String> {
        self.mem.ram_write(addr, buf)
    }

    pub fn dma_mark_dirty(&self, addr: u64, len: usize) {
        self.mem.dma_mark_dirty(addr, len)
    }

    /// Send a request to one hart; kicks it out of compiled code.
    pub fn request(&self, hart: usize, req: HartRequest) -> Result<(), String> {
        let tx = self.hart_txs.get(hart).ok_or_else(|| format!("no hart {}", hart))?;
        tx.send(req).map_err(|_| format!("hart {} is gone", hart))?;
        if let Some(shared) = self.shared.get(hart) {
            shared.kick.store(1, Ordering::Release);
            shared.wake();
        }
        Ok(())
    }

    /// Remote `sfence.vma`: fence every hart except `origin` and wait for
    /// each to acknowledge.
    pub fn fence_vma_remote(
        &self,
        origin: Option<usize>,
        vaddr: Option<u64>,
        asid: Option<u16>,
    ) -> Result<(), String> {
        let mut acks = Vec::new();
        for id in 0..self.hart_txs.len() {
            if Some(id) == origin {
                continue;
            }
            let (ack_tx, ack_rx) = mpsc::sync_channel(1);
            self.request(id, HartRequest::FenceVma { vaddr, asid, ack: Some(ack_tx) })?;
            acks.push(ack_rx);
        }
        for rx in acks {
            let _ = rx.recv();
        }
        Ok(())
    }

    /// Guest `fence.i` (or an embedder-level code rewrite): conservatively
    /// mark all of RAM dirty so every hart retranslates before its next
    /// block, then nudge the other harts asynchronously.
    pub fn fence_i(&self, origin: usize) {
        self.mem.dirty().mark_all();
        for id in 0..self.hart_txs.len() {
            if id != origin {
                let _ = self.request(id, HartRequest::FenceI);
            }
        }
    }

    /// Stop every hart at its next safe point.
    pub fn power_off(&self) {
        for id in 0..self.hart_txs.len() {
            let _ = self.request(id, HartRequest::PowerOff);
        }
    }

    pub(crate) fn kick_all_harts(&self) {
        for shared in &self.shared {
            shared.kick.store(1, Ordering::SeqCst);
        }
    }

    /// Announce a queued code-heap writer and break every hart out of
    /// emitted code. Paired with `jit_writer_end` once the write guard is
    /// released.
    pub(crate) fn jit_writer_begin(&self) {
        self.jit_writers.fetch_add(1, Ordering::SeqCst);
        self.kick_all_harts();
    }

    pub(crate) fn jit_writer_end(&self) {
        self.jit_writers.fetch_sub(1, Ordering::SeqCst);
    }

    #[inline(always)]
    pub(crate) fn jit_writer_waiting(&self) -> bool {
        self.jit_writers.load(Ordering::SeqCst) != 0
    }

    // ------------------------------------------------------------------
    // Atomics: AMO, LR/SC and the reservation registry
    // ------------------------------------------------------------------

    /// Single observable read-modify-write, serialized machine-wide.
    pub(crate) fn amo(
        &self,
        hart: usize,
        paddr: u64,
        width: usize,
        op: AmoOp,
        src: u64,
    ) -> Result<u64, BusError> {
        let _guard = self.resv_lock.lock().unwrap();
        let old = self.mem.phys_read(paddr, width)?;
        let new = op.apply(old, src, width);
        self.mem.phys_write(paddr, width, new)?;
        self.clear_overlapping_locked(paddr, width, Some(hart));
        Ok(old)
    }

    pub(crate) fn lr(&self, hart: usize, paddr: u64, width: usize) -> Result<u64, BusError> {
        // Reservations only cover RAM; device registers cannot participate.
        if !self.mem.is_ram(paddr, width) {
            return Err(BusError);
        }
        let _guard = self.resv_lock.lock().unwrap();
        let value = self.mem.phys_read(paddr, width)?;
        let enc = paddr | if width == 8 { 2 } else { 0 };
        if self.resv[hart].swap(enc, Ordering::SeqCst) == RESV_NONE {
            self.resv_active.fetch_add(1, Ordering::SeqCst);
        }
        Ok(value)
    }

    /// Store-conditional. Returns 0 on success, 1 on failure.
    pub(crate) fn sc(
        &self,
        hart: usize,
        paddr: u64,
        width: usize,
        value: u64,
    ) -> Result<u64, BusError> {
        let _guard = self.resv_lock.lock().unwrap();
        let expected = paddr | if width == 8 { 2 } else { 0 };
        let held = self.resv[hart].swap(RESV_NONE, Ordering::SeqCst);
        if held != RESV_NONE {
            self.resv_active.fetch_sub(1, Ordering::SeqCst);
        }
        if held != expected {
            return Ok(1);
        }
        self.mem.phys_write(paddr, width, value)?;
        self.clear_overlapping_locked(paddr, width, Some(hart));
        Ok(0)
    }

    pub(crate) fn clear_reservation(&self, hart: usize) {
        if self.resv[hart].swap(RESV_NONE, Ordering::SeqCst) != RESV_NONE {
            self.resv_active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Called after every ordinary store: breaks other harts' reservations
    /// that overlap the written range.
    pub(crate) fn store_notify(&self, paddr: u64, len: usize, writer: usize) {
        if self.resv_active.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.resv_lock.lock().unwrap();
        self.clear_overlapping_locked(paddr, len, Some(writer));
    }

    fn clear_overlapping_locked(&self, paddr: u64, len: usize, except: Option<usize>) {
        for (id, slot) in self.resv.iter().enumerate() {
            if Some(id) == except {
                continue;
            }
            let held = slot.load(Ordering::SeqCst);
            if held == RESV_NONE {
                continue;
            }
            let addr = held & !3;
            let width = if held & 2 != 0 { 8 } else { 4 };
            if addr < paddr + len as u64 && paddr < addr + width {
                if slot.swap(RESV_NONE, Ordering::SeqCst) != RESV_NONE {
                    self.resv_active.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }
}

/// Move each hart onto its own OS thread and return the join handles.
pub fn spawn_harts(harts: Vec<Hart>) -> Vec<std::thread::JoinHandle<()>> {
    harts
        .into_iter()
        .map(|mut hart| {
            std::thread::Builder::new()
                .name(format!("hart{}", hart.id))
                .spawn(move || hart.run())
                .expect("spawning hart thread")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> (Arc<Machine>, Vec<Hart>) {
        let config = MachineConfig { ram_size_mb: 1, harts: 2, ..Default::default() };
        Machine::new(config).unwrap()
    }

    #[test]
    fn amo_semantics() {
        let (m, _harts) = machine();
        let addr = m.config().ram_base + 0x100;
        m.mem.phys_write(addr, 4, 10).unwrap();
        let old = m.amo(0, addr, 4, AmoOp::Add, 5).unwrap();
        assert_eq!(old, 10);
        assert_eq!(m.mem.phys_read(addr, 4).unwrap(), 15);
        // Signed min on 32-bit values.
        let old = m.amo(0, addr, 4, AmoOp::Min, (-1i32) as u32 as u64).unwrap();
        assert_eq!(old, 15);
        assert_eq!(m.mem.phys_read(addr, 4).unwrap() as u32, u32::MAX);
    }

    #[test]
    fn lr_sc_basic() {
        let (m, _harts) = machine();
        let addr = m.config().ram_base + 0x200;
        m.mem.phys_write(addr, 4, 7).unwrap();
        assert_eq!(m.lr(0, addr, 4).unwrap(), 7);
        assert_eq!(m.sc(0, addr, 4, 9).unwrap(), 0);
        assert_eq!(m.mem.phys_read(addr, 4).unwrap(), 9);
        // The reservation is consumed: a second SC fails.
        assert_eq!(m.sc(0, addr, 4, 11).unwrap(), 1);
        assert_eq!(m.mem.phys_read(addr, 4).unwrap(), 9);
    }

    #[test]
    fn sc_fails_after_foreign_store() {
        let (m, _harts) = machine();
        let addr = m.config().ram_base + 0x300;
        m.lr(0, addr, 4).unwrap();
        // Hart 1 stores into the reserved range.
        m.mem.phys_write(addr, 4, 1).unwrap();
        m.store_notify(addr, 4, 1);
        assert_eq!(m.sc(0, addr, 4, 2).unwrap(), 1);
    }

    #[test]
    fn sc_fails_on_mismatched_range() {
        let (m, _harts) = machine();
        let addr = m.config().ram_base + 0x400;
        m.lr(0, addr, 4).unwrap();
        assert_eq!(m.sc(0, addr, 8, 2).unwrap(), 1);
    }

    #[test]
    fn amo_breaks_reservations() {
        let (m, _harts) = machine();
        let addr = m.config().ram_base + 0x500;
        m.lr(0, addr, 4).unwrap();
        m.amo(1, addr, 4, AmoOp::Add, 1).unwrap();
        assert_eq!(m.sc(0, addr, 4, 2).unwrap(), 1);
    }

    #[test]
    fn irq_raise_sets_pending_and_kick() {
        let (m, _harts) = machine();
        m.intc.irq_raise(0, crate::cpu::csr::MIP_MTIP);
        assert_eq!(m.shared[0].pending.load(Ordering::Acquire), crate::cpu::csr::MIP_MTIP);
        assert_eq!(m.shared[0].kick.load(Ordering::Acquire), 1);
        m.intc.irq_clear(0, crate::cpu::csr::MIP_MTIP);
        assert_eq!(m.shared[0].pending.load(Ordering::Acquire), 0);
    }
}
