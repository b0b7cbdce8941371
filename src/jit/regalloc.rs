//! Register allocator for the block being emitted
//!
//! Maps the 32 guest integer registers onto the backend's callee-saved
//! pool. Each mapping carries a dirty flag, an LRU stamp and an optional
//! carried `auipc` constant (so PC-relative address material folds into
//! later adds). When the pool runs out the least-recently-used unpinned
//! mapping is reclaimed, spilling to the hart's register file only if
//! dirty. `writeback_all` flushes every dirty mapping at block exits.

use super::backend::{Backend, CodeBuf};

const REG_ILL: u8 = 0xFF;

#[derive(Clone, Copy)]
struct RegInfo {
    /// Claimed host register, REG_ILL if unmapped.
    hreg: u8,
    dirty: bool,
    /// Register currently holds this exact constant (from auipc folding).
    auipc: Option<u64>,
    /// Last use, for LRU reclaim.
    last_used: u64,
}

impl RegInfo {
    const fn empty() -> Self {
        RegInfo { hreg: REG_ILL, dirty: false, auipc: None, last_used: 0 }
    }
}

pub struct RegAlloc {
    info: [RegInfo; 32],
    free_mask: u32,
    used_mask: u32,
    pinned_mask: u32,
    counter: u64,
}

impl RegAlloc {
    pub fn new(pool: u32) -> Self {
        RegAlloc {
            info: [RegInfo::empty(); 32],
            free_mask: pool,
            used_mask: 0,
            pinned_mask: 0,
            counter: 0,
        }
    }

    /// Host registers the block touched; drives prologue saves.
    pub fn used_mask(&self) -> u32 {
        self.used_mask
    }

    /// Forget per-instruction pinning; call before emitting each guest
    /// instruction.
    pub fn begin_inst(&mut self) {
        self.pinned_mask = 0;
    }

    /// Map a guest register for reading. x0 materializes a zero constant
    /// on first use and is never written back.
    pub fn map_read<B: Backend>(&mut self, buf: &mut CodeBuf, greg: u32) -> u8 {
        let greg = greg as usize & 0x1F;
        self.counter += 1;
        let stamp = self.counter;
        if self.info[greg].hreg != REG_ILL {
            let hreg = self.info[greg].hreg;
            self.info[greg].last_used = stamp;
            self.pinned_mask |= 1 << hreg;
            return hreg;
        }
        let hreg = self.claim::<B>(buf);
        if greg == 0 {
            B::li(buf, hreg, 0);
        } else {
            B::load_greg(buf, hreg, greg as u8);
        }
        self.info[greg] =
            RegInfo { hreg, dirty: false, auipc: None, last_used: stamp };
        self.pinned_mask |= 1 << hreg;
        hreg
    }

    /// Map a guest register for writing; the previous value is not loaded.
    /// The caller must already have discarded x0 writes.
    pub fn map_write<B: Backend>(&mut self, buf: &mut CodeBuf, greg: u32) -> u8 {
        let greg = greg as usize & 0x1F;
        debug_assert!(greg != 0, "x0 writes are discarded at the frontend");
        self.counter += 1;
        let stamp = self.counter;
        let hreg = if self.info[greg].hreg != REG_ILL {
            self.info[greg].hreg
        } else {
            self.claim::<B>(buf)
        };
        self.info[greg] = RegInfo { hreg, dirty: true, auipc: None, last_used: stamp };
        self.pinned_mask |= 1 << hreg;
        hreg
    }

    /// Record that `greg` now holds the constant `value`.
    pub fn set_auipc(&mut self, greg: u32, value: u64) {
        let greg = greg as usize & 0x1F;
        if greg != 0 {
            self.info[greg].auipc = Some(value);
        }
    }

    /// The constant `greg` is known to hold, if any.
    pub fn auipc_of(&self, greg: u32) -> Option<u64> {
        let greg = greg as usize & 0x1F;
        if greg == 0 {
            Some(0)
        } else if self.info[greg].hreg != REG_ILL {
            self.info[greg].auipc
        } else {
            None
        }
    }

    fn claim<B: Backend>(&mut self, buf: &mut CodeBuf) -> u8 {
        if self.free_mask != 0 {
            let hreg = self.free_mask.trailing_zeros() as u8;
            self.free_mask &= !(1 << hreg);
            self.used_mask |= 1 << hreg;
            return hreg;
        }
        self.reclaim::<B>(buf)
    }

    /// Evict the least-recently-used mapping whose host register is not
    /// pinned by the current instruction; spill only if dirty.
    fn reclaim<B: Backend>(&mut self, buf: &mut CodeBuf) -> u8 {
        let mut victim = usize::MAX;
        let mut oldest = u64::MAX;
        for (greg, info) in self.info.iter().enumerate() {
            if info.hreg == REG_ILL || self.pinned_mask & (1 << info.hreg) != 0 {
                continue;
            }
            if info.last_used < oldest {
                oldest = info.last_used;
                victim = greg;
            }
        }
        assert!(victim != usize::MAX, "register pool exhausted by pinned mappings");
        let hreg = self.info[victim].hreg;
        if self.info[victim].dirty {
            B::store_greg(buf, hreg, victim as u8);
        }
        self.info[victim] = RegInfo::empty();
        hreg
    }

    /// Flush every dirty mapping to the hart's register file, keeping the
    /// mappings live (clean). Called at block exits and before any helper
    /// call that can fault.
    pub fn writeback_all<B: Backend>(&mut self, buf: &mut CodeBuf) {
        for greg in 1..32 {
            if self.info[greg].hreg != REG_ILL && self.info[greg].dirty {
                B::store_greg(buf, self.info[greg].hreg, greg as u8);
                self.info[greg].dirty = false;
            }
        }
    }

    /// Any dirty mapping left? Exit paths assert this is false after
    /// `writeback_all`.
    pub fn any_dirty(&self) -> bool {
        self.info.iter().any(|i| i.hreg != REG_ILL && i.dirty)
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::jit::backend::{NativeBackend as B, Backend as _};

    fn alloc() -> RegAlloc {
        RegAlloc::new(B::REG_POOL)
    }

    #[test]
    fn read_then_hit() {
        let mut ra = alloc();
        let mut buf = CodeBuf::new();
        let h1 = ra.map_read::<B>(&mut buf, 5);
        let before = buf.len();
        let h2 = ra.map_read::<B>(&mut buf, 5);
        assert_eq!(h1, h2);
        // The second map is a cache hit: no code emitted.
        assert_eq!(buf.len(), before);
    }

    #[test]
    fn writeback_clears_dirty() {
        let mut ra = alloc();
        let mut buf = CodeBuf::new();
        ra.map_write::<B>(&mut buf, 7);
        assert!(ra.any_dirty());
        ra.writeback_all::<B>(&mut buf);
        assert!(!ra.any_dirty());
        // Idempotent: nothing more to write back.
        let len = buf.len();
        ra.writeback_all::<B>(&mut buf);
        assert_eq!(buf.len(), len);
    }

    #[test]
    fn lru_reclaim_spills_dirty_victim() {
        let mut ra = alloc();
        let mut buf = CodeBuf::new();
        let pool_size = B::REG_POOL.count_ones() as usize;
        // Fill the pool with dirty mappings g1..gN.
        for g in 1..=pool_size as u32 {
            ra.begin_inst();
            ra.map_write::<B>(&mut buf, g);
        }
        // One more forces reclaim of g1 (oldest), which must spill.
        ra.begin_inst();
        let len_before = buf.len();
        ra.map_write::<B>(&mut buf, 30);
        assert!(buf.len() > len_before, "dirty victim must be spilled");
        // g1 is unmapped now; remapping emits a reload.
        let len_before = buf.len();
        ra.begin_inst();
        ra.map_read::<B>(&mut buf, 1);
        assert!(buf.len() > len_before);
    }

    #[test]
    fn pinned_registers_survive_reclaim() {
        let mut ra = alloc();
        let mut buf = CodeBuf::new();
        let pool_size = B::REG_POOL.count_ones() as usize;
        for g in 1..=pool_size as u32 {
            ra.begin_inst();
            ra.map_write::<B>(&mut buf, g);
        }
        // Pin the oldest mapping by touching it in the current instruction;
        // the reclaim must pick the next-oldest instead.
        ra.begin_inst();
        let pinned = ra.map_read::<B>(&mut buf, 1);
        let fresh = ra.map_write::<B>(&mut buf, 31);
        assert_ne!(pinned, fresh);
        assert_eq!(ra.map_read::<B>(&mut buf, 1), pinned);
    }

    #[test]
    fn x0_reads_zero_and_never_spills() {
        let mut ra = alloc();
        let mut buf = CodeBuf::new();
        ra.map_read::<B>(&mut buf, 0);
        assert!(!ra.any_dirty());
        ra.writeback_all::<B>(&mut buf);
        assert!(!ra.any_dirty());
    }

    #[test]
    fn auipc_constants_drop_on_write() {
        let mut ra = alloc();
        let mut buf = CodeBuf::new();
        ra.map_write::<B>(&mut buf, 4);
        ra.set_auipc(4, 0x8000_1000);
        assert_eq!(ra.auipc_of(4), Some(0x8000_1000));
        ra.map_write::<B>(&mut buf, 4);
        assert_eq!(ra.auipc_of(4), None);
        assert_eq!(ra.auipc_of(0), Some(0));
    }
}
