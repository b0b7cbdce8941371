//! Code heap: the executable arena and the block/link maps
//!
//! One `mmap`-ed region, bump-allocated, holding every compiled block.
//! The mapping is writable during emission batches and executable during
//! dispatch (W^X toggled with `mprotect` under the engine's write lock).
//! Blocks are never freed individually; invalidation is a whole-heap
//! flush that clears the block cache and the pending-link map and resets
//! the bump pointer.

use std::collections::HashMap;

use super::backend::Backend;
use crate::cpu::Xlen;

/// A finalized block ready for installation: host code plus the outgoing
/// direct-link sites (target guest physical PC, site offset in `code`).
pub(crate) struct BuiltBlock {
    pub code: Vec<u8>,
    pub phys_pc: u64,
    /// Virtual PC the trace was captured under; baked into the emitted
    /// constants, so dispatch must only enter under the same mapping.
    pub virt_pc: u64,
    pub xlen: Xlen,
    pub insts: u32,
    pub links: Vec<(u64, usize)>,
}

#[derive(Clone, Copy)]
pub(crate) struct BlockEntry {
    offset: usize,
    virt_pc: u64,
    xlen: Xlen,
    pub insts: u32,
}

pub(crate) struct CodeHeap {
    base: *mut u8,
    capacity: usize,
    offset: usize,
    executable: bool,
    /// Block cache: guest physical PC of the first instruction -> entry.
    blocks: HashMap<u64, BlockEntry>,
    /// Link sites waiting for their target to be compiled, keyed by the
    /// target's guest physical PC (never by host pointer, so a flush
    /// severs everything uniformly).
    pending_links: HashMap<u64, Vec<usize>>,
    pub flushes: u64,
}

// The heap is shared behind the engine's RwLock; the raw base pointer is
// only written under the write guard.
unsafe impl Send for CodeHeap {}
unsafe impl Sync for CodeHeap {}

impl CodeHeap {
    #[cfg(unix)]
    pub fn new(capacity: usize) -> Result<Self, String> {
        let capacity = (capacity + 0xFFF) & !0xFFF;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(format!("mmap of {} byte code heap failed", capacity));
        }
        Ok(CodeHeap {
            base: base as *mut u8,
            capacity,
            offset: 0,
            executable: false,
            blocks: HashMap::with_capacity(1024),
            pending_links: HashMap::with_capacity(64),
            flushes: 0,
        })
    }

    #[cfg(not(unix))]
    pub fn new(_capacity: usize) -> Result<Self, String> {
        Err("code heap requires mmap".into())
    }

    /// Flip the whole arena to RW for an emission batch.
    #[cfg(unix)]
    pub fn make_writable(&mut self) {
        if self.executable {
            self.protect(libc::PROT_READ | libc::PROT_WRITE);
            self.executable = false;
        }
    }

    /// Flip the arena to RX for dispatch.
    #[cfg(unix)]
    pub fn make_executable(&mut self) {
        if !self.executable {
            self.protect(libc::PROT_READ | libc::PROT_EXEC);
            self.executable = true;
        }
    }

    #[cfg(not(unix))]
    pub fn make_writable(&mut self) {}

    #[cfg(not(unix))]
    pub fn make_executable(&mut self) {}

    #[cfg(unix)]
    fn protect(&self, prot: i32) {
        let rc = unsafe { libc::mprotect(self.base as *mut libc::c_void, self.capacity, prot) };
        // A failing mprotect leaves the heap in an unknown protection
        // state; continuing would execute writable memory.
        assert!(rc == 0, "mprotect({:#x}) on code heap failed", prot);
    }

    pub fn lookup(&self, phys_pc: u64, virt_pc: u64, xlen: Xlen) -> Option<(*const u8, BlockEntry)> {
        let entry = *self.blocks.get(&phys_pc)?;
        if entry.xlen != xlen || entry.virt_pc != virt_pc {
            return None;
        }
        Some((unsafe { self.base.add(entry.offset) }, entry))
    }

    /// Copy a finalized block into the arena, register it, and wire up
    /// direct links in both directions. Returns None when the heap is
    /// full (caller flushes and retries once).
    pub fn install<B: Backend>(&mut self, built: &BuiltBlock) -> Option<*const u8> {
        debug_assert!(!self.executable);
        let aligned = (self.offset + 15) & !15;
        if aligned + built.code.len() > self.capacity {
            return None;
        }
        let entry_ptr = unsafe { self.base.add(aligned) };
        unsafe {
            std::ptr::copy_nonoverlapping(built.code.as_ptr(), entry_ptr, built.code.len());
        }

        self.blocks.insert(
            built.phys_pc,
            BlockEntry {
                offset: aligned,
                virt_pc: built.virt_pc,
                xlen: built.xlen,
                insts: built.insts,
            },
        );

        // Outgoing links: patch now if the target exists, park otherwise.
        for &(target, site) in &built.links {
            let site_abs = aligned + site;
            match self.blocks.get(&target) {
                Some(tb) if tb.xlen == built.xlen => unsafe {
                    B::patch_jump(self.base.add(site_abs), self.base.add(tb.offset));
                },
                _ => self.pending_links.entry(target).or_default().push(site_abs),
            }
        }

        // Incoming links that were waiting for this PC.
        if let Some(sites) = self.pending_links.remove(&built.phys_pc) {
            for site in sites {
                unsafe { B::patch_jump(self.base.add(site), entry_ptr) };
            }
        }

        self.offset = aligned + built.code.len();
        B::flush_icache(entry_ptr, built.code.len());
        Some(entry_ptr)
    }

    /// Drop everything: bump pointer to zero, both maps cleared. O(1) in
    /// block count aside from the map clears; no per-block bookkeeping.
    pub fn flush(&mut self) {
        self.offset = 0;
        self.blocks.clear();
        self.pending_links.clear();
        self.flushes += 1;
    }

    pub fn used(&self) -> usize {
        self.offset
    }
}

impl Drop for CodeHeap {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.capacity);
        }
    }
}

#[cfg(all(test, unix, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::jit::backend::{Backend as _, CodeBuf, NativeBackend as B};

    fn ret_block(phys_pc: u64, links: Vec<(u64, usize)>) -> BuiltBlock {
        let mut buf = CodeBuf::new();
        B::ret(&mut buf);
        BuiltBlock {
            code: buf.as_slice().to_vec(),
            phys_pc,
            virt_pc: phys_pc,
            xlen: Xlen::Rv64,
            insts: 1,
            links,
        }
    }

    #[test]
    fn bump_allocation_and_lookup() {
        let mut heap = CodeHeap::new(0x10000).unwrap();
        let a = heap.install::<B>(&ret_block(0x1000, vec![])).unwrap();
        let b = heap.install::<B>(&ret_block(0x2000, vec![])).unwrap();
        assert!(a < b);
        assert_eq!(b as usize % 16, 0);
        assert_eq!(heap.lookup(0x1000, 0x1000, Xlen::Rv64).unwrap().0, a);
        assert!(heap.lookup(0x1000, 0x1000, Xlen::Rv32).is_none());
        assert!(heap.lookup(0x1000, 0xFFFF_1000, Xlen::Rv64).is_none());
        assert!(heap.lookup(0x3000, 0x3000, Xlen::Rv64).is_none());
    }

    #[test]
    fn full_heap_reports_none_and_flush_recovers() {
        let mut heap = CodeHeap::new(0x1000).unwrap();
        let big = BuiltBlock {
            code: vec![0xC3; 0x900],
            phys_pc: 0x1000,
            virt_pc: 0x1000,
            xlen: Xlen::Rv64,
            insts: 1,
            links: vec![],
        };
        assert!(heap.install::<B>(&big).is_some());
        assert!(heap.install::<B>(&big).is_none());
        heap.flush();
        assert_eq!(heap.flushes, 1);
        assert_eq!(heap.used(), 0);
        assert!(heap.lookup(0x1000, 0x1000, Xlen::Rv64).is_none());
        assert!(heap.install::<B>(&big).is_some());
    }

    #[test]
    fn pending_links_patch_on_install() {
        let mut heap = CodeHeap::new(0x10000).unwrap();
        // Block A ends with a patchable jump to guest PC 0x2000.
        let mut buf = CodeBuf::new();
        let site = B::jmp(&mut buf);
        B::ret(&mut buf);
        let a = BuiltBlock {
            code: buf.as_slice().to_vec(),
            phys_pc: 0x1000,
            virt_pc: 0x1000,
            xlen: Xlen::Rv64,
            insts: 1,
            links: vec![(0x2000, site.0)],
        };
        let a_entry = heap.install::<B>(&a).unwrap();
        // Unpatched: rel32 still zero (falls through).
        let rel = unsafe { (a_entry.add(site.0) as *const i32).read_unaligned() };
        assert_eq!(rel, 0);

        let b_entry = heap.install::<B>(&ret_block(0x2000, vec![])).unwrap();
        let rel = unsafe { (a_entry.add(site.0) as *const i32).read_unaligned() };
        let expect = b_entry as i64 - (a_entry as i64 + site.0 as i64 + 4);
        assert_eq!(rel as i64, expect);
    }

    #[test]
    fn immediate_link_when_target_exists() {
        let mut heap = CodeHeap::new(0x10000).unwrap();
        let b_entry = heap.install::<B>(&ret_block(0x2000, vec![])).unwrap();
        let mut buf = CodeBuf::new();
        let site = B::jmp(&mut buf);
        B::ret(&mut buf);
        let a = BuiltBlock {
            code: buf.as_slice().to_vec(),
            phys_pc: 0x1000,
            virt_pc: 0x1000,
            xlen: Xlen::Rv64,
            insts: 1,
            links: vec![(0x2000, site.0)],
        };
        let a_entry = heap.install::<B>(&a).unwrap();
        let rel = unsafe { (a_entry.add(site.0) as *const i32).read_unaligned() };
        let expect = b_entry as i64 - (a_entry as i64 + site.0 as i64 + 4);
        assert_eq!(rel as i64, expect);
    }
}
