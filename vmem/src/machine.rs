use alloc::{boxed::Box, ffi::CString, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    error::VmError,
    memory::{MemStat, PAGE_SIZE, PhysAddr, System, VirtAddr, tlb::Tlb},
    params::STASH_SIZE,
    segment::CpuMode,
};

/// Register state mirrored from the CPU core: segment bases, the string
/// index registers, and the current displacement operand.
#[derive(Debug, Default, Clone, Copy)]
pub struct Registers {
    pub es: u64,
    pub cs: u64,
    pub ss: u64,
    pub ds: u64,
    pub fs: u64,
    pub gs: u64,
    pub si: u64,
    pub di: u64,
    pub disp: i64,
}

/// Per-instruction scratch state, chiefly the cross-page operand stash.
#[derive(Debug)]
pub struct OpCache {
    pub(crate) stash: [u8; STASH_SIZE],
    pub(crate) stash_size: usize,
    pub(crate) writable: bool,
}

impl OpCache {
    fn new() -> Self {
        Self {
            stash: [0; STASH_SIZE],
            stash_size: 0,
            writable: false,
        }
    }
}

/// TLB telemetry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbStats {
    /// Probes satisfied by the hottest slot.
    pub hits_one: u64,
    /// Probes satisfied by the tag search.
    pub hits_two: u64,
    pub misses: u64,
}

/// One emulated hart and its memory state.
///
/// Translation hands out borrows into the guest arena. The arena may move
/// when a page is allocated, so such borrows must never be cached across
/// allocations; the borrow checker enforces this statically, and the
/// allocators additionally reset the TLB whenever the buffer grows.
#[derive(Debug)]
pub struct Machine {
    pub(crate) system: System,
    pub(crate) tlb: Tlb,
    pub(crate) opcache: Box<OpCache>,
    pub(crate) invalidated: AtomicBool,
    mode: CpuMode,
    regs: Registers,
    /// Nonzero exactly while a cross-page operand is staged in the stash.
    pub(crate) stash_addr: VirtAddr,
    read_addr: VirtAddr,
    read_size: u32,
    write_addr: VirtAddr,
    write_size: u32,
    /// Guest strings interned for the Machine's lifetime.
    pub(crate) freelist: Vec<CString>,
}

impl Machine {
    pub fn new() -> Self {
        let mut m = Self {
            system: System::new(),
            tlb: Tlb::new(),
            opcache: Box::new(OpCache::new()),
            invalidated: AtomicBool::new(false),
            mode: CpuMode::default(),
            regs: Registers::default(),
            stash_addr: VirtAddr::new(0),
            read_addr: VirtAddr::new(0),
            read_size: 0,
            write_addr: VirtAddr::new(0),
            write_size: 0,
            freelist: Vec::new(),
        };
        m.reset_mem();
        m
    }

    /// Tears every mapping down: free list, TLB, counters, watermark, and
    /// page-table root all go back to their initial state.
    pub fn reset_mem(&mut self) {
        self.system.reset();
        self.tlb.reset();
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut System {
        &mut self.system
    }

    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: CpuMode) {
        self.mode = mode;
    }

    pub fn regs(&self) -> &Registers {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    pub fn set_cr3(&mut self, cr3: PhysAddr) {
        self.system.set_cr3(cr3);
    }

    pub fn memstat(&self) -> &MemStat {
        self.system.memstat()
    }

    /// Number of guest strings interned for the Machine's lifetime.
    pub fn freelist_len(&self) -> usize {
        self.freelist.len()
    }

    /// Virtual address of the staged cross-page operand; null when no
    /// stash is in flight.
    pub fn stash_addr(&self) -> VirtAddr {
        self.stash_addr
    }

    pub fn tlb_stats(&self) -> TlbStats {
        TlbStats {
            hits_one: self.tlb.hits_one(),
            hits_two: self.tlb.hits_two(),
            misses: self.tlb.misses(),
        }
    }

    /// Asks the Machine to flush its TLB before the next translation.
    ///
    /// May be called from any thread; this is the subsystem's only
    /// cross-thread entry point. The owning Machine consumes the flag at
    /// its next probe.
    pub fn invalidate_tlb(&self) {
        self.invalidated.store(true, Ordering::Relaxed);
    }

    /// Records the guest region the tracer should show as read.
    pub fn set_read_addr(&mut self, addr: VirtAddr, size: u32) {
        if size != 0 {
            self.read_addr = addr;
            self.read_size = size;
        }
    }

    /// Records the guest region the tracer should show as written.
    pub fn set_write_addr(&mut self, addr: VirtAddr, size: u32) {
        if size != 0 {
            self.write_addr = addr;
            self.write_size = size;
        }
    }

    pub fn read_window(&self) -> (VirtAddr, u32) {
        (self.read_addr, self.read_size)
    }

    pub fn write_window(&self) -> (VirtAddr, u32) {
        (self.write_addr, self.write_size)
    }

    /// Produces one physical page without touching its contents.
    pub fn allocate_linear_page_raw(&mut self) -> Result<PhysAddr, VmError> {
        let (page, resized) = self.system.alloc_page_raw()?;
        if resized {
            self.tlb.reset();
        }
        Ok(page)
    }

    /// Produces one zero-filled physical page.
    pub fn allocate_linear_page(&mut self) -> Result<PhysAddr, VmError> {
        let page = self.allocate_linear_page_raw()?;
        self.system.bytes_mut(page, PAGE_SIZE).fill(0);
        Ok(page)
    }

    /// Grows the arena to at least `n` bytes of capacity.
    pub fn reserve_real(&mut self, n: usize) -> Result<(), VmError> {
        if self.system.grow_to(n)? {
            self.tlb.reset();
        }
        Ok(())
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
