use alloc::vec::Vec;

use super::{PAGE_SHIFT, PAGE_SIZE, PageRound as _, Pte, PteFlags, VirtAddr};
use crate::{error::VmError, machine::Machine};

impl Machine {
    /// Claims `[virt, virt + size)` by installing `key` at every absent
    /// leaf, creating intermediate tables as needed.
    ///
    /// `key` is the template entry for the claimed pages, normally
    /// `V | RSRV` so the demand pager backs them on first touch. Every
    /// missing table is allocated before anything is installed, so a
    /// failed reservation leaves no partial state.
    pub fn reserve_virtual(&mut self, virt: VirtAddr, size: usize, key: Pte) -> Result<(), VmError> {
        debug_assert!(virt.is_page_aligned());
        debug_assert!(size.is_page_aligned());
        if size == 0 {
            return Ok(());
        }

        let missing = self.count_missing_tables(virt, size);
        let mut fresh = Vec::with_capacity(missing);
        for _ in 0..missing {
            match self.allocate_linear_page() {
                Ok(page) => fresh.push(page),
                Err(e) => {
                    for page in fresh {
                        self.system.release_page(page);
                    }
                    return Err(e);
                }
            }
        }

        log::debug!("reserving {size:#x} bytes at {virt:#x}, {missing} new tables");
        let end = virt.byte_add(size);
        let mut virt = virt;
        'walk: loop {
            let mut table = self.system.cr3();
            let mut shift = PAGE_SHIFT + 9 * 3;
            while shift > PAGE_SHIFT {
                let at = table.addr() + virt.table_index(shift) * 8;
                let entry = self.system.read_entry(at);
                table = if entry.is_valid() {
                    entry.phys_addr()
                } else {
                    let page = fresh.pop().unwrap();
                    self.system
                        .write_entry(at, Pte::new(page, PteFlags::INTERMEDIATE));
                    self.system.memstat_mut().pagetables += 1;
                    page
                };
                shift -= 9;
            }
            let mut ti = virt.table_index(PAGE_SHIFT);
            loop {
                let at = table.addr() + ti * 8;
                if !self.system.read_entry(at).is_valid() {
                    self.system.write_entry(at, key);
                    self.system.memstat_mut().reserved += 1;
                }
                virt = virt.byte_add(PAGE_SIZE);
                if virt >= end {
                    debug_assert!(fresh.is_empty());
                    return Ok(());
                }
                ti += 1;
                if ti == 512 {
                    continue 'walk;
                }
            }
        }
    }

    /// Counts the intermediate tables a reservation would have to create:
    /// one per absent entry above the leaf level across the range.
    fn count_missing_tables(&self, virt: VirtAddr, size: usize) -> usize {
        let end = virt.addr() + size as i64;
        let mut missing = 0;
        for level in (1..=3).rev() {
            let shift = PAGE_SHIFT + 9 * level;
            let span = 1_i64 << shift;
            let mut v = virt.addr() & !(span - 1);
            while v < end {
                if !self.table_present(VirtAddr::new(v), shift) {
                    missing += 1;
                }
                v += span;
            }
        }
        missing
    }

    /// Whether the table below the entry at `shift` already exists for
    /// `virt`.
    fn table_present(&self, virt: VirtAddr, shift: usize) -> bool {
        let mut table = self.system.cr3();
        let mut s = PAGE_SHIFT + 9 * 3;
        loop {
            let entry = self.system.read_entry(table.addr() + virt.table_index(s) * 8);
            if !entry.is_valid() {
                return false;
            }
            if s == shift {
                return true;
            }
            table = entry.phys_addr();
            s -= 9;
        }
    }

    /// Scans upward from `virt` for a contiguous unmapped run of `size`
    /// bytes. The first absent entry at walk level `i` proves a
    /// `2^i`-byte hole; a mapped leaf restarts the scan one page up.
    pub fn find_virtual(&mut self, virt: VirtAddr, size: usize) -> Result<VirtAddr, VmError> {
        let mut virt = virt.addr();
        let mut got: u64 = 0;
        while (got as usize) < size {
            let probe = virt + got as i64;
            if probe >= VirtAddr::CANONICAL_END {
                return Err(VmError::AddressSpaceExhausted);
            }
            let mut table = self.system.cr3();
            let mut shift = PAGE_SHIFT + 9 * 3;
            let hole = loop {
                let entry = self
                    .system
                    .read_entry(table.addr() + VirtAddr::new(probe).table_index(shift) * 8);
                if !entry.is_valid() {
                    break Some(shift);
                }
                if shift == PAGE_SHIFT {
                    break None;
                }
                table = entry.phys_addr();
                shift -= 9;
            };
            match hole {
                Some(shift) => got += 1 << shift,
                None => {
                    virt = probe + PAGE_SIZE as i64;
                    got = 0;
                }
            }
        }
        Ok(VirtAddr::new(virt))
    }

    /// Unmaps `[base, base + size)`. Reserved leaves are simply
    /// forgotten; committed leaves return their pages to the free list.
    /// Absent entries skip a whole level's span at a time. Page tables
    /// stay allocated.
    pub fn free_virtual(&mut self, base: VirtAddr, size: usize) {
        log::debug!("freeing {size:#x} bytes at {base:#x}");
        let end = base.addr() + size as i64;
        let mut virt = base.addr();
        while virt < end {
            let mut table = self.system.cr3();
            let mut shift = PAGE_SHIFT + 9 * 3;
            loop {
                let at = table.addr() + VirtAddr::new(virt).table_index(shift) * 8;
                let entry = self.system.read_entry(at);
                if !entry.is_valid() {
                    break;
                }
                if shift == PAGE_SHIFT {
                    if entry.is_reserved() {
                        self.system.memstat_mut().reserved -= 1;
                        self.system.memstat_mut().freed += 1;
                    } else {
                        self.system.release_page(entry.phys_addr());
                    }
                    self.system.write_entry(at, Pte::from_bits(0));
                    break;
                }
                table = entry.phys_addr();
                shift -= 9;
            }
            virt += 1_i64 << shift;
        }
        self.tlb.reset();
    }
}
