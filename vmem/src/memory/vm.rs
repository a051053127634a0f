use alloc::{borrow::ToOwned, ffi::CString, vec::Vec};
use core::{ffi::CStr, sync::atomic::Ordering};

use super::{PAGE_SHIFT, PAGE_SIZE, PageRound as _, PhysAddr, Pte, VirtAddr};
use crate::{error::VmError, machine::Machine, segment::CpuMode};

/// How a guest operand maps onto the arena: one contiguous span, or two
/// page halves split `cut` bytes in.
#[derive(Debug, Clone, Copy)]
pub enum RamAccess {
    Direct(PhysAddr),
    Split { lo: PhysAddr, hi: PhysAddr, cut: usize },
}

impl Machine {
    /// Translates a page-aligned virtual address to its leaf entry,
    /// consulting the TLB first and demand-paging reserved leaves.
    pub(crate) fn find_pte(&mut self, page: VirtAddr) -> Option<Pte> {
        debug_assert!(page.is_page_aligned());
        if self.invalidated.load(Ordering::Relaxed) {
            self.tlb.reset();
            self.invalidated.store(false, Ordering::Relaxed);
        } else if let Some(entry) = self.tlb.get(page) {
            if entry.is_valid() {
                return Some(entry);
            }
        }
        if !page.is_canonical() {
            return None;
        }
        debug_assert!(self.system.cr3().addr() != 0);
        let mut table = self.system.cr3();
        let mut shift = PAGE_SHIFT + 9 * 3;
        let mut entry;
        let mut index;
        loop {
            index = page.table_index(shift);
            entry = self.system.read_entry(table.addr() + index * 8);
            if !entry.is_valid() {
                return None;
            }
            if shift == PAGE_SHIFT {
                break;
            }
            table = self.system.page_addr(entry)?;
            shift -= 9;
        }
        if entry.is_reserved() {
            entry = self.handle_page_fault(entry, table, index)?;
        }
        self.tlb.put(page, entry);
        Some(entry)
    }

    /// Commits a reserved leaf: backs it with a fresh zero page and
    /// rewrites the entry in place. Failure leaves the reservation
    /// intact.
    fn handle_page_fault(&mut self, old: Pte, table: PhysAddr, index: usize) -> Option<Pte> {
        let page = self.allocate_linear_page().ok()?;
        self.system.memstat_mut().reserved -= 1;
        let entry = Pte::new(page, old.without_reserved().flags());
        self.system.write_entry(table.addr() + index * 8, entry);
        log::trace!("page fault committed {page:#x}");
        Some(entry)
    }

    /// Translates a virtual address to its arena offset, or `None` if
    /// nothing is mapped there. Real mode bypasses the walk for the low
    /// 4 GiB.
    pub fn lookup_address(&mut self, v: VirtAddr) -> Option<PhysAddr> {
        if self.mode() != CpuMode::Real {
            let entry = self.find_pte(v.page_rounddown())?;
            let page = self.system.page_addr(entry)?;
            Some(page.byte_add(v.page_offset()))
        } else if (0..=0xffff_ffff).contains(&v.addr())
            && v.addr() as usize + 4095 < self.system.capacity()
        {
            Some(PhysAddr::new(v.addr() as usize))
        } else {
            None
        }
    }

    /// Identity translation for the linear-mapped configuration; the
    /// address's page must lie inside the arena.
    fn to_host(&self, v: VirtAddr) -> Option<PhysAddr> {
        let page = v.page_rounddown();
        (page.addr() >= 0 && page.addr() as usize + PAGE_SIZE <= self.system.capacity())
            .then(|| PhysAddr::new(v.addr() as usize))
    }

    pub fn get_address(&mut self, v: VirtAddr) -> Option<PhysAddr> {
        if self.system.has_linear_mapping() {
            return self.to_host(v);
        }
        self.lookup_address(v)
    }

    /// Translates or reports a segmentation fault carrying `v`.
    pub fn resolve_address(&mut self, v: VirtAddr) -> Result<PhysAddr, VmError> {
        self.get_address(v).ok_or(VmError::SegmentationFault(v))
    }

    /// Resolves an operand of `n <= 4096` bytes at `v`, splitting it into
    /// two page halves when it straddles a boundary.
    pub fn access_ram(&mut self, v: VirtAddr, n: usize) -> Result<RamAccess, VmError> {
        debug_assert!(n <= PAGE_SIZE);
        let off = v.page_offset();
        if off + n <= PAGE_SIZE {
            return Ok(RamAccess::Direct(self.resolve_address(v)?));
        }
        self.system.memstat_mut().page_overlaps += 1;
        let cut = PAGE_SIZE - off;
        let lo = self.resolve_address(v)?;
        let hi = self.resolve_address(v.byte_add(cut))?;
        Ok(RamAccess::Split { lo, hi, cut })
    }

    /// Reads `n` guest bytes at `v`, gathering split operands into `buf`.
    /// Contiguous operands borrow guest memory directly.
    pub fn load<'a>(
        &'a mut self,
        v: VirtAddr,
        n: usize,
        buf: &'a mut [u8],
    ) -> Result<&'a [u8], VmError> {
        self.set_read_addr(v, n as u32);
        match self.access_ram(v, n)? {
            RamAccess::Direct(pa) => Ok(self.system.bytes(pa, n)),
            RamAccess::Split { lo, hi, cut } => {
                buf[..cut].copy_from_slice(self.system.bytes(lo, cut));
                buf[cut..n].copy_from_slice(self.system.bytes(hi, n - cut));
                Ok(&buf[..n])
            }
        }
    }

    /// Opens a store of `n` bytes at `v`. The returned slice is where the
    /// operand gets written: guest memory itself when contiguous, `buf`
    /// when split. A split store must be finished with [`end_store`].
    ///
    /// [`end_store`]: Machine::end_store
    pub fn begin_store<'a>(
        &'a mut self,
        v: VirtAddr,
        n: usize,
        buf: &'a mut [u8],
    ) -> Result<(&'a mut [u8], RamAccess), VmError> {
        self.set_write_addr(v, n as u32);
        self.store_window(v, n, buf, false)
    }

    /// [`begin_store`] for a null-tolerant guest pointer: `v == 0` means
    /// no store at all.
    ///
    /// [`begin_store`]: Machine::begin_store
    pub fn begin_store_np<'a>(
        &'a mut self,
        v: VirtAddr,
        n: usize,
        buf: &'a mut [u8],
    ) -> Result<Option<(&'a mut [u8], RamAccess)>, VmError> {
        if v.is_null() {
            return Ok(None);
        }
        self.begin_store(v, n, buf).map(Some)
    }

    /// Opens a read-modify-write of `n` bytes at `v`: like
    /// [`begin_store`], but a split operand is pre-imaged from guest
    /// memory.
    ///
    /// [`begin_store`]: Machine::begin_store
    pub fn begin_load_store<'a>(
        &'a mut self,
        v: VirtAddr,
        n: usize,
        buf: &'a mut [u8],
    ) -> Result<(&'a mut [u8], RamAccess), VmError> {
        self.set_write_addr(v, n as u32);
        self.store_window(v, n, buf, true)
    }

    fn store_window<'a>(
        &'a mut self,
        v: VirtAddr,
        n: usize,
        buf: &'a mut [u8],
        copy: bool,
    ) -> Result<(&'a mut [u8], RamAccess), VmError> {
        let access = self.access_ram(v, n)?;
        match access {
            RamAccess::Direct(pa) => Ok((self.system.bytes_mut(pa, n), access)),
            RamAccess::Split { lo, hi, cut } => {
                if copy {
                    buf[..cut].copy_from_slice(self.system.bytes(lo, cut));
                    buf[cut..n].copy_from_slice(self.system.bytes(hi, n - cut));
                }
                Ok((&mut buf[..n], access))
            }
        }
    }

    /// Finishes a store opened by [`begin_store`]: iff the operand
    /// crossed a page boundary, scatters `b` back into the two halves.
    ///
    /// [`begin_store`]: Machine::begin_store
    pub fn end_store(&mut self, access: RamAccess, b: &[u8]) {
        if let RamAccess::Split { lo, hi, cut } = access {
            debug_assert!(cut < b.len());
            self.system.bytes_mut(lo, cut).copy_from_slice(&b[..cut]);
            self.system
                .bytes_mut(hi, b.len() - cut)
                .copy_from_slice(&b[cut..]);
        }
    }

    pub fn end_store_np(&mut self, access: Option<RamAccess>, b: &[u8]) {
        if let Some(access) = access {
            self.end_store(access, b);
        }
    }

    /// Gives the caller `n` bytes of guest memory at `v` that read and
    /// write as one contiguous span. A page-crossing operand is staged in
    /// the stash, pre-imaged with the current guest bytes, and must be
    /// mirrored back with [`commit_stash`] at instruction retire.
    ///
    /// [`commit_stash`]: Machine::commit_stash
    pub fn reserve_address(
        &mut self,
        v: VirtAddr,
        n: usize,
        writable: bool,
    ) -> Result<&mut [u8], VmError> {
        debug_assert!(n <= PAGE_SIZE);
        let off = v.page_offset();
        if off + n <= PAGE_SIZE {
            let pa = self.resolve_address(v)?;
            return Ok(self.system.bytes_mut(pa, n));
        }
        self.system.memstat_mut().page_overlaps += 1;
        let cut = PAGE_SIZE - off;
        let lo = self.resolve_address(v)?;
        let hi = self.resolve_address(v.byte_add(cut))?;
        self.stash_addr = v;
        self.opcache.stash_size = n;
        self.opcache.writable = writable;
        let (system, opcache) = (&self.system, &mut self.opcache);
        opcache.stash[..cut].copy_from_slice(system.bytes(lo, cut));
        opcache.stash[cut..n].copy_from_slice(system.bytes(hi, n - cut));
        Ok(&mut self.opcache.stash[..n])
    }

    /// Mirrors an in-flight writable stash back to guest memory and
    /// closes it. Called at instruction retire.
    pub fn commit_stash(&mut self) -> Result<(), VmError> {
        debug_assert!(!self.stash_addr.is_null());
        if self.opcache.writable {
            let n = self.opcache.stash_size;
            let stash = self.opcache.stash;
            self.copy_to_user(self.stash_addr, &stash[..n])?;
        }
        self.stash_addr = VirtAddr::new(0);
        Ok(())
    }

    /// Copies `dst.len()` guest bytes at `src` into `dst`, page by page.
    pub fn copy_from_user(&mut self, dst: &mut [u8], src: VirtAddr) -> Result<(), VmError> {
        let mut v = src;
        let mut i = 0;
        let mut k = PAGE_SIZE - v.page_offset();
        while i < dst.len() {
            k = k.min(dst.len() - i);
            let pa = self.resolve_address(v)?;
            dst[i..i + k].copy_from_slice(self.system.bytes(pa, k));
            i += k;
            v = v.byte_add(k);
            k = PAGE_SIZE;
        }
        Ok(())
    }

    /// [`copy_from_user`], also recording the tracer read window.
    ///
    /// [`copy_from_user`]: Machine::copy_from_user
    pub fn copy_from_user_read(&mut self, dst: &mut [u8], src: VirtAddr) -> Result<(), VmError> {
        let n = dst.len();
        self.copy_from_user(dst, src)?;
        self.set_read_addr(src, n as u32);
        Ok(())
    }

    /// Copies `src` into guest memory at `dst`, page by page.
    pub fn copy_to_user(&mut self, dst: VirtAddr, src: &[u8]) -> Result<(), VmError> {
        let mut v = dst;
        let mut i = 0;
        let mut k = PAGE_SIZE - v.page_offset();
        while i < src.len() {
            k = k.min(src.len() - i);
            let pa = self.resolve_address(v)?;
            self.system.bytes_mut(pa, k).copy_from_slice(&src[i..i + k]);
            i += k;
            v = v.byte_add(k);
            k = PAGE_SIZE;
        }
        Ok(())
    }

    /// [`copy_to_user`], also recording the tracer write window.
    ///
    /// [`copy_to_user`]: Machine::copy_to_user
    pub fn copy_to_user_write(&mut self, dst: VirtAddr, src: &[u8]) -> Result<(), VmError> {
        self.copy_to_user(dst, src)?;
        self.set_write_addr(dst, src.len() as u32);
        Ok(())
    }

    /// Reads the NUL-terminated guest string at `addr`.
    ///
    /// A string contained in one page is borrowed straight from guest
    /// memory; a page-crossing string is gathered into a heap copy that
    /// lives as long as the Machine.
    pub fn load_str(&mut self, addr: VirtAddr) -> Result<&CStr, VmError> {
        if addr.is_null() {
            return Err(VmError::Unmapped(addr));
        }
        let mut have = PAGE_SIZE - addr.page_offset();
        let page = self.lookup_address(addr).ok_or(VmError::Unmapped(addr))?;
        if let Some(i) = memchr::memchr(0, self.system.bytes(page, have)) {
            self.set_read_addr(addr, (i + 1) as u32);
            let bytes = self.system.bytes(page, i + 1);
            return Ok(CStr::from_bytes_with_nul(bytes).unwrap());
        }
        let mut copy = Vec::new();
        copy.extend_from_slice(self.system.bytes(page, have));
        loop {
            let next = addr.byte_add(have);
            let page = self.lookup_address(next).ok_or(VmError::Unmapped(next))?;
            let chunk = self.system.bytes(page, PAGE_SIZE);
            match memchr::memchr(0, chunk) {
                Some(i) => {
                    copy.extend_from_slice(&chunk[..=i]);
                    self.set_read_addr(addr, (have + i + 1) as u32);
                    self.freelist.push(CString::from_vec_with_nul(copy).unwrap());
                    return Ok(self.freelist.last().unwrap().as_c_str());
                }
                None => {
                    copy.extend_from_slice(chunk);
                    have += PAGE_SIZE;
                }
            }
        }
    }

    /// Reads an argv-style array of guest string pointers at `addr`,
    /// stopping at the zero word.
    pub fn load_str_list(&mut self, addr: VirtAddr) -> Result<Vec<CString>, VmError> {
        let mut list = Vec::new();
        let mut i = 0;
        loop {
            let mut word = [0; 8];
            self.copy_from_user_read(&mut word, addr.byte_add(i * 8))?;
            let ptr = u64::from_le_bytes(word);
            if ptr == 0 {
                break;
            }
            list.push(self.load_str(VirtAddr::new(ptr as i64))?.to_owned());
            i += 1;
        }
        Ok(list)
    }
}
