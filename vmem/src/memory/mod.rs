pub use self::{
    addr::{PageRound, PhysAddr, VirtAddr},
    pte::{Pte, PteFlags},
    real::{MemStat, System},
    vm::RamAccess,
};

/// Bytes per page
pub const PAGE_SIZE: usize = 4096;

/// Bits of offset within a page
pub const PAGE_SHIFT: usize = 12;

mod addr;
mod pte;
mod real;
mod region;
pub(crate) mod tlb;
mod vm;
