use crate::memory::VirtAddr;

/// Errors reported by the guest memory subsystem.
///
/// The fatal kinds (`SegmentationFault`, `InvalidSegment`) correspond to
/// guest signals; raising them is the dispatch loop's business, this crate
/// only reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// The physical arena could not grow.
    #[error("out of guest memory")]
    OutOfMemory,
    /// Translation found no mapping: an absent page-table entry, a
    /// non-canonical address, or a real-mode access past the arena.
    #[error("unmapped guest address: {0:#x}")]
    Unmapped(VirtAddr),
    /// A required access could not be resolved; becomes a guest SIGSEGV.
    #[error("segmentation fault at {0:#x}")]
    SegmentationFault(VirtAddr),
    /// No unmapped hole large enough below the canonical boundary.
    #[error("guest address space exhausted")]
    AddressSpaceExhausted,
    /// Segment selector 6 or 7; becomes a guest #UD.
    #[error("invalid segment register {0}")]
    InvalidSegment(u8),
}
