use bitflags::bitflags;

use super::PhysAddr;

bitflags! {
    /// Page-table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Valid bit. The walker never follows an entry without it.
        const V = 1 << 0;

        /// Writable bit.
        const RW = 1 << 1;

        /// User-accessible bit.
        const US = 1 << 2;

        /// Reservation pending: the range is claimed but the leaf has no
        /// backing page yet. Resolved by the demand pager on first touch.
        const RSRV = 1 << 9;

        /// The address field holds a host pointer, not an arena offset.
        const HOST = 1 << 10;

        /// Host-mapped page.
        const MAP = 1 << 11;

        /// Flags given to intermediate page tables.
        const INTERMEDIATE = Self::V.bits() | Self::RW.bits() | Self::US.bits();
    }
}

/// A 64-bit page-table entry: a physical address field in bits 12..47
/// plus [`PteFlags`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pte(u64);

impl Pte {
    /// Physical address field, bits 12..47.
    pub const ADDR_MASK: u64 = 0x0000_7fff_ffff_f000;

    pub fn new(addr: PhysAddr, flags: PteFlags) -> Self {
        debug_assert_eq!(addr.addr() as u64 & !Self::ADDR_MASK, 0, "addr={addr:#x}");
        Self(addr.addr() as u64 | flags.bits())
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_retain(self.0 & !Self::ADDR_MASK)
    }

    /// Arena offset of the page this entry points at.
    pub const fn phys_addr(self) -> PhysAddr {
        PhysAddr::new((self.0 & Self::ADDR_MASK) as usize)
    }

    pub const fn is_valid(self) -> bool {
        self.0 & PteFlags::V.bits() != 0
    }

    pub const fn is_reserved(self) -> bool {
        self.0 & PteFlags::RSRV.bits() != 0
    }

    pub const fn is_host(self) -> bool {
        self.0 & PteFlags::HOST.bits() != 0
    }

    pub const fn without_reserved(self) -> Self {
        Self(self.0 & !PteFlags::RSRV.bits())
    }
}
