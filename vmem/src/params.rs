//! Compile-time tunables.

/// Number of TLB slots. Must be a power of two and a multiple of 8; the
/// first 16 slots are probed with one vector compare.
pub const TLB_ENTRIES: usize = 16;

/// Smallest capacity the arena grows to; later growth is by half steps.
pub(crate) const REAL_GROW_MIN: usize = 0x10000;

/// Capacity of the cross-page operand stash. One operand never exceeds a
/// page.
pub(crate) const STASH_SIZE: usize = 4096;
