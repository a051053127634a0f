//! Guest virtual memory subsystem of the ox86 emulator.
//!
//! Translates 48-bit guest virtual addresses into offsets of the guest
//! physical arena through a software-walked four-level page table,
//! caching recent translations in a small byte-tagged TLB. Pages are
//! reserved lazily and committed on first touch; operands that straddle a
//! page boundary are made to appear contiguous through a per-instruction
//! bounce buffer that is mirrored back to guest memory at retire.
//!
//! The instruction decoder, register file, and signal delivery are
//! external collaborators: this crate consumes the decoded operand's
//! effective-address mode plus a mirror of the relevant registers, and
//! reports faults as [`VmError`] values for the dispatch loop to turn
//! into guest signals.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub use self::{
    error::VmError,
    machine::{Machine, OpCache, Registers, TlbStats},
    memory::{MemStat, PAGE_SIZE, PAGE_SHIFT, PhysAddr, Pte, PteFlags, RamAccess, VirtAddr},
    segment::{CpuMode, Segment},
};

mod error;
mod machine;
pub mod memory;
mod params;
mod segment;
