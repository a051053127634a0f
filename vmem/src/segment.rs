use strum::FromRepr;

use crate::{error::VmError, machine::Machine, memory::VirtAddr};

/// CPU operating mode, which doubles as the effective-address mode of a
/// decoded operand. Dictates the width at which the string index
/// registers are read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CpuMode {
    /// 16-bit real mode.
    Real,
    /// 32-bit legacy / compatibility mode.
    Legacy,
    /// 64-bit long mode.
    #[default]
    Long,
}

/// Segment register selector as encoded in instruction bytes. Encodings
/// 6 and 7 do not name a segment and raise #UD at the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum Segment {
    Es = 0,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

impl Machine {
    /// Base of the segment register selected by the low three bits of
    /// `s`.
    pub fn get_segment(&self, s: u8) -> Result<u64, VmError> {
        let seg = Segment::from_repr(s & 7).ok_or(VmError::InvalidSegment(s & 7))?;
        Ok(match seg {
            Segment::Es => self.regs().es,
            Segment::Cs => self.regs().cs,
            Segment::Ss => self.regs().ss,
            Segment::Ds => self.regs().ds,
            Segment::Fs => self.regs().fs,
            Segment::Gs => self.regs().gs,
        })
    }

    /// Folds an offset into a segment base. Outside long mode the
    /// effective address wraps to 32 bits.
    pub fn add_segment(&self, eamode: CpuMode, offset: u64, seg: u64) -> VirtAddr {
        let v = seg.wrapping_add(offset);
        match eamode {
            CpuMode::Long => VirtAddr::new(v as i64),
            CpuMode::Legacy | CpuMode::Real => VirtAddr::new((v & 0xffff_ffff) as i64),
        }
    }

    /// Moffs-style absolute operand: the instruction displacement against
    /// DS.
    pub fn address_ob(&self, eamode: CpuMode) -> VirtAddr {
        self.add_segment(eamode, self.regs().disp as u64, self.regs().ds)
    }

    /// Offset `i` against DS.
    pub fn data_segment(&self, eamode: CpuMode, i: u64) -> VirtAddr {
        self.add_segment(eamode, i, self.regs().ds)
    }

    /// Source address of a string op: SI against DS, read at the mode's
    /// width.
    pub fn address_si(&self, eamode: CpuMode) -> VirtAddr {
        let si = self.regs().si;
        match eamode {
            CpuMode::Long => self.data_segment(eamode, si),
            CpuMode::Legacy => self.data_segment(eamode, si & 0xffff_ffff),
            CpuMode::Real => self.data_segment(eamode, si & 0xffff),
        }
    }

    /// Destination address of a string op: DI against the raw ES base,
    /// never any override.
    pub fn address_di(&self, eamode: CpuMode) -> VirtAddr {
        let base = self.regs().es;
        let di = match eamode {
            CpuMode::Long => self.regs().di,
            CpuMode::Legacy => self.regs().di & 0xffff_ffff,
            CpuMode::Real => self.regs().di & 0xffff,
        };
        VirtAddr::new(base.wrapping_add(di) as i64)
    }
}
