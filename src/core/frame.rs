//! Stack frame layout as seen by the emitter.
//!
//! The register allocator decides where every local and temporary lives; the
//! emitter only needs the frame offsets to encode stack operands and the list
//! of GC-tracked slots to report their lifetimes.

use hashbrown::HashMap;

use super::regs::AsmReg;
use crate::instr::desc::GcKind;
use crate::instr::lcl_var::LclVarAddr;

/// A stack slot whose GC lifetime is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedVar {
    pub var_num: i32,
    pub frame_offset: i32,
    pub kind: GcKind,
    /// The method's `this` pointer.
    pub is_this: bool,
}

/// Frame offsets of locals and temporaries.
#[derive(Debug, Clone)]
pub struct FrameLayout {
    /// Register stack operands are addressed from.
    pub frame_reg: AsmReg,
    offsets: HashMap<i32, i32>,
    tracked: Vec<TrackedVar>,
}

impl FrameLayout {
    pub fn new(frame_reg: AsmReg) -> Self {
        Self {
            frame_reg,
            offsets: HashMap::new(),
            tracked: Vec::new(),
        }
    }

    /// Place a local (or a temporary, with a negative number) at `offset`.
    pub fn set_var_offset(&mut self, var_num: i32, offset: i32) {
        self.offsets.insert(var_num, offset);
    }

    /// Register a GC-tracked slot; its index is the bit used in live-variable sets.
    pub fn track_gc_var(&mut self, var_num: i32, offset: i32, kind: GcKind, is_this: bool) -> u32 {
        self.set_var_offset(var_num, offset);
        self.tracked.push(TrackedVar {
            var_num,
            frame_offset: offset,
            kind,
            is_this,
        });
        (self.tracked.len() - 1) as u32
    }

    /// Frame offset of a slot reference.
    pub fn frame_offset(&self, lv: LclVarAddr) -> Option<i32> {
        self.offsets
            .get(&lv.var_num())
            .map(|base| base + lv.offset() as i32)
    }

    pub fn tracked(&self) -> &[TrackedVar] {
        &self.tracked
    }

    pub fn tracked_var(&self, index: u32) -> Option<&TrackedVar> {
        self.tracked.get(index as usize)
    }

    /// Tracked slot living at exactly `offset`.
    pub fn tracked_at(&self, offset: i32) -> Option<(u32, &TrackedVar)> {
        self.tracked
            .iter()
            .enumerate()
            .find(|(_, v)| v.frame_offset == offset)
            .map(|(i, v)| (i as u32, v))
    }

    /// Lowest and highest tracked frame offsets.
    pub fn tracked_range(&self) -> Option<(i32, i32)> {
        let min = self.tracked.iter().map(|v| v.frame_offset).min()?;
        let max = self.tracked.iter().map(|v| v.frame_offset).max()?;
        Some((min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_offsets() {
        let mut frame = FrameLayout::new(AsmReg::gp(5));
        frame.set_var_offset(3, -16);
        frame.set_var_offset(-1, -40);

        let lv = LclVarAddr::new(3, 8).unwrap();
        assert_eq!(frame.frame_offset(lv), Some(-8));
        let tmp = LclVarAddr::new(-1, 0).unwrap();
        assert_eq!(frame.frame_offset(tmp), Some(-40));
        assert_eq!(frame.frame_offset(LclVarAddr::new(9, 0).unwrap()), None);
    }

    #[test]
    fn test_tracked_vars() {
        let mut frame = FrameLayout::new(AsmReg::gp(5));
        assert_eq!(frame.tracked_range(), None);
        let a = frame.track_gc_var(0, -8, GcKind::GcRef, true);
        let b = frame.track_gc_var(1, -24, GcKind::ByRef, false);
        assert_eq!((a, b), (0, 1));
        assert_eq!(frame.tracked_range(), Some((-24, -8)));
        assert_eq!(frame.tracked_at(-24).map(|(i, _)| i), Some(1));
        assert!(frame.tracked_var(0).is_some_and(|v| v.is_this));
    }
}
