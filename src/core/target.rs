//! Target description consumed by the architecture-neutral engine.
//!
//! The engine never hard-codes encoding sizes: branch ranges, branch sizes,
//! the register conventions that matter to GC reporting and the pointer width
//! all come from a [`TargetInfo`].

use super::regs::{AsmReg, RegMask};

/// Encoding forms a variable-sized branch can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpForm {
    Short,
    Medium,
    Long,
}

/// Where a branch's displacement is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrcEncodingBase {
    /// End of the short encoding (x86: the displacement is relative to the
    /// next instruction, and the short form is what must fit).
    EndOfShort,
    /// A fixed distance past the instruction start (ARM: pc + 4).
    PcPlus(u32),
    /// The instruction start itself (ARM64).
    Start,
}

/// Distance range and size of one branch form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchRange {
    /// Largest positive distance this form reaches.
    pub max_pos: i64,
    /// Most negative distance this form reaches (a negative number).
    pub max_neg: i64,
    /// Size of a conditional branch in this form.
    pub cond_size: u32,
    /// Size of an unconditional branch in this form.
    pub uncond_size: u32,
}

/// Per-target branch encoding data used by relaxation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchLimits {
    pub short: BranchRange,
    /// Intermediate form, on targets that have one.
    pub medium: Option<BranchRange>,
    pub long: BranchRange,
    pub src_base: SrcEncodingBase,
}

impl BranchLimits {
    /// Size of a branch in the given form.
    pub fn size(&self, form: JumpForm, conditional: bool) -> u32 {
        let range = match form {
            JumpForm::Short => &self.short,
            JumpForm::Medium => self.medium.as_ref().unwrap_or(&self.long),
            JumpForm::Long => &self.long,
        };
        if conditional {
            range.cond_size
        } else {
            range.uncond_size
        }
    }

    /// Offset the displacement of a branch starting at `src` is relative to.
    pub fn src_encoding_offset(&self, src: u32, conditional: bool) -> u32 {
        match self.src_base {
            SrcEncodingBase::EndOfShort => src + self.size(JumpForm::Short, conditional),
            SrcEncodingBase::PcPlus(n) => src + n,
            SrcEncodingBase::Start => src,
        }
    }
}

/// Target facts the engine needs.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub name: &'static str,
    /// Pointer width in bytes; also the stack slot size.
    pub ptr_size: u32,
    pub branch: BranchLimits,
    /// Callee-saved registers in save order.
    pub callee_saved: Vec<AsmReg>,
    /// Integer return register.
    pub int_return: AsmReg,
    /// Whether methods keep a frame pointer. With one, only GC-typed argument
    /// pushes are interesting to the GC.
    pub has_frame_ptr: bool,
    /// Padding byte used between the hot and cold buffers.
    pub pad_byte: u8,
}

impl TargetInfo {
    /// x86-64 with a frame pointer.
    pub fn x64() -> Self {
        Self {
            name: "x86_64",
            ptr_size: 8,
            branch: BranchLimits {
                short: BranchRange {
                    max_pos: 127,
                    max_neg: -128,
                    cond_size: 2,
                    uncond_size: 2,
                },
                medium: None,
                long: BranchRange {
                    max_pos: i32::MAX as i64,
                    max_neg: i32::MIN as i64,
                    cond_size: 6,
                    uncond_size: 5,
                },
                src_base: SrcEncodingBase::EndOfShort,
            },
            // rbx, rbp, r12-r15 under System V.
            callee_saved: vec![
                AsmReg::gp(3),
                AsmReg::gp(5),
                AsmReg::gp(12),
                AsmReg::gp(13),
                AsmReg::gp(14),
                AsmReg::gp(15),
            ],
            int_return: AsmReg::gp(0),
            has_frame_ptr: true,
            pad_byte: 0xCC,
        }
    }

    /// Mask of all callee-saved registers.
    pub fn callee_saved_mask(&self) -> RegMask {
        RegMask::of(&self.callee_saved)
    }
}
