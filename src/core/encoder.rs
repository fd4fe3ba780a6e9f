// The seam between the architecture-neutral engine and a per-architecture encoder. The engine
// asks the encoder three things: how many bytes a record will need at most (used while groups
// are built and during branch relaxation), the actual bytes of a record at its final offset,
// and the bytes of a branch in a chosen form. Relocations produced while encoding are reported
// back with offsets relative to the instruction start; the engine rebases them onto the
// buffer they land in. Forward branches are encoded against a provisional target and may be
// patched afterwards through patch_jump, whose default rewrites a little-endian displacement.

//! Instruction encoder interface.

use super::frame::FrameLayout;
use super::target::{JumpForm, TargetInfo};
use crate::instr::desc::InstrDesc;

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Invalid register for the requested operation.
    InvalidRegister,
    /// Unsupported instruction or operand combination.
    UnsupportedInstruction,
    /// Error reported by the underlying assembler.
    AssemblyError(String),
    /// Memory operand construction failed.
    InvalidMemoryOperand,
    /// A displacement patch does not fit the encoded instruction.
    InvalidPatch,
    /// Branch displacement does not fit the chosen form.
    DisplacementOutOfRange(i64),
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidRegister => write!(f, "Invalid register for operation"),
            EncodingError::UnsupportedInstruction => {
                write!(f, "Unsupported instruction or operand combination")
            }
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
            EncodingError::InvalidMemoryOperand => write!(f, "Invalid memory operand"),
            EncodingError::InvalidPatch => write!(f, "Invalid displacement patch"),
            EncodingError::DisplacementOutOfRange(d) => {
                write!(f, "Displacement {d} out of range for the chosen form")
            }
        }
    }
}

impl std::error::Error for EncodingError {}

/// How a relocated field is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// 32-bit pc-relative code reference (calls, cross-region branches).
    Rel32,
    /// 32-bit rip-relative data reference.
    RipRel32,
    /// 64-bit absolute address.
    Abs64,
}

impl RelocKind {
    /// Width of the relocated field in bytes.
    pub fn width(&self) -> u32 {
        match self {
            RelocKind::Rel32 | RelocKind::RipRel32 => 4,
            RelocKind::Abs64 => 8,
        }
    }
}

/// What a relocation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocTarget {
    /// Code offset in the method (hot and cold share one offset space).
    Code(u32),
    /// Offset into the method's data section.
    Data(u32),
    /// External method handle.
    Method(u32),
}

/// Buffer a relocation lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Hot,
    Cold,
    Data,
}

/// A relocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub section: Section,
    /// Offset of the field inside its section (inside the instruction while encoding).
    pub offset: u32,
    pub kind: RelocKind,
    pub target: RelocTarget,
    /// Constant added to the target; pc-relative kinds carry the field-end bias.
    pub addend: i64,
}

/// Where a branch displacement sits, relative to the instruction start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpSite {
    pub disp_offset: u32,
    pub width: u8,
}

/// Facts available to the encoder for the record being encoded.
pub struct EncodeContext<'c> {
    /// Code offset of the instruction.
    pub offset: u32,
    pub target: &'c TargetInfo,
    /// Final frame layout; `None` while sizes are being estimated.
    pub frame: Option<&'c FrameLayout>,
}

/// A per-architecture instruction encoder.
pub trait InstrEncoder {
    /// Upper bound on the bytes `desc` will occupy.
    fn estimate_size(&self, desc: &InstrDesc<'_>, target: &TargetInfo) -> Result<u32, EncodingError>;

    /// Append the bytes of `desc` to `out`, returning relocations relative
    /// to the instruction start.
    fn encode(
        &mut self,
        desc: &InstrDesc<'_>,
        ctx: &EncodeContext<'_>,
        out: &mut Vec<u8>,
    ) -> Result<Vec<Relocation>, EncodingError>;

    /// Append a label-targeted record (branch, local call or label load) in
    /// `form`, with its displacement computed from `dst`.
    fn encode_jump(
        &mut self,
        desc: &InstrDesc<'_>,
        form: JumpForm,
        src: u32,
        dst: u32,
        out: &mut Vec<u8>,
    ) -> Result<JumpSite, EncodingError>;

    /// Add `adjust` to an already written displacement.
    fn patch_jump(&self, code: &mut [u8], site_offset: usize, width: u8, adjust: i64) -> Result<(), EncodingError> {
        let end = site_offset + width as usize;
        let field = code
            .get_mut(site_offset..end)
            .ok_or(EncodingError::InvalidPatch)?;
        match width {
            1 => {
                let value = field[0] as i8 as i64 + adjust;
                let value = i8::try_from(value).map_err(|_| EncodingError::DisplacementOutOfRange(value))?;
                field[0] = value as u8;
            }
            4 => {
                let old = i32::from_le_bytes([field[0], field[1], field[2], field[3]]) as i64;
                let value = i32::try_from(old + adjust)
                    .map_err(|_| EncodingError::DisplacementOutOfRange(old + adjust))?;
                field.copy_from_slice(&value.to_le_bytes());
            }
            _ => return Err(EncodingError::InvalidPatch),
        }
        Ok(())
    }
}
