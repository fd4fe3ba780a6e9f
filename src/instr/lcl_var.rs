// Packed local-variable references. An instruction that addresses a stack slot names the
// frame slot (a local variable number, or a negative number for a compiler temporary) and a
// byte offset inside it. Both are squeezed into 32 bits: a 15-bit slot field, a 15-bit extra
// field and a 2-bit tag choosing one of four encodings by magnitude. References that fit none
// of them are an implementation limit and fail the method.

//! Local variable references packed into 32 bits.

use std::fmt;

use crate::core::error::{EmitError, EmitResult};

const FIELD_BITS: u32 = 15;
const FIELD_MASK: u32 = (1 << FIELD_BITS) - 1;
const TAG_SHIFT: u32 = 2 * FIELD_BITS;

/// Largest slot number reachable through the large-slot encoding (exclusive).
pub const MAX_LARGE_VARNUM: i32 = 1 << 22;

/// Which of the four packings a reference uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LclVarTag {
    /// Slot 0..32767, offset 0..32767.
    Standard = 0,
    /// Slot 0..32767, offset 32768..65535 (stored minus 32768).
    LargeOffset = 1,
    /// Compiler temporary -32767..-1 (stored negated), offset 0..32767.
    CompilerTemp = 2,
    /// Slot 32768..2^22-1, offset 0..255.
    LargeVarNum = 3,
}

/// A `{slot, offset}` pair in one of the four packed encodings.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LclVarAddr(u32);

impl LclVarAddr {
    /// Pack a reference, choosing the encoding from the magnitudes.
    pub fn new(var_num: i32, offset: u32) -> EmitResult<Self> {
        let (tag, var_field, extra) = if (0..32768).contains(&var_num) {
            if offset < 32768 {
                (LclVarTag::Standard, var_num as u32, offset)
            } else if offset < 65536 {
                (LclVarTag::LargeOffset, var_num as u32, offset - 32768)
            } else {
                return Err(EmitError::impl_limit(format!(
                    "JIT cannot handle offset {offset} into local V{var_num:02}"
                )));
            }
        } else if (-32767..0).contains(&var_num) {
            if offset >= 32768 {
                return Err(EmitError::impl_limit(format!(
                    "JIT cannot handle offset {offset} into temp T{}",
                    -var_num
                )));
            }
            (LclVarTag::CompilerTemp, (-var_num) as u32, offset)
        } else if (32768..MAX_LARGE_VARNUM).contains(&var_num) {
            if offset >= 256 {
                return Err(EmitError::impl_limit(format!(
                    "JIT cannot handle offset {offset} into large local V{var_num}"
                )));
            }
            let var = var_num as u32;
            (
                LclVarTag::LargeVarNum,
                var & FIELD_MASK,
                ((var & 0x3F_8000) >> FIELD_BITS) | (offset << 7),
            )
        } else {
            return Err(EmitError::impl_limit(format!(
                "JIT cannot handle local variable number {var_num}"
            )));
        };

        Ok(Self(
            var_field | (extra << FIELD_BITS) | ((tag as u32) << TAG_SHIFT),
        ))
    }

    pub fn tag(&self) -> LclVarTag {
        match self.0 >> TAG_SHIFT {
            0 => LclVarTag::Standard,
            1 => LclVarTag::LargeOffset,
            2 => LclVarTag::CompilerTemp,
            _ => LclVarTag::LargeVarNum,
        }
    }

    fn var_field(&self) -> u32 {
        self.0 & FIELD_MASK
    }

    fn extra(&self) -> u32 {
        (self.0 >> FIELD_BITS) & FIELD_MASK
    }

    /// Slot number; negative for compiler temporaries.
    pub fn var_num(&self) -> i32 {
        match self.tag() {
            LclVarTag::Standard | LclVarTag::LargeOffset => self.var_field() as i32,
            LclVarTag::CompilerTemp => -(self.var_field() as i32),
            LclVarTag::LargeVarNum => (((self.extra() & 0x7F) << FIELD_BITS) + self.var_field()) as i32,
        }
    }

    /// Byte offset inside the slot.
    pub fn offset(&self) -> u32 {
        match self.tag() {
            LclVarTag::Standard | LclVarTag::CompilerTemp => self.extra(),
            LclVarTag::LargeOffset => self.extra() + 32768,
            LclVarTag::LargeVarNum => (self.extra() & 0x7F80) >> 7,
        }
    }

    /// Whether this names a compiler temporary rather than a local.
    pub fn is_temp(&self) -> bool {
        self.tag() == LclVarTag::CompilerTemp
    }

    /// The packed representation.
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for LclVarAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let var = self.var_num();
        if var < 0 {
            write!(f, "T{:02}", -var)?;
        } else {
            write!(f, "V{:02}", var)?;
        }
        match self.offset() {
            0 => Ok(()),
            offs => write!(f, "+{offs:#x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_encoding() {
        let lv = LclVarAddr::new(12, 24).unwrap();
        assert_eq!(lv.tag(), LclVarTag::Standard);
        assert_eq!((lv.var_num(), lv.offset()), (12, 24));
    }

    #[test]
    fn test_large_offset_encoding() {
        let lv = LclVarAddr::new(5, 40000).unwrap();
        assert_eq!(lv.tag(), LclVarTag::LargeOffset);
        assert_eq!((lv.var_num(), lv.offset()), (5, 40000));

        let edge = LclVarAddr::new(32767, 65535).unwrap();
        assert_eq!((edge.var_num(), edge.offset()), (32767, 65535));
    }

    #[test]
    fn test_offset_beyond_large_offset_fails() {
        let err = LclVarAddr::new(5, 65536).unwrap_err();
        assert!(err.is_impl_limit());
    }

    #[test]
    fn test_compiler_temp_encoding() {
        let lv = LclVarAddr::new(-3, 16).unwrap();
        assert_eq!(lv.tag(), LclVarTag::CompilerTemp);
        assert!(lv.is_temp());
        assert_eq!((lv.var_num(), lv.offset()), (-3, 16));
        assert_eq!(format!("{lv:?}"), "T03+0x10");

        assert!(LclVarAddr::new(-32768, 0).is_err());
        assert!(LclVarAddr::new(-1, 32768).is_err());
    }

    #[test]
    fn test_large_varnum_encoding() {
        let lv = LclVarAddr::new(40000, 10).unwrap();
        assert_eq!(lv.tag(), LclVarTag::LargeVarNum);
        assert_eq!((lv.var_num(), lv.offset()), (40000, 10));

        let top = LclVarAddr::new(MAX_LARGE_VARNUM - 1, 255).unwrap();
        assert_eq!((top.var_num(), top.offset()), (MAX_LARGE_VARNUM - 1, 255));

        assert!(LclVarAddr::new(40000, 256).is_err());
        assert!(LclVarAddr::new(MAX_LARGE_VARNUM, 0).is_err());
    }
}
