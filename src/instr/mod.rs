//! Instruction records.
//!
//! - [`desc`]: the record types and their payload variants
//! - [`lcl_var`]: packed local-variable references
//! - [`alloc`]: variant selection and record numbering

pub mod alloc;
pub mod desc;
pub mod lcl_var;

#[cfg(feature = "debug-info")]
pub use alloc::InstrDebugInfo;
pub use alloc::InstrAllocator;
pub use desc::{
    AddrMode, AddrOperand, CallInfo, CallTarget, Cond, EmitAttr, ExtRegs, GcKind, Ins, InsFormat,
    InstrDesc, JumpInfo, JumpTarget, OpSize, Payload,
};
pub use lcl_var::{LclVarAddr, LclVarTag};
