// This module is the shared infrastructure of the emission engine, independent of any
// instruction group or encoding detail. It exports the session (arena-based memory and
// statistics), register identifiers and masks, the bit set of tracked GC variables, the target
// description consumed by branch relaxation, the emitter configuration with its environment
// overrides, the encoder seam between the engine and an architecture, frame layout, the code
// allocator the final buffers come from, the funclet table and the error taxonomy.

//! Core emission infrastructure.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based memory allocation using `bumpalo`
//! - Emission statistics
//!
//! ## Registers and GC sets (`regs`, `varset`)
//! - Register identifiers and register masks
//! - Growable bit sets of tracked stack variables
//!
//! ## Target and encoder seam (`target`, `encoder`)
//! - Branch ranges and sizes, register conventions
//! - The `InstrEncoder` trait and relocation records
//!
//! ## Method shape (`frame`, `funclet`, `code_alloc`)
//! - Frame offsets of locals and GC-tracked slots
//! - Funclets and exception-handling regions
//! - Allocation of the final hot, cold and data buffers

pub mod code_alloc;
pub mod config;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod funclet;
pub mod regs;
pub mod session;
pub mod target;
pub mod test_utils;
pub mod varset;

pub use code_alloc::{CodeAllocator, CodeBlocks, CodeRequest, HeapCodeAllocator};
pub use config::EmitterConfig;
pub use encoder::{
    EncodeContext, EncodingError, InstrEncoder, JumpSite, RelocKind, RelocTarget, Relocation, Section,
};
pub use error::{EmitError, EmitResult};
pub use frame::{FrameLayout, TrackedVar};
pub use funclet::{EhRegion, FuncInfo, FuncKind, FuncletTable, HandlerKind};
pub use regs::{AsmReg, RegMask};
pub use session::{CompilationSession, SessionStats};
pub use target::{BranchLimits, BranchRange, JumpForm, SrcEncodingBase, TargetInfo};
pub use varset::VarSet;
