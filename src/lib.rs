//! igemit - instruction emission for a native-code compiler back end.
//!
//! The emitter sits between instruction selection and the final code buffer.
//! It packs each machine instruction into a compact arena-allocated record,
//! collects records into instruction groups that carry their GC entry state,
//! leaves room for prologs and epilogs that are generated out of order,
//! relaxes branches to their shortest legal encoding and finally serializes
//! everything into hot and cold code plus a read-only data section, recording
//! precise GC liveness along the way.
//!
//! # Primary Usage
//!
//! ```ignore
//! use igemit::core::{CompilationSession, EmitterConfig, HeapCodeAllocator, TargetInfo};
//! use igemit::emit::Emitter;
//! use igemit::x64::{StandardFrame, X64Encoder};
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let mut em = Emitter::new(&session, X64Encoder::new(), TargetInfo::x64(), EmitterConfig::default())?;
//! em.ins(Ins::Ret, EmitAttr::B8)?;
//! em.generate_prolog_epilog(&mut StandardFrame::new(0))?;
//! let output = em.end_code_gen(&mut HeapCodeAllocator::new(), &frame)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Shared infrastructure (session, registers, target, encoder seam)
//! - [`instr`] - Instruction records and their allocator
//! - [`emit`] - Groups, placeholders, relaxation, data section and the issue pass
//! - [`gc`] - GC liveness tracking and the emitted GC tables
//! - [`x64`] - x86-64 encoder and frame generator
//! - [`listing`] - Textual method listings driven through the whole pipeline
//! - [`elf`] - Emitted methods as ELF relocatable objects

pub mod core;
pub mod elf;
pub mod emit;
pub mod gc;
pub mod instr;
pub mod listing;
pub mod x64;

pub use core::{
    CompilationSession, EmitError, EmitResult, EmitterConfig, HeapCodeAllocator, InstrEncoder,
    SessionStats, TargetInfo,
};
pub use emit::{EmitOutput, Emitter, Label, PlaceholderKind, PrologEpilogGenerator};
pub use gc::GcState;
pub use instr::{EmitAttr, Ins};
pub use listing::{emit_listing, emit_text, parse_listing, EmittedMethod, ListingError};
