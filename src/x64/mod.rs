//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Instruction encoding using iced-x86
//! - Register names used by listings and dumps
//! - rbp frame prolog/epilog generation

pub mod encoder;
pub mod frame;
pub mod regs;

pub use crate::core::encoder::EncodingError;
pub use encoder::X64Encoder;
pub use frame::StandardFrame;
