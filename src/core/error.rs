// This module defines the error taxonomy of the emission engine using the thiserror crate.
// EmitError separates hard implementation limits (packed local-variable references that do
// not fit, too many instruction groups, branch distances beyond the largest encoding) from
// internal consistency violations (branches crossing funclets illegally, an encoder emitting
// more bytes than were provisioned, group offsets drifting, labels never bound) and from
// arena exhaustion. Encoder failures are carried through as EncodingError values. Every
// variant aborts the compilation of the current method; nothing in the engine retries.
// EmitResult<T> is the crate-wide convenience alias.

//! Error types for the emission engine.
//!
//! Using thiserror for the engine-level taxonomy.

use thiserror::Error;

use super::encoder::EncodingError;

/// Main error type for instruction emission.
#[derive(Error, Debug)]
pub enum EmitError {
    /// A hard implementation limit was exceeded.
    #[error("Implementation limit: {what}")]
    ImplLimit { what: String },

    /// More instruction groups than the group numbering can represent.
    #[error("Too many instruction groups (limit {limit})")]
    TooManyGroups { limit: u32 },

    /// A branch does not fit even the largest available encoding.
    #[error("Branch distance {distance} exceeds the largest encoding")]
    BranchOutOfRange { distance: i64 },

    /// A branch crosses a funclet boundary outside the sanctioned patterns.
    #[error("Illegal branch from funclet {from_func} to funclet {to_func}: {reason}")]
    IllegalFuncletBranch {
        from_func: u16,
        to_func: u16,
        reason: &'static str,
    },

    /// The encoder produced more bytes than were provisioned.
    #[error("Instruction {num} emitted {actual} bytes but only {provisioned} were provisioned")]
    SizeOverflow {
        num: u32,
        provisioned: u32,
        actual: u32,
    },

    /// A group's offset disagrees with the running emission offset.
    #[error("Group IG{num:02} expected at offset {expected:#x}, found {actual:#x}")]
    OffsetMismatch { num: u32, expected: u32, actual: u32 },

    /// A branch refers to a label that was never defined.
    #[error("Label L{label} is referenced but never defined")]
    UnboundLabel { label: u32 },

    /// A prolog/epilog exceeded the placeholder budget.
    #[error("Placeholder IG{num:02} needs {size} bytes, budget is {budget}")]
    PlaceholderOverflow { num: u32, size: u32, budget: u32 },

    /// Emission started while a placeholder is still pending.
    #[error("Placeholder IG{num:02} was never materialized")]
    UnmaterializedPlaceholder { num: u32 },

    /// Arena allocation failed.
    #[error("Out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    /// The per-architecture encoder rejected an instruction.
    #[error("Encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    /// Any other broken engine invariant.
    #[error("Internal emitter error: {reason}")]
    Internal { reason: String },
}

impl EmitError {
    /// Shorthand for an implementation-limit failure.
    pub fn impl_limit(what: impl Into<String>) -> Self {
        EmitError::ImplLimit { what: what.into() }
    }

    /// Shorthand for an internal consistency failure.
    pub fn internal(reason: impl Into<String>) -> Self {
        EmitError::Internal {
            reason: reason.into(),
        }
    }

    /// Whether this error is a hard implementation limit rather than a bug.
    pub fn is_impl_limit(&self) -> bool {
        matches!(
            self,
            EmitError::ImplLimit { .. }
                | EmitError::TooManyGroups { .. }
                | EmitError::BranchOutOfRange { .. }
        )
    }
}

/// Result type alias for emission operations.
pub type EmitResult<T> = Result<T, EmitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EmitError::SizeOverflow {
            num: 7,
            provisioned: 2,
            actual: 6,
        };
        assert_eq!(
            err.to_string(),
            "Instruction 7 emitted 6 bytes but only 2 were provisioned"
        );

        let err = EmitError::OffsetMismatch {
            num: 3,
            expected: 0x10,
            actual: 0x12,
        };
        assert_eq!(err.to_string(), "Group IG03 expected at offset 0x10, found 0x12");
    }

    #[test]
    fn test_impl_limit_classification() {
        assert!(EmitError::impl_limit("offset").is_impl_limit());
        assert!(EmitError::TooManyGroups { limit: 4 }.is_impl_limit());
        assert!(!EmitError::internal("bad").is_impl_limit());
        assert!(!EmitError::OutOfMemory { requested: 8 }.is_impl_limit());
    }

    #[test]
    fn test_encoding_error_conversion() {
        let err: EmitError = EncodingError::InvalidRegister.into();
        assert!(matches!(err, EmitError::Encoding(EncodingError::InvalidRegister)));
    }
}
