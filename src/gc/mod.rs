//! Precise GC liveness.
//!
//! At codegen time the emitter keeps [`GcState`] snapshots (live tracked
//! variables plus the GC reference and interior-pointer register masks) and
//! stores them on instruction groups. At issue time the [`GcTracker`] turns
//! those snapshots and per-instruction effects into the records of
//! [`GcInfo`], keyed by exact code offsets.

pub mod records;
pub mod tracker;

pub use records::{
    CallSiteRecord, GcEvent, GcInfo, LiveSet, LivenessRecord, PendingArgs, StackMode, VarLifetime,
};
pub use tracker::GcTracker;

use crate::core::regs::RegMask;
use crate::core::varset::VarSet;

/// Live GC state at a point in the instruction stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcState {
    /// Live tracked stack variables.
    pub vars: VarSet,
    /// Registers holding object references.
    pub gcref: RegMask,
    /// Registers holding interior pointers.
    pub byref: RegMask,
}

impl GcState {
    pub fn new(vars: VarSet, gcref: RegMask, byref: RegMask) -> Self {
        Self { vars, gcref, byref }
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty() && self.gcref.is_empty() && self.byref.is_empty()
    }
}
