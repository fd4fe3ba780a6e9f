// This module provides arena-based session management for the emission engine using the
// bumpalo crate. CompilationSession owns a borrowed arena and the statistics of every method
// emitted through it. Instruction groups, their permanent instruction records and their GC
// snapshots are all allocated from the session arena and share its lifetime, so a method's
// whole emission state is released at once when the arena is dropped. Permanent allocations
// go through the fallible try_alloc_slice_copy path so that an arena allocation limit turns
// into EmitError::OutOfMemory instead of aborting the process. SessionStats tracks methods
// emitted, instruction records by variant, groups created, relaxation passes, branches
// shortened and total code bytes, and renders them through Display.

//! Arena-based compilation session management.
//!
//! All emission objects of a method are tied to the session lifetime. The
//! arena is the only deallocation mechanism: nothing is freed individually.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

use super::error::{EmitError, EmitResult};

/// Arena-based compilation session.
///
/// One session can serve several methods in sequence; each method gets its
/// own [`crate::emit::Emitter`] borrowing the session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for emission objects.
    arena: &'arena Bump,

    /// Session statistics for debugging and tuning.
    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Create a session whose arena refuses to grow past `limit` bytes.
    pub fn with_limit(arena: &'arena Bump, limit: Option<usize>) -> Self {
        arena.set_allocation_limit(limit);
        Self::new(arena)
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate an object in the session arena.
    pub fn alloc<T>(&self, value: T) -> &'arena mut T {
        self.arena.alloc(value)
    }

    /// Copy a slice into the arena, reporting exhaustion as an error.
    pub fn try_alloc_slice_copy<T: Copy>(&self, items: &[T]) -> EmitResult<&'arena mut [T]> {
        let mut storage = bumpalo::collections::Vec::new_in(self.arena);
        storage
            .try_reserve_exact(items.len())
            .map_err(|_| EmitError::OutOfMemory {
                requested: std::mem::size_of_val(items),
            })?;
        storage.extend_from_slice(items);
        Ok(storage.into_bump_slice_mut())
    }

    /// Bytes currently allocated from the arena.
    pub fn allocated_bytes(&self) -> usize {
        self.arena.allocated_bytes()
    }

    /// Record that a method finished emission.
    pub fn record_method_emitted(&self, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.methods_emitted += 1;
        stats.total_code_size += code_size;
        stats.largest_method_size = stats.largest_method_size.max(code_size);
    }

    /// Record an instruction record of the given variant.
    pub fn record_instruction(&self, variant: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_emitted += 1;
        *stats.variant_counts.entry(variant).or_insert(0) += 1;
    }

    /// Record that an instruction group was closed.
    pub fn record_group_created(&self) {
        self.stats.borrow_mut().groups_created += 1;
    }

    /// Record the outcome of one branch relaxation run.
    pub fn record_relaxation(&self, passes: usize, shortened: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.relaxation_passes += passes;
        stats.branches_shortened += shortened;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of methods emitted.
    pub methods_emitted: usize,

    /// Total code size generated (bytes).
    pub total_code_size: usize,

    /// Largest method emitted (bytes).
    pub largest_method_size: usize,

    /// Number of instruction records allocated.
    pub instructions_emitted: usize,

    /// Count of instruction records by payload variant.
    pub variant_counts: HashMap<&'static str, usize>,

    /// Instruction groups closed.
    pub groups_created: usize,

    /// Branch relaxation passes run.
    pub relaxation_passes: usize,

    /// Branches shrunk to a smaller encoding.
    pub branches_shortened: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Emission Session Statistics:")?;
        writeln!(f, "  Methods emitted: {}", self.methods_emitted)?;
        writeln!(f, "  Instructions emitted: {}", self.instructions_emitted)?;
        writeln!(f, "  Instruction groups: {}", self.groups_created)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Largest method: {} bytes", self.largest_method_size)?;
        writeln!(f, "  Relaxation passes: {}", self.relaxation_passes)?;
        writeln!(f, "  Branches shortened: {}", self.branches_shortened)?;

        if !self.variant_counts.is_empty() {
            writeln!(f, "  Record variants:")?;
            let mut sorted: Vec<_> = self.variant_counts.iter().collect();
            sorted.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), **name));

            for (variant, count) in sorted {
                writeln!(f, "    {}: {}", variant, count)?;
            }
        }

        Ok(())
    }
}
