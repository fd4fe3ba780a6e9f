// Issue-time GC liveness tracking. The emission pass drives a GcTracker with the exact code
// offset of every event: group snapshots (live registers and variables at group entry), the
// GC effects of each encoded instruction, argument pushes and pops, and call sites. In fully
// interruptible methods every register transition becomes a record; in partially
// interruptible methods only call sites are recorded, each carrying the callee-saved GC
// registers and the pending GC argument slots. Tracked stack variables are reported as
// lifetimes keyed by frame offset. The argument stack uses inline bitmasks when the method
// is partially interruptible and shallow, an explicit per-slot table otherwise.

//! Issue-time GC liveness tracker.

use log::trace;

use super::records::{
    CallSiteRecord, GcEvent, GcInfo, LivenessRecord, PendingArgs, StackMode, VarLifetime,
};
use crate::core::error::{EmitError, EmitResult};
use crate::core::frame::{FrameLayout, TrackedVar};
use crate::core::regs::{AsmReg, RegMask};
use crate::core::target::TargetInfo;
use crate::core::varset::VarSet;
use crate::instr::desc::GcKind;

/// Running GC state of the emission pass.
pub struct GcTracker {
    fully_interruptible: bool,
    stack_mode: StackMode,
    has_frame_ptr: bool,
    ptr_size: u32,
    callee_saved: RegMask,

    gcref_regs: RegMask,
    byref_regs: RegMask,
    in_epilog: bool,

    tracked: Vec<TrackedVar>,
    var_min: i32,
    /// Open lifetime (index into `lifetimes`) per frame slot.
    var_table: Vec<Option<usize>>,
    /// Variable set last applied from a snapshot.
    live_vars: VarSet,
    /// `false` once an individual store changed a variable behind the snapshot.
    vars_accurate: bool,

    stack_level: u32,
    simple_gcref: u32,
    simple_byref: u32,
    arg_table: Vec<GcKind>,

    records: Vec<LivenessRecord>,
    lifetimes: Vec<VarLifetime>,
    call_sites: Vec<CallSiteRecord>,
    no_gc_regions: Vec<(u32, u32)>,
}

impl GcTracker {
    pub fn new(
        target: &TargetInfo,
        frame: &FrameLayout,
        fully_interruptible: bool,
        stack_mode: StackMode,
    ) -> Self {
        let ptr_size = target.ptr_size;
        let (var_min, var_max) = frame.tracked_range().unwrap_or((0, -(ptr_size as i32)));
        let slots = if var_max >= var_min {
            ((var_max - var_min) as u32 / ptr_size + 1) as usize
        } else {
            0
        };
        Self {
            fully_interruptible,
            stack_mode,
            has_frame_ptr: target.has_frame_ptr,
            ptr_size,
            callee_saved: target.callee_saved_mask(),
            gcref_regs: RegMask::NONE,
            byref_regs: RegMask::NONE,
            in_epilog: false,
            tracked: frame.tracked().to_vec(),
            var_min,
            var_table: vec![None; slots],
            live_vars: VarSet::default(),
            vars_accurate: true,
            stack_level: 0,
            simple_gcref: 0,
            simple_byref: 0,
            arg_table: Vec::new(),
            records: Vec::new(),
            lifetimes: Vec::new(),
            call_sites: Vec::new(),
            no_gc_regions: Vec::new(),
        }
    }

    pub fn gcref_regs(&self) -> RegMask {
        self.gcref_regs
    }

    pub fn byref_regs(&self) -> RegMask {
        self.byref_regs
    }

    pub fn stack_level(&self) -> u32 {
        self.stack_level
    }

    pub fn stack_mode(&self) -> StackMode {
        self.stack_mode
    }

    /// Epilog code cannot change liveness meaningfully; transitions inside
    /// it update state without producing records.
    pub fn set_in_epilog(&mut self, in_epilog: bool) {
        self.in_epilog = in_epilog;
    }

    fn reports_regs(&self) -> bool {
        self.fully_interruptible && !self.in_epilog
    }

    fn push_record(&mut self, offset: u32, event: GcEvent) {
        trace!("gc {offset:04X}: {event:?}");
        self.records.push(LivenessRecord { offset, event });
    }

    // ---- registers ----

    /// Replace the live set of one GC kind.
    pub fn update_live_regs(&mut self, kind: GcKind, mask: RegMask, offset: u32) {
        let current = match kind {
            GcKind::GcRef => self.gcref_regs,
            GcKind::ByRef => self.byref_regs,
            GcKind::None => return,
        };
        if current == mask {
            return;
        }

        if self.reports_regs() {
            for reg in (current & !mask).iter() {
                self.push_record(offset, GcEvent::RegDead { reg });
            }
            for reg in (mask & !current).iter() {
                self.push_record(offset, GcEvent::RegLive { reg, kind });
            }
        }

        match kind {
            GcKind::GcRef => {
                self.gcref_regs = mask;
                self.byref_regs &= !mask;
            }
            _ => {
                self.byref_regs = mask;
                self.gcref_regs &= !mask;
            }
        }
    }

    /// Mark one register live with the given kind.
    pub fn reg_live(&mut self, reg: AsmReg, kind: GcKind, offset: u32) {
        let own = match kind {
            GcKind::GcRef => self.gcref_regs,
            GcKind::ByRef => self.byref_regs,
            GcKind::None => return self.reg_dead(reg, offset),
        };
        if own.contains(reg) {
            return;
        }
        if self.reports_regs() {
            self.push_record(offset, GcEvent::RegLive { reg, kind });
        }
        match kind {
            GcKind::GcRef => {
                self.byref_regs.remove(reg);
                self.gcref_regs.insert(reg);
            }
            _ => {
                self.gcref_regs.remove(reg);
                self.byref_regs.insert(reg);
            }
        }
    }

    /// Mark one register as holding no GC pointer.
    pub fn reg_dead(&mut self, reg: AsmReg, offset: u32) {
        if !self.gcref_regs.contains(reg) && !self.byref_regs.contains(reg) {
            return;
        }
        if self.reports_regs() {
            self.push_record(offset, GcEvent::RegDead { reg });
        }
        self.gcref_regs.remove(reg);
        self.byref_regs.remove(reg);
    }

    pub fn reg_dead_mask(&mut self, mask: RegMask, offset: u32) {
        for reg in mask.iter() {
            self.reg_dead(reg, offset);
        }
    }

    // ---- tracked stack variables ----

    fn slot_of(&self, frame_offset: i32) -> Option<usize> {
        let delta = frame_offset.checked_sub(self.var_min)?;
        if delta < 0 {
            return None;
        }
        let slot = (delta as u32 / self.ptr_size) as usize;
        (slot < self.var_table.len()).then_some(slot)
    }

    /// Apply a variable snapshot; a no-op if it matches the last one applied
    /// and no store has changed a variable since.
    pub fn update_live_vars(&mut self, vars: &VarSet, offset: u32) -> EmitResult<()> {
        if self.vars_accurate && *vars == self.live_vars {
            return Ok(());
        }
        for index in 0..self.tracked.len() {
            let var = self.tracked[index];
            let slot = self.slot_of(var.frame_offset).ok_or_else(|| {
                EmitError::internal(format!("tracked slot {} outside the frame table", var.frame_offset))
            })?;
            let want = vars.contains(index as u32);
            let is_live = self.var_table[slot].is_some();
            if want && !is_live {
                self.open_lifetime(slot, var, offset);
            } else if !want && is_live {
                self.close_lifetime(slot, offset);
            }
        }
        self.live_vars = vars.clone();
        self.vars_accurate = true;
        Ok(())
    }

    /// Variable set last applied from a snapshot.
    pub fn live_vars(&self) -> &VarSet {
        &self.live_vars
    }

    fn open_lifetime(&mut self, slot: usize, var: TrackedVar, offset: u32) {
        trace!("gc {offset:04X}: var [fp{:+}] live", var.frame_offset);
        self.var_table[slot] = Some(self.lifetimes.len());
        self.lifetimes.push(VarLifetime {
            frame_offset: var.frame_offset,
            kind: var.kind,
            is_this: var.is_this,
            begin: offset,
            end: u32::MAX,
        });
    }

    fn close_lifetime(&mut self, slot: usize, offset: u32) {
        if let Some(index) = self.var_table[slot].take() {
            let lifetime = &mut self.lifetimes[index];
            trace!("gc {offset:04X}: var [fp{:+}] dead", lifetime.frame_offset);
            lifetime.end = offset;
        }
    }

    /// A GC pointer was stored into the slot at `frame_offset`.
    pub fn var_live(&mut self, frame_offset: i32, offset: u32) {
        let Some(var) = self.tracked.iter().copied().find(|v| v.frame_offset == frame_offset) else {
            return;
        };
        if let Some(slot) = self.slot_of(frame_offset) {
            if self.var_table[slot].is_none() {
                self.open_lifetime(slot, var, offset);
            }
            self.vars_accurate = false;
        }
    }

    /// A non-GC value was stored into the slot at `frame_offset`.
    pub fn var_dead(&mut self, frame_offset: i32, offset: u32) {
        if !self.tracked.iter().any(|v| v.frame_offset == frame_offset) {
            return;
        }
        if let Some(slot) = self.slot_of(frame_offset) {
            self.close_lifetime(slot, offset);
            self.vars_accurate = false;
        }
    }

    // ---- argument stack ----

    fn interesting(&self, kind: GcKind) -> bool {
        kind.is_gc() || !self.has_frame_ptr
    }

    /// Push one argument slot.
    pub fn stack_push(&mut self, kind: GcKind, offset: u32) -> EmitResult<()> {
        match self.stack_mode {
            StackMode::Simple => {
                if self.stack_level >= u32::BITS {
                    return Err(EmitError::internal("argument stack too deep for the simple mask"));
                }
                self.simple_gcref = (self.simple_gcref << 1) | (kind == GcKind::GcRef) as u32;
                self.simple_byref = (self.simple_byref << 1) | (kind == GcKind::ByRef) as u32;
            }
            StackMode::Table => {
                self.arg_table.push(kind);
                if self.interesting(kind) {
                    let level = self.stack_level;
                    self.push_record(offset, GcEvent::ArgPush { level, kind });
                }
            }
        }
        self.stack_level += 1;
        Ok(())
    }

    /// Push `count` non-GC slots at once.
    pub fn stack_push_n(&mut self, count: u32, offset: u32) -> EmitResult<()> {
        match self.stack_mode {
            StackMode::Simple => {
                if self.stack_level + count > u32::BITS {
                    return Err(EmitError::internal("argument stack too deep for the simple mask"));
                }
                self.simple_gcref = self.simple_gcref.checked_shl(count).unwrap_or(0);
                self.simple_byref = self.simple_byref.checked_shl(count).unwrap_or(0);
                self.stack_level += count;
            }
            StackMode::Table => {
                for _ in 0..count {
                    self.stack_push(GcKind::None, offset)?;
                }
            }
        }
        Ok(())
    }

    /// Pop `count` slots; a call pop snapshots the callee-saved GC registers.
    pub fn stack_pop(&mut self, count: u32, is_call: bool, offset: u32) -> EmitResult<()> {
        if count > self.stack_level {
            return Err(EmitError::internal(format!(
                "popping {count} slots from an argument stack of depth {}",
                self.stack_level
            )));
        }
        self.stack_level -= count;
        match self.stack_mode {
            StackMode::Simple => {
                self.simple_gcref = self.simple_gcref.checked_shr(count).unwrap_or(0);
                self.simple_byref = self.simple_byref.checked_shr(count).unwrap_or(0);
            }
            StackMode::Table => {
                let keep = self.arg_table.len() - count as usize;
                let any_interesting = self.arg_table[keep..].iter().any(|&k| self.interesting(k));
                self.arg_table.truncate(keep);
                if is_call || any_interesting {
                    self.push_record(
                        offset,
                        GcEvent::ArgPop {
                            count,
                            is_call,
                            gcref_regs: self.gcref_regs & self.callee_saved,
                            byref_regs: self.byref_regs & self.callee_saved,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// The topmost `count` pending arguments are dead but stay on the stack.
    pub fn stack_kill_args(&mut self, count: u32, offset: u32) -> EmitResult<()> {
        if count > self.stack_level {
            return Err(EmitError::internal(format!(
                "killing {count} arguments on a stack of depth {}",
                self.stack_level
            )));
        }
        match self.stack_mode {
            StackMode::Simple => {
                let keep = !(1u32.checked_shl(count).map_or(u32::MAX, |b| b - 1));
                self.simple_gcref &= keep;
                self.simple_byref &= keep;
            }
            StackMode::Table => {
                let len = self.arg_table.len();
                for slot in &mut self.arg_table[len - count as usize..] {
                    *slot = GcKind::None;
                }
                self.push_record(offset, GcEvent::ArgKill { count });
            }
        }
        Ok(())
    }

    /// Record a call site ending at `offset` (partially interruptible methods).
    pub fn record_call(&mut self, offset: u32, call_size: u32) {
        let pending_args = match self.stack_mode {
            StackMode::Simple => PendingArgs::Mask {
                gcref: self.simple_gcref,
                byref: self.simple_byref,
            },
            StackMode::Table => PendingArgs::Table(
                self.arg_table
                    .iter()
                    .enumerate()
                    .filter(|(_, k)| k.is_gc())
                    .map(|(level, &k)| (level as u32, k))
                    .collect(),
            ),
        };
        let site = CallSiteRecord {
            offset,
            call_size,
            gcref_regs: self.gcref_regs & self.callee_saved,
            byref_regs: self.byref_regs & self.callee_saved,
            pending_args,
        };
        trace!("gc {offset:04X}: call site {site:?}");
        self.call_sites.push(site);
    }

    /// Mark `[begin, end)` as non-interruptible, merging with an adjacent range.
    pub fn add_no_gc_region(&mut self, begin: u32, end: u32) {
        if begin >= end {
            return;
        }
        match self.no_gc_regions.last_mut() {
            Some(last) if last.1 == begin => last.1 = end,
            _ => self.no_gc_regions.push((begin, end)),
        }
    }

    /// Kill everything still live at `code_end` and hand over the records.
    pub fn finish(mut self, code_end: u32) -> GcInfo {
        for slot in 0..self.var_table.len() {
            self.close_lifetime(slot, code_end);
        }
        self.in_epilog = false;
        let live = self.gcref_regs | self.byref_regs;
        self.reg_dead_mask(live, code_end);
        self.lifetimes.retain(|l| l.begin < l.end);

        GcInfo {
            fully_interruptible: self.fully_interruptible,
            stack_mode: self.stack_mode,
            records: self.records,
            var_lifetimes: self.lifetimes,
            call_sites: self.call_sites,
            frame_slots: self.tracked.iter().map(|v| (v.frame_offset, v.kind)).collect(),
            no_gc_regions: self.no_gc_regions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> FrameLayout {
        let mut frame = FrameLayout::new(AsmReg::gp(5));
        frame.track_gc_var(0, -8, GcKind::GcRef, true);
        frame.track_gc_var(1, -16, GcKind::ByRef, false);
        frame
    }

    #[test]
    fn test_full_mode_records_every_transition() {
        let target = TargetInfo::x64();
        let mut gc = GcTracker::new(&target, &frame(), true, StackMode::Table);
        let rax = AsmReg::gp(0);
        let rbx = AsmReg::gp(3);

        gc.update_live_regs(GcKind::GcRef, RegMask::of(&[rax, rbx]), 4);
        gc.update_live_regs(GcKind::ByRef, rax.mask(), 9);
        gc.reg_dead(rbx, 12);
        let info = gc.finish(20);

        assert_eq!(info.records.len(), 5);
        assert_eq!(info.live_at(4).gcref_regs, RegMask::of(&[rax, rbx]));
        let at9 = info.live_at(9);
        assert_eq!(at9.gcref_regs, rbx.mask());
        assert_eq!(at9.byref_regs, rax.mask());
        assert_eq!(info.live_at(12).gcref_regs, RegMask::NONE);
        assert_eq!(info.live_at(20), Default::default());
    }

    #[test]
    fn test_partial_mode_records_only_call_sites() {
        let target = TargetInfo::x64();
        let mut gc = GcTracker::new(&target, &frame(), false, StackMode::Simple);
        let rax = AsmReg::gp(0);
        let rbx = AsmReg::gp(3);

        gc.update_live_regs(GcKind::GcRef, RegMask::of(&[rax, rbx]), 0);
        gc.stack_push(GcKind::GcRef, 2).unwrap();
        gc.stack_push(GcKind::None, 3).unwrap();
        gc.record_call(10, 5);
        let info = gc.finish(16);

        assert!(info.records.is_empty());
        let site = &info.call_sites[0];
        // Only callee-saved registers survive a call.
        assert_eq!(site.gcref_regs, rbx.mask());
        assert_eq!(site.pending_args, PendingArgs::Mask { gcref: 0b10, byref: 0 });
        assert_eq!(info.live_at(10).gcref_regs, rbx.mask());
    }

    #[test]
    fn test_var_lifetimes() {
        let target = TargetInfo::x64();
        let mut gc = GcTracker::new(&target, &frame(), true, StackMode::Table);

        gc.update_live_vars(&VarSet::from_indices(&[0]), 2).unwrap();
        gc.update_live_vars(&VarSet::from_indices(&[0, 1]), 6).unwrap();
        gc.update_live_vars(&VarSet::from_indices(&[1]), 10).unwrap();
        let info = gc.finish(14);

        assert_eq!(info.live_at(3).vars, vec![-8]);
        assert_eq!(info.live_at(6).vars, vec![-16, -8]);
        assert_eq!(info.live_at(10).vars, vec![-16]);
        assert!(info.live_at(14).vars.is_empty());
        assert!(info.var_lifetimes.iter().any(|v| v.is_this && v.begin == 2 && v.end == 10));
    }

    #[test]
    fn test_store_reasserts_snapshot() {
        let target = TargetInfo::x64();
        let mut gc = GcTracker::new(&target, &frame(), true, StackMode::Table);
        let snapshot = VarSet::from_indices(&[0]);

        gc.update_live_vars(&snapshot, 0).unwrap();
        gc.var_dead(-8, 4);
        // Same snapshot again: the store made it stale, so it is re-applied.
        gc.update_live_vars(&snapshot, 8).unwrap();
        let info = gc.finish(12);

        assert!(info.live_at(5).vars.is_empty());
        assert_eq!(info.live_at(8).vars, vec![-8]);
    }

    #[test]
    fn test_table_mode_arg_events() {
        let target = TargetInfo::x64();
        let mut gc = GcTracker::new(&target, &frame(), true, StackMode::Table);

        gc.stack_push(GcKind::GcRef, 0).unwrap();
        gc.stack_push_n(2, 1).unwrap();
        gc.stack_kill_args(1, 3).unwrap();
        gc.stack_pop(3, true, 8).unwrap();
        assert_eq!(gc.stack_level(), 0);
        assert!(gc.stack_pop(1, false, 9).is_err());

        let info = gc.finish(10);
        // With a frame pointer only the GC push is interesting.
        let pushes = info
            .records
            .iter()
            .filter(|r| matches!(r.event, GcEvent::ArgPush { .. }))
            .count();
        assert_eq!(pushes, 1);
        assert!(info
            .records
            .iter()
            .any(|r| matches!(r.event, GcEvent::ArgPop { count: 3, is_call: true, .. })));
    }

    #[test]
    fn test_epilog_suppresses_records() {
        let target = TargetInfo::x64();
        let mut gc = GcTracker::new(&target, &frame(), true, StackMode::Table);
        gc.set_in_epilog(true);
        gc.reg_live(AsmReg::gp(0), GcKind::GcRef, 3);
        assert!(gc.gcref_regs().contains(AsmReg::gp(0)));
        gc.set_in_epilog(false);
        let info = gc.finish(6);
        // Only the final kill is recorded.
        assert_eq!(info.records.len(), 1);
    }
}
