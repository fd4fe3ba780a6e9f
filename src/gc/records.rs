// Liveness records handed to the GC-info encoder. They are produced only by the emission pass,
// once exact code offsets are known. Register transitions and argument-stack events form an
// ordered stream; tracked stack variables are reported as [begin, end) lifetimes; call sites
// carry the callee-saved GC registers and the pending GC argument slots live across the call.
// GcInfo::live_at replays all of it at a code offset, which is how the records are validated
// against the state the front end fed in.

//! GC liveness records and their replay.

use std::fmt;

use crate::core::regs::{AsmReg, RegMask};
use crate::instr::desc::GcKind;

/// How pending argument slots are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackMode {
    /// Inline bitmasks; used for partially interruptible methods with a
    /// shallow argument stack.
    Simple,
    /// Explicit per-slot table with push/pop/kill records.
    Table,
}

/// One transition in the liveness stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcEvent {
    RegLive { reg: AsmReg, kind: GcKind },
    RegDead { reg: AsmReg },
    /// An argument slot was pushed at stack `level`.
    ArgPush { level: u32, kind: GcKind },
    /// `count` slots were popped; a call pop snapshots the callee-saved GC registers.
    ArgPop {
        count: u32,
        is_call: bool,
        gcref_regs: RegMask,
        byref_regs: RegMask,
    },
    /// The topmost `count` pending arguments died without being popped.
    ArgKill { count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessRecord {
    pub offset: u32,
    pub event: GcEvent,
}

/// Code range over which a tracked stack variable holds a live GC pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarLifetime {
    pub frame_offset: i32,
    pub kind: GcKind,
    pub is_this: bool,
    pub begin: u32,
    pub end: u32,
}

/// Pending GC argument slots at a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingArgs {
    /// Bit `i` describes the slot `i` positions below the stack top.
    Mask { gcref: u32, byref: u32 },
    /// Stack levels of the pending GC slots.
    Table(Vec<(u32, GcKind)>),
}

/// A recorded call site (partially interruptible methods).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteRecord {
    /// Offset just past the call instruction.
    pub offset: u32,
    pub call_size: u32,
    pub gcref_regs: RegMask,
    pub byref_regs: RegMask,
    pub pending_args: PendingArgs,
}

/// Everything the GC-info encoder consumes for one method.
#[derive(Debug, Clone)]
pub struct GcInfo {
    pub fully_interruptible: bool,
    pub stack_mode: StackMode,
    pub records: Vec<LivenessRecord>,
    pub var_lifetimes: Vec<VarLifetime>,
    pub call_sites: Vec<CallSiteRecord>,
    /// Frame offsets of every tracked GC slot.
    pub frame_slots: Vec<(i32, GcKind)>,
    /// Code ranges `[begin, end)` where no GC may happen.
    pub no_gc_regions: Vec<(u32, u32)>,
}

/// State reconstructed at one code offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSet {
    pub gcref_regs: RegMask,
    pub byref_regs: RegMask,
    /// Frame offsets of live tracked variables, ascending.
    pub vars: Vec<i32>,
    /// Kinds of the pushed argument slots, bottom first (table mode).
    pub pending_args: Vec<GcKind>,
}

impl GcInfo {
    /// Replay the stream up to and including `offset`.
    pub fn live_at(&self, offset: u32) -> LiveSet {
        let mut set = LiveSet::default();
        for rec in self.records.iter().take_while(|r| r.offset <= offset) {
            match rec.event {
                GcEvent::RegLive { reg, kind } => match kind {
                    GcKind::GcRef => {
                        set.byref_regs.remove(reg);
                        set.gcref_regs.insert(reg);
                    }
                    GcKind::ByRef => {
                        set.gcref_regs.remove(reg);
                        set.byref_regs.insert(reg);
                    }
                    GcKind::None => {}
                },
                GcEvent::RegDead { reg } => {
                    set.gcref_regs.remove(reg);
                    set.byref_regs.remove(reg);
                }
                GcEvent::ArgPush { kind, .. } => set.pending_args.push(kind),
                GcEvent::ArgPop { count, .. } => {
                    let keep = set.pending_args.len().saturating_sub(count as usize);
                    set.pending_args.truncate(keep);
                }
                GcEvent::ArgKill { count } => {
                    let len = set.pending_args.len();
                    for slot in &mut set.pending_args[len.saturating_sub(count as usize)..] {
                        *slot = GcKind::None;
                    }
                }
            }
        }

        if !self.fully_interruptible {
            if let Some(site) = self.call_sites.iter().find(|c| c.offset == offset) {
                set.gcref_regs = site.gcref_regs;
                set.byref_regs = site.byref_regs;
            }
        }

        set.vars = self
            .var_lifetimes
            .iter()
            .filter(|v| v.begin <= offset && offset < v.end)
            .map(|v| v.frame_offset)
            .collect();
        set.vars.sort_unstable();
        set.vars.dedup();
        set
    }
}

impl fmt::Display for GcInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "GC info ({}, {:?} stack):",
            if self.fully_interruptible {
                "fully interruptible"
            } else {
                "partially interruptible"
            },
            self.stack_mode
        )?;
        for rec in &self.records {
            writeln!(f, "  {:04X}: {:?}", rec.offset, rec.event)?;
        }
        for var in &self.var_lifetimes {
            writeln!(
                f,
                "  var [fp{:+}] {:?}{} live {:04X}..{:04X}",
                var.frame_offset,
                var.kind,
                if var.is_this { " (this)" } else { "" },
                var.begin,
                var.end
            )?;
        }
        for site in &self.call_sites {
            writeln!(
                f,
                "  call {:04X} (+{}): gcref {:?} byref {:?} args {:?}",
                site.offset, site.call_size, site.gcref_regs, site.byref_regs, site.pending_args
            )?;
        }
        for (begin, end) in &self.no_gc_regions {
            writeln!(f, "  no gc {begin:04X}..{end:04X}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(records: Vec<LivenessRecord>) -> GcInfo {
        GcInfo {
            fully_interruptible: true,
            stack_mode: StackMode::Table,
            no_gc_regions: Vec::new(),
            records,
            var_lifetimes: vec![VarLifetime {
                frame_offset: -8,
                kind: GcKind::GcRef,
                is_this: false,
                begin: 4,
                end: 10,
            }],
            call_sites: Vec::new(),
            frame_slots: vec![(-8, GcKind::GcRef)],
        }
    }

    #[test]
    fn test_replay_register_transitions() {
        let rax = AsmReg::gp(0);
        let info = info(vec![
            LivenessRecord {
                offset: 2,
                event: GcEvent::RegLive { reg: rax, kind: GcKind::GcRef },
            },
            LivenessRecord {
                offset: 6,
                event: GcEvent::RegLive { reg: rax, kind: GcKind::ByRef },
            },
            LivenessRecord {
                offset: 9,
                event: GcEvent::RegDead { reg: rax },
            },
        ]);

        assert!(info.live_at(0).gcref_regs.is_empty());
        assert!(info.live_at(2).gcref_regs.contains(rax));
        let at6 = info.live_at(6);
        assert!(!at6.gcref_regs.contains(rax));
        assert!(at6.byref_regs.contains(rax));
        assert_eq!(at6.vars, vec![-8]);
        assert_eq!(info.live_at(10), LiveSet::default());
    }

    #[test]
    fn test_replay_argument_stack() {
        let info = info(vec![
            LivenessRecord {
                offset: 1,
                event: GcEvent::ArgPush { level: 0, kind: GcKind::GcRef },
            },
            LivenessRecord {
                offset: 2,
                event: GcEvent::ArgPush { level: 1, kind: GcKind::None },
            },
            LivenessRecord {
                offset: 3,
                event: GcEvent::ArgKill { count: 2 },
            },
            LivenessRecord {
                offset: 8,
                event: GcEvent::ArgPop {
                    count: 2,
                    is_call: true,
                    gcref_regs: RegMask::NONE,
                    byref_regs: RegMask::NONE,
                },
            },
        ]);
        assert_eq!(info.live_at(2).pending_args, vec![GcKind::GcRef, GcKind::None]);
        assert_eq!(info.live_at(3).pending_args, vec![GcKind::None, GcKind::None]);
        assert!(info.live_at(8).pending_args.is_empty());
    }
}
