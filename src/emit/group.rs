//! Instruction groups.
//!
//! A group is a run of instruction records with a single entry point. Groups
//! are the unit branches target and the unit offsets are computed for. They
//! live in one vector indexed by [`GroupId`] and are threaded into method
//! order through `next`; a group's position in the vector says nothing about
//! its position in the method.

use std::fmt;

use crate::core::regs::RegMask;
use crate::core::varset::VarSet;
use crate::gc::GcState;
use crate::instr::desc::InstrDesc;

/// Index of a group in the emitter's group table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

impl GroupId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Symbolic branch target, bound to a group when defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// Group flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IgFlags(pub u16);

impl IgFlags {
    /// The group stores a live GC variable snapshot.
    pub const GC_VARS: IgFlags = IgFlags(0x0001);
    /// The group stores a live byref register snapshot.
    pub const BYREF_REGS: IgFlags = IgFlags(0x0002);
    pub const FINALLY_TARGET: IgFlags = IgFlags(0x0004);
    pub const FUNCLET_PROLOG: IgFlags = IgFlags(0x0008);
    pub const FUNCLET_EPILOG: IgFlags = IgFlags(0x0010);
    pub const EPILOG: IgFlags = IgFlags(0x0020);
    /// No GC may happen while executing this group.
    pub const NOGCINTERRUPT: IgFlags = IgFlags(0x0040);
    /// Relaxation changed the group's size.
    pub const UPD_ISZ: IgFlags = IgFlags(0x0080);
    /// Reserved for a prolog or epilog not generated yet.
    pub const PLACEHOLDER: IgFlags = IgFlags(0x0100);
    /// Created by the emitter to continue the previous group; carries no GC state.
    pub const EMIT_ADD: IgFlags = IgFlags(0x0200);
    pub const HAS_JUMPS: IgFlags = IgFlags(0x0400);

    pub const NONE: IgFlags = IgFlags(0);
    /// Flags an emitter-added continuation inherits from its predecessor.
    pub const PROPAGATE: IgFlags = IgFlags(0x0020 | 0x0008 | 0x0010);

    pub fn contains(&self, other: IgFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: IgFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: IgFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: IgFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for IgFlags {
    type Output = IgFlags;

    fn bitor(self, rhs: IgFlags) -> IgFlags {
        IgFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for IgFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(IgFlags, &str); 11] = [
            (IgFlags::GC_VARS, "gcvars"),
            (IgFlags::BYREF_REGS, "byref"),
            (IgFlags::FINALLY_TARGET, "ftarget"),
            (IgFlags::FUNCLET_PROLOG, "funclet prolog"),
            (IgFlags::FUNCLET_EPILOG, "funclet epilog"),
            (IgFlags::EPILOG, "epilog"),
            (IgFlags::NOGCINTERRUPT, "nogc"),
            (IgFlags::UPD_ISZ, "isz"),
            (IgFlags::PLACEHOLDER, "placeholder"),
            (IgFlags::EMIT_ADD, "extend"),
            (IgFlags::HAS_JUMPS, "jumps"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(", "))
    }
}

/// Which out-of-order region a placeholder stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaceholderKind {
    Prolog,
    Epilog,
    FuncletProlog,
    FuncletEpilog,
}

impl PlaceholderKind {
    /// Group flag marking the materialized region.
    pub fn flag(&self) -> IgFlags {
        match self {
            PlaceholderKind::Prolog => IgFlags::NONE,
            PlaceholderKind::Epilog => IgFlags::EPILOG,
            PlaceholderKind::FuncletProlog => IgFlags::FUNCLET_PROLOG,
            PlaceholderKind::FuncletEpilog => IgFlags::FUNCLET_EPILOG,
        }
    }

    pub fn is_epilog(&self) -> bool {
        matches!(self, PlaceholderKind::Epilog | PlaceholderKind::FuncletEpilog)
    }
}

/// State captured when a placeholder is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderData {
    pub kind: PlaceholderKind,
    /// Opaque cookie naming the basic block the region belongs to.
    pub block: u32,
    /// GC state as of the last label-level group saved before the placeholder.
    pub prev_state: GcState,
    /// GC state at the placeholder itself.
    pub init_state: GcState,
}

/// One instruction group.
#[derive(Debug)]
pub struct InsGroup<'a> {
    /// Position in method order; strictly increasing along `next`.
    pub num: u32,
    pub next: Option<GroupId>,
    /// Code offset; valid after the latest offset recomputation.
    pub offset: u32,
    /// Code size; only ever shrinks after the group is saved.
    pub size: u32,
    pub flags: IgFlags,
    /// Function (root or funclet) the group belongs to.
    pub func_idx: u16,
    /// Argument stack depth, in slots, at group entry.
    pub stack_level: u32,
    /// GC reference registers live at entry.
    pub gcref_regs: RegMask,
    /// Interior-pointer registers live at entry; meaningful with `BYREF_REGS`.
    pub byref_regs: RegMask,
    /// Live GC variables at entry; present with `GC_VARS`.
    pub gc_vars: Option<&'a [u64]>,
    pub instrs: &'a mut [InstrDesc<'a>],
    pub placeholder: Option<Box<PlaceholderData>>,
}

impl<'a> InsGroup<'a> {
    pub fn new(num: u32, next: Option<GroupId>) -> Self {
        Self {
            num,
            next,
            offset: 0,
            size: 0,
            flags: IgFlags::NONE,
            func_idx: 0,
            stack_level: 0,
            gcref_regs: RegMask::NONE,
            byref_regs: RegMask::NONE,
            gc_vars: None,
            instrs: &mut [],
            placeholder: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.flags.contains(IgFlags::PLACEHOLDER)
    }

    pub fn is_emit_add(&self) -> bool {
        self.flags.contains(IgFlags::EMIT_ADD)
    }

    pub fn is_epilog(&self) -> bool {
        self.flags.intersects(IgFlags::EPILOG | IgFlags::FUNCLET_EPILOG)
    }

    /// Stored live-variable snapshot as a set.
    pub fn gc_var_set(&self) -> Option<VarSet> {
        self.gc_vars.map(VarSet::from_words)
    }

    pub fn end(&self) -> u32 {
        self.offset + self.size
    }
}

impl fmt::Display for InsGroup<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IG{:02}: offs={:06X}H, size={:04X}H, func={}",
            self.num, self.offset, self.size, self.func_idx
        )?;
        if self.stack_level != 0 {
            write!(f, ", stk={}", self.stack_level)?;
        }
        if !self.is_emit_add() {
            write!(f, ", gcrefRegs={:?}", self.gcref_regs)?;
        }
        if self.flags.contains(IgFlags::BYREF_REGS) {
            write!(f, ", byrefRegs={:?}", self.byref_regs)?;
        }
        if let Some(vars) = self.gc_var_set() {
            write!(f, ", gcVars={vars:?}")?;
        }
        if self.flags != IgFlags::NONE {
            write!(f, " [{:?}]", self.flags)?;
        }
        if let Some(ph) = &self.placeholder {
            write!(f, " <{:?} placeholder, block {}>", ph.kind, ph.block)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_operations() {
        let mut flags = IgFlags::EPILOG | IgFlags::HAS_JUMPS;
        assert!(flags.contains(IgFlags::EPILOG));
        assert!(flags.intersects(IgFlags::PROPAGATE));
        flags.remove(IgFlags::EPILOG);
        assert!(!flags.intersects(IgFlags::PROPAGATE));
        flags.insert(IgFlags::GC_VARS);
        assert_eq!(flags.0, 0x401);
        assert_eq!(format!("{flags:?}"), "gcvars, jumps");
    }

    #[test]
    fn test_group_display() {
        let mut group = InsGroup::new(3, None);
        group.offset = 0x40;
        group.size = 6;
        group.flags = IgFlags::EMIT_ADD;
        assert_eq!(
            group.to_string(),
            "IG03: offs=000040H, size=0006H, func=0 [extend]"
        );
    }
}
