// The instruction emission engine. An Emitter is created fresh for every method and owns all
// of that method's emission state: the group list and the group being built, the GC state at
// codegen time (current, at group entry and at the last label-level group), the global branch
// list, labels, pending prolog/epilog placeholders, the funclet table, the hot/cold split
// point, unwind locations and the data section. Groups and their permanent instruction records
// are allocated from the session arena. The pipeline is: instruction entry points and group
// building (builder.rs), placeholder materialization (placeholder.rs), branch relaxation
// (relax.rs) and the emission pass (issue.rs). The per-architecture encoder is reached only
// through the InstrEncoder trait.

//! Instruction emission engine.

pub mod builder;
pub mod data;
pub mod group;
pub mod issue;
pub mod placeholder;
pub mod relax;

pub use builder::{CallDest, CallSpec, Mem};
pub use data::{DataEntry, DataSection};
pub use group::{GroupId, IgFlags, InsGroup, Label, PlaceholderData, PlaceholderKind};
pub use issue::{EmitOutput, EmitStats};
pub use placeholder::{PrologEpilogGenerator, UnwindEvent, UnwindEventKind};
pub use relax::RelaxStats;

use std::fmt::Write as _;

use log::debug;

use crate::core::config::EmitterConfig;
use crate::core::encoder::InstrEncoder;
use crate::core::error::{EmitError, EmitResult};
use crate::core::funclet::{FuncletTable, HandlerKind};
use crate::core::session::CompilationSession;
use crate::core::target::TargetInfo;
use crate::gc::GcState;
use crate::instr::{InstrAllocator, InstrDesc};

/// A branch record, addressed by its group and its index in the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpRef {
    pub group: GroupId,
    pub index: u32,
}

/// A point in the instruction stream: before instruction `index` of `group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmitLocation {
    pub group: GroupId,
    pub index: u32,
}

/// Per-method emission engine.
pub struct Emitter<'a, E: InstrEncoder> {
    session: &'a CompilationSession<'a>,
    encoder: E,
    target: TargetInfo,
    config: EmitterConfig,
    alloc: InstrAllocator,

    groups: Vec<InsGroup<'a>>,
    first_group: GroupId,
    last_group: GroupId,
    cur_group: Option<GroupId>,
    prolog_group: GroupId,

    scratch: Vec<InstrDesc<'a>>,
    scratch_bytes: usize,
    cur_ig_size: u32,
    cur_code_offset: u32,
    force_new_group: bool,

    this_gc: GcState,
    init_gc: GcState,
    prev_gc: GcState,
    force_store_gc_state: bool,
    /// A register was written since the last label-level group started.
    byref_dirty: bool,
    /// `byref_dirty` as of the current label-level group's start.
    byref_dirty_entry: bool,
    no_gc: bool,

    jumps: Vec<JumpRef>,
    short_jumps: Vec<JumpRef>,
    labels: Vec<Option<GroupId>>,
    placeholders: Vec<GroupId>,
    generating: Option<GroupId>,

    cur_stack_level: u32,
    max_stack_depth: u32,
    cur_func_idx: u16,
    funclets: FuncletTable,
    first_cold: Option<GroupId>,

    prolog_end: Option<EmitLocation>,
    unwind_events: Vec<(UnwindEventKind, EmitLocation)>,
    data: DataSection,
    total_code_size: u32,
    relax_stats: Option<RelaxStats>,
    emitted: bool,
}

impl<'a, E: InstrEncoder> Emitter<'a, E> {
    /// Start a method. The prolog placeholder is pre-allocated as the first
    /// group and the first body group is opened after it.
    pub fn new(
        session: &'a CompilationSession<'a>,
        encoder: E,
        target: TargetInfo,
        config: EmitterConfig,
    ) -> EmitResult<Self> {
        let prolog = GroupId(0);
        let mut prolog_ig = InsGroup::new(0, None);
        prolog_ig.flags = IgFlags::PLACEHOLDER;
        prolog_ig.size = config.placeholder_size;
        prolog_ig.placeholder = Some(Box::new(PlaceholderData {
            kind: PlaceholderKind::Prolog,
            block: 0,
            prev_state: GcState::default(),
            init_state: GcState::default(),
        }));

        let mut em = Self {
            session,
            encoder,
            alloc: InstrAllocator::new(target.ptr_size),
            data: DataSection::new(target.ptr_size),
            target,
            cur_code_offset: config.placeholder_size,
            total_code_size: config.placeholder_size,
            config,
            groups: vec![prolog_ig],
            first_group: prolog,
            last_group: prolog,
            cur_group: None,
            prolog_group: prolog,
            scratch: Vec::new(),
            scratch_bytes: 0,
            cur_ig_size: 0,
            force_new_group: false,
            this_gc: GcState::default(),
            init_gc: GcState::default(),
            prev_gc: GcState::default(),
            force_store_gc_state: false,
            byref_dirty: false,
            byref_dirty_entry: false,
            no_gc: false,
            jumps: Vec::new(),
            short_jumps: Vec::new(),
            labels: Vec::new(),
            placeholders: vec![prolog],
            generating: None,
            cur_stack_level: 0,
            max_stack_depth: 0,
            cur_func_idx: 0,
            funclets: FuncletTable::default(),
            first_cold: None,
            prolog_end: None,
            unwind_events: Vec::new(),
            relax_stats: None,
            emitted: false,
        };
        em.funclets.funcs[0].first_group = Some(prolog);
        session.record_group_created();

        let body = em.new_ig(Some(prolog))?;
        em.gen_ig(body, false, Some(prolog));
        debug!(
            "emitter for {}: prolog IG00 reserved, body starts at IG{:02}",
            em.target.name,
            em.groups[body.index()].num
        );
        Ok(em)
    }

    pub fn target(&self) -> &TargetInfo {
        &self.target
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.config
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn session(&self) -> &'a CompilationSession<'a> {
        self.session
    }

    pub fn instr_allocator(&self) -> &InstrAllocator {
        &self.alloc
    }

    /// IL offset attributed to subsequently emitted instructions.
    pub fn set_il_offset(&mut self, il_offset: u32) {
        self.alloc.set_il_offset(il_offset);
    }

    pub fn group(&self, id: GroupId) -> &InsGroup<'a> {
        &self.groups[id.index()]
    }

    pub fn prolog_group(&self) -> GroupId {
        self.prolog_group
    }

    pub fn current_group(&self) -> Option<GroupId> {
        self.cur_group
    }

    /// Groups in method order.
    pub fn group_ids(&self) -> Vec<GroupId> {
        let mut ids = Vec::with_capacity(self.groups.len());
        let mut cur = Some(self.first_group);
        while let Some(id) = cur {
            ids.push(id);
            cur = self.groups[id.index()].next;
        }
        ids
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Sum of group sizes as of the last recomputation or relaxation.
    pub fn total_code_size(&self) -> u32 {
        self.total_code_size
    }

    pub fn max_stack_depth(&self) -> u32 {
        self.max_stack_depth
    }

    pub fn current_stack_level(&self) -> u32 {
        self.cur_stack_level
    }

    /// Codegen-time GC state.
    pub fn gc_state(&self) -> &GcState {
        &self.this_gc
    }

    /// Bound group of a label.
    pub fn label_group(&self, label: Label) -> Option<GroupId> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    pub fn relax_stats(&self) -> Option<RelaxStats> {
        self.relax_stats
    }

    pub fn jump_refs(&self) -> &[JumpRef] {
        &self.jumps
    }

    pub fn funclets(&self) -> &FuncletTable {
        &self.funclets
    }

    /// Add an exception-handling region and its handler funclet.
    pub fn add_handler(&mut self, handler: HandlerKind, enclosing_handler: Option<u32>) -> u16 {
        self.funclets.add_handler(handler, enclosing_handler)
    }

    /// Mark `group` as the first group of the cold section.
    pub fn set_first_cold_group(&mut self, group: GroupId) -> EmitResult<()> {
        if self.first_cold.is_some() {
            return Err(EmitError::internal("cold section already started"));
        }
        self.first_cold = Some(group);
        Ok(())
    }

    pub fn first_cold_group(&self) -> Option<GroupId> {
        self.first_cold
    }

    pub(crate) fn is_cold(&self, group: GroupId) -> bool {
        self.first_cold
            .is_some_and(|c| self.groups[group.index()].num >= self.groups[c.index()].num)
    }

    pub fn data(&self) -> &DataSection {
        &self.data
    }

    /// Place a constant in the data section; returns its offset.
    pub fn data_const(&mut self, bytes: &[u8], dbl_align: bool) -> u32 {
        self.data.data_const(bytes, dbl_align)
    }

    /// Reserve zeroed data space; returns its offset.
    pub fn data_reserve(&mut self, size: u32, dbl_align: bool) -> u32 {
        self.data.data_reserve(size, dbl_align)
    }

    /// Overwrite previously reserved data.
    pub fn data_write(&mut self, offset: u32, bytes: &[u8]) -> EmitResult<()> {
        self.data.data_write(offset, bytes)
    }

    /// Add a table of block addresses (or of offsets relative to the method
    /// body when `relative`); returns its offset.
    pub fn block_table(&mut self, labels: &[Label], relative: bool) -> u32 {
        self.data.block_table(labels, relative)
    }

    /// Recompute every group offset from the group sizes.
    pub fn recompute_offsets(&mut self) {
        let mut offset = 0;
        let mut cur = Some(self.first_group);
        while let Some(id) = cur {
            let group = &mut self.groups[id.index()];
            group.offset = offset;
            offset += group.size;
            cur = group.next;
        }
        self.total_code_size = offset;
        if self.cur_group.is_none() {
            self.cur_code_offset = offset;
        }
    }

    /// Verify that every group starts where its predecessor ends.
    pub fn check_offsets(&self) -> EmitResult<()> {
        let mut expected = 0;
        for id in self.group_ids() {
            let group = &self.groups[id.index()];
            if group.offset != expected {
                return Err(EmitError::OffsetMismatch {
                    num: group.num,
                    expected,
                    actual: group.offset,
                });
            }
            expected = group.end();
        }
        if expected != self.total_code_size {
            return Err(EmitError::internal(format!(
                "groups end at {expected:#x} but total code size is {:#x}",
                self.total_code_size
            )));
        }
        Ok(())
    }

    /// Human-readable dump of every group and record.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for id in self.group_ids() {
            let group = &self.groups[id.index()];
            let _ = writeln!(out, "{group}");
            let records: &[InstrDesc<'a>] = if Some(id) == self.cur_group {
                &self.scratch
            } else {
                group.instrs
            };
            for desc in records {
                let _ = writeln!(out, "    {desc}");
            }
        }
        out
    }
}
