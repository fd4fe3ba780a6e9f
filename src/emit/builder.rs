// Group building. Instructions are appended to a scratch buffer belonging to the current group.
// When the buffer fills up (or a new group is forced, or the stress knob isolates every
// instruction) the group is saved and an emitter-added continuation group is started; such a
// group carries no GC state of its own and inherits the epilog/funclet flags of its
// predecessor. Labels always start a label-level group whose entry GC state is the one passed
// by the caller. Saving a group copies its records into the arena, stores the GC snapshots the
// issue pass will need, and routes its branches onto the global branch list: prolog branches
// go in front, funclet prolog branches must already be short and go on their own list.

//! Group builder and instruction entry points.

use log::{debug, trace};

use super::group::{GroupId, IgFlags, InsGroup, Label};
use super::{EmitLocation, Emitter, JumpRef};
use crate::core::encoder::InstrEncoder;
use crate::core::error::{EmitError, EmitResult};
use crate::core::regs::AsmReg;
use crate::core::target::JumpForm;
use crate::gc::GcState;
use crate::instr::alloc::defined_gc_kind;
use crate::instr::desc::{
    AddrMode, AddrOperand, CallInfo, CallTarget, EmitAttr, GcKind, Ins, InsFormat, InstrDesc,
    JumpInfo,
};
use crate::instr::lcl_var::LclVarAddr;

/// Memory operand as written by the code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mem {
    /// `[base + index*scale + disp]`.
    Amd {
        base: Option<AsmReg>,
        index: Option<AsmReg>,
        scale: u8,
        disp: i64,
    },
    /// Local variable (or compiler temp when `var` is negative) plus offset.
    Lcl { var: i32, offs: u32 },
    /// Offset into the method's data section.
    Data(u32),
    /// Absolute address.
    Abs(u64),
}

impl Mem {
    pub fn base(reg: AsmReg, disp: i64) -> Self {
        Mem::Amd {
            base: Some(reg),
            index: None,
            scale: 1,
            disp,
        }
    }

    pub fn lcl(var: i32, offs: u32) -> Self {
        Mem::Lcl { var, offs }
    }

    fn lower(&self) -> EmitResult<(AddrOperand, i64)> {
        Ok(match *self {
            Mem::Amd {
                base,
                index,
                scale,
                disp,
            } => {
                if !matches!(scale, 1 | 2 | 4 | 8) {
                    return Err(EmitError::internal(format!("invalid scale {scale}")));
                }
                (AddrOperand::Amd(AddrMode { base, index, scale }), disp)
            }
            Mem::Lcl { var, offs } => (AddrOperand::Lcl(LclVarAddr::new(var, offs)?), 0),
            Mem::Data(offset) => (AddrOperand::Data(offset), 0),
            Mem::Abs(addr) => (AddrOperand::Abs(addr), 0),
        })
    }
}

/// Where a call goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDest {
    Method(u32),
    Reg(AsmReg),
    Mem(Mem),
}

/// A call as described by the code generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSpec {
    pub dest: CallDest,
    /// Argument slots the call pops; negative counts are killed instead.
    pub arg_slots: i32,
    /// Type of the value returned in the integer return register.
    pub ret: EmitAttr,
    /// GC state right after the call, not counting the return value.
    pub live_after: GcState,
    /// The callee never triggers a collection.
    pub no_gc: bool,
}

impl CallSpec {
    pub fn method(handle: u32) -> Self {
        Self {
            dest: CallDest::Method(handle),
            arg_slots: 0,
            ret: EmitAttr::B8,
            live_after: GcState::default(),
            no_gc: false,
        }
    }
}

impl<'a, E: InstrEncoder> Emitter<'a, E> {
    /// Allocate a group linked after `after` (or as the first group).
    pub(super) fn new_ig(&mut self, after: Option<GroupId>) -> EmitResult<GroupId> {
        if self.groups.len() as u32 >= self.config.max_groups {
            return Err(EmitError::TooManyGroups {
                limit: self.config.max_groups,
            });
        }
        let id = GroupId(self.groups.len() as u32);
        let Some(after) = after else {
            self.groups.push(InsGroup::new(0, None));
            self.first_group = id;
            self.last_group = id;
            self.session.record_group_created();
            return Ok(id);
        };

        let prev = &mut self.groups[after.index()];
        let num = prev.num + 1;
        let next = prev.next;
        prev.next = Some(id);
        self.groups.push(InsGroup::new(num, next));
        if after == self.last_group {
            self.last_group = id;
        } else {
            // Inserted mid-list: keep numbers strictly increasing.
            let mut cur = next;
            let mut n = num + 1;
            while let Some(g) = cur {
                self.groups[g.index()].num = n;
                n += 1;
                cur = self.groups[g.index()].next;
            }
        }
        self.session.record_group_created();
        Ok(id)
    }

    /// Make `id` the group being built.
    pub(super) fn gen_ig(&mut self, id: GroupId, emit_add: bool, prev: Option<GroupId>) {
        self.cur_group = Some(id);
        self.scratch.clear();
        self.scratch_bytes = 0;
        self.cur_ig_size = 0;

        let inherited = prev.map_or(IgFlags::NONE, |p| self.groups[p.index()].flags);
        let group = &mut self.groups[id.index()];
        group.offset = self.cur_code_offset;
        group.func_idx = self.cur_func_idx;
        group.stack_level = self.cur_stack_level;
        if self.no_gc {
            group.flags.insert(IgFlags::NOGCINTERRUPT);
        }
        if emit_add {
            group.flags.insert(IgFlags::EMIT_ADD);
            group.flags.insert(IgFlags(inherited.0 & IgFlags::PROPAGATE.0));
        } else {
            self.init_gc = self.this_gc.clone();
            self.byref_dirty_entry = self.byref_dirty;
            self.byref_dirty = false;
        }

        let func = &mut self.funclets.funcs[self.cur_func_idx as usize];
        if func.first_group.is_none() {
            func.first_group = Some(id);
        }
        trace!("gen IG{:02} (extend={emit_add})", group.num);
    }

    /// Close the current group.
    pub(super) fn save_ig(&mut self, emit_add: bool) -> EmitResult<()> {
        let Some(id) = self.cur_group else {
            return Ok(());
        };
        let is_emit_add = self.groups[id.index()].is_emit_add();

        let mut gc_vars = None;
        let mut store_byref = false;
        if !is_emit_add {
            if self.force_store_gc_state || self.prev_gc.vars != self.init_gc.vars {
                gc_vars = Some(self.session.try_alloc_slice_copy(self.init_gc.vars.words())? as &[u64]);
            }
            store_byref = self.force_store_gc_state
                || self.prev_gc.byref != self.init_gc.byref
                || self.byref_dirty_entry;
        }
        let instrs = self.session.try_alloc_slice_copy(&self.scratch)?;

        let group = &mut self.groups[id.index()];
        group.instrs = instrs;
        group.size = self.cur_ig_size;
        if !is_emit_add {
            group.gcref_regs = self.init_gc.gcref;
            if let Some(words) = gc_vars {
                group.gc_vars = Some(words);
                group.flags.insert(IgFlags::GC_VARS);
            }
            if store_byref {
                group.byref_regs = self.init_gc.byref;
                group.flags.insert(IgFlags::BYREF_REGS);
            }
        }

        let mut prolog_jumps = Vec::new();
        for (index, desc) in group.instrs.iter().enumerate() {
            let Some(jump) = desc.jump() else {
                continue;
            };
            group.flags.insert(IgFlags::HAS_JUMPS);
            let jref = JumpRef {
                group: id,
                index: index as u32,
            };
            if id == self.prolog_group {
                prolog_jumps.push(jref);
            } else if group.flags.contains(IgFlags::FUNCLET_PROLOG) {
                if !jump.is_short() {
                    return Err(EmitError::internal(
                        "funclet prolog branches must be emitted short",
                    ));
                }
                self.short_jumps.push(jref);
            } else {
                self.jumps.push(jref);
            }
        }
        if !prolog_jumps.is_empty() {
            self.jumps.splice(0..0, prolog_jumps);
        }

        self.cur_code_offset = group.offset + group.size;
        self.total_code_size = self.total_code_size.max(self.cur_code_offset);
        trace!(
            "saved IG{:02}: {} records, {} bytes",
            group.num,
            group.instrs.len(),
            group.size
        );

        if !emit_add {
            self.prev_gc = self.this_gc.clone();
            self.force_store_gc_state = false;
            self.byref_dirty_entry = false;
        }
        self.scratch.clear();
        self.scratch_bytes = 0;
        self.cur_ig_size = 0;
        self.cur_group = None;
        Ok(())
    }

    /// Save the current group and start the next one.
    pub(super) fn nxt_ig(&mut self, emit_add: bool) -> EmitResult<GroupId> {
        let prev = self.cur_group;
        self.save_ig(emit_add)?;
        let id = self.new_ig(prev.or(Some(self.last_group)))?;
        self.gen_ig(id, emit_add, prev);
        Ok(id)
    }

    /// Current group, opening a label-level one if none is open.
    pub(super) fn ensure_current(&mut self) -> EmitResult<GroupId> {
        if let Some(id) = self.cur_group {
            return Ok(id);
        }
        let id = self.new_ig(Some(self.last_group))?;
        self.gen_ig(id, false, None);
        Ok(id)
    }

    /// Save the current group, if any, without opening another.
    pub(super) fn close_current(&mut self) -> EmitResult<()> {
        self.save_ig(false)
    }

    pub(super) fn in_unsplittable_region(&self, id: GroupId) -> bool {
        id == self.prolog_group
            || self.generating == Some(id)
            || self.groups[id.index()].flags.intersects(IgFlags::PROPAGATE)
    }

    /// Whether the current group holds any record.
    pub fn cur_ig_nonempty(&self) -> bool {
        self.cur_group.is_some() && !self.scratch.is_empty()
    }

    /// Make the next instruction start a new group.
    pub fn force_new_group(&mut self) {
        self.force_new_group = true;
    }

    /// Append a fully built record to the current group.
    pub fn append_instr(&mut self, mut desc: InstrDesc<'a>) -> EmitResult<()> {
        let mut id = self.ensure_current()?;
        let region = self.in_unsplittable_region(id);
        let footprint = desc.footprint();
        let overflow = self.scratch_bytes + footprint > self.config.scratch_capacity;

        if !self.scratch.is_empty()
            && (overflow || self.force_new_group || (self.config.stress_new_groups && !region))
        {
            if region {
                if overflow {
                    return Err(EmitError::impl_limit(
                        "prolog or epilog does not fit in one instruction group",
                    ));
                }
            } else {
                id = self.nxt_ig(true)?;
            }
        }
        self.force_new_group = false;

        let size = self.encoder.estimate_size(&desc, &self.target)?;
        desc.code_size = u8::try_from(size)
            .map_err(|_| EmitError::internal(format!("instruction size {size} out of range")))?;
        if let Some(jump) = desc.jump_mut() {
            jump.offs = self.cur_ig_size;
        }

        self.note_codegen_effects(&desc, region)?;
        self.cur_ig_size += size;
        self.scratch_bytes += footprint;
        self.session.record_instruction(desc.variant_name());
        trace!("IG{:02} +{size}: {desc}", self.groups[id.index()].num);
        self.scratch.push(desc);
        Ok(())
    }

    fn note_codegen_effects(&mut self, desc: &InstrDesc<'a>, region: bool) -> EmitResult<()> {
        if !region {
            match desc.ins {
                Ins::Push => {
                    self.cur_stack_level += 1;
                    self.max_stack_depth = self.max_stack_depth.max(self.cur_stack_level);
                }
                Ins::Pop => {
                    self.cur_stack_level = self
                        .cur_stack_level
                        .checked_sub(1)
                        .ok_or_else(|| EmitError::internal("pop below the argument stack base"))?;
                }
                _ => {}
            }
        }
        if let Some(call) = desc.call() {
            if call.arg_slots > 0 {
                self.cur_stack_level = self
                    .cur_stack_level
                    .checked_sub(call.arg_slots as u32)
                    .ok_or_else(|| EmitError::internal("call pops more arguments than pushed"))?;
            }
            self.byref_dirty = true;
        } else if defined_gc_kind(desc).is_some() {
            self.byref_dirty = true;
        }
        Ok(())
    }

    /// Allocate a new, unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to a new label-level group whose entry GC state is `gc`.
    pub fn define_label(&mut self, label: Label, gc: &GcState) -> EmitResult<GroupId> {
        match self.labels.get(label.0 as usize) {
            Some(None) => {}
            Some(Some(_)) => {
                return Err(EmitError::internal(format!("label L{} defined twice", label.0)));
            }
            None => return Err(EmitError::UnboundLabel { label: label.0 }),
        }
        if self.cur_ig_nonempty() {
            self.nxt_ig(false)?;
        }
        let id = self.ensure_current()?;

        let group = &mut self.groups[id.index()];
        if group.is_emit_add() {
            self.byref_dirty_entry = self.byref_dirty;
            self.byref_dirty = false;
        }
        group.flags.remove(IgFlags::EMIT_ADD | IgFlags::PROPAGATE);
        group.stack_level = self.cur_stack_level;
        self.this_gc = gc.clone();
        self.init_gc = gc.clone();
        self.labels[label.0 as usize] = Some(id);
        debug!("L{} -> IG{:02}", label.0, group.num);
        Ok(id)
    }

    /// Mark the current group as the target of a finally call return.
    pub fn set_finally_target(&mut self) -> EmitResult<()> {
        let id = self.ensure_current()?;
        self.groups[id.index()].flags.insert(IgFlags::FINALLY_TARGET);
        Ok(())
    }

    /// Override the codegen-time argument stack level.
    pub fn set_stack_level(&mut self, level: u32) {
        self.cur_stack_level = level;
        self.max_stack_depth = self.max_stack_depth.max(level);
    }

    /// Switch to function `func_idx`; subsequent groups belong to it.
    pub fn set_current_func(&mut self, func_idx: u16) -> EmitResult<()> {
        if func_idx as usize >= self.funclets.count() {
            return Err(EmitError::internal(format!("unknown funclet {func_idx}")));
        }
        if self.cur_ig_nonempty() {
            self.nxt_ig(false)?;
        }
        self.cur_func_idx = func_idx;
        let id = self.ensure_current()?;
        self.groups[id.index()].func_idx = func_idx;
        let func = &mut self.funclets.funcs[func_idx as usize];
        if func.first_group.is_none() {
            func.first_group = Some(id);
        }
        Ok(())
    }

    /// Start a run of groups where no GC may happen.
    pub fn disable_gc(&mut self) -> EmitResult<()> {
        if self.cur_ig_nonempty() {
            self.nxt_ig(true)?;
        }
        self.no_gc = true;
        let id = self.ensure_current()?;
        self.groups[id.index()].flags.insert(IgFlags::NOGCINTERRUPT);
        Ok(())
    }

    /// End a run started by [`Emitter::disable_gc`].
    pub fn enable_gc(&mut self) -> EmitResult<()> {
        self.no_gc = false;
        if self.cur_ig_nonempty() {
            self.nxt_ig(true)?;
        } else if let Some(id) = self.cur_group {
            self.groups[id.index()].flags.remove(IgFlags::NOGCINTERRUPT);
        }
        Ok(())
    }

    /// Location of the next instruction to be emitted.
    pub fn current_location(&self) -> EmitLocation {
        match self.cur_group {
            Some(group) => EmitLocation {
                group,
                index: self.scratch.len() as u32,
            },
            None => EmitLocation {
                group: self.last_group,
                index: self.groups[self.last_group.index()].instrs.len() as u32,
            },
        }
    }

    /// Provisional (or, after emission, actual) size of the instruction at `loc`.
    pub fn instruction_size_at(&self, loc: EmitLocation) -> Option<u32> {
        let records: &[InstrDesc<'a>] = if Some(loc.group) == self.cur_group {
            &self.scratch
        } else {
            self.groups.get(loc.group.index())?.instrs
        };
        records.get(loc.index as usize).map(|d| d.code_size as u32)
    }

    // Instruction entry points.

    /// Instruction without operands.
    pub fn ins(&mut self, ins: Ins, attr: EmitAttr) -> EmitResult<()> {
        let desc = self.alloc.alloc(ins, InsFormat::None, attr, 0, 0);
        self.append_instr(desc)
    }

    /// Padding of exactly `size` bytes, split into records of at most
    /// `u8::MAX` bytes each.
    pub fn ins_nop(&mut self, size: u32) -> EmitResult<()> {
        let mut left = size;
        while left > 0 {
            let chunk = left.min(u8::MAX as u32);
            let desc = self
                .alloc
                .alloc(Ins::Nop, InsFormat::None, EmitAttr::B1, chunk as i64, 0);
            self.append_instr(desc)?;
            left -= chunk;
        }
        Ok(())
    }

    pub fn ins_r(&mut self, ins: Ins, attr: EmitAttr, reg: AsmReg) -> EmitResult<()> {
        let mut desc = self.alloc.alloc(ins, InsFormat::R, attr, 0, 0);
        desc.reg1 = Some(reg);
        self.append_instr(desc)
    }

    pub fn ins_rr(&mut self, ins: Ins, attr: EmitAttr, dst: AsmReg, src: AsmReg) -> EmitResult<()> {
        let mut desc = self.alloc.alloc(ins, InsFormat::RR, attr, 0, 0);
        desc.reg1 = Some(dst);
        desc.reg2 = Some(src);
        self.append_instr(desc)
    }

    pub fn ins_ri(&mut self, ins: Ins, attr: EmitAttr, reg: AsmReg, imm: i64) -> EmitResult<()> {
        let mut desc = self.alloc.alloc(ins, InsFormat::RI, attr, imm, 0);
        desc.reg1 = Some(reg);
        self.append_instr(desc)
    }

    pub fn ins_rri(
        &mut self,
        ins: Ins,
        attr: EmitAttr,
        dst: AsmReg,
        src: AsmReg,
        imm: i64,
    ) -> EmitResult<()> {
        let mut desc = self.alloc.alloc(ins, InsFormat::RRI, attr, imm, 0);
        desc.reg1 = Some(dst);
        desc.reg2 = Some(src);
        self.append_instr(desc)
    }

    /// Register destination, memory source.
    pub fn ins_rm(&mut self, ins: Ins, attr: EmitAttr, reg: AsmReg, mem: Mem) -> EmitResult<()> {
        let (addr, disp) = mem.lower()?;
        let mut desc = self.alloc.alloc(ins, InsFormat::RM, attr, 0, disp);
        desc.reg1 = Some(reg);
        desc.addr = addr;
        self.append_instr(desc)
    }

    /// Memory destination, register source.
    pub fn ins_mr(&mut self, ins: Ins, attr: EmitAttr, mem: Mem, reg: AsmReg) -> EmitResult<()> {
        let (addr, disp) = mem.lower()?;
        let mut desc = self.alloc.alloc(ins, InsFormat::MR, attr, 0, disp);
        desc.reg1 = Some(reg);
        desc.addr = addr;
        self.append_instr(desc)
    }

    pub fn ins_mi(&mut self, ins: Ins, attr: EmitAttr, mem: Mem, imm: i64) -> EmitResult<()> {
        let (addr, disp) = mem.lower()?;
        let mut desc = self.alloc.alloc(ins, InsFormat::MI, attr, imm, disp);
        desc.addr = addr;
        self.append_instr(desc)
    }

    pub fn ins_m(&mut self, ins: Ins, attr: EmitAttr, mem: Mem) -> EmitResult<()> {
        let (addr, disp) = mem.lower()?;
        let mut desc = self.alloc.alloc(ins, InsFormat::M, attr, 0, disp);
        desc.addr = addr;
        self.append_instr(desc)
    }

    pub fn ins_i(&mut self, ins: Ins, attr: EmitAttr, imm: i64) -> EmitResult<()> {
        let desc = self.alloc.alloc(ins, InsFormat::I, attr, imm, 0);
        self.append_instr(desc)
    }

    fn label_ref(&mut self, ins: Ins, info: JumpInfo, reg: Option<AsmReg>, attr: EmitAttr) -> EmitResult<()> {
        let mut desc = self.alloc.alloc_jump(ins, attr, info);
        desc.reg1 = reg;
        self.append_instr(desc)
    }

    /// Branch to `label`; relaxation picks the smallest form that reaches.
    pub fn ins_jump(&mut self, ins: Ins, label: Label) -> EmitResult<()> {
        if !ins.is_variable_branch() {
            return Err(EmitError::internal(format!("{ins} is not a branch")));
        }
        self.label_ref(ins, JumpInfo::to_label(label), None, EmitAttr::B8)
    }

    /// Branch to `label` known to be in short range.
    pub fn ins_jump_short(&mut self, ins: Ins, label: Label) -> EmitResult<()> {
        if !ins.is_variable_branch() {
            return Err(EmitError::internal(format!("{ins} is not a branch")));
        }
        let mut info = JumpInfo::to_label(label);
        info.form = JumpForm::Short;
        self.label_ref(ins, info, None, EmitAttr::B8)
    }

    /// Local call into the start of a finally handler.
    pub fn ins_call_finally(&mut self, label: Label) -> EmitResult<()> {
        let mut info = JumpInfo::to_label(label);
        info.finally_call = true;
        self.label_ref(Ins::Call, info, None, EmitAttr::B8)
    }

    /// Branch out of a catch handler to its continuation.
    pub fn ins_catch_ret(&mut self, label: Label) -> EmitResult<()> {
        let mut info = JumpInfo::to_label(label);
        info.catch_ret = true;
        self.label_ref(Ins::Jmp, info, None, EmitAttr::B8)
    }

    /// Load the address of `label` into `reg`.
    pub fn ins_label_load(&mut self, reg: AsmReg, label: Label) -> EmitResult<()> {
        self.label_ref(Ins::Lea, JumpInfo::to_label(label), Some(reg), EmitAttr::B8)
    }

    /// Emit a call and move the codegen-time GC state past it.
    pub fn ins_call(&mut self, spec: &CallSpec) -> EmitResult<()> {
        let live = &spec.live_after;
        let gc_vars = if live.vars != self.this_gc.vars {
            Some(self.session.try_alloc_slice_copy(live.vars.words())? as &[u64])
        } else {
            None
        };

        let (fmt, reg1, addr, disp, target) = match spec.dest {
            CallDest::Method(handle) => (
                InsFormat::Method,
                None,
                AddrOperand::None,
                0,
                CallTarget::Method(handle),
            ),
            CallDest::Reg(reg) => (InsFormat::R, Some(reg), AddrOperand::None, 0, CallTarget::Indirect),
            CallDest::Mem(mem) => {
                let (addr, disp) = mem.lower()?;
                (InsFormat::M, None, addr, disp, CallTarget::Indirect)
            }
        };
        let info = CallInfo {
            target,
            arg_slots: spec.arg_slots,
            gc_vars,
            gcref_regs: live.gcref,
            byref_regs: live.byref,
            no_gc: spec.no_gc,
            disp,
        };
        let mut desc = self.alloc.alloc_call(fmt, spec.ret, info);
        desc.reg1 = reg1;
        desc.addr = addr;
        let ret_kind = desc.gc;
        self.append_instr(desc)?;

        self.this_gc = live.clone();
        let ret = self.target.int_return;
        match ret_kind {
            GcKind::GcRef => self.this_gc.gcref.insert(ret),
            GcKind::ByRef => self.this_gc.byref.insert(ret),
            GcKind::None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::TestContext;
    use crate::x64::regs::{RAX, RBP, RCX};

    fn body_groups<E: InstrEncoder>(em: &Emitter<'_, E>) -> Vec<GroupId> {
        em.group_ids().into_iter().skip(1).collect()
    }

    #[test]
    fn test_scratch_overflow_starts_extension_group() {
        let ctx = TestContext::new();
        let mut config = ctx.config();
        config.scratch_capacity = 3 * crate::instr::desc::SMALL_DESC_SIZE;
        ctx.with_emitter_config(config, |em| {
            for _ in 0..7 {
                em.ins_rr(Ins::Add, EmitAttr::B8, RAX, RCX).unwrap();
            }
            em.close_current().unwrap();

            let body = body_groups(em);
            assert_eq!(body.len(), 3);
            assert!(!em.group(body[0]).is_emit_add());
            assert!(em.group(body[1]).is_emit_add());
            assert!(em.group(body[2]).is_emit_add());
            assert_eq!(em.group(body[2]).instrs.len(), 1);
        });
    }

    #[test]
    fn test_stress_isolates_each_instruction() {
        let ctx = TestContext::new();
        let mut config = ctx.config();
        config.stress_new_groups = true;
        ctx.with_emitter_config(config, |em| {
            em.ins_rr(Ins::Mov, EmitAttr::B8, RAX, RCX).unwrap();
            em.ins_ri(Ins::Add, EmitAttr::B8, RAX, 1).unwrap();
            em.ins(Ins::Ret, EmitAttr::B8).unwrap();
            em.close_current().unwrap();

            let body = body_groups(em);
            assert_eq!(body.len(), 3);
            assert!(body.iter().all(|&g| em.group(g).instrs.len() == 1));
        });
    }

    #[test]
    fn test_label_binds_new_group_with_state() {
        TestContext::new().with_emitter(|em| {
            em.ins_rr(Ins::Mov, EmitAttr::GcRef, RAX, RCX).unwrap();

            let label = em.new_label();
            let state = GcState::new(Default::default(), RAX.mask(), Default::default());
            let group = em.define_label(label, &state).unwrap();
            assert_eq!(em.label_group(label), Some(group));
            assert_eq!(em.gc_state(), &state);

            em.ins(Ins::Ret, EmitAttr::B8).unwrap();
            em.close_current().unwrap();
            assert_eq!(em.group(group).gcref_regs, RAX.mask());
            assert!(!em.group(group).is_emit_add());
        });
    }

    #[test]
    fn test_label_defined_twice_fails() {
        TestContext::new().with_emitter(|em| {
            let label = em.new_label();
            em.define_label(label, &GcState::default()).unwrap();
            assert!(em.define_label(label, &GcState::default()).is_err());
        });
    }

    #[test]
    fn test_byref_stored_after_register_write() {
        TestContext::new().with_emitter(|em| {
            let first = em.new_label();
            let g1 = em.define_label(first, &GcState::default()).unwrap();
            em.ins_rm(Ins::Lea, EmitAttr::ByRef, RAX, Mem::base(RBP, -16))
                .unwrap();

            let second = em.new_label();
            let g2 = em.define_label(second, &GcState::default()).unwrap();
            em.ins(Ins::Ret, EmitAttr::B8).unwrap();
            let third = em.new_label();
            let g3 = em.define_label(third, &GcState::default()).unwrap();
            em.close_current().unwrap();

            assert!(!em.group(g1).flags.contains(IgFlags::BYREF_REGS));
            // The register write in the first group forces the next snapshot.
            assert!(em.group(g2).flags.contains(IgFlags::BYREF_REGS));
            assert!(!em.group(g3).flags.contains(IgFlags::BYREF_REGS));
        });
    }

    #[test]
    fn test_call_updates_codegen_state() {
        TestContext::new().with_emitter(|em| {
            em.ins_r(Ins::Push, EmitAttr::GcRef, RCX).unwrap();
            em.ins_r(Ins::Push, EmitAttr::B8, RCX).unwrap();
            assert_eq!(em.current_stack_level(), 2);

            let mut spec = CallSpec::method(3);
            spec.arg_slots = 2;
            spec.ret = EmitAttr::GcRef;
            em.ins_call(&spec).unwrap();

            assert_eq!(em.current_stack_level(), 0);
            assert_eq!(em.max_stack_depth(), 2);
            assert!(em.gc_state().gcref.contains(RAX));
        });
    }

    #[test]
    fn test_long_nop_is_split() {
        TestContext::new().with_emitter(|em| {
            let start = em.current_location();
            em.ins_nop(600).unwrap();
            let end = em.current_location();
            assert_eq!(end.group, start.group);
            assert_eq!(end.index, start.index + 3);

            let sizes: Vec<u32> = (0..3)
                .map(|i| {
                    let loc = EmitLocation {
                        index: start.index + i,
                        ..start
                    };
                    em.instruction_size_at(loc).unwrap()
                })
                .collect();
            assert_eq!(sizes, vec![255, 255, 90]);
        });
    }

    #[test]
    fn test_branch_lists() {
        TestContext::new().with_emitter(|em| {
            let label = em.new_label();
            em.ins_jump(Ins::Jmp, label).unwrap();
            em.define_label(label, &GcState::default()).unwrap();
            em.ins_jump(Ins::Jmp, label).unwrap();
            em.close_current().unwrap();

            assert_eq!(em.jump_refs().len(), 2);
            let first = em.jump_refs()[0];
            assert!(em.group(first.group).flags.contains(IgFlags::HAS_JUMPS));
            assert!(em.ins_jump(Ins::Ret, label).is_err());
        });
    }

    #[test]
    fn test_group_limit() {
        let ctx = TestContext::new();
        let mut config = ctx.config();
        config.max_groups = 3;
        ctx.with_emitter_config(config, |em| {
            let a = em.new_label();
            em.ins(Ins::Ret, EmitAttr::B8).unwrap();
            em.define_label(a, &GcState::default()).unwrap();
            em.ins(Ins::Ret, EmitAttr::B8).unwrap();
            let b = em.new_label();
            let err = em.define_label(b, &GcState::default()).unwrap_err();
            assert!(matches!(err, EmitError::TooManyGroups { limit: 3 }));
        });
    }

    #[test]
    fn test_local_var_operand_limits() {
        TestContext::new().with_emitter(|em| {
            assert!(em.ins_mr(Ins::Mov, EmitAttr::B8, Mem::lcl(5, 40000), RAX).is_ok());
            let err = em
                .ins_mr(Ins::Mov, EmitAttr::B8, Mem::lcl(5, 65536), RAX)
                .unwrap_err();
            assert!(err.is_impl_limit());
        });
    }

    #[test]
    fn test_no_gc_region_flags_groups() {
        TestContext::new().with_emitter(|em| {
            em.ins(Ins::Nop, EmitAttr::B1).unwrap();
            em.disable_gc().unwrap();
            em.ins_rr(Ins::Mov, EmitAttr::B8, RAX, RCX).unwrap();
            em.enable_gc().unwrap();
            em.ins(Ins::Ret, EmitAttr::B8).unwrap();
            em.close_current().unwrap();

            let body = body_groups(em);
            assert_eq!(body.len(), 3);
            assert!(!em.group(body[0]).flags.contains(IgFlags::NOGCINTERRUPT));
            assert!(em.group(body[1]).flags.contains(IgFlags::NOGCINTERRUPT));
            assert!(!em.group(body[2]).flags.contains(IgFlags::NOGCINTERRUPT));
        });
    }
}
