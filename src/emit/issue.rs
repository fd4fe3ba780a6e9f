// The emission pass. After relaxation every group has a final upper-bound size and offset. The
// pass asks the code allocator for hot, cold and data buffers, then walks the groups in method
// order, encoding each record at its actual offset. Actual sizes may undercut the provisional
// ones (an opportunistically shortened branch, a smaller displacement), so the pass keeps
// offs_adj, the difference between planned and actual offsets, and resolves forward branches
// against planned target offsets minus that adjustment; when a target later lands elsewhere the
// branch is patched in place. The walk also drives the GC tracker: group entry snapshots first,
// then per-instruction effects at instruction end offsets. Branches crossing between hot and
// cold are left as relocations. At the end the hot buffer is padded up to the cold split, the
// data section is written, and every location and unwind event is resolved to an offset.

//! Final code emission.

use log::{debug, info, trace, warn};

use super::group::{GroupId, IgFlags, Label};
use super::placeholder::UnwindEvent;
use super::relax::RelaxStats;
use super::{EmitLocation, Emitter};
use crate::core::code_alloc::{CodeAllocator, CodeRequest};
use crate::core::encoder::{
    EncodeContext, EncodingError, InstrEncoder, RelocKind, RelocTarget, Relocation, Section,
};
use crate::core::error::{EmitError, EmitResult};
use crate::core::frame::FrameLayout;
use crate::core::target::JumpForm;
use crate::core::varset::VarSet;
use crate::gc::{GcInfo, GcTracker, StackMode};
use crate::instr::alloc::defined_gc_kind;
use crate::instr::desc::{AddrOperand, GcKind, Ins, InsFormat, InstrDesc};

/// Counters of one emitted method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitStats {
    pub groups: usize,
    pub instructions: usize,
    pub relax: RelaxStats,
    /// Forward branches rewritten after their target moved.
    pub patches_applied: usize,
    /// Bytes of padding between the hot code and the cold split.
    pub hot_padding: u32,
}

/// Everything produced for one method.
#[derive(Debug, Clone)]
pub struct EmitOutput {
    pub hot: Vec<u8>,
    pub cold: Vec<u8>,
    pub data: Vec<u8>,
    pub hot_addr: u64,
    pub cold_addr: u64,
    pub data_addr: u64,
    /// Total code bytes, hot plus cold.
    pub code_size: u32,
    pub hot_size: u32,
    pub cold_size: u32,
    pub prolog_size: u32,
    pub gc_info: GcInfo,
    pub relocations: Vec<Relocation>,
    pub unwind_events: Vec<UnwindEvent>,
    pub stats: EmitStats,
    group_offsets: Vec<u32>,
    instr_sizes: Vec<Vec<u8>>,
}

impl EmitOutput {
    /// Final code offset of a location.
    pub fn location_offset(&self, loc: EmitLocation) -> Option<u32> {
        let base = *self.group_offsets.get(loc.group.index())?;
        let sizes = self.instr_sizes.get(loc.group.index())?;
        if loc.index as usize > sizes.len() {
            return None;
        }
        let within: u32 = sizes[..loc.index as usize].iter().map(|&s| s as u32).sum();
        Some(base + within)
    }

    /// Final offset of a group.
    pub fn group_offset(&self, group: GroupId) -> Option<u32> {
        self.group_offsets.get(group.index()).copied()
    }

    /// Hot and cold code as one contiguous image.
    pub fn code(&self) -> Vec<u8> {
        let mut code = self.hot.clone();
        code.extend_from_slice(&self.cold);
        code
    }
}

/// A forward branch encoded against a provisional target offset.
struct PendingPatch {
    in_cold: bool,
    /// Offset of the displacement inside its buffer.
    site: usize,
    width: u8,
    provisional: u32,
    target: GroupId,
}

/// A branch between hot and cold code, relocated once its target is placed.
struct CrossRef {
    section: Section,
    offset: u32,
    addend: i64,
    target: GroupId,
}

/// Output cursor of the emission pass.
struct IssueState {
    hot: Box<[u8]>,
    cold: Box<[u8]>,
    hot_size: u32,
    in_cold: bool,
    /// Actual offset of the next byte, in the unified hot+cold offset space.
    cur_offset: u32,
    /// Planned minus actual offset of the current group.
    offs_adj: u32,
    patches: Vec<PendingPatch>,
    cross: Vec<CrossRef>,
    relocs: Vec<Relocation>,
    hot_padding: u32,
    instructions: usize,
}

impl IssueState {
    fn section(&self) -> Section {
        if self.in_cold {
            Section::Cold
        } else {
            Section::Hot
        }
    }

    /// Position of the next byte inside the current buffer.
    fn buffer_pos(&self) -> usize {
        if self.in_cold {
            (self.cur_offset - self.hot_size) as usize
        } else {
            self.cur_offset as usize
        }
    }

    fn write(&mut self, bytes: &[u8], desc: &InstrDesc<'_>) -> EmitResult<usize> {
        let pos = self.buffer_pos();
        let buf = if self.in_cold {
            &mut self.cold
        } else {
            &mut self.hot
        };
        let dst = buf
            .get_mut(pos..pos + bytes.len())
            .ok_or(EmitError::SizeOverflow {
                num: desc.num,
                provisioned: desc.code_size as u32,
                actual: bytes.len() as u32,
            })?;
        dst.copy_from_slice(bytes);
        self.cur_offset += bytes.len() as u32;
        Ok(pos)
    }
}

fn branch_error(err: EncodingError) -> EmitError {
    match err {
        EncodingError::DisplacementOutOfRange(distance) => EmitError::BranchOutOfRange { distance },
        other => EmitError::Encoding(other),
    }
}

impl<'a, E: InstrEncoder> Emitter<'a, E> {
    /// Encode the method into buffers from `alloc`, producing code, data, GC
    /// information, relocations and resolved unwind events.
    pub fn end_code_gen(
        &mut self,
        alloc: &mut dyn CodeAllocator,
        frame: &FrameLayout,
    ) -> EmitResult<EmitOutput> {
        if self.emitted {
            return Err(EmitError::internal("method already emitted"));
        }
        self.close_current()?;
        if let Some(&ph) = self.placeholders.first() {
            return Err(EmitError::UnmaterializedPlaceholder {
                num: self.groups[ph.index()].num,
            });
        }
        let relax = match self.relax_stats {
            Some(stats) => stats,
            None => self.jump_dist_bind()?,
        };
        self.recompute_offsets();
        if self.total_code_size == 0 {
            warn!("emitting a method with no code");
        }

        let stack_mode = if !self.config.fully_interruptible
            && self.max_stack_depth <= self.config.max_simple_stack_depth
        {
            StackMode::Simple
        } else {
            StackMode::Table
        };
        let planned_hot = match self.first_cold {
            Some(cold) => self.groups[cold.index()].offset,
            None => self.total_code_size,
        };
        let request = CodeRequest {
            hot_size: planned_hot,
            cold_size: self.total_code_size - planned_hot,
            data_size: self.data.size(),
            data_align8: self.data.align8(),
        };
        let blocks = alloc.allocate(&request)?;
        debug!(
            "emitting {:#x} hot + {:#x} cold + {:#x} data bytes ({:?} stack)",
            request.hot_size, request.cold_size, request.data_size, stack_mode
        );

        let mut tracker = GcTracker::new(
            &self.target,
            frame,
            self.config.fully_interruptible,
            stack_mode,
        );
        let mut st = IssueState {
            hot: blocks.hot,
            cold: blocks.cold,
            hot_size: planned_hot,
            in_cold: false,
            cur_offset: 0,
            offs_adj: 0,
            patches: Vec::new(),
            cross: Vec::new(),
            relocs: Vec::new(),
            hot_padding: 0,
            instructions: 0,
        };
        let mut buf = Vec::with_capacity(16);
        let mut no_gc_start = None;

        let order = self.group_ids();
        let mut expected_num = 0;
        for &id in &order {
            if Some(id) == self.first_cold {
                if st.cur_offset > planned_hot {
                    return Err(EmitError::OffsetMismatch {
                        num: self.groups[id.index()].num,
                        expected: planned_hot,
                        actual: st.cur_offset,
                    });
                }
                let pad = (planned_hot - st.cur_offset) as usize;
                let start = st.cur_offset as usize;
                st.hot[start..start + pad].fill(self.target.pad_byte);
                st.hot_padding = pad as u32;
                st.cur_offset = planned_hot;
                st.in_cold = true;
            }

            let group = &self.groups[id.index()];
            if group.num != expected_num {
                return Err(EmitError::internal(format!(
                    "group numbers out of order: IG{:02} where IG{expected_num:02} was expected",
                    group.num
                )));
            }
            expected_num += 1;
            if st.cur_offset > group.offset {
                return Err(EmitError::OffsetMismatch {
                    num: group.num,
                    expected: group.offset,
                    actual: st.cur_offset,
                });
            }
            st.offs_adj = group.offset - st.cur_offset;
            self.groups[id.index()].offset = st.cur_offset;
            self.issue_group_entry(id, &mut tracker, &mut no_gc_start, st.cur_offset)?;

            let group_start = st.cur_offset;
            for index in 0..self.groups[id.index()].instrs.len() {
                self.issue_instr(id, index, frame, &mut st, &mut tracker, &mut buf)?;
            }
            self.groups[id.index()].size = st.cur_offset - group_start;
        }
        if let Some(begin) = no_gc_start {
            tracker.add_no_gc_region(begin, st.cur_offset);
        }

        let code_size = st.cur_offset;
        if code_size > self.total_code_size {
            return Err(EmitError::internal(format!(
                "emitted {code_size:#x} bytes, more than the {:#x} planned",
                self.total_code_size
            )));
        }
        self.total_code_size = code_size;
        let (hot_size, cold_size) = if st.in_cold {
            (planned_hot, code_size - planned_hot)
        } else {
            (code_size, 0)
        };

        let patches_applied = self.apply_patches(&mut st)?;
        for cross in std::mem::take(&mut st.cross) {
            st.relocs.push(Relocation {
                section: cross.section,
                offset: cross.offset,
                kind: RelocKind::Rel32,
                target: RelocTarget::Code(self.groups[cross.target.index()].offset),
                addend: cross.addend,
            });
        }

        // Data section.
        let mut data = blocks.data.into_vec();
        let body_start = self.groups[self.prolog_group.index()].end();
        let data_relocs = {
            let groups = &self.groups;
            let labels = &self.labels;
            self.data.write_into(&mut data, body_start, |label: Label| {
                let group = labels
                    .get(label.0 as usize)
                    .copied()
                    .flatten()
                    .ok_or(EmitError::UnboundLabel { label: label.0 })?;
                let offset = groups[group.index()].offset;
                let addr = if offset < hot_size {
                    blocks.hot_addr + offset as u64
                } else {
                    blocks.cold_addr + (offset - hot_size) as u64
                };
                Ok((offset, addr))
            })?
        };
        data.truncate(self.data.size() as usize);
        st.relocs.extend(data_relocs);

        let gc_info = tracker.finish(code_size);

        let group_offsets: Vec<u32> = self.groups.iter().map(|g| g.offset).collect();
        let instr_sizes: Vec<Vec<u8>> = self
            .groups
            .iter()
            .map(|g| g.instrs.iter().map(|d| d.code_size).collect())
            .collect();
        let mut output = EmitOutput {
            hot: Vec::new(),
            cold: Vec::new(),
            data,
            hot_addr: blocks.hot_addr,
            cold_addr: blocks.cold_addr,
            data_addr: blocks.data_addr,
            code_size,
            hot_size,
            cold_size,
            prolog_size: 0,
            gc_info,
            relocations: std::mem::take(&mut st.relocs),
            unwind_events: Vec::new(),
            stats: EmitStats {
                groups: order.len(),
                instructions: st.instructions,
                relax,
                patches_applied,
                hot_padding: st.hot_padding,
            },
            group_offsets,
            instr_sizes,
        };
        output.prolog_size = match self.prolog_end {
            Some(loc) => output.location_offset(loc).unwrap_or(0),
            None => self.groups[self.prolog_group.index()].size,
        };
        output.unwind_events = self
            .unwind_events
            .iter()
            .filter_map(|&(kind, loc)| {
                output
                    .location_offset(loc)
                    .map(|offset| UnwindEvent { kind, offset })
            })
            .collect();

        let mut hot = st.hot.into_vec();
        hot.truncate(hot_size as usize);
        let mut cold = st.cold.into_vec();
        cold.truncate(cold_size as usize);
        output.hot = hot;
        output.cold = cold;

        self.emitted = true;
        self.session.record_method_emitted(code_size as usize);
        info!(
            "emitted {} groups, {} instructions, {:#x} code bytes ({} patched, {} shortened)",
            output.stats.groups,
            output.stats.instructions,
            code_size,
            patches_applied,
            relax.shortened
        );
        Ok(output)
    }

    /// Apply the GC snapshot stored on a group at its entry.
    fn issue_group_entry(
        &mut self,
        id: GroupId,
        tracker: &mut GcTracker,
        no_gc_start: &mut Option<u32>,
        offset: u32,
    ) -> EmitResult<()> {
        let group = &self.groups[id.index()];
        let region = id == self.prolog_group
            || group.flags.intersects(IgFlags::EPILOG | IgFlags::FUNCLET_EPILOG | IgFlags::FUNCLET_PROLOG);

        if group.flags.contains(IgFlags::NOGCINTERRUPT) {
            no_gc_start.get_or_insert(offset);
        } else if let Some(begin) = no_gc_start.take() {
            tracker.add_no_gc_region(begin, offset);
        }

        if !region {
            let level = group.stack_level;
            if level > tracker.stack_level() {
                let count = level - tracker.stack_level();
                tracker.stack_push_n(count, offset)?;
            } else if level < tracker.stack_level() {
                let count = tracker.stack_level() - level;
                tracker.stack_pop(count, false, offset)?;
            }
        }
        tracker.set_in_epilog(group.is_epilog());

        if !group.is_emit_add() {
            match group.gc_var_set() {
                Some(vars) => tracker.update_live_vars(&vars, offset)?,
                None => {
                    let vars = tracker.live_vars().clone();
                    tracker.update_live_vars(&vars, offset)?;
                }
            }
            tracker.update_live_regs(GcKind::GcRef, group.gcref_regs, offset);
            if group.flags.contains(IgFlags::BYREF_REGS) {
                tracker.update_live_regs(GcKind::ByRef, group.byref_regs, offset);
            }
        }
        trace!("IG{:02} at {offset:#06x}", group.num);
        Ok(())
    }

    fn issue_instr(
        &mut self,
        id: GroupId,
        index: usize,
        frame: &FrameLayout,
        st: &mut IssueState,
        tracker: &mut GcTracker,
        buf: &mut Vec<u8>,
    ) -> EmitResult<()> {
        let mut desc = self.groups[id.index()].instrs[index];
        let start = st.cur_offset;
        buf.clear();

        if let Some(jump) = desc.jump().copied() {
            let target = jump
                .bound_group()
                .ok_or_else(|| EmitError::internal("branch left unbound"))?;
            let cur_num = self.groups[id.index()].num;
            let tgt = &self.groups[target.index()];
            let forward = tgt.num > cur_num;
            let dst = if forward {
                tgt.offset - st.offs_adj
            } else {
                tgt.offset
            };
            let cross = self.first_cold.is_some() && self.is_cold(target) != st.in_cold;

            let mut form = jump.form;
            let limits = self.target.branch;
            if form != JumpForm::Short && desc.ins.is_variable_branch() && !jump.keep_long && !cross {
                let cond = desc.ins.is_cond_branch();
                let src = limits.src_encoding_offset(start, cond) as i64;
                let fits = if forward {
                    dst as i64 - src <= limits.short.max_pos
                } else {
                    src - dst as i64 <= -limits.short.max_neg
                };
                if fits {
                    form = JumpForm::Short;
                }
            }

            let site = self
                .encoder
                .encode_jump(&desc, form, start, dst, buf)
                .map_err(branch_error)?;
            if buf.len() > desc.code_size as usize {
                return Err(EmitError::SizeOverflow {
                    num: desc.num,
                    provisioned: desc.code_size as u32,
                    actual: buf.len() as u32,
                });
            }
            let disp_at = site.disp_offset as usize;
            if cross {
                buf[disp_at..disp_at + site.width as usize].fill(0);
            }
            let pos = st.write(buf, &desc)?;
            if cross {
                st.cross.push(CrossRef {
                    section: st.section(),
                    offset: (pos + disp_at) as u32,
                    addend: -((buf.len() - disp_at) as i64),
                    target,
                });
            } else if forward {
                st.patches.push(PendingPatch {
                    in_cold: st.in_cold,
                    site: pos + disp_at,
                    width: site.width,
                    provisional: dst,
                    target,
                });
            }
            if let Some(info) = desc.jump_mut() {
                info.form = form;
            }
        } else {
            let ctx = EncodeContext {
                offset: start,
                target: &self.target,
                frame: Some(frame),
            };
            let relocs = self.encoder.encode(&desc, &ctx, buf)?;
            if buf.len() > desc.code_size as usize {
                return Err(EmitError::SizeOverflow {
                    num: desc.num,
                    provisioned: desc.code_size as u32,
                    actual: buf.len() as u32,
                });
            }
            let pos = st.write(buf, &desc)?;
            let section = st.section();
            st.relocs.extend(relocs.into_iter().map(|mut r| {
                r.section = section;
                r.offset += pos as u32;
                r
            }));
        }

        desc.code_size = buf.len() as u8;
        self.groups[id.index()].instrs[index] = desc;
        st.instructions += 1;

        let region = self.in_unsplittable_region(id);
        self.instr_gc_effects(&desc, start, st.cur_offset, frame, tracker, region)
    }

    fn instr_gc_effects(
        &self,
        desc: &InstrDesc<'_>,
        start: u32,
        end: u32,
        frame: &FrameLayout,
        tracker: &mut GcTracker,
        region: bool,
    ) -> EmitResult<()> {
        if let Some(call) = desc.call() {
            if let Some(words) = call.gc_vars {
                tracker.update_live_vars(&VarSet::from_words(words), start)?;
            }
            let mut gcref = call.gcref_regs;
            let mut byref = call.byref_regs;
            match desc.gc {
                GcKind::GcRef => gcref.insert(self.target.int_return),
                GcKind::ByRef => byref.insert(self.target.int_return),
                GcKind::None => {}
            }
            tracker.update_live_regs(GcKind::GcRef, gcref, end);
            tracker.update_live_regs(GcKind::ByRef, byref, end);
            if call.arg_slots > 0 {
                tracker.stack_pop(call.arg_slots as u32, true, end)?;
            } else if call.arg_slots < 0 {
                tracker.stack_kill_args(call.arg_slots.unsigned_abs(), end)?;
            }
            if !self.config.fully_interruptible && !call.no_gc {
                tracker.record_call(end, end - start);
            }
            return Ok(());
        }

        if !region {
            match desc.ins {
                Ins::Push => tracker.stack_push(desc.gc, end)?,
                Ins::Pop => tracker.stack_pop(1, false, end)?,
                _ => {}
            }
        }

        if let (Some(kind), Some(reg)) = (defined_gc_kind(desc), desc.reg1) {
            tracker.reg_live(reg, kind, end);
        }

        if desc.ins == Ins::Mov && matches!(desc.fmt, InsFormat::MR | InsFormat::MI) {
            if let AddrOperand::Lcl(lv) = desc.addr {
                if let Some(slot) = frame.frame_offset(lv) {
                    if desc.gc.is_gc() {
                        tracker.var_live(slot, end);
                    } else {
                        tracker.var_dead(slot, end);
                    }
                }
            }
        }
        Ok(())
    }

    /// Rewrite forward branches whose target ended up before its planned offset.
    fn apply_patches(&self, st: &mut IssueState) -> EmitResult<usize> {
        let mut applied = 0;
        for patch in &st.patches {
            let actual = self.groups[patch.target.index()].offset;
            if actual == patch.provisional {
                continue;
            }
            let adjust = actual as i64 - patch.provisional as i64;
            let code: &mut [u8] = if patch.in_cold { &mut st.cold } else { &mut st.hot };
            self.encoder
                .patch_jump(code, patch.site, patch.width, adjust)
                .map_err(branch_error)?;
            applied += 1;
        }
        if applied > 0 {
            debug!("patched {applied} forward branches");
        }
        Ok(applied)
    }
}
