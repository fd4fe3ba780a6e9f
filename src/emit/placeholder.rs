//! Prolog and epilog placeholders.
//!
//! Prologs and epilogs are generated after the method body, once the frame
//! layout is final. While the body is built, each one is represented by a
//! placeholder group reserving a fixed byte budget and remembering the GC
//! state around it. [`Emitter::generate_prolog_epilog`] then visits the
//! placeholders in method order and lets a [`PrologEpilogGenerator`] emit
//! their instructions in place.

use log::debug;

use super::group::{GroupId, IgFlags, PlaceholderData, PlaceholderKind};
use super::{EmitLocation, Emitter};
use crate::core::encoder::InstrEncoder;
use crate::core::error::{EmitError, EmitResult};
use crate::gc::GcState;

/// Unwind-relevant points of the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnwindEventKind {
    PrologBegin,
    PrologEnd,
    EpilogBegin,
    EpilogEnd,
    FuncletPrologBegin,
    FuncletPrologEnd,
    FuncletEpilogBegin,
    FuncletEpilogEnd,
}

/// An unwind event resolved to a code offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindEvent {
    pub kind: UnwindEventKind,
    pub offset: u32,
}

/// Generates the code of materialized placeholders.
pub trait PrologEpilogGenerator<'a, E: InstrEncoder> {
    /// Emit the method prolog. Calls [`Emitter::mark_prolog_end`] where the
    /// prolog proper ends, if anything follows it in the prolog group.
    fn gen_prolog(&mut self, em: &mut Emitter<'a, E>) -> EmitResult<()>;

    fn gen_epilog(&mut self, em: &mut Emitter<'a, E>, block: u32) -> EmitResult<()>;

    fn gen_funclet_prolog(&mut self, em: &mut Emitter<'a, E>, block: u32) -> EmitResult<()> {
        let _ = (em, block);
        Ok(())
    }

    fn gen_funclet_epilog(&mut self, em: &mut Emitter<'a, E>, block: u32) -> EmitResult<()> {
        let _ = (em, block);
        Ok(())
    }
}

impl<'a, E: InstrEncoder> Emitter<'a, E> {
    /// Reserve a placeholder for an epilog or funclet region.
    ///
    /// `gc` is the GC state at the placeholder. With `last`, no group is
    /// opened after it; the next instruction or label opens one.
    pub fn create_placeholder(
        &mut self,
        kind: PlaceholderKind,
        block: u32,
        gc: &GcState,
        last: bool,
    ) -> EmitResult<GroupId> {
        if kind == PlaceholderKind::Prolog {
            return Err(EmitError::internal("the prolog placeholder is created with the emitter"));
        }
        let emit_add = kind.is_epilog();
        if self.cur_ig_nonempty() {
            self.nxt_ig(emit_add)?;
        }
        let id = self.ensure_current()?;

        let budget = self.config.placeholder_size;
        let group = &mut self.groups[id.index()];
        group.flags.insert(IgFlags::PLACEHOLDER | kind.flag());
        if emit_add {
            group.flags.insert(IgFlags::EMIT_ADD);
        }
        group.func_idx = self.cur_func_idx;
        group.size = budget;
        group.placeholder = Some(Box::new(PlaceholderData {
            kind,
            block,
            prev_state: self.prev_gc.clone(),
            init_state: gc.clone(),
        }));
        let num = group.num;

        self.cur_code_offset = group.offset + budget;
        self.total_code_size = self.total_code_size.max(self.cur_code_offset);
        self.placeholders.push(id);
        self.this_gc = gc.clone();
        self.cur_group = None;
        // Whatever follows cannot rely on the placeholder's unsaved state.
        self.force_store_gc_state = true;
        debug!("IG{num:02}: {kind:?} placeholder for block {block}");

        if !last {
            let next = self.new_ig(Some(id))?;
            self.gen_ig(next, false, Some(id));
            self.groups[next.index()].flags.remove(IgFlags::PROPAGATE);
        }
        Ok(id)
    }

    /// Number of placeholders still waiting for code.
    pub fn pending_placeholders(&self) -> usize {
        self.placeholders.len()
    }

    /// Start generating the method prolog into its reserved group.
    pub fn begin_prolog(&mut self) -> EmitResult<()> {
        let id = self.prolog_group;
        if !self.groups[id.index()].is_placeholder() {
            return Err(EmitError::internal("prolog already generated"));
        }
        self.open_placeholder(id);
        self.this_gc = GcState::default();
        self.init_gc = GcState::default();
        self.prev_gc = GcState::default();
        self.unwind_event(UnwindEventKind::PrologBegin);
        Ok(())
    }

    /// Record where the prolog proper ends.
    pub fn mark_prolog_end(&mut self) {
        self.prolog_end = Some(self.current_location());
        self.unwind_event(UnwindEventKind::PrologEnd);
    }

    /// Finish the prolog group.
    pub fn end_prolog(&mut self) -> EmitResult<()> {
        if self.generating != Some(self.prolog_group) {
            return Err(EmitError::internal("end_prolog without begin_prolog"));
        }
        if self.prolog_end.is_none() {
            self.mark_prolog_end();
        }
        self.finish_placeholder(false)
    }

    /// Start generating the code of placeholder `id`.
    pub fn begin_prolog_epilog(&mut self, id: GroupId) -> EmitResult<()> {
        let Some(ph) = self.groups[id.index()].placeholder.as_deref().cloned() else {
            return Err(EmitError::internal(format!(
                "IG{:02} is not a placeholder",
                self.groups[id.index()].num
            )));
        };
        self.open_placeholder(id);
        self.cur_func_idx = self.groups[id.index()].func_idx;
        self.prev_gc = ph.prev_state;
        self.init_gc = ph.init_state.clone();
        self.this_gc = ph.init_state;
        self.unwind_event(match ph.kind {
            PlaceholderKind::Prolog => UnwindEventKind::PrologBegin,
            PlaceholderKind::Epilog => UnwindEventKind::EpilogBegin,
            PlaceholderKind::FuncletProlog => UnwindEventKind::FuncletPrologBegin,
            PlaceholderKind::FuncletEpilog => UnwindEventKind::FuncletEpilogBegin,
        });
        Ok(())
    }

    /// Finish the placeholder being generated.
    pub fn end_prolog_epilog(&mut self) -> EmitResult<()> {
        let Some(id) = self.generating else {
            return Err(EmitError::internal("no placeholder is being generated"));
        };
        let kind = self.groups[id.index()]
            .placeholder
            .as_ref()
            .map(|ph| ph.kind)
            .ok_or_else(|| EmitError::internal("placeholder data missing"))?;
        self.unwind_event(match kind {
            PlaceholderKind::Prolog => UnwindEventKind::PrologEnd,
            PlaceholderKind::Epilog => UnwindEventKind::EpilogEnd,
            PlaceholderKind::FuncletProlog => UnwindEventKind::FuncletPrologEnd,
            PlaceholderKind::FuncletEpilog => UnwindEventKind::FuncletEpilogEnd,
        });
        self.finish_placeholder(kind.is_epilog())
    }

    /// Materialize every placeholder in method order, then recompute offsets.
    pub fn generate_prolog_epilog<G>(&mut self, generator: &mut G) -> EmitResult<()>
    where
        G: PrologEpilogGenerator<'a, E>,
    {
        self.close_current()?;
        let saved_func = self.cur_func_idx;
        let mut pending = std::mem::take(&mut self.placeholders);
        pending.sort_by_key(|id| self.groups[id.index()].num);

        for id in pending {
            let Some((kind, block)) = self.groups[id.index()]
                .placeholder
                .as_ref()
                .map(|ph| (ph.kind, ph.block))
            else {
                continue;
            };
            match kind {
                PlaceholderKind::Prolog => {
                    self.begin_prolog()?;
                    generator.gen_prolog(self)?;
                    self.end_prolog()?;
                }
                PlaceholderKind::Epilog => {
                    self.begin_prolog_epilog(id)?;
                    generator.gen_epilog(self, block)?;
                    self.end_prolog_epilog()?;
                }
                PlaceholderKind::FuncletProlog => {
                    self.begin_prolog_epilog(id)?;
                    generator.gen_funclet_prolog(self, block)?;
                    self.end_prolog_epilog()?;
                }
                PlaceholderKind::FuncletEpilog => {
                    self.begin_prolog_epilog(id)?;
                    generator.gen_funclet_epilog(self, block)?;
                    self.end_prolog_epilog()?;
                }
            }
        }
        self.cur_func_idx = saved_func;
        self.finish_prolog_epilog_generation();
        Ok(())
    }

    /// Recompute offsets once every placeholder holds its real code.
    pub fn finish_prolog_epilog_generation(&mut self) {
        self.recompute_offsets();
        debug!(
            "prolog/epilog generation done: {} groups, {:#x} bytes",
            self.groups.len(),
            self.total_code_size
        );
    }

    fn open_placeholder(&mut self, id: GroupId) {
        self.generating = Some(id);
        self.cur_group = Some(id);
        self.scratch.clear();
        self.scratch_bytes = 0;
        self.cur_ig_size = 0;
        self.cur_code_offset = self.groups[id.index()].offset;
        self.no_gc = true;
        self.groups[id.index()].flags.insert(IgFlags::NOGCINTERRUPT);
    }

    fn finish_placeholder(&mut self, emit_add: bool) -> EmitResult<()> {
        let Some(id) = self.generating else {
            return Err(EmitError::internal("no placeholder is being generated"));
        };
        let budget = self.groups[id.index()].size;
        if self.cur_ig_size > budget {
            return Err(EmitError::PlaceholderOverflow {
                num: self.groups[id.index()].num,
                size: self.cur_ig_size,
                budget,
            });
        }
        self.save_ig(emit_add)?;

        let group = &mut self.groups[id.index()];
        group.flags.remove(IgFlags::PLACEHOLDER);
        group.placeholder = None;
        self.total_code_size -= budget - group.size;
        self.placeholders.retain(|&p| p != id);
        self.generating = None;
        self.no_gc = false;
        Ok(())
    }

    fn unwind_event(&mut self, kind: UnwindEventKind) {
        let loc = self.current_location();
        self.unwind_events.push((kind, loc));
    }

    /// Unwind events recorded so far, by location.
    pub fn unwind_locations(&self) -> &[(UnwindEventKind, EmitLocation)] {
        &self.unwind_events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::{NoPrologEpilog, TestContext};
    use crate::instr::desc::{EmitAttr, Ins};
    use crate::x64::regs::{RAX, RBP, RSP};

    struct Frame;

    impl<'a, E: InstrEncoder> PrologEpilogGenerator<'a, E> for Frame {
        fn gen_prolog(&mut self, em: &mut Emitter<'a, E>) -> EmitResult<()> {
            em.ins_r(Ins::Push, EmitAttr::B8, RBP)?;
            em.ins_rr(Ins::Mov, EmitAttr::B8, RBP, RSP)?;
            em.mark_prolog_end();
            Ok(())
        }

        fn gen_epilog(&mut self, em: &mut Emitter<'a, E>, _block: u32) -> EmitResult<()> {
            em.ins_r(Ins::Pop, EmitAttr::B8, RBP)?;
            em.ins(Ins::Ret, EmitAttr::B8)
        }
    }

    #[test]
    fn test_prolog_and_epilog_materialize() {
        TestContext::new().with_emitter(|em| {
            em.ins_ri(Ins::Mov, EmitAttr::B4, RAX, 1).unwrap();
            let epilog = em
                .create_placeholder(PlaceholderKind::Epilog, 1, &GcState::default(), true)
                .unwrap();
            assert_eq!(em.pending_placeholders(), 2);
            assert!(em.group(epilog).is_emit_add());
            assert!(em.group(epilog).is_epilog());

            em.generate_prolog_epilog(&mut Frame).unwrap();
            assert_eq!(em.pending_placeholders(), 0);

            let prolog = em.group(em.prolog_group());
            assert!(!prolog.is_placeholder());
            assert_eq!(prolog.size, 4); // push rbp; mov rbp, rsp
            assert!(prolog.flags.contains(IgFlags::NOGCINTERRUPT));
            assert_eq!(em.group(epilog).size, 2);
            em.check_offsets().unwrap();

            let kinds: Vec<_> = em.unwind_locations().iter().map(|(k, _)| *k).collect();
            assert_eq!(
                kinds,
                vec![
                    UnwindEventKind::PrologBegin,
                    UnwindEventKind::PrologEnd,
                    UnwindEventKind::EpilogBegin,
                    UnwindEventKind::EpilogEnd,
                ]
            );
        });
    }

    #[test]
    fn test_placeholder_budget_enforced() {
        let ctx = TestContext::new();
        let mut config = ctx.config();
        config.placeholder_size = 3;
        ctx.with_emitter_config(config, |em| {
            em.ins(Ins::Ret, EmitAttr::B8).unwrap();
            let err = em.generate_prolog_epilog(&mut Frame).unwrap_err();
            assert!(matches!(err, EmitError::PlaceholderOverflow { size: 4, budget: 3, .. }));
        });
    }

    #[test]
    fn test_group_after_placeholder_stores_state() {
        TestContext::new().with_emitter(|em| {
            em.ins(Ins::Nop, EmitAttr::B1).unwrap();
            let state = GcState::new(Default::default(), RAX.mask(), Default::default());
            em.create_placeholder(PlaceholderKind::Epilog, 1, &state, false)
                .unwrap();
            em.ins(Ins::Ret, EmitAttr::B8).unwrap();
            let after = em.current_group().unwrap();
            em.generate_prolog_epilog(&mut NoPrologEpilog).unwrap();

            let group = em.group(after);
            assert!(!group.is_emit_add());
            assert!(!group.is_epilog());
            assert!(group.flags.contains(IgFlags::GC_VARS | IgFlags::BYREF_REGS));
            assert_eq!(group.gcref_regs, RAX.mask());
        });
    }

    #[test]
    fn test_prolog_placeholder_is_rejected() {
        TestContext::new().with_emitter(|em| {
            let err = em
                .create_placeholder(PlaceholderKind::Prolog, 0, &GcState::default(), true)
                .unwrap_err();
            assert!(matches!(err, EmitError::Internal { .. }));
        });
    }
}
