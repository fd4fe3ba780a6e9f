// Branch relaxation. Every label-targeted branch starts out in its longest form. This pass binds
// branch targets to groups, then walks the global branch list in source order computing each
// branch's distance from the provisional offsets, and shrinks branches that reach their target in
// a smaller form. Shrinking a branch pulls in every later branch and group, so the walk carries
// two running adjustments: adj_ig for group offsets (applied lazily as the walk reaches each
// group) and adj_lj for branch offsets inside the group being walked. Forward targets have not
// been adjusted yet when seen, so their offsets are corrected by adj_ig on the fly. Passes repeat
// while some branch missed by less than what the previous pass removed, since it may fit now.
// Sizes only ever shrink, which makes the pass terminate.

//! Branch distance binding and relaxation.

use log::{debug, trace};

use super::group::IgFlags;
use super::Emitter;
use crate::core::encoder::InstrEncoder;
use crate::core::error::{EmitError, EmitResult};
use crate::core::funclet::check_funclet_branch;
use crate::core::target::JumpForm;
use crate::instr::desc::{Ins, JumpTarget};

/// What relaxation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaxStats {
    pub passes: usize,
    /// Branches moved to a smaller form.
    pub shortened: usize,
    pub bytes_removed: u32,
}

impl<'a, E: InstrEncoder> Emitter<'a, E> {
    /// Bind every branch to its target group and shrink what can be shrunk.
    pub fn jump_dist_bind(&mut self) -> EmitResult<RelaxStats> {
        self.close_current()?;
        if let Some(&ph) = self.placeholders.first() {
            return Err(EmitError::UnmaterializedPlaceholder {
                num: self.groups[ph.index()].num,
            });
        }
        self.recompute_offsets();
        self.bind_jumps()?;

        let groups = &self.groups;
        self.jumps.sort_by_key(|j| {
            let group = &groups[j.group.index()];
            let offs = group.instrs[j.index as usize].jump().map_or(0, |ji| ji.offs);
            (group.num, offs)
        });

        let limits = self.target.branch;
        let mut stats = RelaxStats::default();
        loop {
            stats.passes += 1;
            let mut lst_ig = None;
            let mut adj_ig: u32 = 0;
            let mut adj_lj: u32 = 0;
            let mut min_short_extra = u32::MAX;
            let mut min_medium_extra = u32::MAX;

            for jr in 0..self.jumps.len() {
                let jmp = self.jumps[jr];
                let jmp_ig = jmp.group;

                if lst_ig != Some(jmp_ig) {
                    // Catch up the groups between the previous branch's group and this one.
                    if let Some(mut g) = lst_ig {
                        while g != jmp_ig {
                            let Some(next) = self.groups[g.index()].next else {
                                return Err(EmitError::internal("branch list out of group order"));
                            };
                            g = next;
                            self.groups[g.index()].offset -= adj_ig;
                        }
                    }
                    adj_lj = 0;
                    lst_ig = Some(jmp_ig);
                }

                let group_offs = self.groups[jmp_ig.index()].offset;
                let jmp_num = self.groups[jmp_ig.index()].num;
                let desc = &self.groups[jmp_ig.index()].instrs[jmp.index as usize];
                let ins = desc.ins;
                let cur_size = desc.code_size as u32;
                let mut info = *desc
                    .jump()
                    .ok_or_else(|| EmitError::internal("branch list entry is not a branch"))?;
                info.offs -= adj_lj;

                let mut new_form = None;
                if !info.is_short() && ins.is_variable_branch() && !info.keep_long {
                    let tgt = info
                        .bound_group()
                        .ok_or_else(|| EmitError::internal("unbound branch after binding"))?;
                    let tgt_ig = &self.groups[tgt.index()];
                    let cond = ins.is_cond_branch();
                    let src = limits.src_encoding_offset(group_offs + info.offs, cond) as i64;
                    let forward = tgt_ig.num > jmp_num;
                    let dst = if forward {
                        (tgt_ig.offset - adj_ig) as i64
                    } else {
                        tgt_ig.offset as i64
                    };

                    let extra = |max_pos: i64, max_neg: i64| {
                        if forward {
                            dst - src - max_pos
                        } else {
                            src - dst + max_neg
                        }
                    };
                    let short_extra = extra(limits.short.max_pos, limits.short.max_neg);
                    trace!(
                        "branch #{} in IG{jmp_num:02}: src {src:#x} dst {dst:#x} short extra {short_extra}",
                        desc.num
                    );
                    if short_extra <= 0 {
                        new_form = Some(JumpForm::Short);
                    } else {
                        min_short_extra = min_short_extra.min(short_extra as u32);
                        if let Some(medium) = limits.medium {
                            if info.form == JumpForm::Long {
                                let medium_extra = extra(medium.max_pos, medium.max_neg);
                                if medium_extra <= 0 {
                                    new_form = Some(JumpForm::Medium);
                                } else {
                                    min_medium_extra = min_medium_extra.min(medium_extra as u32);
                                }
                            }
                        }
                    }
                }

                let group = &mut self.groups[jmp_ig.index()];
                if let Some(form) = new_form {
                    let new_size = limits.size(form, ins.is_cond_branch());
                    if new_size < cur_size {
                        let dif = cur_size - new_size;
                        info.form = form;
                        group.instrs[jmp.index as usize].code_size = new_size as u8;
                        group.size -= dif;
                        group.flags.insert(IgFlags::UPD_ISZ);
                        adj_lj += dif;
                        adj_ig += dif;
                        self.total_code_size -= dif;
                        stats.shortened += 1;
                        stats.bytes_removed += dif;
                    }
                }
                if let Some(slot) = group.instrs[jmp.index as usize].jump_mut() {
                    *slot = info;
                }
            }

            // Pull in the groups after the last branch.
            if let Some(mut g) = lst_ig {
                while let Some(next) = self.groups[g.index()].next {
                    g = next;
                    self.groups[g.index()].offset -= adj_ig;
                }
            }

            debug!(
                "relaxation pass {}: removed {adj_ig} bytes, closest miss {}",
                stats.passes,
                min_short_extra.min(min_medium_extra)
            );
            if adj_ig == 0 || (min_short_extra > adj_ig && min_medium_extra > adj_ig) {
                break;
            }
        }

        if self.config.validate {
            self.check_offsets()?;
        }
        self.session
            .record_relaxation(stats.passes, stats.shortened);
        self.relax_stats = Some(stats);
        Ok(stats)
    }

    /// Resolve every label reference to a group and apply the crossing rules.
    fn bind_jumps(&mut self) -> EmitResult<()> {
        let refs: Vec<_> = self.jumps.iter().chain(&self.short_jumps).copied().collect();
        for jr in refs {
            let desc = &self.groups[jr.group.index()].instrs[jr.index as usize];
            // Taking a label's address does not transfer control.
            let is_branch = desc.ins != Ins::Lea;
            let mut info = *desc
                .jump()
                .ok_or_else(|| EmitError::internal("branch list entry is not a branch"))?;
            let target = match info.target {
                JumpTarget::Group(g) => g,
                JumpTarget::Label(label) => self
                    .label_group(label)
                    .ok_or(EmitError::UnboundLabel { label: label.0 })?,
            };
            info.target = JumpTarget::Group(target);

            if self.first_cold.is_some() && self.is_cold(target) != self.is_cold(jr.group) {
                info.keep_long = true;
                if info.is_short() {
                    return Err(EmitError::internal(
                        "short branch crosses the hot/cold boundary",
                    ));
                }
            }
            if self.config.validate && is_branch {
                let from = self.groups[jr.group.index()].func_idx;
                let to = self.groups[target.index()].func_idx;
                check_funclet_branch(&self.funclets, from, to, &info, target)?;
            }

            if let Some(slot) = self.groups[jr.group.index()].instrs[jr.index as usize].jump_mut() {
                *slot = info;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::{NoPrologEpilog, TestContext};
    use crate::gc::GcState;
    use crate::instr::desc::{Cond, EmitAttr, Ins};

    #[test]
    fn test_forward_branch_shrinks() {
        TestContext::new().with_emitter(|em| {
            let target = em.new_label();
            em.ins_jump(Ins::Jcc(Cond::E), target).unwrap();
            em.ins_nop(10).unwrap();
            em.define_label(target, &GcState::default()).unwrap();
            em.ins(Ins::Ret, EmitAttr::B8).unwrap();
            em.generate_prolog_epilog(&mut NoPrologEpilog).unwrap();

            let before = em.total_code_size();
            let stats = em.jump_dist_bind().unwrap();
            assert_eq!(stats.shortened, 1);
            assert_eq!(em.total_code_size(), before - 4);
            em.check_offsets().unwrap();
        });
    }

    #[test]
    fn test_backward_limit() {
        // A backward jmp whose short-form distance is exactly 128 still fits.
        TestContext::new().with_emitter(|em| {
            let top = em.new_label();
            em.define_label(top, &GcState::default()).unwrap();
            em.ins_nop(126).unwrap();
            em.ins_jump(Ins::Jmp, top).unwrap();
            em.generate_prolog_epilog(&mut NoPrologEpilog).unwrap();
            assert_eq!(em.jump_dist_bind().unwrap().shortened, 1);
        });

        TestContext::new().with_emitter(|em| {
            let top = em.new_label();
            em.define_label(top, &GcState::default()).unwrap();
            em.ins_nop(127).unwrap();
            em.ins_jump(Ins::Jmp, top).unwrap();
            em.generate_prolog_epilog(&mut NoPrologEpilog).unwrap();
            assert_eq!(em.jump_dist_bind().unwrap().shortened, 0);
        });
    }

    #[test]
    fn test_cascading_shrink_needs_second_pass() {
        TestContext::new().with_emitter(|em| {
            let end = em.new_label();
            // The first branch misses the short range by 2 bytes until the
            // second one shrinks.
            em.ins_jump(Ins::Jmp, end).unwrap();
            em.ins_nop(116).unwrap();
            em.ins_jump(Ins::Jcc(Cond::NE), end).unwrap();
            em.ins_nop(4).unwrap();
            em.define_label(end, &GcState::default()).unwrap();
            em.ins(Ins::Ret, EmitAttr::B8).unwrap();
            em.generate_prolog_epilog(&mut NoPrologEpilog).unwrap();

            let stats = em.jump_dist_bind().unwrap();
            assert_eq!(stats.shortened, 2);
            assert_eq!(stats.passes, 2);
            em.check_offsets().unwrap();
        });
    }

    #[test]
    fn test_unbound_label_reported() {
        TestContext::new().with_emitter(|em| {
            let nowhere = em.new_label();
            em.ins_jump(Ins::Jmp, nowhere).unwrap();
            em.generate_prolog_epilog(&mut NoPrologEpilog).unwrap();
            let err = em.jump_dist_bind().unwrap_err();
            assert!(matches!(err, EmitError::UnboundLabel { label } if label == nowhere.0));
        });
    }

    #[test]
    fn test_pending_placeholder_blocks_relaxation() {
        TestContext::new().with_emitter(|em| {
            em.ins(Ins::Ret, EmitAttr::B8).unwrap();
            let err = em.jump_dist_bind().unwrap_err();
            assert!(matches!(err, EmitError::UnmaterializedPlaceholder { num: 0 }));
        });
    }
}
