// Standard rbp-based frames for x86-64. The prolog saves rbp, establishes it as the frame
// pointer, pushes the callee-saved registers the method uses and reserves the local area; the
// epilog releases the locals, restores the saved registers in reverse order, pops rbp and
// returns. The local area is rounded so that saved registers plus locals keep rsp 16-byte
// aligned at call sites under System V. Funclets get a minimal frame: they run on the parent's
// frame pointer and only save rbp.

//! Prolog and epilog generation for rbp frames.

use crate::core::encoder::InstrEncoder;
use crate::core::error::EmitResult;
use crate::core::regs::AsmReg;
use crate::emit::{Emitter, PrologEpilogGenerator};
use crate::instr::desc::{EmitAttr, Ins};
use crate::x64::regs::{RBP, RSP};

/// An rbp frame with saved registers and a fixed local area.
#[derive(Debug, Clone, Default)]
pub struct StandardFrame {
    saved: Vec<AsmReg>,
    locals_size: u32,
}

impl StandardFrame {
    pub fn new(locals_size: u32) -> Self {
        Self {
            saved: Vec::new(),
            locals_size,
        }
    }

    /// Add a callee-saved register that needs preservation.
    pub fn add_saved_register(&mut self, reg: AsmReg) {
        if reg != RBP && !self.saved.contains(&reg) {
            self.saved.push(reg);
        }
    }

    pub fn saved_registers(&self) -> &[AsmReg] {
        &self.saved
    }

    /// Bytes subtracted from rsp after the pushes.
    pub fn frame_size(&self) -> u32 {
        let saved = self.saved.len() as u32 * 8;
        (saved + self.locals_size).div_ceil(16) * 16 - saved
    }

    /// Frame offset of the first byte below the saved registers.
    pub fn locals_offset(&self) -> i32 {
        -(self.saved.len() as i32 * 8)
    }
}

impl<'a, E: InstrEncoder> PrologEpilogGenerator<'a, E> for StandardFrame {
    fn gen_prolog(&mut self, em: &mut Emitter<'a, E>) -> EmitResult<()> {
        em.ins_r(Ins::Push, EmitAttr::B8, RBP)?;
        em.ins_rr(Ins::Mov, EmitAttr::B8, RBP, RSP)?;
        for &reg in &self.saved {
            em.ins_r(Ins::Push, EmitAttr::B8, reg)?;
        }
        let size = self.frame_size();
        if size > 0 {
            em.ins_ri(Ins::Sub, EmitAttr::B8, RSP, size as i64)?;
        }
        em.mark_prolog_end();
        Ok(())
    }

    fn gen_epilog(&mut self, em: &mut Emitter<'a, E>, _block: u32) -> EmitResult<()> {
        let size = self.frame_size();
        if size > 0 {
            em.ins_ri(Ins::Add, EmitAttr::B8, RSP, size as i64)?;
        }
        for &reg in self.saved.iter().rev() {
            em.ins_r(Ins::Pop, EmitAttr::B8, reg)?;
        }
        em.ins_r(Ins::Pop, EmitAttr::B8, RBP)?;
        em.ins(Ins::Ret, EmitAttr::B8)
    }

    fn gen_funclet_prolog(&mut self, em: &mut Emitter<'a, E>, _block: u32) -> EmitResult<()> {
        em.ins_r(Ins::Push, EmitAttr::B8, RBP)
    }

    fn gen_funclet_epilog(&mut self, em: &mut Emitter<'a, E>, _block: u32) -> EmitResult<()> {
        em.ins_r(Ins::Pop, EmitAttr::B8, RBP)?;
        em.ins(Ins::Ret, EmitAttr::B8)
    }
}
