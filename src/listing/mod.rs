// A textual front end for the emission engine. A listing describes one method the way an
// instruction selector would hand it over: labels with the GC state live on entry, x86-64
// instructions with their operand sizes and GC kinds, calls with the state live after them,
// epilog and funclet placeholders, a cold split, data constants and jump tables. parse_listing
// turns the text into a Listing; emit_listing drives a fresh emitter through the whole
// pipeline (build, prolog/epilog generation, relaxation, issue) with the x86-64 encoder and a
// standard rbp frame, and returns the emitted method. Labels may be referenced before they are
// defined; data constants must be declared before they are used.

//! Listing front end: parse and emit textual method descriptions.

pub mod parser;

use hashbrown::HashMap;
use log::{debug, info};
use thiserror::Error;

pub use parser::parse_listing;

use crate::core::code_alloc::HeapCodeAllocator;
use crate::core::config::EmitterConfig;
use crate::core::error::EmitError;
use crate::core::frame::FrameLayout;
use crate::core::funclet::HandlerKind;
use crate::core::regs::{AsmReg, RegMask};
use crate::core::session::CompilationSession;
use crate::core::target::TargetInfo;
use crate::core::varset::VarSet;
use crate::emit::{CallDest, CallSpec, EmitOutput, Emitter, Label, Mem, PlaceholderKind};
use crate::gc::GcState;
use crate::instr::desc::{EmitAttr, GcKind, Ins, OpSize};
use crate::x64::{StandardFrame, X64Encoder};
use crate::x64::regs::RBP;

/// Errors produced while reading or emitting a listing.
#[derive(Error, Debug)]
pub enum ListingError {
    #[error("line {line}: {msg}")]
    Syntax { line: usize, msg: String },

    #[error("label '{name}' is referenced but never defined")]
    UndefinedLabel { name: String },

    #[error("line {line}: label '{name}' defined twice")]
    DuplicateLabel { line: usize, name: String },

    #[error("line {line}: unknown data constant '{name}'")]
    UnknownData { line: usize, name: String },

    #[error("line {line}: {source}")]
    Emit {
        line: usize,
        #[source]
        source: EmitError,
    },

    #[error(transparent)]
    Pipeline(#[from] EmitError),
}

pub type ListingResult<T> = Result<T, ListingError>;

/// GC state written on a label, an epilog or after a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcSpec {
    pub gcref: Vec<AsmReg>,
    pub byref: Vec<AsmReg>,
    pub vars: Vec<u32>,
}

impl GcSpec {
    pub fn to_state(&self) -> GcState {
        GcState::new(
            VarSet::from_indices(&self.vars),
            RegMask::of(&self.gcref),
            RegMask::of(&self.byref),
        )
    }
}

/// Memory operand as written in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemRef {
    Amd {
        base: Option<AsmReg>,
        index: Option<AsmReg>,
        scale: u8,
        disp: i64,
    },
    /// `V<n>+offs` for locals, `T<n>+offs` for compiler temporaries.
    Lcl { var: i32, offs: u32 },
    Data { name: String, disp: u32 },
    Abs(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(AsmReg, OpSize),
    Imm(i64),
    Mem(MemRef, Option<OpSize>),
    Label(String),
    /// `#n`: external method handle.
    Method(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mnemonic {
    Ins(Ins),
    CallFinally,
    CatchRet,
}

/// Call-site annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallAttrs {
    pub args: i32,
    pub ret: GcKind,
    pub live: GcSpec,
    pub no_gc: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrLine {
    pub mnemonic: Mnemonic,
    /// `.s` suffix: branch known to be in short range.
    pub short: bool,
    pub operands: Vec<Operand>,
    /// `!gcref` / `!byref`: GC kind of the defined register or stored value.
    pub gc: Option<GcKind>,
    pub call: CallAttrs,
}

/// One statement of the method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Label { name: String, gc: GcSpec },
    Instr(InstrLine),
    Placeholder { kind: PlaceholderKind, block: u32, gc: GcSpec },
    /// The next label starts the cold region.
    Cold,
    Handler { kind: HandlerKind, parent: Option<u32> },
    Func(u16),
    NoGc,
    Gc,
    Stack(u32),
    Il(u32),
    FinallyTarget,
    Data { name: String, bytes: Vec<u8>, align8: bool },
    Reserve { name: String, size: u32, align8: bool },
    Table { name: String, labels: Vec<String>, relative: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub line: usize,
    pub item: Item,
}

/// A stack slot declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDecl {
    pub var: i32,
    pub offset: i32,
    /// `None` for untracked slots.
    pub gc: GcKind,
    pub is_this: bool,
}

/// A parsed method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub name: String,
    pub locals_size: u32,
    pub saved: Vec<AsmReg>,
    pub slots: Vec<SlotDecl>,
    pub lines: Vec<Line>,
}

impl Listing {
    /// Frame layout the listing's slots describe, addressed from rbp.
    pub fn frame_layout(&self) -> FrameLayout {
        let mut frame = FrameLayout::new(RBP);
        for slot in &self.slots {
            if slot.gc.is_gc() {
                frame.track_gc_var(slot.var, slot.offset, slot.gc, slot.is_this);
            } else {
                frame.set_var_offset(slot.var, slot.offset);
            }
        }
        frame
    }

    pub fn standard_frame(&self) -> StandardFrame {
        let mut frame = StandardFrame::new(self.locals_size);
        for &reg in &self.saved {
            frame.add_saved_register(reg);
        }
        frame
    }
}

/// An emitted listing.
#[derive(Debug, Clone)]
pub struct EmittedMethod {
    pub name: String,
    pub output: EmitOutput,
    /// Group dump taken after emission.
    pub groups: String,
    /// Final code offset of every label.
    pub labels: Vec<(String, u32)>,
    /// Offset of every named data item.
    pub data: Vec<(String, u32)>,
}

impl EmittedMethod {
    pub fn label_offset(&self, name: &str) -> Option<u32> {
        self.labels.iter().find(|(n, _)| n == name).map(|(_, o)| *o)
    }

    pub fn data_offset(&self, name: &str) -> Option<u32> {
        self.data.iter().find(|(n, _)| n == name).map(|(_, o)| *o)
    }
}

/// Emitter plus the name tables a listing needs while driving it.
struct Driver<'e, 'a> {
    em: &'e mut Emitter<'a, X64Encoder>,
    labels: HashMap<String, Label>,
    defined: HashMap<String, usize>,
    label_order: Vec<String>,
    data: HashMap<String, u32>,
    data_order: Vec<String>,
    cold_pending: bool,
}

impl<'e, 'a> Driver<'e, 'a> {
    fn label(&mut self, name: &str) -> Label {
        if let Some(&label) = self.labels.get(name) {
            return label;
        }
        let label = self.em.new_label();
        self.labels.insert(name.to_string(), label);
        self.label_order.push(name.to_string());
        label
    }

    fn mem(&self, line: usize, mem: &MemRef) -> ListingResult<Mem> {
        Ok(match mem {
            MemRef::Amd {
                base,
                index,
                scale,
                disp,
            } => Mem::Amd {
                base: *base,
                index: *index,
                scale: *scale,
                disp: *disp,
            },
            MemRef::Lcl { var, offs } => Mem::lcl(*var, *offs),
            MemRef::Data { name, disp } => {
                let offset = self.data.get(name).ok_or_else(|| ListingError::UnknownData {
                    line,
                    name: name.clone(),
                })?;
                Mem::Data(offset + disp)
            }
            MemRef::Abs(addr) => Mem::Abs(*addr),
        })
    }

    fn item(&mut self, line: usize, item: &Item, next_is_label: bool) -> ListingResult<()> {
        let at = |source: EmitError| ListingError::Emit { line, source };
        match item {
            Item::Label { name, gc } => {
                if self.defined.insert(name.clone(), line).is_some() {
                    return Err(ListingError::DuplicateLabel {
                        line,
                        name: name.clone(),
                    });
                }
                let label = self.label(name);
                let group = self.em.define_label(label, &gc.to_state()).map_err(at)?;
                if std::mem::take(&mut self.cold_pending) {
                    self.em.set_first_cold_group(group).map_err(at)?;
                }
            }
            Item::Instr(instr) => self.instr(line, instr)?,
            Item::Placeholder { kind, block, gc } => {
                self.em
                    .create_placeholder(*kind, *block, &gc.to_state(), next_is_label)
                    .map_err(at)?;
            }
            Item::Cold => self.cold_pending = true,
            Item::Handler { kind, parent } => {
                let func = self.em.add_handler(*kind, *parent);
                debug!("line {line}: handler {kind:?} is funclet {func}");
            }
            Item::Func(idx) => self.em.set_current_func(*idx).map_err(at)?,
            Item::NoGc => self.em.disable_gc().map_err(at)?,
            Item::Gc => self.em.enable_gc().map_err(at)?,
            Item::Stack(level) => self.em.set_stack_level(*level),
            Item::Il(offset) => self.em.set_il_offset(*offset),
            Item::FinallyTarget => self.em.set_finally_target().map_err(at)?,
            Item::Data { name, bytes, align8 } => {
                let offset = self.em.data_const(bytes, *align8);
                self.name_data(name, offset);
            }
            Item::Reserve { name, size, align8 } => {
                let offset = self.em.data_reserve(*size, *align8);
                self.name_data(name, offset);
            }
            Item::Table {
                name,
                labels,
                relative,
            } => {
                let labels: Vec<Label> = labels.iter().map(|l| self.label(l)).collect();
                let offset = self.em.block_table(&labels, *relative);
                self.name_data(name, offset);
            }
        }
        Ok(())
    }

    fn name_data(&mut self, name: &str, offset: u32) {
        self.data.insert(name.to_string(), offset);
        self.data_order.push(name.to_string());
    }

    fn instr(&mut self, line: usize, instr: &InstrLine) -> ListingResult<()> {
        let at = |source: EmitError| ListingError::Emit { line, source };
        let syntax = |msg: &str| ListingError::Syntax {
            line,
            msg: msg.to_string(),
        };

        let ins = match instr.mnemonic {
            Mnemonic::CallFinally => {
                let [Operand::Label(name)] = instr.operands.as_slice() else {
                    return Err(syntax("callfinally takes a label"));
                };
                let label = self.label(name);
                return self.em.ins_call_finally(label).map_err(at);
            }
            Mnemonic::CatchRet => {
                let [Operand::Label(name)] = instr.operands.as_slice() else {
                    return Err(syntax("catchret takes a label"));
                };
                let label = self.label(name);
                return self.em.ins_catch_ret(label).map_err(at);
            }
            Mnemonic::Ins(ins) => ins,
        };

        if ins == Ins::Call {
            return self.call(line, instr);
        }

        let size = instr
            .operands
            .iter()
            .find_map(|op| match op {
                Operand::Reg(_, size) => Some(*size),
                Operand::Mem(_, Some(size)) => Some(*size),
                _ => None,
            })
            .unwrap_or(OpSize::B8);
        let attr = match instr.gc {
            Some(GcKind::GcRef) => EmitAttr::GcRef,
            Some(GcKind::ByRef) => EmitAttr::ByRef,
            _ => EmitAttr::Size(size),
        };

        match instr.operands.as_slice() {
            [] => self.em.ins(ins, attr).map_err(at),
            [Operand::Imm(n)] if ins == Ins::Nop => {
                let n = u32::try_from(*n).map_err(|_| syntax("negative nop size"))?;
                self.em.ins_nop(n).map_err(at)
            }
            [Operand::Label(name)] => {
                let name = name.clone();
                let label = self.label(&name);
                if instr.short {
                    self.em.ins_jump_short(ins, label).map_err(at)
                } else {
                    self.em.ins_jump(ins, label).map_err(at)
                }
            }
            [Operand::Reg(reg, _), Operand::Label(name)] if ins == Ins::Lea => {
                let (reg, name) = (*reg, name.clone());
                let label = self.label(&name);
                self.em.ins_label_load(reg, label).map_err(at)
            }
            [Operand::Reg(r, _)] => self.em.ins_r(ins, attr, *r).map_err(at),
            [Operand::Imm(n)] => self.em.ins_i(ins, attr, *n).map_err(at),
            [Operand::Mem(m, _)] => {
                let mem = self.mem(line, m)?;
                self.em.ins_m(ins, attr, mem).map_err(at)
            }
            [Operand::Reg(a, _), Operand::Reg(b, _)] => self.em.ins_rr(ins, attr, *a, *b).map_err(at),
            [Operand::Reg(r, _), Operand::Imm(n)] => self.em.ins_ri(ins, attr, *r, *n).map_err(at),
            [Operand::Reg(r, _), Operand::Mem(m, _)] => {
                let mem = self.mem(line, m)?;
                self.em.ins_rm(ins, attr, *r, mem).map_err(at)
            }
            [Operand::Mem(m, _), Operand::Reg(r, _)] => {
                let mem = self.mem(line, m)?;
                self.em.ins_mr(ins, attr, mem, *r).map_err(at)
            }
            [Operand::Mem(m, _), Operand::Imm(n)] => {
                let mem = self.mem(line, m)?;
                self.em.ins_mi(ins, attr, mem, *n).map_err(at)
            }
            [Operand::Reg(a, _), Operand::Reg(b, _), Operand::Imm(n)] => {
                self.em.ins_rri(ins, attr, *a, *b, *n).map_err(at)
            }
            _ => Err(syntax(&format!("unsupported operands for {ins}"))),
        }
    }

    fn call(&mut self, line: usize, instr: &InstrLine) -> ListingResult<()> {
        let dest = match instr.operands.as_slice() {
            [Operand::Method(handle)] => CallDest::Method(*handle),
            [Operand::Reg(reg, _)] => CallDest::Reg(*reg),
            [Operand::Mem(m, _)] => CallDest::Mem(self.mem(line, m)?),
            _ => {
                return Err(ListingError::Syntax {
                    line,
                    msg: "call takes #handle, a register or a memory operand".to_string(),
                })
            }
        };
        let attrs = &instr.call;
        let spec = CallSpec {
            dest,
            arg_slots: attrs.args,
            ret: match attrs.ret {
                GcKind::GcRef => EmitAttr::GcRef,
                GcKind::ByRef => EmitAttr::ByRef,
                GcKind::None => EmitAttr::B8,
            },
            live_after: attrs.live.to_state(),
            no_gc: attrs.no_gc,
        };
        self.em
            .ins_call(&spec)
            .map_err(|source| ListingError::Emit { line, source })
    }
}

/// Run a parsed listing through the whole emission pipeline.
pub fn emit_listing(
    session: &CompilationSession<'_>,
    listing: &Listing,
    config: EmitterConfig,
) -> ListingResult<EmittedMethod> {
    let mut em = Emitter::new(session, X64Encoder::new(), TargetInfo::x64(), config)?;
    let mut driver = Driver {
        em: &mut em,
        labels: HashMap::new(),
        defined: HashMap::new(),
        label_order: Vec::new(),
        data: HashMap::new(),
        data_order: Vec::new(),
        cold_pending: false,
    };

    for (i, line) in listing.lines.iter().enumerate() {
        let next_is_label = listing
            .lines
            .get(i + 1)
            .map_or(true, |next| matches!(next.item, Item::Label { .. }));
        driver.item(line.line, &line.item, next_is_label)?;
    }
    if let Some(name) = driver
        .label_order
        .iter()
        .find(|name| !driver.defined.contains_key(name.as_str()))
    {
        return Err(ListingError::UndefinedLabel { name: name.clone() });
    }

    let Driver {
        labels,
        label_order,
        data,
        data_order,
        ..
    } = driver;

    em.generate_prolog_epilog(&mut listing.standard_frame())?;
    let frame = listing.frame_layout();
    let output = em.end_code_gen(&mut HeapCodeAllocator::new(), &frame)?;

    let mut label_offsets = Vec::with_capacity(label_order.len());
    for name in label_order {
        let group = labels
            .get(&name)
            .and_then(|&label| em.label_group(label))
            .ok_or_else(|| ListingError::UndefinedLabel { name: name.clone() })?;
        let offset = output
            .group_offset(group)
            .ok_or_else(|| EmitError::internal(format!("label {name} has no offset")))?;
        label_offsets.push((name, offset));
    }
    let data_offsets = data_order
        .into_iter()
        .filter_map(|name| data.get(&name).map(|&off| (name, off)))
        .collect();

    info!(
        "{}: {} bytes of code, {} groups",
        listing.name, output.code_size, output.stats.groups
    );
    Ok(EmittedMethod {
        name: listing.name.clone(),
        groups: em.dump(),
        output,
        labels: label_offsets,
        data: data_offsets,
    })
}

/// Parse and emit in one step.
pub fn emit_text(
    session: &CompilationSession<'_>,
    text: &str,
    config: EmitterConfig,
) -> ListingResult<EmittedMethod> {
    let listing = parse_listing(text)?;
    emit_listing(session, &listing, config)
}
