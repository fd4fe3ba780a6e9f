// Instruction records. Every machine instruction handed to the emitter becomes an InstrDesc:
// a common prefix (opcode, operand format, operand size, GC kind of the defined register,
// register operands, the address-mode union and the provisional code size) followed by a
// payload variant. The variant is the smallest one that can hold the operands: Small keeps a
// 16-bit constant inline, Cns and Dsp add a full-width constant or displacement, CnsDsp adds
// both, Call carries call-site GC metadata and Jump carries branch binding state. footprint()
// reports the logical size of each variant; the group builder budgets its scratch buffer in
// those units. Records are Copy and live in the per-method arena once their group closes.

//! Instruction record types.

use std::fmt;

use super::lcl_var::LclVarAddr;
use crate::core::regs::{AsmReg, RegMask};
use crate::core::target::JumpForm;
use crate::emit::group::{GroupId, Label};

/// Footprint of a record with no out-of-line payload.
pub const SMALL_DESC_SIZE: usize = 24;
/// Footprint of a record carrying a large constant.
pub const CNS_DESC_SIZE: usize = 32;
/// Footprint of a record carrying a large displacement.
pub const DSP_DESC_SIZE: usize = 32;
/// Footprint of a record carrying both.
pub const CNS_DSP_DESC_SIZE: usize = 40;
/// Footprint of a branch record.
pub const JUMP_DESC_SIZE: usize = 40;
/// Footprint of a call record.
pub const CALL_DESC_SIZE: usize = 56;

/// Scratch buffer budget: room for a hundred ordinary records plus a few small ones.
pub const DEFAULT_SCRATCH_BYTES: usize = 100 * CNS_DESC_SIZE + 14 * SMALL_DESC_SIZE;

/// Condition codes, numbered as the x86 `cc` nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    O = 0,
    NO = 1,
    B = 2,
    AE = 3,
    E = 4,
    NE = 5,
    BE = 6,
    A = 7,
    S = 8,
    NS = 9,
    P = 10,
    NP = 11,
    L = 12,
    GE = 13,
    LE = 14,
    G = 15,
}

impl Cond {
    pub const ALL: [Cond; 16] = [
        Cond::O,
        Cond::NO,
        Cond::B,
        Cond::AE,
        Cond::E,
        Cond::NE,
        Cond::BE,
        Cond::A,
        Cond::S,
        Cond::NS,
        Cond::P,
        Cond::NP,
        Cond::L,
        Cond::GE,
        Cond::LE,
        Cond::G,
    ];

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::NO => "no",
            Cond::B => "b",
            Cond::AE => "ae",
            Cond::E => "e",
            Cond::NE => "ne",
            Cond::BE => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::NS => "ns",
            Cond::P => "p",
            Cond::NP => "np",
            Cond::L => "l",
            Cond::GE => "ge",
            Cond::LE => "le",
            Cond::G => "g",
        }
    }

    pub fn from_suffix(s: &str) -> Option<Cond> {
        Cond::ALL.into_iter().find(|c| c.suffix() == s)
    }
}

/// Instruction mnemonics understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ins {
    Nop,
    Int3,
    Ret,
    Mov,
    Lea,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    Imul,
    Push,
    Pop,
    Call,
    Jmp,
    Jcc(Cond),
}

impl Ins {
    pub fn name(&self) -> String {
        match self {
            Ins::Jcc(cc) => format!("j{}", cc.suffix()),
            other => other.base_name().to_string(),
        }
    }

    fn base_name(&self) -> &'static str {
        match self {
            Ins::Nop => "nop",
            Ins::Int3 => "int3",
            Ins::Ret => "ret",
            Ins::Mov => "mov",
            Ins::Lea => "lea",
            Ins::Add => "add",
            Ins::Sub => "sub",
            Ins::And => "and",
            Ins::Or => "or",
            Ins::Xor => "xor",
            Ins::Cmp => "cmp",
            Ins::Test => "test",
            Ins::Imul => "imul",
            Ins::Push => "push",
            Ins::Pop => "pop",
            Ins::Call => "call",
            Ins::Jmp => "jmp",
            Ins::Jcc(_) => "jcc",
        }
    }

    /// Parse a mnemonic.
    pub fn from_name(name: &str) -> Option<Ins> {
        let ins = match name {
            "nop" => Ins::Nop,
            "int3" => Ins::Int3,
            "ret" => Ins::Ret,
            "mov" => Ins::Mov,
            "lea" => Ins::Lea,
            "add" => Ins::Add,
            "sub" => Ins::Sub,
            "and" => Ins::And,
            "or" => Ins::Or,
            "xor" => Ins::Xor,
            "cmp" => Ins::Cmp,
            "test" => Ins::Test,
            "imul" => Ins::Imul,
            "push" => Ins::Push,
            "pop" => Ins::Pop,
            "call" => Ins::Call,
            "jmp" => Ins::Jmp,
            _ => return name.strip_prefix('j').and_then(Cond::from_suffix).map(Ins::Jcc),
        };
        Some(ins)
    }

    /// Whether the instruction overwrites its first register operand.
    pub fn writes_reg1(&self) -> bool {
        matches!(
            self,
            Ins::Mov
                | Ins::Lea
                | Ins::Add
                | Ins::Sub
                | Ins::And
                | Ins::Or
                | Ins::Xor
                | Ins::Imul
                | Ins::Pop
        )
    }

    /// Branches whose encoding size relaxation may shrink.
    pub fn is_variable_branch(&self) -> bool {
        matches!(self, Ins::Jmp | Ins::Jcc(_))
    }

    pub fn is_cond_branch(&self) -> bool {
        matches!(self, Ins::Jcc(_))
    }
}

impl fmt::Display for Ins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Operand size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpSize {
    B1 = 1,
    B2 = 2,
    B4 = 4,
    B8 = 8,
}

impl OpSize {
    pub fn bytes(&self) -> u32 {
        *self as u32
    }

    pub fn from_bytes(bytes: u32) -> Option<OpSize> {
        match bytes {
            1 => Some(OpSize::B1),
            2 => Some(OpSize::B2),
            4 => Some(OpSize::B4),
            8 => Some(OpSize::B8),
            _ => None,
        }
    }
}

/// GC kind of a value: untracked, object reference or interior pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GcKind {
    #[default]
    None,
    GcRef,
    ByRef,
}

impl GcKind {
    pub fn is_gc(&self) -> bool {
        *self != GcKind::None
    }
}

/// Operand size as requested by the front end. The two GC sentinels stand for
/// a pointer-sized operand that holds a reference or an interior pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitAttr {
    Size(OpSize),
    GcRef,
    ByRef,
}

impl EmitAttr {
    pub const B1: EmitAttr = EmitAttr::Size(OpSize::B1);
    pub const B2: EmitAttr = EmitAttr::Size(OpSize::B2);
    pub const B4: EmitAttr = EmitAttr::Size(OpSize::B4);
    pub const B8: EmitAttr = EmitAttr::Size(OpSize::B8);

    /// Resolve to a concrete size and GC kind for a target of `ptr_size` bytes.
    pub fn resolve(&self, ptr_size: u32) -> (OpSize, GcKind) {
        let ptr = OpSize::from_bytes(ptr_size).unwrap_or(OpSize::B8);
        match self {
            EmitAttr::Size(size) => (*size, GcKind::None),
            EmitAttr::GcRef => (ptr, GcKind::GcRef),
            EmitAttr::ByRef => (ptr, GcKind::ByRef),
        }
    }
}

/// Operand layout of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsFormat {
    /// No operands.
    None,
    /// reg1
    R,
    /// reg1, reg2
    RR,
    /// reg1, constant
    RI,
    /// reg1, reg2, constant
    RRI,
    /// reg1, memory
    RM,
    /// memory, reg1
    MR,
    /// memory, constant
    MI,
    /// memory
    M,
    /// constant
    I,
    /// Code label (branch target, local call or address load into reg1).
    Label,
    /// Direct call to an external method handle.
    Method,
}

/// Base + index * scale addressing; the displacement lives in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrMode {
    pub base: Option<AsmReg>,
    pub index: Option<AsmReg>,
    pub scale: u8,
}

impl AddrMode {
    pub fn base(reg: AsmReg) -> Self {
        Self {
            base: Some(reg),
            index: None,
            scale: 1,
        }
    }
}

/// Extra register operands beyond the two primary ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtRegs {
    pub reg3: AsmReg,
    pub reg4: Option<AsmReg>,
}

/// The memory-operand union of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddrOperand {
    #[default]
    None,
    Amd(AddrMode),
    /// Frame slot of a local variable or compiler temporary.
    Lcl(LclVarAddr),
    /// Offset into the method's read-only data section.
    Data(u32),
    /// Literal absolute address.
    Abs(u64),
}

/// What a branch record points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpTarget {
    Label(Label),
    Group(GroupId),
}

/// Branch binding and sizing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpInfo {
    pub target: JumpTarget,
    /// Current encoding form; only ever shrinks.
    pub form: JumpForm,
    /// Never shorten (hot/cold crossing).
    pub keep_long: bool,
    /// Provisional offset of the branch inside its group.
    pub offs: u32,
    /// Call-like branch into the start of a finally handler.
    pub finally_call: bool,
    /// Return-like branch out of a catch handler.
    pub catch_ret: bool,
}

impl JumpInfo {
    pub fn to_label(label: Label) -> Self {
        Self {
            target: JumpTarget::Label(label),
            form: JumpForm::Long,
            keep_long: false,
            offs: 0,
            finally_call: false,
            catch_ret: false,
        }
    }

    pub fn is_short(&self) -> bool {
        self.form == JumpForm::Short
    }

    pub fn bound_group(&self) -> Option<GroupId> {
        match self.target {
            JumpTarget::Group(g) => Some(g),
            JumpTarget::Label(_) => None,
        }
    }
}

/// Call destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTarget {
    /// External method handle, resolved through a relocation.
    Method(u32),
    /// Through reg1 or the memory operand.
    Indirect,
}

/// Call-site metadata carried by call records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallInfo<'a> {
    pub target: CallTarget,
    /// Pushed argument slots popped by the call; negative counts are killed
    /// (left on the stack but dead).
    pub arg_slots: i32,
    /// Live tracked GC variables after the call, when they change.
    pub gc_vars: Option<&'a [u64]>,
    /// Live GC reference registers after the call, excluding the return value.
    pub gcref_regs: RegMask,
    /// Live interior-pointer registers after the call, excluding the return value.
    pub byref_regs: RegMask,
    /// Helper known never to trigger a GC: no call site is recorded.
    pub no_gc: bool,
    /// Displacement of an indirect call's memory operand.
    pub disp: i64,
}

/// Variant payload following the common prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    Small,
    Cns(i64),
    Dsp(i64),
    CnsDsp { cns: i64, dsp: i64 },
    Call(CallInfo<'a>),
    Jump(JumpInfo),
}

/// One instruction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstrDesc<'a> {
    /// Stable instruction number within the method.
    pub num: u32,
    pub ins: Ins,
    pub fmt: InsFormat,
    pub size: OpSize,
    /// GC kind of the defined register (or stored value, or call return).
    pub gc: GcKind,
    pub reg1: Option<AsmReg>,
    pub reg2: Option<AsmReg>,
    /// Third and fourth register operands, for forms that need them.
    pub ext: Option<ExtRegs>,
    pub addr: AddrOperand,
    /// Inline constant for variants without a full-width one.
    pub small_cns: i16,
    /// Provisional code size; never grows after allocation.
    pub code_size: u8,
    pub payload: Payload<'a>,
}

impl<'a> InstrDesc<'a> {
    /// Whether a constant fits the inline field.
    pub fn fits_small_cns(value: i64) -> bool {
        i16::try_from(value).is_ok()
    }

    /// Logical record size, always a multiple of the pointer width.
    pub fn footprint(&self) -> usize {
        match self.payload {
            Payload::Small => SMALL_DESC_SIZE,
            Payload::Cns(_) => CNS_DESC_SIZE,
            Payload::Dsp(_) => DSP_DESC_SIZE,
            Payload::CnsDsp { .. } => CNS_DSP_DESC_SIZE,
            Payload::Jump(_) => JUMP_DESC_SIZE,
            Payload::Call(_) => CALL_DESC_SIZE,
        }
    }

    /// Short name of the payload variant, for statistics.
    pub fn variant_name(&self) -> &'static str {
        match self.payload {
            Payload::Small => "small",
            Payload::Cns(_) => "cns",
            Payload::Dsp(_) => "dsp",
            Payload::CnsDsp { .. } => "cns_dsp",
            Payload::Jump(_) => "jump",
            Payload::Call(_) => "call",
        }
    }

    /// Constant operand, wherever it is stored.
    pub fn cns(&self) -> i64 {
        match self.payload {
            Payload::Cns(cns) | Payload::CnsDsp { cns, .. } => cns,
            _ => self.small_cns as i64,
        }
    }

    /// Memory displacement, wherever it is stored.
    pub fn dsp(&self) -> i64 {
        match self.payload {
            Payload::Dsp(dsp) | Payload::CnsDsp { dsp, .. } => dsp,
            Payload::Call(ref call) => call.disp,
            _ => 0,
        }
    }

    pub fn jump(&self) -> Option<&JumpInfo> {
        match self.payload {
            Payload::Jump(ref j) => Some(j),
            _ => None,
        }
    }

    pub fn jump_mut(&mut self) -> Option<&mut JumpInfo> {
        match self.payload {
            Payload::Jump(ref mut j) => Some(j),
            _ => None,
        }
    }

    pub fn call(&self) -> Option<&CallInfo<'a>> {
        match self.payload {
            Payload::Call(ref c) => Some(c),
            _ => None,
        }
    }

    /// Whether the record reads or writes memory.
    pub fn has_mem_operand(&self) -> bool {
        !matches!(self.addr, AddrOperand::None)
    }
}

impl fmt::Display for InstrDesc<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:<4} {:<6}", self.num, self.ins)?;
        let mut ops: Vec<String> = Vec::new();
        let mem = || match self.addr {
            AddrOperand::None => String::new(),
            AddrOperand::Amd(am) => {
                let mut s = String::from("[");
                if let Some(b) = am.base {
                    s.push_str(&format!("r{}", b.id));
                }
                if let Some(i) = am.index {
                    s.push_str(&format!("+r{}*{}", i.id, am.scale));
                }
                match self.dsp() {
                    0 => {}
                    d => s.push_str(&format!("{:+#x}", d)),
                }
                s.push(']');
                s
            }
            AddrOperand::Lcl(lv) => format!("[{:?}]", lv),
            AddrOperand::Data(off) => format!("[data+{:#x}]", off),
            AddrOperand::Abs(a) => format!("[{:#x}]", a),
        };
        let reg = |r: Option<AsmReg>| r.map(|r| format!("r{}", r.id)).unwrap_or_default();
        match self.fmt {
            InsFormat::None => {}
            InsFormat::R => ops.push(reg(self.reg1)),
            InsFormat::RR => {
                ops.push(reg(self.reg1));
                ops.push(reg(self.reg2));
            }
            InsFormat::RI => {
                ops.push(reg(self.reg1));
                ops.push(format!("{:#x}", self.cns()));
            }
            InsFormat::RRI => {
                ops.push(reg(self.reg1));
                ops.push(reg(self.reg2));
                ops.push(format!("{:#x}", self.cns()));
            }
            InsFormat::RM => {
                ops.push(reg(self.reg1));
                ops.push(mem());
            }
            InsFormat::MR => {
                ops.push(mem());
                ops.push(reg(self.reg1));
            }
            InsFormat::MI => {
                ops.push(mem());
                ops.push(format!("{:#x}", self.cns()));
            }
            InsFormat::M => ops.push(mem()),
            InsFormat::I => ops.push(format!("{:#x}", self.cns())),
            InsFormat::Label => {
                if self.reg1.is_some() {
                    ops.push(reg(self.reg1));
                }
                if let Some(j) = self.jump() {
                    ops.push(match j.target {
                        JumpTarget::Label(l) => format!("L{}", l.0),
                        JumpTarget::Group(g) => format!("G_{}", g.0),
                    });
                }
            }
            InsFormat::Method => {
                if let Some(CallInfo {
                    target: CallTarget::Method(h),
                    ..
                }) = self.call()
                {
                    ops.push(format!("method#{h}"));
                }
            }
        }
        if let Some(ext) = self.ext {
            ops.push(reg(Some(ext.reg3)));
            if ext.reg4.is_some() {
                ops.push(reg(ext.reg4));
            }
        }
        write!(f, "{}", ops.join(", "))?;
        match self.gc {
            GcKind::None => {}
            GcKind::GcRef => write!(f, " (gcref)")?,
            GcKind::ByRef => write!(f, " (byref)")?,
        }
        write!(f, " ; size {}", self.code_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(payload: Payload<'static>) -> InstrDesc<'static> {
        InstrDesc {
            num: 0,
            ins: Ins::Mov,
            fmt: InsFormat::RI,
            size: OpSize::B8,
            gc: GcKind::None,
            reg1: Some(AsmReg::gp(0)),
            reg2: None,
            ext: None,
            addr: AddrOperand::None,
            small_cns: 7,
            code_size: 0,
            payload,
        }
    }

    #[test]
    fn test_footprints_are_pointer_multiples() {
        for payload in [
            Payload::Small,
            Payload::Cns(1 << 40),
            Payload::Dsp(1 << 20),
            Payload::CnsDsp { cns: 1, dsp: 2 },
            Payload::Jump(JumpInfo::to_label(Label(0))),
        ] {
            assert_eq!(desc(payload).footprint() % 8, 0);
        }
        assert!(desc(Payload::Small).footprint() < desc(Payload::CnsDsp { cns: 1, dsp: 2 }).footprint());
    }

    #[test]
    fn test_operand_accessors() {
        assert_eq!(desc(Payload::Small).cns(), 7);
        assert_eq!(desc(Payload::Cns(1 << 40)).cns(), 1 << 40);
        assert_eq!(desc(Payload::Dsp(-4096)).dsp(), -4096);
        assert_eq!(desc(Payload::Dsp(-4096)).cns(), 7);
        let both = desc(Payload::CnsDsp { cns: 1 << 33, dsp: 1 << 17 });
        assert_eq!((both.cns(), both.dsp()), (1 << 33, 1 << 17));
    }

    #[test]
    fn test_mnemonic_round_trip() {
        for name in ["mov", "jne", "jg", "call", "int3", "imul"] {
            assert_eq!(Ins::from_name(name).map(|i| i.name()), Some(name.to_string()));
        }
        assert_eq!(Ins::from_name("jzz"), None);
        assert!(Ins::Jcc(Cond::E).is_variable_branch());
        assert!(!Ins::Call.is_variable_branch());
    }

    #[test]
    fn test_gc_attr_forces_pointer_size() {
        assert_eq!(EmitAttr::GcRef.resolve(8), (OpSize::B8, GcKind::GcRef));
        assert_eq!(EmitAttr::ByRef.resolve(4), (OpSize::B4, GcKind::ByRef));
        assert_eq!(EmitAttr::B2.resolve(8), (OpSize::B2, GcKind::None));
    }
}
