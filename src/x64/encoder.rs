// x86-64 instruction encoding for the emission engine, built on iced-x86. X64Encoder turns
// instruction records into machine code: ordinary register, immediate and memory forms are
// lowered to iced Instructions and run through iced's Encoder, which also tells us where
// displacements landed so rip-relative data references can be reported as relocations.
// Branches, local calls and label loads are encoded by hand because the engine picks their
// form and displacement itself: jcc is 70+cc rel8 or 0F 80+cc rel32, jmp EB rel8 or E9 rel32,
// call E8 rel32 and a label load is a rip-relative lea with a 32-bit displacement. Stack-slot
// operands are estimated with a 32-bit displacement off a base register that needs both REX
// and SIB, which bounds every frame register the final layout may choose.

//! x86-64 instruction encoding using iced-x86.

use iced_x86::{Code, ConstantOffsets, Encoder, Instruction, MemoryOperand, Register};

use crate::core::encoder::{
    EncodeContext, EncodingError, InstrEncoder, JumpSite, RelocKind, RelocTarget, Relocation, Section,
};
use crate::core::frame::FrameLayout;
use crate::core::regs::AsmReg;
use crate::core::target::{JumpForm, TargetInfo};
use crate::instr::desc::{
    AddrOperand, CallTarget, InsFormat, Ins, InstrDesc, JumpInfo, OpSize,
};

const GP64_REGS: [Register; 16] = [
    Register::RAX, Register::RCX, Register::RDX, Register::RBX,
    Register::RSP, Register::RBP, Register::RSI, Register::RDI,
    Register::R8, Register::R9, Register::R10, Register::R11,
    Register::R12, Register::R13, Register::R14, Register::R15,
];

const GP32_REGS: [Register; 16] = [
    Register::EAX, Register::ECX, Register::EDX, Register::EBX,
    Register::ESP, Register::EBP, Register::ESI, Register::EDI,
    Register::R8D, Register::R9D, Register::R10D, Register::R11D,
    Register::R12D, Register::R13D, Register::R14D, Register::R15D,
];

const GP16_REGS: [Register; 16] = [
    Register::AX, Register::CX, Register::DX, Register::BX,
    Register::SP, Register::BP, Register::SI, Register::DI,
    Register::R8W, Register::R9W, Register::R10W, Register::R11W,
    Register::R12W, Register::R13W, Register::R14W, Register::R15W,
];

const GP8_REGS: [Register; 16] = [
    Register::AL, Register::CL, Register::DL, Register::BL,
    Register::SPL, Register::BPL, Register::SIL, Register::DIL,
    Register::R8L, Register::R9L, Register::R10L, Register::R11L,
    Register::R12L, Register::R13L, Register::R14L, Register::R15L,
];

/// Recommended multi-byte NOP sequences, indexed by length - 1.
const NOPS: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0F, 0x1F, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// Displacement used for stack slots before the frame is laid out.
const LCL_ESTIMATE_DISP: i64 = -0x1000_0000;

/// Encoding size of a direct call or a local call.
const CALL_REL32_SIZE: u32 = 5;
/// Encoding size of a rip-relative lea of a label.
const LABEL_LEA_SIZE: u32 = 7;

/// Opcode forms of a two-operand instruction, indexed by operand size
/// (1, 2, 4, 8 bytes).
struct Forms {
    rm_r: [Code; 4],
    r_rm: [Code; 4],
    rm_imm: [Code; 4],
    /// Sign-extended 8-bit immediate forms; the byte form is the plain one.
    rm_imm8: Option<[Code; 4]>,
}

fn size_index(size: OpSize) -> usize {
    match size {
        OpSize::B1 => 0,
        OpSize::B2 => 1,
        OpSize::B4 => 2,
        OpSize::B8 => 3,
    }
}

fn forms(ins: Ins) -> Option<Forms> {
    let f = match ins {
        Ins::Mov => Forms {
            rm_r: [Code::Mov_rm8_r8, Code::Mov_rm16_r16, Code::Mov_rm32_r32, Code::Mov_rm64_r64],
            r_rm: [Code::Mov_r8_rm8, Code::Mov_r16_rm16, Code::Mov_r32_rm32, Code::Mov_r64_rm64],
            rm_imm: [Code::Mov_rm8_imm8, Code::Mov_rm16_imm16, Code::Mov_rm32_imm32, Code::Mov_rm64_imm32],
            rm_imm8: None,
        },
        Ins::Add => Forms {
            rm_r: [Code::Add_rm8_r8, Code::Add_rm16_r16, Code::Add_rm32_r32, Code::Add_rm64_r64],
            r_rm: [Code::Add_r8_rm8, Code::Add_r16_rm16, Code::Add_r32_rm32, Code::Add_r64_rm64],
            rm_imm: [Code::Add_rm8_imm8, Code::Add_rm16_imm16, Code::Add_rm32_imm32, Code::Add_rm64_imm32],
            rm_imm8: Some([Code::Add_rm8_imm8, Code::Add_rm16_imm8, Code::Add_rm32_imm8, Code::Add_rm64_imm8]),
        },
        Ins::Sub => Forms {
            rm_r: [Code::Sub_rm8_r8, Code::Sub_rm16_r16, Code::Sub_rm32_r32, Code::Sub_rm64_r64],
            r_rm: [Code::Sub_r8_rm8, Code::Sub_r16_rm16, Code::Sub_r32_rm32, Code::Sub_r64_rm64],
            rm_imm: [Code::Sub_rm8_imm8, Code::Sub_rm16_imm16, Code::Sub_rm32_imm32, Code::Sub_rm64_imm32],
            rm_imm8: Some([Code::Sub_rm8_imm8, Code::Sub_rm16_imm8, Code::Sub_rm32_imm8, Code::Sub_rm64_imm8]),
        },
        Ins::And => Forms {
            rm_r: [Code::And_rm8_r8, Code::And_rm16_r16, Code::And_rm32_r32, Code::And_rm64_r64],
            r_rm: [Code::And_r8_rm8, Code::And_r16_rm16, Code::And_r32_rm32, Code::And_r64_rm64],
            rm_imm: [Code::And_rm8_imm8, Code::And_rm16_imm16, Code::And_rm32_imm32, Code::And_rm64_imm32],
            rm_imm8: Some([Code::And_rm8_imm8, Code::And_rm16_imm8, Code::And_rm32_imm8, Code::And_rm64_imm8]),
        },
        Ins::Or => Forms {
            rm_r: [Code::Or_rm8_r8, Code::Or_rm16_r16, Code::Or_rm32_r32, Code::Or_rm64_r64],
            r_rm: [Code::Or_r8_rm8, Code::Or_r16_rm16, Code::Or_r32_rm32, Code::Or_r64_rm64],
            rm_imm: [Code::Or_rm8_imm8, Code::Or_rm16_imm16, Code::Or_rm32_imm32, Code::Or_rm64_imm32],
            rm_imm8: Some([Code::Or_rm8_imm8, Code::Or_rm16_imm8, Code::Or_rm32_imm8, Code::Or_rm64_imm8]),
        },
        Ins::Xor => Forms {
            rm_r: [Code::Xor_rm8_r8, Code::Xor_rm16_r16, Code::Xor_rm32_r32, Code::Xor_rm64_r64],
            r_rm: [Code::Xor_r8_rm8, Code::Xor_r16_rm16, Code::Xor_r32_rm32, Code::Xor_r64_rm64],
            rm_imm: [Code::Xor_rm8_imm8, Code::Xor_rm16_imm16, Code::Xor_rm32_imm32, Code::Xor_rm64_imm32],
            rm_imm8: Some([Code::Xor_rm8_imm8, Code::Xor_rm16_imm8, Code::Xor_rm32_imm8, Code::Xor_rm64_imm8]),
        },
        Ins::Cmp => Forms {
            rm_r: [Code::Cmp_rm8_r8, Code::Cmp_rm16_r16, Code::Cmp_rm32_r32, Code::Cmp_rm64_r64],
            r_rm: [Code::Cmp_r8_rm8, Code::Cmp_r16_rm16, Code::Cmp_r32_rm32, Code::Cmp_r64_rm64],
            rm_imm: [Code::Cmp_rm8_imm8, Code::Cmp_rm16_imm16, Code::Cmp_rm32_imm32, Code::Cmp_rm64_imm32],
            rm_imm8: Some([Code::Cmp_rm8_imm8, Code::Cmp_rm16_imm8, Code::Cmp_rm32_imm8, Code::Cmp_rm64_imm8]),
        },
        // test is symmetric: the register-from-memory form reuses the store form.
        Ins::Test => Forms {
            rm_r: [Code::Test_rm8_r8, Code::Test_rm16_r16, Code::Test_rm32_r32, Code::Test_rm64_r64],
            r_rm: [Code::Test_rm8_r8, Code::Test_rm16_r16, Code::Test_rm32_r32, Code::Test_rm64_r64],
            rm_imm: [Code::Test_rm8_imm8, Code::Test_rm16_imm16, Code::Test_rm32_imm32, Code::Test_rm64_imm32],
            rm_imm8: None,
        },
        _ => return None,
    };
    Some(f)
}

/// Where a lowered memory operand needs a relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemReloc {
    None,
    /// rip-relative reference into the data section.
    Data(u32),
}

fn iced_err(e: impl std::fmt::Display) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

fn fits_i8(value: i64) -> bool {
    i8::try_from(value).is_ok()
}

fn displ_size(disp: i64) -> u32 {
    if disp == 0 {
        0
    } else if fits_i8(disp) {
        1
    } else {
        4
    }
}

/// Immediate of a 32-bit-immediate form. Unsigned 32-bit values are accepted
/// for 4-byte operations.
fn imm32(value: i64, size: OpSize) -> Result<i32, EncodingError> {
    if let Ok(v) = i32::try_from(value) {
        return Ok(v);
    }
    if size != OpSize::B8 {
        if let Ok(v) = u32::try_from(value) {
            return Ok(v as i32);
        }
    }
    Err(EncodingError::UnsupportedInstruction)
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    encoder: Encoder,
    /// Records encoded at their final offset so far.
    encoded: u64,
}

impl Default for X64Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl X64Encoder {
    /// Create a new x86-64 encoder.
    pub fn new() -> Self {
        Self {
            encoder: Encoder::new(64),
            encoded: 0,
        }
    }

    /// Number of records encoded at their final offset.
    pub fn encoded_count(&self) -> u64 {
        self.encoded
    }

    // ---- registers ----

    fn gp(reg: AsmReg, size: OpSize) -> Result<Register, EncodingError> {
        if !reg.is_gp() {
            return Err(EncodingError::InvalidRegister);
        }
        let table = match size {
            OpSize::B1 => &GP8_REGS,
            OpSize::B2 => &GP16_REGS,
            OpSize::B4 => &GP32_REGS,
            OpSize::B8 => &GP64_REGS,
        };
        table
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    fn reg1(desc: &InstrDesc<'_>, size: OpSize) -> Result<Register, EncodingError> {
        desc.reg1
            .ok_or(EncodingError::InvalidRegister)
            .and_then(|r| Self::gp(r, size))
    }

    fn reg2(desc: &InstrDesc<'_>, size: OpSize) -> Result<Register, EncodingError> {
        desc.reg2
            .ok_or(EncodingError::InvalidRegister)
            .and_then(|r| Self::gp(r, size))
    }

    // ---- memory operands ----

    /// Lower the record's memory operand. `frame` is `None` while estimating.
    fn mem(
        desc: &InstrDesc<'_>,
        ip: u64,
        frame: Option<&FrameLayout>,
    ) -> Result<(MemoryOperand, MemReloc), EncodingError> {
        let disp = desc.dsp();
        match desc.addr {
            AddrOperand::None => Err(EncodingError::InvalidMemoryOperand),
            AddrOperand::Amd(am) => {
                let base = am.base.map(|r| Self::gp(r, OpSize::B8)).transpose()?;
                let index = am.index.map(|r| Self::gp(r, OpSize::B8)).transpose()?;
                if index == Some(Register::RSP) || i32::try_from(disp).is_err() {
                    return Err(EncodingError::InvalidMemoryOperand);
                }
                let size = if base.is_none() { 4 } else { displ_size(disp) };
                Ok((
                    MemoryOperand::new(
                        base.unwrap_or(Register::None),
                        index.unwrap_or(Register::None),
                        am.scale as u32,
                        disp,
                        size,
                        false,
                        Register::None,
                    ),
                    MemReloc::None,
                ))
            }
            AddrOperand::Lcl(lv) => {
                let (base, disp) = match frame {
                    Some(frame) => {
                        let offset = frame
                            .frame_offset(lv)
                            .ok_or(EncodingError::InvalidMemoryOperand)?;
                        (Self::gp(frame.frame_reg, OpSize::B8)?, offset as i64 + disp)
                    }
                    None => (Register::R12, LCL_ESTIMATE_DISP),
                };
                Ok((
                    MemoryOperand::new(base, Register::None, 1, disp, displ_size(disp), false, Register::None),
                    MemReloc::None,
                ))
            }
            AddrOperand::Data(offset) => Ok((
                MemoryOperand::new(Register::RIP, Register::None, 1, ip as i64, 8, false, Register::None),
                MemReloc::Data(offset.wrapping_add(disp as u32)),
            )),
            AddrOperand::Abs(addr) => {
                let addr = addr as i64 + disp;
                if i32::try_from(addr).is_err() {
                    return Err(EncodingError::InvalidMemoryOperand);
                }
                Ok((
                    MemoryOperand::new(Register::None, Register::None, 1, addr, 4, false, Register::None),
                    MemReloc::None,
                ))
            }
        }
    }

    // ---- instruction selection ----

    /// Build the iced instruction for a record that is not hand-encoded.
    fn lower(
        desc: &InstrDesc<'_>,
        ip: u64,
        frame: Option<&FrameLayout>,
    ) -> Result<(Instruction, MemReloc), EncodingError> {
        if desc.ext.is_some() {
            return Err(EncodingError::UnsupportedInstruction);
        }
        let size = desc.size;
        let si = size_index(size);
        let cns = desc.cns();
        let mut reloc = MemReloc::None;
        let mut mem = || -> Result<MemoryOperand, EncodingError> {
            let (m, r) = Self::mem(desc, ip, frame)?;
            reloc = r;
            Ok(m)
        };

        let instr = match (desc.ins, desc.fmt) {
            (Ins::Mov, InsFormat::RI) => {
                let reg = Self::reg1(desc, size)?;
                match size {
                    OpSize::B8 if i32::try_from(cns).is_ok() => {
                        Instruction::with2(Code::Mov_rm64_imm32, reg, cns as i32)
                    }
                    OpSize::B8 => Instruction::with2(Code::Mov_r64_imm64, reg, cns as u64),
                    OpSize::B4 => Instruction::with2(Code::Mov_r32_imm32, reg, imm32(cns, size)? as u32),
                    OpSize::B2 => Instruction::with2(Code::Mov_r16_imm16, reg, cns as u16 as u32),
                    OpSize::B1 => Instruction::with2(Code::Mov_r8_imm8, reg, cns as u8 as u32),
                }
            }
            (Ins::Lea, InsFormat::RM) => {
                let code = match size {
                    OpSize::B8 => Code::Lea_r64_m,
                    OpSize::B4 => Code::Lea_r32_m,
                    OpSize::B2 => Code::Lea_r16_m,
                    OpSize::B1 => return Err(EncodingError::UnsupportedInstruction),
                };
                Instruction::with2(code, Self::reg1(desc, size)?, mem()?)
            }
            (Ins::Imul, InsFormat::RR | InsFormat::RM | InsFormat::RRI) => {
                let codes = match size {
                    OpSize::B8 => [Code::Imul_r64_rm64, Code::Imul_r64_rm64_imm8, Code::Imul_r64_rm64_imm32],
                    OpSize::B4 => [Code::Imul_r32_rm32, Code::Imul_r32_rm32_imm8, Code::Imul_r32_rm32_imm32],
                    OpSize::B2 => [Code::Imul_r16_rm16, Code::Imul_r16_rm16_imm8, Code::Imul_r16_rm16_imm16],
                    OpSize::B1 => return Err(EncodingError::UnsupportedInstruction),
                };
                let dst = Self::reg1(desc, size)?;
                match desc.fmt {
                    InsFormat::RR => Instruction::with2(codes[0], dst, Self::reg2(desc, size)?),
                    InsFormat::RM => Instruction::with2(codes[0], dst, mem()?),
                    _ => {
                        let src = Self::reg2(desc, size)?;
                        let code = if fits_i8(cns) { codes[1] } else { codes[2] };
                        Instruction::with3(code, dst, src, imm32(cns, size)?)
                    }
                }
            }
            (Ins::Push, InsFormat::R) => Instruction::with1(Code::Push_r64, Self::reg1(desc, OpSize::B8)?),
            (Ins::Pop, InsFormat::R) => Instruction::with1(Code::Pop_r64, Self::reg1(desc, OpSize::B8)?),
            (Ins::Push, InsFormat::M) => Instruction::with1(Code::Push_rm64, mem()?),
            (Ins::Pop, InsFormat::M) => Instruction::with1(Code::Pop_rm64, mem()?),
            (Ins::Push, InsFormat::I) => {
                let code = if fits_i8(cns) { Code::Pushq_imm8 } else { Code::Pushq_imm32 };
                Instruction::with1(code, imm32(cns, OpSize::B8)?)
            }
            (Ins::Call, InsFormat::R) => Instruction::with1(Code::Call_rm64, Self::reg1(desc, OpSize::B8)?),
            (Ins::Call, InsFormat::M) => Instruction::with1(Code::Call_rm64, mem()?),
            (Ins::Jmp, InsFormat::R) => Instruction::with1(Code::Jmp_rm64, Self::reg1(desc, OpSize::B8)?),
            (Ins::Jmp, InsFormat::M) => Instruction::with1(Code::Jmp_rm64, mem()?),
            (ins, fmt) => {
                let f = forms(ins).ok_or(EncodingError::UnsupportedInstruction)?;
                let imm_code = |cns: i64| match &f.rm_imm8 {
                    Some(short) if size != OpSize::B1 && fits_i8(cns) => short[si],
                    _ => f.rm_imm[si],
                };
                match fmt {
                    InsFormat::RR => Instruction::with2(f.rm_r[si], Self::reg1(desc, size)?, Self::reg2(desc, size)?),
                    InsFormat::RM if ins == Ins::Test => {
                        Instruction::with2(f.rm_r[si], mem()?, Self::reg1(desc, size)?)
                    }
                    InsFormat::RM => Instruction::with2(f.r_rm[si], Self::reg1(desc, size)?, mem()?),
                    InsFormat::MR => Instruction::with2(f.rm_r[si], mem()?, Self::reg1(desc, size)?),
                    InsFormat::RI => Instruction::with2(imm_code(cns), Self::reg1(desc, size)?, imm32(cns, size)?),
                    InsFormat::MI => Instruction::with2(imm_code(cns), mem()?, imm32(cns, size)?),
                    _ => return Err(EncodingError::UnsupportedInstruction),
                }
            }
        }
        .map_err(iced_err)?;
        Ok((instr, reloc))
    }

    /// Encode with iced, appending to `out`.
    fn run(encoder: &mut Encoder, instr: &Instruction, ip: u64, out: &mut Vec<u8>) -> Result<ConstantOffsets, EncodingError> {
        encoder.encode(instr, ip).map_err(iced_err)?;
        out.extend_from_slice(&encoder.take_buffer());
        Ok(encoder.get_constant_offsets())
    }

    fn emit_nops(mut size: usize, out: &mut Vec<u8>) {
        while size > 0 {
            let chunk = size.min(NOPS.len());
            out.extend_from_slice(NOPS[chunk - 1]);
            size -= chunk;
        }
    }

    fn nop_size(desc: &InstrDesc<'_>) -> u32 {
        desc.cns().max(1) as u32
    }

    fn label_size(desc: &InstrDesc<'_>, info: &JumpInfo, target: &TargetInfo) -> u32 {
        match desc.ins {
            Ins::Jmp | Ins::Jcc(_) => target.branch.size(info.form, desc.ins.is_cond_branch()),
            Ins::Lea => LABEL_LEA_SIZE,
            _ => CALL_REL32_SIZE,
        }
    }
}

impl InstrEncoder for X64Encoder {
    fn estimate_size(&self, desc: &InstrDesc<'_>, target: &TargetInfo) -> Result<u32, EncodingError> {
        if let Some(info) = desc.jump() {
            return Ok(Self::label_size(desc, info, target));
        }
        match (desc.ins, desc.fmt) {
            (Ins::Nop, _) => return Ok(Self::nop_size(desc)),
            (Ins::Ret | Ins::Int3, InsFormat::None) => return Ok(1),
            (Ins::Call, InsFormat::Method) => return Ok(CALL_REL32_SIZE),
            _ => {}
        }
        let (instr, _) = Self::lower(desc, 0, None)?;
        let mut encoder = Encoder::new(64);
        let mut out = Vec::new();
        Self::run(&mut encoder, &instr, 0, &mut out)?;
        Ok(out.len() as u32)
    }

    fn encode(
        &mut self,
        desc: &InstrDesc<'_>,
        ctx: &EncodeContext<'_>,
        out: &mut Vec<u8>,
    ) -> Result<Vec<Relocation>, EncodingError> {
        self.encoded += 1;
        match (desc.ins, desc.fmt) {
            (Ins::Nop, _) => {
                Self::emit_nops(Self::nop_size(desc) as usize, out);
                return Ok(Vec::new());
            }
            (Ins::Ret, InsFormat::None) => {
                out.push(0xC3);
                return Ok(Vec::new());
            }
            (Ins::Int3, InsFormat::None) => {
                out.push(0xCC);
                return Ok(Vec::new());
            }
            (Ins::Call, InsFormat::Method) => {
                let Some(CallTarget::Method(handle)) = desc.call().map(|c| c.target) else {
                    return Err(EncodingError::UnsupportedInstruction);
                };
                out.extend_from_slice(&[0xE8, 0, 0, 0, 0]);
                return Ok(vec![Relocation {
                    section: Section::Hot,
                    offset: 1,
                    kind: RelocKind::Rel32,
                    target: RelocTarget::Method(handle),
                    addend: -4,
                }]);
            }
            _ => {}
        }

        let ip = ctx.offset as u64;
        let (instr, reloc) = Self::lower(desc, ip, ctx.frame)?;
        let start = out.len();
        let offsets = Self::run(&mut self.encoder, &instr, ip, out)?;
        let len = (out.len() - start) as u32;

        let MemReloc::Data(data_offset) = reloc else {
            return Ok(Vec::new());
        };
        if !offsets.has_displacement() {
            return Err(EncodingError::InvalidMemoryOperand);
        }
        let at = offsets.displacement_offset() as u32;
        out[start + at as usize..start + at as usize + 4].fill(0);
        Ok(vec![Relocation {
            section: Section::Hot,
            offset: at,
            kind: RelocKind::RipRel32,
            target: RelocTarget::Data(data_offset),
            addend: at as i64 - len as i64,
        }])
    }

    fn encode_jump(
        &mut self,
        desc: &InstrDesc<'_>,
        form: JumpForm,
        src: u32,
        dst: u32,
        out: &mut Vec<u8>,
    ) -> Result<JumpSite, EncodingError> {
        self.encoded += 1;
        let rel = |size: u32| dst as i64 - (src as i64 + size as i64);
        let rel32 = |size: u32| {
            let d = rel(size);
            i32::try_from(d).map_err(|_| EncodingError::DisplacementOutOfRange(d))
        };

        match desc.ins {
            Ins::Jmp | Ins::Jcc(_) if form == JumpForm::Short => {
                let d = rel(2);
                let d8 = i8::try_from(d).map_err(|_| EncodingError::DisplacementOutOfRange(d))?;
                let opcode = match desc.ins {
                    Ins::Jcc(cc) => 0x70 | cc.code(),
                    _ => 0xEB,
                };
                out.extend_from_slice(&[opcode, d8 as u8]);
                Ok(JumpSite { disp_offset: 1, width: 1 })
            }
            Ins::Jcc(cc) => {
                let d = rel32(6)?;
                out.extend_from_slice(&[0x0F, 0x80 | cc.code()]);
                out.extend_from_slice(&d.to_le_bytes());
                Ok(JumpSite { disp_offset: 2, width: 4 })
            }
            Ins::Jmp => {
                let d = rel32(5)?;
                out.push(0xE9);
                out.extend_from_slice(&d.to_le_bytes());
                Ok(JumpSite { disp_offset: 1, width: 4 })
            }
            Ins::Call => {
                let d = rel32(CALL_REL32_SIZE)?;
                out.push(0xE8);
                out.extend_from_slice(&d.to_le_bytes());
                Ok(JumpSite { disp_offset: 1, width: 4 })
            }
            Ins::Lea => {
                let reg = desc.reg1.ok_or(EncodingError::InvalidRegister)?;
                if !reg.is_gp() || reg.id > 15 {
                    return Err(EncodingError::InvalidRegister);
                }
                let d = rel32(LABEL_LEA_SIZE)?;
                let rex = if reg.id >= 8 { 0x4C } else { 0x48 };
                out.extend_from_slice(&[rex, 0x8D, ((reg.id & 7) << 3) | 0x05]);
                out.extend_from_slice(&d.to_le_bytes());
                Ok(JumpSite { disp_offset: 3, width: 4 })
            }
            _ => Err(EncodingError::UnsupportedInstruction),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::regs::RegMask;
    use crate::emit::group::Label;
    use crate::instr::desc::{AddrMode, CallInfo, Cond, GcKind, Payload};
    use crate::instr::lcl_var::LclVarAddr;
    use crate::x64::regs::{RAX, RBP, RBX, RCX, RSP, R12, R9};

    fn desc(ins: Ins, fmt: InsFormat, size: OpSize) -> InstrDesc<'static> {
        InstrDesc {
            num: 0,
            ins,
            fmt,
            size,
            gc: GcKind::None,
            reg1: None,
            reg2: None,
            ext: None,
            addr: AddrOperand::None,
            small_cns: 0,
            code_size: 0,
            payload: Payload::Small,
        }
    }

    fn encode(d: &InstrDesc<'_>, frame: Option<&FrameLayout>) -> (Vec<u8>, Vec<Relocation>) {
        let target = TargetInfo::x64();
        let ctx = EncodeContext {
            offset: 0x40,
            target: &target,
            frame,
        };
        let mut out = Vec::new();
        let relocs = X64Encoder::new().encode(d, &ctx, &mut out).unwrap();
        (out, relocs)
    }

    #[test]
    fn test_register_forms() {
        let mut d = desc(Ins::Test, InsFormat::RR, OpSize::B8);
        d.reg1 = Some(RAX);
        d.reg2 = Some(RAX);
        assert_eq!(encode(&d, None).0, vec![0x48, 0x85, 0xC0]);

        let mut d = desc(Ins::Mov, InsFormat::RI, OpSize::B4);
        d.reg1 = Some(RAX);
        d.small_cns = 1;
        assert_eq!(encode(&d, None).0, vec![0xB8, 0x01, 0x00, 0x00, 0x00]);

        let mut d = desc(Ins::Add, InsFormat::RI, OpSize::B8);
        d.reg1 = Some(RSP);
        d.small_cns = 0x20;
        assert_eq!(encode(&d, None).0, vec![0x48, 0x83, 0xC4, 0x20]);

        let mut d = desc(Ins::Push, InsFormat::R, OpSize::B8);
        d.reg1 = Some(R12);
        assert_eq!(encode(&d, None).0, vec![0x41, 0x54]);
    }

    #[test]
    fn test_mov_immediate_width() {
        let mut d = desc(Ins::Mov, InsFormat::RI, OpSize::B8);
        d.reg1 = Some(RCX);
        d.payload = Payload::Cns(1 << 40);
        let enc = X64Encoder::new();
        let target = TargetInfo::x64();
        assert_eq!(enc.estimate_size(&d, &target).unwrap(), 10);
        d.payload = Payload::Cns(-1);
        assert_eq!(enc.estimate_size(&d, &target).unwrap(), 7);
    }

    #[test]
    fn test_memory_forms() {
        let mut d = desc(Ins::Mov, InsFormat::RM, OpSize::B8);
        d.reg1 = Some(RBX);
        d.addr = AddrOperand::Amd(AddrMode::base(RCX));
        assert_eq!(encode(&d, None).0, vec![0x48, 0x8B, 0x19]);

        let mut frame = FrameLayout::new(RBP);
        frame.set_var_offset(2, -16);
        let mut d = desc(Ins::Mov, InsFormat::MR, OpSize::B8);
        d.reg1 = Some(R9);
        d.addr = AddrOperand::Lcl(LclVarAddr::new(2, 8).unwrap());
        let (bytes, _) = encode(&d, Some(&frame));
        assert_eq!(bytes, vec![0x4C, 0x89, 0x4D, 0xF8]);
        // The estimate covers any frame register.
        let estimate = X64Encoder::new().estimate_size(&d, &TargetInfo::x64()).unwrap();
        assert_eq!(estimate, 8);
    }

    #[test]
    fn test_data_reference_relocates() {
        let mut d = desc(Ins::Mov, InsFormat::RM, OpSize::B8);
        d.reg1 = Some(RAX);
        d.addr = AddrOperand::Data(0x10);
        let (bytes, relocs) = encode(&d, None);
        assert_eq!(bytes, vec![0x48, 0x8B, 0x05, 0, 0, 0, 0]);
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].offset, 3);
        assert_eq!(relocs[0].kind, RelocKind::RipRel32);
        assert_eq!(relocs[0].target, RelocTarget::Data(0x10));
        assert_eq!(relocs[0].addend, -4);
    }

    #[test]
    fn test_direct_call_relocates() {
        let mut d = desc(Ins::Call, InsFormat::Method, OpSize::B8);
        d.payload = Payload::Call(CallInfo {
            target: CallTarget::Method(7),
            arg_slots: 0,
            gc_vars: None,
            gcref_regs: RegMask::NONE,
            byref_regs: RegMask::NONE,
            no_gc: false,
            disp: 0,
        });
        let (bytes, relocs) = encode(&d, None);
        assert_eq!(bytes, vec![0xE8, 0, 0, 0, 0]);
        assert_eq!(relocs[0].target, RelocTarget::Method(7));
    }

    #[test]
    fn test_nop_padding() {
        let mut d = desc(Ins::Nop, InsFormat::None, OpSize::B1);
        d.small_cns = 12;
        let (bytes, _) = encode(&d, None);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[9..], &[0x0F, 0x1F, 0x00]);
    }

    #[test]
    fn test_branch_forms() {
        let mut enc = X64Encoder::new();
        let mut d = desc(Ins::Jcc(Cond::E), InsFormat::Label, OpSize::B8);
        d.payload = Payload::Jump(JumpInfo::to_label(Label(0)));

        let mut out = Vec::new();
        let site = enc.encode_jump(&d, JumpForm::Short, 0x10, 0x20, &mut out).unwrap();
        assert_eq!(out, vec![0x74, 0x0E]);
        assert_eq!(site, JumpSite { disp_offset: 1, width: 1 });

        out.clear();
        enc.encode_jump(&d, JumpForm::Long, 0x10, 0x0, &mut out).unwrap();
        assert_eq!(out, vec![0x0F, 0x84, 0xEA, 0xFF, 0xFF, 0xFF]);

        out.clear();
        let err = enc.encode_jump(&d, JumpForm::Short, 0, 0x200, &mut out).unwrap_err();
        assert_eq!(err, EncodingError::DisplacementOutOfRange(0x1FE));

        d.ins = Ins::Lea;
        d.reg1 = Some(R9);
        out.clear();
        enc.encode_jump(&d, JumpForm::Long, 0, 0x17, &mut out).unwrap();
        assert_eq!(out, vec![0x4C, 0x8D, 0x0D, 0x10, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_patch_jump() {
        let enc = X64Encoder::new();
        let mut code = vec![0xE9, 0x10, 0, 0, 0];
        enc.patch_jump(&mut code, 1, 4, -4).unwrap();
        assert_eq!(code, vec![0xE9, 0x0C, 0, 0, 0]);
        let mut short = vec![0xEB, 0x7F];
        assert!(enc.patch_jump(&mut short, 1, 1, 1).is_err());
    }
}
