//! x86-64 general purpose registers.
//!
//! Register numbers follow the hardware encoding (rax = 0 .. r15 = 15), so the
//! low three bits go into ModRM/SIB fields and bit 3 into the REX prefix.

use crate::core::regs::AsmReg;
use crate::instr::desc::OpSize;

pub const RAX: AsmReg = AsmReg::gp(0);
pub const RCX: AsmReg = AsmReg::gp(1);
pub const RDX: AsmReg = AsmReg::gp(2);
pub const RBX: AsmReg = AsmReg::gp(3);
pub const RSP: AsmReg = AsmReg::gp(4);
pub const RBP: AsmReg = AsmReg::gp(5);
pub const RSI: AsmReg = AsmReg::gp(6);
pub const RDI: AsmReg = AsmReg::gp(7);
pub const R8: AsmReg = AsmReg::gp(8);
pub const R9: AsmReg = AsmReg::gp(9);
pub const R10: AsmReg = AsmReg::gp(10);
pub const R11: AsmReg = AsmReg::gp(11);
pub const R12: AsmReg = AsmReg::gp(12);
pub const R13: AsmReg = AsmReg::gp(13);
pub const R14: AsmReg = AsmReg::gp(14);
pub const R15: AsmReg = AsmReg::gp(15);

const NAMES64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi",
    "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];

const NAMES32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi",
    "r8d", "r9d", "r10d", "r11d", "r12d", "r13d", "r14d", "r15d",
];

const NAMES16: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di",
    "r8w", "r9w", "r10w", "r11w", "r12w", "r13w", "r14w", "r15w",
];

const NAMES8: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil",
    "r8b", "r9b", "r10b", "r11b", "r12b", "r13b", "r14b", "r15b",
];

fn table(size: OpSize) -> &'static [&'static str; 16] {
    match size {
        OpSize::B1 => &NAMES8,
        OpSize::B2 => &NAMES16,
        OpSize::B4 => &NAMES32,
        OpSize::B8 => &NAMES64,
    }
}

/// Assembler name of `reg` at the given width.
pub fn reg_name(reg: AsmReg, size: OpSize) -> Option<&'static str> {
    if !reg.is_gp() {
        return None;
    }
    table(size).get(reg.id as usize).copied()
}

/// Parse a register name into the register and the width the name implies.
pub fn parse_reg(name: &str) -> Option<(AsmReg, OpSize)> {
    let name = name.to_ascii_lowercase();
    for size in [OpSize::B8, OpSize::B4, OpSize::B2, OpSize::B1] {
        if let Some(id) = table(size).iter().position(|n| *n == name) {
            return Some((AsmReg::gp(id as u8), size));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_names() {
        assert_eq!(reg_name(RAX, OpSize::B8), Some("rax"));
        assert_eq!(reg_name(R13, OpSize::B4), Some("r13d"));
        assert_eq!(reg_name(RSI, OpSize::B1), Some("sil"));
        assert_eq!(reg_name(AsmReg::fp(0), OpSize::B8), None);
    }

    #[test]
    fn test_parse_reg() {
        assert_eq!(parse_reg("RBX"), Some((RBX, OpSize::B8)));
        assert_eq!(parse_reg("r9w"), Some((R9, OpSize::B2)));
        assert_eq!(parse_reg("dl"), Some((RDX, OpSize::B1)));
        assert_eq!(parse_reg("xmm0"), None);
    }
}
