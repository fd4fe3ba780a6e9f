//! Register identifiers and register masks.
//!
//! Registers are identified by a bank (general purpose, vector, ...) and an
//! index within that bank. GC liveness works on whole masks of registers, so
//! [`RegMask`] is the currency of the liveness tracker and of the snapshots
//! stored on instruction groups.

use std::fmt;

/// Maximum number of register banks supported (GP, FP).
pub const MAX_REGISTER_BANKS: usize = 2;

/// Maximum number of registers per bank.
pub const MAX_REGISTERS_PER_BANK: usize = 32;

/// Type for register bank indices.
pub type RegBank = u8;

/// Type for register IDs within a bank.
pub type RegId = u8;

/// General purpose register bank.
pub const GP_BANK: RegBank = 0;

/// Vector/floating point register bank.
pub const FP_BANK: RegBank = 1;

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    /// General purpose register `id`.
    pub const fn gp(id: RegId) -> Self {
        Self::new(GP_BANK, id)
    }

    /// Vector register `id`.
    pub const fn fp(id: RegId) -> Self {
        Self::new(FP_BANK, id)
    }

    /// Whether this is a general purpose register.
    pub fn is_gp(&self) -> bool {
        self.bank == GP_BANK
    }

    /// Get the linear register index for mask bit positions.
    pub fn linear_index(&self) -> usize {
        (self.bank as usize) * MAX_REGISTERS_PER_BANK + (self.id as usize)
    }

    /// Create from linear index.
    pub fn from_linear_index(index: usize) -> Self {
        let bank = (index / MAX_REGISTERS_PER_BANK) as RegBank;
        let id = (index % MAX_REGISTERS_PER_BANK) as RegId;
        Self { bank, id }
    }

    /// Single-register mask.
    pub fn mask(&self) -> RegMask {
        RegMask(1u64 << self.linear_index())
    }
}

/// Bit set of registers across all banks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegMask(pub u64);

impl RegMask {
    /// The empty mask.
    pub const NONE: RegMask = RegMask(0);

    /// Build a mask from a list of registers.
    pub fn of(regs: &[AsmReg]) -> Self {
        regs.iter().fold(Self::NONE, |acc, r| acc | r.mask())
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, reg: AsmReg) -> bool {
        self.0 & reg.mask().0 != 0
    }

    pub fn insert(&mut self, reg: AsmReg) {
        self.0 |= reg.mask().0;
    }

    pub fn remove(&mut self, reg: AsmReg) {
        self.0 &= !reg.mask().0;
    }

    /// Whether any register is present in both masks.
    pub fn intersects(&self, other: RegMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest register in the mask.
    pub fn lowest(&self) -> Option<AsmReg> {
        if self.0 == 0 {
            None
        } else {
            Some(AsmReg::from_linear_index(self.0.trailing_zeros() as usize))
        }
    }

    /// Iterate registers in increasing linear order.
    pub fn iter(&self) -> RegMaskIter {
        RegMaskIter(self.0)
    }
}

impl std::ops::BitOr for RegMask {
    type Output = RegMask;
    fn bitor(self, rhs: RegMask) -> RegMask {
        RegMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for RegMask {
    fn bitor_assign(&mut self, rhs: RegMask) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for RegMask {
    type Output = RegMask;
    fn bitand(self, rhs: RegMask) -> RegMask {
        RegMask(self.0 & rhs.0)
    }
}

impl std::ops::BitAndAssign for RegMask {
    fn bitand_assign(&mut self, rhs: RegMask) {
        self.0 &= rhs.0;
    }
}

impl std::ops::Not for RegMask {
    type Output = RegMask;
    fn not(self) -> RegMask {
        RegMask(!self.0)
    }
}

impl fmt::Debug for RegMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.iter().map(|r| (r.bank, r.id)))
            .finish()
    }
}

/// Iterator over the registers of a [`RegMask`].
pub struct RegMaskIter(u64);

impl Iterator for RegMaskIter {
    type Item = AsmReg;

    fn next(&mut self) -> Option<AsmReg> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(AsmReg::from_linear_index(bit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_index_round_trip() {
        let reg = AsmReg::new(FP_BANK, 5);
        assert_eq!(reg.linear_index(), 37);
        assert_eq!(AsmReg::from_linear_index(37), reg);
    }

    #[test]
    fn test_mask_operations() {
        let rax = AsmReg::gp(0);
        let rbx = AsmReg::gp(3);
        let xmm1 = AsmReg::fp(1);

        let mut mask = RegMask::of(&[rax, xmm1]);
        assert!(mask.contains(rax));
        assert!(!mask.contains(rbx));
        assert_eq!(mask.count(), 2);

        mask.insert(rbx);
        mask.remove(rax);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![rbx, xmm1]);
        assert_eq!(mask.lowest(), Some(rbx));

        let other = RegMask::of(&[rbx]);
        assert!(mask.intersects(other));
        assert_eq!(mask & !other, RegMask::of(&[xmm1]));
    }
}
