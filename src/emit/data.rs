//! Read-only data emitted alongside the method.
//!
//! Constants are appended in order; 8-byte-aligned requests may insert 4
//! bytes of zero padding. Block tables hold either absolute code addresses
//! (relocated) or 32-bit offsets relative to the start of the method body.

use super::group::Label;
use crate::core::encoder::{RelocKind, RelocTarget, Relocation, Section};
use crate::core::error::{EmitError, EmitResult};

/// One item of the data section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataEntry {
    Raw(Vec<u8>),
    /// Pointer-sized absolute addresses of labels.
    BlockAddrTable(Vec<Label>),
    /// 32-bit label offsets relative to the first body group.
    BlockRel32Table(Vec<Label>),
}

impl DataEntry {
    fn size(&self, ptr_size: u32) -> u32 {
        match self {
            DataEntry::Raw(bytes) => bytes.len() as u32,
            DataEntry::BlockAddrTable(labels) => labels.len() as u32 * ptr_size,
            DataEntry::BlockRel32Table(labels) => labels.len() as u32 * 4,
        }
    }
}

/// The method's data section.
#[derive(Debug, Clone)]
pub struct DataSection {
    ptr_size: u32,
    entries: Vec<(u32, DataEntry)>,
    size: u32,
    align8: bool,
}

impl DataSection {
    pub fn new(ptr_size: u32) -> Self {
        Self {
            ptr_size,
            entries: Vec::new(),
            size: 0,
            align8: false,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Whether the section must be placed 8-byte aligned.
    pub fn align8(&self) -> bool {
        self.align8
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (u32, &DataEntry)> {
        self.entries.iter().map(|(offset, entry)| (*offset, entry))
    }

    fn push(&mut self, entry: DataEntry, dbl_align: bool) -> u32 {
        if dbl_align {
            self.align8 = true;
            if self.size % 8 != 0 {
                let pad = 8 - self.size % 8;
                self.entries.push((self.size, DataEntry::Raw(vec![0; pad as usize])));
                self.size += pad;
            }
        }
        let offset = self.size;
        self.size += entry.size(self.ptr_size);
        self.entries.push((offset, entry));
        offset
    }

    /// Append a constant; returns its offset.
    pub fn data_const(&mut self, bytes: &[u8], dbl_align: bool) -> u32 {
        self.push(DataEntry::Raw(bytes.to_vec()), dbl_align)
    }

    /// Append `size` zero bytes to be filled in later.
    pub fn data_reserve(&mut self, size: u32, dbl_align: bool) -> u32 {
        self.push(DataEntry::Raw(vec![0; size as usize]), dbl_align)
    }

    /// Overwrite bytes inside a previously added raw entry.
    pub fn data_write(&mut self, offset: u32, bytes: &[u8]) -> EmitResult<()> {
        let end = u32::try_from(bytes.len())
            .ok()
            .and_then(|len| offset.checked_add(len))
            .ok_or_else(|| {
                EmitError::internal(format!(
                    "data write of {} bytes at {offset:#x} overflows the section",
                    bytes.len()
                ))
            })?;
        for (start, entry) in &mut self.entries {
            let DataEntry::Raw(raw) = entry else {
                continue;
            };
            let stop = *start + raw.len() as u32;
            if offset >= *start && end <= stop {
                let at = (offset - *start) as usize;
                raw[at..at + bytes.len()].copy_from_slice(bytes);
                return Ok(());
            }
        }
        Err(EmitError::internal(format!(
            "data write {offset:#x}..{end:#x} does not fall inside one constant"
        )))
    }

    /// Append a jump table.
    pub fn block_table(&mut self, labels: &[Label], relative: bool) -> u32 {
        let entry = if relative {
            DataEntry::BlockRel32Table(labels.to_vec())
        } else {
            DataEntry::BlockAddrTable(labels.to_vec())
        };
        let align = !relative && self.ptr_size == 8;
        self.push(entry, align)
    }

    /// Write the section into `out`.
    ///
    /// `resolve` maps a label to `(code offset, absolute address)`, and
    /// `body_start` is the offset relative tables are measured from.
    /// Returns the relocations absolute tables need.
    pub fn write_into<F>(&self, out: &mut [u8], body_start: u32, resolve: F) -> EmitResult<Vec<Relocation>>
    where
        F: Fn(Label) -> EmitResult<(u32, u64)>,
    {
        if out.len() < self.size as usize {
            return Err(EmitError::internal(format!(
                "data buffer holds {} bytes, {} needed",
                out.len(),
                self.size
            )));
        }
        let mut relocs = Vec::new();
        for (offset, entry) in &self.entries {
            let mut at = *offset as usize;
            match entry {
                DataEntry::Raw(bytes) => out[at..at + bytes.len()].copy_from_slice(bytes),
                DataEntry::BlockAddrTable(labels) => {
                    for &label in labels {
                        let (code_offset, addr) = resolve(label)?;
                        let width = self.ptr_size as usize;
                        out[at..at + width].copy_from_slice(&addr.to_le_bytes()[..width]);
                        relocs.push(Relocation {
                            section: Section::Data,
                            offset: at as u32,
                            kind: RelocKind::Abs64,
                            target: RelocTarget::Code(code_offset),
                            addend: 0,
                        });
                        at += width;
                    }
                }
                DataEntry::BlockRel32Table(labels) => {
                    for &label in labels {
                        let (code_offset, _) = resolve(label)?;
                        let rel = code_offset.wrapping_sub(body_start);
                        out[at..at + 4].copy_from_slice(&rel.to_le_bytes());
                        at += 4;
                    }
                }
            }
        }
        Ok(relocs)
    }

    /// Section contents with labels resolved, for inspection.
    pub fn serialize<F>(&self, body_start: u32, resolve: F) -> EmitResult<Vec<u8>>
    where
        F: Fn(Label) -> EmitResult<(u32, u64)>,
    {
        let mut out = vec![0; self.size as usize];
        self.write_into(&mut out, body_start, resolve)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_alignment_pads() {
        let mut data = DataSection::new(8);
        assert_eq!(data.data_const(&[1, 2, 3, 4], false), 0);
        assert_eq!(data.data_const(&1.5f64.to_le_bytes(), true), 8);
        assert_eq!(data.size(), 16);
        assert!(data.align8());

        let bytes = data.serialize(0, |_| unreachable!()).unwrap();
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..], &1.5f64.to_le_bytes());
    }

    #[test]
    fn test_reserve_then_write() {
        let mut data = DataSection::new(8);
        let at = data.data_reserve(8, false);
        data.data_write(at + 2, &[0xAA, 0xBB]).unwrap();
        let bytes = data.serialize(0, |_| unreachable!()).unwrap();
        assert_eq!(bytes, vec![0, 0, 0xAA, 0xBB, 0, 0, 0, 0]);
        assert!(data.data_write(6, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_write_past_address_space_fails() {
        let mut data = DataSection::new(8);
        data.data_reserve(8, false);
        assert!(data.data_write(u32::MAX, &[1]).is_err());
        assert!(data.data_write(u32::MAX - 1, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_block_tables() {
        let mut data = DataSection::new(8);
        data.data_const(&[7], false);
        let abs = data.block_table(&[Label(0), Label(1)], false);
        let rel = data.block_table(&[Label(1)], true);
        assert_eq!((abs, rel), (8, 24));

        let resolve = |l: Label| Ok((0x10 * (l.0 + 1), 0x1000 + 0x10 * (l.0 as u64 + 1)));
        let mut out = vec![0; data.size() as usize];
        let relocs = data.write_into(&mut out, 0x8, resolve).unwrap();
        assert_eq!(relocs.len(), 2);
        assert_eq!(relocs[1].offset, 16);
        assert_eq!(relocs[1].target, RelocTarget::Code(0x20));
        assert_eq!(&out[8..16], &0x1010u64.to_le_bytes());
        assert_eq!(&out[24..28], &0x18u32.to_le_bytes());
    }
}
