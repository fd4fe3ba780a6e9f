//! ELF relocatable output.
//!
//! An emitted method becomes one object file: hot and cold code share
//! `.text` (the cold part starts at `hot_size`, matching the emitter's code
//! offsets), the data section goes to `.rodata`, and the method is a global
//! function symbol. Code and data references are relocated against the
//! section symbols; calls to method handle `n` go through the undefined
//! symbol `method_n`.

use object::write::{
    Object, Relocation as ObjRelocation, SectionId, StandardSection, Symbol, SymbolId,
    SymbolSection,
};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SymbolFlags, SymbolKind, SymbolScope,
};
use hashbrown::HashMap;
use log::debug;
use thiserror::Error;

use crate::core::encoder::{RelocKind, RelocTarget, Relocation, Section};
use crate::emit::EmitOutput;

#[derive(Error, Debug)]
pub enum ElfError {
    #[error("relocation at {section:?}+{offset:#x}: {source}")]
    Relocation {
        section: Section,
        offset: u32,
        #[source]
        source: object::write::Error,
    },

    #[error("relocation at {section:?}+{offset:#x} needs a data section, but the method has none")]
    MissingData { section: Section, offset: u32 },

    #[error("failed to write object: {0}")]
    Write(#[from] object::write::Error),
}

pub type ElfResult<T> = Result<T, ElfError>;

struct ObjectWriter {
    obj: Object<'static>,
    text: SectionId,
    rodata: Option<SectionId>,
    methods: HashMap<u32, SymbolId>,
}

impl ObjectWriter {
    fn new() -> Self {
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.section_id(StandardSection::Text);
        Self {
            obj,
            text,
            rodata: None,
            methods: HashMap::new(),
        }
    }

    fn method_symbol(&mut self, handle: u32) -> SymbolId {
        if let Some(&sym) = self.methods.get(&handle) {
            return sym;
        }
        let sym = self.obj.add_symbol(Symbol {
            name: format!("method_{handle}").into_bytes(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        self.methods.insert(handle, sym);
        sym
    }

    fn rodata_for(&self, reloc: &Relocation) -> ElfResult<SectionId> {
        self.rodata.ok_or(ElfError::MissingData {
            section: reloc.section,
            offset: reloc.offset,
        })
    }

    /// Place `reloc` in the object; `hot_size` rebases cold offsets into `.text`.
    fn relocate(&mut self, reloc: &Relocation, hot_size: u32) -> ElfResult<()> {
        let (section, offset) = match reloc.section {
            Section::Hot => (self.text, reloc.offset as u64),
            Section::Cold => (self.text, (hot_size + reloc.offset) as u64),
            Section::Data => (self.rodata_for(reloc)?, reloc.offset as u64),
        };

        let (symbol, addend) = match reloc.target {
            RelocTarget::Code(off) => (self.obj.section_symbol(self.text), off as i64),
            RelocTarget::Data(off) => {
                let rodata = self.rodata_for(reloc)?;
                (self.obj.section_symbol(rodata), off as i64)
            }
            RelocTarget::Method(handle) => (self.method_symbol(handle), 0),
        };

        let r_type = match (reloc.kind, reloc.target) {
            (RelocKind::Rel32, RelocTarget::Method(_)) => object::elf::R_X86_64_PLT32,
            (RelocKind::Rel32 | RelocKind::RipRel32, _) => object::elf::R_X86_64_PC32,
            (RelocKind::Abs64, _) => object::elf::R_X86_64_64,
        };

        self.obj
            .add_relocation(
                section,
                ObjRelocation {
                    offset,
                    symbol,
                    addend: addend + reloc.addend,
                    flags: RelocationFlags::Elf { r_type },
                },
            )
            .map_err(|source| ElfError::Relocation {
                section: reloc.section,
                offset: reloc.offset,
                source,
            })
    }
}

/// Write `output` as an x86-64 ELF relocatable defining the function `name`.
pub fn write_object(name: &str, output: &EmitOutput) -> ElfResult<Vec<u8>> {
    let mut writer = ObjectWriter::new();

    let code = output.code();
    let text = writer.text;
    let code_offset = writer.obj.append_section_data(text, &code, 16);
    writer.obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: code_offset,
        size: code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });

    if !output.data.is_empty() {
        let mut data = output.data.clone();
        // Absolute addresses are those of the in-memory buffers; the linker
        // fills the field from the relocation instead.
        for reloc in &output.relocations {
            if reloc.section == Section::Data && reloc.kind == RelocKind::Abs64 {
                let at = reloc.offset as usize;
                if let Some(field) = data.get_mut(at..at + 8) {
                    field.fill(0);
                }
            }
        }
        let rodata = writer.obj.section_id(StandardSection::ReadOnlyData);
        writer.obj.append_section_data(rodata, &data, 8);
        writer.rodata = Some(rodata);
    }

    for reloc in &output.relocations {
        writer.relocate(reloc, output.hot_size)?;
    }
    debug!(
        "{name}: object with {} code bytes, {} data bytes, {} relocations",
        code.len(),
        output.data.len(),
        output.relocations.len()
    );
    Ok(writer.obj.write()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::TestContext;
    use crate::listing::emit_text;
    use object::{Object as _, ObjectSection, ObjectSymbol, RelocationTarget};

    const METHOD: &str = "
        .method  lookup
        .frame   locals=0
        .data    k0 00 00 00 00 00 00 f0 3f align8
        entry:
                 mov   rax, [data k0]
                 call  #9
                 ret
    ";

    #[test]
    fn test_object_carries_code_and_symbols() {
        let ctx = TestContext::new();
        let method = ctx
            .with_session(|session| emit_text(session, METHOD, ctx.config()))
            .unwrap();
        let bytes = write_object(&method.name, &method.output).unwrap();

        let file = object::File::parse(&*bytes).unwrap();
        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.data().unwrap(), method.output.code().as_slice());
        let sym = file.symbol_by_name("lookup").unwrap();
        assert_eq!(sym.size(), method.output.code_size as u64);
        assert!(file.symbol_by_name("method_9").unwrap().is_undefined());

        let rodata = file.section_by_name(".rodata").unwrap();
        assert_eq!(rodata.data().unwrap(), method.output.data.as_slice());
    }

    #[test]
    fn test_relocation_kinds() {
        let ctx = TestContext::new();
        let method = ctx
            .with_session(|session| emit_text(session, METHOD, ctx.config()))
            .unwrap();
        let bytes = write_object(&method.name, &method.output).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        let text = file.section_by_name(".text").unwrap();

        let mut types: Vec<u32> = text
            .relocations()
            .map(|(_, reloc)| match reloc.flags() {
                RelocationFlags::Elf { r_type } => r_type,
                other => panic!("unexpected relocation flags {other:?}"),
            })
            .collect();
        types.sort_unstable();
        assert_eq!(
            types,
            vec![object::elf::R_X86_64_PC32, object::elf::R_X86_64_PLT32]
        );

        let (_, call) = text
            .relocations()
            .find(|(_, r)| r.flags() == RelocationFlags::Elf { r_type: object::elf::R_X86_64_PLT32 })
            .unwrap();
        assert_eq!(call.addend(), -4);
        let RelocationTarget::Symbol(idx) = call.target() else {
            panic!("call should target a symbol");
        };
        assert_eq!(file.symbol_by_index(idx).unwrap().name().unwrap(), "method_9");
    }
}
