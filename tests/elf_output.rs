mod common;

use common::emit;
use igemit::elf::write_object;
use object::{File, Object, ObjectSection, ObjectSymbol, RelocationFlags, RelocationTarget, SymbolKind};

#[test]
fn simple_object() {
    let method = emit(
        "
        .method  foo
        entry:
                 xor   eax, eax
        .epilog
        ",
    )
    .unwrap();
    let obj = write_object(&method.name, &method.output).unwrap();
    let file = File::parse(&*obj).unwrap();
    assert!(file.section_by_name(".text").is_some());
    assert!(file.section_by_name(".rodata").is_none());
    let sym = file.symbol_by_name("foo").unwrap();
    assert_eq!(sym.kind(), SymbolKind::Text);
    assert_eq!(sym.size(), method.output.code_size as u64);
}

#[test]
fn cold_branch_targets_the_text_section() {
    let method = emit(
        "
        .method  split
        entry:
                 test  ecx, ecx
                 jne   slow
                 xor   eax, eax
        .epilog
        .cold
        slow:
                 int3
        ",
    )
    .unwrap();
    assert_eq!(method.output.hot_size, 16);
    let obj = write_object(&method.name, &method.output).unwrap();
    let file = File::parse(&*obj).unwrap();
    let text = file.section_by_name(".text").unwrap();

    // Hot and cold are laid out back to back in one section.
    assert_eq!(text.data().unwrap().len(), 17);
    assert_eq!(text.data().unwrap()[16], 0xCC);

    let relocs: Vec<_> = text.relocations().collect();
    assert_eq!(relocs.len(), 1);
    let (offset, reloc) = &relocs[0];
    assert_eq!(*offset, 8);
    assert_eq!(
        reloc.flags(),
        RelocationFlags::Elf {
            r_type: object::elf::R_X86_64_PC32
        }
    );
    // slow sits at text offset 16; the field ends 4 bytes after it starts.
    assert_eq!(reloc.addend(), 12);
    let RelocationTarget::Symbol(idx) = reloc.target() else {
        panic!("branch should target a symbol");
    };
    assert_eq!(file.symbol_by_index(idx).unwrap().kind(), SymbolKind::Section);
}

#[test]
fn jump_table_entries_become_absolute_relocations() {
    let method = emit(
        "
        .method  tables
        .data    k0 01 02 03 04 05 06 07 08 align8
        .table   jt a b
        entry:
                 mov   rax, [data k0]
                 lea   rcx, [data jt+8]
        a:
                 ret
        b:
                 ret
        ",
    )
    .unwrap();
    let obj = write_object(&method.name, &method.output).unwrap();
    let file = File::parse(&*obj).unwrap();

    let rodata = file.section_by_name(".rodata").unwrap();
    let data = rodata.data().unwrap();
    assert_eq!(&data[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    // Table slots are left for the linker.
    assert!(data[8..24].iter().all(|&b| b == 0));

    let mut entries: Vec<(u64, i64)> = rodata
        .relocations()
        .map(|(offset, reloc)| {
            assert_eq!(
                reloc.flags(),
                RelocationFlags::Elf {
                    r_type: object::elf::R_X86_64_64
                }
            );
            (offset, reloc.addend())
        })
        .collect();
    entries.sort_unstable();
    let a = method.label_offset("a").unwrap() as i64;
    let b = method.label_offset("b").unwrap() as i64;
    assert_eq!(entries, vec![(8, a), (16, b)]);

    let text = file.section_by_name(".text").unwrap();
    assert_eq!(text.relocations().count(), 2);
}
