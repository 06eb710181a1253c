//! ELF64 relocatable-object serialization.

use crate::buffer::{align_up, Buffer};
use crate::error::{CodegenError, CodegenResult};
use crate::target::Machine;

use super::{FixupKind, ObjectWriter, SectionId, SymbolRec};

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ELFOSABI_NONE: u8 = 0;
const ET_REL: u16 = 1;
const EM_X86_64: u16 = 62;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_RELA: u32 = 4;
const SHT_NOBITS: u32 = 8;

const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;
const SHF_INFO_LINK: u64 = 0x40;

const STB_LOCAL: u8 = 0;
const STB_GLOBAL: u8 = 1;
const STT_NOTYPE: u8 = 0;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;

const R_X86_64_64: u32 = 1;
const R_X86_64_PC32: u32 = 2;
const R_X86_64_PLT32: u32 = 4;
const R_X86_64_32: u32 = 10;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const RELA_SIZE: usize = 24;

/// Section-header string table builder: names are interned, offsets
/// handed back for `sh_name` / `st_name`.
#[derive(Default)]
struct StrTab {
    data: Vec<u8>,
}

impl StrTab {
    fn new() -> StrTab {
        // Index 0 is the empty name.
        StrTab { data: vec![0] }
    }

    fn add(&mut self, name: &str) -> u32 {
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(name.as_bytes());
        self.data.push(0);
        offset
    }
}

struct Shdr {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u64,
    sh_offset: u64,
    sh_size: u64,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u64,
    sh_entsize: u64,
}

fn write_shdr(out: &mut Buffer, shdr: &Shdr) {
    out.write_u32(shdr.sh_name);
    out.write_u32(shdr.sh_type);
    out.write_u64(shdr.sh_flags);
    out.write_u64(0); // sh_addr
    out.write_u64(shdr.sh_offset);
    out.write_u64(shdr.sh_size);
    out.write_u32(shdr.sh_link);
    out.write_u32(shdr.sh_info);
    out.write_u64(shdr.sh_addralign);
    out.write_u64(shdr.sh_entsize);
}

fn elf_sym_info(sym: &SymbolRec) -> u8 {
    let st_type = match sym.section {
        SectionId::Undef => STT_NOTYPE,
        SectionId::Text => {
            if sym.is_func {
                STT_FUNC
            } else {
                STT_NOTYPE
            }
        }
        SectionId::Data | SectionId::Bss => STT_OBJECT,
    };
    let st_bind = if sym.is_local() { STB_LOCAL } else { STB_GLOBAL };
    (st_bind << 4) | st_type
}

impl ObjectWriter {
    fn elf_reloc(&self, kind: FixupKind) -> (u32, i64) {
        match kind {
            FixupKind::Addr64 => (R_X86_64_64, 0),
            FixupKind::Rel32 => (R_X86_64_PC32, -4),
            FixupKind::Plt32 => (R_X86_64_PLT32, -4),
            FixupKind::Abs32 => (R_X86_64_32, 0),
        }
    }

    /// Serialize as an ELF64 relocatable object.
    ///
    /// Layout: file header, `.text`, `.data` (8-byte aligned), `.rela.*`
    /// arrays, the optional custom debug section, `.symtab` with all
    /// locals before all globals, `.strtab`, `.shstrtab`, and the section
    /// header table.
    pub fn write_elf(&self) -> CodegenResult<Vec<u8>> {
        if self.machine != Machine::Amd64 {
            return Err(CodegenError::Internal(
                "ELF output is only produced for x86-64".into(),
            ));
        }

        let has_bss = self.bss_size > 0;
        let has_debug = self.has_debug();
        let debug_payload = if has_debug {
            Some(self.debug_payload())
        } else {
            None
        };

        // Section numbering. The null section is index 0.
        let mut section_num = 1;
        let text_index = section_num;
        section_num += 1;
        let data_index = section_num;
        section_num += 1;
        let bss_index = if has_bss {
            section_num += 1;
            section_num - 1
        } else {
            0
        };
        // .note.GNU-stack and the debug section take the next slots.
        section_num += 1;
        if has_debug {
            section_num += 1;
        }
        let rela_text_index = if !self.text_relocs.is_empty() {
            section_num += 1;
            section_num - 1
        } else {
            0
        };
        let rela_data_index = if !self.data_relocs.is_empty() {
            section_num += 1;
            section_num - 1
        } else {
            0
        };
        let symtab_index = section_num;
        section_num += 1;
        let strtab_index = section_num;
        section_num += 1;
        let shstrtab_index = section_num;
        section_num += 1;

        // Symbol ordering: null, all locals, then all globals. `sh_info`
        // is the index of the first global.
        let mut order = Vec::with_capacity(self.symbols().len());
        for (index, sym) in self.symbols().iter().enumerate() {
            if sym.is_local() {
                order.push(index);
            }
        }
        let first_global = 1 + order.len();
        for (index, sym) in self.symbols().iter().enumerate() {
            if !sym.is_local() {
                order.push(index);
            }
        }
        let mut symtab_slot = vec![0usize; self.symbols().len()];
        for (slot, &index) in order.iter().enumerate() {
            symtab_slot[index] = 1 + slot;
        }

        let mut strtab = StrTab::new();
        let name_offsets: Vec<u32> = self
            .symbols()
            .iter()
            .map(|sym| strtab.add(&sym.name))
            .collect();

        let mut shstrtab = StrTab::new();
        let text_name = shstrtab.add(".text");
        let data_name = shstrtab.add(".data");
        let bss_name = if has_bss { shstrtab.add(".bss") } else { 0 };
        let note_name = shstrtab.add(".note.GNU-stack");
        let debug_name = if has_debug {
            shstrtab.add(".fadors_debug")
        } else {
            0
        };
        let rela_text_name = if rela_text_index != 0 {
            shstrtab.add(".rela.text")
        } else {
            0
        };
        let rela_data_name = if rela_data_index != 0 {
            shstrtab.add(".rela.data")
        } else {
            0
        };
        let symtab_name = shstrtab.add(".symtab");
        let strtab_name = shstrtab.add(".strtab");
        let shstrtab_name = shstrtab.add(".shstrtab");

        // Compute file offsets.
        let mut offset = EHDR_SIZE;
        let text_offset = offset;
        offset += self.text.len();
        offset = align_up(offset, 8);
        let data_offset = offset;
        offset += self.data.len();
        offset = align_up(offset, 8);
        let rela_text_offset = offset;
        offset += self.text_relocs.len() * RELA_SIZE;
        let rela_data_offset = offset;
        offset += self.data_relocs.len() * RELA_SIZE;
        let debug_offset = offset;
        if let Some(payload) = &debug_payload {
            offset += payload.len();
            offset = align_up(offset, 8);
        }
        let symtab_offset = offset;
        let symtab_count = 1 + order.len();
        offset += symtab_count * SYM_SIZE;
        let strtab_offset = offset;
        offset += strtab.data.len();
        let shstrtab_offset = offset;
        offset += shstrtab.data.len();
        offset = align_up(offset, 8);
        let shoff = offset;
        offset += section_num * SHDR_SIZE;

        let mut out = Buffer::with_capacity(offset);

        // ELF header.
        out.write_bytes(&[0x7f, b'E', b'L', b'F']);
        out.write_u8(ELFCLASS64);
        out.write_u8(ELFDATA2LSB);
        out.write_u8(EV_CURRENT);
        out.write_u8(ELFOSABI_NONE);
        out.write_bytes(&[0; 8]); // ABI version + padding
        out.write_u16(ET_REL);
        out.write_u16(EM_X86_64);
        out.write_u32(EV_CURRENT as u32);
        out.write_u64(0); // e_entry
        out.write_u64(0); // e_phoff
        out.write_u64(shoff as u64);
        out.write_u32(0); // e_flags
        out.write_u16(EHDR_SIZE as u16);
        out.write_u16(0); // e_phentsize
        out.write_u16(0); // e_phnum
        out.write_u16(SHDR_SIZE as u16);
        out.write_u16(section_num as u16);
        out.write_u16(shstrtab_index as u16);

        // Section contents.
        debug_assert_eq!(text_offset, out.len());
        out.write_bytes(self.text.as_slice());
        out.align_to(8);
        debug_assert_eq!(data_offset, out.len());
        out.write_bytes(self.data.as_slice());
        out.align_to(8);

        // Relocations, with explicit addends.
        debug_assert_eq!(rela_text_offset, out.len());
        for relocs in [&self.text_relocs, &self.data_relocs] {
            for reloc in relocs.iter() {
                let (r_type, addend) = self.elf_reloc(reloc.kind);
                out.write_u64(reloc.offset);
                out.write_u64(((symtab_slot[reloc.symbol] as u64) << 32) | r_type as u64);
                out.write_u64(addend as u64);
            }
        }

        if let Some(payload) = &debug_payload {
            debug_assert_eq!(debug_offset, out.len());
            out.write_bytes(payload.as_slice());
            out.align_to(8);
        }

        // Symbol table; null entry first.
        debug_assert_eq!(symtab_offset, out.len());
        out.write_bytes(&[0; SYM_SIZE]);
        for &index in &order {
            let sym = &self.symbols()[index];
            out.write_u32(name_offsets[index]);
            out.write_u8(elf_sym_info(sym));
            out.write_u8(0); // st_other
            let shndx = match sym.section {
                SectionId::Undef => 0,
                SectionId::Text => text_index,
                SectionId::Data => data_index,
                SectionId::Bss => bss_index,
            };
            out.write_u16(shndx as u16);
            out.write_u64(sym.value);
            out.write_u64(0); // st_size
        }

        debug_assert_eq!(strtab_offset, out.len());
        out.write_bytes(&strtab.data);
        debug_assert_eq!(shstrtab_offset, out.len());
        out.write_bytes(&shstrtab.data);
        out.align_to(8);

        // Section header table.
        debug_assert_eq!(shoff, out.len());
        out.write_bytes(&[0; SHDR_SIZE]); // null section
        write_shdr(
            &mut out,
            &Shdr {
                sh_name: text_name,
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC | SHF_EXECINSTR,
                sh_offset: text_offset as u64,
                sh_size: self.text.len() as u64,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 16,
                sh_entsize: 0,
            },
        );
        write_shdr(
            &mut out,
            &Shdr {
                sh_name: data_name,
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC | SHF_WRITE,
                sh_offset: data_offset as u64,
                sh_size: self.data.len() as u64,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 8,
                sh_entsize: 0,
            },
        );
        if has_bss {
            write_shdr(
                &mut out,
                &Shdr {
                    sh_name: bss_name,
                    sh_type: SHT_NOBITS,
                    sh_flags: SHF_ALLOC | SHF_WRITE,
                    sh_offset: data_offset as u64 + self.data.len() as u64,
                    sh_size: self.bss_size,
                    sh_link: 0,
                    sh_info: 0,
                    sh_addralign: 8,
                    sh_entsize: 0,
                },
            );
        }
        // Flags of zero request a non-executable stack.
        write_shdr(
            &mut out,
            &Shdr {
                sh_name: note_name,
                sh_type: SHT_PROGBITS,
                sh_flags: 0,
                sh_offset: text_offset as u64 + self.text.len() as u64,
                sh_size: 0,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
            },
        );
        if let Some(payload) = &debug_payload {
            write_shdr(
                &mut out,
                &Shdr {
                    sh_name: debug_name,
                    sh_type: SHT_PROGBITS,
                    sh_flags: 0,
                    sh_offset: debug_offset as u64,
                    sh_size: payload.len() as u64,
                    sh_link: 0,
                    sh_info: 0,
                    sh_addralign: 1,
                    sh_entsize: 0,
                },
            );
        }
        if rela_text_index != 0 {
            write_shdr(
                &mut out,
                &Shdr {
                    sh_name: rela_text_name,
                    sh_type: SHT_RELA,
                    sh_flags: SHF_INFO_LINK,
                    sh_offset: rela_text_offset as u64,
                    sh_size: (self.text_relocs.len() * RELA_SIZE) as u64,
                    sh_link: symtab_index as u32,
                    sh_info: text_index as u32,
                    sh_addralign: 8,
                    sh_entsize: RELA_SIZE as u64,
                },
            );
        }
        if rela_data_index != 0 {
            write_shdr(
                &mut out,
                &Shdr {
                    sh_name: rela_data_name,
                    sh_type: SHT_RELA,
                    sh_flags: SHF_INFO_LINK,
                    sh_offset: rela_data_offset as u64,
                    sh_size: (self.data_relocs.len() * RELA_SIZE) as u64,
                    sh_link: symtab_index as u32,
                    sh_info: data_index as u32,
                    sh_addralign: 8,
                    sh_entsize: RELA_SIZE as u64,
                },
            );
        }
        write_shdr(
            &mut out,
            &Shdr {
                sh_name: symtab_name,
                sh_type: SHT_SYMTAB,
                sh_flags: 0,
                sh_offset: symtab_offset as u64,
                sh_size: (symtab_count * SYM_SIZE) as u64,
                sh_link: strtab_index as u32,
                sh_info: first_global as u32,
                sh_addralign: 8,
                sh_entsize: SYM_SIZE as u64,
            },
        );
        write_shdr(
            &mut out,
            &Shdr {
                sh_name: strtab_name,
                sh_type: SHT_STRTAB,
                sh_flags: 0,
                sh_offset: strtab_offset as u64,
                sh_size: strtab.data.len() as u64,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
            },
        );
        write_shdr(
            &mut out,
            &Shdr {
                sh_name: shstrtab_name,
                sh_type: SHT_STRTAB,
                sh_flags: 0,
                sh_offset: shstrtab_offset as u64,
                sh_size: shstrtab.data.len() as u64,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
            },
        );

        Ok(out.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::{ObjectWriter, Storage};

    fn u16_at(bytes: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
    }

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    fn u64_at(bytes: &[u8], offset: usize) -> u64 {
        u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
    }

    fn build() -> ObjectWriter {
        let mut obj = ObjectWriter::new(Machine::Amd64);
        obj.text.write_bytes(&[0xb8, 42, 0, 0, 0, 0xc3]);
        obj.add_symbol("main", 0, SectionId::Text, true, Storage::External);
        obj.add_symbol("local_helper", 0, SectionId::Text, true, Storage::Static);
        obj
    }

    #[test]
    fn header() {
        let bytes = build().write_elf().unwrap();
        assert_eq!(&bytes[0..4], b"\x7fELF");
        assert_eq!(bytes[4], ELFCLASS64);
        assert_eq!(bytes[5], ELFDATA2LSB);
        assert_eq!(u16_at(&bytes, 16), ET_REL);
        assert_eq!(u16_at(&bytes, 18), EM_X86_64);
        // .text bytes start right after the header.
        assert_eq!(&bytes[64..70], [0xb8, 42, 0, 0, 0, 0xc3]);
    }

    #[test]
    fn locals_precede_globals() {
        let obj = build();
        let bytes = obj.write_elf().unwrap();
        let shoff = u64_at(&bytes, 0x28) as usize;
        let shnum = u16_at(&bytes, 0x3c) as usize;
        // Find the symtab header.
        let mut symtab = None;
        for i in 0..shnum {
            let sh = shoff + i * SHDR_SIZE;
            if u32_at(&bytes, sh + 4) == SHT_SYMTAB {
                symtab = Some(sh);
            }
        }
        let sh = symtab.expect("symtab section");
        let offset = u64_at(&bytes, sh + 24) as usize;
        let size = u64_at(&bytes, sh + 32) as usize;
        let first_global = u32_at(&bytes, sh + 44) as usize;
        let count = size / SYM_SIZE;
        assert_eq!(count, 3); // null + local_helper + main
        assert_eq!(first_global, 2);
        for slot in 1..count {
            let info = bytes[offset + slot * SYM_SIZE + 4];
            let bind = info >> 4;
            if slot < first_global {
                assert_eq!(bind, STB_LOCAL);
            } else {
                assert_eq!(bind, STB_GLOBAL);
            }
        }
    }

    #[test]
    fn rela_lowering() {
        let mut obj = build();
        let callee = obj.symbol_index_for("callee");
        let data_sym = obj.symbol_index_for("table");
        obj.text.write_bytes(&[0xe8, 0, 0, 0, 0]);
        obj.add_reloc(SectionId::Text, 7, callee, FixupKind::Plt32);
        obj.data.write_u64(0);
        obj.add_reloc(SectionId::Data, 0, data_sym, FixupKind::Addr64);
        let bytes = obj.write_elf().unwrap();

        let shoff = u64_at(&bytes, 0x28) as usize;
        let shnum = u16_at(&bytes, 0x3c) as usize;
        let mut relas = Vec::new();
        for i in 0..shnum {
            let sh = shoff + i * SHDR_SIZE;
            if u32_at(&bytes, sh + 4) == SHT_RELA {
                relas.push(u64_at(&bytes, sh + 24) as usize);
            }
        }
        assert_eq!(relas.len(), 2);
        // Calls lower to PLT32 with addend -4.
        let r = relas[0];
        assert_eq!(u64_at(&bytes, r), 7);
        assert_eq!(u64_at(&bytes, r + 8) & 0xffff_ffff, R_X86_64_PLT32 as u64);
        assert_eq!(u64_at(&bytes, r + 16) as i64, -4);
        // Address-taken pointers lower to R_X86_64_64 with addend 0.
        let r = relas[1];
        assert_eq!(u64_at(&bytes, r + 8) & 0xffff_ffff, R_X86_64_64 as u64);
        assert_eq!(u64_at(&bytes, r + 16) as i64, 0);
    }

    #[test]
    fn gnu_stack_note_present() {
        let bytes = build().write_elf().unwrap();
        let shoff = u64_at(&bytes, 0x28) as usize;
        let shstrndx = u16_at(&bytes, 0x3e) as usize;
        let strtab_off = u64_at(&bytes, shoff + shstrndx * SHDR_SIZE + 24) as usize;
        let shnum = u16_at(&bytes, 0x3c) as usize;
        let mut found = false;
        for i in 0..shnum {
            let sh = shoff + i * SHDR_SIZE;
            let name_off = strtab_off + u32_at(&bytes, sh) as usize;
            let name_end = bytes[name_off..].iter().position(|&b| b == 0).unwrap();
            if &bytes[name_off..name_off + name_end] == b".note.GNU-stack" {
                found = true;
                assert_eq!(u64_at(&bytes, sh + 8), 0); // non-executable stack
            }
        }
        assert!(found);
    }
}
