//! COFF (`.obj`) serialization.

use crate::buffer::Buffer;
use crate::error::{CodegenError, CodegenResult};
use crate::target::Machine;

use super::{FixupKind, ObjectWriter, SectionId, Storage};

const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
const IMAGE_SCN_MEM_DISCARDABLE: u32 = 0x0200_0000;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;
const IMAGE_SCN_ALIGN_1BYTES: u32 = 0x0010_0000;
const IMAGE_SCN_ALIGN_8BYTES: u32 = 0x0040_0000;
const IMAGE_SCN_ALIGN_16BYTES: u32 = 0x0050_0000;

const IMAGE_SYM_CLASS_EXTERNAL: u8 = 2;
const IMAGE_SYM_CLASS_STATIC: u8 = 3;
/// Type bits marking a function symbol.
const IMAGE_SYM_DTYPE_FUNCTION: u16 = 0x20;

const IMAGE_REL_AMD64_ADDR64: u16 = 0x0001;
const IMAGE_REL_AMD64_ADDR32: u16 = 0x0002;
const IMAGE_REL_AMD64_REL32: u16 = 0x0004;
const IMAGE_REL_I386_DIR32: u16 = 0x0006;
const IMAGE_REL_I386_REL32: u16 = 0x0014;

const FILE_HEADER_SIZE: usize = 20;
const SECTION_HEADER_SIZE: usize = 40;
const SYMBOL_SIZE: usize = 18;
const RELOC_SIZE: usize = 10;

struct SectionDesc<'a> {
    name: &'a [u8],
    data: &'a [u8],
    reloc_count: usize,
    characteristics: u32,
}

impl ObjectWriter {
    fn coff_reloc_type(&self, kind: FixupKind) -> CodegenResult<u16> {
        Ok(match (self.machine, kind) {
            (Machine::Amd64, FixupKind::Addr64) => IMAGE_REL_AMD64_ADDR64,
            (Machine::Amd64, FixupKind::Abs32) => IMAGE_REL_AMD64_ADDR32,
            (Machine::Amd64, FixupKind::Rel32 | FixupKind::Plt32) => IMAGE_REL_AMD64_REL32,
            (Machine::I386, FixupKind::Abs32) => IMAGE_REL_I386_DIR32,
            (Machine::I386, FixupKind::Rel32 | FixupKind::Plt32) => IMAGE_REL_I386_REL32,
            (Machine::I386, FixupKind::Addr64) => {
                return Err(CodegenError::Internal(
                    "64-bit absolute relocation on a 32-bit target".into(),
                ))
            }
        })
    }

    /// Serialize as a COFF object: file header, section headers, raw
    /// section bytes in declaration order, per-section relocation tables,
    /// then the symbol table and string table.
    pub fn write_coff(&self) -> CodegenResult<Vec<u8>> {
        debug_assert_eq!(self.bss_size, 0, "COFF output keeps zeroed data in .data");

        let debug_payload;
        let mut sections: Vec<SectionDesc<'_>> = vec![
            SectionDesc {
                name: b".text",
                data: self.text.as_slice(),
                reloc_count: self.text_relocs.len(),
                characteristics: IMAGE_SCN_CNT_CODE
                    | IMAGE_SCN_MEM_EXECUTE
                    | IMAGE_SCN_MEM_READ
                    | IMAGE_SCN_ALIGN_16BYTES,
            },
            SectionDesc {
                name: b".data",
                data: self.data.as_slice(),
                reloc_count: self.data_relocs.len(),
                characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA
                    | IMAGE_SCN_MEM_READ
                    | IMAGE_SCN_MEM_WRITE
                    | IMAGE_SCN_ALIGN_8BYTES,
            },
        ];
        if self.has_debug() {
            debug_payload = self.debug_payload();
            sections.push(SectionDesc {
                name: b".debug$S",
                data: debug_payload.as_slice(),
                reloc_count: 0,
                characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA
                    | IMAGE_SCN_MEM_READ
                    | IMAGE_SCN_MEM_DISCARDABLE
                    | IMAGE_SCN_ALIGN_1BYTES,
            });
        }

        // Lay out the file: headers, raw data, relocations, symbols.
        let mut offset = FILE_HEADER_SIZE + sections.len() * SECTION_HEADER_SIZE;
        let mut raw_offsets = Vec::with_capacity(sections.len());
        for section in &sections {
            if section.data.is_empty() {
                raw_offsets.push(0);
            } else {
                raw_offsets.push(offset);
                offset += section.data.len();
            }
        }
        let mut reloc_offsets = Vec::with_capacity(sections.len());
        for section in &sections {
            if section.reloc_count == 0 {
                reloc_offsets.push(0);
            } else {
                reloc_offsets.push(offset);
                offset += section.reloc_count * RELOC_SIZE;
            }
        }
        let symtab_offset = offset;

        // Names longer than 8 bytes go to the string table; the symbol's
        // short-name slot then holds (0, offset).
        let mut strtab: Vec<u8> = Vec::new();
        let mut long_names = Vec::with_capacity(self.symbols().len());
        for sym in self.symbols() {
            if sym.name.len() > 8 {
                long_names.push(Some(4 + strtab.len() as u32));
                strtab.extend_from_slice(sym.name.as_bytes());
                strtab.push(0);
            } else {
                long_names.push(None);
            }
        }

        let mut out = Buffer::with_capacity(
            symtab_offset + self.symbols().len() * SYMBOL_SIZE + 4 + strtab.len(),
        );

        // File header.
        out.write_u16(self.machine.coff_machine());
        out.write_u16(sections.len() as u16);
        out.write_u32(0); // timestamp
        out.write_u32(symtab_offset as u32);
        out.write_u32(self.symbols().len() as u32);
        out.write_u16(0); // optional header size
        out.write_u16(0); // characteristics

        // Section headers.
        for (index, section) in sections.iter().enumerate() {
            let mut name = [0u8; 8];
            name[..section.name.len()].copy_from_slice(section.name);
            out.write_bytes(&name);
            out.write_u32(0); // virtual size
            out.write_u32(0); // virtual address
            out.write_u32(section.data.len() as u32);
            out.write_u32(raw_offsets[index] as u32);
            out.write_u32(reloc_offsets[index] as u32);
            out.write_u32(0); // line numbers
            out.write_u16(section.reloc_count as u16);
            out.write_u16(0);
            out.write_u32(section.characteristics);
        }

        // Raw section bytes.
        for (index, section) in sections.iter().enumerate() {
            if !section.data.is_empty() {
                debug_assert_eq!(raw_offsets[index], out.len());
                out.write_bytes(section.data);
            }
        }

        // Relocation tables.
        for (index, relocs) in [&self.text_relocs, &self.data_relocs]
            .into_iter()
            .enumerate()
        {
            if !relocs.is_empty() {
                debug_assert_eq!(reloc_offsets[index], out.len());
                for reloc in relocs.iter() {
                    out.write_u32(reloc.offset as u32);
                    out.write_u32(reloc.symbol as u32);
                    out.write_u16(self.coff_reloc_type(reloc.kind)?);
                }
            }
        }

        // Symbol table.
        debug_assert_eq!(symtab_offset, out.len());
        for (index, sym) in self.symbols().iter().enumerate() {
            match long_names[index] {
                Some(str_offset) => {
                    out.write_u32(0);
                    out.write_u32(str_offset);
                }
                None => {
                    let mut name = [0u8; 8];
                    name[..sym.name.len()].copy_from_slice(sym.name.as_bytes());
                    out.write_bytes(&name);
                }
            }
            out.write_u32(sym.value as u32);
            let section_number: i16 = match sym.section {
                SectionId::Undef => 0,
                SectionId::Text => 1,
                SectionId::Data | SectionId::Bss => 2,
            };
            out.write_u16(section_number as u16);
            out.write_u16(if sym.is_func {
                IMAGE_SYM_DTYPE_FUNCTION
            } else {
                0
            });
            out.write_u8(match sym.storage {
                Storage::External => IMAGE_SYM_CLASS_EXTERNAL,
                Storage::Static => IMAGE_SYM_CLASS_STATIC,
            });
            out.write_u8(0); // aux symbols
        }

        // String table: u32 size (self-inclusive) then packed names.
        out.write_u32(4 + strtab.len() as u32);
        out.write_bytes(&strtab);

        Ok(out.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::ObjectWriter;

    fn u16_at(bytes: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
    }

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn header_and_sections() {
        let mut obj = ObjectWriter::new(Machine::Amd64);
        obj.text.write_bytes(&[0xc3]);
        obj.data.write_u32(42);
        obj.add_symbol("main", 0, SectionId::Text, true, Storage::External);
        let bytes = obj.write_coff().unwrap();

        assert_eq!(u16_at(&bytes, 0), 0x8664);
        assert_eq!(u16_at(&bytes, 2), 2); // .text, .data
        assert_eq!(u32_at(&bytes, 12), 1); // one symbol

        // First section header is .text with the code characteristics.
        assert_eq!(&bytes[20..25], b".text");
        let characteristics = u32_at(&bytes, 20 + 36);
        assert_eq!(
            characteristics,
            IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ | IMAGE_SCN_ALIGN_16BYTES
        );
        // Raw data follows immediately after the two section headers.
        let text_ptr = u32_at(&bytes, 20 + 20) as usize;
        assert_eq!(text_ptr, 20 + 2 * 40);
        assert_eq!(bytes[text_ptr], 0xc3);
    }

    #[test]
    fn long_names_go_to_string_table() {
        let mut obj = ObjectWriter::new(Machine::Amd64);
        obj.text.write_bytes(&[0xc3]);
        obj.add_symbol(
            "a_rather_long_symbol_name",
            0,
            SectionId::Text,
            true,
            Storage::External,
        );
        let bytes = obj.write_coff().unwrap();
        let symtab = u32_at(&bytes, 8) as usize;
        // Zeroes marker plus a string-table offset of 4.
        assert_eq!(u32_at(&bytes, symtab), 0);
        assert_eq!(u32_at(&bytes, symtab + 4), 4);
        let strtab = symtab + SYMBOL_SIZE;
        assert_eq!(
            u32_at(&bytes, strtab),
            4 + "a_rather_long_symbol_name".len() as u32 + 1
        );
        assert_eq!(
            &bytes[strtab + 4..strtab + 4 + 25],
            b"a_rather_long_symbol_name"
        );
    }

    #[test]
    fn reloc_types() {
        let mut obj = ObjectWriter::new(Machine::Amd64);
        assert_eq!(
            obj.coff_reloc_type(FixupKind::Rel32).unwrap(),
            IMAGE_REL_AMD64_REL32
        );
        assert_eq!(
            obj.coff_reloc_type(FixupKind::Plt32).unwrap(),
            IMAGE_REL_AMD64_REL32
        );
        assert_eq!(
            obj.coff_reloc_type(FixupKind::Addr64).unwrap(),
            IMAGE_REL_AMD64_ADDR64
        );
        obj.machine = Machine::I386;
        assert_eq!(
            obj.coff_reloc_type(FixupKind::Abs32).unwrap(),
            IMAGE_REL_I386_DIR32
        );
        assert!(obj.coff_reloc_type(FixupKind::Addr64).is_err());
    }
}
