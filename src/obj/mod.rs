//! Relocatable-object accumulation and serialization.
//!
//! An [`ObjectWriter`] collects text bytes, data bytes, symbols,
//! relocations, and optional debug records for one compilation unit, then
//! serializes to COFF ([`ObjectWriter::write_coff`]) or ELF
//! ([`ObjectWriter::write_elf`]).

use indexmap::IndexMap;

use crate::buffer::Buffer;
use crate::target::Machine;

mod coff;
mod elf;

/// Section a symbol or relocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionId {
    Undef,
    Text,
    Data,
    Bss,
}

/// Symbol storage class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    External,
    Static,
}

/// How the linker must patch a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// Absolute 64-bit address (`ADDR64` / `R_X86_64_64`).
    Addr64,
    /// PC-relative 32-bit data reference (`REL32` / `R_X86_64_PC32`).
    Rel32,
    /// PC-relative 32-bit branch or call target (`R_X86_64_PLT32` on ELF).
    Plt32,
    /// Absolute 32-bit address (32-bit targets and data pointers).
    Abs32,
}

/// One symbol record.
#[derive(Debug, Clone)]
pub struct SymbolRec {
    pub name: String,
    /// Section-relative byte offset.
    pub value: u64,
    pub section: SectionId,
    pub is_func: bool,
    pub storage: Storage,
}

impl SymbolRec {
    pub fn is_local(&self) -> bool {
        self.storage == Storage::Static
    }
}

/// One relocation record. `offset` points at the placeholder bytes, not at
/// the start of the instruction.
#[derive(Debug, Clone, Copy)]
pub struct Reloc {
    pub offset: u64,
    pub symbol: usize,
    pub kind: FixupKind,
}

/// A recorded source-line event.
#[derive(Debug, Clone, Copy)]
pub struct DebugLine {
    pub offset: u32,
    pub line: u32,
    pub is_stmt: bool,
    pub end_seq: bool,
}

/// A local variable or parameter, recorded for debug output.
#[derive(Debug, Clone)]
pub struct DebugVar {
    pub name: String,
    pub frame_offset: i32,
    pub is_param: bool,
    pub type_kind: u8,
    pub size: u32,
    pub type_name: Option<String>,
}

/// A function's variable scope, bracketed by entry/exit text offsets.
#[derive(Debug, Clone)]
pub struct DebugFunc {
    pub name: String,
    pub entry: u32,
    pub exit: u32,
    pub ret_kind: u8,
    pub ret_size: u32,
    pub vars: Vec<DebugVar>,
}

/// Accumulates one compilation unit's sections, symbols, relocations, and
/// debug records. State persists for the whole unit and is consumed by the
/// final serializer.
#[derive(Debug)]
pub struct ObjectWriter {
    pub machine: Machine,
    pub text: Buffer,
    pub data: Buffer,
    pub bss_size: u64,
    symbols: Vec<SymbolRec>,
    by_name: IndexMap<String, usize>,
    pub text_relocs: Vec<Reloc>,
    pub data_relocs: Vec<Reloc>,
    pub source_file: String,
    pub comp_dir: String,
    pub debug_lines: Vec<DebugLine>,
    pub debug_funcs: Vec<DebugFunc>,
}

impl ObjectWriter {
    pub fn new(machine: Machine) -> Self {
        ObjectWriter {
            machine,
            text: Buffer::new(),
            data: Buffer::new(),
            bss_size: 0,
            symbols: Vec::new(),
            by_name: IndexMap::new(),
            text_relocs: Vec::new(),
            data_relocs: Vec::new(),
            source_file: String::new(),
            comp_dir: String::new(),
            debug_lines: Vec::new(),
            debug_funcs: Vec::new(),
        }
    }

    pub fn symbols(&self) -> &[SymbolRec] {
        &self.symbols
    }

    /// Append a symbol record, deduplicating by name.
    ///
    /// A definition arriving for a name first seen as an undefined
    /// reference upgrades the existing record in place, so references
    /// interned by the encoder and the later definition share one index.
    pub fn add_symbol(
        &mut self,
        name: &str,
        value: u64,
        section: SectionId,
        is_func: bool,
        storage: Storage,
    ) -> usize {
        if let Some(&index) = self.by_name.get(name) {
            let sym = &mut self.symbols[index];
            if section != SectionId::Undef {
                sym.value = value;
                sym.section = section;
                sym.is_func = is_func;
                sym.storage = storage;
            }
            return index;
        }
        let index = self.symbols.len();
        self.symbols.push(SymbolRec {
            name: name.to_string(),
            value,
            section,
            is_func,
            storage,
        });
        self.by_name.insert(name.to_string(), index);
        index
    }

    /// Linear lookup by name.
    pub fn find_symbol(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Return the index for `name`, interning it as an undefined external
    /// symbol if it is not known yet.
    pub fn symbol_index_for(&mut self, name: &str) -> usize {
        match self.by_name.get(name) {
            Some(&index) => index,
            None => self.add_symbol(name, 0, SectionId::Undef, false, Storage::External),
        }
    }

    /// Define `name` at the current end of `section`.
    pub fn define_label(&mut self, name: &str, section: SectionId, storage: Storage) -> usize {
        let value = match section {
            SectionId::Text => self.text.len() as u64,
            SectionId::Data => self.data.len() as u64,
            SectionId::Bss => self.bss_size,
            SectionId::Undef => 0,
        };
        self.add_symbol(name, value, section, section == SectionId::Text, storage)
    }

    /// Append a relocation to `section`'s list.
    pub fn add_reloc(&mut self, section: SectionId, offset: u64, symbol: usize, kind: FixupKind) {
        let section_len = match section {
            SectionId::Text => self.text.len() as u64,
            SectionId::Data => self.data.len() as u64,
            _ => 0,
        };
        debug_assert!(offset < section_len, "relocation past end of section");
        let reloc = Reloc {
            offset,
            symbol,
            kind,
        };
        match section {
            SectionId::Text => self.text_relocs.push(reloc),
            SectionId::Data => self.data_relocs.push(reloc),
            _ => {}
        }
    }

    /// Record a source-line event, coalescing consecutive duplicates of
    /// the same line.
    pub fn add_debug_line(&mut self, offset: u32, line: u32, is_stmt: bool) {
        if let Some(last) = self.debug_lines.last() {
            if last.line == line && !last.end_seq {
                return;
            }
        }
        self.debug_lines.push(DebugLine {
            offset,
            line,
            is_stmt,
            end_seq: false,
        });
    }

    /// Mark the end of the line sequence for the current function.
    pub fn end_debug_sequence(&mut self, offset: u32) {
        self.debug_lines.push(DebugLine {
            offset,
            line: 0,
            is_stmt: false,
            end_seq: true,
        });
    }

    /// Open a function's debug-variable scope.
    pub fn begin_debug_func(&mut self, name: &str, entry: u32, ret_kind: u8, ret_size: u32) {
        self.debug_funcs.push(DebugFunc {
            name: name.to_string(),
            entry,
            exit: entry,
            ret_kind,
            ret_size,
            vars: Vec::new(),
        });
    }

    /// Close the most recently opened function scope.
    pub fn end_debug_func(&mut self, exit: u32) {
        if let Some(f) = self.debug_funcs.last_mut() {
            f.exit = exit;
        }
    }

    /// Record a local or parameter in the current function scope.
    pub fn add_debug_var(
        &mut self,
        name: &str,
        frame_offset: i32,
        is_param: bool,
        type_kind: u8,
        size: u32,
        type_name: Option<&str>,
    ) {
        if let Some(f) = self.debug_funcs.last_mut() {
            f.vars.push(DebugVar {
                name: name.to_string(),
                frame_offset,
                is_param,
                type_kind,
                size,
                type_name: type_name.map(str::to_string),
            });
        }
    }

    fn has_debug(&self) -> bool {
        !self.debug_lines.is_empty() || !self.debug_funcs.is_empty()
    }

    /// Serialize the custom debug payload: source name, compilation
    /// directory, then the line entries, then the per-function variable
    /// scopes.
    fn debug_payload(&self) -> Buffer {
        let mut buf = Buffer::new();
        buf.write_u32(self.source_file.len() as u32);
        buf.write_bytes(self.source_file.as_bytes());
        buf.write_u32(self.comp_dir.len() as u32);
        buf.write_bytes(self.comp_dir.as_bytes());
        buf.write_u32(self.debug_lines.len() as u32);
        for entry in &self.debug_lines {
            buf.write_u32(entry.offset);
            buf.write_u32(entry.line);
            let mut flags = 0u8;
            if entry.is_stmt {
                flags |= 1;
            }
            if entry.end_seq {
                flags |= 2;
            }
            buf.write_u8(flags);
        }
        buf.write_u32(self.debug_funcs.len() as u32);
        for func in &self.debug_funcs {
            buf.write_u32(func.name.len() as u32);
            buf.write_bytes(func.name.as_bytes());
            buf.write_u32(func.entry);
            buf.write_u32(func.exit);
            buf.write_u8(func.ret_kind);
            buf.write_u32(func.ret_size);
            buf.write_u32(func.vars.len() as u32);
            for var in &func.vars {
                buf.write_u32(var.name.len() as u32);
                buf.write_bytes(var.name.as_bytes());
                buf.write_u32(var.frame_offset as u32);
                buf.write_u8(var.is_param as u8);
                buf.write_u8(var.type_kind);
                buf.write_u32(var.size);
                let type_name = var.type_name.as_deref().unwrap_or("");
                buf.write_u32(type_name.len() as u32);
                buf.write_bytes(type_name.as_bytes());
            }
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_dedup_upgrades_undefined() {
        let mut obj = ObjectWriter::new(Machine::Amd64);
        let a = obj.symbol_index_for("memcpy");
        assert_eq!(obj.symbols()[a].section, SectionId::Undef);
        let b = obj.add_symbol("memcpy", 0x40, SectionId::Text, true, Storage::External);
        assert_eq!(a, b);
        assert_eq!(obj.symbols()[a].section, SectionId::Text);
        assert_eq!(obj.symbols()[a].value, 0x40);
        assert_eq!(obj.symbols().len(), 1);
    }

    #[test]
    fn duplicate_definition_is_not_doubled() {
        let mut obj = ObjectWriter::new(Machine::Amd64);
        let a = obj.add_symbol("g", 0, SectionId::Data, false, Storage::External);
        let b = obj.add_symbol("g", 0, SectionId::Data, false, Storage::External);
        assert_eq!(a, b);
        assert_eq!(obj.symbols().len(), 1);
    }

    #[test]
    fn line_coalescing() {
        let mut obj = ObjectWriter::new(Machine::Amd64);
        obj.add_debug_line(0, 10, true);
        obj.add_debug_line(4, 10, true);
        obj.add_debug_line(8, 11, true);
        assert_eq!(obj.debug_lines.len(), 2);
    }
}
