//! Textual-assembly parser.
//!
//! Reads a restricted dialect (AT&T by default, Intel operand order after
//! a `.intel_syntax noprefix` directive) and drives the instruction
//! encoder directly, producing an object file.

use std::path::Path;

use memchr::memchr;

use crate::encoder::{Bits, Encoder, Inst, Op, Operand, Reg};
use crate::error::{CodegenError, CodegenResult};
use crate::obj::{ObjectWriter, SectionId, Storage};
use crate::target::Target;

struct Assembler {
    obj: ObjectWriter,
    enc: Encoder,
    intel: bool,
    section: SectionId,
    in_block_comment: bool,
}

impl Assembler {
    fn new(target: Target) -> Self {
        let bits = if target.is_64() { Bits::B64 } else { Bits::B32 };
        Assembler {
            obj: ObjectWriter::new(target.machine()),
            enc: Encoder::new(bits),
            intel: false,
            section: SectionId::Text,
            in_block_comment: false,
        }
    }

    /// Strip `//` and `/* */` comments from one line, tracking block
    /// comments across lines.
    fn strip_comments(&mut self, line: &str) -> String {
        let bytes = line.as_bytes();
        let mut out = String::new();
        let mut i = 0;
        while i < bytes.len() {
            if self.in_block_comment {
                let mut j = i;
                loop {
                    match memchr(b'*', &bytes[j..]) {
                        Some(pos) => {
                            let at = j + pos;
                            if bytes.get(at + 1) == Some(&b'/') {
                                self.in_block_comment = false;
                                i = at + 2;
                                break;
                            }
                            j = at + 1;
                        }
                        None => return out,
                    }
                }
            } else {
                match memchr(b'/', &bytes[i..]) {
                    None => {
                        out.push_str(&line[i..]);
                        return out;
                    }
                    Some(pos) => {
                        out.push_str(&line[i..i + pos]);
                        let at = i + pos;
                        if bytes.get(at + 1) == Some(&b'/') {
                            return out;
                        } else if bytes.get(at + 1) == Some(&b'*') {
                            self.in_block_comment = true;
                            i = at + 2;
                        } else {
                            out.push('/');
                            i = at + 1;
                        }
                    }
                }
            }
        }
        out
    }

    fn parse_line(&mut self, raw: &str, line_no: u32) -> CodegenResult<()> {
        let stripped = self.strip_comments(raw);
        let starts_at_column_zero = !stripped.starts_with(|c: char| c == ' ' || c == '\t');
        let text = stripped.trim();
        if text.is_empty() {
            return Ok(());
        }

        // Label definitions at column 0.
        if starts_at_column_zero && text.ends_with(':') {
            let name = &text[..text.len() - 1];
            self.obj.define_label(name, self.section, Storage::External);
            return Ok(());
        }

        if let Some(rest) = text.strip_prefix('.') {
            return self.parse_directive(rest, line_no);
        }
        self.parse_instruction(text, line_no)
    }

    fn parse_directive(&mut self, text: &str, line_no: u32) -> CodegenResult<()> {
        let mut parts = text.split_whitespace();
        let name = parts.next().unwrap_or("");
        match name {
            "global" | "globl" => {
                if let Some(symbol) = parts.next() {
                    self.obj.symbol_index_for(symbol);
                }
                Ok(())
            }
            "code16" => {
                self.enc.bits = Bits::B16;
                Ok(())
            }
            "intel_syntax" => {
                self.intel = true;
                Ok(())
            }
            "section" => {
                match parts.next() {
                    Some(".data") => self.section = SectionId::Data,
                    Some(".text") | None => self.section = SectionId::Text,
                    Some(other) => {
                        return Err(CodegenError::AsmParse {
                            what: format!("unknown section `{}`", other),
                            line: line_no,
                        })
                    }
                }
                Ok(())
            }
            "byte" | "word" | "long" => {
                let rest: String = parts.collect::<Vec<_>>().join(" ");
                for field in rest.split(',') {
                    let value = parse_int(field.trim()).ok_or_else(|| CodegenError::AsmParse {
                        what: format!("bad data value `{}`", field.trim()),
                        line: line_no,
                    })?;
                    let buf = match self.section {
                        SectionId::Data => &mut self.obj.data,
                        _ => &mut self.obj.text,
                    };
                    match name {
                        "byte" => buf.write_u8(value as u8),
                        "word" => buf.write_u16(value as u16),
                        _ => buf.write_u32(value as u32),
                    }
                }
                Ok(())
            }
            _ => Err(CodegenError::AsmParse {
                what: format!("unknown directive `.{}`", name),
                line: line_no,
            }),
        }
    }

    fn parse_instruction(&mut self, text: &str, line_no: u32) -> CodegenResult<()> {
        let (mnemonic, rest) = match text.find(char::is_whitespace) {
            Some(pos) => (&text[..pos], text[pos..].trim()),
            None => (text, ""),
        };
        let (op, size) = Op::parse(mnemonic).ok_or_else(|| CodegenError::AsmParse {
            what: format!("unknown mnemonic `{}`", mnemonic),
            line: line_no,
        })?;

        let mut operands = Vec::new();
        if !rest.is_empty() {
            for field in rest.split(',') {
                operands.push(self.parse_operand(field.trim(), line_no)?);
            }
        }
        // Intel order puts the destination first; the encoder wants AT&T.
        if self.intel {
            operands.reverse();
        }

        let mut inst = Inst {
            op,
            size: None,
            operands: operands.into_iter().collect(),
        };
        if let Some(size) = size {
            inst = inst.with_size(size);
        }
        self.enc.encode(&inst, &mut self.obj)
    }

    fn parse_operand(&mut self, text: &str, line_no: u32) -> CodegenResult<Operand> {
        // [reg] / [reg+disp] / [reg-disp]
        if let Some(inner) = text.strip_prefix('[') {
            let inner = inner.strip_suffix(']').ok_or_else(|| CodegenError::AsmParse {
                what: format!("unterminated memory operand `{}`", text),
                line: line_no,
            })?;
            let (reg_text, disp) = match inner.find(&['+', '-'][..]) {
                Some(pos) => {
                    let disp = parse_int(inner[pos..].trim_start_matches('+')).ok_or_else(|| {
                        CodegenError::AsmParse {
                            what: format!("bad displacement in `{}`", text),
                            line: line_no,
                        }
                    })?;
                    (&inner[..pos], disp)
                }
                None => (inner, 0),
            };
            let base = Reg::parse(reg_text.trim()).ok_or_else(|| CodegenError::AsmParse {
                what: format!("unknown base register `{}`", reg_text.trim()),
                line: line_no,
            })?;
            return Ok(Operand::Mem {
                base,
                disp: disp as i32,
            });
        }
        // Immediates: decimal, hex, octal, or a character literal.
        let imm_text = text.strip_prefix('$').unwrap_or(text);
        if let Some(value) = parse_int(imm_text) {
            return Ok(Operand::Imm(value));
        }
        // Registers from the fixed alias tables.
        let reg_text = text.strip_prefix('%').unwrap_or(text);
        if let Some(reg) = Reg::parse(reg_text) {
            return Ok(Operand::Reg(reg));
        }
        // Everything else is a label reference.
        Ok(Operand::Label(text.to_string()))
    }
}

/// Parse an integer literal: decimal, `0x` hex, leading-zero octal, or a
/// `'c'` character literal. A leading `-` negates.
fn parse_int(text: &str) -> Option<i64> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if body.is_empty() {
        return None;
    }
    let value = if let Some(ch) = body.strip_prefix('\'') {
        let mut chars = ch.strip_suffix('\'')?.chars();
        let c = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        c as i64
    } else if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if body.len() > 1 && body.starts_with('0') {
        i64::from_str_radix(&body[1..], 8).ok()?
    } else {
        body.parse::<i64>().ok()?
    };
    Some(if negative { -value } else { value })
}

/// Assemble a source string for `target`, returning the serialized
/// object bytes.
pub fn assemble_source(source: &str, target: Target) -> CodegenResult<Vec<u8>> {
    let mut asm = Assembler::new(target);
    for (index, line) in source.lines().enumerate() {
        asm.parse_line(line, index as u32 + 1)?;
    }
    if target.is_elf() {
        asm.obj.write_elf()
    } else {
        asm.obj.write_coff()
    }
}

/// Assemble `input` into an object file at `output`. A missing input file
/// surfaces as the I/O error variant.
pub fn assemble_file(input: &Path, output: &Path, target: Target) -> CodegenResult<()> {
    let source = std::fs::read_to_string(input)?;
    let bytes = assemble_source(&source, target)?;
    std::fs::write(output, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_int_forms() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("-7"), Some(-7));
        assert_eq!(parse_int("0x1f"), Some(31));
        assert_eq!(parse_int("017"), Some(15));
        assert_eq!(parse_int("'A'"), Some(65));
        assert_eq!(parse_int("0"), Some(0));
        assert_eq!(parse_int("banana"), None);
    }

    #[test]
    fn att_instruction_bytes() {
        let src = "\
main:
    mov $5, %eax
    ret
";
        let bytes = assemble_source(src, Target::LinuxX64).unwrap();
        // ELF: text starts right after the 64-byte header.
        assert_eq!(&bytes[64..70], [0xb8, 5, 0, 0, 0, 0xc3]);
    }

    #[test]
    fn intel_order_is_reversed() {
        let src = "\
.intel_syntax noprefix
main:
    mov eax, 5
    add eax, 3
    ret
";
        let bytes = assemble_source(src, Target::LinuxX64).unwrap();
        assert_eq!(
            &bytes[64..72],
            [0xb8, 5, 0, 0, 0, 0x83, 0xc0, 0x03]
        );
    }

    #[test]
    fn comments_and_data() {
        let src = "\
/* block
   comment */
start: // line comment
    .section .data
    .byte 1, 2, 'A'
    .word 0x1234
    .long 7
";
        let mut asm = Assembler::new(Target::LinuxX64);
        for (i, line) in src.lines().enumerate() {
            asm.parse_line(line, i as u32 + 1).unwrap();
        }
        assert_eq!(
            asm.obj.data.as_slice(),
            [1, 2, 65, 0x34, 0x12, 7, 0, 0, 0]
        );
        let sym = asm.obj.find_symbol("start").unwrap();
        assert_eq!(asm.obj.symbols()[sym].storage, Storage::External);
    }

    #[test]
    fn memory_operands() {
        let src = "    mov [rbp-8], %eax\n";
        // AT&T order: src first. mov -8(%rbp) -> eax
        let bytes = assemble_source(src, Target::LinuxX64).unwrap();
        assert_eq!(&bytes[64..67], [0x8b, 0x45, 0xf8]);
    }

    #[test]
    fn missing_input_file_is_an_error() {
        let err = assemble_file(
            Path::new("/nonexistent/input.s"),
            Path::new("/tmp/out.o"),
            Target::LinuxX64,
        );
        assert!(matches!(err, Err(CodegenError::Io(_))));
    }
}
