//! x86 / x86-64 instruction encoder.
//!
//! Translates `(mnemonic, operand-tuple)` descriptions into machine bytes,
//! appending to the object writer's text section and recording symbol
//! relocations for label operands. Relocation offsets point at the four
//! displacement placeholder bytes, not at the instruction start.

pub mod insn;
pub mod reg;

pub use insn::{Cond, Inst, Op, Operand};
pub use reg::regs;
pub use reg::{Reg, RegClass, Size};

use crate::error::{CodegenError, CodegenResult};
use crate::obj::{FixupKind, ObjectWriter, SectionId};

/// Encoder mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bits {
    B16,
    B32,
    B64,
}

/// Stateless except for the current bitness, which the caller sets from
/// the target (or a `.code16` directive).
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    pub bits: Bits,
}

impl Encoder {
    pub fn new(bits: Bits) -> Self {
        Encoder { bits }
    }

    /// Encode one instruction into `obj`'s text section.
    pub fn encode(&self, inst: &Inst, obj: &mut ObjectWriter) -> CodegenResult<()> {
        log::trace!("encode {}", inst);
        let mut e = Emitter {
            obj,
            bits: self.bits,
        };
        e.inst(inst)
    }
}

struct Emitter<'a> {
    obj: &'a mut ObjectWriter,
    bits: Bits,
}

impl<'a> Emitter<'a> {
    #[inline]
    fn put8(&mut self, b: u8) {
        self.obj.text.write_u8(b);
    }

    #[inline]
    fn put32(&mut self, v: u32) {
        self.obj.text.write_u32(v);
    }

    /// Write a 4-byte placeholder and record a relocation pointing at it.
    fn reloc32(&mut self, name: &str, kind: FixupKind) {
        let sym = self.obj.symbol_index_for(name);
        let offset = self.obj.text.len() as u64;
        self.obj.text.write_u32(0);
        self.obj.add_reloc(SectionId::Text, offset, sym, kind);
    }

    fn unsupported(&self, inst: &Inst) -> CodegenError {
        CodegenError::Encode(inst.to_string())
    }

    /// Operand width: explicit suffix first, then a general-purpose
    /// register operand (destination preferred), then the mode default.
    fn operand_size(&self, inst: &Inst) -> Size {
        if let Some(size) = inst.size {
            return size;
        }
        for operand in inst.operands.iter().rev() {
            if let Operand::Reg(r) = operand {
                if r.is_gp() {
                    return r.size;
                }
            }
        }
        match self.bits {
            Bits::B64 => Size::Qword,
            Bits::B32 => Size::Dword,
            Bits::B16 => Size::Word,
        }
    }

    /// Legacy operand-size prefix: 0x66 selects the non-default width.
    fn opsize_prefix(&mut self, size: Size) {
        let needs_66 = match self.bits {
            Bits::B16 => size == Size::Dword,
            _ => size == Size::Word,
        };
        if needs_66 {
            self.put8(0x66);
        }
    }

    /// Address-size prefix for 32-bit addressing under `.code16`.
    fn addrsize_prefix(&mut self, rm: &Operand) {
        if self.bits == Bits::B16 && rm.is_mem() {
            self.put8(0x67);
        }
    }

    /// Emit a REX prefix if required; collapse the empty 0x40 byte unless
    /// a byte register demands it. Errors on REX-incompatible shapes.
    fn rex(
        &mut self,
        wide: bool,
        reg: Option<Reg>,
        rm: &Operand,
        size: Size,
    ) -> CodegenResult<()> {
        let mut r = false;
        let mut x = false;
        let mut b = false;
        let mut force = false;
        let mut high = false;
        if let Some(reg) = reg {
            r = reg.needs_ext();
            force |= size == Size::Byte && reg.byte_needs_rex();
            high |= reg.high;
        }
        match rm {
            Operand::Reg(rr) => {
                b = rr.needs_ext();
                force |= size == Size::Byte && rr.byte_needs_rex();
                high |= rr.high;
            }
            Operand::Mem { base, .. } => {
                b = base.needs_ext();
            }
            Operand::Sib { base, index, .. } => {
                b = base.needs_ext();
                x = index.needs_ext();
            }
            _ => {}
        }
        let needed = wide || r || x || b || force;
        if !needed {
            return Ok(());
        }
        if self.bits != Bits::B64 {
            return Err(CodegenError::Encode(
                "64-bit operand or extended register outside 64-bit mode".into(),
            ));
        }
        if high {
            return Err(CodegenError::Encode(
                "high byte register cannot be combined with a REX prefix".into(),
            ));
        }
        let byte = 0x40
            | (wide as u8) << 3
            | (r as u8) << 2
            | (x as u8) << 1
            | b as u8;
        self.put8(byte);
        Ok(())
    }

    /// ModR/M (+ SIB, displacement, relocation) for `rm` with `reg_enc`
    /// in the register field.
    fn modrm_rm(&mut self, reg_enc: u8, rm: &Operand, label_kind: FixupKind) -> CodegenResult<()> {
        let reg_enc = reg_enc & 7;
        match rm {
            Operand::Reg(r) => {
                self.put8(0xc0 | reg_enc << 3 | (r.enc() & 7));
            }
            Operand::Mem { base, disp } => {
                let base_enc = base.enc() & 7;
                let (modbits, disp8) = disp_mode(*disp, base_enc);
                if base_enc == 4 {
                    // rSP/r12 base always takes a SIB byte.
                    self.put8(modbits << 6 | reg_enc << 3 | 4);
                    self.put8(0x20 | 4); // scale=1, index=none, base=rsp
                } else {
                    self.put8(modbits << 6 | reg_enc << 3 | base_enc);
                }
                match modbits {
                    0 => {}
                    1 => self.put8(disp8 as u8),
                    _ => self.put32(*disp as u32),
                }
            }
            Operand::Sib {
                base,
                index,
                scale,
                disp,
            } => {
                if index.enc() == 4 {
                    return Err(CodegenError::Encode("rsp cannot be an index register".into()));
                }
                let scale_bits = match scale {
                    1 => 0u8,
                    2 => 1,
                    4 => 2,
                    8 => 3,
                    _ => {
                        return Err(CodegenError::Encode(format!(
                            "invalid SIB scale {}",
                            scale
                        )))
                    }
                };
                let base_enc = base.enc() & 7;
                let (modbits, disp8) = disp_mode(*disp, base_enc);
                self.put8(modbits << 6 | reg_enc << 3 | 4);
                self.put8(scale_bits << 6 | (index.enc() & 7) << 3 | base_enc);
                match modbits {
                    0 => {}
                    1 => self.put8(disp8 as u8),
                    _ => self.put32(*disp as u32),
                }
            }
            Operand::Label(name) => {
                // mod=00 rm=101: RIP-relative in 64-bit mode, absolute
                // disp32 otherwise.
                self.put8(reg_enc << 3 | 5);
                let kind = if self.bits == Bits::B64 {
                    label_kind
                } else {
                    FixupKind::Abs32
                };
                self.reloc32(name, kind);
            }
            Operand::Imm(_) => {
                return Err(CodegenError::Encode(
                    "immediate cannot be a memory/register operand".into(),
                ))
            }
        }
        Ok(())
    }

    /// Prefixes + escape + opcode + ModR/M for a classic two-operand form.
    fn gp_op(
        &mut self,
        size: Size,
        opcode: u8,
        reg: Option<Reg>,
        reg_enc: u8,
        rm: &Operand,
    ) -> CodegenResult<()> {
        self.addrsize_prefix(rm);
        self.opsize_prefix(size);
        self.rex(size == Size::Qword, reg, rm, size)?;
        self.put8(opcode);
        self.modrm_rm(reg_enc, rm, FixupKind::Rel32)
    }

    fn imm_for(&mut self, size: Size, value: i64) {
        match size {
            Size::Byte => self.put8(value as u8),
            Size::Word => self.obj.text.write_u16(value as u16),
            _ => self.put32(value as u32),
        }
    }

    fn inst(&mut self, inst: &Inst) -> CodegenResult<()> {
        use Operand as O;
        let ops = &inst.operands;
        match inst.op {
            Op::Add => self.alu(inst, 0x01, 0x03, 0),
            Op::Or => self.alu(inst, 0x09, 0x0b, 1),
            Op::And => self.alu(inst, 0x21, 0x23, 4),
            Op::Sub => self.alu(inst, 0x29, 0x2b, 5),
            Op::Xor => self.alu(inst, 0x31, 0x33, 6),
            Op::Cmp => self.alu(inst, 0x39, 0x3b, 7),

            Op::Test => {
                let size = self.operand_size(inst);
                let byte = size == Size::Byte;
                match (ops.first(), ops.get(1)) {
                    (Some(O::Imm(v)), Some(dst)) => {
                        let opc = if byte { 0xf6 } else { 0xf7 };
                        self.gp_op(size, opc, None, 0, dst)?;
                        self.imm_for(if byte { Size::Byte } else { size.min(Size::Dword) }, *v);
                        Ok(())
                    }
                    (Some(O::Reg(r)), Some(dst)) => {
                        self.gp_op(size, if byte { 0x84 } else { 0x85 }, Some(*r), r.enc(), dst)
                    }
                    (Some(src), Some(O::Reg(r))) if src.is_mem() => {
                        self.gp_op(size, if byte { 0x84 } else { 0x85 }, Some(*r), r.enc(), src)
                    }
                    _ => Err(self.unsupported(inst)),
                }
            }

            Op::Mov => self.mov(inst),

            Op::Lea => match (ops.first(), ops.get(1)) {
                (Some(src), Some(O::Reg(dst))) if src.is_mem() && dst.is_gp() => {
                    self.gp_op(dst.size, 0x8d, Some(*dst), dst.enc(), src)
                }
                _ => Err(self.unsupported(inst)),
            },

            Op::Movzx(from) | Op::Movsx(from) => {
                let dst = match ops.get(1) {
                    Some(O::Reg(r)) if r.is_gp() => *r,
                    _ => return Err(self.unsupported(inst)),
                };
                let src = ops.first().ok_or_else(|| self.unsupported(inst))?;
                let dst_size = inst.size.unwrap_or(dst.size);
                let sign = matches!(inst.op, Op::Movsx(_));
                let opcode: &[u8] = match (sign, from) {
                    (false, Size::Byte) => &[0x0f, 0xb6],
                    (false, Size::Word) => &[0x0f, 0xb7],
                    (true, Size::Byte) => &[0x0f, 0xbe],
                    (true, Size::Word) => &[0x0f, 0xbf],
                    (true, Size::Dword) => &[0x63], // movsxd
                    _ => return Err(self.unsupported(inst)),
                };
                self.addrsize_prefix(src);
                self.opsize_prefix(dst_size);
                // The byte-register REX rule applies to the narrow source.
                self.rex(dst_size == Size::Qword, Some(dst), src, from)?;
                for &b in opcode {
                    self.put8(b);
                }
                self.modrm_rm(dst.enc(), src, FixupKind::Rel32)
            }

            Op::Imul => match (ops.first(), ops.get(1), ops.get(2)) {
                (Some(src), Some(O::Reg(dst)), None) if !matches!(src, O::Imm(_)) => {
                    let size = self.operand_size(inst);
                    self.addrsize_prefix(src);
                    self.opsize_prefix(size);
                    self.rex(size == Size::Qword, Some(*dst), src, size)?;
                    self.put8(0x0f);
                    self.put8(0xaf);
                    self.modrm_rm(dst.enc(), src, FixupKind::Rel32)
                }
                (Some(O::Imm(v)), Some(O::Reg(dst)), None) => {
                    self.imul_imm(inst, *v, &O::Reg(*dst), *dst)
                }
                (Some(O::Imm(v)), Some(src), Some(O::Reg(dst))) => {
                    self.imul_imm(inst, *v, src, *dst)
                }
                _ => Err(self.unsupported(inst)),
            },

            Op::Shl => self.shift(inst, 4),
            Op::Shr => self.shift(inst, 5),
            Op::Sar => self.shift(inst, 7),

            Op::Neg => self.unary_rm(inst, 0xf7, 0xf6, 3),
            Op::Not => self.unary_rm(inst, 0xf7, 0xf6, 2),
            Op::Idiv => self.unary_rm(inst, 0xf7, 0xf6, 7),
            Op::Inc => self.unary_rm(inst, 0xff, 0xfe, 0),
            Op::Dec => self.unary_rm(inst, 0xff, 0xfe, 1),

            Op::Push => match ops.first() {
                Some(O::Reg(r)) if r.is_gp() => {
                    if self.bits == Bits::B16 && r.size == Size::Dword {
                        self.put8(0x66);
                    }
                    // Default operand size is 64-bit here; no REX.W.
                    self.rex(false, None, &O::Reg(*r), Size::Dword)?;
                    self.put8(0x50 + (r.enc() & 7));
                    Ok(())
                }
                Some(O::Imm(v)) => {
                    if fits_i8(*v) {
                        self.put8(0x6a);
                        self.put8(*v as u8);
                    } else {
                        self.put8(0x68);
                        self.put32(*v as u32);
                    }
                    Ok(())
                }
                Some(m) if m.is_mem() => {
                    self.addrsize_prefix(m);
                    self.rex(false, None, m, Size::Dword)?;
                    self.put8(0xff);
                    self.modrm_rm(6, m, FixupKind::Rel32)
                }
                _ => Err(self.unsupported(inst)),
            },

            Op::Pop => match ops.first() {
                Some(O::Reg(r)) if r.is_gp() => {
                    if self.bits == Bits::B16 && r.size == Size::Dword {
                        self.put8(0x66);
                    }
                    self.rex(false, None, &O::Reg(*r), Size::Dword)?;
                    self.put8(0x58 + (r.enc() & 7));
                    Ok(())
                }
                Some(m) if m.is_mem() => {
                    self.addrsize_prefix(m);
                    self.rex(false, None, m, Size::Dword)?;
                    self.put8(0x8f);
                    self.modrm_rm(0, m, FixupKind::Rel32)
                }
                _ => Err(self.unsupported(inst)),
            },

            Op::Call => match ops.first() {
                Some(O::Label(name)) => {
                    self.put8(0xe8);
                    let name = name.clone();
                    self.reloc32(&name, FixupKind::Plt32);
                    Ok(())
                }
                Some(rm @ (O::Reg(_) | O::Mem { .. } | O::Sib { .. })) => {
                    self.addrsize_prefix(rm);
                    self.rex(false, None, rm, Size::Dword)?;
                    self.put8(0xff);
                    self.modrm_rm(2, rm, FixupKind::Rel32)
                }
                _ => Err(self.unsupported(inst)),
            },

            Op::Jmp => match ops.first() {
                Some(O::Label(name)) => {
                    self.put8(0xe9);
                    let name = name.clone();
                    self.reloc32(&name, FixupKind::Plt32);
                    Ok(())
                }
                Some(rm @ (O::Reg(_) | O::Mem { .. } | O::Sib { .. })) => {
                    self.addrsize_prefix(rm);
                    self.rex(false, None, rm, Size::Dword)?;
                    self.put8(0xff);
                    self.modrm_rm(4, rm, FixupKind::Rel32)
                }
                _ => Err(self.unsupported(inst)),
            },

            Op::Jcc(cc) => match ops.first() {
                Some(O::Label(name)) => {
                    self.put8(0x0f);
                    self.put8(0x80 + cc.code());
                    let name = name.clone();
                    self.reloc32(&name, FixupKind::Plt32);
                    Ok(())
                }
                _ => Err(self.unsupported(inst)),
            },

            Op::Setcc(cc) => match ops.first() {
                Some(rm) => {
                    self.rex(false, None, rm, Size::Byte)?;
                    self.put8(0x0f);
                    self.put8(0x90 + cc.code());
                    self.modrm_rm(0, rm, FixupKind::Rel32)
                }
                None => Err(self.unsupported(inst)),
            },

            Op::Cmovcc(cc) => match (ops.first(), ops.get(1)) {
                (Some(src), Some(O::Reg(dst))) if dst.is_gp() => {
                    let size = self.operand_size(inst);
                    self.addrsize_prefix(src);
                    self.opsize_prefix(size);
                    self.rex(size == Size::Qword, Some(*dst), src, size)?;
                    self.put8(0x0f);
                    self.put8(0x40 + cc.code());
                    self.modrm_rm(dst.enc(), src, FixupKind::Rel32)
                }
                _ => Err(self.unsupported(inst)),
            },

            Op::Ret => {
                self.put8(0xc3);
                Ok(())
            }
            Op::Leave => {
                self.put8(0xc9);
                Ok(())
            }
            Op::Cdq => {
                self.put8(0x99);
                Ok(())
            }
            Op::Cqo => {
                self.put8(0x48);
                self.put8(0x99);
                Ok(())
            }
            Op::Ud2 => {
                self.put8(0x0f);
                self.put8(0x0b);
                Ok(())
            }

            Op::Movss => self.sse_mov(inst, Some(0xf3), 0x10, 0x11),
            Op::Movsd => self.sse_mov(inst, Some(0xf2), 0x10, 0x11),
            Op::Movups => self.sse_mov(inst, None, 0x10, 0x11),
            Op::Movdqu => self.sse_mov(inst, Some(0xf3), 0x6f, 0x7f),

            Op::Addss => self.sse_rm(inst, Some(0xf3), 0x58),
            Op::Addsd => self.sse_rm(inst, Some(0xf2), 0x58),
            Op::Subss => self.sse_rm(inst, Some(0xf3), 0x5c),
            Op::Subsd => self.sse_rm(inst, Some(0xf2), 0x5c),
            Op::Mulss => self.sse_rm(inst, Some(0xf3), 0x59),
            Op::Mulsd => self.sse_rm(inst, Some(0xf2), 0x59),
            Op::Divss => self.sse_rm(inst, Some(0xf3), 0x5e),
            Op::Divsd => self.sse_rm(inst, Some(0xf2), 0x5e),
            Op::Ucomiss => self.sse_rm(inst, None, 0x2e),
            Op::Ucomisd => self.sse_rm(inst, Some(0x66), 0x2e),
            Op::Cvtss2sd => self.sse_rm(inst, Some(0xf3), 0x5a),
            Op::Cvtsd2ss => self.sse_rm(inst, Some(0xf2), 0x5a),
            Op::Addps => self.sse_rm(inst, None, 0x58),
            Op::Subps => self.sse_rm(inst, None, 0x5c),
            Op::Mulps => self.sse_rm(inst, None, 0x59),
            Op::Divps => self.sse_rm(inst, None, 0x5e),
            Op::Paddd => self.sse_rm(inst, Some(0x66), 0xfe),
            Op::Psubd => self.sse_rm(inst, Some(0x66), 0xfa),
            Op::Pxor => self.sse_rm(inst, Some(0x66), 0xef),
            Op::Movhlps => self.sse_rm(inst, None, 0x12),

            Op::Cvtsi2ss | Op::Cvtsi2sd => {
                let prefix = if inst.op == Op::Cvtsi2ss { 0xf3 } else { 0xf2 };
                let dst = match ops.get(1) {
                    Some(O::Reg(r)) if r.class == RegClass::Xmm => *r,
                    _ => return Err(self.unsupported(inst)),
                };
                let src = ops.first().ok_or_else(|| self.unsupported(inst))?;
                let wide = match src {
                    O::Reg(r) => r.size == Size::Qword,
                    _ => inst.size == Some(Size::Qword),
                };
                self.addrsize_prefix(src);
                self.put8(prefix);
                self.rex(wide, Some(dst), src, Size::Dword)?;
                self.put8(0x0f);
                self.put8(0x2a);
                self.modrm_rm(dst.enc(), src, FixupKind::Rel32)
            }

            Op::Cvttss2si | Op::Cvttsd2si => {
                let prefix = if inst.op == Op::Cvttss2si { 0xf3 } else { 0xf2 };
                let dst = match ops.get(1) {
                    Some(O::Reg(r)) if r.is_gp() => *r,
                    _ => return Err(self.unsupported(inst)),
                };
                let src = ops.first().ok_or_else(|| self.unsupported(inst))?;
                self.addrsize_prefix(src);
                self.put8(prefix);
                self.rex(dst.size == Size::Qword, Some(dst), src, Size::Dword)?;
                self.put8(0x0f);
                self.put8(0x2c);
                self.modrm_rm(dst.enc(), src, FixupKind::Rel32)
            }

            Op::Pshufd => match (ops.first(), ops.get(1), ops.get(2)) {
                (Some(O::Imm(order)), Some(src), Some(O::Reg(dst)))
                    if dst.class == RegClass::Xmm =>
                {
                    let order = *order;
                    self.sse_reg_rm(Some(0x66), 0x70, *dst, src)?;
                    self.put8(order as u8);
                    Ok(())
                }
                _ => Err(self.unsupported(inst)),
            },

            Op::Vmovups => self.vex_mov(inst, 0, 0x10, 0x11),
            Op::Vmovdqu => self.vex_mov(inst, 2, 0x6f, 0x7f),
            Op::Vaddps => self.vex_rrm(inst, 0, 1, 0x58),
            Op::Vsubps => self.vex_rrm(inst, 0, 1, 0x5c),
            Op::Vmulps => self.vex_rrm(inst, 0, 1, 0x59),
            Op::Vdivps => self.vex_rrm(inst, 0, 1, 0x5e),
            Op::Vpaddd => self.vex_rrm(inst, 1, 1, 0xfe),
            Op::Vpsubd => self.vex_rrm(inst, 1, 1, 0xfa),
            Op::Vpxor => self.vex_rrm(inst, 1, 1, 0xef),

            Op::Vextracti128 => match (ops.first(), ops.get(1), ops.get(2)) {
                (Some(O::Imm(sel)), Some(O::Reg(src)), Some(dst))
                    if src.class == RegClass::Ymm =>
                {
                    let sel = *sel;
                    self.vex(1, 3, false, true, *src, None, dst)?;
                    self.put8(0x39);
                    self.modrm_rm(src.enc(), dst, FixupKind::Rel32)?;
                    self.put8(sel as u8);
                    Ok(())
                }
                _ => Err(self.unsupported(inst)),
            },

            Op::Vinserti128 => {
                match (ops.first(), ops.get(1), ops.get(2), ops.get(3)) {
                    (Some(O::Imm(sel)), Some(src2), Some(O::Reg(src1)), Some(O::Reg(dst)))
                        if dst.class == RegClass::Ymm =>
                    {
                        let sel = *sel;
                        let src1 = *src1;
                        let dst = *dst;
                        self.vex(1, 3, false, true, dst, Some(src1), src2)?;
                        self.put8(0x38);
                        self.modrm_rm(dst.enc(), src2, FixupKind::Rel32)?;
                        self.put8(sel as u8);
                        Ok(())
                    }
                    _ => Err(self.unsupported(inst)),
                }
            }

            Op::Vzeroupper => {
                self.put8(0xc5);
                self.put8(0xf8);
                self.put8(0x77);
                Ok(())
            }
        }
    }

    /// The classic ALU family: reg-reg, reg-mem, mem-reg, imm forms.
    fn alu(&mut self, inst: &Inst, mr: u8, rm: u8, ext: u8) -> CodegenResult<()> {
        use Operand as O;
        let ops = &inst.operands;
        let size = self.operand_size(inst);
        let byte = size == Size::Byte;
        match (ops.first(), ops.get(1)) {
            (Some(O::Imm(v)), Some(dst)) => {
                let v = *v;
                if byte {
                    self.gp_op(size, 0x80, None, ext, dst)?;
                    self.put8(v as u8);
                } else if fits_i8(v) {
                    self.gp_op(size, 0x83, None, ext, dst)?;
                    self.put8(v as u8);
                } else {
                    self.gp_op(size, 0x81, None, ext, dst)?;
                    self.imm_for(size.min(Size::Dword), v);
                }
                Ok(())
            }
            (Some(O::Reg(src)), Some(dst)) => {
                self.gp_op(size, if byte { mr - 1 } else { mr }, Some(*src), src.enc(), dst)
            }
            (Some(src), Some(O::Reg(dst))) if src.is_mem() => {
                self.gp_op(size, if byte { rm - 1 } else { rm }, Some(*dst), dst.enc(), src)
            }
            _ => Err(self.unsupported(inst)),
        }
    }

    fn mov(&mut self, inst: &Inst) -> CodegenResult<()> {
        use Operand as O;
        let ops = &inst.operands;
        let size = self.operand_size(inst);
        let byte = size == Size::Byte;
        match (ops.first(), ops.get(1)) {
            (Some(O::Imm(v)), Some(O::Reg(dst))) if dst.is_gp() => {
                let v = *v;
                let dst = *dst;
                if size == Size::Qword && !fits_i32(v) {
                    // 10-byte movabs.
                    self.rex(true, None, &O::Reg(dst), Size::Dword)?;
                    self.put8(0xb8 + (dst.enc() & 7));
                    self.obj.text.write_u64(v as u64);
                } else if size == Size::Qword {
                    self.rex(true, None, &O::Reg(dst), Size::Dword)?;
                    self.put8(0xc7);
                    self.put8(0xc0 | (dst.enc() & 7));
                    self.put32(v as u32);
                } else if byte {
                    self.rex(false, None, &O::Reg(dst), size)?;
                    self.put8(0xb0 + (dst.enc() & 7));
                    self.put8(v as u8);
                } else {
                    self.opsize_prefix(size);
                    self.rex(false, None, &O::Reg(dst), size)?;
                    self.put8(0xb8 + (dst.enc() & 7));
                    self.imm_for(size, v);
                }
                Ok(())
            }
            (Some(O::Imm(v)), Some(dst)) if dst.is_mem() => {
                let v = *v;
                self.gp_op(size, if byte { 0xc6 } else { 0xc7 }, None, 0, dst)?;
                self.imm_for(if byte { Size::Byte } else { size.min(Size::Dword) }, v);
                Ok(())
            }
            (Some(O::Reg(src)), Some(dst)) => {
                self.gp_op(size, if byte { 0x88 } else { 0x89 }, Some(*src), src.enc(), dst)
            }
            (Some(src), Some(O::Reg(dst))) if src.is_mem() => {
                self.gp_op(size, if byte { 0x8a } else { 0x8b }, Some(*dst), dst.enc(), src)
            }
            _ => Err(self.unsupported(inst)),
        }
    }

    fn imul_imm(
        &mut self,
        inst: &Inst,
        value: i64,
        src: &Operand,
        dst: Reg,
    ) -> CodegenResult<()> {
        let size = self.operand_size(inst);
        if size == Size::Byte {
            return Err(self.unsupported(inst));
        }
        let opc = if fits_i8(value) { 0x6b } else { 0x69 };
        self.gp_op(size, opc, Some(dst), dst.enc(), src)?;
        if fits_i8(value) {
            self.put8(value as u8);
        } else {
            self.imm_for(size.min(Size::Dword), value);
        }
        Ok(())
    }

    fn shift(&mut self, inst: &Inst, ext: u8) -> CodegenResult<()> {
        use Operand as O;
        let ops = &inst.operands;
        let size = self.operand_size(inst);
        let byte = size == Size::Byte;
        match (ops.first(), ops.get(1)) {
            (Some(O::Imm(v)), Some(dst)) => {
                let v = *v;
                self.gp_op(size, if byte { 0xc0 } else { 0xc1 }, None, ext, dst)?;
                self.put8(v as u8);
                Ok(())
            }
            (Some(O::Reg(cl)), Some(dst)) if cl.id == 1 && cl.size == Size::Byte => {
                self.gp_op(size, if byte { 0xd2 } else { 0xd3 }, None, ext, dst)
            }
            _ => Err(self.unsupported(inst)),
        }
    }

    fn unary_rm(&mut self, inst: &Inst, opc: u8, opc8: u8, ext: u8) -> CodegenResult<()> {
        let rm = inst
            .operands
            .first()
            .ok_or_else(|| self.unsupported(inst))?;
        if matches!(rm, Operand::Imm(_)) {
            return Err(self.unsupported(inst));
        }
        let size = self.operand_size(inst);
        let byte = size == Size::Byte;
        self.gp_op(size, if byte { opc8 } else { opc }, None, ext, rm)
    }

    /// Scalar/packed SSE move with separate load and store opcodes.
    fn sse_mov(
        &mut self,
        inst: &Inst,
        prefix: Option<u8>,
        load: u8,
        store: u8,
    ) -> CodegenResult<()> {
        use Operand as O;
        let ops = &inst.operands;
        match (ops.first(), ops.get(1)) {
            (Some(src), Some(O::Reg(dst))) if dst.class == RegClass::Xmm => {
                self.sse_reg_rm(prefix, load, *dst, src)
            }
            (Some(O::Reg(src)), Some(dst)) if src.class == RegClass::Xmm && dst.is_mem() => {
                self.sse_reg_rm(prefix, store, *src, dst)
            }
            _ => Err(self.unsupported(inst)),
        }
    }

    /// SSE op with xmm destination in the reg field.
    fn sse_rm(&mut self, inst: &Inst, prefix: Option<u8>, opcode: u8) -> CodegenResult<()> {
        use Operand as O;
        let ops = &inst.operands;
        match (ops.first(), ops.get(1)) {
            (Some(src), Some(O::Reg(dst))) if dst.class == RegClass::Xmm => {
                self.sse_reg_rm(prefix, opcode, *dst, src)
            }
            _ => Err(self.unsupported(inst)),
        }
    }

    fn sse_reg_rm(
        &mut self,
        prefix: Option<u8>,
        opcode: u8,
        reg: Reg,
        rm: &Operand,
    ) -> CodegenResult<()> {
        self.addrsize_prefix(rm);
        if let Some(p) = prefix {
            self.put8(p);
        }
        self.rex(false, Some(reg), rm, Size::Dword)?;
        self.put8(0x0f);
        self.put8(opcode);
        self.modrm_rm(reg.enc(), rm, FixupKind::Rel32)
    }

    /// AVX move (2-operand, vvvv unused).
    fn vex_mov(&mut self, inst: &Inst, pp: u8, load: u8, store: u8) -> CodegenResult<()> {
        use Operand as O;
        let ops = &inst.operands;
        match (ops.first(), ops.get(1)) {
            (Some(src), Some(O::Reg(dst)))
                if matches!(dst.class, RegClass::Xmm | RegClass::Ymm) =>
            {
                let dst = *dst;
                self.vex(pp, 1, false, dst.class == RegClass::Ymm, dst, None, src)?;
                self.put8(load);
                self.modrm_rm(dst.enc(), src, FixupKind::Rel32)
            }
            (Some(O::Reg(src)), Some(dst))
                if matches!(src.class, RegClass::Xmm | RegClass::Ymm) && dst.is_mem() =>
            {
                let src = *src;
                self.vex(pp, 1, false, src.class == RegClass::Ymm, src, None, dst)?;
                self.put8(store);
                self.modrm_rm(src.enc(), dst, FixupKind::Rel32)
            }
            _ => Err(self.unsupported(inst)),
        }
    }

    /// Three-operand AVX: AT&T (src2, src1, dst) -> reg=dst, vvvv=src1,
    /// rm=src2.
    fn vex_rrm(&mut self, inst: &Inst, pp: u8, map: u8, opcode: u8) -> CodegenResult<()> {
        use Operand as O;
        let ops = &inst.operands;
        match (ops.first(), ops.get(1), ops.get(2)) {
            (Some(src2), Some(O::Reg(src1)), Some(O::Reg(dst))) => {
                let src1 = *src1;
                let dst = *dst;
                self.vex(pp, map, false, dst.class == RegClass::Ymm, dst, Some(src1), src2)?;
                self.put8(opcode);
                self.modrm_rm(dst.enc(), src2, FixupKind::Rel32)
            }
            _ => Err(self.unsupported(inst)),
        }
    }

    /// Emit a VEX prefix, choosing the 2-byte form when legal.
    fn vex(
        &mut self,
        pp: u8,
        map: u8,
        w: bool,
        l256: bool,
        reg: Reg,
        vvvv: Option<Reg>,
        rm: &Operand,
    ) -> CodegenResult<()> {
        if self.bits != Bits::B64 {
            return Err(CodegenError::Encode("AVX outside 64-bit mode".into()));
        }
        let r = reg.needs_ext();
        let (x, b) = match rm {
            Operand::Reg(rr) => (false, rr.needs_ext()),
            Operand::Mem { base, .. } => (false, base.needs_ext()),
            Operand::Sib { base, index, .. } => (index.needs_ext(), base.needs_ext()),
            _ => (false, false),
        };
        let v = vvvv.map_or(0, |r| r.id) & 0xf;
        let l = l256 as u8;
        if map == 1 && !w && !x && !b {
            self.put8(0xc5);
            self.put8(((!r as u8) << 7) | ((!v & 0xf) << 3) | (l << 2) | pp);
        } else {
            self.put8(0xc4);
            self.put8(((!r as u8) << 7) | ((!x as u8) << 6) | ((!b as u8) << 5) | map);
            self.put8(((w as u8) << 7) | ((!v & 0xf) << 3) | (l << 2) | pp);
        }
        Ok(())
    }
}

/// (mod bits, disp8) selection for a memory operand.
fn disp_mode(disp: i32, base_enc: u8) -> (u8, i8) {
    if disp == 0 && base_enc != 5 {
        (0, 0)
    } else if (-128..=127).contains(&disp) {
        (1, disp as i8)
    } else {
        (2, 0)
    }
}

fn fits_i8(v: i64) -> bool {
    (-128..=127).contains(&v)
}

fn fits_i32(v: i64) -> bool {
    v >= i32::MIN as i64 && v <= i32::MAX as i64
}

#[cfg(test)]
mod tests {
    use super::regs::*;
    use super::*;
    use crate::target::Machine;

    fn enc64(inst: Inst) -> Vec<u8> {
        let mut obj = ObjectWriter::new(Machine::Amd64);
        Encoder::new(Bits::B64).encode(&inst, &mut obj).unwrap();
        obj.text.as_slice().to_vec()
    }

    fn enc32(inst: Inst) -> Vec<u8> {
        let mut obj = ObjectWriter::new(Machine::I386);
        Encoder::new(Bits::B32).encode(&inst, &mut obj).unwrap();
        obj.text.as_slice().to_vec()
    }

    #[test]
    fn mov_imm_reg() {
        assert_eq!(
            enc64(Inst::new2(Op::Mov, Operand::Imm(5), Operand::Reg(EAX))),
            [0xb8, 5, 0, 0, 0]
        );
        assert_eq!(
            enc64(Inst::new2(Op::Mov, Operand::Imm(5), Operand::Reg(RAX))),
            [0x48, 0xc7, 0xc0, 5, 0, 0, 0]
        );
        // movabs for immediates that do not fit i32.
        assert_eq!(
            enc64(Inst::new2(
                Op::Mov,
                Operand::Imm(0x1_2345_6789),
                Operand::Reg(RAX)
            )),
            [0x48, 0xb8, 0x89, 0x67, 0x45, 0x23, 0x01, 0, 0, 0]
        );
    }

    #[test]
    fn mov_reg_reg() {
        // AT&T: mov %rax, %rbx
        assert_eq!(
            enc64(Inst::new2(Op::Mov, Operand::Reg(RAX), Operand::Reg(RBX))),
            [0x48, 0x89, 0xc3]
        );
        assert_eq!(
            enc64(Inst::new2(Op::Mov, Operand::Reg(EAX), Operand::Reg(ECX))),
            [0x89, 0xc1]
        );
        assert_eq!(
            enc64(Inst::new2(Op::Mov, Operand::Reg(R8), Operand::Reg(RAX))),
            [0x4c, 0x89, 0xc0]
        );
    }

    #[test]
    fn mov_mem() {
        // mov -8(%rbp), %eax
        assert_eq!(
            enc64(Inst::new2(Op::Mov, Operand::mem(RBP, -8), Operand::Reg(EAX))),
            [0x8b, 0x45, 0xf8]
        );
        // mov (%rsp), %rax needs a SIB byte.
        assert_eq!(
            enc64(Inst::new2(Op::Mov, Operand::mem(RSP, 0), Operand::Reg(RAX))),
            [0x48, 0x8b, 0x04, 0x24]
        );
        // (%rbp) with zero displacement takes a disp8 of zero.
        assert_eq!(
            enc64(Inst::new2(Op::Mov, Operand::mem(RBP, 0), Operand::Reg(RAX))),
            [0x48, 0x8b, 0x45, 0x00]
        );
        // (%r13) behaves like (%rbp).
        assert_eq!(
            enc64(Inst::new2(Op::Mov, Operand::mem(R13, 0), Operand::Reg(RAX))),
            [0x49, 0x8b, 0x45, 0x00]
        );
        // Large displacement switches to disp32.
        assert_eq!(
            enc64(Inst::new2(
                Op::Mov,
                Operand::mem(RBP, -0x180),
                Operand::Reg(EAX)
            )),
            [0x8b, 0x85, 0x80, 0xfe, 0xff, 0xff]
        );
    }

    #[test]
    fn sib_addressing() {
        // mov (%rsi,%rcx,4), %eax
        assert_eq!(
            enc64(Inst::new2(
                Op::Mov,
                Operand::Sib {
                    base: RSI,
                    index: RCX,
                    scale: 4,
                    disp: 0
                },
                Operand::Reg(EAX)
            )),
            [0x8b, 0x04, 0x8e]
        );
        // lea (%rax,%rax,2), %rax
        assert_eq!(
            enc64(Inst::new2(
                Op::Lea,
                Operand::Sib {
                    base: RAX,
                    index: RAX,
                    scale: 2,
                    disp: 0
                },
                Operand::Reg(RAX)
            )),
            [0x48, 0x8d, 0x04, 0x40]
        );
    }

    #[test]
    fn alu_forms() {
        // add $1, %rax (imm8 form)
        assert_eq!(
            enc64(Inst::new2(Op::Add, Operand::Imm(1), Operand::Reg(RAX))),
            [0x48, 0x83, 0xc0, 0x01]
        );
        // add $1000, %eax (imm32 form)
        assert_eq!(
            enc64(Inst::new2(Op::Add, Operand::Imm(1000), Operand::Reg(EAX))),
            [0x81, 0xc0, 0xe8, 0x03, 0, 0]
        );
        // sub %rcx, %rax
        assert_eq!(
            enc64(Inst::new2(Op::Sub, Operand::Reg(RCX), Operand::Reg(RAX))),
            [0x48, 0x29, 0xc8]
        );
        // xor %eax, %eax
        assert_eq!(
            enc64(Inst::new2(Op::Xor, Operand::Reg(EAX), Operand::Reg(EAX))),
            [0x31, 0xc0]
        );
        // cmp $0x100, %rax
        assert_eq!(
            enc64(Inst::new2(Op::Cmp, Operand::Imm(0x100), Operand::Reg(RAX))),
            [0x48, 0x81, 0xf8, 0, 1, 0, 0]
        );
        // test %rax, %rax
        assert_eq!(
            enc64(Inst::new2(Op::Test, Operand::Reg(RAX), Operand::Reg(RAX))),
            [0x48, 0x85, 0xc0]
        );
    }

    #[test]
    fn shifts_and_unary() {
        assert_eq!(
            enc64(Inst::new2(Op::Shl, Operand::Imm(3), Operand::Reg(RAX))),
            [0x48, 0xc1, 0xe0, 0x03]
        );
        assert_eq!(
            enc64(Inst::new2(Op::Sar, Operand::Reg(CL), Operand::Reg(RAX))),
            [0x48, 0xd3, 0xf8]
        );
        assert_eq!(
            enc64(Inst::new1(Op::Neg, Operand::Reg(RAX))),
            [0x48, 0xf7, 0xd8]
        );
        assert_eq!(
            enc64(Inst::new1(Op::Idiv, Operand::Reg(RCX))),
            [0x48, 0xf7, 0xf9]
        );
    }

    #[test]
    fn push_pop() {
        assert_eq!(enc64(Inst::new1(Op::Push, Operand::Reg(RAX))), [0x50]);
        assert_eq!(enc64(Inst::new1(Op::Push, Operand::Reg(R12))), [0x41, 0x54]);
        assert_eq!(enc64(Inst::new1(Op::Pop, Operand::Reg(RCX))), [0x59]);
    }

    #[test]
    fn movzx_movsx() {
        // movzbl -1(%rbp), %eax
        assert_eq!(
            enc64(
                Inst::new2(
                    Op::Movzx(Size::Byte),
                    Operand::mem(RBP, -1),
                    Operand::Reg(EAX)
                )
            ),
            [0x0f, 0xb6, 0x45, 0xff]
        );
        // movsbq %al, %rax
        assert_eq!(
            enc64(
                Inst::new2(Op::Movsx(Size::Byte), Operand::Reg(AL), Operand::Reg(RAX))
                    .with_size(Size::Qword)
            ),
            [0x48, 0x0f, 0xbe, 0xc0]
        );
        // movzbl %sil requires an empty REX.
        assert_eq!(
            enc64(Inst::new2(
                Op::Movzx(Size::Byte),
                Operand::Reg(Reg::gp(6, Size::Byte)),
                Operand::Reg(EAX)
            )),
            [0x40, 0x0f, 0xb6, 0xc6]
        );
    }

    #[test]
    fn branches_record_relocations() {
        let mut obj = ObjectWriter::new(Machine::Amd64);
        let enc = Encoder::new(Bits::B64);
        enc.encode(
            &Inst::new1(Op::Call, Operand::label("memcpy")),
            &mut obj,
        )
        .unwrap();
        assert_eq!(obj.text.as_slice(), [0xe8, 0, 0, 0, 0]);
        assert_eq!(obj.text_relocs.len(), 1);
        // The fixup points at the displacement bytes, one past the opcode.
        assert_eq!(obj.text_relocs[0].offset, 1);
        assert_eq!(obj.text_relocs[0].kind, FixupKind::Plt32);
        assert_eq!(obj.symbols()[obj.text_relocs[0].symbol].name, "memcpy");

        enc.encode(
            &Inst::new1(Op::Jcc(Cond::Ne), Operand::label(".L0")),
            &mut obj,
        )
        .unwrap();
        assert_eq!(&obj.text.as_slice()[5..], [0x0f, 0x85, 0, 0, 0, 0]);
        assert_eq!(obj.text_relocs[1].offset, 5 + 2);
    }

    #[test]
    fn rip_relative_lea() {
        let mut obj = ObjectWriter::new(Machine::Amd64);
        Encoder::new(Bits::B64)
            .encode(
                &Inst::new2(Op::Lea, Operand::label(".LC0"), Operand::Reg(RAX)),
                &mut obj,
            )
            .unwrap();
        assert_eq!(obj.text.as_slice(), [0x48, 0x8d, 0x05, 0, 0, 0, 0]);
        assert_eq!(obj.text_relocs[0].offset, 3);
        assert_eq!(obj.text_relocs[0].kind, FixupKind::Rel32);
    }

    #[test]
    fn sse_scalar() {
        // movss 8(%rsp), %xmm0
        assert_eq!(
            enc64(Inst::new2(Op::Movss, Operand::mem(RSP, 8), Operand::Reg(XMM0))),
            [0xf3, 0x0f, 0x10, 0x44, 0x24, 0x08]
        );
        // movsd %xmm0, (%rsp)
        assert_eq!(
            enc64(Inst::new2(Op::Movsd, Operand::Reg(XMM0), Operand::mem(RSP, 0))),
            [0xf2, 0x0f, 0x11, 0x04, 0x24]
        );
        // addsd %xmm1, %xmm0
        assert_eq!(
            enc64(Inst::new2(Op::Addsd, Operand::Reg(XMM1), Operand::Reg(XMM0))),
            [0xf2, 0x0f, 0x58, 0xc1]
        );
        // cvtsi2sd %rax, %xmm0
        assert_eq!(
            enc64(Inst::new2(Op::Cvtsi2sd, Operand::Reg(RAX), Operand::Reg(XMM0))),
            [0xf2, 0x48, 0x0f, 0x2a, 0xc0]
        );
        // cvttsd2si %xmm0, %rax
        assert_eq!(
            enc64(Inst::new2(Op::Cvttsd2si, Operand::Reg(XMM0), Operand::Reg(RAX))),
            [0xf2, 0x48, 0x0f, 0x2c, 0xc0]
        );
        // ucomisd %xmm1, %xmm0
        assert_eq!(
            enc64(Inst::new2(Op::Ucomisd, Operand::Reg(XMM1), Operand::Reg(XMM0))),
            [0x66, 0x0f, 0x2e, 0xc1]
        );
    }

    #[test]
    fn sse_packed() {
        // paddd %xmm1, %xmm0
        assert_eq!(
            enc64(Inst::new2(Op::Paddd, Operand::Reg(XMM1), Operand::Reg(XMM0))),
            [0x66, 0x0f, 0xfe, 0xc1]
        );
        // pxor %xmm0, %xmm0
        assert_eq!(
            enc64(Inst::new2(Op::Pxor, Operand::Reg(XMM0), Operand::Reg(XMM0))),
            [0x66, 0x0f, 0xef, 0xc0]
        );
        // pshufd $0x4e, %xmm0, %xmm1
        assert_eq!(
            enc64(Inst::new3(
                Op::Pshufd,
                Operand::Imm(0x4e),
                Operand::Reg(XMM0),
                Operand::Reg(XMM1)
            )),
            [0x66, 0x0f, 0x70, 0xc8, 0x4e]
        );
        // movhlps %xmm0, %xmm1
        assert_eq!(
            enc64(Inst::new2(Op::Movhlps, Operand::Reg(XMM0), Operand::Reg(XMM1))),
            [0x0f, 0x12, 0xc8]
        );
    }

    #[test]
    fn avx_vex() {
        // vaddps %ymm1, %ymm2, %ymm0
        assert_eq!(
            enc64(Inst::new3(
                Op::Vaddps,
                Operand::Reg(YMM1),
                Operand::Reg(Reg::ymm(2)),
                Operand::Reg(YMM0)
            )),
            [0xc5, 0xec, 0x58, 0xc1]
        );
        // vpaddd %ymm1, %ymm0, %ymm0
        assert_eq!(
            enc64(Inst::new3(
                Op::Vpaddd,
                Operand::Reg(YMM1),
                Operand::Reg(YMM0),
                Operand::Reg(YMM0)
            )),
            [0xc5, 0xfd, 0xfe, 0xc1]
        );
        // vmovups (%rsi), %ymm0
        assert_eq!(
            enc64(Inst::new2(Op::Vmovups, Operand::mem(RSI, 0), Operand::Reg(YMM0))),
            [0xc5, 0xfc, 0x10, 0x06]
        );
        assert_eq!(enc64(Inst::new0(Op::Vzeroupper)), [0xc5, 0xf8, 0x77]);
        // vextracti128 $1, %ymm0, %xmm1 uses the 3-byte VEX (map 0F3A).
        assert_eq!(
            enc64(Inst::new3(
                Op::Vextracti128,
                Operand::Imm(1),
                Operand::Reg(YMM0),
                Operand::Reg(XMM1)
            )),
            [0xc4, 0xe3, 0x7d, 0x39, 0xc1, 0x01]
        );
    }

    #[test]
    fn thirty_two_bit_mode() {
        // mov $5, %eax
        assert_eq!(
            enc32(Inst::new2(Op::Mov, Operand::Imm(5), Operand::Reg(EAX))),
            [0xb8, 5, 0, 0, 0]
        );
        // mov 8(%ebp), %eax
        assert_eq!(
            enc32(Inst::new2(Op::Mov, Operand::mem(EBP, 8), Operand::Reg(EAX))),
            [0x8b, 0x45, 0x08]
        );
        // Labels become absolute references outside 64-bit mode.
        let mut obj = ObjectWriter::new(Machine::I386);
        Encoder::new(Bits::B32)
            .encode(
                &Inst::new2(Op::Mov, Operand::label("g"), Operand::Reg(EAX)),
                &mut obj,
            )
            .unwrap();
        assert_eq!(obj.text.as_slice(), [0x8b, 0x05, 0, 0, 0, 0]);
        assert_eq!(obj.text_relocs[0].kind, FixupKind::Abs32);
        // REX-dependent shapes are rejected.
        let err = Encoder::new(Bits::B32).encode(
            &Inst::new2(Op::Mov, Operand::Imm(5), Operand::Reg(RAX)),
            &mut obj,
        );
        assert!(err.is_err());
    }

    #[test]
    fn cqo_and_misc() {
        assert_eq!(enc64(Inst::new0(Op::Cqo)), [0x48, 0x99]);
        assert_eq!(enc64(Inst::new0(Op::Cdq)), [0x99]);
        assert_eq!(enc64(Inst::new0(Op::Ud2)), [0x0f, 0x0b]);
        assert_eq!(enc64(Inst::new0(Op::Leave)), [0xc9]);
        assert_eq!(enc64(Inst::new0(Op::Ret)), [0xc3]);
        // setne %al; cmovne %rcx, %rax
        assert_eq!(
            enc64(Inst::new1(Op::Setcc(Cond::Ne), Operand::Reg(AL))),
            [0x0f, 0x95, 0xc0]
        );
        assert_eq!(
            enc64(Inst::new2(Op::Cmovcc(Cond::Ne), Operand::Reg(RCX), Operand::Reg(RAX))),
            [0x48, 0x0f, 0x45, 0xc1]
        );
    }

    #[test]
    fn imul_forms() {
        // imul %rcx, %rax
        assert_eq!(
            enc64(Inst::new2(Op::Imul, Operand::Reg(RCX), Operand::Reg(RAX))),
            [0x48, 0x0f, 0xaf, 0xc1]
        );
        // imul $3, %rax
        assert_eq!(
            enc64(Inst::new2(Op::Imul, Operand::Imm(3), Operand::Reg(RAX))),
            [0x48, 0x6b, 0xc0, 0x03]
        );
        // imul $1000, %rcx, %rax
        assert_eq!(
            enc64(Inst::new3(
                Op::Imul,
                Operand::Imm(1000),
                Operand::Reg(RCX),
                Operand::Reg(RAX)
            )),
            [0x48, 0x69, 0xc1, 0xe8, 0x03, 0, 0]
        );
    }
}
