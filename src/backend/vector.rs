//! Vectorized code for loops annotated by the AST optimizer.
//!
//! Three shapes: elementwise (`dst[i] = src1[i] OP src2[i]`), reduction
//! (`accum += src1[i]`), and init (`dst[i] = i*scale + offset`). SSE
//! processes 4 lanes per iteration, AVX 8; a scalar loop consumes the
//! remainder, and AVX paths end with `vzeroupper`.

use crate::ast::{BinOp, VecInfo, VecMode};
use crate::encoder::regs::*;
use crate::encoder::{Cond, Inst, Op, Operand, Reg, Size};
use crate::error::{CodegenError, CodegenResult};

use super::{BackendSession, Home};

impl BackendSession {
    /// Resolve an annotated array/pointer name into a base address in
    /// `reg`.
    fn load_array_base(&mut self, name: &str, reg: Reg, line: u32) -> CodegenResult<()> {
        let (home, ty) = self
            .resolve_ident(name)
            .ok_or_else(|| CodegenError::Unsupported {
                what: format!("unknown vector operand `{}`", name),
                line,
            })?;
        let is_array = ty.is_aggregate();
        match home {
            Home::Stack(offset) => {
                let op = if is_array { Op::Lea } else { Op::Mov };
                self.emit(Inst::new2(op, Operand::mem(RBP, offset), Operand::Reg(reg)))
            }
            Home::Label(label) => {
                let op = if is_array { Op::Lea } else { Op::Mov };
                self.emit(Inst::new2(op, Operand::label(label), Operand::Reg(reg)))
            }
            Home::Reg(src) => self.emit(Inst::new2(Op::Mov, Operand::Reg(src), Operand::Reg(reg))),
        }
    }

    fn lane_op(&self, info: &VecInfo, avx: bool) -> Option<Op> {
        Some(match (info.is_float, info.op, avx) {
            (true, BinOp::Add, false) => Op::Addps,
            (true, BinOp::Sub, false) => Op::Subps,
            (true, BinOp::Mul, false) => Op::Mulps,
            (true, BinOp::Div, false) => Op::Divps,
            (true, BinOp::Add, true) => Op::Vaddps,
            (true, BinOp::Sub, true) => Op::Vsubps,
            (true, BinOp::Mul, true) => Op::Vmulps,
            (true, BinOp::Div, true) => Op::Vdivps,
            (false, BinOp::Add, false) => Op::Paddd,
            (false, BinOp::Sub, false) => Op::Psubd,
            (false, BinOp::Add, true) => Op::Vpaddd,
            (false, BinOp::Sub, true) => Op::Vpsubd,
            _ => return None,
        })
    }

    fn scalar_lane_op(&self, info: &VecInfo) -> Op {
        match (info.is_float, info.op) {
            (true, BinOp::Add) => Op::Addss,
            (true, BinOp::Sub) => Op::Subss,
            (true, BinOp::Mul) => Op::Mulss,
            (true, BinOp::Div) => Op::Divss,
            (false, BinOp::Sub) => Op::Sub,
            _ => Op::Add,
        }
    }

    pub(crate) fn gen_vector_loop(&mut self, info: &VecInfo, line: u32) -> CodegenResult<()> {
        log::debug!(
            "vectorizing loop in `{}`: mode {:?}, width {}",
            self.f.name,
            info.mode,
            info.width
        );
        let avx = info.width == 8;
        let main = info.iterations - info.iterations % info.width as i64;
        match info.mode {
            VecMode::Elementwise => self.gen_vec_elementwise(info, avx, main, line),
            VecMode::Reduction => self.gen_vec_reduction(info, avx, main, line),
            VecMode::Init => self.gen_vec_init(info, avx, main, line),
        }?;
        if avx {
            self.emit(Inst::new0(Op::Vzeroupper))?;
        }
        self.invalidate_acc();
        Ok(())
    }

    /// `for i in 0..n: dst[i] = src1[i] OP src2[i]`
    fn gen_vec_elementwise(
        &mut self,
        info: &VecInfo,
        avx: bool,
        mut main: i64,
        line: u32,
    ) -> CodegenResult<()> {
        let lane_op = self.lane_op(info, avx);
        if lane_op.is_none() {
            main = 0; // operator has no packed form; scalar loop only
        }
        self.load_array_base(&info.dst, RDI, line)?;
        self.load_array_base(&info.src1, RSI, line)?;
        self.load_array_base(&info.src2, RDX, line)?;
        self.emit(Inst::new2(Op::Xor, Operand::Reg(ECX), Operand::Reg(ECX)))?;

        let scale = info.elem_size as u8;
        if main > 0 {
            let lane_op = lane_op.expect("checked above");
            let (v0, v1) = if avx { (YMM0, YMM1) } else { (XMM0, XMM1) };
            let mov = match (info.is_float, avx) {
                (true, false) => Op::Movups,
                (false, false) => Op::Movdqu,
                (true, true) => Op::Vmovups,
                (false, true) => Op::Vmovdqu,
            };
            let loop_label = self.new_label(".Lvec");
            self.emit_label(&loop_label)?;
            self.emit(Inst::new2(Op::Mov, Operand::Reg(RCX), Operand::Reg(RAX)))?;
            self.emit(Inst::new2(
                mov,
                Operand::Sib { base: RSI, index: RAX, scale, disp: 0 },
                Operand::Reg(v0),
            ))?;
            self.emit(Inst::new2(
                mov,
                Operand::Sib { base: RDX, index: RAX, scale, disp: 0 },
                Operand::Reg(v1),
            ))?;
            if avx {
                self.emit(Inst::new3(
                    lane_op,
                    Operand::Reg(v1),
                    Operand::Reg(v0),
                    Operand::Reg(v0),
                ))?;
            } else {
                self.emit(Inst::new2(lane_op, Operand::Reg(v1), Operand::Reg(v0)))?;
            }
            self.emit(Inst::new2(
                mov,
                Operand::Reg(v0),
                Operand::Sib { base: RDI, index: RAX, scale, disp: 0 },
            ))?;
            self.emit(Inst::new2(
                Op::Add,
                Operand::Imm(info.width as i64),
                Operand::Reg(RCX),
            ))?;
            self.emit(Inst::new2(Op::Cmp, Operand::Imm(main), Operand::Reg(RCX)))?;
            self.emit(Inst::new1(Op::Jcc(Cond::L), Operand::label(loop_label)))?;
        }

        // Scalar remainder.
        self.gen_vec_remainder(info, main, |this, info| {
            let scale = info.elem_size as u8;
            if info.is_float {
                this.emit(Inst::new2(
                    Op::Movss,
                    Operand::Sib { base: RSI, index: RCX, scale, disp: 0 },
                    Operand::Reg(XMM0),
                ))?;
                this.emit(Inst::new2(
                    this.scalar_lane_op(info),
                    Operand::Sib { base: RDX, index: RCX, scale, disp: 0 },
                    Operand::Reg(XMM0),
                ))?;
                this.emit(Inst::new2(
                    Op::Movss,
                    Operand::Reg(XMM0),
                    Operand::Sib { base: RDI, index: RCX, scale, disp: 0 },
                ))
            } else {
                this.emit(Inst::new2(
                    Op::Mov,
                    Operand::Sib { base: RSI, index: RCX, scale, disp: 0 },
                    Operand::Reg(EAX),
                ))?;
                let op = match info.op {
                    BinOp::Sub => Op::Sub,
                    BinOp::Mul => Op::Imul,
                    _ => Op::Add,
                };
                this.emit(Inst::new2(
                    op,
                    Operand::Sib { base: RDX, index: RCX, scale, disp: 0 },
                    Operand::Reg(EAX),
                ))?;
                this.emit(Inst::new2(
                    Op::Mov,
                    Operand::Reg(EAX),
                    Operand::Sib { base: RDI, index: RCX, scale, disp: 0 },
                ))
            }
        })
    }

    /// `for i in 0..n: accum += src1[i]`
    fn gen_vec_reduction(
        &mut self,
        info: &VecInfo,
        avx: bool,
        mut main: i64,
        line: u32,
    ) -> CodegenResult<()> {
        let accum = info
            .accum
            .clone()
            .ok_or_else(|| CodegenError::Unsupported {
                what: "reduction without an accumulator".into(),
                line,
            })?;
        if info.op != BinOp::Add {
            main = 0;
        }
        self.load_array_base(&info.src1, RSI, line)?;
        self.emit(Inst::new2(Op::Xor, Operand::Reg(ECX), Operand::Reg(ECX)))?;

        if main > 0 {
            let scale = info.elem_size as u8;
            let (v0, v1) = if avx { (YMM0, YMM1) } else { (XMM0, XMM1) };
            // Zero the wide accumulator.
            if avx {
                self.emit(Inst::new3(
                    Op::Vpxor,
                    Operand::Reg(v0),
                    Operand::Reg(v0),
                    Operand::Reg(v0),
                ))?;
            } else {
                self.emit(Inst::new2(Op::Pxor, Operand::Reg(v0), Operand::Reg(v0)))?;
            }
            let mov = match (info.is_float, avx) {
                (true, false) => Op::Movups,
                (false, false) => Op::Movdqu,
                (true, true) => Op::Vmovups,
                (false, true) => Op::Vmovdqu,
            };
            let add = self.lane_op(info, avx).expect("add always has a form");
            let loop_label = self.new_label(".Lvec");
            self.emit_label(&loop_label)?;
            self.emit(Inst::new2(
                mov,
                Operand::Sib { base: RSI, index: RCX, scale, disp: 0 },
                Operand::Reg(v1),
            ))?;
            if avx {
                self.emit(Inst::new3(add, Operand::Reg(v1), Operand::Reg(v0), Operand::Reg(v0)))?;
            } else {
                self.emit(Inst::new2(add, Operand::Reg(v1), Operand::Reg(v0)))?;
            }
            self.emit(Inst::new2(
                Op::Add,
                Operand::Imm(info.width as i64),
                Operand::Reg(RCX),
            ))?;
            self.emit(Inst::new2(Op::Cmp, Operand::Imm(main), Operand::Reg(RCX)))?;
            self.emit(Inst::new1(Op::Jcc(Cond::L), Operand::label(loop_label)))?;

            // Narrow 256 -> 128, then reduce horizontally.
            if avx {
                self.emit(Inst::new3(
                    Op::Vextracti128,
                    Operand::Imm(1),
                    Operand::Reg(YMM0),
                    Operand::Reg(XMM1),
                ))?;
                if info.is_float {
                    self.emit(Inst::new2(Op::Addps, Operand::Reg(XMM1), Operand::Reg(XMM0)))?;
                } else {
                    self.emit(Inst::new2(Op::Paddd, Operand::Reg(XMM1), Operand::Reg(XMM0)))?;
                }
            }
            if info.is_float {
                self.emit(Inst::new2(Op::Movhlps, Operand::Reg(XMM0), Operand::Reg(XMM1)))?;
                self.emit(Inst::new2(Op::Addps, Operand::Reg(XMM1), Operand::Reg(XMM0)))?;
                self.emit(Inst::new3(
                    Op::Pshufd,
                    Operand::Imm(0x55),
                    Operand::Reg(XMM0),
                    Operand::Reg(XMM1),
                ))?;
                self.emit(Inst::new2(Op::Addss, Operand::Reg(XMM1), Operand::Reg(XMM0)))?;
                // Fold into the existing accumulator value.
                self.vec_accum_fold_float(&accum, line)?;
            } else {
                self.emit(Inst::new3(
                    Op::Pshufd,
                    Operand::Imm(0x4e),
                    Operand::Reg(XMM0),
                    Operand::Reg(XMM1),
                ))?;
                self.emit(Inst::new2(Op::Paddd, Operand::Reg(XMM1), Operand::Reg(XMM0)))?;
                self.emit(Inst::new3(
                    Op::Pshufd,
                    Operand::Imm(0xb1),
                    Operand::Reg(XMM0),
                    Operand::Reg(XMM1),
                ))?;
                self.emit(Inst::new2(Op::Paddd, Operand::Reg(XMM1), Operand::Reg(XMM0)))?;
                // Lane 0 to the accumulator through the stack.
                self.emit(Inst::new2(Op::Sub, Operand::Imm(16), Operand::Reg(RSP)))?;
                self.f.stack_offset -= 16;
                self.emit(Inst::new2(Op::Movdqu, Operand::Reg(XMM0), Operand::mem(RSP, 0)))?;
                self.emit(Inst::new2(Op::Mov, Operand::mem(RSP, 0), Operand::Reg(EAX)))?;
                self.emit(Inst::new2(Op::Add, Operand::Imm(16), Operand::Reg(RSP)))?;
                self.f.stack_offset += 16;
                self.vec_accum_fold_int(&accum, line)?;
            }
        }

        // Scalar remainder.
        let accum2 = accum.clone();
        self.gen_vec_remainder(info, main, move |this, info| {
            let scale = info.elem_size as u8;
            if info.is_float {
                this.emit(Inst::new2(
                    Op::Movss,
                    Operand::Sib { base: RSI, index: RCX, scale, disp: 0 },
                    Operand::Reg(XMM0),
                ))?;
                this.vec_accum_fold_float(&accum2, info.iterations as u32)
            } else {
                this.emit(Inst::new2(
                    Op::Mov,
                    Operand::Sib { base: RSI, index: RCX, scale, disp: 0 },
                    Operand::Reg(EAX),
                ))?;
                this.vec_accum_fold_int(&accum2, info.iterations as u32)
            }
        })
    }

    /// accum += eax
    fn vec_accum_fold_int(&mut self, accum: &str, line: u32) -> CodegenResult<()> {
        let (home, _) = self
            .resolve_ident(accum)
            .ok_or_else(|| CodegenError::Unsupported {
                what: format!("unknown accumulator `{}`", accum),
                line,
            })?;
        match home {
            Home::Reg(reg) => self.emit(Inst::new2(
                Op::Add,
                Operand::Reg(EAX),
                Operand::Reg(reg.with_size(Size::Dword)),
            )),
            Home::Stack(offset) => self.emit(Inst::new2(
                Op::Add,
                Operand::Reg(EAX),
                Operand::mem(RBP, offset),
            )),
            Home::Label(label) => self.emit(Inst::new2(
                Op::Add,
                Operand::Reg(EAX),
                Operand::label(label),
            )),
        }
    }

    /// accum += xmm0 (single precision)
    fn vec_accum_fold_float(&mut self, accum: &str, line: u32) -> CodegenResult<()> {
        let (home, _) = self
            .resolve_ident(accum)
            .ok_or_else(|| CodegenError::Unsupported {
                what: format!("unknown accumulator `{}`", accum),
                line,
            })?;
        let src = match home {
            Home::Stack(offset) => Operand::mem(RBP, offset),
            Home::Label(label) => Operand::label(label),
            Home::Reg(_) => {
                return Err(CodegenError::Internal(
                    "float accumulator in an integer register".into(),
                ))
            }
        };
        self.emit(Inst::new2(Op::Addss, src.clone(), Operand::Reg(XMM0)))?;
        self.emit(Inst::new2(Op::Movss, Operand::Reg(XMM0), src))
    }

    /// `for i in 0..n: dst[i] = i*scale + offset`
    fn gen_vec_init(
        &mut self,
        info: &VecInfo,
        avx: bool,
        main: i64,
        line: u32,
    ) -> CodegenResult<()> {
        self.load_array_base(&info.dst, RDI, line)?;
        self.emit(Inst::new2(Op::Xor, Operand::Reg(ECX), Operand::Reg(ECX)))?;
        let scale = info.elem_size as u8;

        if main > 0 {
            let lanes = info.width as i64;
            let vec_bytes = (info.width * info.elem_size) as i32;
            let temp = 2 * vec_bytes;
            // Materialize the initial vector and the stride vector on the
            // stack: [0*s+o, 1*s+o, ...] and [w*s, w*s, ...].
            self.emit(Inst::new2(Op::Sub, Operand::Imm(temp as i64), Operand::Reg(RSP)))?;
            self.f.stack_offset -= temp;
            for lane in 0..lanes {
                let value = lane * info.init_scale + info.init_offset;
                let bits = self.lane_bits(info, value);
                self.emit(
                    Inst::new2(Op::Mov, Operand::Imm(bits), Operand::mem(RSP, (lane * 4) as i32))
                        .with_size(Size::Dword),
                )?;
            }
            if info.init_scale != 0 {
                let stride = lanes * info.init_scale;
                for lane in 0..lanes {
                    let bits = self.lane_bits(info, stride);
                    self.emit(
                        Inst::new2(
                            Op::Mov,
                            Operand::Imm(bits),
                            Operand::mem(RSP, vec_bytes + (lane * 4) as i32),
                        )
                        .with_size(Size::Dword),
                    )?;
                }
            }
            let (v0, v1) = if avx { (YMM0, YMM1) } else { (XMM0, XMM1) };
            let mov = match (info.is_float, avx) {
                (true, false) => Op::Movups,
                (false, false) => Op::Movdqu,
                (true, true) => Op::Vmovups,
                (false, true) => Op::Vmovdqu,
            };
            self.emit(Inst::new2(mov, Operand::mem(RSP, 0), Operand::Reg(v0)))?;
            if info.init_scale != 0 {
                self.emit(Inst::new2(mov, Operand::mem(RSP, vec_bytes), Operand::Reg(v1)))?;
            }

            let loop_label = self.new_label(".Lvec");
            self.emit_label(&loop_label)?;
            self.emit(Inst::new2(
                mov,
                Operand::Reg(v0),
                Operand::Sib { base: RDI, index: RCX, scale, disp: 0 },
            ))?;
            if info.init_scale != 0 {
                if avx {
                    let add = if info.is_float { Op::Vaddps } else { Op::Vpaddd };
                    self.emit(Inst::new3(add, Operand::Reg(v1), Operand::Reg(v0), Operand::Reg(v0)))?;
                } else {
                    let add = if info.is_float { Op::Addps } else { Op::Paddd };
                    self.emit(Inst::new2(add, Operand::Reg(v1), Operand::Reg(v0)))?;
                }
            }
            self.emit(Inst::new2(Op::Add, Operand::Imm(lanes), Operand::Reg(RCX)))?;
            self.emit(Inst::new2(Op::Cmp, Operand::Imm(main), Operand::Reg(RCX)))?;
            self.emit(Inst::new1(Op::Jcc(Cond::L), Operand::label(loop_label)))?;
            self.emit(Inst::new2(Op::Add, Operand::Imm(temp as i64), Operand::Reg(RSP)))?;
            self.f.stack_offset += temp;
        }

        // Scalar remainder computes i*scale + offset directly.
        self.gen_vec_remainder(info, main, |this, info| {
            let scale_bytes = info.elem_size as u8;
            this.emit(Inst::new2(Op::Mov, Operand::Reg(RCX), Operand::Reg(RAX)))?;
            this.emit(Inst::new2(Op::Imul, Operand::Imm(info.init_scale), Operand::Reg(RAX)))?;
            this.emit(Inst::new2(Op::Add, Operand::Imm(info.init_offset), Operand::Reg(RAX)))?;
            if info.is_float {
                this.emit(Inst::new2(Op::Cvtsi2ss, Operand::Reg(RAX), Operand::Reg(XMM0)))?;
                this.emit(Inst::new2(
                    Op::Movss,
                    Operand::Reg(XMM0),
                    Operand::Sib { base: RDI, index: RCX, scale: scale_bytes, disp: 0 },
                ))
            } else {
                this.emit(Inst::new2(
                    Op::Mov,
                    Operand::Reg(EAX),
                    Operand::Sib { base: RDI, index: RCX, scale: scale_bytes, disp: 0 },
                ))
            }
        })
    }

    fn lane_bits(&self, info: &VecInfo, value: i64) -> i64 {
        if info.is_float {
            (value as f32).to_bits() as i64
        } else {
            value as i32 as i64
        }
    }

    /// Emit the scalar remainder loop: body runs for rcx in main..n.
    fn gen_vec_remainder<F>(&mut self, info: &VecInfo, main: i64, body: F) -> CodegenResult<()>
    where
        F: Fn(&mut Self, &VecInfo) -> CodegenResult<()>,
    {
        if main >= info.iterations {
            return Ok(());
        }
        if main > 0 {
            self.emit(Inst::new2(Op::Mov, Operand::Imm(main), Operand::Reg(RCX)))?;
        }
        let head = self.new_label(".Lvrem");
        let done = self.new_label(".Lvrem");
        self.emit_label(&head)?;
        self.emit(Inst::new2(
            Op::Cmp,
            Operand::Imm(info.iterations),
            Operand::Reg(RCX),
        ))?;
        self.emit(Inst::new1(Op::Jcc(Cond::Ge), Operand::label(done.clone())))?;
        body(self, info)?;
        self.emit(Inst::new1(Op::Inc, Operand::Reg(RCX)))?;
        self.emit(Inst::new1(Op::Jmp, Operand::label(head)))?;
        self.emit_label(&done)?;
        Ok(())
    }
}
