//! Expression code emission.
//!
//! Integer results land in the accumulator (rax/eax), float results in
//! xmm0, and aggregates are represented by their address.

use std::rc::Rc;

use crate::ast::{BinOp, Node, NodeKind, UnaryOp};
use crate::encoder::regs::*;
use crate::encoder::{Cond, Inst, Op, Operand, Reg, Size};
use crate::error::{CodegenError, CodegenResult};
use crate::types::CType;

use super::{AccCache, BackendSession, Home};

impl BackendSession {
    /// The resolved type of an expression, defaulting to `int`.
    pub(crate) fn expr_type(&self, node: &Node) -> Rc<CType> {
        if let Some(ty) = &node.ty {
            return ty.clone();
        }
        if let NodeKind::Ident(name) = &node.kind {
            if let Some((_, ty)) = self.resolve_ident(name) {
                return ty;
            }
        }
        Rc::new(CType::Int)
    }

    fn is_float_expr(&self, node: &Node) -> bool {
        self.expr_type(node).is_float()
    }

    /// Fold integer-constant expressions.
    pub(crate) fn const_eval(&self, node: &Node) -> Option<i64> {
        match &node.kind {
            NodeKind::IntLit(v) => Some(*v),
            NodeKind::Cast(inner) if !self.expr_type(node).is_float() => self.const_eval(inner),
            NodeKind::Unary { op, expr } => {
                let v = self.const_eval(expr)?;
                match op {
                    UnaryOp::Neg => Some(v.wrapping_neg()),
                    UnaryOp::BitNot => Some(!v),
                    UnaryOp::Not => Some((v == 0) as i64),
                    _ => None,
                }
            }
            NodeKind::Binary { op, lhs, rhs } => {
                let a = self.const_eval(lhs)?;
                let b = self.const_eval(rhs)?;
                match op {
                    BinOp::Add => Some(a.wrapping_add(b)),
                    BinOp::Sub => Some(a.wrapping_sub(b)),
                    BinOp::Mul => Some(a.wrapping_mul(b)),
                    BinOp::Div if b != 0 => Some(a.wrapping_div(b)),
                    BinOp::Mod if b != 0 => Some(a.wrapping_rem(b)),
                    BinOp::And => Some(a & b),
                    BinOp::Or => Some(a | b),
                    BinOp::Xor => Some(a ^ b),
                    BinOp::Shl => Some(a.wrapping_shl(b as u32 & 63)),
                    BinOp::Shr => Some(a.wrapping_shr(b as u32 & 63)),
                    BinOp::Lt => Some((a < b) as i64),
                    BinOp::Le => Some((a <= b) as i64),
                    BinOp::Gt => Some((a > b) as i64),
                    BinOp::Ge => Some((a >= b) as i64),
                    BinOp::Eq => Some((a == b) as i64),
                    BinOp::Ne => Some((a != b) as i64),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Would `gen_expr` on this node leave the secondary register alone?
    fn is_simple(&self, node: &Node) -> bool {
        match &node.kind {
            NodeKind::IntLit(_) | NodeKind::StrLit(_) | NodeKind::FloatLit(_) => true,
            NodeKind::Ident(_) => !self.expr_type(node).is_aggregate(),
            _ => false,
        }
    }

    // ---- loads and stores --------------------------------------------

    /// Load a scalar of type `ty` from `src` into the accumulator (or
    /// xmm0 for floats). 1/2/4-byte integer loads zero-extend.
    pub(crate) fn load_scalar(&mut self, ty: &CType, src: Operand) -> CodegenResult<()> {
        if ty.is_float() {
            let op = if self.type_size(ty) == 4 {
                Op::Movss
            } else {
                Op::Movsd
            };
            return self.emit(Inst::new2(op, src, Operand::Reg(XMM0)));
        }
        let acc = self.acc();
        match self.type_size(ty) {
            1 => self.emit(Inst::new2(
                Op::Movzx(Size::Byte),
                src,
                Operand::Reg(acc.with_size(Size::Dword)),
            )),
            2 => self.emit(Inst::new2(
                Op::Movzx(Size::Word),
                src,
                Operand::Reg(acc.with_size(Size::Dword)),
            )),
            4 => self.emit(Inst::new2(
                Op::Mov,
                src,
                Operand::Reg(acc.with_size(Size::Dword)),
            )),
            _ => self.emit(Inst::new2(Op::Mov, src, Operand::Reg(acc))),
        }
    }

    /// Store the accumulator (or xmm0) into `dst` at `ty`'s width.
    pub(crate) fn store_scalar(&mut self, ty: &CType, dst: Operand) -> CodegenResult<()> {
        if ty.is_float() {
            let op = if self.type_size(ty) == 4 {
                Op::Movss
            } else {
                Op::Movsd
            };
            return self.emit(Inst::new2(op, Operand::Reg(XMM0), dst));
        }
        let acc = self.acc();
        let size = Size::for_bytes(self.type_size(ty).min(self.slot_size() as u32));
        self.emit(Inst::new2(Op::Mov, Operand::Reg(acc.with_size(size)), dst))
    }

    // ---- addresses ---------------------------------------------------

    /// Compute the address of an lvalue into the accumulator.
    pub(crate) fn gen_addr(&mut self, node: &Node) -> CodegenResult<()> {
        let acc = self.acc();
        match &node.kind {
            NodeKind::Ident(name) => {
                let (home, _) = self.resolve_ident(name).ok_or_else(|| {
                    CodegenError::Unsupported {
                        what: format!("unknown identifier `{}`", name),
                        line: node.line,
                    }
                })?;
                match home {
                    Home::Stack(offset) => {
                        let bp = self.bp();
                        self.emit(Inst::new2(Op::Lea, Operand::mem(bp, offset), Operand::Reg(acc)))
                    }
                    Home::Label(label) => {
                        self.emit(Inst::new2(Op::Lea, Operand::label(label), Operand::Reg(acc)))
                    }
                    Home::Reg(_) => Err(CodegenError::Internal(format!(
                        "address of register-promoted variable `{}`",
                        name
                    ))),
                }
            }
            NodeKind::Unary {
                op: UnaryOp::Deref,
                expr,
            } => {
                // The pointee expression's value already is the address.
                self.gen_expr(expr)
            }
            NodeKind::Member {
                base,
                member,
                arrow,
            } => {
                let base_ty = self.expr_type(base);
                let agg = if *arrow {
                    base_ty.pointee().cloned().ok_or_else(|| {
                        CodegenError::Unsupported {
                            what: "arrow access through a non-pointer".into(),
                            line: node.line,
                        }
                    })?
                } else {
                    base_ty
                };
                let offset = agg
                    .member(member)
                    .map(|m| m.offset)
                    .ok_or_else(|| CodegenError::Unsupported {
                        what: format!("unknown member `{}`", member),
                        line: node.line,
                    })?;
                if *arrow {
                    self.gen_expr(base)?;
                } else {
                    self.gen_addr(base)?;
                }
                if offset != 0 {
                    self.emit(Inst::new2(
                        Op::Add,
                        Operand::Imm(offset as i64),
                        Operand::Reg(acc),
                    ))?;
                }
                self.invalidate_acc();
                Ok(())
            }
            NodeKind::Index { base, index } => {
                let elem = self
                    .expr_type(base)
                    .pointee()
                    .cloned()
                    .unwrap_or_else(|| Rc::new(CType::Int));
                let elem_size = self.type_size(&elem);
                self.gen_expr(base)?;
                self.push_acc()?;
                self.gen_expr(index)?;
                self.emit(Inst::new2(
                    Op::Imul,
                    Operand::Imm(elem_size as i64),
                    Operand::Reg(acc),
                ))?;
                self.pop_sec()?;
                let sec = self.sec();
                self.emit(Inst::new2(Op::Add, Operand::Reg(sec), Operand::Reg(acc)))?;
                self.invalidate_acc();
                Ok(())
            }
            NodeKind::StrLit(value) => {
                let label = self.intern_string(value);
                self.emit(Inst::new2(Op::Lea, Operand::label(label), Operand::Reg(acc)))
            }
            _ => Err(CodegenError::Unsupported {
                what: "address of a non-lvalue".into(),
                line: node.line,
            }),
        }
    }

    // ---- expressions -------------------------------------------------

    pub(crate) fn gen_expr(&mut self, node: &Node) -> CodegenResult<()> {
        let acc = self.acc();
        match &node.kind {
            NodeKind::IntLit(value) => self.gen_int_literal(*value, &self.expr_type(node)),
            NodeKind::FloatLit(value) => {
                let is_double = !matches!(&*self.expr_type(node), CType::Float);
                let label = self.intern_float(*value, is_double);
                let op = if is_double { Op::Movsd } else { Op::Movss };
                self.emit(Inst::new2(op, Operand::label(label), Operand::Reg(XMM0)))
            }
            NodeKind::StrLit(value) => {
                let label = self.intern_string(value);
                self.emit(Inst::new2(Op::Lea, Operand::label(label), Operand::Reg(acc)))
            }
            NodeKind::Ident(name) => self.gen_ident(name, node.line),
            NodeKind::Unary { op, expr } => self.gen_unary(*op, expr, node),
            NodeKind::Cast(inner) => self.gen_cast(inner, &self.expr_type(node)),
            NodeKind::Binary { op, lhs, rhs } => self.gen_binary(*op, lhs, rhs, node),
            NodeKind::Assign { lhs, rhs } => self.gen_assign(lhs, rhs),
            NodeKind::Index { .. } | NodeKind::Member { .. } => {
                let ty = self.expr_type(node);
                self.gen_addr(node)?;
                if ty.is_aggregate() {
                    // The address is the value.
                    return Ok(());
                }
                let addr = Operand::mem(acc, 0);
                self.load_scalar(&ty, addr)?;
                self.invalidate_acc();
                Ok(())
            }
            NodeKind::Call { func, args } => self.gen_call(func, args, node),
            NodeKind::If {
                cond,
                then,
                els: Some(els),
            } => self.gen_ternary(cond, then, els, node),
            _ => Err(CodegenError::Unsupported {
                what: "expression kind".into(),
                line: node.line,
            }),
        }
    }

    fn gen_int_literal(&mut self, value: i64, ty: &CType) -> CodegenResult<()> {
        let acc = self.acc();
        self.invalidate_acc();
        if value == 0 && self.opts.opt.gate() >= 1 {
            let acc32 = acc.with_size(Size::Dword);
            return self.emit(Inst::new2(Op::Xor, Operand::Reg(acc32), Operand::Reg(acc32)));
        }
        let needs_wide =
            self.is_64() && (value < 0 || value > u32::MAX as i64) && self.type_size(ty) == 8;
        let dst = if needs_wide {
            acc
        } else if self.is_64() && value < 0 {
            // Negative int-width constants still sign-fill the register.
            acc
        } else {
            acc.with_size(Size::Dword)
        };
        self.emit(Inst::new2(Op::Mov, Operand::Imm(value), Operand::Reg(dst)))
    }

    fn gen_ident(&mut self, name: &str, line: u32) -> CodegenResult<()> {
        let (home, ty) = self
            .resolve_ident(name)
            .ok_or_else(|| CodegenError::Unsupported {
                what: format!("unknown identifier `{}`", name),
                line,
            })?;
        let acc = self.acc();
        let size = self.type_size(&ty);
        match home {
            Home::Reg(reg) => {
                if self.f.acc == AccCache::Reg(reg.id) && self.f.acc_size == size {
                    return Ok(());
                }
                let width = self.width_of(&ty);
                self.emit(Inst::new2(
                    Op::Mov,
                    Operand::Reg(reg.with_size(width)),
                    Operand::Reg(acc.with_size(width)),
                ))?;
                self.f.acc = AccCache::Reg(reg.id);
                self.f.acc_size = size;
                Ok(())
            }
            Home::Stack(offset) => {
                let bp = self.bp();
                if ty.is_aggregate() {
                    return self
                        .emit(Inst::new2(Op::Lea, Operand::mem(bp, offset), Operand::Reg(acc)));
                }
                if ty.is_float() {
                    return self.load_scalar(&ty, Operand::mem(bp, offset));
                }
                if self.f.acc == AccCache::Stack(offset) && self.f.acc_size == size {
                    return Ok(());
                }
                self.load_scalar(&ty, Operand::mem(bp, offset))?;
                self.f.acc = AccCache::Stack(offset);
                self.f.acc_size = size;
                Ok(())
            }
            Home::Label(label) => {
                if ty.is_aggregate() {
                    return self
                        .emit(Inst::new2(Op::Lea, Operand::label(label), Operand::Reg(acc)));
                }
                if ty.is_float() {
                    return self.load_scalar(&ty, Operand::label(label.clone()));
                }
                if self.f.acc == AccCache::Label(label.clone()) && self.f.acc_size == size {
                    return Ok(());
                }
                self.load_scalar(&ty, Operand::label(label.clone()))?;
                self.f.acc = AccCache::Label(label);
                self.f.acc_size = size;
                Ok(())
            }
        }
    }

    fn gen_unary(&mut self, op: UnaryOp, expr: &Node, node: &Node) -> CodegenResult<()> {
        let acc = self.acc();
        match op {
            UnaryOp::AddrOf => self.gen_addr(expr),
            UnaryOp::Deref => {
                let ty = self.expr_type(node);
                self.gen_expr(expr)?;
                if ty.is_aggregate() {
                    return Ok(());
                }
                self.load_scalar(&ty, Operand::mem(acc, 0))?;
                self.invalidate_acc();
                Ok(())
            }
            UnaryOp::Neg => {
                self.gen_expr(expr)?;
                if self.is_float_expr(expr) {
                    let wide = self.type_size(&self.expr_type(expr)) == 8;
                    let (mov, sub) = if wide {
                        (Op::Movsd, Op::Subsd)
                    } else {
                        (Op::Movss, Op::Subss)
                    };
                    self.emit(Inst::new2(mov, Operand::Reg(XMM0), Operand::Reg(XMM1)))?;
                    self.emit(Inst::new2(Op::Pxor, Operand::Reg(XMM0), Operand::Reg(XMM0)))?;
                    self.emit(Inst::new2(sub, Operand::Reg(XMM1), Operand::Reg(XMM0)))?;
                    return Ok(());
                }
                self.invalidate_acc();
                let width = self.width_of(&self.expr_type(expr));
                self.emit(Inst::new1(Op::Neg, Operand::Reg(acc.with_size(width))))
            }
            UnaryOp::BitNot => {
                self.gen_expr(expr)?;
                self.invalidate_acc();
                let width = self.width_of(&self.expr_type(expr));
                self.emit(Inst::new1(Op::Not, Operand::Reg(acc.with_size(width))))
            }
            UnaryOp::Not => {
                self.gen_truth_value(expr)?;
                // Flip the materialized 0/1.
                let acc32 = acc.with_size(Size::Dword);
                self.emit(Inst::new2(Op::Xor, Operand::Imm(1), Operand::Reg(acc32)))?;
                self.invalidate_acc();
                Ok(())
            }
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                self.gen_incdec(op, expr, node)
            }
        }
    }

    /// Pre/post increment and decrement; pointers step by the pointee
    /// size.
    fn gen_incdec(&mut self, op: UnaryOp, expr: &Node, node: &Node) -> CodegenResult<()> {
        let ty = self.expr_type(expr);
        let delta = match &*ty {
            CType::Pointer(inner) => self.type_size(inner) as i64,
            _ => 1,
        };
        let is_inc = matches!(op, UnaryOp::PreInc | UnaryOp::PostInc);
        let is_pre = matches!(op, UnaryOp::PreInc | UnaryOp::PreDec);
        let arith = if is_inc { Op::Add } else { Op::Sub };
        let acc = self.acc();
        let width = self.width_of(&ty);

        // Register-resident operands skip the address computation.
        if let NodeKind::Ident(name) = &expr.kind {
            if let Some((Home::Reg(reg), _)) = self.resolve_ident(name) {
                let reg_w = reg.with_size(width);
                let acc_w = acc.with_size(width);
                if is_pre {
                    self.emit(Inst::new2(arith, Operand::Imm(delta), Operand::Reg(reg_w)))?;
                    self.emit(Inst::new2(Op::Mov, Operand::Reg(reg_w), Operand::Reg(acc_w)))?;
                } else {
                    self.emit(Inst::new2(Op::Mov, Operand::Reg(reg_w), Operand::Reg(acc_w)))?;
                    self.emit(Inst::new2(arith, Operand::Imm(delta), Operand::Reg(reg_w)))?;
                }
                self.invalidate_acc();
                return Ok(());
            }
        }

        // General path: address in the secondary register.
        self.gen_addr(expr)?;
        let sec = self.sec();
        self.emit(Inst::new2(Op::Mov, Operand::Reg(acc), Operand::Reg(sec)))?;
        self.load_scalar(&ty, Operand::mem(sec, 0))?;
        self.invalidate_acc();
        let acc_w = acc.with_size(width);
        if is_pre {
            self.emit(Inst::new2(arith, Operand::Imm(delta), Operand::Reg(acc_w)))?;
            self.store_scalar(&ty, Operand::mem(sec, 0))?;
        } else {
            let dx = if self.is_64() { RDX } else { EDX };
            self.emit(Inst::new2(Op::Mov, Operand::Reg(acc), Operand::Reg(dx)))?;
            self.emit(Inst::new2(arith, Operand::Imm(delta), Operand::Reg(acc_w)))?;
            self.store_scalar(&ty, Operand::mem(sec, 0))?;
            self.emit(Inst::new2(Op::Mov, Operand::Reg(dx), Operand::Reg(acc)))?;
        }
        let _ = node;
        Ok(())
    }

    fn gen_cast(&mut self, inner: &Node, to: &CType) -> CodegenResult<()> {
        let from = self.expr_type(inner);
        self.gen_expr(inner)?;
        let acc = self.acc();
        match (from.is_float(), to.is_float()) {
            (false, true) => {
                self.invalidate_acc();
                let op = if self.type_size(to) == 4 {
                    Op::Cvtsi2ss
                } else {
                    Op::Cvtsi2sd
                };
                let src = acc.with_size(self.width_of(&from));
                self.emit(Inst::new2(op, Operand::Reg(src), Operand::Reg(XMM0)))
            }
            (true, false) => {
                self.invalidate_acc();
                let op = if self.type_size(&from) == 4 {
                    Op::Cvttss2si
                } else {
                    Op::Cvttsd2si
                };
                let dst = acc.with_size(self.width_of(to));
                self.emit(Inst::new2(op, Operand::Reg(XMM0), Operand::Reg(dst)))
            }
            (true, true) => {
                let from_size = self.type_size(&from);
                let to_size = self.type_size(to);
                if from_size == 4 && to_size == 8 {
                    self.emit(Inst::new2(Op::Cvtss2sd, Operand::Reg(XMM0), Operand::Reg(XMM0)))
                } else if from_size == 8 && to_size == 4 {
                    self.emit(Inst::new2(Op::Cvtsd2ss, Operand::Reg(XMM0), Operand::Reg(XMM0)))
                } else {
                    Ok(())
                }
            }
            (false, false) => {
                match to {
                    CType::Char => {
                        self.invalidate_acc();
                        if self.is_64() {
                            self.emit(
                                Inst::new2(Op::Movsx(Size::Byte), Operand::Reg(AL), Operand::Reg(acc))
                                    .with_size(Size::Qword),
                            )
                        } else {
                            self.emit(
                                Inst::new2(Op::Movsx(Size::Byte), Operand::Reg(AL), Operand::Reg(acc))
                                    .with_size(Size::Dword),
                            )
                        }
                    }
                    CType::Short => {
                        self.invalidate_acc();
                        self.emit(
                            Inst::new2(
                                Op::Movsx(Size::Word),
                                Operand::Reg(acc.with_size(Size::Word)),
                                Operand::Reg(acc),
                            )
                            .with_size(self.width_of(to)),
                        )
                    }
                    // Pointer and same-width integer casts are no-ops.
                    _ => Ok(()),
                }
            }
        }
    }

    /// Materialize an expression as 0/1 in the accumulator.
    pub(crate) fn gen_truth_value(&mut self, expr: &Node) -> CodegenResult<()> {
        self.gen_expr(expr)?;
        let acc = self.acc();
        if self.is_float_expr(expr) {
            let wide = self.type_size(&self.expr_type(expr)) == 8;
            let cmp = if wide { Op::Ucomisd } else { Op::Ucomiss };
            self.emit(Inst::new2(Op::Pxor, Operand::Reg(XMM1), Operand::Reg(XMM1)))?;
            self.emit(Inst::new2(cmp, Operand::Reg(XMM1), Operand::Reg(XMM0)))?;
        } else {
            let width = self.width_of(&self.expr_type(expr));
            let acc_w = acc.with_size(width);
            self.emit(Inst::new2(Op::Test, Operand::Reg(acc_w), Operand::Reg(acc_w)))?;
        }
        self.emit(Inst::new1(Op::Setcc(Cond::Ne), Operand::Reg(AL)))?;
        self.emit(Inst::new2(
            Op::Movzx(Size::Byte),
            Operand::Reg(AL),
            Operand::Reg(acc.with_size(Size::Dword)),
        ))?;
        self.invalidate_acc();
        Ok(())
    }

    /// Evaluate `cond` and jump to `label` when it is false/true.
    pub(crate) fn gen_branch(
        &mut self,
        cond: &Node,
        label: &str,
        jump_if_true: bool,
    ) -> CodegenResult<()> {
        self.gen_expr(cond)?;
        if self.is_float_expr(cond) {
            let wide = self.type_size(&self.expr_type(cond)) == 8;
            let cmp = if wide { Op::Ucomisd } else { Op::Ucomiss };
            self.emit(Inst::new2(Op::Pxor, Operand::Reg(XMM1), Operand::Reg(XMM1)))?;
            self.emit(Inst::new2(cmp, Operand::Reg(XMM1), Operand::Reg(XMM0)))?;
        } else {
            let acc = self.acc();
            let width = self.width_of(&self.expr_type(cond));
            let acc_w = acc.with_size(width);
            self.emit(Inst::new2(Op::Test, Operand::Reg(acc_w), Operand::Reg(acc_w)))?;
        }
        let cc = if jump_if_true { Cond::Ne } else { Cond::E };
        self.invalidate_acc();
        self.emit(Inst::new1(Op::Jcc(cc), Operand::label(label)))
    }

    // ---- assignment --------------------------------------------------

    fn gen_assign(&mut self, lhs: &Node, rhs: &Node) -> CodegenResult<()> {
        let ty = self.expr_type(lhs);
        let size = self.type_size(&ty);

        // Large aggregates copy through memcpy.
        if ty.is_aggregate() && size as i32 > self.slot_size() {
            return self.gen_struct_copy(lhs, rhs, size);
        }

        // Direct stores for plain identifier destinations.
        if let NodeKind::Ident(name) = &lhs.kind {
            if let Some((home, _)) = self.resolve_ident(name) {
                self.gen_expr(rhs)?;
                match home {
                    Home::Reg(reg) => {
                        let width = self.width_of(&ty);
                        let acc = self.acc().with_size(width);
                        self.emit(Inst::new2(
                            Op::Mov,
                            Operand::Reg(acc),
                            Operand::Reg(reg.with_size(width)),
                        ))?;
                        self.f.acc = AccCache::Reg(reg.id);
                        self.f.acc_size = size;
                    }
                    Home::Stack(offset) => {
                        let bp = self.bp();
                        self.store_scalar(&ty, Operand::mem(bp, offset))?;
                        // Sub-word stores truncate; the accumulator then
                        // no longer matches the slot.
                        if !ty.is_float() && size >= 4 {
                            self.f.acc = AccCache::Stack(offset);
                            self.f.acc_size = size;
                        } else {
                            self.invalidate_acc();
                        }
                    }
                    Home::Label(label) => {
                        self.store_scalar(&ty, Operand::label(label.clone()))?;
                        if !ty.is_float() && size >= 4 {
                            self.f.acc = AccCache::Label(label);
                            self.f.acc_size = size;
                        } else {
                            self.invalidate_acc();
                        }
                    }
                }
                return Ok(());
            }
        }

        // Computed destination: address first, value second.
        self.gen_addr(lhs)?;
        self.push_acc()?;
        self.gen_expr(rhs)?;
        self.pop_sec()?;
        let sec = self.sec();
        self.store_scalar(&ty, Operand::mem(sec, 0))?;
        // A store through a computed address may alias anything.
        self.invalidate_acc();
        Ok(())
    }

    /// Aggregate assignment through `memcpy`.
    fn gen_struct_copy(&mut self, lhs: &Node, rhs: &Node, size: u32) -> CodegenResult<()> {
        self.gen_expr(rhs)?; // aggregate value = its address
        self.push_acc()?;
        self.gen_addr(lhs)?;
        self.invalidate_acc();

        if !self.is_64() {
            // cdecl memcpy(dst, src, n).
            let acc = self.acc();
            self.pop_sec()?;
            let sec = self.sec();
            self.f.stack_offset -= 12;
            self.emit(Inst::new2(Op::Mov, Operand::Imm(size as i64), Operand::Reg(EDX)))?;
            self.emit(Inst::new1(Op::Push, Operand::Reg(EDX)))?;
            self.emit(Inst::new1(Op::Push, Operand::Reg(sec)))?;
            self.emit(Inst::new1(Op::Push, Operand::Reg(acc)))?;
            self.emit(Inst::new1(Op::Call, Operand::label("memcpy")))?;
            self.emit(Inst::new2(Op::Add, Operand::Imm(12), Operand::Reg(ESP)))?;
            self.f.stack_offset += 12;
            return Ok(());
        }

        let args = self.target.int_arg_regs();
        let (a0, a1, a2) = (args[0], args[1], args[2]);
        let acc = self.acc();
        self.emit(Inst::new2(Op::Mov, Operand::Reg(acc), Operand::Reg(a0)))?;
        self.pop_reg(a1)?;
        self.emit(Inst::new2(Op::Mov, Operand::Imm(size as i64), Operand::Reg(a2)))?;
        let shadow = self.target.shadow_space() as i64;
        let pad = self.call_padding(0);
        let fixup = pad as i64 + shadow;
        if fixup != 0 {
            let sp = self.sp();
            self.f.stack_offset -= fixup as i32;
            self.emit(Inst::new2(Op::Sub, Operand::Imm(fixup), Operand::Reg(sp)))?;
        }
        if self.target == crate::target::Target::LinuxX64 {
            self.emit(Inst::new2(Op::Mov, Operand::Imm(0), Operand::Reg(EAX)))?;
        }
        self.emit(Inst::new1(Op::Call, Operand::label("memcpy")))?;
        if fixup != 0 {
            let sp = self.sp();
            self.f.stack_offset += fixup as i32;
            self.emit(Inst::new2(Op::Add, Operand::Imm(fixup), Operand::Reg(sp)))?;
        }
        Ok(())
    }

    /// Bytes of padding needed so the call site sees a 16-byte-aligned
    /// stack, given bytes that will still be pushed before the call.
    pub(crate) fn call_padding(&self, pending_bytes: i32) -> i32 {
        debug_assert!(self.f.stack_offset <= 0);
        let depth = -self.f.stack_offset + pending_bytes + self.target.shadow_space() as i32;
        (16 - depth.rem_euclid(16)).rem_euclid(16)
    }

    // ---- binary operators --------------------------------------------

    fn gen_binary(&mut self, op: BinOp, lhs: &Node, rhs: &Node, node: &Node) -> CodegenResult<()> {
        match op {
            BinOp::Comma => {
                self.gen_expr(lhs)?;
                return self.gen_expr(rhs);
            }
            BinOp::LogAnd | BinOp::LogOr => return self.gen_logical(op, lhs, rhs),
            _ => {}
        }

        // Constant folding of trivial cases.
        if let Some(value) = self.const_eval(node) {
            return self.gen_int_literal(value, &self.expr_type(node));
        }

        if self.is_float_expr(lhs) || self.is_float_expr(rhs) {
            return self.gen_float_binary(op, lhs, rhs);
        }

        let lhs_ty = self.expr_type(lhs);
        let rhs_ty = self.expr_type(rhs);
        let width = if self.width_of(&lhs_ty) == Size::Qword
            || self.width_of(&rhs_ty) == Size::Qword
        {
            if self.is_64() {
                Size::Qword
            } else {
                Size::Dword
            }
        } else {
            Size::Dword
        };
        let acc = self.acc().with_size(width);
        let sec = self.sec().with_size(width);

        // Pointer difference: subtract, then divide by the pointee size.
        if op == BinOp::Sub && lhs_ty.is_pointer() && rhs_ty.is_pointer() {
            let elem = self.type_size(lhs_ty.pointee().unwrap()).max(1);
            self.gen_schedule(lhs, rhs, None)?;
            self.emit(Inst::new2(Op::Sub, Operand::Reg(sec), Operand::Reg(acc)))?;
            self.invalidate_acc();
            if elem > 1 {
                if elem.is_power_of_two() {
                    self.emit(Inst::new2(
                        Op::Sar,
                        Operand::Imm(elem.trailing_zeros() as i64),
                        Operand::Reg(acc),
                    ))?;
                } else {
                    self.emit(Inst::new2(Op::Mov, Operand::Imm(elem as i64), Operand::Reg(sec)))?;
                    self.emit(Inst::new0(if width == Size::Qword { Op::Cqo } else { Op::Cdq }))?;
                    self.emit(Inst::new1(Op::Idiv, Operand::Reg(sec)))?;
                }
            }
            return Ok(());
        }

        // Pointer +- integer scales the integer operand.
        let scale_rhs = lhs_ty.is_pointer() && rhs_ty.is_integer();
        let scale_lhs = rhs_ty.is_pointer() && lhs_ty.is_integer() && op == BinOp::Add;
        let elem_size = if scale_rhs {
            self.type_size(lhs_ty.pointee().unwrap()).max(1)
        } else if scale_lhs {
            self.type_size(rhs_ty.pointee().unwrap()).max(1)
        } else {
            1
        };

        // Immediate right-hand side for the operators that admit it.
        if let Some(imm) = self.const_eval(rhs) {
            let admits_imm = matches!(
                op,
                BinOp::Add
                    | BinOp::Sub
                    | BinOp::And
                    | BinOp::Or
                    | BinOp::Xor
                    | BinOp::Shl
                    | BinOp::Shr
                    | BinOp::Mul
            ) || op.is_comparison();
            let imm = imm.wrapping_mul(elem_size as i64);
            if admits_imm && imm >= i32::MIN as i64 && imm <= i32::MAX as i64 {
                self.gen_expr(lhs)?;
                self.invalidate_acc();
                return match op {
                    BinOp::Add => self.emit(Inst::new2(Op::Add, Operand::Imm(imm), Operand::Reg(acc))),
                    BinOp::Sub => self.emit(Inst::new2(Op::Sub, Operand::Imm(imm), Operand::Reg(acc))),
                    BinOp::And => self.emit(Inst::new2(Op::And, Operand::Imm(imm), Operand::Reg(acc))),
                    BinOp::Or => self.emit(Inst::new2(Op::Or, Operand::Imm(imm), Operand::Reg(acc))),
                    BinOp::Xor => self.emit(Inst::new2(Op::Xor, Operand::Imm(imm), Operand::Reg(acc))),
                    BinOp::Shl => self.emit(Inst::new2(Op::Shl, Operand::Imm(imm), Operand::Reg(acc))),
                    BinOp::Shr => self.emit(Inst::new2(Op::Sar, Operand::Imm(imm), Operand::Reg(acc))),
                    BinOp::Mul => self.emit(Inst::new2(Op::Imul, Operand::Imm(imm), Operand::Reg(acc))),
                    _ => {
                        self.emit(Inst::new2(Op::Cmp, Operand::Imm(imm), Operand::Reg(acc)))?;
                        self.materialize_comparison(comparison_cond(op))
                    }
                };
            }
        }

        // Two-register schedule.
        self.gen_schedule(lhs, rhs, if scale_rhs { Some(elem_size) } else { None })?;
        if scale_lhs && elem_size > 1 {
            self.emit(Inst::new2(
                Op::Imul,
                Operand::Imm(elem_size as i64),
                Operand::Reg(acc),
            ))?;
        }
        self.invalidate_acc();
        match op {
            BinOp::Add => self.emit(Inst::new2(Op::Add, Operand::Reg(sec), Operand::Reg(acc))),
            BinOp::Sub => self.emit(Inst::new2(Op::Sub, Operand::Reg(sec), Operand::Reg(acc))),
            BinOp::Mul => self.emit(Inst::new2(Op::Imul, Operand::Reg(sec), Operand::Reg(acc))),
            BinOp::And => self.emit(Inst::new2(Op::And, Operand::Reg(sec), Operand::Reg(acc))),
            BinOp::Or => self.emit(Inst::new2(Op::Or, Operand::Reg(sec), Operand::Reg(acc))),
            BinOp::Xor => self.emit(Inst::new2(Op::Xor, Operand::Reg(sec), Operand::Reg(acc))),
            BinOp::Shl | BinOp::Shr => {
                let shift = if op == BinOp::Shl { Op::Shl } else { Op::Sar };
                self.emit(Inst::new2(shift, Operand::Reg(CL), Operand::Reg(acc)))
            }
            BinOp::Div | BinOp::Mod => {
                let cvt = if width == Size::Qword { Op::Cqo } else { Op::Cdq };
                self.emit(Inst::new0(cvt))?;
                self.emit(Inst::new1(Op::Idiv, Operand::Reg(sec)))?;
                if op == BinOp::Mod {
                    // The remainder lives in the D register.
                    let dx = RDX.with_size(width);
                    self.emit(Inst::new2(Op::Mov, Operand::Reg(dx), Operand::Reg(acc)))?;
                }
                Ok(())
            }
            _ if op.is_comparison() => {
                self.emit(Inst::new2(Op::Cmp, Operand::Reg(sec), Operand::Reg(acc)))?;
                self.materialize_comparison(comparison_cond(op))
            }
            _ => Err(CodegenError::Internal(format!(
                "binary operator {:?} fell through",
                op
            ))),
        }
    }

    /// `gen(right)` into the secondary register, `gen(left)` into the
    /// accumulator, choosing mov or push/pop by the left's shape.
    fn gen_schedule(
        &mut self,
        lhs: &Node,
        rhs: &Node,
        scale_rhs: Option<u32>,
    ) -> CodegenResult<()> {
        let acc = self.acc();
        let sec = self.sec();
        self.gen_expr(rhs)?;
        if let Some(elem) = scale_rhs {
            if elem > 1 {
                self.emit(Inst::new2(
                    Op::Imul,
                    Operand::Imm(elem as i64),
                    Operand::Reg(acc),
                ))?;
            }
            self.invalidate_acc();
        }
        if self.is_simple(lhs) {
            self.emit(Inst::new2(Op::Mov, Operand::Reg(acc), Operand::Reg(sec)))?;
            self.gen_expr(lhs)
        } else {
            self.push_acc()?;
            self.gen_expr(lhs)?;
            self.pop_sec()
        }
    }

    /// `cmp` result to a 0/1 accumulator via setcc + zero extension.
    fn materialize_comparison(&mut self, cc: Cond) -> CodegenResult<()> {
        let acc = self.acc();
        self.emit(Inst::new1(Op::Setcc(cc), Operand::Reg(AL)))?;
        self.emit(Inst::new2(
            Op::Movzx(Size::Byte),
            Operand::Reg(AL),
            Operand::Reg(acc.with_size(Size::Dword)),
        ))?;
        self.invalidate_acc();
        Ok(())
    }

    fn gen_float_binary(&mut self, op: BinOp, lhs: &Node, rhs: &Node) -> CodegenResult<()> {
        let wide = self.type_size(&self.expr_type(lhs)) == 8
            || self.type_size(&self.expr_type(rhs)) == 8;
        self.gen_float_operand(rhs, wide)?;
        self.push_xmm()?;
        self.gen_float_operand(lhs, wide)?;
        self.pop_xmm(XMM1)?;
        let arith = |narrow: Op, wide_op: Op| if wide { wide_op } else { narrow };
        match op {
            BinOp::Add => self.emit(Inst::new2(
                arith(Op::Addss, Op::Addsd),
                Operand::Reg(XMM1),
                Operand::Reg(XMM0),
            )),
            BinOp::Sub => self.emit(Inst::new2(
                arith(Op::Subss, Op::Subsd),
                Operand::Reg(XMM1),
                Operand::Reg(XMM0),
            )),
            BinOp::Mul => self.emit(Inst::new2(
                arith(Op::Mulss, Op::Mulsd),
                Operand::Reg(XMM1),
                Operand::Reg(XMM0),
            )),
            BinOp::Div => self.emit(Inst::new2(
                arith(Op::Divss, Op::Divsd),
                Operand::Reg(XMM1),
                Operand::Reg(XMM0),
            )),
            _ if op.is_comparison() => {
                self.emit(Inst::new2(
                    arith(Op::Ucomiss, Op::Ucomisd),
                    Operand::Reg(XMM1),
                    Operand::Reg(XMM0),
                ))?;
                // Unordered-aware condition codes.
                let cc = match op {
                    BinOp::Lt => Cond::B,
                    BinOp::Le => Cond::Be,
                    BinOp::Gt => Cond::A,
                    BinOp::Ge => Cond::Ae,
                    BinOp::Eq => Cond::E,
                    _ => Cond::Ne,
                };
                self.materialize_comparison(cc)
            }
            _ => Err(CodegenError::Unsupported {
                what: format!("float operator {:?}", op),
                line: lhs.line,
            }),
        }
    }

    /// Evaluate a float-context operand into xmm0, converting integers.
    fn gen_float_operand(&mut self, node: &Node, wide: bool) -> CodegenResult<()> {
        self.gen_expr(node)?;
        let ty = self.expr_type(node);
        if !ty.is_float() {
            let op = if wide { Op::Cvtsi2sd } else { Op::Cvtsi2ss };
            let src = self.acc().with_size(self.width_of(&ty));
            self.emit(Inst::new2(op, Operand::Reg(src), Operand::Reg(XMM0)))?;
        } else if wide && self.type_size(&ty) == 4 {
            self.emit(Inst::new2(Op::Cvtss2sd, Operand::Reg(XMM0), Operand::Reg(XMM0)))?;
        }
        Ok(())
    }

    /// Short-circuit `&&` / `||` materializing 0/1.
    fn gen_logical(&mut self, op: BinOp, lhs: &Node, rhs: &Node) -> CodegenResult<()> {
        let acc = self.acc();
        let acc32 = acc.with_size(Size::Dword);
        let short = self.new_label(".Lsc");
        let done = self.new_label(".Lsc");
        let jump_if_true = op == BinOp::LogOr;
        self.gen_branch(lhs, &short, jump_if_true)?;
        self.gen_branch(rhs, &short, jump_if_true)?;
        // Both operands fell through.
        let fall = if jump_if_true { 0 } else { 1 };
        if fall == 0 {
            self.emit(Inst::new2(Op::Xor, Operand::Reg(acc32), Operand::Reg(acc32)))?;
        } else {
            self.emit(Inst::new2(Op::Mov, Operand::Imm(1), Operand::Reg(acc32)))?;
        }
        self.emit(Inst::new1(Op::Jmp, Operand::label(done.clone())))?;
        self.emit_label(&short)?;
        if jump_if_true {
            self.emit(Inst::new2(Op::Mov, Operand::Imm(1), Operand::Reg(acc32)))?;
        } else {
            self.emit(Inst::new2(Op::Xor, Operand::Reg(acc32), Operand::Reg(acc32)))?;
        }
        self.emit_label(&done)?;
        Ok(())
    }

    /// Ternary: cmov form for simple scalar arms at -O2 without debug
    /// info, branching form otherwise.
    fn gen_ternary(
        &mut self,
        cond: &Node,
        then: &Node,
        els: &Node,
        node: &Node,
    ) -> CodegenResult<()> {
        let acc = self.acc();
        let use_cmov = self.opts.opt.gate() >= 2
            && !self.opts.debug_info
            && self.is_64()
            && self.is_simple(then)
            && self.is_simple(els)
            && !self.is_float_expr(then)
            && !self.is_float_expr(els)
            && !self.is_float_expr(cond);
        if use_cmov {
            self.gen_expr(cond)?;
            self.emit(Inst::new2(Op::Mov, Operand::Reg(acc), Operand::Reg(R10)))?;
            self.gen_expr(then)?;
            self.emit(Inst::new2(Op::Mov, Operand::Reg(acc), Operand::Reg(R11)))?;
            self.gen_expr(els)?;
            self.emit(Inst::new2(Op::Test, Operand::Reg(R10), Operand::Reg(R10)))?;
            self.emit(Inst::new2(Op::Cmovcc(Cond::Ne), Operand::Reg(R11), Operand::Reg(acc)))?;
            self.invalidate_acc();
            return Ok(());
        }

        let else_label = self.new_label(".Lte");
        let end_label = self.new_label(".Lte");
        self.gen_branch(cond, &else_label, false)?;
        self.pgo_count_site(&format!("then{}", node.line))?;
        self.gen_expr(then)?;
        self.emit(Inst::new1(Op::Jmp, Operand::label(end_label.clone())))?;
        self.emit_label(&else_label)?;
        self.pgo_count_site(&format!("else{}", node.line))?;
        self.gen_expr(els)?;
        self.emit_label(&end_label)?;
        Ok(())
    }

    // ---- calls -------------------------------------------------------

    fn gen_call(&mut self, func: &str, args: &[Node], node: &Node) -> CodegenResult<()> {
        if !self.is_64() {
            return self.gen_call_32(func, args);
        }

        let windows = self.target == crate::target::Target::WindowsX64;
        let int_regs = self.target.int_arg_regs().to_vec();
        let float_count = self.target.float_arg_count();
        let sret = self.returns_via_sret(node.ty.as_ref());
        let sret_offset = if sret {
            let size = self.type_size(node.ty.as_ref().unwrap());
            Some(self.alloc_stack(size)?)
        } else {
            None
        };

        // Assign every argument to a register or the stack up front.
        #[derive(Clone, Copy)]
        enum Slot {
            Int(Reg),
            Xmm(u8),
            Stack,
        }
        let mut assignment = Vec::with_capacity(args.len());
        let mut position = usize::from(sret);
        let mut int_slot = position;
        let mut float_slot = 0usize;
        let mut xmm_used = 0usize;
        for arg in args {
            let is_float = self.is_float_expr(arg);
            let slot = if windows {
                let p = position;
                position += 1;
                if p >= int_regs.len() {
                    Slot::Stack
                } else if is_float {
                    Slot::Xmm(p as u8)
                } else {
                    Slot::Int(int_regs[p])
                }
            } else if is_float {
                if float_slot < float_count {
                    float_slot += 1;
                    Slot::Xmm((float_slot - 1) as u8)
                } else {
                    Slot::Stack
                }
            } else if int_slot < int_regs.len() {
                int_slot += 1;
                Slot::Int(int_regs[int_slot - 1])
            } else {
                Slot::Stack
            };
            if matches!(slot, Slot::Xmm(_)) {
                xmm_used += 1;
            }
            assignment.push(slot);
        }
        let overflow = assignment
            .iter()
            .filter(|s| matches!(s, Slot::Stack))
            .count() as i32;

        // Pad so the stack is 16-byte aligned at the call, counting the
        // overflow arguments and shadow space that will sit below it.
        let pad = self.call_padding(8 * overflow);
        if pad != 0 {
            let sp = self.sp();
            self.f.stack_offset -= pad;
            self.emit(Inst::new2(Op::Sub, Operand::Imm(pad as i64), Operand::Reg(sp)))?;
        }

        // Evaluate and push in reverse order, the overflow block first so
        // it ends up contiguous beneath the register arguments; floats
        // spill through xmm0.
        let push_arg = |this: &mut Self, arg: &Node| -> CodegenResult<()> {
            if this.is_float_expr(arg) {
                this.gen_expr(arg)?;
                if this.type_size(&this.expr_type(arg)) == 4 {
                    this.emit(Inst::new2(Op::Cvtss2sd, Operand::Reg(XMM0), Operand::Reg(XMM0)))?;
                }
                this.push_xmm()
            } else {
                this.gen_expr(arg)?;
                this.push_acc()
            }
        };
        for (arg, slot) in args.iter().zip(assignment.iter()).rev() {
            if matches!(slot, Slot::Stack) {
                push_arg(self, arg)?;
            }
        }
        for (arg, slot) in args.iter().zip(assignment.iter()).rev() {
            if !matches!(slot, Slot::Stack) {
                push_arg(self, arg)?;
            }
        }

        // Pop into the designated registers; stack arguments stay put.
        let sp = self.sp();
        for slot in assignment.iter() {
            match slot {
                Slot::Int(reg) => self.pop_reg(*reg)?,
                Slot::Xmm(id) => {
                    self.f.stack_offset += 8;
                    self.emit(Inst::new2(
                        Op::Movsd,
                        Operand::mem(sp, 0),
                        Operand::Reg(Reg::xmm(*id)),
                    ))?;
                    self.emit(Inst::new2(Op::Add, Operand::Imm(8), Operand::Reg(sp)))?;
                }
                Slot::Stack => {}
            }
        }

        if let Some(offset) = sret_offset {
            self.emit(Inst::new2(
                Op::Lea,
                Operand::mem(RBP, offset),
                Operand::Reg(int_regs[0]),
            ))?;
        }
        if self.target == crate::target::Target::LinuxX64 {
            // AL carries the XMM argument count for variadic callees.
            self.emit(Inst::new2(Op::Mov, Operand::Imm(xmm_used as i64), Operand::Reg(EAX)))?;
        }
        let shadow = self.target.shadow_space() as i64;
        if shadow != 0 {
            self.f.stack_offset -= shadow as i32;
            self.emit(Inst::new2(Op::Sub, Operand::Imm(shadow), Operand::Reg(sp)))?;
        }
        self.emit(Inst::new1(Op::Call, Operand::label(func)))?;
        self.invalidate_acc();

        // Pop shadow space, overflow arguments, and the alignment pad;
        // any sret buffer stays until frame teardown.
        let unwind = shadow + 8 * overflow as i64 + pad as i64;
        if unwind != 0 {
            self.f.stack_offset += unwind as i32;
            self.emit(Inst::new2(Op::Add, Operand::Imm(unwind), Operand::Reg(sp)))?;
        }
        Ok(())
    }

    fn gen_call_32(&mut self, func: &str, args: &[Node]) -> CodegenResult<()> {
        let mut pushed = 0i64;
        for arg in args.iter().rev() {
            self.gen_expr(arg)?;
            if self.is_float_expr(arg) {
                self.push_xmm()?;
                pushed += 8;
            } else {
                self.push_acc()?;
                pushed += 4;
            }
        }
        self.emit(Inst::new1(Op::Call, Operand::label(func)))?;
        self.invalidate_acc();
        if pushed != 0 {
            self.f.stack_offset += pushed as i32;
            self.emit(Inst::new2(Op::Add, Operand::Imm(pushed), Operand::Reg(ESP)))?;
        }
        Ok(())
    }

    /// Marshal arguments for a tail call; returns false when the shape
    /// does not qualify.
    pub(crate) fn try_tail_call(&mut self, call: &Node) -> CodegenResult<bool> {
        let (func, args) = match &call.kind {
            NodeKind::Call { func, args } => (func, args),
            _ => return Ok(false),
        };
        if !self.is_64() || self.opts.opt.gate() < 2 || self.opts.debug_info {
            return Ok(false);
        }
        // Either side using a struct return disqualifies the rewrite.
        if self.returns_via_sret(self.f.ret_ty.as_ref()) || self.returns_via_sret(call.ty.as_ref())
        {
            return Ok(false);
        }
        // The return value must come back in the same register class.
        let caller_float = self.f.ret_ty.as_ref().map(|t| t.is_float()).unwrap_or(false);
        let callee_float = call.ty.as_ref().map(|t| t.is_float()).unwrap_or(false);
        if caller_float != callee_float {
            return Ok(false);
        }
        let int_regs = self.target.int_arg_regs().to_vec();
        let any_float = args.iter().any(|a| self.is_float_expr(a));
        if any_float || args.len() > int_regs.len() {
            return Ok(false);
        }

        log::trace!("tail call to `{}` from `{}`", func, self.f.name);
        for arg in args.iter().rev() {
            self.gen_expr(arg)?;
            self.push_acc()?;
        }
        for reg in int_regs.iter().take(args.len()) {
            self.pop_reg(*reg)?;
        }
        self.restore_callee_saved()?;
        self.emit(Inst::new0(Op::Leave))?;
        self.emit(Inst::new1(Op::Jmp, Operand::label(func.as_str())))?;
        self.invalidate_acc();
        Ok(true)
    }
}

fn comparison_cond(op: BinOp) -> Cond {
    match op {
        BinOp::Lt => Cond::L,
        BinOp::Le => Cond::Le,
        BinOp::Gt => Cond::G,
        BinOp::Ge => Cond::Ge,
        BinOp::Eq => Cond::E,
        _ => Cond::Ne,
    }
}
