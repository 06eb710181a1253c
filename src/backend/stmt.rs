//! Statement code emission.

use crate::ast::{Node, NodeKind};
use crate::encoder::regs::*;
use crate::encoder::{Inst, Op, Operand, Size};
use crate::error::{CodegenError, CodegenResult};
use crate::obj::{SectionId, Storage};
use crate::types::CType;

use super::{AccCache, BackendSession, Home, LoopFrame, SwitchCase, SwitchCtx};

impl BackendSession {
    pub(crate) fn gen_stmt(&mut self, node: &Node) -> CodegenResult<()> {
        if self.opts.debug_info && node.line != 0 {
            let offset = self.obj.text.len() as u32;
            self.obj.add_debug_line(offset, node.line, true);
        }
        match &node.kind {
            NodeKind::Block(children) => {
                let saved_offset = self.f.stack_offset;
                let saved_locals = self.f.locals.len();
                for child in children {
                    self.gen_stmt(child)?;
                }
                self.f.locals.truncate(saved_locals);
                self.restore_stack_to(saved_offset)
            }
            NodeKind::If { cond, then, els } => self.gen_if(cond, then, els.as_deref(), node),
            NodeKind::While {
                cond,
                body,
                do_while,
            } => self.gen_while(cond, body, *do_while),
            NodeKind::For {
                init,
                cond,
                step,
                body,
            } => self.gen_for(node, init.as_deref(), cond.as_deref(), step.as_deref(), body),
            NodeKind::Switch { cond, body } => self.gen_switch(cond, body),
            NodeKind::Case(_) | NodeKind::Default => self.gen_case_label(),
            NodeKind::Break => self.gen_break(node.line),
            NodeKind::Continue => self.gen_continue(node.line),
            NodeKind::Goto(name) => {
                let label = self.goto_label(name);
                self.emit(Inst::new1(Op::Jmp, Operand::label(label)))?;
                self.invalidate_acc();
                Ok(())
            }
            NodeKind::LabelStmt(name) => {
                let label = self.goto_label(name);
                self.emit_label(&label)
            }
            NodeKind::Return(expr) => self.gen_return(expr.as_deref()),
            NodeKind::VarDecl { .. } => self.gen_local_decl(node),
            NodeKind::Assert(cond) => {
                let ok = self.new_label(".Lassert");
                self.gen_branch(cond, &ok, true)?;
                self.emit(Inst::new0(Op::Ud2))?;
                self.emit_label(&ok)
            }
            // Expression statement.
            _ => self.gen_expr(node),
        }
    }

    fn goto_label(&self, name: &str) -> String {
        format!(".Lgoto_{}_{}", self.f.name, name)
    }

    fn gen_if(
        &mut self,
        cond: &Node,
        then: &Node,
        els: Option<&Node>,
        node: &Node,
    ) -> CodegenResult<()> {
        let saved_offset = self.f.stack_offset;
        let else_label = self.new_label(".Lif");
        let end_label = self.new_label(".Lif");
        self.gen_branch(cond, &else_label, false)?;
        self.pgo_count_site(&format!("if{}_t", node.line))?;
        self.gen_stmt(then)?;
        self.restore_stack_to(saved_offset)?;
        match els {
            Some(els) => {
                self.emit(Inst::new1(Op::Jmp, Operand::label(end_label.clone())))?;
                self.emit_label(&else_label)?;
                self.pgo_count_site(&format!("if{}_f", node.line))?;
                self.gen_stmt(els)?;
                self.restore_stack_to(saved_offset)?;
                self.emit_label(&end_label)
            }
            None => self.emit_label(&else_label),
        }
    }

    fn push_loop(&mut self, break_label: &str, continue_label: Option<&str>) {
        self.f.loops.push(LoopFrame {
            break_label: break_label.to_string(),
            continue_label: continue_label.map(str::to_string),
            stack_offset: self.f.stack_offset,
            locals_len: self.f.locals.len(),
        });
    }

    fn pop_loop(&mut self) {
        let frame = self.f.loops.pop().expect("loop frame");
        self.f.locals.truncate(frame.locals_len);
    }

    fn gen_while(&mut self, cond: &Node, body: &Node, do_while: bool) -> CodegenResult<()> {
        let body_label = self.new_label(".Lloop");
        let cont_label = self.new_label(".Lloop");
        let end_label = self.new_label(".Lloop");
        self.push_loop(&end_label, Some(&cont_label));

        if do_while {
            self.emit_label(&body_label)?;
            self.gen_stmt(body)?;
            self.emit_label(&cont_label)?;
            self.gen_branch(cond, &body_label, true)?;
        } else if self.opts.opt.gate() >= 2 {
            // Loop rotation: test once on entry, then test at the bottom.
            self.gen_branch(cond, &end_label, false)?;
            self.emit_label(&body_label)?;
            self.gen_stmt(body)?;
            self.emit_label(&cont_label)?;
            self.gen_branch(cond, &body_label, true)?;
        } else {
            self.emit_label(&cont_label)?;
            self.gen_branch(cond, &end_label, false)?;
            self.gen_stmt(body)?;
            self.emit(Inst::new1(Op::Jmp, Operand::label(cont_label.clone())))?;
        }
        self.emit_label(&end_label)?;
        self.pop_loop();
        Ok(())
    }

    fn gen_for(
        &mut self,
        node: &Node,
        init: Option<&Node>,
        cond: Option<&Node>,
        step: Option<&Node>,
        body: &Node,
    ) -> CodegenResult<()> {
        // Annotated loops take the vectorized path.
        if let Some(info) = &node.vec_info {
            if self.opts.opt.gate() >= 2 && self.is_64() {
                return self.gen_vector_loop(info, node.line);
            }
        }

        let saved_offset = self.f.stack_offset;
        let saved_locals = self.f.locals.len();
        if let Some(init) = init {
            self.gen_stmt(init)?;
        }

        let body_label = self.new_label(".Lfor");
        let cont_label = self.new_label(".Lfor");
        let end_label = self.new_label(".Lfor");
        self.push_loop(&end_label, Some(&cont_label));

        if self.opts.opt.gate() >= 2 {
            if let Some(cond) = cond {
                self.gen_branch(cond, &end_label, false)?;
            }
            self.emit_label(&body_label)?;
            self.gen_stmt(body)?;
            self.emit_label(&cont_label)?;
            if let Some(step) = step {
                self.gen_expr(step)?;
            }
            match cond {
                Some(cond) => self.gen_branch(cond, &body_label, true)?,
                None => {
                    self.emit(Inst::new1(Op::Jmp, Operand::label(body_label.clone())))?;
                }
            }
        } else {
            let cond_label = self.new_label(".Lfor");
            self.emit_label(&cond_label)?;
            if let Some(cond) = cond {
                self.gen_branch(cond, &end_label, false)?;
            }
            self.gen_stmt(body)?;
            self.emit_label(&cont_label)?;
            if let Some(step) = step {
                self.gen_expr(step)?;
            }
            self.emit(Inst::new1(Op::Jmp, Operand::label(cond_label.clone())))?;
        }
        self.emit_label(&end_label)?;
        self.pop_loop();
        self.f.locals.truncate(saved_locals);
        self.restore_stack_to(saved_offset)
    }

    // ---- switch ------------------------------------------------------

    /// Walk a switch body collecting case/default nodes in source order;
    /// nested switches keep their own tables.
    fn collect_cases(&mut self, node: &Node, cases: &mut Vec<SwitchCase>, default: &mut bool) {
        match &node.kind {
            NodeKind::Case(value) => {
                let label = self.new_label(".Lcase");
                cases.push(SwitchCase {
                    label,
                    value: Some(*value),
                });
            }
            NodeKind::Default => {
                let label = self.new_label(".Lcase");
                cases.push(SwitchCase { label, value: None });
                *default = true;
            }
            NodeKind::Switch { .. } => {}
            NodeKind::Block(children) => {
                for child in children {
                    self.collect_cases(child, cases, default);
                }
            }
            NodeKind::If { then, els, .. } => {
                self.collect_cases(then, cases, default);
                if let Some(els) = els {
                    self.collect_cases(els, cases, default);
                }
            }
            NodeKind::While { body, .. } | NodeKind::For { body, .. } => {
                self.collect_cases(body, cases, default);
            }
            NodeKind::LabelStmt(_) => {}
            _ => {}
        }
    }

    fn gen_switch(&mut self, cond: &Node, body: &Node) -> CodegenResult<()> {
        let width = self.width_of(&self.expr_type(cond));
        self.gen_expr(cond)?;
        let acc = self.acc().with_size(width);

        let mut cases = Vec::new();
        let mut has_default = false;
        self.collect_cases(body, &mut cases, &mut has_default);
        let end_label = self.new_label(".Lsw_end");

        for case in &cases {
            if let Some(value) = case.value {
                self.emit(Inst::new2(Op::Cmp, Operand::Imm(value), Operand::Reg(acc)))?;
                self.emit(Inst::new1(
                    Op::Jcc(crate::encoder::Cond::E),
                    Operand::label(case.label.clone()),
                ))?;
            }
        }
        let default_target = cases
            .iter()
            .find(|c| c.value.is_none())
            .map(|c| c.label.clone())
            .unwrap_or_else(|| end_label.clone());
        self.emit(Inst::new1(Op::Jmp, Operand::label(default_target)))?;
        self.invalidate_acc();

        self.push_loop(&end_label, None);
        self.f.switches.push(SwitchCtx { cases, next: 0 });
        self.gen_stmt(body)?;
        self.f.switches.pop();
        self.emit_label(&end_label)?;
        self.pop_loop();
        Ok(())
    }

    /// A case/default statement site: re-emit the pre-collected label and
    /// reset the stack cursor to the switch-entry value.
    fn gen_case_label(&mut self) -> CodegenResult<()> {
        let (label, entry_offset) = {
            let frame = self.f.loops.last().ok_or_else(|| {
                CodegenError::Internal("case outside of a switch".into())
            })?;
            let entry = frame.stack_offset;
            let ctx = self
                .f
                .switches
                .last_mut()
                .ok_or_else(|| CodegenError::Internal("case outside of a switch".into()))?;
            let case = ctx
                .cases
                .get(ctx.next)
                .ok_or_else(|| CodegenError::Internal("case table exhausted".into()))?;
            ctx.next += 1;
            (case.label.clone(), entry)
        };
        self.f.stack_offset = entry_offset;
        self.emit_label(&label)
    }

    fn gen_break(&mut self, line: u32) -> CodegenResult<()> {
        let frame = self
            .f
            .loops
            .last()
            .cloned()
            .ok_or_else(|| CodegenError::Unsupported {
                what: "break outside of a loop or switch".into(),
                line,
            })?;
        self.restore_stack_for_jump(frame.stack_offset)?;
        self.emit(Inst::new1(Op::Jmp, Operand::label(frame.break_label)))?;
        self.invalidate_acc();
        Ok(())
    }

    fn gen_continue(&mut self, line: u32) -> CodegenResult<()> {
        let frame = self
            .f
            .loops
            .iter()
            .rev()
            .find(|f| f.continue_label.is_some())
            .cloned()
            .ok_or_else(|| CodegenError::Unsupported {
                what: "continue outside of a loop".into(),
                line,
            })?;
        self.restore_stack_for_jump(frame.stack_offset)?;
        let label = frame.continue_label.expect("checked above");
        self.emit(Inst::new1(Op::Jmp, Operand::label(label)))?;
        self.invalidate_acc();
        Ok(())
    }

    // ---- return ------------------------------------------------------

    fn gen_return(&mut self, expr: Option<&Node>) -> CodegenResult<()> {
        if let Some(expr) = expr {
            // `return f(...)` may become a tail jump.
            if matches!(expr.kind, NodeKind::Call { .. }) && self.try_tail_call(expr)? {
                return Ok(());
            }

            if self.returns_via_sret(self.f.ret_ty.as_ref()) {
                return self.gen_sret_return(expr);
            }

            self.gen_expr(expr)?;
            self.convert_return_value(expr)?;
        }
        self.restore_callee_saved()?;
        let end_label = self.f.end_label.clone();
        self.emit(Inst::new1(Op::Jmp, Operand::label(end_label)))?;
        self.invalidate_acc();
        Ok(())
    }

    /// Numeric conversion between the expression and the declared return
    /// type.
    fn convert_return_value(&mut self, expr: &Node) -> CodegenResult<()> {
        let Some(ret_ty) = self.f.ret_ty.clone() else {
            return Ok(());
        };
        let expr_ty = self.expr_type(expr);
        match (expr_ty.is_float(), ret_ty.is_float()) {
            (false, true) => {
                let op = if self.type_size(&ret_ty) == 4 {
                    Op::Cvtsi2ss
                } else {
                    Op::Cvtsi2sd
                };
                let src = self.acc().with_size(self.width_of(&expr_ty));
                self.emit(Inst::new2(op, Operand::Reg(src), Operand::Reg(XMM0)))?;
                self.invalidate_acc();
            }
            (true, false) => {
                let op = if self.type_size(&expr_ty) == 4 {
                    Op::Cvttss2si
                } else {
                    Op::Cvttsd2si
                };
                let dst = self.acc().with_size(self.width_of(&ret_ty));
                self.emit(Inst::new2(op, Operand::Reg(XMM0), Operand::Reg(dst)))?;
                self.invalidate_acc();
            }
            (true, true) => {
                let from = self.type_size(&expr_ty);
                let to = self.type_size(&ret_ty);
                if from == 4 && to == 8 {
                    self.emit(Inst::new2(Op::Cvtss2sd, Operand::Reg(XMM0), Operand::Reg(XMM0)))?;
                } else if from == 8 && to == 4 {
                    self.emit(Inst::new2(Op::Cvtsd2ss, Operand::Reg(XMM0), Operand::Reg(XMM0)))?;
                }
            }
            (false, false) => {}
        }
        Ok(())
    }

    /// Copy the returned aggregate into the hidden pointer saved at
    /// entry, then return that pointer.
    fn gen_sret_return(&mut self, expr: &Node) -> CodegenResult<()> {
        let ret_ty = self.f.ret_ty.clone().expect("sret implies a return type");
        let size = self.type_size(&ret_ty);
        let sret_offset = self
            .f
            .sret_offset
            .ok_or_else(|| CodegenError::Internal("missing sret slot".into()))?;

        self.gen_expr(expr)?; // aggregate value = address
        self.push_acc()?;
        let args = self.target.int_arg_regs().to_vec();
        let bp = self.bp();
        self.emit(Inst::new2(Op::Mov, Operand::mem(bp, sret_offset), Operand::Reg(args[0])))?;
        self.pop_reg(args[1])?;
        self.emit(Inst::new2(Op::Mov, Operand::Imm(size as i64), Operand::Reg(args[2])))?;
        let shadow = self.target.shadow_space() as i64;
        let pad = self.call_padding(0) as i64;
        let fixup = pad + shadow;
        let sp = self.sp();
        if fixup != 0 {
            self.f.stack_offset -= fixup as i32;
            self.emit(Inst::new2(Op::Sub, Operand::Imm(fixup), Operand::Reg(sp)))?;
        }
        if self.target == crate::target::Target::LinuxX64 {
            self.emit(Inst::new2(Op::Mov, Operand::Imm(0), Operand::Reg(EAX)))?;
        }
        self.emit(Inst::new1(Op::Call, Operand::label("memcpy")))?;
        if fixup != 0 {
            self.f.stack_offset += fixup as i32;
            self.emit(Inst::new2(Op::Add, Operand::Imm(fixup), Operand::Reg(sp)))?;
        }
        let acc = self.acc();
        self.emit(Inst::new2(Op::Mov, Operand::mem(bp, sret_offset), Operand::Reg(acc)))?;
        self.invalidate_acc();

        self.restore_callee_saved()?;
        let end_label = self.f.end_label.clone();
        self.emit(Inst::new1(Op::Jmp, Operand::label(end_label)))?;
        Ok(())
    }

    // ---- declarations ------------------------------------------------

    fn gen_local_decl(&mut self, node: &Node) -> CodegenResult<()> {
        let (name, is_static, is_extern, init) = match &node.kind {
            NodeKind::VarDecl {
                name,
                is_static,
                is_extern,
                init,
            } => (name.clone(), *is_static, *is_extern, init.as_deref()),
            _ => unreachable!(),
        };
        let ty = node.type_or_int();

        if is_extern {
            // Only the name table learns about externs.
            return self.add_local(&name, ty, Home::Label(name.clone()));
        }

        if is_static {
            let label = {
                let n = self.new_label("");
                format!("_S_{}_{}_{}", self.f.name, name, n)
            };
            self.data_align_for(&ty);
            self.obj
                .define_label(&label, SectionId::Data, Storage::Static);
            self.emit_static_init(&ty, init, node.line)?;
            return self.add_local(&name, ty, Home::Label(label));
        }

        // Promoted scalars live in a callee-saved register.
        if let Some(rv) = self.f.reg_vars.iter().find(|rv| rv.name == name).cloned() {
            self.add_local(&name, ty.clone(), Home::Reg(rv.reg))?;
            if let Some(init) = init {
                self.gen_expr(init)?;
                let width = self.width_of(&ty);
                let acc = self.acc().with_size(width);
                self.emit(Inst::new2(Op::Mov, Operand::Reg(acc), Operand::Reg(rv.reg.with_size(width))))?;
                self.f.acc = AccCache::Reg(rv.reg.id);
                self.f.acc_size = self.type_size(&ty);
            }
            if self.opts.debug_info {
                self.obj.add_debug_var(
                    &name,
                    0,
                    false,
                    ty.debug_kind(),
                    self.type_size(&ty),
                    ty.type_name(),
                );
            }
            return Ok(());
        }

        let size = if ty.is_aggregate() {
            self.type_size(&ty)
        } else {
            // Scalars consume at least one slot; doubles still need all 8
            // bytes on the 32-bit target.
            self.type_size(&ty).max(self.slot_size() as u32)
        };
        let offset = self.alloc_stack(size)?;
        self.add_local(&name, ty.clone(), Home::Stack(offset))?;
        if self.opts.debug_info {
            self.obj.add_debug_var(
                &name,
                offset,
                false,
                ty.debug_kind(),
                self.type_size(&ty),
                ty.type_name(),
            );
        }

        match init {
            None => Ok(()),
            Some(init) if matches!(init.kind, NodeKind::InitList(_)) => {
                self.gen_init_list(&ty, init, offset)
            }
            Some(init) => {
                if let NodeKind::StrLit(s) = &init.kind {
                    if matches!(&*ty, CType::Array(elem, _) if elem.size_for(true) == 1) {
                        return self.gen_char_array_init(&ty, s.clone(), offset);
                    }
                }
                self.gen_expr(init)?;
                let bp = self.bp();
                self.store_scalar(&ty, Operand::mem(bp, offset))?;
                // Sub-word stores truncate, so only word-or-wider slots
                // stay cached.
                if !ty.is_float() && self.type_size(&ty) >= 4 {
                    self.f.acc = AccCache::Stack(offset);
                    self.f.acc_size = self.type_size(&ty);
                } else {
                    self.invalidate_acc();
                }
                Ok(())
            }
        }
    }

    fn data_align_for(&mut self, ty: &CType) {
        let align = self.type_size(ty).clamp(1, 8) as usize;
        self.obj.data.align_to(align.next_power_of_two());
    }

    /// Static-local initializers are compile-time constants written
    /// straight to the data section.
    fn emit_static_init(
        &mut self,
        ty: &std::rc::Rc<CType>,
        init: Option<&Node>,
        line: u32,
    ) -> CodegenResult<()> {
        match init {
            None => {
                for _ in 0..self.type_size(ty).max(1) {
                    self.obj.data.write_u8(0);
                }
                Ok(())
            }
            Some(node) => {
                if let Some(value) = self.const_eval(node) {
                    let folded = Node::with_type(NodeKind::IntLit(value), ty.clone(), line);
                    return self.emit_global_init(ty, &folded, line);
                }
                self.emit_global_init(ty, node, line)
            }
        }
    }

    /// Zero the slot, then store each element at its offset.
    fn gen_init_list(&mut self, ty: &CType, init: &Node, base_offset: i32) -> CodegenResult<()> {
        let NodeKind::InitList(elems) = &init.kind else {
            unreachable!()
        };
        let total = self.type_size(ty) as i32;
        let bp = self.bp();
        let slot = self.slot_size();
        let mut cleared = 0;
        while cleared < total {
            let inst = Inst::new2(Op::Mov, Operand::Imm(0), Operand::mem(bp, base_offset + cleared))
                .with_size(if slot == 8 { Size::Qword } else { Size::Dword });
            self.emit(inst)?;
            cleared += slot;
        }

        match ty {
            CType::Array(elem, _) => {
                let elem = elem.clone();
                let elem_size = self.type_size(&elem) as i32;
                for (index, value) in elems.iter().enumerate() {
                    self.gen_expr(value)?;
                    let offset = base_offset + index as i32 * elem_size;
                    self.store_scalar(&elem, Operand::mem(bp, offset))?;
                }
                self.invalidate_acc();
                Ok(())
            }
            CType::Struct { members, .. } => {
                let members = members.clone();
                for (member, value) in members.iter().zip(elems.iter()) {
                    self.gen_expr(value)?;
                    let offset = base_offset + member.offset as i32;
                    self.store_scalar(&member.ty, Operand::mem(bp, offset))?;
                }
                self.invalidate_acc();
                Ok(())
            }
            _ => Err(CodegenError::Unsupported {
                what: "initializer list for a scalar".into(),
                line: init.line,
            }),
        }
    }

    fn gen_char_array_init(
        &mut self,
        ty: &CType,
        value: String,
        base_offset: i32,
    ) -> CodegenResult<()> {
        let len = match ty {
            CType::Array(_, len) => *len,
            _ => unreachable!(),
        };
        let bp = self.bp();
        for (index, byte) in value
            .bytes()
            .chain(std::iter::once(0))
            .chain(std::iter::repeat(0))
            .take(len)
            .enumerate()
        {
            self.emit(
                Inst::new2(
                    Op::Mov,
                    Operand::Imm(byte as i64),
                    Operand::mem(bp, base_offset + index as i32),
                )
                .with_size(Size::Byte),
            )?;
        }
        self.invalidate_acc();
        Ok(())
    }
}
