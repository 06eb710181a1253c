//! AST to 3-address-code lowering.
//!
//! Variables become virtual registers through a name -> vreg map;
//! address-taken locals get an ALLOCA and explicit loads/stores.
//! Short-circuit `&&`/`||` lower to branches writing a result variable
//! that SSA construction later merges with a phi.

use std::collections::HashSet;

use crate::ast::{BinOp, Node, NodeKind, UnaryOp};
use crate::error::{CodegenError, CodegenResult};

use super::cfg;
use super::{BlockId, Extra, Inst, IrFunction, Opcode, VReg, Value};

#[derive(Debug, Clone)]
struct VarSlot {
    name: String,
    vreg: VReg,
    alloca: bool,
}

struct Lower {
    func: IrFunction,
    cur: BlockId,
    vars: Vec<VarSlot>,
    addr_taken: HashSet<String>,
    /// (continue target, break target)
    loops: Vec<(BlockId, BlockId)>,
    temp_count: u32,
}

/// Collect names whose address is taken anywhere in the function.
fn collect_addr_taken(node: &Node, out: &mut HashSet<String>) {
    if let NodeKind::Unary {
        op: UnaryOp::AddrOf,
        expr,
    } = &node.kind
    {
        if let NodeKind::Ident(name) = &expr.kind {
            out.insert(name.clone());
        }
    }
    for_each_child(node, |child| collect_addr_taken(child, out));
}

fn for_each_child<'a>(node: &'a Node, mut f: impl FnMut(&'a Node)) {
    match &node.kind {
        NodeKind::Unary { expr, .. } | NodeKind::Cast(expr) | NodeKind::Assert(expr) => f(expr),
        NodeKind::Binary { lhs, rhs, .. } | NodeKind::Assign { lhs, rhs } => {
            f(lhs);
            f(rhs);
        }
        NodeKind::Index { base, index } => {
            f(base);
            f(index);
        }
        NodeKind::Member { base, .. } => f(base),
        NodeKind::Call { args, .. } => args.iter().for_each(f),
        NodeKind::InitList(items) | NodeKind::Block(items) => items.iter().for_each(f),
        NodeKind::If { cond, then, els } => {
            f(cond);
            f(then);
            if let Some(els) = els {
                f(els);
            }
        }
        NodeKind::While { cond, body, .. } => {
            f(cond);
            f(body);
        }
        NodeKind::For {
            init,
            cond,
            step,
            body,
        } => {
            for n in [init, cond, step].into_iter().flatten() {
                f(n);
            }
            f(body);
        }
        NodeKind::Switch { cond, body } => {
            f(cond);
            f(body);
        }
        NodeKind::Return(Some(expr)) => f(expr),
        NodeKind::VarDecl {
            init: Some(init), ..
        } => f(init),
        NodeKind::Function { body, .. } => f(body),
        _ => {}
    }
}

impl Lower {
    fn emit(&mut self, inst: Inst) {
        self.func.blocks[self.cur].insts.push(inst);
    }

    fn terminated(&self) -> bool {
        self.func.blocks[self.cur]
            .insts
            .last()
            .map(|inst| inst.op.is_terminator())
            .unwrap_or(false)
    }

    fn jump_to(&mut self, target: BlockId) {
        if !self.terminated() {
            let mut inst = Inst::new(Opcode::Jump, None, None, None);
            inst.extra = Extra::Target(target);
            self.emit(inst);
        }
    }

    fn branch(&mut self, cond: Value, on_true: BlockId, on_false: BlockId) {
        let mut inst = Inst::new(Opcode::Branch, None, Some(cond), None);
        inst.extra = Extra::Branch { on_true, on_false };
        self.emit(inst);
    }

    fn switch_to(&mut self, block: BlockId) {
        self.cur = block;
    }

    fn declare(&mut self, name: &str) -> VarSlot {
        let alloca = self.addr_taken.contains(name);
        let vreg = self.func.new_vreg();
        if alloca {
            self.emit(Inst::new(Opcode::Alloca, Some(vreg), None, None));
        }
        let slot = VarSlot {
            name: name.to_string(),
            vreg,
            alloca,
        };
        self.vars.push(slot.clone());
        self.func.var_names.push(name.to_string());
        slot
    }

    fn declare_temp(&mut self) -> VarSlot {
        let name = format!("$t{}", self.temp_count);
        self.temp_count += 1;
        self.declare(&name)
    }

    fn lookup(&self, name: &str) -> Option<VarSlot> {
        self.vars.iter().rev().find(|v| v.name == name).cloned()
    }

    fn write_var(&mut self, slot: &VarSlot, value: Value, line: u32) {
        let mut inst = if slot.alloca {
            Inst::new(
                Opcode::Store,
                None,
                Some(Value::Vreg(slot.vreg)),
                Some(value),
            )
        } else {
            Inst::new(Opcode::Copy, Some(slot.vreg), Some(value), None)
        };
        inst.line = line;
        self.emit(inst);
    }

    fn read_var(&mut self, slot: &VarSlot, line: u32) -> Value {
        if slot.alloca {
            let dst = self.func.new_vreg();
            let mut inst = Inst::new(Opcode::Load, Some(dst), Some(Value::Vreg(slot.vreg)), None);
            inst.line = line;
            self.emit(inst);
            Value::Vreg(dst)
        } else {
            Value::Vreg(slot.vreg)
        }
    }

    // ---- expressions -------------------------------------------------

    fn lower_expr(&mut self, node: &Node) -> CodegenResult<Value> {
        match &node.kind {
            NodeKind::IntLit(v) => Ok(Value::Const(*v)),
            NodeKind::Ident(name) => {
                let slot = self.lookup(name).ok_or_else(|| CodegenError::Unsupported {
                    what: format!("unknown identifier `{}` in IR lowering", name),
                    line: node.line,
                })?;
                Ok(self.read_var(&slot, node.line))
            }
            NodeKind::Unary { op, expr } => self.lower_unary(*op, expr, node.line),
            NodeKind::Cast(inner) => {
                let value = self.lower_expr(inner)?;
                let dst = self.func.new_vreg();
                self.emit(Inst::new(Opcode::Cast, Some(dst), Some(value), None));
                Ok(Value::Vreg(dst))
            }
            NodeKind::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs, node.line),
            NodeKind::Assign { lhs, rhs } => self.lower_assign(lhs, rhs, node.line),
            NodeKind::Index { base, index } => {
                let addr = self.lower_index_addr(base, index, node.line)?;
                let dst = self.func.new_vreg();
                self.emit(Inst::new(Opcode::Load, Some(dst), Some(addr), None));
                Ok(Value::Vreg(dst))
            }
            NodeKind::Member {
                base,
                member,
                arrow: true,
            } => {
                let offset = base
                    .ty
                    .as_ref()
                    .and_then(|ty| ty.pointee())
                    .and_then(|agg| agg.member(member))
                    .map(|m| m.offset)
                    .ok_or_else(|| CodegenError::Unsupported {
                        what: format!("member `{}` in IR lowering", member),
                        line: node.line,
                    })?;
                let base_value = self.lower_expr(base)?;
                let addr = self.func.new_vreg();
                let mut inst = Inst::new(Opcode::Member, Some(addr), Some(base_value), None);
                inst.extra = Extra::Offset(offset);
                self.emit(inst);
                let dst = self.func.new_vreg();
                self.emit(Inst::new(Opcode::Load, Some(dst), Some(Value::Vreg(addr)), None));
                Ok(Value::Vreg(dst))
            }
            NodeKind::Call { func, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.lower_expr(arg)?);
                }
                let dst = self.func.new_vreg();
                let mut inst = Inst::new(Opcode::Call, Some(dst), None, None);
                inst.extra = Extra::Call {
                    name: func.clone(),
                    args: values,
                };
                inst.line = node.line;
                self.emit(inst);
                Ok(Value::Vreg(dst))
            }
            _ => Err(CodegenError::Unsupported {
                what: "expression kind in IR lowering".into(),
                line: node.line,
            }),
        }
    }

    fn lower_unary(&mut self, op: UnaryOp, expr: &Node, line: u32) -> CodegenResult<Value> {
        match op {
            UnaryOp::AddrOf => {
                if let NodeKind::Ident(name) = &expr.kind {
                    if let Some(slot) = self.lookup(name) {
                        if slot.alloca {
                            return Ok(Value::Vreg(slot.vreg));
                        }
                        return Err(CodegenError::Internal(format!(
                            "address of non-alloca `{}`",
                            name
                        )));
                    }
                    // A global: AddrOf carries the symbol name.
                    let dst = self.func.new_vreg();
                    let mut inst = Inst::new(Opcode::AddrOf, Some(dst), None, None);
                    inst.extra = Extra::Name(name.clone());
                    self.emit(inst);
                    return Ok(Value::Vreg(dst));
                }
                Err(CodegenError::Unsupported {
                    what: "address of a non-identifier in IR lowering".into(),
                    line,
                })
            }
            UnaryOp::Deref => {
                let addr = self.lower_expr(expr)?;
                let dst = self.func.new_vreg();
                self.emit(Inst::new(Opcode::Load, Some(dst), Some(addr), None));
                Ok(Value::Vreg(dst))
            }
            UnaryOp::Neg | UnaryOp::Not | UnaryOp::BitNot => {
                let value = self.lower_expr(expr)?;
                let opcode = match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Not => Opcode::Not,
                    _ => Opcode::BitNot,
                };
                let dst = self.func.new_vreg();
                self.emit(Inst::new(opcode, Some(dst), Some(value), None));
                Ok(Value::Vreg(dst))
            }
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                let slot = match &expr.kind {
                    NodeKind::Ident(name) => {
                        self.lookup(name).ok_or_else(|| CodegenError::Unsupported {
                            what: format!("unknown identifier `{}`", name),
                            line,
                        })?
                    }
                    _ => {
                        return Err(CodegenError::Unsupported {
                            what: "increment of a non-identifier in IR lowering".into(),
                            line,
                        })
                    }
                };
                let old = self.read_var(&slot, line);
                let opcode = if matches!(op, UnaryOp::PreInc | UnaryOp::PostInc) {
                    Opcode::Add
                } else {
                    Opcode::Sub
                };
                let updated = self.func.new_vreg();
                self.emit(Inst::new(
                    opcode,
                    Some(updated),
                    Some(old),
                    Some(Value::Const(1)),
                ));
                self.write_var(&slot, Value::Vreg(updated), line);
                Ok(if matches!(op, UnaryOp::PreInc | UnaryOp::PreDec) {
                    Value::Vreg(updated)
                } else {
                    old
                })
            }
        }
    }

    fn lower_binary(
        &mut self,
        op: BinOp,
        lhs: &Node,
        rhs: &Node,
        line: u32,
    ) -> CodegenResult<Value> {
        if matches!(op, BinOp::LogAnd | BinOp::LogOr) {
            return self.lower_short_circuit(op, lhs, rhs, line);
        }
        if op == BinOp::Comma {
            self.lower_expr(lhs)?;
            return self.lower_expr(rhs);
        }
        let a = self.lower_expr(lhs)?;
        let b = self.lower_expr(rhs)?;
        let opcode = match op {
            BinOp::Add => Opcode::Add,
            BinOp::Sub => Opcode::Sub,
            BinOp::Mul => Opcode::Mul,
            BinOp::Div => Opcode::Div,
            BinOp::Mod => Opcode::Mod,
            BinOp::And => Opcode::And,
            BinOp::Or => Opcode::Or,
            BinOp::Xor => Opcode::Xor,
            BinOp::Shl => Opcode::Shl,
            BinOp::Shr => Opcode::Shr,
            BinOp::Lt => Opcode::CmpLt,
            BinOp::Le => Opcode::CmpLe,
            BinOp::Gt => Opcode::CmpGt,
            BinOp::Ge => Opcode::CmpGe,
            BinOp::Eq => Opcode::CmpEq,
            BinOp::Ne => Opcode::CmpNe,
            BinOp::LogAnd | BinOp::LogOr | BinOp::Comma => unreachable!(),
        };
        let dst = self.func.new_vreg();
        let mut inst = Inst::new(opcode, Some(dst), Some(a), Some(b));
        inst.line = line;
        self.emit(inst);
        Ok(Value::Vreg(dst))
    }

    /// Short-circuit evaluation writes a result variable in each arm;
    /// SSA construction merges the arms with a phi.
    fn lower_short_circuit(
        &mut self,
        op: BinOp,
        lhs: &Node,
        rhs: &Node,
        line: u32,
    ) -> CodegenResult<Value> {
        let result = self.declare_temp();
        let rhs_block = self.func.new_block();
        let short_block = self.func.new_block();
        let join_block = self.func.new_block();

        let a = self.lower_expr(lhs)?;
        if op == BinOp::LogAnd {
            self.branch(a, rhs_block, short_block);
        } else {
            self.branch(a, short_block, rhs_block);
        }

        self.switch_to(rhs_block);
        let b = self.lower_expr(rhs)?;
        let normalized = self.func.new_vreg();
        self.emit(Inst::new(
            Opcode::CmpNe,
            Some(normalized),
            Some(b),
            Some(Value::Const(0)),
        ));
        self.write_var(&result, Value::Vreg(normalized), line);
        self.jump_to(join_block);

        self.switch_to(short_block);
        let short_value = if op == BinOp::LogAnd { 0 } else { 1 };
        self.write_var(&result, Value::Const(short_value), line);
        self.jump_to(join_block);

        self.switch_to(join_block);
        Ok(self.read_var(&result, line))
    }

    fn lower_assign(&mut self, lhs: &Node, rhs: &Node, line: u32) -> CodegenResult<Value> {
        match &lhs.kind {
            NodeKind::Ident(name) => {
                let slot = self.lookup(name).ok_or_else(|| CodegenError::Unsupported {
                    what: format!("unknown identifier `{}`", name),
                    line,
                })?;
                let value = self.lower_expr(rhs)?;
                self.write_var(&slot, value, line);
                Ok(value)
            }
            NodeKind::Unary {
                op: UnaryOp::Deref,
                expr,
            } => {
                let addr = self.lower_expr(expr)?;
                let value = self.lower_expr(rhs)?;
                let mut inst = Inst::new(Opcode::Store, None, Some(addr), Some(value));
                inst.line = line;
                self.emit(inst);
                Ok(value)
            }
            NodeKind::Index { base, index } => {
                let addr = self.lower_index_addr(base, index, line)?;
                let value = self.lower_expr(rhs)?;
                let mut inst = Inst::new(Opcode::Store, None, Some(addr), Some(value));
                inst.line = line;
                self.emit(inst);
                Ok(value)
            }
            _ => Err(CodegenError::Unsupported {
                what: "assignment target in IR lowering".into(),
                line,
            }),
        }
    }

    fn lower_index_addr(
        &mut self,
        base: &Node,
        index: &Node,
        line: u32,
    ) -> CodegenResult<Value> {
        let base_value = self.lower_expr(base)?;
        let index_value = self.lower_expr(index)?;
        let dst = self.func.new_vreg();
        let mut inst = Inst::new(
            Opcode::IndexAddr,
            Some(dst),
            Some(base_value),
            Some(index_value),
        );
        inst.line = line;
        self.emit(inst);
        Ok(Value::Vreg(dst))
    }

    // ---- statements --------------------------------------------------

    fn lower_stmt(&mut self, node: &Node) -> CodegenResult<()> {
        match &node.kind {
            NodeKind::Block(children) => {
                let scope = self.vars.len();
                for child in children {
                    self.lower_stmt(child)?;
                }
                self.vars.truncate(scope);
                Ok(())
            }
            NodeKind::VarDecl { name, init, .. } => {
                let slot = self.declare(name);
                if let Some(init) = init {
                    let value = self.lower_expr(init)?;
                    self.write_var(&slot, value, node.line);
                }
                Ok(())
            }
            NodeKind::If { cond, then, els } => {
                let cond_value = self.lower_expr(cond)?;
                let then_block = self.func.new_block();
                let join_block = self.func.new_block();
                let else_block = if els.is_some() {
                    self.func.new_block()
                } else {
                    join_block
                };
                self.branch(cond_value, then_block, else_block);
                self.switch_to(then_block);
                self.lower_stmt(then)?;
                self.jump_to(join_block);
                if let Some(els) = els {
                    self.switch_to(else_block);
                    self.lower_stmt(els)?;
                    self.jump_to(join_block);
                }
                self.switch_to(join_block);
                Ok(())
            }
            NodeKind::While {
                cond,
                body,
                do_while,
            } => {
                let head = self.func.new_block();
                let body_block = self.func.new_block();
                let exit = self.func.new_block();
                self.jump_to(if *do_while { body_block } else { head });
                self.switch_to(head);
                let cond_value = self.lower_expr(cond)?;
                self.branch(cond_value, body_block, exit);
                self.switch_to(body_block);
                self.loops.push((head, exit));
                self.lower_stmt(body)?;
                self.loops.pop();
                self.jump_to(head);
                self.switch_to(exit);
                Ok(())
            }
            NodeKind::For {
                init,
                cond,
                step,
                body,
            } => {
                let scope = self.vars.len();
                if let Some(init) = init {
                    self.lower_stmt(init)?;
                }
                let head = self.func.new_block();
                let body_block = self.func.new_block();
                let step_block = self.func.new_block();
                let exit = self.func.new_block();
                self.jump_to(head);
                self.switch_to(head);
                match cond {
                    Some(cond) => {
                        let v = self.lower_expr(cond)?;
                        self.branch(v, body_block, exit);
                    }
                    None => self.jump_to(body_block),
                }
                self.switch_to(body_block);
                self.loops.push((step_block, exit));
                self.lower_stmt(body)?;
                self.loops.pop();
                self.jump_to(step_block);
                self.switch_to(step_block);
                if let Some(step) = step {
                    self.lower_expr(step)?;
                }
                self.jump_to(head);
                self.switch_to(exit);
                self.vars.truncate(scope);
                Ok(())
            }
            NodeKind::Return(expr) => {
                let value = match expr {
                    Some(expr) => Some(self.lower_expr(expr)?),
                    None => None,
                };
                let mut inst = Inst::new(Opcode::Ret, None, value, None);
                inst.line = node.line;
                self.emit(inst);
                // Anything after a return starts a fresh (likely dead)
                // block so the terminator invariant holds.
                let dead = self.func.new_block();
                self.switch_to(dead);
                Ok(())
            }
            NodeKind::Break => {
                let (_, exit) =
                    *self
                        .loops
                        .last()
                        .ok_or_else(|| CodegenError::Unsupported {
                            what: "break outside of a loop".into(),
                            line: node.line,
                        })?;
                self.jump_to(exit);
                let dead = self.func.new_block();
                self.switch_to(dead);
                Ok(())
            }
            NodeKind::Continue => {
                let (head, _) =
                    *self
                        .loops
                        .last()
                        .ok_or_else(|| CodegenError::Unsupported {
                            what: "continue outside of a loop".into(),
                            line: node.line,
                        })?;
                self.jump_to(head);
                let dead = self.func.new_block();
                self.switch_to(dead);
                Ok(())
            }
            _ => {
                self.lower_expr(node)?;
                Ok(())
            }
        }
    }
}

/// Lower one AST function into an `IrFunction` with a built CFG.
pub fn lower_function(node: &Node) -> CodegenResult<IrFunction> {
    let (name, params, body) = match &node.kind {
        NodeKind::Function {
            name, params, body, ..
        } => (name.clone(), params, body),
        _ => {
            return Err(CodegenError::Internal(
                "lower_function expects a function node".into(),
            ))
        }
    };
    let mut addr_taken = HashSet::new();
    collect_addr_taken(body, &mut addr_taken);

    let mut lower = Lower {
        func: IrFunction {
            name,
            ..IrFunction::default()
        },
        cur: 0,
        vars: Vec::new(),
        addr_taken,
        loops: Vec::new(),
        temp_count: 0,
    };
    lower.func.new_block();

    for (index, param) in params.iter().enumerate() {
        if let NodeKind::VarDecl { name, .. } = &param.kind {
            lower
                .func
                .params
                .push((name.clone(), param.type_or_int()));
            let slot = lower.declare(name);
            let dst = lower.func.new_vreg();
            let mut inst = Inst::new(Opcode::Param, Some(dst), None, None);
            inst.extra = Extra::Index(index as u32);
            lower.emit(inst);
            lower.write_var(&slot, Value::Vreg(dst), param.line);
        }
    }

    lower.lower_stmt(body)?;
    if !lower.terminated() {
        lower.emit(Inst::new(Opcode::Ret, None, None, None));
    }
    // Dead blocks created after returns still need terminators.
    for block in &mut lower.func.blocks {
        if block
            .insts
            .last()
            .map(|inst| !inst.op.is_terminator())
            .unwrap_or(true)
        {
            block.insts.push(Inst::new(Opcode::Ret, None, None, None));
        }
    }

    let mut func = lower.func;
    cfg::build_cfg(&mut func);
    debug_assert!(func.validate_terminators());
    Ok(func)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, Node, NodeKind};

    fn int(v: i64) -> Node {
        Node::new(NodeKind::IntLit(v), 1)
    }

    fn func_node(body: Vec<Node>) -> Node {
        Node::new(
            NodeKind::Function {
                name: "f".into(),
                params: vec![],
                body: Box::new(Node::new(NodeKind::Block(body), 1)),
                is_static: false,
            },
            1,
        )
    }

    #[test]
    fn straight_line_lowering() {
        let body = vec![
            Node::new(
                NodeKind::VarDecl {
                    name: "x".into(),
                    is_static: false,
                    is_extern: false,
                    init: Some(Box::new(int(2))),
                },
                1,
            ),
            Node::new(NodeKind::Return(Some(Box::new(Node::new(
                NodeKind::Binary {
                    op: BinOp::Add,
                    lhs: Box::new(Node::new(NodeKind::Ident("x".into()), 2)),
                    rhs: Box::new(int(3)),
                },
                2,
            )))), 2),
        ];
        let f = lower_function(&func_node(body)).unwrap();
        assert!(f.validate_terminators());
        // copy x, add, ret
        let ops: Vec<_> = f.blocks[0].insts.iter().map(|i| i.op).collect();
        assert!(ops.contains(&Opcode::Copy));
        assert!(ops.contains(&Opcode::Add));
        assert_eq!(*ops.last().unwrap(), Opcode::Ret);
    }

    #[test]
    fn short_circuit_creates_branches() {
        let cond = Node::new(
            NodeKind::Binary {
                op: BinOp::LogAnd,
                lhs: Box::new(int(1)),
                rhs: Box::new(int(2)),
            },
            1,
        );
        let body = vec![Node::new(NodeKind::Return(Some(Box::new(cond))), 1)];
        let f = lower_function(&func_node(body)).unwrap();
        assert!(f.validate_terminators());
        assert!(f.blocks.len() >= 4);
        let has_branch = f
            .blocks
            .iter()
            .any(|b| b.insts.iter().any(|i| i.op == Opcode::Branch));
        assert!(has_branch);
    }

    #[test]
    fn address_taken_becomes_alloca() {
        let body = vec![
            Node::new(
                NodeKind::VarDecl {
                    name: "x".into(),
                    is_static: false,
                    is_extern: false,
                    init: Some(Box::new(int(1))),
                },
                1,
            ),
            Node::new(
                NodeKind::Unary {
                    op: UnaryOp::AddrOf,
                    expr: Box::new(Node::new(NodeKind::Ident("x".into()), 2)),
                },
                2,
            ),
        ];
        let f = lower_function(&func_node(body)).unwrap();
        let has_alloca = f
            .blocks
            .iter()
            .any(|b| b.insts.iter().any(|i| i.op == Opcode::Alloca));
        let has_store = f
            .blocks
            .iter()
            .any(|b| b.insts.iter().any(|i| i.op == Opcode::Store));
        assert!(has_alloca && has_store);
    }
}
