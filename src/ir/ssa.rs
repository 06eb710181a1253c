//! SSA construction: phi insertion at dominance frontiers and
//! stack-based renaming over the dominator tree.

use std::collections::HashMap;

use super::{cfg, Extra, Inst, IrFunction, Opcode, VReg, Value};

/// Convert to SSA form. Requires a built CFG; computes dominators and
/// frontiers itself.
pub fn construct(func: &mut IrFunction) {
    cfg::compute_dominators(func);
    cfg::compute_dom_frontiers(func);

    // Multiply-defined vregs are the variables to rename; single-def
    // vregs are already in SSA form.
    let mut def_count: HashMap<VReg, u32> = HashMap::new();
    let mut def_blocks: HashMap<VReg, Vec<usize>> = HashMap::new();
    for block in &func.blocks {
        for inst in &block.insts {
            if let Some(dst) = inst.dst {
                *def_count.entry(dst).or_insert(0) += 1;
                let blocks = def_blocks.entry(dst).or_default();
                if !blocks.contains(&block.id) {
                    blocks.push(block.id);
                }
            }
        }
    }
    let variables: Vec<VReg> = def_count
        .iter()
        .filter(|(_, &count)| count > 1)
        .map(|(&v, _)| v)
        .collect();

    // Insert phi nodes at each variable's iterated dominance frontier.
    for &var in &variables {
        let mut worklist = def_blocks[&var].clone();
        let mut has_phi = vec![false; func.blocks.len()];
        while let Some(block) = worklist.pop() {
            let frontier = func.dom_frontiers[block].clone();
            for join in frontier {
                if has_phi[join] {
                    continue;
                }
                has_phi[join] = true;
                let mut phi = Inst::new(Opcode::Phi, Some(var), None, None);
                phi.extra = Extra::Phi {
                    var: var as usize,
                    args: Vec::new(),
                };
                func.blocks[join].insts.insert(0, phi);
                if !def_blocks[&var].contains(&join) {
                    worklist.push(join);
                }
            }
        }
    }

    // Rename with a stack per variable down the dominator tree.
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); func.blocks.len()];
    for block in 0..func.blocks.len() {
        if let Some(idom) = func.idom[block] {
            if idom != block {
                children[idom].push(block);
            }
        }
    }
    let mut stacks: HashMap<VReg, Vec<VReg>> = variables.iter().map(|&v| (v, Vec::new())).collect();
    rename_block(func, 0, &children, &mut stacks);

    log::debug!(
        "`{}`: SSA construction renamed {} variable(s)",
        func.name,
        variables.len()
    );
}

fn current(stacks: &HashMap<VReg, Vec<VReg>>, var: VReg) -> VReg {
    stacks
        .get(&var)
        .and_then(|stack| stack.last().copied())
        .unwrap_or(var)
}

fn rename_block(
    func: &mut IrFunction,
    block: usize,
    children: &[Vec<usize>],
    stacks: &mut HashMap<VReg, Vec<VReg>>,
) {
    let mut pushed: Vec<VReg> = Vec::new();

    let count = func.blocks[block].insts.len();
    for index in 0..count {
        // Rewrite uses (phi arguments are filled from predecessors).
        let is_phi = func.blocks[block].insts[index].op == Opcode::Phi;
        if !is_phi {
            let mut inst = func.blocks[block].insts[index].clone();
            let rewrite = |value: &mut Option<Value>| {
                if let Some(Value::Vreg(v)) = value {
                    if stacks.contains_key(v) {
                        *value = Some(Value::Vreg(current(stacks, *v)));
                    }
                }
            };
            rewrite(&mut inst.a);
            rewrite(&mut inst.b);
            if let Extra::Call { args, .. } = &mut inst.extra {
                for arg in args.iter_mut() {
                    if let Value::Vreg(v) = arg {
                        if stacks.contains_key(v) {
                            *arg = Value::Vreg(current(stacks, *v));
                        }
                    }
                }
            }
            func.blocks[block].insts[index] = inst;
        }
        // Rewrite definitions.
        let dst = func.blocks[block].insts[index].dst;
        if let Some(dst) = dst {
            if stacks.contains_key(&dst) {
                let fresh = func.new_vreg();
                func.blocks[block].insts[index].dst = Some(fresh);
                stacks.get_mut(&dst).expect("variable stack").push(fresh);
                pushed.push(dst);
            }
        }
    }

    // Fill phi arguments in the successors.
    let succs = func.blocks[block].succs.clone();
    for succ in succs {
        for inst in func.blocks[succ].insts.iter_mut() {
            if inst.op != Opcode::Phi {
                break; // phis lead the block
            }
            if let Extra::Phi { var, args } = &mut inst.extra {
                let reaching = current(stacks, *var as VReg);
                args.push((block, Value::Vreg(reaching)));
            }
        }
    }

    for &child in &children[block] {
        rename_block(func, child, children, stacks);
    }

    for var in pushed {
        stacks.get_mut(&var).expect("variable stack").pop();
    }
}

/// Every vreg must have exactly one defining instruction; a phi counts
/// as a definition.
pub fn validate(func: &IrFunction) -> bool {
    let mut defs: HashMap<VReg, u32> = HashMap::new();
    for block in &func.blocks {
        for inst in &block.insts {
            if let Some(dst) = inst.dst {
                *defs.entry(dst).or_insert(0) += 1;
            }
        }
    }
    defs.values().all(|&count| count == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinOp, Node, NodeKind};
    use crate::ir::lower::lower_function;

    fn int(v: i64) -> Node {
        Node::new(NodeKind::IntLit(v), 1)
    }

    fn ident(name: &str) -> Node {
        Node::new(NodeKind::Ident(name.into()), 1)
    }

    /// int f(int n) { int s = 0; while (n) { s = s + n; n = n - 1; }
    /// return s; }
    fn loop_function() -> Node {
        let decl = Node::new(
            NodeKind::VarDecl {
                name: "s".into(),
                is_static: false,
                is_extern: false,
                init: Some(Box::new(int(0))),
            },
            1,
        );
        let body = Node::new(
            NodeKind::Block(vec![
                Node::new(
                    NodeKind::Assign {
                        lhs: Box::new(ident("s")),
                        rhs: Box::new(Node::new(
                            NodeKind::Binary {
                                op: BinOp::Add,
                                lhs: Box::new(ident("s")),
                                rhs: Box::new(ident("n")),
                            },
                            2,
                        )),
                    },
                    2,
                ),
                Node::new(
                    NodeKind::Assign {
                        lhs: Box::new(ident("n")),
                        rhs: Box::new(Node::new(
                            NodeKind::Binary {
                                op: BinOp::Sub,
                                lhs: Box::new(ident("n")),
                                rhs: Box::new(int(1)),
                            },
                            3,
                        )),
                    },
                    3,
                ),
            ]),
            2,
        );
        let while_stmt = Node::new(
            NodeKind::While {
                cond: Box::new(ident("n")),
                body: Box::new(body),
                do_while: false,
            },
            2,
        );
        let ret = Node::new(NodeKind::Return(Some(Box::new(ident("s")))), 4);
        let param = Node::new(
            NodeKind::VarDecl {
                name: "n".into(),
                is_static: false,
                is_extern: false,
                init: None,
            },
            1,
        );
        Node::new(
            NodeKind::Function {
                name: "f".into(),
                params: vec![param],
                body: Box::new(Node::new(NodeKind::Block(vec![decl, while_stmt, ret]), 1)),
                is_static: false,
            },
            1,
        )
    }

    #[test]
    fn loop_variables_get_phis() {
        let mut func = lower_function(&loop_function()).unwrap();
        construct(&mut func);
        let phi_count: usize = func
            .blocks
            .iter()
            .map(|b| b.insts.iter().filter(|i| i.op == Opcode::Phi).count())
            .sum();
        // Both `s` and `n` merge at the loop header.
        assert!(phi_count >= 2, "expected phis, found {}", phi_count);
        assert!(validate(&func), "SSA single-definition violated");
    }

    #[test]
    fn phi_args_match_predecessors() {
        let mut func = lower_function(&loop_function()).unwrap();
        construct(&mut func);
        for block in &func.blocks {
            for inst in &block.insts {
                if let Extra::Phi { args, .. } = &inst.extra {
                    assert_eq!(args.len(), block.preds.len());
                    for (pred, _) in args {
                        assert!(block.preds.contains(pred));
                    }
                }
            }
        }
    }

    #[test]
    fn straight_line_is_already_ssa() {
        let body = vec![Node::new(NodeKind::Return(Some(Box::new(int(5)))), 1)];
        let func_node = Node::new(
            NodeKind::Function {
                name: "g".into(),
                params: vec![],
                body: Box::new(Node::new(NodeKind::Block(body), 1)),
                is_static: false,
            },
            1,
        );
        let mut func = lower_function(&func_node).unwrap();
        construct(&mut func);
        assert!(validate(&func));
    }
}
