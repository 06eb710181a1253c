//! Per-function promotion of frequently-used integer locals into
//! callee-saved registers.
//!
//! A single AST walk collects every declaration with its use count and
//! address-taken flag; the hottest eligible scalars get the callee-saved
//! pool (three registers on both backends).

use std::rc::Rc;

use crate::ast::{Node, NodeKind, UnaryOp};
use crate::encoder::Reg;
use crate::error::{CodegenError, CodegenResult};
use crate::types::CType;

use super::BackendSession;

const SCAN_LIMIT: usize = 8192;

#[derive(Debug, Clone)]
pub(crate) struct RegVar {
    pub name: String,
    pub reg: Reg,
    /// Frame offset of the prologue save slot.
    pub save_offset: i32,
}

#[derive(Debug)]
struct ScanVar {
    name: String,
    ty: Rc<CType>,
    uses: u32,
    addr_taken: bool,
    /// Declared more than once; promotion is conservatively refused.
    shadowed: bool,
}

fn note_decl(vars: &mut Vec<ScanVar>, name: &str, ty: Rc<CType>) -> CodegenResult<()> {
    if let Some(existing) = vars.iter_mut().find(|v| v.name == name) {
        existing.shadowed = true;
        return Ok(());
    }
    if vars.len() >= SCAN_LIMIT {
        return Err(CodegenError::LimitExceeded(format!(
            "more than {} locals in one function",
            SCAN_LIMIT
        )));
    }
    vars.push(ScanVar {
        name: name.to_string(),
        ty,
        uses: 0,
        addr_taken: false,
        shadowed: false,
    });
    Ok(())
}

fn walk(node: &Node, vars: &mut Vec<ScanVar>) -> CodegenResult<()> {
    match &node.kind {
        NodeKind::VarDecl { name, init, .. } => {
            note_decl(vars, name, node.type_or_int())?;
            if let Some(init) = init {
                walk(init, vars)?;
            }
        }
        NodeKind::Ident(name) => {
            if let Some(var) = vars.iter_mut().find(|v| v.name == *name) {
                var.uses += 1;
            }
        }
        NodeKind::Unary {
            op: UnaryOp::AddrOf,
            expr,
        } => {
            if let NodeKind::Ident(name) = &expr.kind {
                if let Some(var) = vars.iter_mut().find(|v| v.name == *name) {
                    var.addr_taken = true;
                }
            }
            walk(expr, vars)?;
        }
        NodeKind::Unary { expr, .. } | NodeKind::Cast(expr) | NodeKind::Assert(expr) => {
            walk(expr, vars)?;
        }
        NodeKind::Binary { lhs, rhs, .. } | NodeKind::Assign { lhs, rhs } => {
            walk(lhs, vars)?;
            walk(rhs, vars)?;
        }
        NodeKind::Index { base, index } => {
            walk(base, vars)?;
            walk(index, vars)?;
        }
        NodeKind::Member { base, .. } => walk(base, vars)?,
        NodeKind::Call { args, .. } => {
            for arg in args {
                walk(arg, vars)?;
            }
        }
        NodeKind::InitList(items) | NodeKind::Block(items) => {
            for item in items {
                walk(item, vars)?;
            }
        }
        NodeKind::If { cond, then, els } => {
            walk(cond, vars)?;
            walk(then, vars)?;
            if let Some(els) = els {
                walk(els, vars)?;
            }
        }
        NodeKind::While { cond, body, .. } => {
            walk(cond, vars)?;
            walk(body, vars)?;
        }
        NodeKind::For {
            init,
            cond,
            step,
            body,
        } => {
            for n in [init, cond, step].into_iter().flatten() {
                walk(n, vars)?;
            }
            walk(body, vars)?;
        }
        NodeKind::Switch { cond, body } => {
            walk(cond, vars)?;
            walk(body, vars)?;
        }
        NodeKind::Return(expr) => {
            if let Some(expr) = expr {
                walk(expr, vars)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn eligible(var: &ScanVar) -> bool {
    !var.addr_taken
        && !var.shadowed
        && var.uses > 0
        && var.ty.is_integer()
        && var.ty.size_for(true) <= 8
}

/// Scan a function and pick the promotion set.
pub(crate) fn scan_function(
    session: &BackendSession,
    params: &[Node],
    body: &Node,
) -> CodegenResult<Vec<RegVar>> {
    let mut vars = Vec::new();
    for param in params {
        if let NodeKind::VarDecl { name, .. } = &param.kind {
            note_decl(&mut vars, name, param.type_or_int())?;
        }
    }
    walk(body, &mut vars)?;

    let mut candidates: Vec<&ScanVar> = vars.iter().filter(|v| eligible(v)).collect();
    candidates.sort_by(|a, b| b.uses.cmp(&a.uses));

    let pool = session.target.callee_saved_pool();
    let slot = session.slot_size();
    let assigned: Vec<RegVar> = candidates
        .iter()
        .take(pool.len())
        .enumerate()
        .map(|(index, var)| RegVar {
            name: var.name.clone(),
            reg: pool[index],
            // Save slots are pushed right after the frame setup.
            save_offset: -(slot * (index as i32 + 1)),
        })
        .collect();
    for rv in &assigned {
        log::debug!(
            "promoting `{}` to {} in `{}`",
            rv.name,
            rv.reg,
            session.f.name
        );
    }
    Ok(assigned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinOp;
    use crate::backend::BackendSession;
    use crate::target::{CompileOpts, OptLevel, Target};

    fn ident(name: &str) -> Node {
        Node::new(NodeKind::Ident(name.into()), 1)
    }

    fn decl(name: &str) -> Node {
        Node::with_type(
            NodeKind::VarDecl {
                name: name.into(),
                is_static: false,
                is_extern: false,
                init: None,
            },
            Rc::new(CType::Int),
            1,
        )
    }

    fn uses(name: &str, count: usize) -> Vec<Node> {
        (0..count)
            .map(|_| {
                Node::new(
                    NodeKind::Binary {
                        op: BinOp::Add,
                        lhs: Box::new(ident(name)),
                        rhs: Box::new(Node::new(NodeKind::IntLit(1), 1)),
                    },
                    1,
                )
            })
            .collect()
    }

    fn session() -> BackendSession {
        let opts = CompileOpts {
            opt: OptLevel::O2,
            ..CompileOpts::default()
        };
        BackendSession::new(Target::LinuxX64, opts)
    }

    #[test]
    fn hottest_variables_win() {
        let mut body = vec![decl("a"), decl("b"), decl("c"), decl("d")];
        body.extend(uses("a", 1));
        body.extend(uses("b", 5));
        body.extend(uses("c", 3));
        body.extend(uses("d", 4));
        let body = Node::new(NodeKind::Block(body), 1);
        let assigned = scan_function(&session(), &[], &body).unwrap();
        let names: Vec<_> = assigned.iter().map(|rv| rv.name.as_str()).collect();
        assert_eq!(names, ["b", "d", "c"]);
        assert_eq!(assigned[0].save_offset, -8);
        assert_eq!(assigned[2].save_offset, -24);
    }

    #[test]
    fn address_taken_is_refused() {
        let body = Node::new(
            NodeKind::Block(vec![
                decl("a"),
                Node::new(
                    NodeKind::Unary {
                        op: UnaryOp::AddrOf,
                        expr: Box::new(ident("a")),
                    },
                    1,
                ),
                ident("a"),
            ]),
            1,
        );
        let assigned = scan_function(&session(), &[], &body).unwrap();
        assert!(assigned.is_empty());
    }

    #[test]
    fn shadowing_is_refused() {
        let body = Node::new(
            NodeKind::Block(vec![decl("a"), decl("a"), ident("a")]),
            1,
        );
        let assigned = scan_function(&session(), &[], &body).unwrap();
        assert!(assigned.is_empty());
    }

    #[test]
    fn floats_and_aggregates_are_refused() {
        let mut float_decl = decl("f");
        float_decl.ty = Some(Rc::new(CType::Double));
        let mut array_decl = decl("arr");
        array_decl.ty = Some(Rc::new(CType::Array(Rc::new(CType::Int), 4)));
        let body = Node::new(
            NodeKind::Block(vec![float_decl, array_decl, ident("f"), ident("arr")]),
            1,
        );
        let assigned = scan_function(&session(), &[], &body).unwrap();
        assert!(assigned.is_empty());
    }
}
