//! Scalar optimizations over the IR: SCCP, GVN/CSE, and LICM.

use std::collections::{HashMap, HashSet, VecDeque};

use super::{cfg, BlockId, Extra, Inst, IrFunction, Opcode, VReg, Value};

// ---- SCCP ------------------------------------------------------------

/// The SCCP lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lattice {
    Undef,
    Const(i64),
    Over,
}

fn meet(a: Lattice, b: Lattice) -> Lattice {
    match (a, b) {
        (Lattice::Undef, x) | (x, Lattice::Undef) => x,
        (Lattice::Const(x), Lattice::Const(y)) if x == y => Lattice::Const(x),
        _ => Lattice::Over,
    }
}

fn fold(op: Opcode, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::Div if b != 0 => a.wrapping_div(b),
        Opcode::Mod if b != 0 => a.wrapping_rem(b),
        Opcode::And => a & b,
        Opcode::Or => a | b,
        Opcode::Xor => a ^ b,
        Opcode::Shl => a.wrapping_shl(b as u32 & 63),
        Opcode::Shr => a.wrapping_shr(b as u32 & 63),
        Opcode::CmpLt => (a < b) as i64,
        Opcode::CmpLe => (a <= b) as i64,
        Opcode::CmpGt => (a > b) as i64,
        Opcode::CmpGe => (a >= b) as i64,
        Opcode::CmpEq => (a == b) as i64,
        Opcode::CmpNe => (a != b) as i64,
        _ => return None,
    })
}

/// Sparse conditional constant propagation on SSA form.
///
/// Tracks executable CFG edges; when a branch guard becomes a constant,
/// only the taken edge is propagated and the branch is folded into an
/// unconditional jump afterwards.
pub fn sccp(func: &mut IrFunction) {
    let n = func.vreg_count as usize;
    let mut lattice = vec![Lattice::Undef; n];
    let mut exec_edges: HashSet<(BlockId, BlockId)> = HashSet::new();
    let mut block_seen = vec![false; func.blocks.len()];
    let mut edge_worklist: VecDeque<(Option<BlockId>, BlockId)> = VecDeque::new();
    edge_worklist.push_back((None, 0));

    let value_of = |lattice: &[Lattice], value: Value| match value {
        Value::Const(c) => Lattice::Const(c),
        Value::Vreg(v) => lattice[v as usize],
    };

    // Evaluate blocks as edges become executable; re-evaluate when a
    // lattice cell drops. Bounded by lattice height * program size.
    while let Some((from, to)) = edge_worklist.pop_front() {
        if let Some(from) = from {
            if !exec_edges.insert((from, to)) && block_seen[to] {
                continue;
            }
        }
        block_seen[to] = true;

        let mut changed_vregs: Vec<VReg> = Vec::new();
        let insts = func.blocks[to].insts.clone();
        for inst in &insts {
            let new_value = match inst.op {
                Opcode::Const => inst.a.map(|a| value_of(&lattice, a)),
                Opcode::Copy | Opcode::Cast => inst.a.map(|a| value_of(&lattice, a)),
                Opcode::Phi => {
                    let Extra::Phi { args, .. } = &inst.extra else {
                        continue;
                    };
                    let mut acc = Lattice::Undef;
                    for (pred, value) in args {
                        if exec_edges.contains(&(*pred, to)) {
                            acc = meet(acc, value_of(&lattice, *value));
                        }
                    }
                    Some(acc)
                }
                Opcode::Neg | Opcode::Not | Opcode::BitNot => {
                    inst.a.map(|a| match value_of(&lattice, a) {
                        Lattice::Const(v) => Lattice::Const(match inst.op {
                            Opcode::Neg => v.wrapping_neg(),
                            Opcode::Not => (v == 0) as i64,
                            _ => !v,
                        }),
                        other => other,
                    })
                }
                op if fold(op, 0, 1).is_some() || op.is_pure() => {
                    match (inst.a, inst.b) {
                        (Some(a), Some(b)) => {
                            match (value_of(&lattice, a), value_of(&lattice, b)) {
                                (Lattice::Const(x), Lattice::Const(y)) => {
                                    Some(match fold(op, x, y) {
                                        Some(v) => Lattice::Const(v),
                                        None => Lattice::Over,
                                    })
                                }
                                (Lattice::Undef, _) | (_, Lattice::Undef) => Some(Lattice::Undef),
                                _ => Some(Lattice::Over),
                            }
                        }
                        _ => Some(Lattice::Over),
                    }
                }
                _ => inst.dst.map(|_| Lattice::Over),
            };
            if let (Some(dst), Some(value)) = (inst.dst, new_value) {
                let merged = meet(lattice[dst as usize], value);
                if merged != lattice[dst as usize] {
                    lattice[dst as usize] = merged;
                    changed_vregs.push(dst);
                }
            }
        }

        // Propagate along the terminator.
        if let Some(term) = func.blocks[to].terminator() {
            match (&term.extra, term.a) {
                (Extra::Target(t), _) => edge_worklist.push_back((Some(to), *t)),
                (Extra::Branch { on_true, on_false }, Some(cond)) => {
                    match value_of(&lattice, cond) {
                        Lattice::Const(v) => {
                            let taken = if v != 0 { *on_true } else { *on_false };
                            edge_worklist.push_back((Some(to), taken));
                        }
                        _ => {
                            edge_worklist.push_back((Some(to), *on_true));
                            edge_worklist.push_back((Some(to), *on_false));
                        }
                    }
                }
                (Extra::Switch { cases, default }, Some(cond)) => {
                    match value_of(&lattice, cond) {
                        Lattice::Const(v) => {
                            let taken = cases
                                .iter()
                                .find(|(value, _)| *value == v)
                                .map(|(_, target)| *target)
                                .unwrap_or(*default);
                            edge_worklist.push_back((Some(to), taken));
                        }
                        _ => {
                            for (_, target) in cases {
                                edge_worklist.push_back((Some(to), *target));
                            }
                            edge_worklist.push_back((Some(to), *default));
                        }
                    }
                }
                _ => {}
            }
        }

        // Users of changed cells may live in already-seen blocks.
        if !changed_vregs.is_empty() {
            for block in 0..func.blocks.len() {
                if block_seen[block] && block != to {
                    edge_worklist.push_back((None, block));
                }
            }
        }
    }

    // Rewrite: constant defs become Const, constant uses are inlined,
    // and decided branches collapse to jumps.
    let mut folded_insts = 0usize;
    let mut folded_branches = 0usize;
    for block in 0..func.blocks.len() {
        for inst in func.blocks[block].insts.iter_mut() {
            if let Some(dst) = inst.dst {
                if let Lattice::Const(v) = lattice[dst as usize] {
                    if inst.op != Opcode::Const && inst.op.is_pure() || inst.op == Opcode::Phi {
                        *inst = Inst::new(
                            Opcode::Const,
                            Some(dst),
                            Some(Value::Const(v)),
                            None,
                        );
                        folded_insts += 1;
                        continue;
                    }
                }
            }
            let rewrite = |value: &mut Option<Value>| {
                if let Some(Value::Vreg(v)) = value {
                    if let Lattice::Const(c) = lattice[*v as usize] {
                        *value = Some(Value::Const(c));
                    }
                }
            };
            rewrite(&mut inst.a);
            rewrite(&mut inst.b);
        }
        let Some(last) = func.blocks[block].insts.last_mut() else {
            continue;
        };
        if last.op == Opcode::Branch {
            if let (Some(Value::Const(v)), Extra::Branch { on_true, on_false }) =
                (last.a, &last.extra)
            {
                let target = if v != 0 { *on_true } else { *on_false };
                *last = Inst::new(Opcode::Jump, None, None, None);
                last.extra = Extra::Target(target);
                folded_branches += 1;
            }
        }
    }
    if folded_insts + folded_branches > 0 {
        log::debug!(
            "`{}`: sccp folded {} instruction(s), {} branch(es)",
            func.name,
            folded_insts,
            folded_branches
        );
        cfg::build_cfg(func);
    }
}

// ---- GVN / CSE -------------------------------------------------------

type GvnKey = (Opcode, Value, Option<Value>);

/// Global value numbering over a dominator-tree walk: pure instructions
/// hash to (opcode, operand value numbers); redundant ones become
/// copies of the leader.
pub fn gvn(func: &mut IrFunction) {
    cfg::compute_dominators(func);
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); func.blocks.len()];
    for block in 0..func.blocks.len() {
        if let Some(idom) = func.idom[block] {
            if idom != block {
                children[idom].push(block);
            }
        }
    }
    let mut replaced = 0usize;
    let mut table: HashMap<GvnKey, VReg> = HashMap::new();
    let mut canon: HashMap<VReg, Value> = HashMap::new();
    walk_gvn(func, 0, &children, &mut table, &mut canon, &mut replaced);
    if replaced > 0 {
        log::debug!("`{}`: gvn replaced {} instruction(s)", func.name, replaced);
    }
}

fn value_key(value: Value) -> (u8, i64) {
    match value {
        Value::Const(c) => (0, c),
        Value::Vreg(v) => (1, v as i64),
    }
}

fn commutative(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::Add | Opcode::Mul | Opcode::And | Opcode::Or | Opcode::Xor
            | Opcode::CmpEq | Opcode::CmpNe
    )
}

fn walk_gvn(
    func: &mut IrFunction,
    block: usize,
    children: &[Vec<usize>],
    table: &mut HashMap<GvnKey, VReg>,
    canon: &mut HashMap<VReg, Value>,
    replaced: &mut usize,
) {
    let mut added: Vec<GvnKey> = Vec::new();
    let mut canon_added: Vec<VReg> = Vec::new();

    let count = func.blocks[block].insts.len();
    for index in 0..count {
        let inst = &mut func.blocks[block].insts[index];
        // Canonicalize operands through known copies first.
        let resolve = |canon: &HashMap<VReg, Value>, value: Value| match value {
            Value::Vreg(v) => canon.get(&v).copied().unwrap_or(value),
            c => c,
        };
        if let Some(a) = inst.a {
            inst.a = Some(resolve(canon, a));
        }
        if let Some(b) = inst.b {
            inst.b = Some(resolve(canon, b));
        }

        if !inst.op.is_pure() || inst.dst.is_none() {
            continue;
        }
        let dst = inst.dst.expect("checked");
        let (mut a, b) = match (inst.a, inst.b) {
            (Some(a), b) => (a, b),
            _ => continue,
        };
        let mut b_norm = b;
        if commutative(inst.op) {
            if let Some(bv) = b_norm {
                // Order operands deterministically for hashing.
                if value_key(bv) < value_key(a) {
                    b_norm = Some(a);
                    a = bv;
                }
            }
        }
        let key: GvnKey = (inst.op, a, b_norm);
        match table.get(&key) {
            Some(&leader) if leader != dst => {
                *inst = Inst::new(Opcode::Copy, Some(dst), Some(Value::Vreg(leader)), None);
                canon.insert(dst, Value::Vreg(leader));
                canon_added.push(dst);
                *replaced += 1;
            }
            Some(_) => {}
            None => {
                table.insert(key, dst);
                added.push(key);
            }
        }
    }

    let kids = children[block].clone();
    for child in kids {
        walk_gvn(func, child, children, table, canon, replaced);
    }
    for key in added {
        table.remove(&key);
    }
    for v in canon_added {
        canon.remove(&v);
    }
}

// ---- LICM ------------------------------------------------------------

/// Loop-invariant code motion: for each natural loop (innermost first),
/// move pure instructions whose operands are defined outside the loop to
/// the preheader, inserting one if it does not exist.
pub fn licm(func: &mut IrFunction) {
    cfg::compute_dominators(func);
    cfg::detect_loops(func);
    let mut loops = func.loops.clone();
    loops.sort_by(|a, b| b.depth.cmp(&a.depth));

    let mut moved_total = 0usize;
    for natural_loop in &loops {
        let header = natural_loop.header;
        let body: HashSet<usize> = natural_loop.body.iter().copied().collect();

        let preheader = ensure_preheader(func, header, &body);

        // Definition blocks, for the invariance test.
        let mut def_block: HashMap<VReg, usize> = HashMap::new();
        for block in &func.blocks {
            for inst in &block.insts {
                if let Some(dst) = inst.dst {
                    def_block.insert(dst, block.id);
                }
            }
        }

        let invariant = |def_block: &HashMap<VReg, usize>, value: Value| match value {
            Value::Const(_) => true,
            Value::Vreg(v) => def_block
                .get(&v)
                .map(|b| !body.contains(b))
                .unwrap_or(true),
        };

        let mut moved = true;
        while moved {
            moved = false;
            for &block in &natural_loop.body {
                let mut index = 0;
                while index < func.blocks[block].insts.len() {
                    let inst = &func.blocks[block].insts[index];
                    let hoistable = inst.op.is_pure()
                        && inst.op != Opcode::Phi
                        && inst.dst.is_some()
                        && inst
                            .operands()
                            .iter()
                            .all(|&v| invariant(&def_block, v));
                    if hoistable {
                        let inst = func.blocks[block].insts.remove(index);
                        if let Some(dst) = inst.dst {
                            def_block.insert(dst, preheader);
                        }
                        let at = func.blocks[preheader].insts.len() - 1;
                        func.blocks[preheader].insts.insert(at, inst);
                        moved = true;
                        moved_total += 1;
                    } else {
                        index += 1;
                    }
                }
            }
        }
    }
    if moved_total > 0 {
        log::debug!("`{}`: licm hoisted {} instruction(s)", func.name, moved_total);
        cfg::build_cfg(func);
    }
}

/// Find or create the loop preheader: the unique out-of-loop predecessor
/// of the header whose only successor is the header.
fn ensure_preheader(func: &mut IrFunction, header: BlockId, body: &HashSet<usize>) -> BlockId {
    let outside: Vec<BlockId> = func.blocks[header]
        .preds
        .iter()
        .copied()
        .filter(|p| !body.contains(p))
        .collect();
    if outside.len() == 1 && func.blocks[outside[0]].succs == [header] {
        return outside[0];
    }

    let pre = func.new_block();
    let mut jump = Inst::new(Opcode::Jump, None, None, None);
    jump.extra = Extra::Target(header);
    func.blocks[pre].insts.push(jump);

    // Redirect every outside predecessor's edge to the preheader.
    for pred in outside {
        if let Some(term) = func.blocks[pred].insts.last_mut() {
            retarget(term, header, pre);
        }
    }
    // Phi arguments from outside move to the preheader edge.
    for inst in func.blocks[header].insts.iter_mut() {
        if let Extra::Phi { args, .. } = &mut inst.extra {
            for (pred, _) in args.iter_mut() {
                if !body.contains(pred) {
                    *pred = pre;
                }
            }
        }
    }
    cfg::build_cfg(func);
    pre
}

fn retarget(term: &mut Inst, from: BlockId, to: BlockId) {
    match &mut term.extra {
        Extra::Target(t) => {
            if *t == from {
                *t = to;
            }
        }
        Extra::Branch { on_true, on_false } => {
            if *on_true == from {
                *on_true = to;
            }
            if *on_false == from {
                *on_false = to;
            }
        }
        Extra::Switch { cases, default } => {
            for (_, target) in cases.iter_mut() {
                if *target == from {
                    *target = to;
                }
            }
            if *default == from {
                *default = to;
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jump(target: BlockId) -> Inst {
        let mut inst = Inst::new(Opcode::Jump, None, None, None);
        inst.extra = Extra::Target(target);
        inst
    }

    /// 0: c = 1 + 2; branch c -> 1 else 2; 1: ret; 2: ret
    fn const_branch_function() -> IrFunction {
        let mut f = IrFunction::default();
        for _ in 0..3 {
            f.new_block();
        }
        f.vreg_count = 1;
        f.blocks[0].insts.push(Inst::new(
            Opcode::Add,
            Some(0),
            Some(Value::Const(1)),
            Some(Value::Const(2)),
        ));
        let mut branch = Inst::new(Opcode::Branch, None, Some(Value::Vreg(0)), None);
        branch.extra = Extra::Branch {
            on_true: 1,
            on_false: 2,
        };
        f.blocks[0].insts.push(branch);
        f.blocks[1].insts.push(Inst::new(Opcode::Ret, None, Some(Value::Vreg(0)), None));
        f.blocks[2]
            .insts
            .push(Inst::new(Opcode::Ret, None, Some(Value::Const(0)), None));
        cfg::build_cfg(&mut f);
        f
    }

    #[test]
    fn sccp_folds_constants_and_branches() {
        let mut f = const_branch_function();
        sccp(&mut f);
        // 1 + 2 became a constant...
        assert_eq!(f.blocks[0].insts[0].op, Opcode::Const);
        assert_eq!(f.blocks[0].insts[0].a, Some(Value::Const(3)));
        // ...and the branch on it became a jump to the true target.
        let term = f.blocks[0].terminator().unwrap();
        assert_eq!(term.op, Opcode::Jump);
        assert_eq!(term.extra, Extra::Target(1));
        // The constant was propagated into the return.
        assert_eq!(f.blocks[1].insts[0].a, Some(Value::Const(3)));
    }

    #[test]
    fn gvn_replaces_redundant_computation() {
        let mut f = IrFunction::default();
        f.new_block();
        f.vreg_count = 3;
        f.blocks[0].insts.push(Inst::new(
            Opcode::Add,
            Some(1),
            Some(Value::Vreg(0)),
            Some(Value::Const(4)),
        ));
        f.blocks[0].insts.push(Inst::new(
            Opcode::Add,
            Some(2),
            Some(Value::Vreg(0)),
            Some(Value::Const(4)),
        ));
        f.blocks[0].insts.push(Inst::new(Opcode::Ret, None, Some(Value::Vreg(2)), None));
        cfg::build_cfg(&mut f);
        gvn(&mut f);
        assert_eq!(f.blocks[0].insts[1].op, Opcode::Copy);
        assert_eq!(f.blocks[0].insts[1].a, Some(Value::Vreg(1)));
    }

    #[test]
    fn licm_hoists_invariant_computation() {
        // 0 -> 1 (header) -> {1 via 2, 3}
        let mut f = IrFunction::default();
        for _ in 0..4 {
            f.new_block();
        }
        f.vreg_count = 4;
        f.blocks[0].insts.push(jump(1));
        // Loop body computes an invariant value: v1 = 10 * 10.
        f.blocks[1].insts.push(Inst::new(
            Opcode::Mul,
            Some(1),
            Some(Value::Const(10)),
            Some(Value::Const(10)),
        ));
        let mut branch = Inst::new(Opcode::Branch, None, Some(Value::Vreg(0)), None);
        branch.extra = Extra::Branch {
            on_true: 2,
            on_false: 3,
        };
        f.blocks[1].insts.push(branch);
        f.blocks[2].insts.push(jump(1));
        f.blocks[3].insts.push(Inst::new(Opcode::Ret, None, None, None));
        cfg::build_cfg(&mut f);
        licm(&mut f);
        // The multiply left the loop; block 0 is the preheader.
        assert!(f.blocks[1].insts.iter().all(|i| i.op != Opcode::Mul));
        assert!(f.blocks[0].insts.iter().any(|i| i.op == Opcode::Mul));
    }
}
