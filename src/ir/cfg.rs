//! CFG construction, dominators, dominance frontiers, and natural-loop
//! detection.

use super::{BlockId, IrFunction, NaturalLoop};

/// Read every block's terminator and rebuild the predecessor/successor
/// edge arrays.
pub fn build_cfg(func: &mut IrFunction) {
    for block in &mut func.blocks {
        block.preds.clear();
        block.succs.clear();
    }
    let edges: Vec<(BlockId, Vec<BlockId>)> = func
        .blocks
        .iter()
        .map(|block| {
            let succs = block
                .terminator()
                .map(|t| t.successors())
                .unwrap_or_default();
            (block.id, succs)
        })
        .collect();
    for (from, succs) in edges {
        for to in succs {
            if !func.blocks[from].succs.contains(&to) {
                func.blocks[from].succs.push(to);
            }
            if !func.blocks[to].preds.contains(&from) {
                func.blocks[to].preds.push(from);
            }
        }
    }
    func.rpo = reverse_postorder(func);
}

fn reverse_postorder(func: &IrFunction) -> Vec<BlockId> {
    let mut visited = vec![false; func.blocks.len()];
    let mut postorder = Vec::with_capacity(func.blocks.len());
    // Iterative DFS from the entry block.
    let mut stack: Vec<(BlockId, usize)> = vec![(0, 0)];
    if func.blocks.is_empty() {
        return postorder;
    }
    visited[0] = true;
    loop {
        let Some(&(block, next)) = stack.last() else {
            break;
        };
        if next < func.blocks[block].succs.len() {
            stack.last_mut().expect("non-empty").1 += 1;
            let succ = func.blocks[block].succs[next];
            if !visited[succ] {
                visited[succ] = true;
                stack.push((succ, 0));
            }
        } else {
            postorder.push(block);
            stack.pop();
        }
    }
    postorder.reverse();
    postorder
}

/// Cooper-Harvey-Kennedy iterative dominator computation over reverse
/// postorder. Results land in `func.idom`.
pub fn compute_dominators(func: &mut IrFunction) {
    let count = func.blocks.len();
    let mut idom: Vec<Option<BlockId>> = vec![None; count];
    if count == 0 {
        func.idom = idom;
        return;
    }
    idom[0] = Some(0);

    // Position of each block in reverse postorder, for intersect().
    let mut rpo_index = vec![usize::MAX; count];
    for (index, &block) in func.rpo.iter().enumerate() {
        rpo_index[block] = index;
    }

    let intersect = |idom: &[Option<BlockId>], rpo_index: &[usize], a: BlockId, b: BlockId| {
        let mut finger1 = a;
        let mut finger2 = b;
        while finger1 != finger2 {
            while rpo_index[finger1] > rpo_index[finger2] {
                finger1 = idom[finger1].expect("processed dominator");
            }
            while rpo_index[finger2] > rpo_index[finger1] {
                finger2 = idom[finger2].expect("processed dominator");
            }
        }
        finger1
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &block in func.rpo.iter().skip(1) {
            let mut new_idom: Option<BlockId> = None;
            for &pred in &func.blocks[block].preds {
                if idom[pred].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(current) => intersect(&idom, &rpo_index, pred, current),
                });
            }
            if new_idom.is_some() && idom[block] != new_idom {
                idom[block] = new_idom;
                changed = true;
            }
        }
    }
    func.idom = idom;
}

/// Does `a` dominate `b`? Walk `b`'s dominator chain.
pub fn dominates(func: &IrFunction, a: BlockId, b: BlockId) -> bool {
    let mut current = b;
    loop {
        if current == a {
            return true;
        }
        match func.idom[current] {
            Some(parent) if parent != current => current = parent,
            _ => return false,
        }
    }
}

/// Dominance frontiers: walk each join block's predecessors up to the
/// immediate dominator.
pub fn compute_dom_frontiers(func: &mut IrFunction) {
    let count = func.blocks.len();
    let mut frontiers: Vec<Vec<BlockId>> = vec![Vec::new(); count];
    for block in 0..count {
        if func.blocks[block].preds.len() < 2 {
            continue;
        }
        let Some(idom) = func.idom[block] else {
            continue;
        };
        for &pred in &func.blocks[block].preds {
            let mut runner = pred;
            while runner != idom {
                if !frontiers[runner].contains(&block) {
                    frontiers[runner].push(block);
                }
                match func.idom[runner] {
                    Some(next) if next != runner => runner = next,
                    _ => break,
                }
            }
        }
    }
    func.dom_frontiers = frontiers;
}

/// Find back edges (src dominated by dst) and compute each natural
/// loop's body and nesting depth.
pub fn detect_loops(func: &mut IrFunction) {
    let mut loops = Vec::new();
    for block in 0..func.blocks.len() {
        for &succ in &func.blocks[block].succs {
            if dominates(func, succ, block) {
                // succ is the loop header.
                let mut body = vec![succ];
                let mut stack = vec![block];
                while let Some(current) = stack.pop() {
                    if body.contains(&current) {
                        continue;
                    }
                    body.push(current);
                    for &pred in &func.blocks[current].preds {
                        stack.push(pred);
                    }
                }
                body.sort_unstable();
                loops.push(NaturalLoop {
                    header: succ,
                    back_edge_src: block,
                    body,
                    depth: 0,
                });
            }
        }
    }
    // Nesting depth: number of other loops whose body contains this
    // loop's header.
    for index in 0..loops.len() {
        let header = loops[index].header;
        let depth = loops
            .iter()
            .enumerate()
            .filter(|(other, l)| *other != index && l.body.contains(&header))
            .count() as u32;
        loops[index].depth = depth;
    }
    log::debug!("`{}`: {} natural loop(s)", func.name, loops.len());
    func.loops = loops;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Extra, Inst, Opcode, Value};

    /// Build the diamond: 0 -> {1, 2} -> 3, with a back edge 3 -> 0.
    fn diamond_with_loop() -> IrFunction {
        let mut f = IrFunction::default();
        for _ in 0..4 {
            f.new_block();
        }
        let mut branch = Inst::new(Opcode::Branch, None, Some(Value::Const(1)), None);
        branch.extra = Extra::Branch {
            on_true: 1,
            on_false: 2,
        };
        f.blocks[0].insts.push(branch);
        for (block, target) in [(1usize, 3usize), (2, 3)] {
            let mut jump = Inst::new(Opcode::Jump, None, None, None);
            jump.extra = Extra::Target(target);
            f.blocks[block].insts.push(jump);
        }
        // Block 3 jumps back to the entry, forming the back edge.
        let mut jump = Inst::new(Opcode::Jump, None, None, None);
        jump.extra = Extra::Target(0);
        f.blocks[3].insts.push(jump);
        build_cfg(&mut f);
        f
    }

    #[test]
    fn cfg_edges() {
        let f = diamond_with_loop();
        assert_eq!(f.blocks[0].succs, [1, 2]);
        assert_eq!(f.blocks[3].preds, [1, 2]);
        assert_eq!(f.blocks[0].preds, [3]);
    }

    #[test]
    fn dominators_of_diamond() {
        let mut f = diamond_with_loop();
        compute_dominators(&mut f);
        assert_eq!(f.idom[0], Some(0));
        assert_eq!(f.idom[1], Some(0));
        assert_eq!(f.idom[2], Some(0));
        assert_eq!(f.idom[3], Some(0));
        assert!(dominates(&f, 0, 3));
        assert!(!dominates(&f, 1, 3));
    }

    #[test]
    fn frontiers_at_the_join() {
        let mut f = diamond_with_loop();
        compute_dominators(&mut f);
        compute_dom_frontiers(&mut f);
        assert_eq!(f.dom_frontiers[1], [3]);
        assert_eq!(f.dom_frontiers[2], [3]);
    }

    #[test]
    fn loop_detection() {
        let mut f = diamond_with_loop();
        compute_dominators(&mut f);
        detect_loops(&mut f);
        assert_eq!(f.loops.len(), 1);
        assert_eq!(f.loops[0].header, 0);
        assert_eq!(f.loops[0].back_edge_src, 3);
        assert_eq!(f.loops[0].body, [0, 1, 2, 3]);
    }
}
