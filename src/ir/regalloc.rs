//! Linear-scan register allocation over live intervals.
//!
//! Intervals are computed from a linearized block order; they are
//! processed in increasing start order against a free pool of physical
//! registers, spilling the interval whose end lies furthest in the
//! future when the pool is exhausted.

use std::collections::HashMap;

use super::{IrFunction, VReg, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub vreg: VReg,
    pub start: u32,
    pub end: u32,
}

/// Compute live intervals from instruction positions in RPO block order.
pub fn compute_intervals(func: &IrFunction) -> Vec<Interval> {
    let order: Vec<usize> = if func.rpo.is_empty() {
        (0..func.blocks.len()).collect()
    } else {
        func.rpo.clone()
    };
    let mut position = 0u32;
    let mut intervals: HashMap<VReg, Interval> = HashMap::new();
    for &block in &order {
        for inst in &func.blocks[block].insts {
            for value in inst.operands() {
                if let Value::Vreg(v) = value {
                    let entry = intervals.entry(v).or_insert(Interval {
                        vreg: v,
                        start: position,
                        end: position,
                    });
                    entry.end = entry.end.max(position);
                }
            }
            if let Some(dst) = inst.dst {
                let entry = intervals.entry(dst).or_insert(Interval {
                    vreg: dst,
                    start: position,
                    end: position,
                });
                entry.start = entry.start.min(position);
                entry.end = entry.end.max(position);
            }
            position += 1;
        }
        // A vreg live out of the block stretches to the block boundary.
        if let Some(live_out) = func.live_out.get(block) {
            for v in live_out.iter_set() {
                if let Some(entry) = intervals.get_mut(&(v as VReg)) {
                    entry.end = entry.end.max(position);
                }
            }
        }
    }
    let mut out: Vec<Interval> = intervals.into_values().collect();
    out.sort_by_key(|interval| (interval.start, interval.vreg));
    out
}

/// Allocate `num_regs` physical registers; results are recorded on the
/// function.
pub fn linear_scan(func: &mut IrFunction, num_regs: u8) {
    let intervals = compute_intervals(func);
    let mut free: Vec<u8> = (0..num_regs).rev().collect();
    let mut active: Vec<Interval> = Vec::new();
    let mut assignment: HashMap<VReg, u8> = HashMap::new();
    let mut spills: HashMap<VReg, u32> = HashMap::new();
    let mut next_slot = 0u32;

    for interval in intervals {
        // Expire intervals that ended before this one starts.
        let mut index = 0;
        while index < active.len() {
            if active[index].end < interval.start {
                let expired = active.remove(index);
                if let Some(&reg) = assignment.get(&expired.vreg) {
                    free.push(reg);
                }
            } else {
                index += 1;
            }
        }

        if let Some(reg) = free.pop() {
            assignment.insert(interval.vreg, reg);
            active.push(interval);
        } else {
            // Spill the interval whose end is furthest in the future.
            let furthest = active
                .iter()
                .enumerate()
                .max_by_key(|(_, i)| i.end)
                .map(|(index, _)| index);
            match furthest {
                Some(index) if active[index].end > interval.end => {
                    let victim = active.remove(index);
                    let reg = assignment
                        .remove(&victim.vreg)
                        .expect("active interval has a register");
                    spills.insert(victim.vreg, next_slot);
                    next_slot += 1;
                    assignment.insert(interval.vreg, reg);
                    active.push(interval);
                }
                _ => {
                    spills.insert(interval.vreg, next_slot);
                    next_slot += 1;
                }
            }
        }
    }

    log::debug!(
        "`{}`: linear scan assigned {} vreg(s), spilled {}",
        func.name,
        assignment.len(),
        spills.len()
    );
    func.reg_assignment = assignment;
    func.spill_slots = spills;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{cfg, dataflow, Inst, Opcode};

    /// One block defining `count` overlapping vregs, all used at the end.
    fn overlapping(count: u32) -> IrFunction {
        let mut f = IrFunction::default();
        f.new_block();
        f.vreg_count = count;
        for v in 0..count {
            f.blocks[0].insts.push(Inst::new(
                Opcode::Const,
                Some(v),
                Some(Value::Const(v as i64)),
                None,
            ));
        }
        // A use of every vreg keeps all intervals open to the end.
        for v in 0..count {
            f.blocks[0].insts.push(Inst::new(
                Opcode::Copy,
                Some(f.vreg_count + v),
                Some(Value::Vreg(v)),
                None,
            ));
        }
        f.vreg_count *= 2;
        f.blocks[0].insts.push(Inst::new(Opcode::Ret, None, None, None));
        cfg::build_cfg(&mut f);
        dataflow::compute_liveness(&mut f);
        f
    }

    #[test]
    fn everything_fits_in_registers() {
        let mut f = overlapping(3);
        linear_scan(&mut f, 8);
        assert!(f.spill_slots.is_empty());
        // All three long intervals got distinct registers.
        let mut regs: Vec<u8> = (0..3).map(|v| f.reg_assignment[&v]).collect();
        regs.sort_unstable();
        regs.dedup();
        assert_eq!(regs.len(), 3);
    }

    #[test]
    fn exhaustion_spills_furthest_end() {
        let mut f = overlapping(6);
        linear_scan(&mut f, 2);
        assert!(!f.spill_slots.is_empty());
        // Everything is either assigned or spilled, never both.
        for v in 0..f.vreg_count {
            let assigned = f.reg_assignment.contains_key(&v);
            let spilled = f.spill_slots.contains_key(&v);
            assert!(!(assigned && spilled));
        }
    }

    #[test]
    fn intervals_are_sorted_by_start() {
        let f = overlapping(4);
        let intervals = compute_intervals(&f);
        for pair in intervals.windows(2) {
            assert!(pair[0].start <= pair[1].start);
        }
    }
}
