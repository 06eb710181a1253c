//! Bitsets and the classic dataflow analyses: def/use, liveness, and
//! reaching definitions.

use super::{IrFunction, Value};

/// A fixed-width bitset over virtual registers or definition sites.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new(bits: usize) -> BitSet {
        BitSet {
            words: vec![0; bits.div_ceil(64)],
        }
    }

    pub fn set(&mut self, bit: usize) {
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    pub fn clear(&mut self, bit: usize) {
        self.words[bit / 64] &= !(1 << (bit % 64));
    }

    pub fn get(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    /// `self |= other`; returns true if any bit changed.
    pub fn union_with(&mut self, other: &BitSet) -> bool {
        let mut changed = false;
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            let next = *w | o;
            changed |= next != *w;
            *w = next;
        }
        changed
    }

    /// `self |= other \ minus`; returns true if any bit changed.
    pub fn union_minus(&mut self, other: &BitSet, minus: &BitSet) -> bool {
        let mut changed = false;
        for ((w, o), m) in self
            .words
            .iter_mut()
            .zip(other.words.iter())
            .zip(minus.words.iter())
        {
            let next = *w | (o & !m);
            changed |= next != *w;
            *w = next;
        }
        changed
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            (0..64).filter_map(move |bit| {
                if word & (1 << bit) != 0 {
                    Some(i * 64 + bit)
                } else {
                    None
                }
            })
        })
    }
}

/// Per-block def and upward-exposed-use sets over vregs.
pub fn compute_def_use(func: &IrFunction) -> (Vec<BitSet>, Vec<BitSet>) {
    let n = func.vreg_count as usize;
    let mut defs = vec![BitSet::new(n); func.blocks.len()];
    let mut uses = vec![BitSet::new(n); func.blocks.len()];
    for block in &func.blocks {
        let def = &mut defs[block.id];
        let use_ = &mut uses[block.id];
        for inst in &block.insts {
            for value in inst.operands() {
                if let Value::Vreg(v) = value {
                    if !def.get(v as usize) {
                        use_.set(v as usize);
                    }
                }
            }
            if let Some(dst) = inst.dst {
                def.set(dst as usize);
            }
        }
    }
    (defs, uses)
}

/// Backward liveness to a fixed point over reverse postorder, storing the
/// results on the function.
pub fn compute_liveness(func: &mut IrFunction) {
    let (defs, uses) = compute_def_use(func);
    let n = func.vreg_count as usize;
    let count = func.blocks.len();
    let mut live_in = vec![BitSet::new(n); count];
    let mut live_out = vec![BitSet::new(n); count];

    let order: Vec<usize> = if func.rpo.is_empty() {
        (0..count).collect()
    } else {
        func.rpo.iter().rev().copied().collect()
    };
    let mut changed = true;
    while changed {
        changed = false;
        for &b in &order {
            let succs = func.blocks[b].succs.clone();
            for s in succs {
                let other = live_in[s].clone();
                changed |= live_out[b].union_with(&other);
            }
            let out = live_out[b].clone();
            changed |= live_in[b].union_with(&uses[b]);
            changed |= live_in[b].union_minus(&out, &defs[b]);
        }
    }
    func.live_in = live_in;
    func.live_out = live_out;
    log::trace!("liveness fixed point reached for `{}`", func.name);
}

/// A definition site: (block, instruction index, defined vreg).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefSite {
    pub block: usize,
    pub inst: usize,
    pub vreg: u32,
}

/// Forward reaching-definitions dataflow. Returns the definition sites
/// and per-block reach-in sets indexed by site.
pub fn compute_reaching_defs(func: &IrFunction) -> (Vec<DefSite>, Vec<BitSet>) {
    let mut sites = Vec::new();
    for block in &func.blocks {
        for (index, inst) in block.insts.iter().enumerate() {
            if let Some(dst) = inst.dst {
                sites.push(DefSite {
                    block: block.id,
                    inst: index,
                    vreg: dst,
                });
            }
        }
    }
    let ns = sites.len();
    let count = func.blocks.len();

    // gen/kill per block.
    let mut gen = vec![BitSet::new(ns); count];
    let mut kill = vec![BitSet::new(ns); count];
    for block in &func.blocks {
        for (site_index, site) in sites.iter().enumerate() {
            if site.block == block.id {
                gen[block.id].set(site_index);
                for (other_index, other) in sites.iter().enumerate() {
                    if other.vreg == site.vreg && other_index != site_index {
                        kill[block.id].set(other_index);
                    }
                }
            }
        }
        // Within a block, a later def of the same vreg kills the earlier.
        let mut last: Vec<(usize, u32)> = Vec::new();
        for (site_index, site) in sites.iter().enumerate() {
            if site.block == block.id {
                if let Some(&(prev, _)) = last.iter().find(|(_, v)| *v == site.vreg) {
                    gen[block.id].clear(prev);
                }
                last.retain(|(_, v)| *v != site.vreg);
                last.push((site_index, site.vreg));
            }
        }
    }

    let mut reach_in = vec![BitSet::new(ns); count];
    let mut reach_out = vec![BitSet::new(ns); count];
    let mut changed = true;
    while changed {
        changed = false;
        let order: Vec<usize> = if func.rpo.is_empty() {
            (0..count).collect()
        } else {
            func.rpo.clone()
        };
        for b in order {
            for &p in &func.blocks[b].preds {
                let other = reach_out[p].clone();
                changed |= reach_in[b].union_with(&other);
            }
            let in_set = reach_in[b].clone();
            changed |= reach_out[b].union_with(&gen[b]);
            changed |= reach_out[b].union_minus(&in_set, &kill[b]);
        }
    }
    (sites, reach_in)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitset_basics() {
        let mut s = BitSet::new(130);
        s.set(0);
        s.set(65);
        s.set(129);
        assert!(s.get(0) && s.get(65) && s.get(129));
        assert!(!s.get(64));
        assert_eq!(s.iter_set().collect::<Vec<_>>(), [0, 65, 129]);
        s.clear(65);
        assert!(!s.get(65));
    }

    #[test]
    fn union_with_reports_changes() {
        let mut a = BitSet::new(8);
        let mut b = BitSet::new(8);
        b.set(3);
        assert!(a.union_with(&b));
        assert!(!a.union_with(&b));
    }
}
