//! Three-address IR with basic blocks, CFG edges, and SSA support.
//!
//! An independent mid-end: AST functions lower to numbered blocks of
//! 3-address instructions, each block ending in exactly one terminator.
//! Analyses and optimizations live in the sibling modules; the shipping
//! backend does not route through this layer.

use std::rc::Rc;

use crate::types::CType;

pub mod cfg;
pub mod dataflow;
pub mod lower;
pub mod opt;
pub mod regalloc;
pub mod ssa;

pub use dataflow::BitSet;

pub type BlockId = usize;
pub type VReg = u32;

/// An SSA-ish operand: a virtual register or an integer constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Vreg(VReg),
    Const(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Const,
    Copy,
    /// Stack slot for an address-taken local.
    Alloca,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,
    CmpEq,
    CmpNe,
    Neg,
    Not,
    BitNot,
    Load,
    Store,
    AddrOf,
    Member,
    Cast,
    Index,
    IndexAddr,
    Param,
    Call,
    Jump,
    Branch,
    Ret,
    Switch,
    Nop,
    Phi,
}

impl Opcode {
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::Branch | Opcode::Ret | Opcode::Switch)
    }

    /// Pure instructions have no side effects and depend only on their
    /// operands; they are candidates for GVN and LICM.
    pub fn is_pure(self) -> bool {
        matches!(
            self,
            Opcode::Const
                | Opcode::Copy
                | Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Shl
                | Opcode::Shr
                | Opcode::CmpLt
                | Opcode::CmpLe
                | Opcode::CmpGt
                | Opcode::CmpGe
                | Opcode::CmpEq
                | Opcode::CmpNe
                | Opcode::Neg
                | Opcode::Not
                | Opcode::BitNot
        )
    }
}

/// Opcode-specific payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Extra {
    #[default]
    None,
    /// Jump target.
    Target(BlockId),
    /// Branch: taken / fallthrough targets.
    Branch { on_true: BlockId, on_false: BlockId },
    /// Switch case table plus default target.
    Switch {
        cases: Vec<(i64, BlockId)>,
        default: BlockId,
    },
    /// Callee and arguments.
    Call { name: String, args: Vec<Value> },
    /// Member byte offset.
    Offset(u32),
    /// Parameter index.
    Index(u32),
    /// Referenced symbol (AddrOf of a global).
    Name(String),
    /// phi: merged variable slot and per-predecessor arguments.
    Phi {
        var: usize,
        args: Vec<(BlockId, Value)>,
    },
}

#[derive(Debug, Clone)]
pub struct Inst {
    pub op: Opcode,
    pub dst: Option<VReg>,
    pub a: Option<Value>,
    pub b: Option<Value>,
    pub line: u32,
    pub extra: Extra,
}

impl Inst {
    pub fn new(op: Opcode, dst: Option<VReg>, a: Option<Value>, b: Option<Value>) -> Inst {
        Inst {
            op,
            dst,
            a,
            b,
            line: 0,
            extra: Extra::None,
        }
    }

    /// Every value operand, including call arguments and phi inputs.
    pub fn operands(&self) -> Vec<Value> {
        let mut out = Vec::new();
        if let Some(a) = self.a {
            out.push(a);
        }
        if let Some(b) = self.b {
            out.push(b);
        }
        match &self.extra {
            Extra::Call { args, .. } => out.extend(args.iter().copied()),
            Extra::Phi { args, .. } => out.extend(args.iter().map(|(_, v)| *v)),
            _ => {}
        }
        out
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match &self.extra {
            Extra::Target(t) => vec![*t],
            Extra::Branch { on_true, on_false } => vec![*on_true, *on_false],
            Extra::Switch { cases, default } => {
                let mut out: Vec<BlockId> = cases.iter().map(|(_, b)| *b).collect();
                out.push(*default);
                out
            }
            _ => Vec::new(),
        }
    }
}

/// A basic block: instructions ending in exactly one terminator, plus
/// predecessor/successor edges and analysis bitsets.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub id: BlockId,
    pub label: Option<String>,
    pub insts: Vec<Inst>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
}

impl Block {
    pub fn terminator(&self) -> Option<&Inst> {
        self.insts.last().filter(|inst| inst.op.is_terminator())
    }
}

/// A natural loop discovered from a back edge.
#[derive(Debug, Clone)]
pub struct NaturalLoop {
    pub header: BlockId,
    pub back_edge_src: BlockId,
    pub body: Vec<BlockId>,
    pub depth: u32,
}

/// One function in IR form, with its analysis side-tables.
#[derive(Debug, Clone, Default)]
pub struct IrFunction {
    pub name: String,
    pub params: Vec<(String, Rc<CType>)>,
    pub blocks: Vec<Block>,
    pub vreg_count: u32,
    /// Variable names, indexed by the `var` slot used in phi nodes.
    pub var_names: Vec<String>,
    // Analysis results.
    pub rpo: Vec<BlockId>,
    pub idom: Vec<Option<BlockId>>,
    pub dom_frontiers: Vec<Vec<BlockId>>,
    pub loops: Vec<NaturalLoop>,
    pub live_in: Vec<BitSet>,
    pub live_out: Vec<BitSet>,
    /// Linear-scan results: vreg -> physical register id.
    pub reg_assignment: std::collections::HashMap<VReg, u8>,
    /// Linear-scan results: vreg -> spill slot index.
    pub spill_slots: std::collections::HashMap<VReg, u32>,
}

impl IrFunction {
    pub fn new_vreg(&mut self) -> VReg {
        let v = self.vreg_count;
        self.vreg_count += 1;
        v
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = self.blocks.len();
        self.blocks.push(Block {
            id,
            ..Block::default()
        });
        id
    }

    /// Check the terminator invariant: exactly the last instruction of
    /// every block is a terminator.
    pub fn validate_terminators(&self) -> bool {
        self.blocks.iter().all(|block| {
            let Some(last) = block.insts.last() else {
                return false;
            };
            last.op.is_terminator()
                && block
                    .insts
                    .iter()
                    .take(block.insts.len() - 1)
                    .all(|inst| !inst.op.is_terminator())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_invariant() {
        let mut f = IrFunction::default();
        let b = f.new_block();
        f.blocks[b]
            .insts
            .push(Inst::new(Opcode::Const, Some(0), Some(Value::Const(1)), None));
        assert!(!f.validate_terminators());
        f.blocks[b].insts.push(Inst::new(Opcode::Ret, None, None, None));
        assert!(f.validate_terminators());
    }

    #[test]
    fn successors_of_terminators() {
        let mut jump = Inst::new(Opcode::Jump, None, None, None);
        jump.extra = Extra::Target(3);
        assert_eq!(jump.successors(), [3]);

        let mut branch = Inst::new(Opcode::Branch, None, Some(Value::Vreg(0)), None);
        branch.extra = Extra::Branch {
            on_true: 1,
            on_false: 2,
        };
        assert_eq!(branch.successors(), [1, 2]);

        let mut sw = Inst::new(Opcode::Switch, None, Some(Value::Vreg(0)), None);
        sw.extra = Extra::Switch {
            cases: vec![(1, 4), (2, 5)],
            default: 6,
        };
        assert_eq!(sw.successors(), [4, 5, 6]);
    }
}
