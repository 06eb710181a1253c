//! The typed AST handed to the backend by the front end.
//!
//! Nodes carry their resolved type, source line, and (on loops) the
//! vectorization metadata assigned by the AST optimizer.

use std::rc::Rc;

use crate::types::CType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    AddrOf,
    Deref,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
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
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    LogAnd,
    LogOr,
    Comma,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }
}

/// How an annotated loop is vectorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecMode {
    /// `dst[i] = src1[i] OP src2[i]`
    Elementwise,
    /// `accum += src1[i]`
    Reduction,
    /// `dst[i] = i * scale + offset`
    Init,
}

/// Vectorization metadata assigned to a loop by the AST optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct VecInfo {
    /// Lanes per iteration: 4 (SSE) or 8 (AVX).
    pub width: u32,
    pub elem_size: u32,
    pub is_float: bool,
    pub op: BinOp,
    /// Compile-time trip count.
    pub iterations: i64,
    pub dst: String,
    pub src1: String,
    pub src2: String,
    pub accum: Option<String>,
    pub init_scale: i64,
    pub init_offset: i64,
    pub mode: VecMode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    IntLit(i64),
    FloatLit(f64),
    StrLit(String),
    Ident(String),
    Unary {
        op: UnaryOp,
        expr: Box<Node>,
    },
    /// Target type lives in `Node::ty`.
    Cast(Box<Node>),
    Binary {
        op: BinOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Assign {
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Index {
        base: Box<Node>,
        index: Box<Node>,
    },
    Member {
        base: Box<Node>,
        member: String,
        arrow: bool,
    },
    Call {
        func: String,
        args: Vec<Node>,
    },
    InitList(Vec<Node>),
    Block(Vec<Node>),
    /// A non-null `els` makes this usable as a ternary expression.
    If {
        cond: Box<Node>,
        then: Box<Node>,
        els: Option<Box<Node>>,
    },
    While {
        cond: Box<Node>,
        body: Box<Node>,
        do_while: bool,
    },
    For {
        init: Option<Box<Node>>,
        cond: Option<Box<Node>>,
        step: Option<Box<Node>>,
        body: Box<Node>,
    },
    Switch {
        cond: Box<Node>,
        body: Box<Node>,
    },
    Case(i64),
    Default,
    Break,
    Continue,
    Goto(String),
    LabelStmt(String),
    Return(Option<Box<Node>>),
    VarDecl {
        name: String,
        is_static: bool,
        is_extern: bool,
        init: Option<Box<Node>>,
    },
    Function {
        name: String,
        params: Vec<Node>,
        body: Box<Node>,
        is_static: bool,
    },
    Assert(Box<Node>),
}

/// One AST node. The front end owns the tree; the backend only reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub ty: Option<Rc<CType>>,
    pub line: u32,
    pub vec_info: Option<VecInfo>,
}

impl Node {
    pub fn new(kind: NodeKind, line: u32) -> Self {
        Node {
            kind,
            ty: None,
            line,
            vec_info: None,
        }
    }

    pub fn with_type(kind: NodeKind, ty: Rc<CType>, line: u32) -> Self {
        Node {
            kind,
            ty: Some(ty),
            line,
            vec_info: None,
        }
    }

    /// The resolved type, defaulting to `int` for untyped expressions.
    pub fn type_or_int(&self) -> Rc<CType> {
        self.ty.clone().unwrap_or_else(|| Rc::new(CType::Int))
    }
}
