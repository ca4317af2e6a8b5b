//! Operation nodes of a traced kernel graph
//!
//! Nodes live in an arena owned by [`KernelBody`](super::KernelBody) and refer
//! to their operands by [`NodeId`]. A node is never mutated after it has been
//! pushed.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::certificate::ScatterCertificate;
use super::dtype::DType;
use super::index::{AddressExpr, Mask};

/// Index of a node inside its kernel body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Comparison predicate shared by value compares and index masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpKind {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpKind {
    pub const ALL: [CmpKind; 6] = [
        CmpKind::Lt,
        CmpKind::Le,
        CmpKind::Gt,
        CmpKind::Ge,
        CmpKind::Eq,
        CmpKind::Ne,
    ];

    pub fn symbol(&self) -> &'static str {
        match self {
            CmpKind::Lt => "<",
            CmpKind::Le => "<=",
            CmpKind::Gt => ">",
            CmpKind::Ge => ">=",
            CmpKind::Eq => "==",
            CmpKind::Ne => "!=",
        }
    }

    pub fn holds<T: PartialOrd>(&self, lhs: T, rhs: T) -> bool {
        match self {
            CmpKind::Lt => lhs < rhs,
            CmpKind::Le => lhs <= rhs,
            CmpKind::Gt => lhs > rhs,
            CmpKind::Ge => lhs >= rhs,
            CmpKind::Eq => lhs == rhs,
            CmpKind::Ne => lhs != rhs,
        }
    }
}

/// Elementwise arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithKind {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Maximum,
    Minimum,
    Exp,
    Log,
    Sqrt,
    Sin,
    Cos,
    Cmp(CmpKind),
    /// `select(cond, a, b)`
    Select,
    Rem,
}

impl ArithKind {
    pub fn arity(&self) -> usize {
        match self {
            ArithKind::Neg
            | ArithKind::Exp
            | ArithKind::Log
            | ArithKind::Sqrt
            | ArithKind::Sin
            | ArithKind::Cos => 1,
            ArithKind::Select => 3,
            _ => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ArithKind::Add => "add",
            ArithKind::Sub => "sub",
            ArithKind::Mul => "mul",
            ArithKind::Div => "div",
            ArithKind::Neg => "neg",
            ArithKind::Maximum => "maximum",
            ArithKind::Minimum => "minimum",
            ArithKind::Exp => "exp",
            ArithKind::Log => "log",
            ArithKind::Sqrt => "sqrt",
            ArithKind::Sin => "sin",
            ArithKind::Cos => "cos",
            ArithKind::Cmp(CmpKind::Lt) => "lt",
            ArithKind::Cmp(CmpKind::Le) => "le",
            ArithKind::Cmp(CmpKind::Gt) => "gt",
            ArithKind::Cmp(CmpKind::Ge) => "ge",
            ArithKind::Cmp(CmpKind::Eq) => "eq",
            ArithKind::Cmp(CmpKind::Ne) => "ne",
            ArithKind::Select => "where",
            ArithKind::Rem => "rem",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    Sum,
    Max,
    Min,
}

impl ReduceKind {
    pub fn name(&self) -> &'static str {
        match self {
            ReduceKind::Sum => "sum",
            ReduceKind::Max => "max",
            ReduceKind::Min => "min",
        }
    }
}

/// Closed set of operation kinds, the key of the rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Load,
    Store,
    Const,
    Arith(ArithKind),
    Reduce(ReduceKind),
    Broadcast,
    Reshape,
}

impl OpKind {
    /// Every operation kind, in a stable order.
    pub fn all() -> Vec<OpKind> {
        let mut kinds = vec![OpKind::Load, OpKind::Store, OpKind::Const];
        kinds.extend(
            [
                ArithKind::Add,
                ArithKind::Sub,
                ArithKind::Mul,
                ArithKind::Div,
                ArithKind::Neg,
                ArithKind::Maximum,
                ArithKind::Minimum,
                ArithKind::Exp,
                ArithKind::Log,
                ArithKind::Sqrt,
                ArithKind::Sin,
                ArithKind::Cos,
                ArithKind::Select,
                ArithKind::Rem,
            ]
            .into_iter()
            .map(OpKind::Arith),
        );
        kinds.extend(
            CmpKind::ALL
                .into_iter()
                .map(|cmp| OpKind::Arith(ArithKind::Cmp(cmp))),
        );
        kinds.extend(
            [ReduceKind::Sum, ReduceKind::Max, ReduceKind::Min]
                .into_iter()
                .map(OpKind::Reduce),
        );
        kinds.push(OpKind::Broadcast);
        kinds.push(OpKind::Reshape);
        kinds
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Load => write!(f, "load"),
            OpKind::Store => write!(f, "store"),
            OpKind::Const => write!(f, "const"),
            OpKind::Arith(kind) => write!(f, "{}", kind.name()),
            OpKind::Reduce(kind) => write!(f, "reduce_{}", kind.name()),
            OpKind::Broadcast => write!(f, "broadcast"),
            OpKind::Reshape => write!(f, "reshape"),
        }
    }
}

/// How a store commits its values to memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteMode {
    Store,
    AtomicAdd,
    /// Plain store if the certificate holds for the launch, atomic add otherwise.
    Guarded(Box<ScatterCertificate>),
}

/// A memory location pattern: base pointer parameter, offsets and mask.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Access {
    /// Index of the pointer parameter in the kernel signature.
    pub ptr: usize,
    pub address: AddressExpr,
    pub mask: Option<Mask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Load {
        access: Access,
        /// Value for masked-off lanes.
        other: f64,
    },
    Store {
        access: Access,
        value: NodeId,
        mode: WriteMode,
    },
    Const {
        value: f64,
    },
    Arith {
        kind: ArithKind,
        operands: Vec<NodeId>,
    },
    Reduce {
        kind: ReduceKind,
        operand: NodeId,
        axis: usize,
    },
    /// Broadcast the operand to this node's shape.
    Broadcast {
        operand: NodeId,
    },
    /// Reinterpret the operand with this node's shape.
    Reshape {
        operand: NodeId,
    },
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Load { .. } => OpKind::Load,
            Op::Store { .. } => OpKind::Store,
            Op::Const { .. } => OpKind::Const,
            Op::Arith { kind, .. } => OpKind::Arith(*kind),
            Op::Reduce { kind, .. } => OpKind::Reduce(*kind),
            Op::Broadcast { .. } => OpKind::Broadcast,
            Op::Reshape { .. } => OpKind::Reshape,
        }
    }

    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            Op::Load { .. } | Op::Const { .. } => vec![],
            Op::Store { value, .. } => vec![*value],
            Op::Arith { operands, .. } => operands.clone(),
            Op::Reduce { operand, .. } | Op::Broadcast { operand } | Op::Reshape { operand } => {
                vec![*operand]
            }
        }
    }

    /// Rewrite operand ids, keeping everything else.
    pub fn map_operands(&self, mut f: impl FnMut(NodeId) -> NodeId) -> Op {
        match self {
            Op::Load { .. } | Op::Const { .. } => self.clone(),
            Op::Store {
                access,
                value,
                mode,
            } => Op::Store {
                access: access.clone(),
                value: f(*value),
                mode: mode.clone(),
            },
            Op::Arith { kind, operands } => Op::Arith {
                kind: *kind,
                operands: operands.iter().map(|&id| f(id)).collect(),
            },
            Op::Reduce {
                kind,
                operand,
                axis,
            } => Op::Reduce {
                kind: *kind,
                operand: f(*operand),
                axis: *axis,
            },
            Op::Broadcast { operand } => Op::Broadcast {
                operand: f(*operand),
            },
            Op::Reshape { operand } => Op::Reshape {
                operand: f(*operand),
            },
        }
    }

    pub fn access(&self) -> Option<&Access> {
        match self {
            Op::Load { access, .. } | Op::Store { access, .. } => Some(access),
            _ => None,
        }
    }

    pub fn is_store(&self) -> bool {
        matches!(self, Op::Store { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpNode {
    pub op: Op,
    pub shape: Vec<usize>,
    pub dtype: DType,
}
