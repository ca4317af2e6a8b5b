//! Error types for tracing, synthesis and launching

use std::fmt;
use std::panic::Location;

use thiserror::Error;

use crate::ir::{NodeId, OpKind, ParamRole};

/// Approximate source location of a kernel-body call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    /// Location of the caller, following `#[track_caller]` frames.
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
            column: location.column(),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Structural errors while building or checking an operation graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IrError {
    #[error("cannot broadcast shape {lhs:?} with {rhs:?}")]
    Broadcast { lhs: Vec<usize>, rhs: Vec<usize> },

    #[error("axis {axis} is out of range for rank {rank}")]
    Axis { axis: usize, rank: usize },

    #[error("cannot reshape {from:?} into {to:?}")]
    Reshape { from: Vec<usize>, to: Vec<usize> },

    #[error("`{op}` expects {expected} operands, got {actual}")]
    Arity {
        op: String,
        expected: usize,
        actual: usize,
    },

    #[error("empty range {start}..{end}")]
    EmptyRange { start: i64, end: i64 },

    #[error("node {node} references undefined operand {operand}")]
    DanglingOperand { node: NodeId, operand: NodeId },

    #[error("operation graph contains a cycle through node {0}")]
    Cycle(NodeId),
}

/// Errors raised while tracing a kernel body.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TraceError {
    #[error("unsupported operation `{name}` at {location}")]
    UnsupportedOperation {
        name: String,
        location: SourceLocation,
    },

    #[error("unknown parameter `{name}` at {location}")]
    UnknownParameter {
        name: String,
        location: SourceLocation,
    },

    #[error("parameter `{name}` is a {actual} parameter, expected {expected} at {location}")]
    ParameterRole {
        name: String,
        expected: ParamRole,
        actual: ParamRole,
        location: SourceLocation,
    },

    #[error("no value for compile-time constant `{0}`")]
    MissingConstexpr(String),

    #[error("no element type for pointer `{0}`")]
    MissingPointerType(String),

    #[error("program id axis {axis} is out of range at {location}")]
    ProgramAxis {
        axis: usize,
        location: SourceLocation,
    },

    #[error("unrolled loops exceed the limit of {limit} iterations at {location}")]
    UnrollLimit {
        limit: u64,
        location: SourceLocation,
    },

    #[error("`{op}` by zero at {location}")]
    ZeroDivisor {
        op: &'static str,
        location: SourceLocation,
    },

    #[error("invalid `{op}` at {location}: {source}")]
    Ir {
        op: &'static str,
        source: IrError,
        location: SourceLocation,
    },
}

/// Errors raised while deriving a backward kernel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SynthesisError {
    #[error("internal error: operation graph contains a cycle through node {0}")]
    GraphCycle(NodeId),

    #[error("no adjoint rule for `{kind}` (node {node})")]
    UnsupportedAdjoint { kind: OpKind, node: NodeId },

    #[error("declared output `{0}` is never stored to")]
    OutputNotStored(String),

    #[error("declared input `{0}` is never loaded from")]
    InputNotLoaded(String),

    #[error("load {node} reads `{param}` after a store to a different access; its forward value cannot be replayed")]
    LoadAfterStore { param: String, node: NodeId },

    #[error(transparent)]
    Ir(IrError),
}

impl From<IrError> for SynthesisError {
    fn from(err: IrError) -> Self {
        match err {
            IrError::Cycle(node) => SynthesisError::GraphCycle(node),
            other => SynthesisError::Ir(other),
        }
    }
}

/// Errors raised by a kernel executor.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecError {
    #[error("kernel `{kernel}` expects {expected} arguments, got {actual}")]
    Arity {
        kernel: String,
        expected: usize,
        actual: usize,
    },

    #[error("argument `{name}` must be a {expected} argument")]
    ArgumentKind { name: String, expected: ParamRole },

    #[error("grid {0:?} has an empty dimension")]
    EmptyGrid([usize; 3]),

    #[error("access to `{param}` at offset {offset} is out of bounds (len {len})")]
    OutOfBounds {
        param: String,
        offset: i64,
        len: usize,
    },

    #[error("write to `{0}` is still guarded; resolve it before launching")]
    UnresolvedWrite(String),

    #[error("integer division by zero in address expression")]
    DivisionByZero,

    #[error("address expression uses unbound scalar `{0}`")]
    UnboundScalar(String),

    #[error(transparent)]
    Ir(#[from] IrError),
}

/// Errors raised while decorating a kernel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecorateError {
    #[error("declared {0} must not be empty")]
    EmptyDeclaration(&'static str),

    #[error("declared name `{0}` is not a kernel parameter")]
    UnknownParameter(String),

    #[error("declared name `{name}` is a {role} parameter, only pointers can be differentiated")]
    NotAPointer { name: String, role: ParamRole },

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
}

/// Errors raised while calling a decorated kernel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LaunchError {
    #[error("grid dimensions must be positive, got {0:?}")]
    InvalidGrid([usize; 3]),

    #[error("too many arguments: expected at most {expected}, got {actual}")]
    TooManyArguments { expected: usize, actual: usize },

    #[error("missing argument `{0}`")]
    MissingArgument(String),

    #[error("argument `{name}` must be a {expected} argument")]
    ArgumentKind { name: String, expected: ParamRole },

    #[error("argument `{0}` given more than once")]
    DuplicateArgument(String),

    #[error("`{0}` is not a compile-time constant of this kernel")]
    UnknownKeyword(String),

    #[error("backward grid {backward:?} differs from forward grid {forward:?}")]
    GridMismatch {
        forward: [usize; 3],
        backward: [usize; 3],
    },

    #[error("expected {expected} output gradients, got {actual}")]
    GradientCount { expected: usize, actual: usize },

    #[error("gradient for `{name}` has shape {actual:?}, expected {expected:?}")]
    GradientShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Errors raised by the host autograd engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AutogradError {
    #[error("backward() without a gradient needs a single-element tensor, got shape {0:?}")]
    NonScalar(Vec<usize>),

    #[error("gradient has shape {actual:?}, expected {expected:?}")]
    GradientShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("`{op}` of tensors with shapes {lhs:?} and {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    #[error("`{function}` returned {actual} gradients for {expected} inputs")]
    GradientCount {
        function: String,
        expected: usize,
        actual: usize,
    },
}

/// Any error produced by this crate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error(transparent)]
    Ir(#[from] IrError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Decorate(#[from] DecorateError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Autograd(#[from] AutogradError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
