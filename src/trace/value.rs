//! Traced tile values
//!
//! A [`TileValue`] stands in for a tile of the real kernel. Arithmetic on it
//! appends nodes to the trace instead of computing numbers; constants are
//! folded eagerly.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Rem, Sub, SubAssign};
use std::rc::Rc;

use super::state::TraceState;
use crate::ir::{ArithKind, CmpKind, DType, NodeId, ReduceKind};
use crate::rules::rules;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TileRepr {
    /// Result of a traced operation.
    Node(NodeId),
    /// Compile-time scalar, not yet part of the graph.
    Scalar(f64),
    /// Produced after the trace failed.
    Poisoned,
}

#[derive(Clone)]
pub struct TileValue {
    repr: TileRepr,
    shape: Vec<usize>,
    dtype: DType,
    state: Rc<TraceState>,
}

impl fmt::Debug for TileValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileValue")
            .field("repr", &self.repr)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish()
    }
}

/// Anything that can stand on either side of a tile operation.
pub trait TileOperand {
    fn into_tile(self, like: &TileValue) -> TileValue;
}

impl TileOperand for f64 {
    fn into_tile(self, like: &TileValue) -> TileValue {
        like.lift(self)
    }
}

impl TileOperand for TileValue {
    fn into_tile(self, _: &TileValue) -> TileValue {
        self
    }
}

impl TileOperand for &TileValue {
    fn into_tile(self, _: &TileValue) -> TileValue {
        self.clone()
    }
}

impl TileValue {
    pub(crate) fn from_node(state: &Rc<TraceState>, id: Option<NodeId>) -> Self {
        match id {
            Some(id) => {
                let (shape, dtype) = {
                    let body = state.body();
                    (body.shape(id).to_vec(), body.dtype(id))
                };
                Self {
                    repr: TileRepr::Node(id),
                    shape,
                    dtype,
                    state: Rc::clone(state),
                }
            }
            None => Self::poisoned(state),
        }
    }

    pub(crate) fn scalar(state: &Rc<TraceState>, value: f64) -> Self {
        Self {
            repr: TileRepr::Scalar(value),
            shape: vec![],
            dtype: DType::F32,
            state: Rc::clone(state),
        }
    }

    pub(crate) fn poisoned(state: &Rc<TraceState>) -> Self {
        Self {
            repr: TileRepr::Poisoned,
            shape: vec![],
            dtype: DType::F32,
            state: Rc::clone(state),
        }
    }

    /// A scalar constant living in the same trace.
    pub fn lift(&self, value: f64) -> TileValue {
        TileValue::scalar(&self.state, value)
    }

    pub fn repr(&self) -> TileRepr {
        self.repr
    }

    /// Graph node id, if this value is a traced node.
    pub fn id(&self) -> Option<NodeId> {
        match self.repr {
            TileRepr::Node(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self.repr {
            TileRepr::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Node id of this value, pushing a constant node for scalars.
    #[track_caller]
    pub(crate) fn materialize(&self, dtype: DType) -> Option<NodeId> {
        match self.repr {
            TileRepr::Node(id) => Some(id),
            TileRepr::Scalar(value) => self
                .state
                .emit("constant", |body| Ok(body.constant(value, vec![], dtype))),
            TileRepr::Poisoned => None,
        }
    }

    #[track_caller]
    fn apply(&self, kind: ArithKind, operands: &[&TileValue]) -> TileValue {
        if operands.iter().any(|v| v.repr == TileRepr::Poisoned) {
            return TileValue::poisoned(&self.state);
        }
        let scalars: Option<Vec<f64>> = operands.iter().map(|v| v.as_scalar()).collect();
        if let Some(args) = scalars {
            if let Some(value) = rules().eval_arith(kind, &args) {
                return TileValue::scalar(&self.state, value);
            }
        }
        // Scalars adopt the type of the traced operands; a select condition
        // does not take part.
        let is_select = kind == ArithKind::Select;
        let values = if is_select { &operands[1..] } else { operands };
        let dtype = values
            .iter()
            .filter(|v| v.id().is_some())
            .map(|v| v.dtype)
            .reduce(DType::promote)
            .unwrap_or(DType::F32);
        let mut ids = Vec::with_capacity(operands.len());
        for (i, operand) in operands.iter().enumerate() {
            let want = if is_select && i == 0 { DType::Bool } else { dtype };
            match operand.materialize(want) {
                Some(id) => ids.push(id),
                None => return TileValue::poisoned(&self.state),
            }
        }
        let id = self.state.emit(kind.name(), |body| body.arith(kind, &ids));
        TileValue::from_node(&self.state, id)
    }

    #[track_caller]
    fn binary(&self, rhs: &TileValue, kind: ArithKind) -> TileValue {
        self.apply(kind, &[self, rhs])
    }

    #[track_caller]
    fn unary(&self, kind: ArithKind) -> TileValue {
        self.apply(kind, &[self])
    }

    #[track_caller]
    pub(crate) fn select(cond: &TileValue, then: &TileValue, otherwise: &TileValue) -> TileValue {
        cond.apply(ArithKind::Select, &[cond, then, otherwise])
    }

    #[track_caller]
    fn compare(&self, cmp: CmpKind, rhs: impl TileOperand) -> TileValue {
        let rhs = rhs.into_tile(self);
        self.binary(&rhs, ArithKind::Cmp(cmp))
    }

    #[track_caller]
    pub fn lt(&self, rhs: impl TileOperand) -> TileValue {
        self.compare(CmpKind::Lt, rhs)
    }

    #[track_caller]
    pub fn le(&self, rhs: impl TileOperand) -> TileValue {
        self.compare(CmpKind::Le, rhs)
    }

    #[track_caller]
    pub fn gt(&self, rhs: impl TileOperand) -> TileValue {
        self.compare(CmpKind::Gt, rhs)
    }

    #[track_caller]
    pub fn ge(&self, rhs: impl TileOperand) -> TileValue {
        self.compare(CmpKind::Ge, rhs)
    }

    #[track_caller]
    pub fn equal(&self, rhs: impl TileOperand) -> TileValue {
        self.compare(CmpKind::Eq, rhs)
    }

    #[track_caller]
    pub fn not_equal(&self, rhs: impl TileOperand) -> TileValue {
        self.compare(CmpKind::Ne, rhs)
    }

    #[track_caller]
    pub fn maximum(&self, rhs: impl TileOperand) -> TileValue {
        let rhs = rhs.into_tile(self);
        self.binary(&rhs, ArithKind::Maximum)
    }

    #[track_caller]
    pub fn minimum(&self, rhs: impl TileOperand) -> TileValue {
        let rhs = rhs.into_tile(self);
        self.binary(&rhs, ArithKind::Minimum)
    }

    #[track_caller]
    pub fn exp(&self) -> TileValue {
        self.unary(ArithKind::Exp)
    }

    #[track_caller]
    pub fn log(&self) -> TileValue {
        self.unary(ArithKind::Log)
    }

    #[track_caller]
    pub fn sqrt(&self) -> TileValue {
        self.unary(ArithKind::Sqrt)
    }

    #[track_caller]
    pub fn sin(&self) -> TileValue {
        self.unary(ArithKind::Sin)
    }

    #[track_caller]
    pub fn cos(&self) -> TileValue {
        self.unary(ArithKind::Cos)
    }

    #[track_caller]
    fn reduce(&self, kind: ReduceKind, axis: usize) -> TileValue {
        let Some(operand) = self.materialize(self.dtype) else {
            return TileValue::poisoned(&self.state);
        };
        let id = self
            .state
            .emit(kind.name(), |body| body.reduce(kind, operand, axis));
        TileValue::from_node(&self.state, id)
    }

    #[track_caller]
    pub fn sum(&self, axis: usize) -> TileValue {
        self.reduce(ReduceKind::Sum, axis)
    }

    #[track_caller]
    pub fn max(&self, axis: usize) -> TileValue {
        self.reduce(ReduceKind::Max, axis)
    }

    #[track_caller]
    pub fn min(&self, axis: usize) -> TileValue {
        self.reduce(ReduceKind::Min, axis)
    }

    /// Insert a unit dimension, like `x[:, None]`.
    #[track_caller]
    pub fn expand_dims(&self, axis: usize) -> TileValue {
        let Some(operand) = self.materialize(self.dtype) else {
            return TileValue::poisoned(&self.state);
        };
        let id = self
            .state
            .emit("expand_dims", |body| body.expand_dims(operand, axis));
        TileValue::from_node(&self.state, id)
    }

    #[track_caller]
    pub fn reshape(&self, shape: &[usize]) -> TileValue {
        let Some(operand) = self.materialize(self.dtype) else {
            return TileValue::poisoned(&self.state);
        };
        let id = self
            .state
            .emit("reshape", |body| body.reshape(operand, shape));
        TileValue::from_node(&self.state, id)
    }

    #[track_caller]
    pub fn broadcast_to(&self, shape: &[usize]) -> TileValue {
        let Some(operand) = self.materialize(self.dtype) else {
            return TileValue::poisoned(&self.state);
        };
        let id = self
            .state
            .emit("broadcast_to", |body| body.broadcast_to(operand, shape));
        TileValue::from_node(&self.state, id)
    }
}

// ============================================================================
// Operators
// ============================================================================

macro_rules! impl_tile_binary_op {
    ($trait:ident, $fname:ident, $kind:expr) => {
        impl $trait<TileValue> for TileValue {
            type Output = TileValue;
            #[track_caller]
            fn $fname(self, rhs: TileValue) -> TileValue {
                self.binary(&rhs, $kind)
            }
        }

        impl $trait<&TileValue> for TileValue {
            type Output = TileValue;
            #[track_caller]
            fn $fname(self, rhs: &TileValue) -> TileValue {
                self.binary(rhs, $kind)
            }
        }

        impl $trait<TileValue> for &TileValue {
            type Output = TileValue;
            #[track_caller]
            fn $fname(self, rhs: TileValue) -> TileValue {
                self.binary(&rhs, $kind)
            }
        }

        impl $trait<&TileValue> for &TileValue {
            type Output = TileValue;
            #[track_caller]
            fn $fname(self, rhs: &TileValue) -> TileValue {
                self.binary(rhs, $kind)
            }
        }

        impl $trait<f64> for TileValue {
            type Output = TileValue;
            #[track_caller]
            fn $fname(self, rhs: f64) -> TileValue {
                self.binary(&self.lift(rhs), $kind)
            }
        }

        impl $trait<f64> for &TileValue {
            type Output = TileValue;
            #[track_caller]
            fn $fname(self, rhs: f64) -> TileValue {
                self.binary(&self.lift(rhs), $kind)
            }
        }

        impl $trait<TileValue> for f64 {
            type Output = TileValue;
            #[track_caller]
            fn $fname(self, rhs: TileValue) -> TileValue {
                rhs.lift(self).binary(&rhs, $kind)
            }
        }

        impl $trait<&TileValue> for f64 {
            type Output = TileValue;
            #[track_caller]
            fn $fname(self, rhs: &TileValue) -> TileValue {
                rhs.lift(self).binary(rhs, $kind)
            }
        }
    };
}

impl_tile_binary_op!(Add, add, ArithKind::Add);
impl_tile_binary_op!(Sub, sub, ArithKind::Sub);
impl_tile_binary_op!(Mul, mul, ArithKind::Mul);
impl_tile_binary_op!(Div, div, ArithKind::Div);
impl_tile_binary_op!(Rem, rem, ArithKind::Rem);

macro_rules! impl_tile_assign_op {
    ($trait:ident, $fname:ident, $kind:expr) => {
        impl $trait<TileValue> for TileValue {
            #[track_caller]
            fn $fname(&mut self, rhs: TileValue) {
                *self = self.binary(&rhs, $kind);
            }
        }

        impl $trait<&TileValue> for TileValue {
            #[track_caller]
            fn $fname(&mut self, rhs: &TileValue) {
                *self = self.binary(rhs, $kind);
            }
        }
    };
}

impl_tile_assign_op!(AddAssign, add_assign, ArithKind::Add);
impl_tile_assign_op!(SubAssign, sub_assign, ArithKind::Sub);
impl_tile_assign_op!(MulAssign, mul_assign, ArithKind::Mul);

impl Neg for TileValue {
    type Output = TileValue;
    #[track_caller]
    fn neg(self) -> TileValue {
        self.unary(ArithKind::Neg)
    }
}

impl Neg for &TileValue {
    type Output = TileValue;
    #[track_caller]
    fn neg(self) -> TileValue {
        self.unary(ArithKind::Neg)
    }
}
