//! Differentiation rule table
//!
//! Every [`OpKind`] maps to its value semantics (used by the executor and by
//! constant folding in the tracer) and its adjoint rule (used by the backward
//! synthesizer). The table is built once by an exhaustive match, so a new
//! operation kind cannot be added without deciding its rules.

use log::debug;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::IrError;
use crate::ir::{ArithKind, CmpKind, KernelBody, NodeId, OpKind, ReduceKind};

// ============================================================================
// Rule types
// ============================================================================

/// Elementwise evaluation over one value per operand.
pub type EvalFn = fn(&[f64]) -> f64;

/// How an operation computes its values.
#[derive(Clone, Copy)]
pub enum Semantics {
    Elementwise(EvalFn),
    /// Produces 1.0 when the predicate holds, 0.0 otherwise.
    Compare(CmpKind),
    Reduction {
        identity: f64,
        combine: fn(f64, f64) -> f64,
    },
    /// Reads or writes a pointer argument.
    Memory,
    /// Rearranges operand values without arithmetic.
    View,
    Constant,
}

/// How gradients of max/min reductions are routed when several elements tie.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TiePolicy {
    /// Every tied element receives the full gradient.
    #[default]
    RouteAll,
    /// Tied elements share the gradient evenly.
    Split,
}

/// Operands of an adjoint rule, expressed as nodes of the backward body.
pub struct AdjointInput {
    /// Forward value of the node, replayed in the backward body.
    pub node: NodeId,
    /// Replayed forward operands.
    pub operands: Vec<NodeId>,
    /// Reduction axis, for reductions.
    pub axis: Option<usize>,
    /// Accumulated gradient of the node's output.
    pub grad: NodeId,
    pub tie_policy: TiePolicy,
}

/// Emits backward nodes and returns one gradient per operand.
pub type AdjointFn = fn(&mut KernelBody, &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError>;

#[derive(Clone, Copy)]
pub enum Adjoint {
    Propagate(AdjointFn),
    /// A load from a declared input becomes a gradient scatter.
    Scatter,
    /// A store to a declared output reads its gradient from the seed buffer.
    Seed,
    /// No operands, nothing to propagate.
    Leaf,
    /// No gradient is defined.
    Unsupported,
}

#[derive(Clone, Copy)]
pub struct OpRule {
    pub kind: OpKind,
    pub semantics: Semantics,
    pub adjoint: Adjoint,
}

// ============================================================================
// Table
// ============================================================================

pub struct RuleTable {
    rules: FxHashMap<OpKind, OpRule>,
}

static RULES: Lazy<RuleTable> = Lazy::new(RuleTable::build);

/// The process-wide rule table.
pub fn rules() -> &'static RuleTable {
    &RULES
}

impl RuleTable {
    fn build() -> Self {
        let rules: FxHashMap<OpKind, OpRule> = OpKind::all()
            .into_iter()
            .map(|kind| (kind, rule_for(kind)))
            .collect();
        debug!("built rule table with {} operation kinds", rules.len());
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, kind: OpKind) -> Option<&OpRule> {
        self.rules.get(&kind)
    }

    /// Evaluate an elementwise operation on scalars.
    pub fn eval_arith(&self, kind: ArithKind, args: &[f64]) -> Option<f64> {
        if args.len() != kind.arity() {
            return None;
        }
        match self.get(OpKind::Arith(kind))?.semantics {
            Semantics::Elementwise(f) => Some(f(args)),
            Semantics::Compare(cmp) => Some(if cmp.holds(args[0], args[1]) { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Identity and combiner of a reduction.
    pub fn reduction(&self, kind: ReduceKind) -> Option<(f64, fn(f64, f64) -> f64)> {
        match self.get(OpKind::Reduce(kind))?.semantics {
            Semantics::Reduction { identity, combine } => Some((identity, combine)),
            _ => None,
        }
    }
}

fn rule_for(kind: OpKind) -> OpRule {
    let (semantics, adjoint) = match kind {
        OpKind::Load => (Semantics::Memory, Adjoint::Scatter),
        OpKind::Store => (Semantics::Memory, Adjoint::Seed),
        OpKind::Const => (Semantics::Constant, Adjoint::Leaf),
        OpKind::Arith(arith) => match arith {
            ArithKind::Add => (Semantics::Elementwise(|x| x[0] + x[1]), Adjoint::Propagate(adjoint_add)),
            ArithKind::Sub => (Semantics::Elementwise(|x| x[0] - x[1]), Adjoint::Propagate(adjoint_sub)),
            ArithKind::Mul => (Semantics::Elementwise(|x| x[0] * x[1]), Adjoint::Propagate(adjoint_mul)),
            ArithKind::Div => (Semantics::Elementwise(|x| x[0] / x[1]), Adjoint::Propagate(adjoint_div)),
            ArithKind::Neg => (Semantics::Elementwise(|x| -x[0]), Adjoint::Propagate(adjoint_neg)),
            ArithKind::Maximum => (
                Semantics::Elementwise(|x| x[0].max(x[1])),
                Adjoint::Propagate(adjoint_maximum),
            ),
            ArithKind::Minimum => (
                Semantics::Elementwise(|x| x[0].min(x[1])),
                Adjoint::Propagate(adjoint_minimum),
            ),
            ArithKind::Exp => (Semantics::Elementwise(|x| x[0].exp()), Adjoint::Propagate(adjoint_exp)),
            ArithKind::Log => (Semantics::Elementwise(|x| x[0].ln()), Adjoint::Propagate(adjoint_log)),
            ArithKind::Sqrt => (Semantics::Elementwise(|x| x[0].sqrt()), Adjoint::Propagate(adjoint_sqrt)),
            ArithKind::Sin => (Semantics::Elementwise(|x| x[0].sin()), Adjoint::Propagate(adjoint_sin)),
            ArithKind::Cos => (Semantics::Elementwise(|x| x[0].cos()), Adjoint::Propagate(adjoint_cos)),
            ArithKind::Cmp(cmp) => (Semantics::Compare(cmp), Adjoint::Propagate(adjoint_cmp)),
            ArithKind::Select => (
                Semantics::Elementwise(|x| if x[0] != 0.0 { x[1] } else { x[2] }),
                Adjoint::Propagate(adjoint_select),
            ),
            // Piecewise with jumps; callers needing it must not differentiate through it.
            ArithKind::Rem => (Semantics::Elementwise(|x| x[0] % x[1]), Adjoint::Unsupported),
        },
        OpKind::Reduce(reduce) => match reduce {
            ReduceKind::Sum => (
                Semantics::Reduction {
                    identity: 0.0,
                    combine: |a, b| a + b,
                },
                Adjoint::Propagate(adjoint_reduce_sum),
            ),
            ReduceKind::Max => (
                Semantics::Reduction {
                    identity: f64::NEG_INFINITY,
                    combine: f64::max,
                },
                Adjoint::Propagate(adjoint_reduce_extremum),
            ),
            ReduceKind::Min => (
                Semantics::Reduction {
                    identity: f64::INFINITY,
                    combine: f64::min,
                },
                Adjoint::Propagate(adjoint_reduce_extremum),
            ),
        },
        OpKind::Broadcast => (Semantics::View, Adjoint::Propagate(adjoint_broadcast)),
        OpKind::Reshape => (Semantics::View, Adjoint::Propagate(adjoint_reshape)),
    };
    OpRule {
        kind,
        semantics,
        adjoint,
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn zero(body: &mut KernelBody, like: NodeId) -> NodeId {
    let dtype = body.dtype(like);
    body.constant(0.0, vec![], dtype)
}

/// Sum a gradient back down to the shape of a broadcast operand.
pub fn unbroadcast(body: &mut KernelBody, grad: NodeId, to: &[usize]) -> Result<NodeId, IrError> {
    let from = body.shape(grad).to_vec();
    if from == to {
        return Ok(grad);
    }
    if from.len() < to.len() {
        return Err(IrError::Broadcast {
            lhs: from,
            rhs: to.to_vec(),
        });
    }
    let lead = from.len() - to.len();
    let mut axes: Vec<usize> = (0..lead).collect();
    for (i, &dim) in to.iter().enumerate() {
        if dim == 1 && from[lead + i] != 1 {
            axes.push(lead + i);
        }
    }
    let mut out = grad;
    for &axis in axes.iter().rev() {
        out = body.reduce(ReduceKind::Sum, out, axis)?;
    }
    body.reshape(out, to)
}

fn axis_of(input: &AdjointInput) -> Result<usize, IrError> {
    input.axis.ok_or(IrError::Arity {
        op: "reduce".to_string(),
        expected: 1,
        actual: 0,
    })
}

// ============================================================================
// Adjoint rules
// ============================================================================

fn adjoint_add(_: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    Ok(vec![Some(x.grad), Some(x.grad)])
}

fn adjoint_sub(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    let neg = b.arith(ArithKind::Neg, &[x.grad])?;
    Ok(vec![Some(x.grad), Some(neg)])
}

fn adjoint_mul(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    let (lhs, rhs) = (x.operands[0], x.operands[1]);
    let grad_lhs = b.arith(ArithKind::Mul, &[x.grad, rhs])?;
    let grad_rhs = b.arith(ArithKind::Mul, &[x.grad, lhs])?;
    Ok(vec![Some(grad_lhs), Some(grad_rhs)])
}

fn adjoint_div(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    let (num, den) = (x.operands[0], x.operands[1]);
    let grad_num = b.arith(ArithKind::Div, &[x.grad, den])?;
    // -grad * a / b^2
    let scaled = b.arith(ArithKind::Mul, &[x.grad, num])?;
    let den_sq = b.arith(ArithKind::Mul, &[den, den])?;
    let quotient = b.arith(ArithKind::Div, &[scaled, den_sq])?;
    let grad_den = b.arith(ArithKind::Neg, &[quotient])?;
    Ok(vec![Some(grad_num), Some(grad_den)])
}

fn adjoint_neg(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    Ok(vec![Some(b.arith(ArithKind::Neg, &[x.grad])?)])
}

fn route_binary(
    b: &mut KernelBody,
    x: &AdjointInput,
    cmp: CmpKind,
) -> Result<Vec<Option<NodeId>>, IrError> {
    // Ties go to the first operand.
    let first_wins = b.arith(ArithKind::Cmp(cmp), &[x.operands[0], x.operands[1]])?;
    let zero = zero(b, x.grad);
    let grad_lhs = b.arith(ArithKind::Select, &[first_wins, x.grad, zero])?;
    let grad_rhs = b.arith(ArithKind::Select, &[first_wins, zero, x.grad])?;
    Ok(vec![Some(grad_lhs), Some(grad_rhs)])
}

fn adjoint_maximum(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    route_binary(b, x, CmpKind::Ge)
}

fn adjoint_minimum(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    route_binary(b, x, CmpKind::Le)
}

fn adjoint_exp(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    Ok(vec![Some(b.arith(ArithKind::Mul, &[x.grad, x.node])?)])
}

fn adjoint_log(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    Ok(vec![Some(b.arith(ArithKind::Div, &[x.grad, x.operands[0]])?)])
}

fn adjoint_sqrt(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    let dtype = b.dtype(x.node);
    let two = b.constant(2.0, vec![], dtype);
    let denom = b.arith(ArithKind::Mul, &[two, x.node])?;
    Ok(vec![Some(b.arith(ArithKind::Div, &[x.grad, denom])?)])
}

fn adjoint_sin(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    let cos = b.arith(ArithKind::Cos, &[x.operands[0]])?;
    Ok(vec![Some(b.arith(ArithKind::Mul, &[x.grad, cos])?)])
}

fn adjoint_cos(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    let sin = b.arith(ArithKind::Sin, &[x.operands[0]])?;
    let scaled = b.arith(ArithKind::Mul, &[x.grad, sin])?;
    Ok(vec![Some(b.arith(ArithKind::Neg, &[scaled])?)])
}

fn adjoint_cmp(_: &mut KernelBody, _: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    Ok(vec![None, None])
}

fn adjoint_select(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    let cond = x.operands[0];
    let zero = zero(b, x.grad);
    let grad_then = b.arith(ArithKind::Select, &[cond, x.grad, zero])?;
    let grad_else = b.arith(ArithKind::Select, &[cond, zero, x.grad])?;
    Ok(vec![None, Some(grad_then), Some(grad_else)])
}

fn adjoint_reduce_sum(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    let axis = axis_of(x)?;
    let shape = b.shape(x.operands[0]).to_vec();
    let expanded = b.expand_dims(x.grad, axis)?;
    Ok(vec![Some(b.broadcast_to(expanded, &shape)?)])
}

fn adjoint_reduce_extremum(
    b: &mut KernelBody,
    x: &AdjointInput,
) -> Result<Vec<Option<NodeId>>, IrError> {
    let axis = axis_of(x)?;
    let input = x.operands[0];
    let shape = b.shape(input).to_vec();

    let extremum = b.expand_dims(x.node, axis)?;
    let extremum = b.broadcast_to(extremum, &shape)?;
    let hit = b.arith(ArithKind::Cmp(CmpKind::Eq), &[input, extremum])?;
    let grad = b.expand_dims(x.grad, axis)?;
    let grad = b.broadcast_to(grad, &shape)?;
    let zero = zero(b, x.grad);
    let routed = b.arith(ArithKind::Select, &[hit, grad, zero])?;

    match x.tie_policy {
        TiePolicy::RouteAll => Ok(vec![Some(routed)]),
        TiePolicy::Split => {
            let dtype = b.dtype(x.grad);
            let one = b.constant(1.0, vec![], dtype);
            let ones = b.arith(ArithKind::Select, &[hit, one, zero])?;
            let count = b.reduce(ReduceKind::Sum, ones, axis)?;
            let count = b.expand_dims(count, axis)?;
            let count = b.broadcast_to(count, &shape)?;
            Ok(vec![Some(b.arith(ArithKind::Div, &[routed, count])?)])
        }
    }
}

fn adjoint_broadcast(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    let shape = b.shape(x.operands[0]).to_vec();
    Ok(vec![Some(unbroadcast(b, x.grad, &shape)?)])
}

fn adjoint_reshape(b: &mut KernelBody, x: &AdjointInput) -> Result<Vec<Option<NodeId>>, IrError> {
    let shape = b.shape(x.operands[0]).to_vec();
    Ok(vec![Some(b.reshape(x.grad, &shape)?)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AddressExpr, DType, KernelSignature, Op, Param, Specialization};
    use rstest::rstest;

    fn body() -> KernelBody {
        let sig = KernelSignature::new(vec![Param::pointer("x")]);
        KernelBody::new("t", sig, Specialization::new().with_pointer_type("x", DType::F64))
    }

    fn offs(len: usize) -> AddressExpr {
        AddressExpr::Range {
            len,
            axis: 0,
            rank: 1,
        }
    }

    #[test]
    fn test_every_kind_has_a_rule() {
        assert_eq!(rules().len(), OpKind::all().len());
        for kind in OpKind::all() {
            assert_eq!(rules().get(kind).map(|r| r.kind), Some(kind));
        }
    }

    #[rstest]
    #[case(ArithKind::Add, vec![2.0, 3.0], 5.0)]
    #[case(ArithKind::Sub, vec![2.0, 3.0], -1.0)]
    #[case(ArithKind::Div, vec![3.0, 2.0], 1.5)]
    #[case(ArithKind::Maximum, vec![-1.0, 4.0], 4.0)]
    #[case(ArithKind::Cmp(CmpKind::Lt), vec![1.0, 2.0], 1.0)]
    #[case(ArithKind::Cmp(CmpKind::Eq), vec![1.0, 2.0], 0.0)]
    #[case(ArithKind::Select, vec![0.0, 7.0, 9.0], 9.0)]
    #[case(ArithKind::Rem, vec![7.0, 4.0], 3.0)]
    fn test_eval(#[case] kind: ArithKind, #[case] args: Vec<f64>, #[case] expected: f64) {
        assert_eq!(rules().eval_arith(kind, &args), Some(expected));
    }

    #[test]
    fn test_eval_rejects_wrong_arity() {
        assert_eq!(rules().eval_arith(ArithKind::Add, &[1.0]), None);
    }

    #[test]
    fn test_reduction_identities() {
        let (identity, combine) = rules().reduction(ReduceKind::Max).unwrap();
        assert_eq!(identity, f64::NEG_INFINITY);
        assert_eq!(combine(1.0, 3.0), 3.0);
    }

    #[test]
    fn test_rem_has_no_adjoint() {
        let rule = rules().get(OpKind::Arith(ArithKind::Rem)).unwrap();
        assert!(matches!(rule.adjoint, Adjoint::Unsupported));
    }

    #[test]
    fn test_mul_adjoint_uses_other_operand() {
        let mut b = body();
        let lhs = b.load(0, offs(4), None, 0.0).unwrap();
        let rhs = b.load(0, offs(4) + 4, None, 0.0).unwrap();
        let out = b.arith(ArithKind::Mul, &[lhs, rhs]).unwrap();
        let grad = b.constant(1.0, vec![4], DType::F64);
        let input = AdjointInput {
            node: out,
            operands: vec![lhs, rhs],
            axis: None,
            grad,
            tie_policy: TiePolicy::RouteAll,
        };
        let grads = adjoint_mul(&mut b, &input).unwrap();
        let grad_lhs = grads[0].unwrap();
        match &b.node(grad_lhs).op {
            Op::Arith { kind, operands } => {
                assert_eq!(*kind, ArithKind::Mul);
                assert_eq!(operands, &vec![grad, rhs]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unbroadcast_shapes() {
        let mut b = body();
        let grad = b.constant(1.0, vec![3, 4, 5], DType::F64);
        let to_row = unbroadcast(&mut b, grad, &[4, 1]).unwrap();
        assert_eq!(b.shape(to_row), &[4, 1]);
        let to_scalar = unbroadcast(&mut b, grad, &[]).unwrap();
        assert_eq!(b.shape(to_scalar), &[] as &[usize]);
        assert!(unbroadcast(&mut b, to_scalar, &[2]).is_err());
    }

    #[test]
    fn test_reduce_max_adjoint_shapes() {
        for policy in [TiePolicy::RouteAll, TiePolicy::Split] {
            let mut b = body();
            let x = b.load(0, offs(4), None, 0.0).unwrap();
            let m = b.reduce(ReduceKind::Max, x, 0).unwrap();
            let grad = b.constant(1.0, vec![], DType::F64);
            let input = AdjointInput {
                node: m,
                operands: vec![x],
                axis: Some(0),
                grad,
                tie_policy: policy,
            };
            let grads = adjoint_reduce_extremum(&mut b, &input).unwrap();
            assert_eq!(b.shape(grads[0].unwrap()), &[4]);
        }
    }
}
