//! Lane-wise evaluation of address expressions and masks for one program

use ndarray::{ArrayD, IxDyn};
use rustc_hash::FxHashMap;

use crate::error::{ExecError, IrError};
use crate::ir::index::{floor_div, floor_rem};
use crate::ir::shape::broadcast_shapes;
use crate::ir::{AddressExpr, Mask};

/// Program id and bound integer arguments of one program instance.
pub(crate) struct IndexEnv<'a> {
    pub pid: [i64; 3],
    pub scalars: &'a FxHashMap<String, i64>,
}

/// Copy a view broadcast to `shape` into an owned array.
pub(crate) fn broadcast_owned<T: Clone>(array: &ArrayD<T>, shape: &[usize]) -> Result<ArrayD<T>, IrError> {
    if array.shape() == shape {
        return Ok(array.clone());
    }
    let view = array.broadcast(IxDyn(shape)).ok_or_else(|| IrError::Broadcast {
        lhs: array.shape().to_vec(),
        rhs: shape.to_vec(),
    })?;
    let data: Vec<T> = view.iter().cloned().collect();
    ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| IrError::Reshape {
        from: array.shape().to_vec(),
        to: shape.to_vec(),
    })
}

fn zip_with<A, B, C, F>(lhs: &ArrayD<A>, rhs: &ArrayD<B>, mut f: F) -> Result<ArrayD<C>, ExecError>
where
    A: Copy,
    B: Copy,
    F: FnMut(A, B) -> Result<C, ExecError>,
{
    let shape = broadcast_shapes(lhs.shape(), rhs.shape())?;
    let lhs = broadcast_owned(lhs, &shape)?;
    let rhs = broadcast_owned(rhs, &shape)?;
    let data = lhs
        .iter()
        .zip(rhs.iter())
        .map(|(&a, &b)| f(a, b))
        .collect::<Result<Vec<C>, ExecError>>()?;
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|_| {
        ExecError::Ir(IrError::Reshape {
            from: lhs.shape().to_vec(),
            to: shape.clone(),
        })
    })
}

fn scalar<T: Clone>(value: T) -> ArrayD<T> {
    ArrayD::from_elem(IxDyn(&[]), value)
}

pub(crate) fn eval_address(expr: &AddressExpr, env: &IndexEnv<'_>) -> Result<ArrayD<i64>, ExecError> {
    match expr {
        AddressExpr::Const(c) => Ok(scalar(*c)),
        AddressExpr::ProgramId(axis) => Ok(scalar(env.pid.get(*axis).copied().unwrap_or(0))),
        AddressExpr::Scalar(name) => env
            .scalars
            .get(name)
            .copied()
            .map(scalar)
            .ok_or_else(|| ExecError::UnboundScalar(name.clone())),
        AddressExpr::Range { len, axis, rank } => {
            let mut shape = vec![1; *rank];
            if let Some(slot) = shape.get_mut(*axis) {
                *slot = *len;
            }
            let values: Vec<i64> = (0..*len as i64).collect();
            ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|_| {
                ExecError::Ir(IrError::Axis {
                    axis: *axis,
                    rank: *rank,
                })
            })
        }
        AddressExpr::Add(l, r) => zip_with(&eval_address(l, env)?, &eval_address(r, env)?, |a, b| Ok(a + b)),
        AddressExpr::Mul(l, r) => zip_with(&eval_address(l, env)?, &eval_address(r, env)?, |a, b| Ok(a * b)),
        AddressExpr::FloorDiv(l, r) => zip_with(&eval_address(l, env)?, &eval_address(r, env)?, |a, b| {
            if b == 0 {
                Err(ExecError::DivisionByZero)
            } else {
                Ok(floor_div(a, b))
            }
        }),
        AddressExpr::Rem(l, r) => zip_with(&eval_address(l, env)?, &eval_address(r, env)?, |a, b| {
            if b == 0 {
                Err(ExecError::DivisionByZero)
            } else {
                Ok(floor_rem(a, b))
            }
        }),
        AddressExpr::Min(l, r) => zip_with(&eval_address(l, env)?, &eval_address(r, env)?, |a, b| Ok(a.min(b))),
    }
}

pub(crate) fn eval_mask(mask: &Mask, env: &IndexEnv<'_>) -> Result<ArrayD<bool>, ExecError> {
    match mask {
        Mask::Cmp { op, lhs, rhs } => zip_with(&eval_address(lhs, env)?, &eval_address(rhs, env)?, |a, b| {
            Ok(op.holds(a, b))
        }),
        Mask::And(l, r) => zip_with(&eval_mask(l, env)?, &eval_mask(r, env)?, |a, b| Ok(a && b)),
        Mask::Or(l, r) => zip_with(&eval_mask(l, env)?, &eval_mask(r, env)?, |a, b| Ok(a || b)),
        Mask::Not(m) => Ok(eval_mask(m, env)?.mapv(|a| !a)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(scalars: &FxHashMap<String, i64>) -> IndexEnv<'_> {
        IndexEnv { pid: [2, 0, 0], scalars }
    }

    fn offs(len: usize) -> AddressExpr {
        AddressExpr::Range {
            len,
            axis: 0,
            rank: 1,
        }
    }

    #[test]
    fn test_block_offsets() {
        let scalars = FxHashMap::default();
        let expr = AddressExpr::ProgramId(0) * 4 + offs(4);
        let values = eval_address(&expr, &env(&scalars)).unwrap();
        assert_eq!(values.iter().copied().collect::<Vec<_>>(), vec![8, 9, 10, 11]);
    }

    #[test]
    fn test_outer_product_offsets() {
        let mut scalars = FxHashMap::default();
        scalars.insert("ld".to_string(), 10);
        let rows = offs(2).expand_dims(1).unwrap();
        let cols = offs(3).expand_dims(0).unwrap();
        let expr = rows * AddressExpr::scalar("ld") + cols;
        let values = eval_address(&expr, &env(&scalars)).unwrap();
        assert_eq!(values.shape(), &[2, 3]);
        assert_eq!(values.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2, 10, 11, 12]);
    }

    #[test]
    fn test_mask_and_errors() {
        let scalars = FxHashMap::default();
        let mask = offs(4).lt(3) & offs(4).ge(1);
        let values = eval_mask(&mask, &env(&scalars)).unwrap();
        assert_eq!(values.iter().copied().collect::<Vec<_>>(), vec![false, true, true, false]);

        let unbound = AddressExpr::scalar("n");
        assert_eq!(
            eval_address(&unbound, &env(&scalars)).unwrap_err(),
            ExecError::UnboundScalar("n".to_string())
        );
        let div = AddressExpr::FloorDiv(Box::new(AddressExpr::Const(1)), Box::new(AddressExpr::Const(0)));
        assert_eq!(eval_address(&div, &env(&scalars)).unwrap_err(), ExecError::DivisionByZero);
    }
}
