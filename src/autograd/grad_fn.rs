//! Gradient functions of host operations

use std::fmt::Debug;

use ndarray::{ArrayD, IxDyn};

use crate::error::Result;

/// Backward rule of one recorded operation.
pub trait GradFn: Debug {
    fn name(&self) -> &str;

    /// Map one gradient per output (`None` when nothing flowed into that
    /// output) to one gradient per input.
    fn apply(&self, grad_outputs: &[Option<ArrayD<f64>>]) -> Result<Vec<Option<ArrayD<f64>>>>;
}

fn first(grads: &[Option<ArrayD<f64>>]) -> Option<&ArrayD<f64>> {
    grads.first().and_then(|g| g.as_ref())
}

/// `sum()` over every element
#[derive(Debug)]
pub struct SumBackward {
    pub shape: Vec<usize>,
}

impl GradFn for SumBackward {
    fn name(&self) -> &str {
        "SumBackward"
    }

    fn apply(&self, grad_outputs: &[Option<ArrayD<f64>>]) -> Result<Vec<Option<ArrayD<f64>>>> {
        let grad = first(grad_outputs).map(|g| {
            let value = g.iter().copied().next().unwrap_or(0.0);
            ArrayD::from_elem(IxDyn(&self.shape), value)
        });
        Ok(vec![grad])
    }
}

#[derive(Debug)]
pub struct AddBackward;

impl GradFn for AddBackward {
    fn name(&self) -> &str {
        "AddBackward"
    }

    fn apply(&self, grad_outputs: &[Option<ArrayD<f64>>]) -> Result<Vec<Option<ArrayD<f64>>>> {
        let grad = first(grad_outputs).cloned();
        Ok(vec![grad.clone(), grad])
    }
}

#[derive(Debug)]
pub struct MulBackward {
    pub lhs: ArrayD<f64>,
    pub rhs: ArrayD<f64>,
}

impl GradFn for MulBackward {
    fn name(&self) -> &str {
        "MulBackward"
    }

    fn apply(&self, grad_outputs: &[Option<ArrayD<f64>>]) -> Result<Vec<Option<ArrayD<f64>>>> {
        Ok(match first(grad_outputs) {
            Some(grad) => vec![Some(grad * &self.rhs), Some(grad * &self.lhs)],
            None => vec![None, None],
        })
    }
}
