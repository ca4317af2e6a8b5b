//! Host tensor with reverse-mode gradient tracking

use std::cell::RefCell;
use std::fmt;
use std::ops::{Add, Mul};
use std::rc::Rc;

use ndarray::{ArrayD, IxDyn};
use rand::Rng;

use super::backward::run_backward;
use super::grad_fn::{AddBackward, GradFn, MulBackward, SumBackward};
use crate::error::{AutogradError, IrError, Result};
use crate::ir::DType;

/// A recorded operation: its gradient function and the tensors it consumed.
pub(super) struct Node {
    pub grad_fn: Box<dyn GradFn>,
    pub inputs: Vec<Tensor>,
    pub num_outputs: usize,
}

struct TensorInner {
    data: RefCell<ArrayD<f64>>,
    dtype: DType,
    requires_grad: bool,
    grad: RefCell<Option<ArrayD<f64>>>,
    /// Producing node and output index; `None` for leaves.
    origin: Option<(Rc<Node>, usize)>,
}

/// Reference-counted host tensor. Values are kept as `f64` and rounded to the
/// element type.
#[derive(Clone)]
pub struct Tensor(Rc<TensorInner>);

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape())
            .field("dtype", &self.0.dtype)
            .field("requires_grad", &self.0.requires_grad)
            .field("grad_fn", &self.0.origin.as_ref().map(|(node, _)| node.grad_fn.name()))
            .finish()
    }
}

impl Tensor {
    fn leaf(data: ArrayD<f64>, dtype: DType, requires_grad: bool) -> Self {
        Self(Rc::new(TensorInner {
            data: RefCell::new(data.mapv(|v| dtype.round(v))),
            dtype,
            requires_grad,
            grad: RefCell::new(None),
            origin: None,
        }))
    }

    pub fn from_array(data: ArrayD<f64>, dtype: DType) -> Self {
        Self::leaf(data, dtype, false)
    }

    /// Row-major values with the given shape.
    pub fn from_vec(data: Vec<f64>, shape: &[usize], dtype: DType) -> Result<Self> {
        let len = data.len();
        let array = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| IrError::Reshape {
            from: vec![len],
            to: shape.to_vec(),
        })?;
        Ok(Self::from_array(array, dtype))
    }

    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self::from_array(ArrayD::zeros(IxDyn(shape)), dtype)
    }

    /// Uniform values in `[-1, 1)`.
    pub fn rand<R: Rng>(shape: &[usize], dtype: DType, rng: &mut R) -> Self {
        let data = ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.gen_range(-1.0..1.0));
        Self::from_array(data, dtype)
    }

    /// The same values as a leaf with gradient tracking switched on or off.
    pub fn requires_grad_(self, requires_grad: bool) -> Self {
        let data = self.to_array();
        Self::leaf(data, self.0.dtype, requires_grad)
    }

    /// A leaf copy with no gradient tracking.
    pub fn detach(&self) -> Self {
        Self::leaf(self.to_array(), self.0.dtype, false)
    }

    /// Tensors produced by a recorded operation over `inputs`.
    ///
    /// The outputs track gradients if any input does; `grad_fn` then
    /// receives one gradient per output during backward.
    pub fn from_function(
        outputs: Vec<(ArrayD<f64>, DType)>,
        inputs: Vec<Tensor>,
        grad_fn: impl GradFn + 'static,
    ) -> Vec<Tensor> {
        let requires_grad = inputs.iter().any(Tensor::requires_grad);
        let node = requires_grad.then(|| {
            Rc::new(Node {
                grad_fn: Box::new(grad_fn),
                inputs,
                num_outputs: outputs.len(),
            })
        });
        outputs
            .into_iter()
            .enumerate()
            .map(|(index, (data, dtype))| {
                Self(Rc::new(TensorInner {
                    data: RefCell::new(data.mapv(|v| dtype.round(v))),
                    dtype,
                    requires_grad,
                    grad: RefCell::new(None),
                    origin: node.as_ref().map(|n| (Rc::clone(n), index)),
                }))
            })
            .collect()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.data.borrow().shape().to_vec()
    }

    /// Row-major strides, in elements.
    pub fn strides(&self) -> Vec<usize> {
        let shape = self.shape();
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    pub fn numel(&self) -> usize {
        self.0.data.borrow().len()
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn to_array(&self) -> ArrayD<f64> {
        self.0.data.borrow().clone()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.0.data.borrow().iter().copied().collect()
    }

    /// The single value of a one-element tensor.
    pub fn item(&self) -> Option<f64> {
        let data = self.0.data.borrow();
        (data.len() == 1).then(|| data.iter().copied().next()).flatten()
    }

    /// Replace the values in place, rounding to the element type.
    pub(crate) fn overwrite(&self, data: ArrayD<f64>) {
        let dtype = self.0.dtype;
        *self.0.data.borrow_mut() = data.mapv(|v| dtype.round(v));
    }

    pub fn requires_grad(&self) -> bool {
        self.0.requires_grad
    }

    pub fn is_leaf(&self) -> bool {
        self.0.origin.is_none()
    }

    /// Gradient accumulated into this leaf by backward passes.
    pub fn grad(&self) -> Option<Tensor> {
        self.0
            .grad
            .borrow()
            .as_ref()
            .map(|g| Tensor::from_array(g.clone(), self.0.dtype))
    }

    pub fn zero_grad(&self) {
        *self.0.grad.borrow_mut() = None;
    }

    pub(super) fn origin(&self) -> Option<&(Rc<Node>, usize)> {
        self.0.origin.as_ref()
    }

    pub(super) fn accumulate_grad(&self, grad: ArrayD<f64>) {
        let mut slot = self.0.grad.borrow_mut();
        *slot = Some(match slot.take() {
            Some(existing) => existing + grad,
            None => grad,
        });
    }

    /// Backpropagate from a one-element tensor.
    pub fn backward(&self) -> Result<()> {
        if self.numel() != 1 {
            return Err(AutogradError::NonScalar(self.shape()).into());
        }
        run_backward(self, ArrayD::ones(IxDyn(&self.shape())))
    }

    /// Backpropagate with an explicit output gradient.
    pub fn backward_with(&self, grad: &Tensor) -> Result<()> {
        if grad.shape() != self.shape() {
            return Err(AutogradError::GradientShape {
                expected: self.shape(),
                actual: grad.shape(),
            }
            .into());
        }
        run_backward(self, grad.to_array())
    }

    /// Sum of all elements, as a scalar tensor.
    pub fn sum(&self) -> Tensor {
        let total = self.0.data.borrow().sum();
        let grad_fn = SumBackward { shape: self.shape() };
        let mut outputs = Tensor::from_function(
            vec![(ArrayD::from_elem(IxDyn(&[]), total), self.0.dtype)],
            vec![self.clone()],
            grad_fn,
        );
        outputs.remove(0)
    }

    fn check_same_shape(&self, op: &'static str, rhs: &Tensor) -> Result<()> {
        if self.shape() != rhs.shape() {
            return Err(AutogradError::ShapeMismatch {
                op,
                lhs: self.shape(),
                rhs: rhs.shape(),
            }
            .into());
        }
        Ok(())
    }

    /// Elementwise sum of two tensors of the same shape.
    pub fn try_add(&self, rhs: &Tensor) -> Result<Tensor> {
        self.check_same_shape("add", rhs)?;
        let data = &*self.0.data.borrow() + &*rhs.0.data.borrow();
        let dtype = self.dtype().promote(rhs.dtype());
        let mut outputs = Tensor::from_function(vec![(data, dtype)], vec![self.clone(), rhs.clone()], AddBackward);
        Ok(outputs.remove(0))
    }

    /// Elementwise product of two tensors of the same shape.
    pub fn try_mul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.check_same_shape("mul", rhs)?;
        let (lhs, rhs_data) = (self.to_array(), rhs.to_array());
        let data = &lhs * &rhs_data;
        let dtype = self.dtype().promote(rhs.dtype());
        let grad_fn = MulBackward { lhs, rhs: rhs_data };
        let mut outputs = Tensor::from_function(vec![(data, dtype)], vec![self.clone(), rhs.clone()], grad_fn);
        Ok(outputs.remove(0))
    }
}

impl Add for &Tensor {
    type Output = Tensor;

    /// Elementwise sum.
    ///
    /// # Panics
    ///
    /// Panics if the shapes differ; use [`Tensor::try_add`] to get an error.
    fn add(self, rhs: &Tensor) -> Tensor {
        match self.try_add(rhs) {
            Ok(sum) => sum,
            Err(err) => panic!("{err}"),
        }
    }
}

impl Mul for &Tensor {
    type Output = Tensor;

    /// Elementwise product.
    ///
    /// # Panics
    ///
    /// Panics if the shapes differ; use [`Tensor::try_mul`] to get an error.
    fn mul(self, rhs: &Tensor) -> Tensor {
        match self.try_mul(rhs) {
            Ok(product) => product,
            Err(err) => panic!("{err}"),
        }
    }
}
