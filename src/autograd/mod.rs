//! Host tensors and reverse-mode autograd
//!
//! A minimal tensor graph the launch adapter registers kernel calls in.
//! Operations record a [`GradFn`] node; `backward` walks the nodes from the
//! output and accumulates gradients into leaf tensors.

mod backward;
mod grad_fn;
mod tensor;

pub use grad_fn::{AddBackward, GradFn, MulBackward, SumBackward};
pub use tensor::Tensor;
