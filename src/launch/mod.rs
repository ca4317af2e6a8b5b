//! Launch adapter
//!
//! [`decorate`] turns a [`TileKernel`](crate::trace::TileKernel) into a
//! [`DifferentiableKernel`]: calling it launches the forward kernel and
//! records the call in the host autograd, whose backward pass launches the
//! synthesized backward kernel on the same grid.

mod args;
mod kernel;

pub use args::KernelArg;
pub use kernel::{decorate, CompiledKernel, Decorator, DifferentiableKernel, SavedLaunch};
