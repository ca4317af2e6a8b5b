//! Kernel execution
//!
//! [`KernelExecutor`] is the seam to whatever actually runs kernel bodies.
//! [`CpuExecutor`] is a reference interpreter: it runs every program
//! instance of a launch on the host, one after another.

mod cpu;
mod eval;

pub use cpu::{CpuExecutor, Schedule};

use crate::error::ExecError;
use crate::ir::{DType, KernelBody};

/// Launch grid: program counts along axes 0, 1 and 2.
pub type Grid = [usize; 3];

/// Flat device buffer behind a pointer argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub data: Vec<f64>,
    pub dtype: DType,
}

impl Buffer {
    /// Wrap values, rounding them to `dtype`.
    pub fn from_vec(data: Vec<f64>, dtype: DType) -> Self {
        let data = data.into_iter().map(|v| dtype.round(v)).collect();
        Self { data, dtype }
    }

    pub fn zeros(len: usize, dtype: DType) -> Self {
        Self {
            data: vec![0.0; len],
            dtype,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A launch argument, in signature order.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Buffer(Buffer),
    /// Scalar or compile-time constant.
    Int(i64),
}

impl ArgValue {
    pub fn as_buffer(&self) -> Option<&Buffer> {
        match self {
            ArgValue::Buffer(buffer) => Some(buffer),
            ArgValue::Int(_) => None,
        }
    }

    pub fn into_buffer(self) -> Option<Buffer> {
        match self {
            ArgValue::Buffer(buffer) => Some(buffer),
            ArgValue::Int(_) => None,
        }
    }
}

/// Runs a kernel body over a grid.
///
/// Program instances may run in any order; the only communication between
/// them is through atomic-add writes.
pub trait KernelExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn launch(&self, kernel: &KernelBody, grid: Grid, args: &mut [ArgValue]) -> Result<(), ExecError>;
}

/// Check that every grid dimension is positive.
pub fn validate_grid(grid: Grid) -> bool {
    grid.iter().all(|&n| n > 0)
}
