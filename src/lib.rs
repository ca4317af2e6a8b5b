//! tilegrad: backward kernels for tile-based forward kernels
//!
//! A forward kernel is written once against a [`TileContext`](trace::TileContext).
//! tilegrad traces it into an operation graph, walks the graph in reverse
//! applying adjoint rules, and emits a backward kernel whose gradient writes
//! are plain stores where the write pattern is provably injective and atomic
//! adds everywhere else.
//!
//! # Architecture
//!
//! - **ir**: address expressions, operation nodes and kernel bodies
//! - **trace**: turns a kernel closure into a [`KernelBody`](ir::KernelBody)
//! - **rules**: value semantics and adjoint rules per operation kind
//! - **synth**: backward synthesis and the injectivity analysis
//! - **exec**: the executor seam and a host reference executor
//! - **autograd**: host tensors with reverse-mode differentiation
//! - **launch**: decorated kernels that tie all of the above together
//!
//! # Environment
//!
//! [`DiffConfig::from_env`](config::DiffConfig::from_env) reads
//! `TILEGRAD_FORCE_ATOMIC`, `TILEGRAD_TIE_POLICY`, `TILEGRAD_MAX_UNROLL` and
//! `TILEGRAD_DUMP_DIR`.

// ============================================================================
// Core Modules
// ============================================================================

pub mod autograd;
pub mod config;
pub mod dump;
pub mod error;
pub mod exec;
pub mod ir;
pub mod launch;
pub mod rules;
pub mod synth;
pub mod trace;

// ============================================================================
// Re-exports
// ============================================================================

pub use autograd::Tensor;
pub use config::{DiffConfig, ScatterPolicy};
pub use error::{Error, Result};
pub use ir::DType;
pub use launch::{decorate, DifferentiableKernel, KernelArg};
pub use trace::{TileContext, TileKernel};

// ============================================================================
// Prelude
// ============================================================================

/// Prelude module with commonly used types and traits
pub mod prelude {
    pub use crate::autograd::Tensor;
    pub use crate::config::{DiffConfig, ScatterPolicy};
    pub use crate::exec::{CpuExecutor, Grid, KernelExecutor, Schedule};
    pub use crate::ir::{DType, Param};
    pub use crate::launch::{decorate, DifferentiableKernel, KernelArg};
    pub use crate::rules::TiePolicy;
    pub use crate::trace::{cdiv, TileContext, TileKernel};
}
