//! Address and operation model
//!
//! Traced kernels are stored as arenas of [`OpNode`]s ([`KernelBody`]).
//! Memory accesses carry symbolic [`AddressExpr`] offsets so that aliasing
//! can be decided structurally.

pub mod certificate;
pub mod dtype;
pub mod index;
pub mod kernel;
pub mod node;
pub mod render;
pub mod shape;

pub use certificate::{CertificateTerm, IndexVar, ScatterCertificate};
pub use dtype::DType;
pub use index::{AddressExpr, Mask};
pub use kernel::{KernelBody, KernelSignature, Param, ParamRole, Specialization, WriteSummary};
pub use node::{Access, ArithKind, CmpKind, NodeId, Op, OpKind, OpNode, ReduceKind, WriteMode};
pub use render::render_kernel;
