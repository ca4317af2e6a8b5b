//! Kernel tracer
//!
//! A kernel body is an ordinary Rust closure over a [`TileContext`]. Tracing
//! runs it once against placeholder arguments; every primitive it calls
//! appends a node to a [`KernelBody`]. Bounded loops are unrolled, so the
//! result is loop-free.

mod context;
mod pointer;
mod state;
mod value;

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use log::debug;

pub use context::{cdiv, TileContext};
pub use pointer::Pointer;
pub use value::{TileOperand, TileRepr, TileValue};

use crate::error::TraceError;
use crate::ir::{KernelBody, KernelSignature, Param, ParamRole, Specialization};
use state::TraceState;

/// Body of a tile kernel.
pub type KernelFn = dyn Fn(&TileContext) + Send + Sync;

/// A forward kernel: name, parameter list and body.
#[derive(Clone)]
pub struct TileKernel {
    name: String,
    signature: KernelSignature,
    body: Arc<KernelFn>,
}

impl fmt::Debug for TileKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileKernel")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

impl TileKernel {
    pub fn new<F>(name: &str, params: Vec<Param>, body: F) -> Self
    where
        F: Fn(&TileContext) + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            signature: KernelSignature::new(params),
            body: Arc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &KernelSignature {
        &self.signature
    }

    pub fn has_constexprs(&self) -> bool {
        self.signature.with_role(ParamRole::Constexpr).next().is_some()
    }
}

/// Trace `kernel` for one specialization.
///
/// Fails with the first error the body ran into; a partial graph is never
/// returned.
pub fn trace(
    kernel: &TileKernel,
    specialization: &Specialization,
    max_unroll: u64,
) -> Result<KernelBody, TraceError> {
    for (_, param) in kernel.signature.with_role(ParamRole::Constexpr) {
        if !specialization.constexprs.contains_key(&param.name) {
            return Err(TraceError::MissingConstexpr(param.name.clone()));
        }
    }
    for (_, param) in kernel.signature.with_role(ParamRole::Pointer) {
        if !specialization.pointer_types.contains_key(&param.name) {
            return Err(TraceError::MissingPointerType(param.name.clone()));
        }
    }

    let body = KernelBody::new(&kernel.name, kernel.signature.clone(), specialization.clone());
    let state = Rc::new(TraceState::new(body, max_unroll));
    let context = TileContext::new(Rc::clone(&state));
    (kernel.body)(&context);
    drop(context);

    let unrolled = state.unrolled();
    let body = state.finish()?;
    debug!(
        "traced `{}` [{}]: {} nodes, {} unrolled iterations",
        body.name,
        specialization,
        body.len(),
        unrolled
    );
    Ok(body)
}
