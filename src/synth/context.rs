//! Gradient bookkeeping during backward synthesis

use rustc_hash::FxHashMap;

use crate::error::IrError;
use crate::ir::{ArithKind, KernelBody, NodeId};

/// Accumulated gradient of every forward node, as nodes of the backward body.
#[derive(Debug, Default)]
pub(crate) struct GradContext {
    grads: FxHashMap<NodeId, NodeId>,
    /// Forward nodes on a path from a declared-input load.
    needs_grad: Vec<bool>,
}

impl GradContext {
    pub fn new(needs_grad: Vec<bool>) -> Self {
        Self {
            grads: FxHashMap::default(),
            needs_grad,
        }
    }

    pub fn needs_grad(&self, node: NodeId) -> bool {
        self.needs_grad.get(node.0).copied().unwrap_or(false)
    }

    pub fn get(&self, node: NodeId) -> Option<NodeId> {
        self.grads.get(&node).copied()
    }

    /// Add `grad` into the accumulator of `node`. Nodes that do not need a
    /// gradient are ignored.
    pub fn accumulate(&mut self, body: &mut KernelBody, node: NodeId, grad: NodeId) -> Result<(), IrError> {
        if !self.needs_grad(node) {
            return Ok(());
        }
        let total = match self.grads.get(&node) {
            Some(&existing) => body.arith(ArithKind::Add, &[existing, grad])?,
            None => grad,
        };
        self.grads.insert(node, total);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AddressExpr, DType, KernelSignature, Op, Param, Specialization};

    #[test]
    fn test_fan_out_is_summed() {
        let sig = KernelSignature::new(vec![Param::pointer("x")]);
        let mut body = KernelBody::new("b", sig, Specialization::new().with_pointer_type("x", DType::F32));
        let a = body.load(0, AddressExpr::Const(0), None, 0.0).unwrap();
        let b = body.load(0, AddressExpr::Const(1), None, 0.0).unwrap();

        let mut ctx = GradContext::new(vec![true, false]);
        ctx.accumulate(&mut body, NodeId(0), a).unwrap();
        ctx.accumulate(&mut body, NodeId(0), b).unwrap();
        ctx.accumulate(&mut body, NodeId(1), b).unwrap();

        let total = ctx.get(NodeId(0)).unwrap();
        assert!(matches!(body.node(total).op, Op::Arith { kind: ArithKind::Add, .. }));
        assert_eq!(ctx.get(NodeId(1)), None);
    }
}
