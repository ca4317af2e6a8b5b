//! Kernel signatures and kernel bodies
//!
//! A [`KernelBody`] is an arena of [`OpNode`]s. Nodes only reference
//! operands that were pushed before them, so arena order is a valid
//! execution order. The builder methods here make every implicit broadcast
//! explicit: operands of an `Arith` node always share the node's shape.

use std::collections::BTreeMap;
use std::fmt;

use log::trace;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use super::dtype::DType;
use super::index::{AddressExpr, Mask};
use super::node::{Access, ArithKind, NodeId, Op, OpNode, ReduceKind, WriteMode};
use super::shape::{broadcast_all, broadcast_shapes, can_broadcast_to, insert_axis, numel, remove_axis};
use crate::error::IrError;

// ============================================================================
// Signature
// ============================================================================

/// Role of a kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamRole {
    /// Base pointer of a tensor buffer.
    Pointer,
    /// Runtime integer such as a stride or a size.
    Scalar,
    /// Compile-time constant; the body is specialized on its value.
    Constexpr,
}

impl fmt::Display for ParamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamRole::Pointer => write!(f, "pointer"),
            ParamRole::Scalar => write!(f, "scalar"),
            ParamRole::Constexpr => write!(f, "constexpr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub role: ParamRole,
}

impl Param {
    pub fn pointer(name: &str) -> Self {
        Self {
            name: name.to_string(),
            role: ParamRole::Pointer,
        }
    }

    pub fn scalar(name: &str) -> Self {
        Self {
            name: name.to_string(),
            role: ParamRole::Scalar,
        }
    }

    pub fn constexpr(name: &str) -> Self {
        Self {
            name: name.to_string(),
            role: ParamRole::Constexpr,
        }
    }
}

/// Ordered parameter list of a kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelSignature {
    pub params: Vec<Param>,
}

impl KernelSignature {
    pub fn new(params: Vec<Param>) -> Self {
        Self { params }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Position and description of a parameter.
    pub fn lookup(&self, name: &str) -> Option<(usize, &Param)> {
        self.params.iter().enumerate().find(|(_, p)| p.name == name)
    }

    pub fn param(&self, index: usize) -> Option<&Param> {
        self.params.get(index)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn with_role(&self, role: ParamRole) -> impl Iterator<Item = (usize, &Param)> {
        self.params
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.role == role)
    }

    /// Append a pointer whose name does not clash with existing parameters.
    pub fn push_unique_pointer(&mut self, base: &str) -> usize {
        let mut name = base.to_string();
        while self.contains(&name) {
            name.push('_');
        }
        self.params.push(Param::pointer(&name));
        self.params.len() - 1
    }
}

/// Values a kernel body is traced against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Specialization {
    pub constexprs: BTreeMap<String, i64>,
    pub pointer_types: BTreeMap<String, DType>,
}

impl Specialization {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_constexpr(mut self, name: &str, value: i64) -> Self {
        self.constexprs.insert(name.to_string(), value);
        self
    }

    pub fn with_pointer_type(mut self, name: &str, dtype: DType) -> Self {
        self.pointer_types.insert(name.to_string(), dtype);
        self
    }
}

impl fmt::Display for Specialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .pointer_types
            .iter()
            .map(|(name, dtype)| format!("{name}: *{dtype}"))
            .collect();
        parts.extend(self.constexprs.iter().map(|(name, v)| format!("{name}={v}")));
        write!(f, "{}", parts.join(", "))
    }
}

// ============================================================================
// Body
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelBody {
    pub name: String,
    pub signature: KernelSignature,
    pub specialization: Specialization,
    pub nodes: Vec<OpNode>,
}

impl KernelBody {
    pub fn new(name: &str, signature: KernelSignature, specialization: Specialization) -> Self {
        Self {
            name: name.to_string(),
            signature,
            specialization,
            nodes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &OpNode {
        &self.nodes[id.0]
    }

    pub fn shape(&self, id: NodeId) -> &[usize] {
        &self.nodes[id.0].shape
    }

    pub fn dtype(&self, id: NodeId) -> DType {
        self.nodes[id.0].dtype
    }

    pub fn ids(&self) -> impl DoubleEndedIterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    /// Element type of a pointer parameter, from the specialization.
    pub fn pointer_type(&self, ptr: usize) -> DType {
        self.signature
            .param(ptr)
            .and_then(|p| self.specialization.pointer_types.get(&p.name))
            .copied()
            .unwrap_or(DType::F32)
    }

    pub fn param_name(&self, index: usize) -> &str {
        self.signature
            .param(index)
            .map(|p| p.name.as_str())
            .unwrap_or("?")
    }

    pub(crate) fn push(&mut self, op: Op, shape: Vec<usize>, dtype: DType) -> NodeId {
        let id = NodeId(self.nodes.len());
        trace!("{id} = {} {:?} {}", op.kind(), shape, dtype);
        self.nodes.push(OpNode { op, shape, dtype });
        id
    }

    fn check(&self, id: NodeId) -> Result<(), IrError> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(IrError::DanglingOperand {
                node: NodeId(self.nodes.len()),
                operand: id,
            })
        }
    }

    pub fn constant(&mut self, value: f64, shape: Vec<usize>, dtype: DType) -> NodeId {
        self.push(Op::Const { value }, shape, dtype)
    }

    pub fn load(
        &mut self,
        ptr: usize,
        address: AddressExpr,
        mask: Option<Mask>,
        other: f64,
    ) -> Result<NodeId, IrError> {
        let mut shape = address.shape()?;
        if let Some(mask) = &mask {
            shape = broadcast_shapes(&shape, &mask.shape()?)?;
        }
        let dtype = self.pointer_type(ptr);
        let access = Access { ptr, address, mask };
        Ok(self.push(Op::Load { access, other }, shape, dtype))
    }

    /// Append a store. The value is broadcast to the access shape if needed.
    pub fn store(
        &mut self,
        ptr: usize,
        address: AddressExpr,
        mask: Option<Mask>,
        value: NodeId,
        mode: WriteMode,
    ) -> Result<NodeId, IrError> {
        self.check(value)?;
        let mut shapes = vec![address.shape()?, self.shape(value).to_vec()];
        if let Some(mask) = &mask {
            shapes.push(mask.shape()?);
        }
        let shape = broadcast_all(shapes.iter().map(|s| s.as_slice()))?;
        let value = self.broadcast_to(value, &shape)?;
        let dtype = self.dtype(value);
        let access = Access { ptr, address, mask };
        Ok(self.push(Op::Store { access, value, mode }, shape, dtype))
    }

    pub fn arith(&mut self, kind: ArithKind, operands: &[NodeId]) -> Result<NodeId, IrError> {
        if operands.len() != kind.arity() {
            return Err(IrError::Arity {
                op: kind.name().to_string(),
                expected: kind.arity(),
                actual: operands.len(),
            });
        }
        for &id in operands {
            self.check(id)?;
        }
        let shape = broadcast_all(operands.iter().map(|&id| self.shape(id)))?;
        let mut aligned = Vec::with_capacity(operands.len());
        for &id in operands {
            aligned.push(self.broadcast_to(id, &shape)?);
        }
        let dtype = match kind {
            ArithKind::Cmp(_) => DType::Bool,
            ArithKind::Select => self.dtype(aligned[1]).promote(self.dtype(aligned[2])),
            _ => aligned
                .iter()
                .map(|&id| self.dtype(id))
                .reduce(DType::promote)
                .unwrap_or(DType::F32),
        };
        Ok(self.push(
            Op::Arith {
                kind,
                operands: aligned,
            },
            shape,
            dtype,
        ))
    }

    pub fn reduce(&mut self, kind: ReduceKind, operand: NodeId, axis: usize) -> Result<NodeId, IrError> {
        self.check(operand)?;
        let shape = remove_axis(self.shape(operand), axis)?;
        let dtype = self.dtype(operand);
        Ok(self.push(
            Op::Reduce {
                kind,
                operand,
                axis,
            },
            shape,
            dtype,
        ))
    }

    /// Broadcast to `shape`; a no-op when the shape already matches.
    pub fn broadcast_to(&mut self, operand: NodeId, shape: &[usize]) -> Result<NodeId, IrError> {
        self.check(operand)?;
        let from = self.shape(operand);
        if from == shape {
            return Ok(operand);
        }
        if !can_broadcast_to(from, shape) {
            return Err(IrError::Broadcast {
                lhs: from.to_vec(),
                rhs: shape.to_vec(),
            });
        }
        let dtype = self.dtype(operand);
        Ok(self.push(Op::Broadcast { operand }, shape.to_vec(), dtype))
    }

    /// Reshape to `shape`; a no-op when the shape already matches.
    pub fn reshape(&mut self, operand: NodeId, shape: &[usize]) -> Result<NodeId, IrError> {
        self.check(operand)?;
        let from = self.shape(operand);
        if from == shape {
            return Ok(operand);
        }
        if numel(from) != numel(shape) {
            return Err(IrError::Reshape {
                from: from.to_vec(),
                to: shape.to_vec(),
            });
        }
        let dtype = self.dtype(operand);
        Ok(self.push(Op::Reshape { operand }, shape.to_vec(), dtype))
    }

    pub fn expand_dims(&mut self, operand: NodeId, axis: usize) -> Result<NodeId, IrError> {
        self.check(operand)?;
        let shape = insert_axis(self.shape(operand), axis)?;
        self.reshape(operand, &shape)
    }

    /// Topological order of all nodes, failing on cycles or dangling operands.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, IrError> {
        let mut graph: DiGraph<NodeId, ()> = DiGraph::with_capacity(self.nodes.len(), self.nodes.len());
        let indices: Vec<NodeIndex> = self.ids().map(|id| graph.add_node(id)).collect();
        for (i, node) in self.nodes.iter().enumerate() {
            for operand in node.op.operands() {
                let Some(&src) = indices.get(operand.0) else {
                    return Err(IrError::DanglingOperand {
                        node: NodeId(i),
                        operand,
                    });
                };
                graph.add_edge(src, indices[i], ());
            }
        }
        toposort(&graph, None)
            .map(|order| order.into_iter().map(|ix| graph[ix]).collect())
            .map_err(|cycle| IrError::Cycle(graph[cycle.node_id()]))
    }

    /// Consumers of every node.
    pub fn users(&self) -> Vec<Vec<NodeId>> {
        let mut users = vec![Vec::new(); self.nodes.len()];
        for id in self.ids() {
            for operand in self.node(id).op.operands() {
                if let Some(slot) = users.get_mut(operand.0) {
                    slot.push(id);
                }
            }
        }
        users
    }

    /// Drop nodes that do not feed any store, renumbering the rest.
    pub fn eliminate_dead_nodes(&self) -> KernelBody {
        let mut live = vec![false; self.nodes.len()];
        for id in self.ids().rev() {
            if self.node(id).op.is_store() {
                live[id.0] = true;
            }
            if live[id.0] {
                for operand in self.node(id).op.operands() {
                    if let Some(flag) = live.get_mut(operand.0) {
                        *flag = true;
                    }
                }
            }
        }

        let mut remap = vec![NodeId(usize::MAX); self.nodes.len()];
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if !live[i] {
                continue;
            }
            remap[i] = NodeId(nodes.len());
            nodes.push(OpNode {
                op: node.op.map_operands(|id| remap[id.0]),
                shape: node.shape.clone(),
                dtype: node.dtype,
            });
        }
        trace!(
            "dce on `{}`: {} -> {} nodes",
            self.name,
            self.nodes.len(),
            nodes.len()
        );
        KernelBody {
            name: self.name.clone(),
            signature: self.signature.clone(),
            specialization: self.specialization.clone(),
            nodes,
        }
    }

    /// Decide every guarded write for a concrete launch.
    pub fn resolve_writes(
        &self,
        grid: [usize; 3],
        lookup: &dyn Fn(&str) -> Option<i64>,
    ) -> (KernelBody, WriteSummary) {
        let mut summary = WriteSummary::default();
        let mut body = self.clone();
        for node in &mut body.nodes {
            if let Op::Store { mode, .. } = &mut node.op {
                let resolved = match &*mode {
                    WriteMode::Guarded(cert) => {
                        if cert.holds(grid, lookup) {
                            WriteMode::Store
                        } else {
                            WriteMode::AtomicAdd
                        }
                    }
                    other => other.clone(),
                };
                match resolved {
                    WriteMode::Store => summary.stores += 1,
                    _ => summary.atomics += 1,
                }
                *mode = resolved;
            }
        }
        (body, summary)
    }

    pub fn count_writes(&self, pred: impl Fn(&WriteMode) -> bool) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(&n.op, Op::Store { mode, .. } if pred(mode)))
            .count()
    }
}

/// Counts of write modes after resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub stores: usize,
    pub atomics: usize,
}
