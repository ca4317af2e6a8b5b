//! Backward kernel synthesis
//!
//! The backward body replays the forward computation (minus its stores),
//! reading memory as it was before the forward launch. A load that follows a
//! store to the same access reuses the stored value instead. The body then seeds the gradients of declared outputs from caller-supplied buffers,
//! applies adjoint rules in reverse topological order and finally scatters
//! the gradients of declared-input loads.

use log::{debug, trace};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::context::GradContext;
use super::injectivity::{analyze_address, Injectivity, NonAffineReason};
use crate::config::ScatterPolicy;
use crate::error::{DecorateError, SynthesisError};
use crate::ir::{Access, ArithKind, KernelBody, KernelSignature, NodeId, Op, ParamRole, WriteMode};
use crate::rules::{rules, Adjoint, AdjointInput, TiePolicy};

/// Declared inputs and outputs as pointer parameter positions, in
/// declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDeclaration {
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

impl ResolvedDeclaration {
    /// Resolve declared names against a signature. Duplicates are dropped.
    pub fn resolve(
        signature: &KernelSignature,
        inputs: &[String],
        outputs: &[String],
    ) -> Result<Self, DecorateError> {
        if inputs.is_empty() {
            return Err(DecorateError::EmptyDeclaration("inputs"));
        }
        if outputs.is_empty() {
            return Err(DecorateError::EmptyDeclaration("outputs"));
        }
        let lookup = |names: &[String]| -> Result<Vec<usize>, DecorateError> {
            let mut positions = Vec::with_capacity(names.len());
            for name in names {
                let (index, param) = signature
                    .lookup(name)
                    .ok_or_else(|| DecorateError::UnknownParameter(name.clone()))?;
                if param.role != ParamRole::Pointer {
                    return Err(DecorateError::NotAPointer {
                        name: name.clone(),
                        role: param.role,
                    });
                }
                if !positions.contains(&index) {
                    positions.push(index);
                }
            }
            Ok(positions)
        };
        Ok(Self {
            inputs: lookup(inputs)?,
            outputs: lookup(outputs)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackwardOptions {
    pub scatter: ScatterPolicy,
    pub tie_policy: TiePolicy,
}

/// How a gradient scatter site is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScatterDecision {
    AtomicAdd,
    /// Decided per launch from an injectivity certificate.
    Guarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScatterReason {
    Forced,
    /// The gradient buffer is written from this many distinct addresses.
    MultipleSites(usize),
    NonAffine(NonAffineReason),
    Affine,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScatterSite {
    pub input: String,
    pub address: String,
    pub decision: ScatterDecision,
    pub reason: ScatterReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScatterReport {
    pub sites: Vec<ScatterSite>,
}

impl ScatterReport {
    pub fn atomics(&self) -> usize {
        self.sites
            .iter()
            .filter(|s| s.decision == ScatterDecision::AtomicAdd)
            .count()
    }

    pub fn guarded(&self) -> usize {
        self.sites
            .iter()
            .filter(|s| s.decision == ScatterDecision::Guarded)
            .count()
    }
}

/// A synthesized backward kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardKernel {
    pub body: KernelBody,
    /// Seed pointer parameters, one per declared output.
    pub seed_params: Vec<usize>,
    /// Gradient pointer parameters, one per declared input.
    pub grad_params: Vec<usize>,
    pub report: ScatterReport,
}

fn check_declaration(forward: &KernelBody, declaration: &ResolvedDeclaration) -> Result<(), SynthesisError> {
    let touches = |ptr: usize, store: bool| {
        forward
            .nodes
            .iter()
            .any(|n| n.op.is_store() == store && n.op.access().is_some_and(|a| a.ptr == ptr))
    };
    for &output in &declaration.outputs {
        if !touches(output, true) {
            return Err(SynthesisError::OutputNotStored(forward.param_name(output).to_string()));
        }
    }
    for &input in &declaration.inputs {
        if !touches(input, false) {
            return Err(SynthesisError::InputNotLoaded(forward.param_name(input).to_string()));
        }
    }
    Ok(())
}

/// For every load that reads memory written earlier in the same program,
/// the stored value it observes.
///
/// Only the latest store to the pointer is considered, and it must have the
/// same access and element type as the load.
fn forwarded_loads(forward: &KernelBody) -> Result<Vec<Option<NodeId>>, SynthesisError> {
    let mut forwarded = vec![None; forward.len()];
    let mut last_store: FxHashMap<usize, (&Access, NodeId)> = FxHashMap::default();
    for id in forward.ids() {
        match &forward.node(id).op {
            Op::Store { access, value, .. } => {
                last_store.insert(access.ptr, (access, *value));
            }
            Op::Load { access, .. } => {
                let Some(&(stored, value)) = last_store.get(&access.ptr) else {
                    continue;
                };
                if stored != access || forward.dtype(value) != forward.dtype(id) {
                    return Err(SynthesisError::LoadAfterStore {
                        param: forward.param_name(access.ptr).to_string(),
                        node: id,
                    });
                }
                trace!("load {id} reuses stored value {value}");
                forwarded[id.0] = Some(value);
            }
            _ => {}
        }
    }
    Ok(forwarded)
}

/// Forward nodes on a path from a load of a declared input.
fn needs_grad(
    forward: &KernelBody,
    order: &[NodeId],
    declaration: &ResolvedDeclaration,
    forwarded: &[Option<NodeId>],
) -> Vec<bool> {
    let mut needs = vec![false; forward.len()];
    for &id in order {
        let op = &forward.node(id).op;
        needs[id.0] = match op {
            Op::Load { access, .. } => {
                forwarded[id.0].is_none() && declaration.inputs.contains(&access.ptr)
            }
            Op::Store { .. } => false,
            _ => op.operands().iter().any(|o| needs[o.0]),
        };
    }
    needs
}

/// Derive the backward kernel of `forward`.
pub fn synthesize(
    forward: &KernelBody,
    declaration: &ResolvedDeclaration,
    options: &BackwardOptions,
) -> Result<BackwardKernel, SynthesisError> {
    check_declaration(forward, declaration)?;
    let order = forward.topological_order()?;
    let forwarded = forwarded_loads(forward)?;

    let mut signature = forward.signature.clone();
    let mut specialization = forward.specialization.clone();
    let mut extend = |base: String, like: usize| {
        let index = signature.push_unique_pointer(&base);
        let name = signature.params[index].name.clone();
        specialization.pointer_types.insert(name, forward.pointer_type(like));
        index
    };
    let seed_params: Vec<usize> = declaration
        .outputs
        .iter()
        .map(|&o| extend(format!("seed_{}", forward.param_name(o)), o))
        .collect();
    let grad_params: Vec<usize> = declaration
        .inputs
        .iter()
        .map(|&i| extend(format!("grad_{}", forward.param_name(i)), i))
        .collect();

    let mut body = KernelBody::new(&format!("{}_backward", forward.name), signature, specialization);

    // Replay the forward values. Arena order is program order, and operands
    // always precede their users.
    let mut replay = vec![NodeId(usize::MAX); forward.len()];
    for id in forward.ids() {
        let node = forward.node(id);
        if node.op.is_store() {
            continue;
        }
        if let Some(value) = forwarded[id.0] {
            replay[id.0] = replay[value.0];
            continue;
        }
        let op = node.op.map_operands(|o| replay[o.0]);
        replay[id.0] = body.push(op, node.shape.clone(), node.dtype);
    }

    let mut ctx = GradContext::new(needs_grad(forward, &order, declaration, &forwarded));

    // Seed from declared-output stores. Arena order is program order, so the
    // last store to an address is the first one seen here.
    let mut seeded: Vec<&Access> = Vec::new();
    for id in forward.ids().rev() {
        let Op::Store { access, value, .. } = &forward.node(id).op else {
            continue;
        };
        let Some(slot) = declaration.outputs.iter().position(|&o| o == access.ptr) else {
            continue;
        };
        if seeded.contains(&access) {
            trace!("store {id} is overwritten later, no seed");
            continue;
        }
        seeded.push(access);
        if !ctx.needs_grad(*value) {
            continue;
        }
        let seed = body.load(seed_params[slot], access.address.clone(), access.mask.clone(), 0.0)?;
        let seed = body.broadcast_to(seed, forward.shape(*value))?;
        ctx.accumulate(&mut body, *value, seed)?;
    }

    // Reverse walk.
    let mut scatters: Vec<(NodeId, &Access, Vec<NodeId>)> = Vec::new();
    for &id in order.iter().rev() {
        let node = forward.node(id);
        if node.op.is_store() || !ctx.needs_grad(id) {
            continue;
        }
        let Some(grad) = ctx.get(id) else {
            continue;
        };
        let kind = node.op.kind();
        let rule = rules()
            .get(kind)
            .ok_or(SynthesisError::UnsupportedAdjoint { kind, node: id })?;
        match rule.adjoint {
            Adjoint::Propagate(adjoint) => {
                let operands = node.op.operands();
                let input = AdjointInput {
                    node: replay[id.0],
                    operands: operands.iter().map(|o| replay[o.0]).collect(),
                    axis: match &node.op {
                        Op::Reduce { axis, .. } => Some(*axis),
                        _ => None,
                    },
                    grad,
                    tie_policy: options.tie_policy,
                };
                let grads = adjoint(&mut body, &input)?;
                for (operand, operand_grad) in operands.into_iter().zip(grads) {
                    if let Some(operand_grad) = operand_grad {
                        ctx.accumulate(&mut body, operand, operand_grad)?;
                    }
                }
            }
            Adjoint::Scatter => {
                let Op::Load { access, .. } = &node.op else {
                    continue;
                };
                match scatters.iter_mut().find(|(_, a, _)| *a == access) {
                    Some((first, _, grads)) => {
                        *first = id;
                        grads.push(grad);
                    }
                    None => scatters.push((id, access, vec![grad])),
                }
            }
            Adjoint::Seed | Adjoint::Leaf => {}
            Adjoint::Unsupported => return Err(SynthesisError::UnsupportedAdjoint { kind, node: id }),
        }
    }
    scatters.sort_by_key(|(first, _, _)| *first);

    // Scatter into the gradient buffers.
    let mut report = ScatterReport::default();
    for (first, access, grads) in &scatters {
        let Some(slot) = declaration.inputs.iter().position(|&i| i == access.ptr) else {
            continue;
        };
        let mut total = grads[0];
        for &grad in &grads[1..] {
            total = body.arith(ArithKind::Add, &[total, grad])?;
        }

        let sites = scatters.iter().filter(|(_, a, _)| a.ptr == access.ptr).count();
        let (mode, decision, reason) = if options.scatter == ScatterPolicy::ForceAtomic {
            (WriteMode::AtomicAdd, ScatterDecision::AtomicAdd, ScatterReason::Forced)
        } else if sites > 1 {
            (
                WriteMode::AtomicAdd,
                ScatterDecision::AtomicAdd,
                ScatterReason::MultipleSites(sites),
            )
        } else {
            match analyze_address(&access.address, forward.shape(*first)) {
                Injectivity::Affine(cert) => (
                    WriteMode::Guarded(Box::new(cert)),
                    ScatterDecision::Guarded,
                    ScatterReason::Affine,
                ),
                Injectivity::NonAffine(why) => (
                    WriteMode::AtomicAdd,
                    ScatterDecision::AtomicAdd,
                    ScatterReason::NonAffine(why),
                ),
            }
        };
        let input = forward.param_name(access.ptr).to_string();
        debug!("scatter d{input}[{}]: {decision:?} ({reason:?})", access.address);
        report.sites.push(ScatterSite {
            input,
            address: access.address.to_string(),
            decision,
            reason,
        });
        body.store(
            grad_params[slot],
            access.address.clone(),
            access.mask.clone(),
            total,
            mode,
        )?;
    }

    let body = body.eliminate_dead_nodes();
    debug!(
        "synthesized `{}`: {} forward nodes -> {} backward nodes, {} scatter sites ({} atomic)",
        body.name,
        forward.len(),
        body.len(),
        report.sites.len(),
        report.atomics()
    );
    Ok(BackwardKernel {
        body,
        seed_params,
        grad_params,
        report,
    })
}
