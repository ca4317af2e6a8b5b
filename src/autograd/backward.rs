//! Backward pass over recorded host operations

use std::rc::Rc;

use log::trace;
use ndarray::ArrayD;
use rustc_hash::{FxHashMap, FxHashSet};

use super::tensor::{Node, Tensor};
use crate::error::{AutogradError, Result};

fn node_key(node: &Rc<Node>) -> usize {
    Rc::as_ptr(node) as usize
}

/// Nodes reachable from `root`, consumers before producers.
fn reverse_topological(root: &Rc<Node>) -> Vec<Rc<Node>> {
    fn visit(node: &Rc<Node>, visited: &mut FxHashSet<usize>, order: &mut Vec<Rc<Node>>) {
        if !visited.insert(node_key(node)) {
            return;
        }
        for input in &node.inputs {
            if let Some((producer, _)) = input.origin() {
                visit(producer, visited, order);
            }
        }
        order.push(Rc::clone(node));
    }

    let mut visited = FxHashSet::default();
    let mut order = Vec::new();
    visit(root, &mut visited, &mut order);
    order.reverse();
    order
}

pub(super) fn run_backward(root: &Tensor, grad: ArrayD<f64>) -> Result<()> {
    if !root.requires_grad() {
        return Ok(());
    }
    let Some((root_node, root_index)) = root.origin() else {
        root.accumulate_grad(grad);
        return Ok(());
    };

    let mut pending: FxHashMap<usize, Vec<Option<ArrayD<f64>>>> = FxHashMap::default();
    let mut seed = vec![None; root_node.num_outputs];
    seed[*root_index] = Some(grad);
    pending.insert(node_key(root_node), seed);

    for node in reverse_topological(root_node) {
        let Some(grads) = pending.remove(&node_key(&node)) else {
            continue;
        };
        if grads.iter().all(Option::is_none) {
            continue;
        }
        trace!("backward through {}", node.grad_fn.name());
        let input_grads = node.grad_fn.apply(&grads)?;
        if input_grads.len() != node.inputs.len() {
            return Err(AutogradError::GradientCount {
                function: node.grad_fn.name().to_string(),
                expected: node.inputs.len(),
                actual: input_grads.len(),
            }
            .into());
        }

        for (input, grad) in node.inputs.iter().zip(input_grads) {
            let Some(grad) = grad else {
                continue;
            };
            if !input.requires_grad() {
                continue;
            }
            if grad.shape() != input.shape().as_slice() {
                return Err(AutogradError::GradientShape {
                    expected: input.shape(),
                    actual: grad.shape().to_vec(),
                }
                .into());
            }
            match input.origin() {
                Some((producer, index)) => {
                    let slots = pending
                        .entry(node_key(producer))
                        .or_insert_with(|| vec![None; producer.num_outputs]);
                    slots[*index] = Some(match slots[*index].take() {
                        Some(existing) => existing + grad,
                        None => grad,
                    });
                }
                None => input.accumulate_grad(grad),
            }
        }
    }
    Ok(())
}
