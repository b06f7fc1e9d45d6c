//! Computation graph recorded by the host engine while a gradient session is
//! open.
//!
//! Nodes are appended in execution order, so every node's inputs have smaller
//! ids than the node itself and descending id order is a valid
//! reverse-topological order.

use std::collections::{HashMap, HashSet};

use super::kernels::{self, Value};
use crate::engine::{BinaryOp, RawHandle, UnaryOp};
use crate::error::{EmberError, Result};
use crate::types::DataType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(usize);

/// A value together with the graph node that produced it, if recorded.
#[derive(Debug, Clone)]
pub(crate) struct Traced {
    pub value: Value,
    pub node: Option<NodeId>,
}

impl Traced {
    pub fn constant(value: Value) -> Self {
        Self { value, node: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TapeOp {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Reshape(Vec<usize>),
    Cast(DataType),
    /// Broadcast of a single element; the adjoint of `Sum`.
    Expand(Vec<usize>),
    /// Cross-context copy; values are unchanged.
    Copy,
}

#[derive(Debug)]
struct Node {
    op: Option<TapeOp>,
    inputs: Vec<Option<NodeId>>,
    saved: Vec<Traced>,
    /// Set for gradient-bearing leaves: where the gradient lands.
    leaf: Option<RawHandle>,
    released: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Tape {
    nodes: Vec<Node>,
}

impl Tape {
    /// Registers a gradient-bearing leaf backed by `slot`.
    pub fn leaf(&mut self, slot: RawHandle) -> NodeId {
        self.push(Node {
            op: None,
            inputs: Vec::new(),
            saved: Vec::new(),
            leaf: Some(slot),
            released: false,
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes whose saved state was discarded by a backward pass.
    #[cfg(test)]
    pub fn released(&self) -> usize {
        self.nodes.iter().filter(|n| n.released).count()
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Nodes reachable from `root`, in reverse-topological order.
    fn reverse_topological(&self, root: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(id.0) {
                stack.extend(node.inputs.iter().flatten().copied());
            }
        }
        let mut order: Vec<NodeId> = seen.into_iter().collect();
        order.sort_unstable_by(|a, b| b.cmp(a));
        order
    }

    /// Walks the graph backward from `root`, seeded with `seed`.
    ///
    /// Returns the gradient reaching each leaf. With `create_graph` the
    /// gradient computation is itself recorded on this tape, so the returned
    /// gradients carry nodes of their own. Without `retain`, every non-leaf
    /// node visited drops its saved state and any later pass through it fails
    /// with [`EmberError::GraphConsumed`].
    pub fn backward(
        &mut self,
        root: NodeId,
        seed: Traced,
        retain: bool,
        create_graph: bool,
    ) -> Result<Vec<(RawHandle, Traced)>> {
        let order = self.reverse_topological(root);
        if order.iter().any(|id| self.nodes[id.0].released) {
            return Err(EmberError::GraphConsumed);
        }

        let mut grads: HashMap<NodeId, Traced> = HashMap::new();
        grads.insert(root, seed);
        let mut leaves = Vec::new();

        for id in &order {
            let Some(grad) = grads.remove(id) else {
                continue;
            };
            let node = &self.nodes[id.0];
            if let Some(slot) = node.leaf {
                leaves.push((slot, grad));
                continue;
            }
            let Some(op) = node.op.clone() else {
                continue;
            };
            let saved = node.saved.clone();
            let inputs = node.inputs.clone();

            let input_grads = {
                let tape = if create_graph { Some(&mut *self) } else { None };
                vjp(&op, &saved, &grad, tape)?
            };
            for (input, input_grad) in inputs.into_iter().zip(input_grads) {
                let Some(input) = input else {
                    continue;
                };
                let merged = match grads.remove(&input) {
                    Some(prev) => {
                        let tape = if create_graph { Some(&mut *self) } else { None };
                        apply(tape, &TapeOp::Binary(BinaryOp::Add), &[&prev, &input_grad])?
                    }
                    None => input_grad,
                };
                grads.insert(input, merged);
            }
        }

        if !retain {
            for id in &order {
                let node = &mut self.nodes[id.0];
                if node.leaf.is_none() {
                    node.released = true;
                    node.saved.clear();
                }
            }
        }
        Ok(leaves)
    }
}

fn compute(op: &TapeOp, inputs: &[&Traced]) -> Result<Value> {
    let first = inputs
        .first()
        .map(|t| &t.value)
        .ok_or_else(|| EmberError::invalid_shape("operation without operands"))?;
    match op {
        TapeOp::Unary(op) => Ok(kernels::unary(*op, first)),
        TapeOp::Binary(op) => {
            let rhs = inputs
                .get(1)
                .map(|t| &t.value)
                .ok_or_else(|| EmberError::invalid_shape("binary operation needs two operands"))?;
            kernels::binary(*op, first, rhs)
        }
        TapeOp::Reshape(shape) => kernels::reshape(first, shape),
        TapeOp::Cast(dtype) => Ok(kernels::cast(first, *dtype)),
        TapeOp::Expand(shape) => kernels::expand(first, shape),
        TapeOp::Copy => Ok(first.clone()),
    }
}

/// Runs `op` and records it on `tape` when one is given and any operand is
/// tracked.
pub(crate) fn apply(tape: Option<&mut Tape>, op: &TapeOp, inputs: &[&Traced]) -> Result<Traced> {
    let value = compute(op, inputs)?;
    let tracked = inputs.iter().any(|t| t.node.is_some());
    let node = match tape {
        Some(tape) if tracked => Some(tape.push(Node {
            op: Some(op.clone()),
            inputs: inputs.iter().map(|t| t.node).collect(),
            saved: inputs.iter().map(|t| (*t).clone()).collect(),
            leaf: None,
            released: false,
        })),
        _ => None,
    };
    Ok(Traced { value, node })
}

/// Vector-Jacobian product of `op`: the gradient of each input given the
/// gradient of the output.
fn vjp(
    op: &TapeOp,
    saved: &[Traced],
    grad: &Traced,
    mut tape: Option<&mut Tape>,
) -> Result<Vec<Traced>> {
    let x = saved
        .first()
        .ok_or_else(|| EmberError::invalid_shape("recorded node without operands"))?;
    let grads = match op {
        TapeOp::Unary(UnaryOp::Neg) => {
            vec![apply(tape, &TapeOp::Unary(UnaryOp::Neg), &[grad])?]
        }
        TapeOp::Unary(UnaryOp::Exp) => {
            let ex = apply(tape.as_deref_mut(), &TapeOp::Unary(UnaryOp::Exp), &[x])?;
            vec![apply(tape, &TapeOp::Binary(BinaryOp::Mul), &[grad, &ex])?]
        }
        TapeOp::Unary(UnaryOp::Log) => {
            vec![apply(tape, &TapeOp::Binary(BinaryOp::Div), &[grad, x])?]
        }
        TapeOp::Unary(UnaryOp::AddScalar(_)) => vec![grad.clone()],
        TapeOp::Unary(UnaryOp::MulScalar(c)) => {
            vec![apply(tape, &TapeOp::Unary(UnaryOp::MulScalar(*c)), &[grad])?]
        }
        TapeOp::Unary(UnaryOp::Sum) => {
            vec![apply(tape, &TapeOp::Expand(x.value.shape.clone()), &[grad])?]
        }
        TapeOp::Binary(op) => {
            let y = saved
                .get(1)
                .ok_or_else(|| EmberError::invalid_shape("binary node without rhs"))?;
            match op {
                BinaryOp::Add => vec![grad.clone(), grad.clone()],
                BinaryOp::Sub => vec![
                    grad.clone(),
                    apply(tape, &TapeOp::Unary(UnaryOp::Neg), &[grad])?,
                ],
                BinaryOp::Mul => vec![
                    apply(tape.as_deref_mut(), &TapeOp::Binary(BinaryOp::Mul), &[grad, y])?,
                    apply(tape, &TapeOp::Binary(BinaryOp::Mul), &[grad, x])?,
                ],
                BinaryOp::Div => {
                    // d(x/y)/dy = -x / y^2
                    let dx = apply(tape.as_deref_mut(), &TapeOp::Binary(BinaryOp::Div), &[grad, y])?;
                    let gx = apply(tape.as_deref_mut(), &TapeOp::Binary(BinaryOp::Mul), &[grad, x])?;
                    let yy = apply(tape.as_deref_mut(), &TapeOp::Binary(BinaryOp::Mul), &[y, y])?;
                    let q = apply(tape.as_deref_mut(), &TapeOp::Binary(BinaryOp::Div), &[&gx, &yy])?;
                    let dy = apply(tape, &TapeOp::Unary(UnaryOp::Neg), &[&q])?;
                    vec![dx, dy]
                }
            }
        }
        TapeOp::Reshape(_) => {
            vec![apply(tape, &TapeOp::Reshape(x.value.shape.clone()), &[grad])?]
        }
        TapeOp::Cast(_) => vec![apply(tape, &TapeOp::Cast(x.value.dtype), &[grad])?],
        TapeOp::Expand(_) => vec![apply(tape, &TapeOp::Unary(UnaryOp::Sum), &[grad])?],
        TapeOp::Copy => vec![grad.clone()],
    };
    Ok(grads)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(tape: &mut Tape, slot: u64, data: &[f64]) -> Traced {
        let value = Value::new(data.to_vec(), vec![data.len()], DataType::Float64);
        let node = tape.leaf(RawHandle::from_raw(slot).unwrap());
        Traced {
            value,
            node: Some(node),
        }
    }

    fn ones_like(t: &Traced) -> Traced {
        Traced::constant(Value::new(
            vec![1.0; t.value.numel()],
            t.value.shape.clone(),
            t.value.dtype,
        ))
    }

    #[test]
    fn test_untracked_inputs_are_not_recorded() {
        let mut tape = Tape::default();
        let a = Traced::constant(Value::new(vec![1.0], vec![1], DataType::Float64));
        let out = apply(Some(&mut tape), &TapeOp::Unary(UnaryOp::Neg), &[&a]).unwrap();
        assert!(out.node.is_none());
        assert_eq!(tape.len(), 0);
    }

    #[test]
    fn test_product_rule() {
        let mut tape = Tape::default();
        let a = leaf(&mut tape, 1, &[2.0, 3.0]);
        let b = leaf(&mut tape, 2, &[5.0, 7.0]);
        let c = apply(Some(&mut tape), &TapeOp::Binary(BinaryOp::Mul), &[&a, &b]).unwrap();

        let seed = ones_like(&c);
        let leaves = tape.backward(c.node.unwrap(), seed, false, false).unwrap();
        let grads: HashMap<u64, Vec<f64>> = leaves
            .into_iter()
            .map(|(slot, g)| (slot.as_u64(), g.value.data))
            .collect();
        assert_eq!(grads[&1], vec![5.0, 7.0]);
        assert_eq!(grads[&2], vec![2.0, 3.0]);
    }

    #[test]
    fn test_shared_input_accumulates() {
        let mut tape = Tape::default();
        let a = leaf(&mut tape, 1, &[3.0]);
        // a * a + a
        let sq = apply(Some(&mut tape), &TapeOp::Binary(BinaryOp::Mul), &[&a, &a]).unwrap();
        let out = apply(Some(&mut tape), &TapeOp::Binary(BinaryOp::Add), &[&sq, &a]).unwrap();

        let seed = ones_like(&out);
        let leaves = tape.backward(out.node.unwrap(), seed, false, false).unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].1.value.data, vec![7.0]);
    }

    #[test]
    fn test_released_graph_is_consumed() {
        let mut tape = Tape::default();
        let a = leaf(&mut tape, 1, &[1.0]);
        let out = apply(Some(&mut tape), &TapeOp::Unary(UnaryOp::Exp), &[&a]).unwrap();
        let root = out.node.unwrap();

        tape.backward(root, ones_like(&out), false, false).unwrap();
        assert_eq!(tape.released(), 1);
        assert!(matches!(
            tape.backward(root, ones_like(&out), false, false),
            Err(EmberError::GraphConsumed)
        ));
    }

    #[test]
    fn test_retained_graph_can_be_walked_twice() {
        let mut tape = Tape::default();
        let a = leaf(&mut tape, 1, &[1.0]);
        let out = apply(Some(&mut tape), &TapeOp::Unary(UnaryOp::MulScalar(3.0)), &[&a]).unwrap();
        let root = out.node.unwrap();

        tape.backward(root, ones_like(&out), true, false).unwrap();
        let leaves = tape.backward(root, ones_like(&out), true, false).unwrap();
        assert_eq!(leaves[0].1.value.data, vec![3.0]);
        assert_eq!(tape.released(), 0);
    }

    #[test]
    fn test_create_graph_records_gradient() {
        let mut tape = Tape::default();
        let a = leaf(&mut tape, 1, &[3.0]);
        let cube = {
            let sq = apply(Some(&mut tape), &TapeOp::Binary(BinaryOp::Mul), &[&a, &a]).unwrap();
            apply(Some(&mut tape), &TapeOp::Binary(BinaryOp::Mul), &[&sq, &a]).unwrap()
        };

        let first = tape
            .backward(cube.node.unwrap(), ones_like(&cube), true, true)
            .unwrap();
        let (_, grad) = &first[0];
        // d(a^3)/da = 3a^2 = 27
        assert_eq!(grad.value.data, vec![27.0]);
        let grad_node = grad.node.expect("gradient should be recorded");

        let second = tape.backward(grad_node, ones_like(grad), true, false).unwrap();
        // d(3a^2)/da = 6a = 18
        assert_eq!(second[0].1.value.data, vec![18.0]);
    }

    #[test]
    fn test_division_gradient() {
        let mut tape = Tape::default();
        let x = leaf(&mut tape, 1, &[6.0]);
        let y = leaf(&mut tape, 2, &[2.0]);
        let q = apply(Some(&mut tape), &TapeOp::Binary(BinaryOp::Div), &[&x, &y]).unwrap();

        let leaves = tape.backward(q.node.unwrap(), ones_like(&q), false, false).unwrap();
        let grads: HashMap<u64, f64> = leaves
            .into_iter()
            .map(|(slot, g)| (slot.as_u64(), g.value.data[0]))
            .collect();
        assert_eq!(grads[&1], 0.5);
        assert_eq!(grads[&2], -1.5);
    }

    #[test]
    fn test_sum_gradient_expands() {
        let mut tape = Tape::default();
        let a = leaf(&mut tape, 1, &[1.0, 2.0, 3.0]);
        let s = apply(Some(&mut tape), &TapeOp::Unary(UnaryOp::Sum), &[&a]).unwrap();
        let leaves = tape.backward(s.node.unwrap(), ones_like(&s), false, false).unwrap();
        assert_eq!(leaves[0].1.value.data, vec![1.0, 1.0, 1.0]);
        assert_eq!(leaves[0].1.value.shape, vec![3]);
    }
}
