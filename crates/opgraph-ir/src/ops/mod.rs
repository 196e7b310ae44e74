//! Operators: the computation nodes of a graph.

mod broadcast;
mod elementwise;
mod matmul;
mod transpose;

use std::fmt;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

pub use broadcast::broadcast_shapes;
pub use elementwise::{BinaryOp, UnaryOp};
pub use matmul::{MatMul, MatMulOperand};
pub use transpose::Transpose;

use crate::config::BroadcastPolicy;
use crate::error::GraphError;
use crate::tensor::{Shape, TensorId};

/// Creation-order id of an operator within its graph. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub(crate) usize);

impl OpId {
    pub fn guid(self) -> usize {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of operator kinds, each with its own attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    MatMul(MatMul),
    Transpose(Transpose),
    Unary(UnaryOp),
    ElementWise(BinaryOp),
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::MatMul(_) => "MatMul",
            OpKind::Transpose(_) => "Transpose",
            OpKind::Unary(_) => "Unary",
            OpKind::ElementWise(_) => "ElementWise",
        }
    }

    pub fn input_arity(&self) -> usize {
        match self {
            OpKind::MatMul(_) | OpKind::ElementWise(_) => 2,
            OpKind::Transpose(_) | OpKind::Unary(_) => 1,
        }
    }

    pub fn as_matmul(&self) -> Option<&MatMul> {
        match self {
            OpKind::MatMul(mm) => Some(mm),
            _ => None,
        }
    }

    pub fn as_matmul_mut(&mut self) -> Option<&mut MatMul> {
        match self {
            OpKind::MatMul(mm) => Some(mm),
            _ => None,
        }
    }

    pub fn as_transpose(&self) -> Option<&Transpose> {
        match self {
            OpKind::Transpose(t) => Some(t),
            _ => None,
        }
    }

    /// Output shapes for the given input shapes.
    ///
    /// MatMul records its derived `m`, `n`, `k`, hence `&mut self`.
    pub fn infer_shape(
        &mut self,
        inputs: &[&[usize]],
        policy: BroadcastPolicy,
    ) -> Result<Vec<Shape>, GraphError> {
        if inputs.len() != self.input_arity() {
            return Err(GraphError::ArityMismatch {
                kind: self.name(),
                expected: self.input_arity(),
                got: inputs.len(),
            });
        }
        let shape = match self {
            OpKind::MatMul(mm) => mm.infer_shape(inputs[0], inputs[1], policy)?,
            OpKind::Transpose(t) => t.infer_shape(inputs[0])?,
            OpKind::Unary(_) => inputs[0].to_vec(),
            OpKind::ElementWise(_) => broadcast_shapes(inputs[0], inputs[1], policy)?,
        };
        Ok(vec![shape])
    }
}

/// An operator node. Tensors and neighbouring operators are referenced by id
/// and resolved through the owning [`Graph`](crate::Graph).
#[derive(Clone, Debug)]
pub struct Operator {
    pub(crate) guid: OpId,
    pub(crate) kind: OpKind,
    pub(crate) inputs: Vec<TensorId>,
    pub(crate) outputs: Vec<TensorId>,
    pub(crate) predecessors: IndexSet<OpId>,
    pub(crate) successors: IndexSet<OpId>,
}

impl Operator {
    /// A not-yet-wired operator. Its guid is assigned when a graph takes
    /// ownership in [`Graph::add_operator_and_connect`](crate::Graph::add_operator_and_connect).
    pub fn new(kind: OpKind, inputs: Vec<TensorId>, outputs: Vec<TensorId>) -> Self {
        Operator {
            guid: OpId(usize::MAX),
            kind,
            inputs,
            outputs,
            predecessors: IndexSet::new(),
            successors: IndexSet::new(),
        }
    }

    pub fn guid(&self) -> OpId {
        self.guid
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn input(&self, slot: usize) -> Option<TensorId> {
        self.inputs.get(slot).copied()
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// First output; every current kind has exactly one.
    pub fn output(&self) -> Option<TensorId> {
        self.outputs.first().copied()
    }

    pub fn predecessors(&self) -> &IndexSet<OpId> {
        &self.predecessors
    }

    pub fn successors(&self) -> &IndexSet<OpId> {
        &self.successors
    }

    pub(crate) fn add_predecessor(&mut self, op: OpId) {
        self.predecessors.insert(op);
    }

    pub(crate) fn remove_predecessor(&mut self, op: OpId) {
        self.predecessors.shift_remove(&op);
    }

    pub(crate) fn add_successor(&mut self, op: OpId) {
        self.successors.insert(op);
    }

    pub(crate) fn remove_successor(&mut self, op: OpId) {
        self.successors.shift_remove(&op);
    }

    /// Replaces every input slot holding `from` with `to`; returns the number
    /// of slots rewritten.
    pub(crate) fn replace_input(&mut self, from: TensorId, to: TensorId) -> usize {
        let mut replaced = 0;
        for input in self.inputs.iter_mut().filter(|t| **t == from) {
            *input = to;
            replaced += 1;
        }
        replaced
    }
}
