//! Error types for the graph engine.

use std::fmt;

use thiserror::Error;

use crate::graph::GraphPhase;
use crate::ops::OpId;
use crate::tensor::{DataType, Shape, TensorId};

/// A node of the graph named in an error message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Tensor(TensorId),
    Operator(OpId),
    /// An operator that is being constructed and has no id yet.
    Pending(&'static str),
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Tensor(id) => write!(f, "tensor {}", id),
            NodeRef::Operator(id) => write!(f, "operator {}", id),
            NodeRef::Pending(kind) => write!(f, "new {} operator", kind),
        }
    }
}

/// Failures reported by an [`Allocator`](crate::memory::Allocator).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("arena is already materialized and accepts no further allocations")]
    Materialized,
    #[error("allocating {requested} bytes exceeds the arena limit of {limit} bytes")]
    OutOfMemory { requested: usize, limit: usize },
    #[error("free of {bytes} bytes at offset {offset} does not match a live block")]
    InvalidFree { offset: usize, bytes: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("graph contains a cycle: only {placed} of {total} operators could be ordered")]
    CycleDetected { placed: usize, total: usize },
    #[error("fuid {fuid} is shared by tensors {first} and {second}")]
    DuplicateIdentity {
        fuid: usize,
        first: TensorId,
        second: TensorId,
    },
    #[error("{holder} references {target}, which is not part of the graph")]
    DanglingReference { holder: NodeRef, target: NodeRef },
    #[error("runtime mismatch: cannot add a tensor living on {found} to a graph on {expected}")]
    RuntimeMismatch { expected: String, found: String },
    #[error("cannot infer the output shape of {kind}: {reason}")]
    UnresolvedShape { kind: &'static str, reason: String },
    #[error("shapes {lhs:?} and {rhs:?} cannot be broadcast (extents {lhs_extent} and {rhs_extent})")]
    BroadcastIncompatible {
        lhs: Shape,
        rhs: Shape,
        lhs_extent: usize,
        rhs_extent: usize,
    },
    #[error("tensor {tensor} has neither a source nor any target")]
    IsolatedTensor { tensor: TensorId },
    #[error("inconsistent adjacency between {holder} and {other}: {reason}")]
    InconsistentAdjacency {
        holder: NodeRef,
        other: NodeRef,
        reason: String,
    },
    #[error("tensor {tensor} has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        tensor: TensorId,
        expected: Shape,
        got: Shape,
    },
    #[error("{kind} expects {expected} tensors, got {got}")]
    ArityMismatch {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{kind} operands disagree on data type: {expected} and {got}")]
    DTypeMismatch {
        kind: &'static str,
        expected: DataType,
        got: DataType,
    },
    #[error("permutation {perm:?} is not valid for rank {rank}")]
    InvalidPermutation { perm: Vec<usize>, rank: usize },
    #[error("tensor {tensor} is already produced by operator {producer}")]
    AlreadyProduced { tensor: TensorId, producer: OpId },
    #[error("{operation} cannot run on a graph that is {current}; it requires {required}")]
    InvalidPhase {
        operation: &'static str,
        current: GraphPhase,
        required: &'static str,
    },
    #[error("rewrite {rule} cannot be applied: {reason}")]
    InvalidRewrite { rule: &'static str, reason: String },
    #[error("tensor {tensor} with shape {shape:?} is too large to address")]
    SizeOverflow { tensor: TensorId, shape: Shape },
    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocError),
    #[error("invalid configuration: {0}")]
    Config(String),
}
