//! Structural invariant checks.
//!
//! [`Graph::validate`] collects every violation into a [`ValidationReport`];
//! [`Graph::check_valid`] stops at the first one.

use std::collections::HashMap;

use serde::Serialize;

use super::Graph;
use crate::error::{GraphError, NodeRef};
use crate::ops::{OpId, OpKind};
use crate::tensor::TensorId;

/// Result of validating a graph.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// Total number of individual checks evaluated
    pub checks_performed: usize,
    pub errors: Vec<ValidationError>,
    pub stats: GraphValidationStats,
}

/// A single violated invariant.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub op: Option<OpId>,
    pub tensor: Option<TensorId>,
    pub error: GraphError,
}

impl ValidationError {
    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValidationErrorKind {
    /// Tensor has neither a source nor a target
    IsolatedTensor,
    /// Tensor source is not in the graph
    DanglingSource,
    /// Tensor target is not in the graph
    DanglingTarget,
    /// Operator input is not in the graph
    DanglingInput,
    /// Operator output is not in the graph
    DanglingOutput,
    DanglingPredecessor,
    DanglingSuccessor,
    /// `A` lists `B` as a neighbour but `B` does not list `A`
    AsymmetricAdjacency,
    /// Operators are adjacent without sharing a tensor
    UnbackedAdjacency,
    /// Operators share a tensor but are not adjacent
    MissingAdjacency,
    /// Tensor and operator disagree on who produces or consumes what
    BackReference,
    DuplicateFuid,
}

/// Counts gathered while validating.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphValidationStats {
    pub total_tensors: usize,
    pub total_operators: usize,
    /// Tensors without a producer
    pub input_tensors: usize,
    /// Tensors without a consumer
    pub output_tensors: usize,
    pub matmul_operations: usize,
    pub transpose_operations: usize,
    pub unary_operations: usize,
    pub elementwise_operations: usize,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// The first violation as a [`GraphError`].
    pub fn first_error(&self) -> Option<&GraphError> {
        self.errors.first().map(|e| &e.error)
    }

    pub fn summary(&self) -> String {
        format!(
            "Validation: {} errors ({} checks, {} tensors, {} operators)",
            self.errors.len(),
            self.checks_performed,
            self.stats.total_tensors,
            self.stats.total_operators
        )
    }
}

struct Checker<'g> {
    graph: &'g Graph,
    report: ValidationReport,
}

impl<'g> Checker<'g> {
    fn check(&mut self, ok: bool) -> bool {
        self.report.checks_performed += 1;
        ok
    }

    fn fail(
        &mut self,
        kind: ValidationErrorKind,
        op: Option<OpId>,
        tensor: Option<TensorId>,
        error: GraphError,
    ) {
        self.report.errors.push(ValidationError {
            kind,
            op,
            tensor,
            error,
        });
    }

    fn dangling(&mut self, kind: ValidationErrorKind, holder: NodeRef, target: NodeRef) {
        let (op, tensor) = split(holder, target);
        self.fail(kind, op, tensor, GraphError::DanglingReference { holder, target });
    }

    fn inconsistent(&mut self, kind: ValidationErrorKind, holder: NodeRef, other: NodeRef, reason: &str) {
        let (op, tensor) = split(holder, other);
        self.fail(
            kind,
            op,
            tensor,
            GraphError::InconsistentAdjacency {
                holder,
                other,
                reason: reason.to_string(),
            },
        );
    }

    fn tensors(&mut self) {
        let graph = self.graph;
        for (&id, tensor) in &graph.tensors {
            let holder = NodeRef::Tensor(id);
            if !self.check(tensor.source.is_some() || !tensor.targets.is_empty()) {
                self.fail(
                    ValidationErrorKind::IsolatedTensor,
                    None,
                    Some(id),
                    GraphError::IsolatedTensor { tensor: id },
                );
            }

            if let Some(src) = tensor.source {
                match graph.ops.get(&src) {
                    None => {
                        self.check(false);
                        self.dangling(ValidationErrorKind::DanglingSource, holder, NodeRef::Operator(src));
                    }
                    Some(op) => {
                        if !self.check(op.outputs.contains(&id)) {
                            self.inconsistent(
                                ValidationErrorKind::BackReference,
                                holder,
                                NodeRef::Operator(src),
                                "source does not list the tensor as an output",
                            );
                        }
                    }
                }
            }

            for &target in &tensor.targets {
                match graph.ops.get(&target) {
                    None => {
                        self.check(false);
                        self.dangling(ValidationErrorKind::DanglingTarget, holder, NodeRef::Operator(target));
                    }
                    Some(op) => {
                        if !self.check(op.inputs.contains(&id)) {
                            self.inconsistent(
                                ValidationErrorKind::BackReference,
                                holder,
                                NodeRef::Operator(target),
                                "target does not read the tensor",
                            );
                        }
                    }
                }
            }
        }
    }

    fn operator_tensors(&mut self) {
        let graph = self.graph;
        for (&id, op) in &graph.ops {
            let holder = NodeRef::Operator(id);
            for &input in &op.inputs {
                match graph.tensors.get(&input) {
                    None => {
                        self.check(false);
                        self.dangling(ValidationErrorKind::DanglingInput, holder, NodeRef::Tensor(input));
                    }
                    Some(tensor) => {
                        if !self.check(tensor.targets.contains(&id)) {
                            self.inconsistent(
                                ValidationErrorKind::BackReference,
                                holder,
                                NodeRef::Tensor(input),
                                "input does not list the operator as a target",
                            );
                        }
                        if let Some(src) = tensor.source {
                            if graph.ops.contains_key(&src) && !self.check(op.predecessors.contains(&src)) {
                                self.inconsistent(
                                    ValidationErrorKind::MissingAdjacency,
                                    holder,
                                    NodeRef::Operator(src),
                                    "producer of an input is not a predecessor",
                                );
                            }
                        }
                    }
                }
            }
            for &output in &op.outputs {
                match graph.tensors.get(&output) {
                    None => {
                        self.check(false);
                        self.dangling(ValidationErrorKind::DanglingOutput, holder, NodeRef::Tensor(output));
                    }
                    Some(tensor) => {
                        if !self.check(tensor.source == Some(id)) {
                            self.inconsistent(
                                ValidationErrorKind::BackReference,
                                holder,
                                NodeRef::Tensor(output),
                                "output names a different source",
                            );
                        }
                    }
                }
            }
        }
    }

    fn adjacency(&mut self) {
        let graph = self.graph;
        for (&id, op) in &graph.ops {
            let holder = NodeRef::Operator(id);
            for &pred in &op.predecessors {
                let Some(other) = graph.ops.get(&pred) else {
                    self.check(false);
                    self.dangling(ValidationErrorKind::DanglingPredecessor, holder, NodeRef::Operator(pred));
                    continue;
                };
                if !self.check(other.successors.contains(&id)) {
                    self.inconsistent(
                        ValidationErrorKind::AsymmetricAdjacency,
                        holder,
                        NodeRef::Operator(pred),
                        "predecessor does not list the operator as a successor",
                    );
                }
                if !self.check(other.outputs.iter().any(|t| op.inputs.contains(t))) {
                    self.inconsistent(
                        ValidationErrorKind::UnbackedAdjacency,
                        holder,
                        NodeRef::Operator(pred),
                        "predecessor produces none of the operator's inputs",
                    );
                }
            }
            for &succ in &op.successors {
                let Some(other) = graph.ops.get(&succ) else {
                    self.check(false);
                    self.dangling(ValidationErrorKind::DanglingSuccessor, holder, NodeRef::Operator(succ));
                    continue;
                };
                if !self.check(other.predecessors.contains(&id)) {
                    self.inconsistent(
                        ValidationErrorKind::AsymmetricAdjacency,
                        holder,
                        NodeRef::Operator(succ),
                        "successor does not list the operator as a predecessor",
                    );
                }
            }
        }
    }

    fn identities(&mut self) {
        let mut seen: HashMap<usize, TensorId> = HashMap::with_capacity(self.graph.tensors.len());
        for (&id, tensor) in &self.graph.tensors {
            let first = seen.insert(tensor.fuid, id);
            if let Some(first) = first {
                self.check(false);
                self.fail(
                    ValidationErrorKind::DuplicateFuid,
                    None,
                    Some(id),
                    GraphError::DuplicateIdentity {
                        fuid: tensor.fuid,
                        first,
                        second: id,
                    },
                );
                seen.insert(tensor.fuid, first);
            } else {
                self.check(true);
            }
        }
    }

    fn stats(&mut self) {
        let graph = self.graph;
        let stats = &mut self.report.stats;
        stats.total_tensors = graph.tensors.len();
        stats.total_operators = graph.ops.len();
        stats.input_tensors = graph.tensors.values().filter(|t| t.source.is_none()).count();
        stats.output_tensors = graph.tensors.values().filter(|t| t.targets.is_empty()).count();
        for op in graph.ops.values() {
            match op.kind {
                OpKind::MatMul(_) => stats.matmul_operations += 1,
                OpKind::Transpose(_) => stats.transpose_operations += 1,
                OpKind::Unary(_) => stats.unary_operations += 1,
                OpKind::ElementWise(_) => stats.elementwise_operations += 1,
            }
        }
    }
}

fn split(a: NodeRef, b: NodeRef) -> (Option<OpId>, Option<TensorId>) {
    let mut op = None;
    let mut tensor = None;
    for node in [a, b] {
        match node {
            NodeRef::Operator(id) if op.is_none() => op = Some(id),
            NodeRef::Tensor(id) if tensor.is_none() => tensor = Some(id),
            _ => {}
        }
    }
    (op, tensor)
}

impl Graph {
    /// Runs every structural check and reports all violations.
    ///
    /// Checks run in this order: tensor-side wiring (isolation, dangling or
    /// disagreeing source and targets), operator inputs and outputs,
    /// predecessor/successor sets, then fuid uniqueness.
    pub fn validate(&self) -> ValidationReport {
        let mut checker = Checker {
            graph: self,
            report: ValidationReport {
                checks_performed: 0,
                errors: Vec::new(),
                stats: GraphValidationStats::default(),
            },
        };
        checker.tensors();
        checker.operator_tensors();
        checker.adjacency();
        checker.identities();
        checker.stats();
        checker.report
    }

    /// Fails with the first violated invariant.
    pub fn check_valid(&self) -> Result<(), GraphError> {
        match self.validate().first_error() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}
