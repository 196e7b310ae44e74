//! Tensor computation graphs.

mod phase;
pub mod rewrite;
mod shape;
mod topo;
pub mod validation;

use indexmap::IndexMap;
use tracing::debug;

pub use phase::GraphPhase;
pub use rewrite::{OptimizeStats, Rebind, RewriteRule, Splice, Toggle};
pub use validation::{
    GraphValidationStats, ValidationError, ValidationErrorKind, ValidationReport,
};

use crate::config::GraphConfig;
use crate::error::{GraphError, NodeRef};
use crate::memory::MemoryPlan;
use crate::ops::{BinaryOp, MatMul, OpId, OpKind, Operator, Transpose, UnaryOp};
use crate::runtime::{describe_runtime, same_runtime, RuntimeHandle};
use crate::tensor::{DataType, Shape, Tensor, TensorId};

/// Owns every tensor and operator of one computation.
///
/// Both collections are insertion ordered and keyed by guid; all
/// cross-references between nodes are ids resolved through the graph.
#[derive(Debug)]
pub struct Graph {
    pub(crate) runtime: RuntimeHandle,
    pub(crate) config: GraphConfig,
    pub(crate) tensors: IndexMap<TensorId, Tensor>,
    pub(crate) ops: IndexMap<OpId, Operator>,
    pub(crate) phase: GraphPhase,
    pub(crate) memory_plan: Option<MemoryPlan>,
    next_guid: usize,
}

impl Graph {
    pub fn new(runtime: RuntimeHandle) -> Self {
        Self::with_config(runtime, GraphConfig::default())
    }

    pub fn with_config(runtime: RuntimeHandle, config: GraphConfig) -> Self {
        Graph {
            runtime,
            config,
            tensors: IndexMap::new(),
            ops: IndexMap::new(),
            phase: GraphPhase::Building,
            memory_plan: None,
            next_guid: 0,
        }
    }

    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn phase(&self) -> GraphPhase {
        self.phase
    }

    pub fn is_sorted(&self) -> bool {
        self.phase.is_sorted()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty() && self.ops.is_empty()
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    pub fn num_operators(&self) -> usize {
        self.ops.len()
    }

    pub fn tensor(&self, id: TensorId) -> Option<&Tensor> {
        self.tensors.get(&id)
    }

    pub fn operator(&self, id: OpId) -> Option<&Operator> {
        self.ops.get(&id)
    }

    /// Tensors in graph order.
    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.values()
    }

    /// Operators in graph order (topological once sorted).
    pub fn operators(&self) -> impl Iterator<Item = &Operator> {
        self.ops.values()
    }

    pub fn tensor_ids(&self) -> Vec<TensorId> {
        self.tensors.keys().copied().collect()
    }

    pub fn operator_ids(&self) -> Vec<OpId> {
        self.ops.keys().copied().collect()
    }

    pub fn tensor_by_fuid(&self, fuid: usize) -> Option<&Tensor> {
        self.tensors.values().find(|t| t.fuid == fuid)
    }

    /// First output tensor of an operator.
    pub fn output_of(&self, op: OpId) -> Option<TensorId> {
        self.ops.get(&op).and_then(Operator::output)
    }

    /// The memory plan of the last successful [`Graph::data_malloc`].
    pub fn memory_plan(&self) -> Option<&MemoryPlan> {
        self.memory_plan.as_ref()
    }

    fn next_guid(&mut self) -> usize {
        let guid = self.next_guid;
        self.next_guid += 1;
        guid
    }

    /// Any structural change invalidates the memory plan and every binding
    /// made from it.
    pub(crate) fn mark_mutated(&mut self) {
        self.phase = GraphPhase::Building;
        if self.memory_plan.take().is_some() {
            self.clear_storage();
        }
    }

    pub(crate) fn clear_storage(&mut self) {
        for tensor in self.tensors.values_mut() {
            tensor.clear_storage();
        }
    }

    pub(crate) fn reject_allocated(&self, operation: &'static str) -> Result<(), GraphError> {
        if self.phase == GraphPhase::Allocated {
            return Err(GraphError::InvalidPhase {
                operation,
                current: self.phase,
                required: "a graph that is not yet allocated",
            });
        }
        Ok(())
    }

    pub(crate) fn validate_if_configured(&self) -> Result<(), GraphError> {
        if self.config.validate_after_each_phase {
            self.check_valid()?;
        }
        Ok(())
    }

    pub fn add_tensor(&mut self, shape: impl Into<Shape>, dtype: DataType) -> TensorId {
        let id = TensorId(self.next_guid());
        let tensor = Tensor::new(id, shape.into(), dtype, self.runtime.clone());
        self.tensors.insert(id, tensor);
        self.mark_mutated();
        id
    }

    /// Takes in a tensor created elsewhere, e.g. [`Tensor::detached`] from
    /// another graph. The tensor keeps its fuid and gets a fresh guid.
    pub fn adopt_tensor(&mut self, tensor: Tensor) -> Result<TensorId, GraphError> {
        self.check_runtime(&tensor)?;
        Ok(self.insert_adopted(tensor))
    }

    /// Adopts every tensor or none of them.
    pub fn adopt_tensors(
        &mut self,
        tensors: impl IntoIterator<Item = Tensor>,
    ) -> Result<Vec<TensorId>, GraphError> {
        let tensors: Vec<Tensor> = tensors.into_iter().collect();
        for tensor in &tensors {
            self.check_runtime(tensor)?;
        }
        Ok(tensors.into_iter().map(|t| self.insert_adopted(t)).collect())
    }

    fn check_runtime(&self, tensor: &Tensor) -> Result<(), GraphError> {
        if !same_runtime(&self.runtime, &tensor.runtime) {
            return Err(GraphError::RuntimeMismatch {
                expected: describe_runtime(&self.runtime),
                found: describe_runtime(&tensor.runtime),
            });
        }
        Ok(())
    }

    fn insert_adopted(&mut self, tensor: Tensor) -> TensorId {
        let id = TensorId(self.next_guid());
        let mut tensor = tensor.detached();
        tensor.guid = id;
        self.tensors.insert(id, tensor);
        self.mark_mutated();
        id
    }

    /// Creates an operator of `kind` over `inputs` and wires it in.
    ///
    /// Output shapes are inferred from the inputs. With `outputs == None`
    /// fresh output tensors are created; otherwise the given tensors must
    /// already carry the inferred shapes and have no producer.
    pub fn add_op(
        &mut self,
        mut kind: OpKind,
        inputs: Vec<TensorId>,
        outputs: Option<Vec<TensorId>>,
    ) -> Result<OpId, GraphError> {
        let name = kind.name();
        if inputs.len() != kind.input_arity() {
            return Err(GraphError::ArityMismatch {
                kind: name,
                expected: kind.input_arity(),
                got: inputs.len(),
            });
        }

        let mut dtype: Option<DataType> = None;
        let mut shapes = Vec::with_capacity(inputs.len());
        for &id in &inputs {
            let tensor = self.tensors.get(&id).ok_or(GraphError::DanglingReference {
                holder: NodeRef::Pending(name),
                target: NodeRef::Tensor(id),
            })?;
            match dtype {
                Some(expected) if expected != tensor.dtype => {
                    return Err(GraphError::DTypeMismatch {
                        kind: name,
                        expected,
                        got: tensor.dtype,
                    });
                }
                _ => dtype = Some(tensor.dtype),
            }
            shapes.push(tensor.shape.clone());
        }
        let dtype = dtype.ok_or(GraphError::ArityMismatch {
            kind: name,
            expected: kind.input_arity(),
            got: 0,
        })?;

        let refs: Vec<&[usize]> = shapes.iter().map(Vec::as_slice).collect();
        let inferred = kind.infer_shape(&refs, self.config.broadcast)?;

        let outputs = match outputs {
            Some(outputs) => {
                if outputs.len() != inferred.len() {
                    return Err(GraphError::ArityMismatch {
                        kind: name,
                        expected: inferred.len(),
                        got: outputs.len(),
                    });
                }
                for (&id, expected) in outputs.iter().zip(&inferred) {
                    let tensor = self.tensors.get(&id).ok_or(GraphError::DanglingReference {
                        holder: NodeRef::Pending(name),
                        target: NodeRef::Tensor(id),
                    })?;
                    if let Some(producer) = tensor.source {
                        return Err(GraphError::AlreadyProduced {
                            tensor: id,
                            producer,
                        });
                    }
                    if &tensor.shape != expected {
                        return Err(GraphError::ShapeMismatch {
                            tensor: id,
                            expected: expected.clone(),
                            got: tensor.shape.clone(),
                        });
                    }
                }
                outputs
            }
            None => inferred
                .into_iter()
                .map(|shape| self.add_tensor(shape, dtype))
                .collect(),
        };

        self.add_operator_and_connect(Operator::new(kind, inputs, outputs))
    }

    pub fn add_matmul(
        &mut self,
        a: TensorId,
        b: TensorId,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<OpId, GraphError> {
        self.add_op(
            OpKind::MatMul(MatMul::new(trans_a, trans_b)),
            vec![a, b],
            None,
        )
    }

    pub fn add_transpose(
        &mut self,
        input: TensorId,
        permute: Vec<usize>,
    ) -> Result<OpId, GraphError> {
        self.add_op(
            OpKind::Transpose(Transpose::new(permute)),
            vec![input],
            None,
        )
    }

    pub fn add_unary(&mut self, op: UnaryOp, input: TensorId) -> Result<OpId, GraphError> {
        self.add_op(OpKind::Unary(op), vec![input], None)
    }

    pub fn add_elementwise(
        &mut self,
        op: BinaryOp,
        lhs: TensorId,
        rhs: TensorId,
    ) -> Result<OpId, GraphError> {
        self.add_op(OpKind::ElementWise(op), vec![lhs, rhs], None)
    }

    /// Takes ownership of `op` and wires it to its tensors.
    ///
    /// The operator becomes a target of each input and the source of each
    /// output. Predecessor/successor edges are added for every input that
    /// already has a producer and for every output that already has
    /// consumers, so operators may be connected in any order.
    pub fn add_operator_and_connect(&mut self, mut op: Operator) -> Result<OpId, GraphError> {
        let name = op.kind.name();
        for &tensor in op.inputs.iter().chain(&op.outputs) {
            if !self.tensors.contains_key(&tensor) {
                return Err(GraphError::DanglingReference {
                    holder: NodeRef::Pending(name),
                    target: NodeRef::Tensor(tensor),
                });
            }
        }
        for &output in &op.outputs {
            if let Some(producer) = self.tensors.get(&output).and_then(|t| t.source) {
                return Err(GraphError::AlreadyProduced {
                    tensor: output,
                    producer,
                });
            }
        }

        let id = OpId(self.next_guid());
        op.guid = id;
        op.predecessors.clear();
        op.successors.clear();
        self.mark_mutated();

        let mut edges = Vec::new();
        for &input in &op.inputs {
            if let Some(tensor) = self.tensors.get_mut(&input) {
                tensor.add_target(id);
                if let Some(source) = tensor.source {
                    edges.push((source, id));
                }
            }
        }
        for &output in &op.outputs {
            if let Some(tensor) = self.tensors.get_mut(&output) {
                tensor.set_source(Some(id));
                edges.extend(tensor.targets.iter().map(|&target| (id, target)));
            }
        }

        self.ops.insert(id, op);
        for (pred, succ) in edges {
            self.connect(pred, succ);
        }
        debug!(op = %id, kind = name, "operator connected");
        Ok(id)
    }

    /// Adds the symmetric edge `pred -> succ`.
    pub(crate) fn connect(&mut self, pred: OpId, succ: OpId) {
        if let Some(op) = self.ops.get_mut(&pred) {
            op.add_successor(succ);
        }
        if let Some(op) = self.ops.get_mut(&succ) {
            op.add_predecessor(pred);
        }
    }

    /// Drops the symmetric edge `pred -> succ`.
    pub(crate) fn disconnect(&mut self, pred: OpId, succ: OpId) {
        if let Some(op) = self.ops.get_mut(&pred) {
            op.remove_successor(succ);
        }
        if let Some(op) = self.ops.get_mut(&succ) {
            op.remove_predecessor(pred);
        }
    }
}
