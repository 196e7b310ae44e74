//! Shape propagation.

use tracing::{debug, info};

use super::{Graph, GraphPhase};
use crate::error::{GraphError, NodeRef};
use crate::ops::OpId;
use crate::tensor::{Shape, TensorId};

impl Graph {
    /// Overwrites the shape of a tensor. Downstream shapes are brought back
    /// in line by the next [`Graph::shape_infer`].
    pub fn set_tensor_shape(
        &mut self,
        id: TensorId,
        shape: impl Into<Shape>,
    ) -> Result<(), GraphError> {
        self.reject_allocated("set_tensor_shape")?;
        let tensor = self.tensors.get_mut(&id).ok_or(GraphError::DanglingReference {
            holder: NodeRef::Pending("set_tensor_shape"),
            target: NodeRef::Tensor(id),
        })?;
        tensor.set_shape(shape.into());
        self.mark_mutated();
        Ok(())
    }

    /// Recomputes every output shape in topological order.
    ///
    /// Output tensors whose stored shape disagrees with the inferred one are
    /// overwritten. MatMul operators record their `m`, `n`, `k` on the way.
    pub fn shape_infer(&mut self) -> Result<(), GraphError> {
        self.reject_allocated("shape_infer")?;
        self.topo_sort()?;

        let policy = self.config.broadcast;
        let order: Vec<OpId> = self.ops.keys().copied().collect();
        let mut updated = 0usize;

        for id in order {
            let Some(op) = self.ops.get(&id) else {
                continue;
            };
            let mut shapes = Vec::with_capacity(op.inputs.len());
            for input in &op.inputs {
                let tensor = self.tensors.get(input).ok_or(GraphError::DanglingReference {
                    holder: NodeRef::Operator(id),
                    target: NodeRef::Tensor(*input),
                })?;
                shapes.push(tensor.shape.clone());
            }

            let Some(op) = self.ops.get_mut(&id) else {
                continue;
            };
            let refs: Vec<&[usize]> = shapes.iter().map(Vec::as_slice).collect();
            let inferred = op.kind.infer_shape(&refs, policy)?;
            if inferred.len() != op.outputs.len() {
                return Err(GraphError::ArityMismatch {
                    kind: op.kind.name(),
                    expected: inferred.len(),
                    got: op.outputs.len(),
                });
            }

            let outputs = op.outputs.clone();
            for (output, shape) in outputs.into_iter().zip(inferred) {
                let tensor = self.tensors.get_mut(&output).ok_or(GraphError::DanglingReference {
                    holder: NodeRef::Operator(id),
                    target: NodeRef::Tensor(output),
                })?;
                if tensor.shape != shape {
                    debug!(tensor = %output, from = ?tensor.shape, to = ?shape, "output shape updated");
                    tensor.set_shape(shape);
                    updated += 1;
                }
            }
        }

        self.phase = GraphPhase::ShapeResolved;
        info!(operators = self.ops.len(), updated, "shapes resolved");
        self.validate_if_configured()
    }
}
