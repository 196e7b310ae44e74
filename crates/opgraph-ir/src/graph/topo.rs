//! Topological ordering of operators.

use indexmap::{IndexMap, IndexSet};
use tracing::{info, trace};

use super::{Graph, GraphPhase};
use crate::error::GraphError;
use crate::ops::OpId;

impl Graph {
    /// Computes a topological order without touching the graph.
    ///
    /// Operators are scanned in their current order, pass after pass. An
    /// operator becomes placeable once every input either has no producer or
    /// has its producer placed already; a placement is visible to later
    /// operators of the same pass. The scan stops when everything is placed
    /// or a pass places nothing, which means the remaining operators form a
    /// cycle.
    pub fn topological_order(&self) -> Result<Vec<OpId>, GraphError> {
        let total = self.ops.len();
        let mut placed: IndexSet<OpId> = IndexSet::with_capacity(total);
        let mut pass = 0usize;

        while placed.len() < total {
            pass += 1;
            let before = placed.len();
            for (&id, op) in &self.ops {
                if placed.contains(&id) {
                    continue;
                }
                let ready = op.inputs.iter().all(|input| {
                    match self.tensors.get(input).and_then(|t| t.source) {
                        None => true,
                        Some(producer) => placed.contains(&producer),
                    }
                });
                if ready {
                    placed.insert(id);
                }
            }
            trace!(pass, newly_placed = placed.len() - before, total, "topo pass");
            if placed.len() == before {
                return Err(GraphError::CycleDetected {
                    placed: before,
                    total,
                });
            }
        }

        Ok(placed.into_iter().collect())
    }

    /// Reorders the operators topologically.
    ///
    /// A no-op when the graph is already sorted; on a cycle the graph is left
    /// untouched.
    pub fn topo_sort(&mut self) -> Result<(), GraphError> {
        if self.phase.is_sorted() {
            return Ok(());
        }

        let order = self.topological_order()?;
        let mut ops = std::mem::take(&mut self.ops);
        let mut sorted = IndexMap::with_capacity(order.len());
        for id in order {
            if let Some(op) = ops.swap_remove(&id) {
                sorted.insert(id, op);
            }
        }
        self.ops = sorted;
        self.phase = GraphPhase::Sorted;

        info!(operators = self.ops.len(), "graph sorted");
        self.validate_if_configured()
    }
}
