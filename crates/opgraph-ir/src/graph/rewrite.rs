//! Local structural rewrites.
//!
//! Each rule is a pure matcher that inspects the neighbourhood of one
//! operator and describes the rewrite as a [`Splice`]. The driver applies
//! splices while walking the operators in topological order; a splice is
//! checked in full before any of it is applied.
//!
//! Two rules exist:
//!
//! - **transpose cancellation**: `X -> T(P) -> Y -> T(P) -> Z` where `P`
//!   swaps exactly two axes collapses to `X`, and every consumer of `Z`
//!   reads `X` instead.
//! - **MatMul fusion**: a transpose that swaps the two innermost axes and
//!   feeds a MatMul operand is folded into the operand's transposition flag.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Graph, GraphPhase};
use crate::error::{GraphError, NodeRef};
use crate::ops::{MatMulOperand, OpId, OpKind};
use crate::tensor::TensorId;

/// The rule that produced a [`Splice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RewriteRule {
    CancelTransposePair,
    FuseTransposeIntoMatMul,
}

impl RewriteRule {
    pub fn name(self) -> &'static str {
        match self {
            RewriteRule::CancelTransposePair => "cancel-transpose-pair",
            RewriteRule::FuseTransposeIntoMatMul => "fuse-transpose-into-matmul",
        }
    }
}

impl fmt::Display for RewriteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Replace every input slot of `op` that holds `from` with `to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rebind {
    pub op: OpId,
    pub from: TensorId,
    pub to: TensorId,
}

/// Flip the transposition flag of one MatMul operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Toggle {
    pub op: OpId,
    pub operand: MatMulOperand,
}

/// Instruction set of one rewrite.
///
/// Applied in this order: toggles, rebinds, detaches, dropped edges, added
/// edges, removals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Splice {
    pub rule: RewriteRule,
    pub remove_ops: Vec<OpId>,
    pub remove_tensors: Vec<TensorId>,
    /// `(pred, succ)` edges to drop.
    pub drop_edges: Vec<(OpId, OpId)>,
    /// `(pred, succ)` edges to add.
    pub add_edges: Vec<(OpId, OpId)>,
    /// `(tensor, op)`: `op` stops consuming `tensor`.
    pub detach: Vec<(TensorId, OpId)>,
    pub rebinds: Vec<Rebind>,
    pub toggles: Vec<Toggle>,
}

impl Splice {
    fn new(rule: RewriteRule) -> Self {
        Splice {
            rule,
            remove_ops: Vec::new(),
            remove_tensors: Vec::new(),
            drop_edges: Vec::new(),
            add_edges: Vec::new(),
            detach: Vec::new(),
            rebinds: Vec::new(),
            toggles: Vec::new(),
        }
    }
}

/// What one or more optimize passes did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeStats {
    /// Transpose pairs removed.
    pub transposes_cancelled: usize,
    /// Transposes folded into a MatMul flag.
    pub transposes_fused: usize,
    pub ops_removed: usize,
    pub tensors_removed: usize,
    /// Passes run.
    pub rounds: usize,
}

impl OptimizeStats {
    pub fn changed(&self) -> bool {
        self.ops_removed > 0
    }

    fn record(&mut self, splice: &Splice) {
        match splice.rule {
            RewriteRule::CancelTransposePair => self.transposes_cancelled += 1,
            RewriteRule::FuseTransposeIntoMatMul => self.transposes_fused += 1,
        }
        self.ops_removed += splice.remove_ops.len();
        self.tensors_removed += splice.remove_tensors.len();
    }

    fn merge(&mut self, other: OptimizeStats) {
        self.transposes_cancelled += other.transposes_cancelled;
        self.transposes_fused += other.transposes_fused;
        self.ops_removed += other.ops_removed;
        self.tensors_removed += other.tensors_removed;
        self.rounds += other.rounds;
    }
}

/// Nodes deleted during a pass; purged from the graph when the pass ends.
#[derive(Debug, Default)]
pub(crate) struct Tombstones {
    ops: HashSet<OpId>,
    tensors: HashSet<TensorId>,
}

/// Matches `op` as the second transpose of a cancelling pair.
///
/// The first transpose must carry the same two-axis swap, its output must be
/// read by `op` alone, and `op`'s output must have at least one consumer to
/// take over the original input.
pub fn match_transpose_pair(graph: &Graph, op: OpId) -> Option<Splice> {
    let second = graph.operator(op)?;
    let perm = second.kind.as_transpose()?;
    if !perm.is_two_axis_swap() {
        return None;
    }
    let mid = second.input(0)?;
    let out = second.output()?;
    let consumers = graph.tensor(out)?.targets();
    if consumers.is_empty() {
        return None;
    }

    for &pred in second.predecessors() {
        let Some(first) = graph.operator(pred) else {
            continue;
        };
        if first.kind.as_transpose() != Some(perm) || first.output() != Some(mid) {
            continue;
        }
        let Some(mid_tensor) = graph.tensor(mid) else {
            continue;
        };
        if mid_tensor.targets().len() != 1 || !mid_tensor.targets().contains(&op) {
            continue;
        }
        let Some(src) = first.input(0) else {
            continue;
        };

        let mut splice = Splice::new(RewriteRule::CancelTransposePair);
        splice.remove_ops = vec![pred, op];
        splice.remove_tensors = vec![mid, out];
        splice.detach.push((src, pred));
        splice.drop_edges.push((pred, op));
        for &ffop in first.predecessors() {
            splice.drop_edges.push((ffop, pred));
        }
        for &bop in second.successors() {
            splice.drop_edges.push((op, bop));
            splice.rebinds.push(Rebind {
                op: bop,
                from: out,
                to: src,
            });
            for &ffop in first.predecessors() {
                splice.add_edges.push((ffop, bop));
            }
        }
        return Some(splice);
    }
    None
}

/// Matches a transpose of the two innermost axes feeding `operand` of the
/// MatMul `op`. The transposed tensor must be read by that operand slot and
/// nothing else.
pub fn match_matmul_fusion(graph: &Graph, op: OpId, operand: MatMulOperand) -> Option<Splice> {
    let matmul = graph.operator(op)?;
    matmul.kind.as_matmul()?;

    let slot = operand.slot();
    let mid = matmul.input(slot)?;
    if matmul
        .inputs()
        .iter()
        .enumerate()
        .any(|(i, &t)| i != slot && t == mid)
    {
        return None;
    }

    let mid_tensor = graph.tensor(mid)?;
    if mid_tensor.targets().len() != 1 || !mid_tensor.targets().contains(&op) {
        return None;
    }
    let producer_id = mid_tensor.source()?;
    let producer = graph.operator(producer_id)?;
    if !producer.kind.as_transpose()?.swaps_last_two() {
        return None;
    }
    let src = producer.input(0)?;

    let mut splice = Splice::new(RewriteRule::FuseTransposeIntoMatMul);
    splice.remove_ops = vec![producer_id];
    splice.remove_tensors = vec![mid];
    splice.detach.push((src, producer_id));
    splice.drop_edges.push((producer_id, op));
    for &pred in producer.predecessors() {
        splice.drop_edges.push((pred, producer_id));
        splice.add_edges.push((pred, op));
    }
    splice.rebinds.push(Rebind {
        op,
        from: mid,
        to: src,
    });
    splice.toggles.push(Toggle { op, operand });
    Some(splice)
}

impl Graph {
    /// Applies `splice`, or nothing of it if any id it names is gone.
    pub(crate) fn apply_splice(
        &mut self,
        splice: &Splice,
        dead: &mut Tombstones,
    ) -> Result<(), GraphError> {
        self.check_splice(splice, dead)?;

        for toggle in &splice.toggles {
            if let Some(mm) = self
                .ops
                .get_mut(&toggle.op)
                .and_then(|op| op.kind.as_matmul_mut())
            {
                mm.toggle(toggle.operand);
            }
        }
        for rebind in &splice.rebinds {
            if let Some(op) = self.ops.get_mut(&rebind.op) {
                op.replace_input(rebind.from, rebind.to);
            }
            if let Some(t) = self.tensors.get_mut(&rebind.from) {
                t.remove_target(rebind.op);
            }
            if let Some(t) = self.tensors.get_mut(&rebind.to) {
                t.add_target(rebind.op);
            }
        }
        for &(tensor, op) in &splice.detach {
            if let Some(t) = self.tensors.get_mut(&tensor) {
                t.remove_target(op);
            }
        }
        for &(pred, succ) in &splice.drop_edges {
            self.disconnect(pred, succ);
        }
        for &(pred, succ) in &splice.add_edges {
            self.connect(pred, succ);
        }
        dead.ops.extend(splice.remove_ops.iter().copied());
        dead.tensors.extend(splice.remove_tensors.iter().copied());

        debug!(
            rule = %splice.rule,
            removed_ops = ?splice.remove_ops,
            removed_tensors = ?splice.remove_tensors,
            "rewrite applied"
        );
        Ok(())
    }

    fn check_splice(&self, splice: &Splice, dead: &Tombstones) -> Result<(), GraphError> {
        let holder = NodeRef::Pending(splice.rule.name());
        let ops = splice
            .remove_ops
            .iter()
            .copied()
            .chain(splice.drop_edges.iter().flat_map(|&(a, b)| [a, b]))
            .chain(splice.add_edges.iter().flat_map(|&(a, b)| [a, b]))
            .chain(splice.detach.iter().map(|&(_, op)| op))
            .chain(splice.rebinds.iter().map(|r| r.op))
            .chain(splice.toggles.iter().map(|t| t.op));
        for op in ops {
            if !self.ops.contains_key(&op) || dead.ops.contains(&op) {
                return Err(GraphError::DanglingReference {
                    holder,
                    target: NodeRef::Operator(op),
                });
            }
        }

        let tensors = splice
            .remove_tensors
            .iter()
            .copied()
            .chain(splice.detach.iter().map(|&(t, _)| t))
            .chain(splice.rebinds.iter().flat_map(|r| [r.from, r.to]));
        for tensor in tensors {
            if !self.tensors.contains_key(&tensor) || dead.tensors.contains(&tensor) {
                return Err(GraphError::DanglingReference {
                    holder,
                    target: NodeRef::Tensor(tensor),
                });
            }
        }

        for toggle in &splice.toggles {
            let is_matmul = self
                .ops
                .get(&toggle.op)
                .is_some_and(|op| op.kind.as_matmul().is_some());
            if !is_matmul {
                return Err(GraphError::InvalidRewrite {
                    rule: splice.rule.name(),
                    reason: format!("operator {} is not a MatMul", toggle.op),
                });
            }
        }
        for rebind in &splice.rebinds {
            let reads = self
                .ops
                .get(&rebind.op)
                .is_some_and(|op| op.inputs.contains(&rebind.from));
            if !reads {
                return Err(GraphError::InvalidRewrite {
                    rule: splice.rule.name(),
                    reason: format!(
                        "operator {} does not read tensor {}",
                        rebind.op, rebind.from
                    ),
                });
            }
        }
        Ok(())
    }

    fn purge(&mut self, dead: &Tombstones) {
        if dead.ops.is_empty() && dead.tensors.is_empty() {
            return;
        }
        self.ops.retain(|id, _| !dead.ops.contains(id));
        self.tensors.retain(|id, _| !dead.tensors.contains(id));
    }

    fn run_rules(
        &mut self,
        dead: &mut Tombstones,
        stats: &mut OptimizeStats,
    ) -> Result<(), GraphError> {
        let order: Vec<OpId> = self.ops.keys().copied().collect();
        for id in order {
            if dead.ops.contains(&id) {
                continue;
            }
            let candidates: Vec<Splice> = match self.ops.get(&id).map(|op| &op.kind) {
                Some(OpKind::Transpose(_)) => match_transpose_pair(self, id).into_iter().collect(),
                Some(OpKind::MatMul(_)) => {
                    // Operand B is matched against the graph after A's fusion.
                    if let Some(splice) = match_matmul_fusion(self, id, MatMulOperand::A) {
                        self.apply_splice(&splice, dead)?;
                        stats.record(&splice);
                    }
                    match_matmul_fusion(self, id, MatMulOperand::B)
                        .into_iter()
                        .collect()
                }
                _ => Vec::new(),
            };
            for splice in candidates {
                self.apply_splice(&splice, dead)?;
                stats.record(&splice);
            }
        }
        Ok(())
    }

    /// One rewrite pass over the operators in topological order.
    ///
    /// Each rule looks one hop back from the operator being visited; use
    /// [`Graph::optimize_to_fixpoint`] to repeat passes until nothing
    /// changes. Running `optimize` on an already optimized graph is a no-op.
    pub fn optimize(&mut self) -> Result<OptimizeStats, GraphError> {
        self.reject_allocated("optimize")?;
        self.topo_sort()?;

        let mut stats = OptimizeStats {
            rounds: 1,
            ..Default::default()
        };
        let mut dead = Tombstones::default();
        let outcome = self.run_rules(&mut dead, &mut stats);
        self.purge(&dead);
        outcome?;

        if stats.changed() || self.phase < GraphPhase::Optimized {
            self.phase = GraphPhase::Optimized;
        }
        info!(
            cancelled = stats.transposes_cancelled,
            fused = stats.transposes_fused,
            ops_removed = stats.ops_removed,
            tensors_removed = stats.tensors_removed,
            "graph optimized"
        );
        self.validate_if_configured()?;
        Ok(stats)
    }

    /// Repeats [`Graph::optimize`] until a pass changes nothing or
    /// `optimize.max_rounds` passes have run.
    pub fn optimize_to_fixpoint(&mut self) -> Result<OptimizeStats, GraphError> {
        let max_rounds = self.config.optimize.max_rounds.max(1);
        let mut total = OptimizeStats::default();
        for _ in 0..max_rounds {
            let stats = self.optimize()?;
            total.merge(stats);
            if !stats.changed() {
                return Ok(total);
            }
        }
        warn!(
            max_rounds,
            ops_removed = total.ops_removed,
            "optimize stopped at the round limit before reaching a fixpoint"
        );
        Ok(total)
    }
}
