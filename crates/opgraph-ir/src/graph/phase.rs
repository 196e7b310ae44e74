//! Lifecycle phases of a graph.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a graph stands in the build → sort → optimize → infer → bind
/// pipeline. Phases are ordered; any structural mutation drops the graph back
/// to [`GraphPhase::Building`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GraphPhase {
    #[default]
    Building,
    /// Operators are stored in topological order.
    Sorted,
    /// Rewrite rules have run; the order is still topological.
    Optimized,
    /// Every output shape agrees with its operator's inference.
    ShapeResolved,
    /// Every tensor is bound to storage.
    Allocated,
}

impl GraphPhase {
    pub fn is_sorted(self) -> bool {
        self >= GraphPhase::Sorted
    }

    pub fn name(self) -> &'static str {
        match self {
            GraphPhase::Building => "building",
            GraphPhase::Sorted => "sorted",
            GraphPhase::Optimized => "optimized",
            GraphPhase::ShapeResolved => "shape-resolved",
            GraphPhase::Allocated => "allocated",
        }
    }
}

impl fmt::Display for GraphPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
