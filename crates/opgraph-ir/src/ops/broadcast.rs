//! Numpy-style broadcasting of extents.

use crate::config::BroadcastPolicy;
use crate::error::GraphError;
use crate::tensor::Shape;

/// Broadcast two shapes, aligning them at the innermost axis.
///
/// A missing axis counts as extent 1. Under [`BroadcastPolicy::Strict`]
/// unequal extents are only compatible when one of them is 1; under
/// [`BroadcastPolicy::LargestWins`] the larger extent is taken unchecked.
pub fn broadcast_shapes(
    lhs: &[usize],
    rhs: &[usize],
    policy: BroadcastPolicy,
) -> Result<Shape, GraphError> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![1; rank];
    for i in 0..rank {
        let l = if i < lhs.len() { lhs[lhs.len() - 1 - i] } else { 1 };
        let r = if i < rhs.len() { rhs[rhs.len() - 1 - i] } else { 1 };
        out[rank - 1 - i] = broadcast_extent(l, r, policy).ok_or_else(|| {
            GraphError::BroadcastIncompatible {
                lhs: lhs.to_vec(),
                rhs: rhs.to_vec(),
                lhs_extent: l,
                rhs_extent: r,
            }
        })?;
    }
    Ok(out)
}

fn broadcast_extent(l: usize, r: usize, policy: BroadcastPolicy) -> Option<usize> {
    match policy {
        BroadcastPolicy::LargestWins => Some(l.max(r)),
        BroadcastPolicy::Strict => {
            if l == r || r == 1 {
                Some(l)
            } else if l == 1 {
                Some(r)
            } else {
                None
            }
        }
    }
}
