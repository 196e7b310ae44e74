//! Axis permutation.

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::tensor::Shape;

/// Permutes the axes of its input: output axis `i` is input axis `permute[i]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transpose {
    permute: Vec<usize>,
}

impl Transpose {
    pub fn new(permute: Vec<usize>) -> Self {
        Transpose { permute }
    }

    /// Swaps the last two axes of a rank-`rank` tensor.
    pub fn swap_last_two(rank: usize) -> Self {
        let mut permute: Vec<usize> = (0..rank).collect();
        if rank >= 2 {
            permute.swap(rank - 1, rank - 2);
        }
        Transpose { permute }
    }

    pub fn permute(&self) -> &[usize] {
        &self.permute
    }

    /// Number of axes that do not map to themselves.
    pub fn displaced_axes(&self) -> usize {
        self.permute
            .iter()
            .enumerate()
            .filter(|&(i, &p)| i != p)
            .count()
    }

    pub fn is_identity(&self) -> bool {
        self.displaced_axes() == 0
    }

    /// A permutation that exchanges exactly two axes is its own inverse.
    pub fn is_two_axis_swap(&self) -> bool {
        self.displaced_axes() == 2
    }

    /// Exchanges the last two axes and fixes every other axis.
    pub fn swaps_last_two(&self) -> bool {
        let rank = self.permute.len();
        rank >= 2
            && self.permute[rank - 1] == rank - 2
            && self.permute[rank - 2] == rank - 1
            && self.permute[..rank - 2]
                .iter()
                .enumerate()
                .all(|(i, &p)| i == p)
    }

    pub fn is_valid_for(&self, rank: usize) -> bool {
        if self.permute.len() != rank {
            return false;
        }
        let mut seen = vec![false; rank];
        self.permute.iter().all(|&p| {
            if p >= rank || seen[p] {
                return false;
            }
            seen[p] = true;
            true
        })
    }

    pub fn infer_shape(&self, input: &[usize]) -> Result<Shape, GraphError> {
        if !self.is_valid_for(input.len()) {
            return Err(GraphError::InvalidPermutation {
                perm: self.permute.clone(),
                rank: input.len(),
            });
        }
        Ok(self.permute.iter().map(|&p| input[p]).collect())
    }
}
