//! Batched matrix multiplication with optional operand transposition.

use serde::{Deserialize, Serialize};

use super::broadcast::broadcast_shapes;
use crate::config::BroadcastPolicy;
use crate::error::GraphError;
use crate::tensor::Shape;

/// Which MatMul operand a rewrite refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatMulOperand {
    A,
    B,
}

impl MatMulOperand {
    /// Input slot of the operand.
    pub fn slot(self) -> usize {
        match self {
            MatMulOperand::A => 0,
            MatMulOperand::B => 1,
        }
    }
}

/// `C = op(A) x op(B)` where `op` swaps the last two axes when the matching
/// flag is set. `m`, `n` and `k` are filled in by shape inference.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatMul {
    trans_a: bool,
    trans_b: bool,
    m: usize,
    n: usize,
    k: usize,
}

impl MatMul {
    pub fn new(trans_a: bool, trans_b: bool) -> Self {
        MatMul {
            trans_a,
            trans_b,
            ..Default::default()
        }
    }

    pub fn trans_a(&self) -> bool {
        self.trans_a
    }

    pub fn trans_b(&self) -> bool {
        self.trans_b
    }

    /// Flips the transposition flag of one operand.
    pub fn toggle(&mut self, operand: MatMulOperand) {
        match operand {
            MatMulOperand::A => self.trans_a = !self.trans_a,
            MatMulOperand::B => self.trans_b = !self.trans_b,
        }
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Infers the output shape and records `m`, `n`, `k`.
    ///
    /// The trailing output axes are `[m, n]`; every other axis is a batch
    /// axis broadcast between the operands.
    pub fn infer_shape(
        &mut self,
        a: &[usize],
        b: &[usize],
        policy: BroadcastPolicy,
    ) -> Result<Shape, GraphError> {
        if a.len() < 2 || b.len() < 2 {
            return Err(GraphError::UnresolvedShape {
                kind: "MatMul",
                reason: format!("operands need rank >= 2, got {:?} and {:?}", a, b),
            });
        }

        let mut a_eff = a.to_vec();
        let mut b_eff = b.to_vec();
        if self.trans_a {
            a_eff.swap(a.len() - 1, a.len() - 2);
        }
        if self.trans_b {
            b_eff.swap(b.len() - 1, b.len() - 2);
        }

        let (m, k) = (a_eff[a.len() - 2], a_eff[a.len() - 1]);
        let (k_b, n) = (b_eff[b.len() - 2], b_eff[b.len() - 1]);
        if k != k_b {
            return Err(GraphError::UnresolvedShape {
                kind: "MatMul",
                reason: format!(
                    "contraction extents differ: A{} has k={}, B{} has k={}",
                    if self.trans_a { "^T" } else { "" },
                    k,
                    if self.trans_b { "^T" } else { "" },
                    k_b
                ),
            });
        }

        let mut out = broadcast_shapes(&a_eff[..a.len() - 2], &b_eff[..b.len() - 2], policy)?;
        out.push(m);
        out.push(n);

        self.m = m;
        self.n = n;
        self.k = k;
        Ok(out)
    }
}
