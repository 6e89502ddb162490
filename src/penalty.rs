//! Penalty matrices and their placement in the full coefficient vector

use ndarray::{s, Array1, Array2};
use crate::{DsmError, Result};

/// Difference penalty `DᵀD` for P-spline coefficients
///
/// `D` is the `order`-th difference operator, so the penalty is zero for
/// polynomials of degree `< order` in the coefficient index.
pub fn difference_penalty(num_basis: usize, order: usize) -> Result<Array2<f64>> {
    if num_basis <= order {
        return Err(DsmError::InvalidParameter(format!(
            "difference penalty of order {} needs more than {} coefficients", order, order
        )));
    }

    let mut d = Array2::<f64>::eye(num_basis);
    for _ in 0..order {
        let rows = d.nrows() - 1;
        let mut next = Array2::<f64>::zeros((rows, num_basis));
        for i in 0..rows {
            for j in 0..num_basis {
                next[[i, j]] = d[[i + 1, j]] - d[[i, j]];
            }
        }
        d = next;
    }
    Ok(d.t().dot(&d))
}

/// Scale a penalty to unit Frobenius norm so smoothing parameters of
/// different terms live on comparable scales.
pub fn normalize(penalty: Array2<f64>) -> Array2<f64> {
    let frob_norm = penalty.iter().map(|v| v * v).sum::<f64>().sqrt();
    if frob_norm > 1e-10 {
        penalty / frob_norm
    } else {
        penalty
    }
}

/// A penalty matrix stored as a single non-zero block on the diagonal.
///
/// Represents a p×p matrix that is zero everywhere except for a k×k block
/// starting at position (offset, offset).
#[derive(Debug, Clone)]
pub struct PenaltyBlock {
    pub block: Array2<f64>,
    pub offset: usize,
    pub total_size: usize,
}

impl PenaltyBlock {
    pub fn new(block: Array2<f64>, offset: usize, total_size: usize) -> Result<Self> {
        if block.nrows() != block.ncols() || offset + block.nrows() > total_size {
            return Err(DsmError::DimensionMismatch(format!(
                "{}x{} penalty block at offset {} does not fit {} coefficients",
                block.nrows(), block.ncols(), offset, total_size
            )));
        }
        Ok(Self { block, offset, total_size })
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block.nrows()
    }

    /// Same block embedded in a larger coefficient vector
    pub fn widen(&self, total_size: usize) -> Result<Self> {
        Self::new(self.block.clone(), self.offset, total_size)
    }

    /// `target += scale * S` touching only the non-zero block
    pub fn scaled_add_to(&self, target: &mut Array2<f64>, scale: f64) {
        let k = self.block_size();
        let o = self.offset;
        let mut view = target.slice_mut(s![o..o + k, o..o + k]);
        view.scaled_add(scale, &self.block);
    }

    /// `S v`
    pub fn dot_vec(&self, v: &Array1<f64>) -> Array1<f64> {
        let k = self.block_size();
        let o = self.offset;
        let mut out = Array1::zeros(self.total_size);
        out.slice_mut(s![o..o + k])
            .assign(&self.block.dot(&v.slice(s![o..o + k])));
        out
    }

    /// `vᵀ S v`
    pub fn quadratic_form(&self, v: &Array1<f64>) -> f64 {
        let k = self.block_size();
        let o = self.offset;
        let sub = v.slice(s![o..o + k]);
        sub.dot(&self.block.dot(&sub))
    }
}

/// `Σ λ_j S_j` as a dense matrix
pub fn total_penalty(penalties: &[PenaltyBlock], lambdas: &[f64], p: usize) -> Array2<f64> {
    let mut total = Array2::<f64>::zeros((p, p));
    for (penalty, &lambda) in penalties.iter().zip(lambdas.iter()) {
        penalty.scaled_add_to(&mut total, lambda);
    }
    total
}
