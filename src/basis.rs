//! Spline bases for the spatial smooth terms
//!
//! A [`SmoothTerm`] describes a term (covariates and basis sizes). At fit
//! time it is set up against the segment data into a [`SmoothBasis`], which
//! fixes the knot range, absorbs the centering constraint and builds the
//! constrained penalty matrices.

use ndarray::{Array1, Array2, ArrayView1};
use crate::data::Frame;
use crate::linalg::{constraint_null_space, kronecker, psd_rank, row_kronecker};
use crate::penalty::{difference_penalty, normalize};
use crate::{DsmError, Result};

/// Trait for basis function implementations
pub trait BasisFunction: Send + Sync {
    /// Evaluate the basis functions at given points
    fn evaluate(&self, x: &ArrayView1<f64>) -> Result<Array2<f64>>;

    /// Get the number of basis functions
    fn num_basis(&self) -> usize;

    /// Penalty on the basis coefficients (unconstrained)
    fn penalty(&self) -> Result<Array2<f64>>;
}

/// Cubic B-spline basis with evenly spaced knots and a second-order
/// difference penalty (a P-spline).
#[derive(Debug, Clone)]
pub struct BSpline {
    /// Full knot vector, `num_basis + 4` knots
    knots: Array1<f64>,
    num_basis: usize,
}

impl BSpline {
    const DEGREE: usize = 3;

    /// Basis covering `[x_min, x_max]` (widened slightly so both end points
    /// are interior).
    pub fn new(num_basis: usize, x_min: f64, x_max: f64) -> Result<Self> {
        if num_basis < 4 {
            return Err(DsmError::InvalidParameter(
                "Need at least 4 basis functions for a cubic B-spline".to_string(),
            ));
        }
        if !(x_max > x_min) || !x_min.is_finite() || !x_max.is_finite() {
            return Err(DsmError::InvalidParameter(format!(
                "invalid covariate range [{}, {}]", x_min, x_max
            )));
        }

        let pad = 0.001 * (x_max - x_min);
        let lo = x_min - pad;
        let hi = x_max + pad;
        let h = (hi - lo) / (num_basis - Self::DEGREE) as f64;
        let knots = Array1::from_iter(
            (0..num_basis + Self::DEGREE + 1).map(|i| lo + (i as f64 - Self::DEGREE as f64) * h),
        );

        Ok(Self { knots, num_basis })
    }

    /// Cox-de Boor recursion, bottom-up
    fn basis_row(&self, x: f64, out: &mut [f64]) {
        let t = &self.knots;
        let m = t.len();
        let mut b = vec![0.0; m - 1];
        for i in 0..m - 1 {
            if x >= t[i] && x < t[i + 1] {
                b[i] = 1.0;
            }
        }
        for d in 1..=Self::DEGREE {
            for i in 0..m - 1 - d {
                let left = (x - t[i]) / (t[i + d] - t[i]) * b[i];
                let right = (t[i + d + 1] - x) / (t[i + d + 1] - t[i + 1]) * b[i + 1];
                b[i] = left + right;
            }
        }
        out.copy_from_slice(&b[..self.num_basis]);
    }
}

impl BasisFunction for BSpline {
    fn evaluate(&self, x: &ArrayView1<f64>) -> Result<Array2<f64>> {
        let mut design = Array2::zeros((x.len(), self.num_basis));
        let mut row = vec![0.0; self.num_basis];
        for (i, &xi) in x.iter().enumerate() {
            if !xi.is_finite() {
                return Err(DsmError::Validation(format!("non-finite covariate value at row {}", i)));
            }
            self.basis_row(xi, &mut row);
            for (j, &v) in row.iter().enumerate() {
                design[[i, j]] = v;
            }
        }
        Ok(design)
    }

    fn num_basis(&self) -> usize {
        self.num_basis
    }

    fn penalty(&self) -> Result<Array2<f64>> {
        difference_penalty(self.num_basis, 2)
    }
}

/// Definition of a smooth term: `s(x)` or a tensor product `te(x, y)`.
#[derive(Debug, Clone)]
pub struct SmoothTerm {
    pub label: String,
    covariates: Vec<String>,
    basis_sizes: Vec<usize>,
}

impl SmoothTerm {
    /// One-dimensional smooth of `covariate` with `num_basis` coefficients
    pub fn spline(covariate: &str, num_basis: usize) -> Result<Self> {
        if num_basis < 4 {
            return Err(DsmError::InvalidParameter(format!(
                "s({}) needs at least 4 basis functions", covariate
            )));
        }
        Ok(Self {
            label: format!("s({})", covariate),
            covariates: vec![covariate.to_string()],
            basis_sizes: vec![num_basis],
        })
    }

    /// Tensor-product smooth of two covariates, typically the spatial
    /// coordinates. Each margin carries its own smoothing parameter.
    pub fn tensor(first: &str, second: &str, k_first: usize, k_second: usize) -> Result<Self> {
        if k_first < 4 || k_second < 4 {
            return Err(DsmError::InvalidParameter(format!(
                "te({}, {}) needs at least 4 basis functions per margin", first, second
            )));
        }
        Ok(Self {
            label: format!("te({},{})", first, second),
            covariates: vec![first.to_string(), second.to_string()],
            basis_sizes: vec![k_first, k_second],
        })
    }

    pub fn covariates(&self) -> &[String] {
        &self.covariates
    }

    /// Fix knots from the data range and absorb the centering constraint.
    pub fn setup(&self, data: &Frame) -> Result<SmoothBasis> {
        let mut margins = Vec::with_capacity(self.covariates.len());
        for (name, &k) in self.covariates.iter().zip(self.basis_sizes.iter()) {
            let x = data.column(name)?;
            let x_min = x.iter().cloned().fold(f64::INFINITY, f64::min);
            let x_max = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            margins.push(BSpline::new(k, x_min, x_max)?);
        }

        let raw_penalties: Vec<Array2<f64>> = match margins.len() {
            1 => vec![margins[0].penalty()?],
            _ => {
                let (k1, k2) = (margins[0].num_basis(), margins[1].num_basis());
                vec![
                    kronecker(&margins[0].penalty()?, &Array2::eye(k2)),
                    kronecker(&Array2::eye(k1), &margins[1].penalty()?),
                ]
            }
        };

        let unconstrained = SmoothBasis::raw_design(&self.covariates, &margins, data)?;
        let column_sums = unconstrained.sum_axis(ndarray::Axis(0));
        let constraint = constraint_null_space(&column_sums.view())?;

        let penalties: Vec<Array2<f64>> = raw_penalties
            .iter()
            .map(|s| normalize(constraint.t().dot(s).dot(&constraint)))
            .collect();

        let mut combined = Array2::<f64>::zeros(penalties[0].dim());
        for s in &penalties {
            combined += s;
        }
        let penalty_rank = psd_rank(&combined)?;

        Ok(SmoothBasis {
            label: self.label.clone(),
            covariates: self.covariates.clone(),
            margins,
            constraint,
            penalties,
            penalty_rank,
        })
    }
}

/// A smooth term set up against fitting data
#[derive(Debug, Clone)]
pub struct SmoothBasis {
    pub label: String,
    covariates: Vec<String>,
    margins: Vec<BSpline>,
    /// Null space of the centering constraint (k × k-1)
    constraint: Array2<f64>,
    /// Constrained penalties, one per smoothing parameter
    pub penalties: Vec<Array2<f64>>,
    /// Rank of `Σ_j S_j`, constant in the smoothing parameters
    pub penalty_rank: usize,
}

impl SmoothBasis {
    fn raw_design(covariates: &[String], margins: &[BSpline], data: &Frame) -> Result<Array2<f64>> {
        let mut design = margins[0].evaluate(&data.column(&covariates[0])?)?;
        for (name, margin) in covariates.iter().zip(margins.iter()).skip(1) {
            let next = margin.evaluate(&data.column(name)?)?;
            design = row_kronecker(&design, &next)?;
        }
        Ok(design)
    }

    /// Constrained design matrix at the rows of `data`
    pub fn design(&self, data: &Frame) -> Result<Array2<f64>> {
        let raw = Self::raw_design(&self.covariates, &self.margins, data)?;
        Ok(raw.dot(&self.constraint))
    }

    pub fn num_coef(&self) -> usize {
        self.constraint.ncols()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_bspline_partition_of_unity() {
        let basis = BSpline::new(8, 0.0, 10.0).unwrap();
        let x = Array1::linspace(0.0, 10.0, 41);
        let design = basis.evaluate(&x.view()).unwrap();
        assert_eq!(design.dim(), (41, 8));
        for row in design.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-10);
            assert!(row.iter().all(|&v| v >= -1e-12));
        }
    }

    #[test]
    fn test_smooth_is_centered() {
        let x = Array1::linspace(-3.0, 5.0, 60);
        let data = Frame::new().with_column("x", x).unwrap();
        let smooth = SmoothTerm::spline("x", 10).unwrap().setup(&data).unwrap();

        assert_eq!(smooth.num_coef(), 9);
        assert_eq!(smooth.penalties.len(), 1);
        let design = smooth.design(&data).unwrap();
        for col in design.columns() {
            assert_abs_diff_eq!(col.sum(), 0.0, epsilon = 1e-9);
        }
        assert!(smooth.penalty_rank >= 7);
    }

    #[test]
    fn test_tensor_dimensions() {
        let n = 50;
        let x = Array1::from_iter((0..n).map(|i| (i % 10) as f64));
        let y = Array1::from_iter((0..n).map(|i| (i / 10) as f64));
        let data = Frame::new()
            .with_column("x", x).unwrap()
            .with_column("y", y).unwrap();

        let smooth = SmoothTerm::tensor("x", "y", 4, 5).unwrap().setup(&data).unwrap();
        assert_eq!(smooth.num_coef(), 19);
        assert_eq!(smooth.penalties.len(), 2);
        assert_eq!(smooth.design(&data).unwrap().dim(), (n, 19));
    }

    #[test]
    fn test_missing_covariate() {
        let data = Frame::new().with_column("x", Array1::zeros(3)).unwrap();
        let err = SmoothTerm::spline("depth", 5).unwrap().setup(&data).unwrap_err();
        assert!(matches!(err, DsmError::Validation(_)));
    }
}
