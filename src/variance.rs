//! Sandwich variance of predicted abundance
//!
//! For a grid with cell offsets `a_i` and link-scale prediction rows `x_i`,
//! abundance is `N = Σ a_i exp(x_i β)`. Under a log link its gradient with
//! respect to β is `J = Σ N_i x_i`, so `Var(N) = J V Jᵀ`.

use std::ops::Range;

use ndarray::{concatenate, s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use crate::data::PredictionGrid;
use crate::family::Link;
use crate::gam::FittedSpatialModel;
use crate::refit::AugmentedModel;
use crate::varprop::VarianceType;
use crate::{DsmError, DsmWarning, Result};

/// Negative variances smaller than this fraction of the absolute sandwich
/// bound are round-off and read as zero.
const ROUNDOFF: f64 = 1e-10;

/// Abundance estimate for one prediction grid
#[derive(Debug, Clone)]
pub struct GridEstimate {
    /// Predicted abundance per cell
    pub cells: Array1<f64>,
    pub total: f64,
    pub variance: f64,
    pub se: f64,
    pub cv: f64,
}

impl GridEstimate {
    /// `bound` is `|J| |V| |J|ᵀ`; only negatives within round-off of it are
    /// set to zero. Other negative or non-finite variances are kept as they
    /// are, with NaN `se` and `cv`.
    fn new(cells: Array1<f64>, variance: f64, bound: f64) -> Self {
        let total = cells.sum();
        let variance = if variance < 0.0 && -variance <= ROUNDOFF * bound {
            0.0
        } else {
            variance
        };
        let se = if variance >= 0.0 { variance.sqrt() } else { f64::NAN };
        let cv = if total > 0.0 { se / total } else { f64::NAN };
        Self { cells, total, variance, se, cv }
    }

    /// Numerical warning for a variance that is negative or not finite
    pub fn numerical_warning(&self, grid: usize) -> Option<DsmWarning> {
        if self.variance.is_finite() && self.variance >= 0.0 {
            return None;
        }
        let msg = format!("abundance variance of grid {} is {}", grid, self.variance);
        log::warn!("{}", msg);
        Some(DsmWarning::Numerical(msg))
    }
}

/// Prediction matrices of all grids stacked row-wise, with the row range of
/// each grid.
///
/// Only the spatial model's columns are built. Any random-effect columns of
/// a refitted model are zero on prediction grids, so the sandwich uses the
/// leading block of its coefficients and covariance.
#[derive(Debug, Clone)]
pub struct StackedPrediction {
    pub matrix: Array2<f64>,
    pub ranges: Vec<Range<usize>>,
}

impl StackedPrediction {
    pub fn block(&self, grid: usize) -> ArrayView2<'_, f64> {
        self.matrix.slice(s![self.ranges[grid].clone(), ..])
    }

    pub fn n_grids(&self) -> usize {
        self.ranges.len()
    }
}

/// Build the stacked prediction matrix. Fails when a grid lacks a covariate
/// of the model.
pub fn stacked_lp_matrix(model: &FittedSpatialModel, grids: &[PredictionGrid]) -> Result<StackedPrediction> {
    let blocks: Vec<Array2<f64>> = grids
        .par_iter()
        .map(|grid| model.lp_matrix(&grid.data))
        .collect::<Result<_>>()?;

    let mut ranges = Vec::with_capacity(blocks.len());
    let mut start = 0;
    for block in &blocks {
        ranges.push(start..start + block.nrows());
        start += block.nrows();
    }

    let p = model.model_matrix().ncols();
    let views: Vec<ArrayView2<f64>> = blocks.iter().map(|b| b.view()).collect();
    let matrix = if views.is_empty() {
        Array2::zeros((0, p))
    } else {
        concatenate(Axis(0), &views).map_err(|e| DsmError::DimensionMismatch(e.to_string()))?
    };
    Ok(StackedPrediction { matrix, ranges })
}

/// Abundance and its sandwich variance for one block of prediction rows
pub fn sandwich(
    x: &ArrayView2<f64>,
    offset: &Array1<f64>,
    coefficients: &ArrayView1<f64>,
    covariance: &ArrayView2<f64>,
) -> Result<GridEstimate> {
    if x.nrows() != offset.len() || x.ncols() != coefficients.len() || covariance.nrows() != coefficients.len() {
        return Err(DsmError::DimensionMismatch(format!(
            "prediction block {}x{}, {} offsets, {} coefficients, covariance {}x{}",
            x.nrows(), x.ncols(), offset.len(), coefficients.len(), covariance.nrows(), covariance.ncols()
        )));
    }
    let cells = x.dot(coefficients).mapv(|e| Link::Log.inverse_link(e)) * offset;
    let jacobian = cells.dot(x);
    let variance = jacobian.dot(&covariance.dot(&jacobian));
    let abs_jacobian = jacobian.mapv(f64::abs);
    let bound = abs_jacobian.dot(&covariance.mapv(f64::abs).dot(&abs_jacobian));
    Ok(GridEstimate::new(cells, variance, bound))
}

fn require_log_link(model: &FittedSpatialModel) -> Result<()> {
    if model.family().link() != Link::Log {
        return Err(DsmError::UnsupportedModel(format!(
            "abundance variance needs a log link, model uses {}",
            model.family().link().name()
        )));
    }
    Ok(())
}

fn covariance_of(model: &FittedSpatialModel, var_type: VarianceType) -> &Array2<f64> {
    match var_type {
        VarianceType::Vp => model.vp(),
        VarianceType::Vc => model.vc(),
    }
}

/// Variance of predicted abundance from the spatial model alone
pub fn gam_variance(model: &FittedSpatialModel, grid: &PredictionGrid, var_type: VarianceType) -> Result<GridEstimate> {
    require_log_link(model)?;
    let x = model.lp_matrix(&grid.data)?;
    sandwich(
        &x.view(),
        &grid.offset,
        &model.coefficients().view(),
        &covariance_of(model, var_type).view(),
    )
}

/// Spatial-model-only estimates for every grid of a stacked prediction
pub fn stacked_gam_variance(
    model: &FittedSpatialModel,
    stacked: &StackedPrediction,
    grids: &[PredictionGrid],
    var_type: VarianceType,
) -> Result<Vec<GridEstimate>> {
    require_log_link(model)?;
    per_grid(stacked, grids, &model.coefficients().view(), &covariance_of(model, var_type).view())
}

/// Per-grid estimates using the refitted model's coefficients and covariance.
///
/// The detection shift only affects the fitted segments, so the
/// random-effect block is dropped. Grids are independent.
pub fn propagated_variance(
    model: &FittedSpatialModel,
    augmented: &AugmentedModel,
    stacked: &StackedPrediction,
    grids: &[PredictionGrid],
    var_type: VarianceType,
) -> Result<Vec<GridEstimate>> {
    require_log_link(model)?;
    let p = augmented.n_original();
    let coefficients = augmented.coefficients().slice(s![..p]);
    let covariance = augmented.covariance(var_type).slice(s![..p, ..p]);
    per_grid(stacked, grids, &coefficients, &covariance)
}

fn per_grid(
    stacked: &StackedPrediction,
    grids: &[PredictionGrid],
    coefficients: &ArrayView1<f64>,
    covariance: &ArrayView2<f64>,
) -> Result<Vec<GridEstimate>> {
    if stacked.n_grids() != grids.len() {
        return Err(DsmError::DimensionMismatch(format!(
            "stacked prediction holds {} grids, {} given", stacked.n_grids(), grids.len()
        )));
    }
    (0..grids.len())
        .into_par_iter()
        .map(|g| sandwich(&stacked.block(g), &grids[g].offset, coefficients, covariance))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_sandwich_intercept_only() {
        // N = Σ a_i e^β ⇒ dN/dβ = N, Var = N² v
        let x = Array2::ones((4, 1));
        let offset = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let beta = Array1::from_vec(vec![0.5]);
        let v = Array2::from_elem((1, 1), 0.04);
        let est = sandwich(&x.view(), &offset, &beta.view(), &v.view()).unwrap();
        let n = 10.0 * 0.5f64.exp();
        assert_abs_diff_eq!(est.total, n, epsilon = 1e-12);
        assert_abs_diff_eq!(est.variance, n * n * 0.04, epsilon = 1e-10);
        assert_abs_diff_eq!(est.cv, 0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_sandwich_zero_offset_cells() {
        let x = Array2::from_shape_vec((2, 2), vec![1.0, 0.3, 1.0, -0.2]).unwrap();
        let offset = Array1::from_vec(vec![0.0, 0.0]);
        let est = sandwich(&x.view(), &offset, &Array1::zeros(2).view(), &Array2::eye(2).view()).unwrap();
        assert_eq!(est.total, 0.0);
        assert_eq!(est.variance, 0.0);
        assert!(est.cv.is_nan());
        assert!(est.numerical_warning(0).is_none());
    }

    #[test]
    fn test_nan_covariance_is_reported() {
        let x = Array2::ones((3, 1));
        let v = Array2::from_elem((1, 1), f64::NAN);
        let est = sandwich(&x.view(), &Array1::ones(3), &Array1::zeros(1).view(), &v.view()).unwrap();
        assert!(est.variance.is_nan());
        assert!(est.se.is_nan());
        assert!(est.cv.is_nan());
        assert!(matches!(est.numerical_warning(2), Some(DsmWarning::Numerical(ref m)) if m.contains("grid 2")));
    }

    #[test]
    fn test_negative_variance_kept_unless_roundoff() {
        let x = Array2::ones((2, 1));
        let offset = Array1::ones(2);
        let beta = Array1::zeros(1);

        let indefinite = Array2::from_elem((1, 1), -0.5);
        let est = sandwich(&x.view(), &offset, &beta.view(), &indefinite.view()).unwrap();
        assert_abs_diff_eq!(est.variance, -2.0, epsilon = 1e-12);
        assert!(est.se.is_nan() && est.cv.is_nan());
        assert!(est.numerical_warning(0).is_some());

        // J = [2, 2], V with cancelling entries: J V Jᵀ = -4e-14 against a bound of 16
        let v = Array2::from_shape_vec((2, 2), vec![1.0, -1.0, -1.0, 1.0 - 1e-14]).unwrap();
        let x = Array2::ones((2, 2));
        let est = sandwich(&x.view(), &offset, &Array1::zeros(2).view(), &v.view()).unwrap();
        assert_eq!(est.variance, 0.0);
        assert_eq!(est.cv, 0.0);
        assert!(est.numerical_warning(0).is_none());
    }
}
