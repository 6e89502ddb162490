//! Spatial GAM definition and fitting
//!
//! A [`SpatialModel`] is a family plus smooth terms. Fitting it to
//! [`Segments`] with a [`DetectionModel`] gives a [`FittedSpatialModel`]:
//! coefficients, the Bayesian covariance `Vp`, the smoothing-parameter
//! corrected covariance `Vc`, and everything the variance propagation needs
//! to refit the model.

use ndarray::{s, Array1, Array2};
use crate::basis::{SmoothBasis, SmoothTerm};
use crate::data::{Frame, PredictionGrid, Segments};
use crate::detection::DetectionModel;
use crate::family::Family;
use crate::linalg::{pseudo_inverse, spd_inverse};
use crate::penalty::PenaltyBlock;
use crate::pirls::{fit_pirls, PirlsData, PirlsResult};
use crate::reml::{NewtonReml, RemlProblem, TermPenalties};
use crate::{DsmError, DsmWarning, Result};

/// How the spatial model was estimated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Penalized GAM; can be refitted with extra terms
    Gam,
    /// Mixed-model representation; predictions are available but the model
    /// cannot be refitted
    Gamm,
}

/// What the segment response measures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Raw counts; offset is `log(area · p)`
    Count,
    /// Detection-corrected abundance per segment; offset is `log(area)`
    AbundanceEstimate,
    /// Detection-corrected density; area enters as a prior weight
    DensityEstimate,
}

/// Smoothing parameter selection
#[derive(Debug, Clone, PartialEq)]
pub enum SmoothingSelection {
    Reml,
    /// Fixed smoothing parameters, one per penalty in term order
    Fixed(Vec<f64>),
}

#[derive(Debug, Clone)]
pub struct FitOptions {
    pub method: SmoothingSelection,
    pub max_pirls_iter: usize,
    pub pirls_tolerance: f64,
    pub max_reml_iter: usize,
    pub reml_tolerance: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            method: SmoothingSelection::Reml,
            max_pirls_iter: 100,
            pirls_tolerance: 1e-9,
            max_reml_iter: 100,
            reml_tolerance: 1e-6,
        }
    }
}

/// Unfitted spatial model
#[derive(Debug, Clone)]
pub struct SpatialModel {
    family: Family,
    terms: Vec<SmoothTerm>,
    response: ResponseKind,
    kind: ModelKind,
}

impl SpatialModel {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            terms: Vec::new(),
            response: ResponseKind::Count,
            kind: ModelKind::Gam,
        }
    }

    pub fn add_smooth(&mut self, term: SmoothTerm) {
        self.terms.push(term);
    }

    pub fn with_response(mut self, response: ResponseKind) -> Self {
        self.response = response;
        self
    }

    pub fn with_kind(mut self, kind: ModelKind) -> Self {
        self.kind = kind;
        self
    }

    /// Offset and prior weights implied by the response kind
    fn offset_and_weights(
        &self,
        segments: &Segments,
        detection: &DetectionModel,
    ) -> Result<(Array1<f64>, Array1<f64>)> {
        let log_area = segments.effort.mapv(f64::ln);
        let ones = Array1::ones(segments.len());
        Ok(match self.response {
            ResponseKind::Count => (log_area + detection.log_probability(segments)?, ones),
            ResponseKind::AbundanceEstimate => (log_area, ones),
            ResponseKind::DensityEstimate => (Array1::zeros(segments.len()), segments.effort.clone()),
        })
    }

    /// Fit the model to segment data
    pub fn fit(
        &self,
        segments: Segments,
        detection: DetectionModel,
        options: &FitOptions,
    ) -> Result<FittedSpatialModel> {
        self.family.validate()?;
        if segments.is_empty() {
            return Err(DsmError::Validation("no segments to fit".to_string()));
        }
        detection.check_segments(&segments)?;

        let terms: Vec<SmoothBasis> = self
            .terms
            .iter()
            .map(|t| t.setup(&segments.data))
            .collect::<Result<_>>()?;
        let model_matrix = build_model_matrix(&terms, &segments.data)?;
        let (penalties, term_penalties) = build_penalties(&terms, model_matrix.ncols())?;

        let (offset, prior_weights) = self.offset_and_weights(&segments, &detection)?;
        let data = PirlsData {
            y: &segments.response,
            x: &model_matrix,
            offset: &offset,
            prior_weights: &prior_weights,
        };

        let mut warnings = Vec::new();
        let m = penalties.len();

        let (fit, lambda, rho_covariance) = match &options.method {
            SmoothingSelection::Fixed(lambda) => {
                if lambda.len() != m || lambda.iter().any(|&l| !(l >= 0.0)) {
                    return Err(DsmError::InvalidParameter(format!(
                        "expected {} non-negative smoothing parameters, got {:?}", m, lambda
                    )));
                }
                let fit = fit_pirls(
                    data,
                    lambda,
                    &penalties,
                    self.family,
                    options.max_pirls_iter,
                    options.pirls_tolerance,
                )?;
                (fit, Array1::from_vec(lambda.clone()), Array2::zeros((m, m)))
            }
            SmoothingSelection::Reml => {
                let problem = RemlProblem {
                    data,
                    penalties: &penalties,
                    terms: &term_penalties,
                    family: self.family,
                    max_pirls_iter: options.max_pirls_iter,
                    pirls_tolerance: options.pirls_tolerance,
                };
                let start = problem.initial_log_lambda()?;
                let result = NewtonReml::new(options.max_reml_iter, options.reml_tolerance)
                    .optimize(&problem, &start)?;
                log::debug!(
                    "REML finished after {} iterations: {} (lambda = {:?})",
                    result.iterations, result.message, result.lambda.to_vec()
                );
                if !result.converged {
                    let msg = format!("smoothing parameter selection: {}", result.message);
                    log::warn!("{}", msg);
                    warnings.push(DsmWarning::Convergence(msg));
                }
                let rho_cov = if m > 0 { pseudo_inverse(&result.rho_hessian)? } else { Array2::zeros((0, 0)) };
                (result.fit, result.lambda, rho_cov)
            }
        };

        if !fit.converged {
            let msg = format!("PiRLS did not converge in {} iterations", fit.iterations);
            log::warn!("{}", msg);
            warnings.push(DsmWarning::Convergence(msg));
        }

        let edf = fit.edf(&model_matrix)?;
        let scale = estimate_scale(self.family, &segments.response, &fit, &prior_weights, edf);
        let (vp, vc) = covariances(&fit, &penalties, lambda.as_slice().unwrap_or(&[]), &rho_covariance, scale)?;

        log::info!(
            "fitted {} model: {} coefficients, edf {:.2}, scale {:.4}",
            self.family.name(), model_matrix.ncols(), edf, scale
        );

        Ok(FittedSpatialModel {
            family: self.family,
            kind: self.kind,
            response: self.response,
            terms,
            model_matrix,
            penalties,
            term_penalties,
            lambda,
            coefficients: fit.coefficients.clone(),
            vp,
            vc,
            scale,
            edf,
            fitted_values: fit.fitted_values.clone(),
            rho_covariance,
            segments,
            offset,
            prior_weights,
            detection,
            converged: fit.converged,
            warnings,
        })
    }
}

/// Intercept followed by each term's constrained design
fn build_model_matrix(terms: &[SmoothBasis], data: &Frame) -> Result<Array2<f64>> {
    let n = data.nrows();
    let p = 1 + terms.iter().map(|t| t.num_coef()).sum::<usize>();
    let mut x = Array2::zeros((n, p));
    x.column_mut(0).fill(1.0);
    let mut col = 1;
    for term in terms {
        let design = term.design(data)?;
        let k = design.ncols();
        x.slice_mut(s![.., col..col + k]).assign(&design);
        col += k;
    }
    Ok(x)
}

fn build_penalties(terms: &[SmoothBasis], p: usize) -> Result<(Vec<PenaltyBlock>, Vec<TermPenalties>)> {
    let mut penalties = Vec::new();
    let mut groups = Vec::new();
    let mut col = 1;
    for term in terms {
        groups.push(TermPenalties {
            first: penalties.len(),
            count: term.penalties.len(),
            rank: term.penalty_rank,
        });
        for s_mat in &term.penalties {
            penalties.push(PenaltyBlock::new(s_mat.clone(), col, p)?);
        }
        col += term.num_coef();
    }
    Ok((penalties, groups))
}

/// Pearson scale estimate for free-scale families; 1 otherwise
pub(crate) fn estimate_scale(
    family: Family,
    y: &Array1<f64>,
    fit: &PirlsResult,
    prior_weights: &Array1<f64>,
    edf: f64,
) -> f64 {
    if family.scale_known() {
        return 1.0;
    }
    let residual_df = (y.len() as f64 - edf).max(1.0);
    family.pearson(&y.view(), &fit.fitted_values.view(), &prior_weights.view()) / residual_df
}

/// `Vp = φ H⁻¹` and `Vc = Vp + J_ρ V_ρ J_ρᵀ`, where
/// `J_ρ[:, k] = ∂β̂/∂ρ_k = -λ_k H⁻¹ S_k β̂`.
///
/// Only the first `rho_covariance.nrows()` penalties carry estimated
/// smoothing parameters; any further penalties are treated as fixed.
pub(crate) fn covariances(
    fit: &PirlsResult,
    penalties: &[PenaltyBlock],
    lambda: &[f64],
    rho_covariance: &Array2<f64>,
    scale: f64,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let h_inv = spd_inverse(&fit.penalized_hessian)?;
    let vp = &h_inv * scale;

    let m = rho_covariance.nrows();
    if m == 0 {
        return Ok((vp.clone(), vp));
    }
    let p = vp.nrows();
    let mut j_rho = Array2::<f64>::zeros((p, m));
    for k in 0..m {
        let s_beta = penalties[k].dot_vec(&fit.coefficients);
        let col = h_inv.dot(&s_beta) * (-lambda[k]);
        j_rho.column_mut(k).assign(&col);
    }
    let correction = j_rho.dot(rho_covariance).dot(&j_rho.t());
    let vc = &vp + &correction;
    Ok((vp, vc))
}

/// A spatial model fitted to segment data. Immutable once fitted.
#[derive(Debug, Clone)]
pub struct FittedSpatialModel {
    family: Family,
    kind: ModelKind,
    response: ResponseKind,
    terms: Vec<SmoothBasis>,
    model_matrix: Array2<f64>,
    penalties: Vec<PenaltyBlock>,
    term_penalties: Vec<TermPenalties>,
    lambda: Array1<f64>,
    coefficients: Array1<f64>,
    vp: Array2<f64>,
    vc: Array2<f64>,
    scale: f64,
    edf: f64,
    fitted_values: Array1<f64>,
    /// Covariance of the log smoothing parameters
    rho_covariance: Array2<f64>,
    segments: Segments,
    offset: Array1<f64>,
    prior_weights: Array1<f64>,
    detection: DetectionModel,
    converged: bool,
    warnings: Vec<DsmWarning>,
}

impl FittedSpatialModel {
    /// Link-scale prediction matrix (without offset) at new covariate rows
    pub fn lp_matrix(&self, data: &Frame) -> Result<Array2<f64>> {
        build_model_matrix(&self.terms, data)
    }

    /// Predicted abundance per grid cell: `offset · g⁻¹(Xβ̂)`
    pub fn predict(&self, grid: &PredictionGrid) -> Result<Array1<f64>> {
        let x = self.lp_matrix(&grid.data)?;
        let link = self.family.link();
        let eta = x.dot(&self.coefficients);
        Ok(eta.mapv(|e| link.inverse_link(e)) * &grid.offset)
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn response(&self) -> ResponseKind {
        self.response
    }

    pub fn term_labels(&self) -> Vec<&str> {
        self.terms.iter().map(|t| t.label.as_str()).collect()
    }

    pub fn model_matrix(&self) -> &Array2<f64> {
        &self.model_matrix
    }

    pub fn penalties(&self) -> &[PenaltyBlock] {
        &self.penalties
    }

    pub fn lambda(&self) -> &Array1<f64> {
        &self.lambda
    }

    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }

    pub fn vp(&self) -> &Array2<f64> {
        &self.vp
    }

    pub fn vc(&self) -> &Array2<f64> {
        &self.vc
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn edf(&self) -> f64 {
        self.edf
    }

    pub fn fitted_values(&self) -> &Array1<f64> {
        &self.fitted_values
    }

    pub fn rho_covariance(&self) -> &Array2<f64> {
        &self.rho_covariance
    }

    pub fn segments(&self) -> &Segments {
        &self.segments
    }

    pub fn offset(&self) -> &Array1<f64> {
        &self.offset
    }

    pub fn prior_weights(&self) -> &Array1<f64> {
        &self.prior_weights
    }

    pub fn detection(&self) -> &DetectionModel {
        &self.detection
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn warnings(&self) -> &[DsmWarning] {
        &self.warnings
    }

    /// Whether the model can be refitted with an extra random effect
    pub fn supports_refit(&self) -> bool {
        self.kind == ModelKind::Gam
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn poisson_segments() -> Segments {
        let n = 120;
        let x = Array1::from_iter((0..n).map(|i| (i % 12) as f64 / 11.0));
        let y_cov = Array1::from_iter((0..n).map(|i| (i / 12) as f64 / 9.0));
        let counts = Array1::from_iter((0..n).map(|i| {
            let (a, b) = (x[i], y_cov[i]);
            (3.0 * (1.0 + (3.0 * a).sin() * b)).round().max(0.0)
        }));
        let data = Frame::new()
            .with_column("x", x).unwrap()
            .with_column("y", y_cov).unwrap();
        Segments::new(data, Array1::from_elem(n, 2.0), counts).unwrap()
    }

    #[test]
    fn test_fit_reproduces_total_count() {
        let mut spec = SpatialModel::new(Family::Poisson);
        spec.add_smooth(SmoothTerm::spline("x", 6).unwrap());
        let segments = poisson_segments();
        let total = segments.response.sum();
        let model = spec
            .fit(segments, DetectionModel::Placeholder { probability: 0.5 }, &FitOptions::default())
            .unwrap();

        // log-link with intercept: Σ fitted = Σ y
        assert_relative_eq!(model.fitted_values().sum(), total, max_relative = 1e-6);
        assert_eq!(model.coefficients().len(), 6);
        assert_eq!(model.scale(), 1.0);
        for i in 0..6 {
            assert!(model.vc()[[i, i]] >= model.vp()[[i, i]] - 1e-12);
        }
    }

    #[test]
    fn test_predict_on_segments_matches_fitted() {
        let mut spec = SpatialModel::new(Family::Quasipoisson);
        spec.add_smooth(SmoothTerm::tensor("x", "y", 4, 4).unwrap());
        let segments = poisson_segments();
        let options = FitOptions {
            method: SmoothingSelection::Fixed(vec![1.0, 1.0]),
            ..FitOptions::default()
        };
        let model = spec
            .fit(segments.clone(), DetectionModel::Placeholder { probability: 0.5 }, &options)
            .unwrap();

        // a grid equal to the segments with area · p as offset reproduces fitted values
        let grid = PredictionGrid::new(segments.data.clone(), segments.effort.mapv(|a| a * 0.5)).unwrap();
        let pred = model.predict(&grid).unwrap();
        for (a, b) in pred.iter().zip(model.fitted_values().iter()) {
            assert_relative_eq!(*a, *b, max_relative = 1e-9);
        }
        assert!(model.scale() > 0.0);
        assert_eq!(model.vp(), model.vc());
        assert_eq!(model.term_labels(), vec!["te(x,y)"]);
    }

    #[test]
    fn test_fixed_lambda_count_checked() {
        let mut spec = SpatialModel::new(Family::Poisson);
        spec.add_smooth(SmoothTerm::spline("x", 6).unwrap());
        let options = FitOptions {
            method: SmoothingSelection::Fixed(vec![1.0, 2.0]),
            ..FitOptions::default()
        };
        let err = spec
            .fit(poisson_segments(), DetectionModel::Placeholder { probability: 1.0 }, &options)
            .unwrap_err();
        assert!(matches!(err, DsmError::InvalidParameter(_)));
    }
}
