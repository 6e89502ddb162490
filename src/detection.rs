//! Detection functions for distance sampling
//!
//! A detection function g(x) gives the probability of detecting an animal at
//! distance x from the transect. The scale σ may depend on covariates through
//! `log σ = β0 + zᵀβ`. The average detection probability within the
//! truncation distance `w` is
//!
//! - line transects: `p = (1/w) ∫₀ʷ g(x) dx`
//! - point transects: `p = ∫₀ʷ g(r) 2r/w² dr`
//!
//! Parameters are estimated by maximum likelihood; the log-likelihood can be
//! evaluated at any parameter vector, which is what the numerical Hessian and
//! offset derivatives need.

use ndarray::{Array1, Array2, ArrayView1};
use crate::data::{Frame, Segments};
use crate::hessian;
use crate::linalg::{cholesky, cholesky_solve};
use crate::{DsmError, Result};

const INTEGRATION_PANELS: usize = 256;

/// Shape of the detection function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFunction {
    /// `g(x) = exp(-x² / 2σ²)`
    HalfNormal,
    /// `g(x) = 1 - exp(-(x/σ)^(-b))`, shape `b = exp(last parameter)`
    HazardRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transect {
    Line,
    Point,
}

/// Covariate on the scale parameter
///
/// Factor levels are stored as numeric codes in the data columns; the first
/// level is the baseline.
#[derive(Debug, Clone, PartialEq)]
pub enum Covariate {
    Continuous(String),
    Factor { name: String, levels: Vec<f64> },
}

impl Covariate {
    pub fn name(&self) -> &str {
        match self {
            Covariate::Continuous(name) => name,
            Covariate::Factor { name, .. } => name,
        }
    }

    fn n_columns(&self) -> usize {
        match self {
            Covariate::Continuous(_) => 1,
            Covariate::Factor { levels, .. } => levels.len().saturating_sub(1),
        }
    }
}

/// A fitted detection function
#[derive(Debug, Clone)]
pub struct DetectionFunction {
    key: KeyFunction,
    transect: Transect,
    width: f64,
    covariates: Vec<Covariate>,
    distances: Array1<f64>,
    /// Covariates of the detected animals
    observations: Frame,
    /// Scale design at the observations (intercept first)
    scale_design: Array2<f64>,
    par: Array1<f64>,
    log_likelihood: f64,
    converged: bool,
}

impl DetectionFunction {
    /// Fit by maximum likelihood.
    ///
    /// `observations` holds the covariate values of each detection; it may be
    /// an empty frame when `covariates` is empty.
    pub fn fit(
        key: KeyFunction,
        transect: Transect,
        width: f64,
        distances: Array1<f64>,
        observations: Frame,
        covariates: Vec<Covariate>,
    ) -> Result<Self> {
        if !(width > 0.0) || !width.is_finite() {
            return Err(DsmError::InvalidParameter(format!("truncation width must be positive, got {}", width)));
        }
        if distances.len() < 2 {
            return Err(DsmError::Validation("need at least two detections".to_string()));
        }
        if distances.iter().any(|&x| !(x >= 0.0) || x > width) {
            return Err(DsmError::Validation(format!(
                "distances must lie in [0, {}]", width
            )));
        }
        for cov in &covariates {
            if let Covariate::Factor { name, levels } = cov {
                if levels.len() < 2 {
                    return Err(DsmError::InvalidParameter(format!(
                        "factor '{}' needs at least two levels", name
                    )));
                }
            }
        }

        let scale_design = build_scale_design(&covariates, &observations, distances.len())?;

        let mut ddf = Self {
            key,
            transect,
            width,
            covariates,
            distances,
            observations,
            scale_design,
            par: Array1::zeros(0),
            log_likelihood: f64::NEG_INFINITY,
            converged: false,
        };
        ddf.par = ddf.initial_par();
        ddf.optimize()?;
        Ok(ddf)
    }

    fn initial_par(&self) -> Array1<f64> {
        let mut par = Array1::zeros(self.n_par());
        let mean = self.distances.mean().unwrap_or(self.width / 2.0).max(1e-3 * self.width);
        par[0] = match self.key {
            KeyFunction::HalfNormal => (mean * (std::f64::consts::PI / 2.0).sqrt()).ln(),
            KeyFunction::HazardRate => mean.ln(),
        };
        if self.key == KeyFunction::HazardRate {
            let last = par.len() - 1;
            par[last] = 3.0f64.ln();
        }
        par
    }

    /// Newton on the negative log-likelihood with numerical derivatives and
    /// step halving; falls back to gradient steps when the Hessian is not
    /// positive definite.
    fn optimize(&mut self) -> Result<()> {
        const MAX_ITER: usize = 100;
        const STEP: f64 = 1e-4;

        let objective = |par: &Array1<f64>| self.log_likelihood_at(par).map(|ll| -ll);
        let mut par = self.par.clone();
        let mut value = objective(&par)?;
        if !value.is_finite() {
            return Err(DsmError::OptimizationFailed(
                "detection likelihood is not finite at the starting values".to_string(),
            ));
        }

        let mut converged = false;
        for iter in 0..MAX_ITER {
            let grad = hessian::gradient(objective, &par, 1e-6)?;
            let grad_max = grad.iter().fold(0.0f64, |a, g| a.max(g.abs()));
            if grad_max < 1e-5 * (1.0 + value.abs()).sqrt() {
                converged = true;
                break;
            }

            let h = hessian::hessian(objective, &par, STEP)?;
            let direction = match cholesky(&h) {
                Ok(l) => -cholesky_solve(&l, &grad.view()),
                Err(_) => -&grad / grad_max.max(1.0),
            };

            let mut step = 1.0;
            let mut accepted = false;
            for _ in 0..40 {
                let trial = &par + &(&direction * step);
                if let Ok(v) = objective(&trial) {
                    if v.is_finite() && v <= value {
                        let change = value - v;
                        par = trial;
                        value = v;
                        accepted = true;
                        if change < 1e-10 * (1.0 + value.abs()) && step == 1.0 {
                            converged = true;
                        }
                        break;
                    }
                }
                step *= 0.5;
            }
            log::debug!("detection fit iteration {}: -ll = {:.8}, step = {:.3e}", iter + 1, value, step);
            if !accepted || converged {
                converged = converged || grad_max < 1e-3;
                break;
            }
        }

        if !converged {
            log::warn!("detection function fit did not converge (-ll = {:.6})", value);
        }
        self.par = par;
        self.log_likelihood = -value;
        self.converged = converged;
        Ok(())
    }

    pub fn key(&self) -> KeyFunction {
        self.key
    }

    pub fn transect(&self) -> Transect {
        self.transect
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn covariates(&self) -> &[Covariate] {
        &self.covariates
    }

    pub fn observations(&self) -> &Frame {
        &self.observations
    }

    pub fn par(&self) -> &Array1<f64> {
        &self.par
    }

    pub fn n_observations(&self) -> usize {
        self.distances.len()
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn n_par(&self) -> usize {
        let shape = if self.key == KeyFunction::HazardRate { 1 } else { 0 };
        1 + self.covariates.iter().map(|c| c.n_columns()).sum::<usize>() + shape
    }

    fn n_scale_par(&self) -> usize {
        match self.key {
            KeyFunction::HalfNormal => self.n_par(),
            KeyFunction::HazardRate => self.n_par() - 1,
        }
    }

    /// Scale design for arbitrary covariate rows
    pub fn scale_design(&self, data: &Frame, nrows: usize) -> Result<Array2<f64>> {
        build_scale_design(&self.covariates, data, nrows)
    }

    /// Detection probability g at distance `x` for scale σ
    fn g(&self, x: f64, sigma: f64, shape: f64) -> f64 {
        match self.key {
            KeyFunction::HalfNormal => (-x * x / (2.0 * sigma * sigma)).exp(),
            KeyFunction::HazardRate => 1.0 - (-(x / sigma).powf(-shape)).exp(),
        }
    }

    fn log_g(&self, x: f64, sigma: f64, shape: f64) -> f64 {
        match self.key {
            KeyFunction::HalfNormal => -x * x / (2.0 * sigma * sigma),
            KeyFunction::HazardRate => (-(-(x / sigma).powf(-shape)).exp()).ln_1p(),
        }
    }

    /// Average detection probability within the truncation distance
    fn average_probability(&self, sigma: f64, shape: f64) -> f64 {
        let w = self.width;
        let n = INTEGRATION_PANELS;
        let h = w / n as f64;
        let integrand = |x: f64| match self.transect {
            Transect::Line => self.g(x, sigma, shape) / w,
            Transect::Point => self.g(x, sigma, shape) * 2.0 * x / (w * w),
        };
        // composite Simpson
        let mut total = integrand(0.0) + integrand(w);
        for i in 1..n {
            let coef = if i % 2 == 1 { 4.0 } else { 2.0 };
            total += coef * integrand(i as f64 * h);
        }
        total * h / 3.0
    }

    fn shape(&self, par: &ArrayView1<f64>) -> f64 {
        match self.key {
            KeyFunction::HalfNormal => 0.0,
            KeyFunction::HazardRate => par[par.len() - 1].exp(),
        }
    }

    fn sigmas(&self, par: &ArrayView1<f64>, design: &Array2<f64>) -> Array1<f64> {
        let beta = par.slice(ndarray::s![..self.n_scale_par()]);
        design.dot(&beta).mapv(f64::exp)
    }

    fn check_par(&self, par: &ArrayView1<f64>) -> Result<()> {
        if par.len() != self.n_par() {
            return Err(DsmError::DimensionMismatch(format!(
                "detection function has {} parameters, got {}", self.n_par(), par.len()
            )));
        }
        Ok(())
    }

    /// Log-likelihood `Σ log g(x_i) - log p(z_i)` at an arbitrary parameter
    /// vector (constants dropped).
    pub fn log_likelihood_at(&self, par: &Array1<f64>) -> Result<f64> {
        let par = par.view();
        self.check_par(&par)?;
        let shape = self.shape(&par);
        let sigmas = self.sigmas(&par, &self.scale_design);
        let mut ll = 0.0;
        for (&x, &sigma) in self.distances.iter().zip(sigmas.iter()) {
            let p = self.average_probability(sigma, shape);
            ll += self.log_g(x, sigma, shape) - p.ln();
        }
        Ok(ll)
    }

    /// Detection probability for each row of a scale design
    pub fn probabilities(&self, par: &Array1<f64>, design: &Array2<f64>) -> Result<Array1<f64>> {
        let par = par.view();
        self.check_par(&par)?;
        if design.ncols() != self.n_scale_par() {
            return Err(DsmError::DimensionMismatch(format!(
                "scale design has {} columns, expected {}", design.ncols(), self.n_scale_par()
            )));
        }
        let shape = self.shape(&par);
        Ok(self.sigmas(&par, design).mapv(|sigma| self.average_probability(sigma, shape)))
    }

    /// Detection probability at the fitted parameters for covariate rows
    pub fn probability(&self, data: &Frame, nrows: usize) -> Result<Array1<f64>> {
        let design = self.scale_design(data, nrows)?;
        self.probabilities(&self.par, &design)
    }

    /// Hessian of the negative log-likelihood at the estimate
    pub fn hessian(&self, step: f64) -> Result<Array2<f64>> {
        hessian::hessian(|par| self.log_likelihood_at(par).map(|ll| -ll), &self.par, step)
    }
}

fn build_scale_design(covariates: &[Covariate], data: &Frame, nrows: usize) -> Result<Array2<f64>> {
    let ncols = 1 + covariates.iter().map(|c| c.n_columns()).sum::<usize>();
    let mut design = Array2::zeros((nrows, ncols));
    design.column_mut(0).fill(1.0);
    let mut col = 1;
    for cov in covariates {
        let values = data.column(cov.name())?;
        if values.len() != nrows {
            return Err(DsmError::DimensionMismatch(format!(
                "covariate '{}' has {} rows, expected {}", cov.name(), values.len(), nrows
            )));
        }
        match cov {
            Covariate::Continuous(_) => {
                design.column_mut(col).assign(&values);
                col += 1;
            }
            Covariate::Factor { name, levels } => {
                for (i, &v) in values.iter().enumerate() {
                    let level = levels.iter().position(|&l| l == v).ok_or_else(|| {
                        DsmError::Validation(format!("unknown level {} of factor '{}'", v, name))
                    })?;
                    if level > 0 {
                        design[[i, col + level - 1]] = 1.0;
                    }
                }
                col += levels.len() - 1;
            }
        }
    }
    Ok(design)
}

/// The detection model used to build a spatial model's offset
#[derive(Debug, Clone)]
pub enum DetectionModel {
    /// Known detection probability with no estimated parameters
    Placeholder { probability: f64 },
    Single(DetectionFunction),
    /// One detection function per stratum; segments select theirs through
    /// [`Segments::stratum`]
    Stratified(Vec<DetectionFunction>),
}

impl DetectionModel {
    pub fn functions(&self) -> Vec<&DetectionFunction> {
        match self {
            DetectionModel::Placeholder { .. } => Vec::new(),
            DetectionModel::Single(ddf) => vec![ddf],
            DetectionModel::Stratified(ddfs) => ddfs.iter().collect(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, DetectionModel::Placeholder { .. })
    }

    /// Total number of detection parameters over all strata
    pub fn n_par(&self) -> usize {
        self.functions().iter().map(|d| d.n_par()).sum()
    }

    /// Concatenated parameter vector in stratum order
    pub fn par(&self) -> Array1<f64> {
        let mut out = Vec::with_capacity(self.n_par());
        for ddf in self.functions() {
            out.extend(ddf.par().iter().cloned());
        }
        Array1::from_vec(out)
    }

    /// Start of each stratum's block in the concatenated parameter vector
    pub fn par_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::new();
        let mut start = 0;
        for ddf in self.functions() {
            offsets.push(start);
            start += ddf.n_par();
        }
        offsets
    }

    /// Validate the model against the segments it will be applied to
    pub fn check_segments(&self, segments: &Segments) -> Result<()> {
        match self {
            DetectionModel::Placeholder { probability } => {
                if !(*probability > 0.0 && *probability <= 1.0) {
                    return Err(DsmError::InvalidParameter(format!(
                        "detection probability must lie in (0, 1], got {}", probability
                    )));
                }
            }
            DetectionModel::Single(ddf) => {
                ddf.scale_design(&segments.data, segments.len())?;
            }
            DetectionModel::Stratified(ddfs) => {
                let strata = segments.stratum.as_ref().ok_or_else(|| {
                    DsmError::Validation("stratified detection model needs segment strata".to_string())
                })?;
                if let Some(&bad) = strata.iter().find(|&&s| s >= ddfs.len()) {
                    return Err(DsmError::Validation(format!(
                        "segment stratum {} but only {} detection functions", bad, ddfs.len()
                    )));
                }
                for ddf in ddfs {
                    ddf.scale_design(&segments.data, segments.len())?;
                }
            }
        }
        Ok(())
    }

    /// `log p_j` for every segment at the fitted parameters
    pub fn log_probability(&self, segments: &Segments) -> Result<Array1<f64>> {
        self.log_probability_at(segments, &self.par())
    }

    /// `log p_j` for every segment at an arbitrary concatenated parameter
    /// vector. Detection covariates are read from the segment data.
    pub fn log_probability_at(&self, segments: &Segments, par: &Array1<f64>) -> Result<Array1<f64>> {
        let n = segments.len();
        match self {
            DetectionModel::Placeholder { probability } => Ok(Array1::from_elem(n, probability.ln())),
            DetectionModel::Single(ddf) => {
                let design = ddf.scale_design(&segments.data, n)?;
                Ok(ddf.probabilities(par, &design)?.mapv(f64::ln))
            }
            DetectionModel::Stratified(ddfs) => {
                self.check_segments(segments)?;
                let strata = segments.stratum.as_deref().unwrap_or(&[]);
                let offsets = self.par_offsets();
                let mut out = Array1::zeros(n);
                for (s, ddf) in ddfs.iter().enumerate() {
                    let block = par.slice(ndarray::s![offsets[s]..offsets[s] + ddf.n_par()]).to_owned();
                    let design = ddf.scale_design(&segments.data, n)?;
                    let p = ddf.probabilities(&block, &design)?;
                    for (i, &stratum) in strata.iter().enumerate() {
                        if stratum == s {
                            out[i] = p[i].ln();
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    /// Derivative of the offset with respect to the detection parameters:
    /// `∂ log p_j / ∂θ`, one row per segment.
    pub fn offset_jacobian(&self, segments: &Segments, step: f64) -> Result<Array2<f64>> {
        if self.is_placeholder() {
            return Err(DsmError::UnsupportedModel(
                "fixed detection probability has no parameters to differentiate".to_string(),
            ));
        }
        hessian::jacobian(|par| self.log_probability_at(segments, par), &self.par(), step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn halfnormal_distances(sigma: f64, w: f64, n: usize) -> Array1<f64> {
        // quantiles of the half-normal truncated at w
        let mut out = Vec::with_capacity(n);
        let grid: Vec<f64> = (0..=4000).map(|i| w * i as f64 / 4000.0).collect();
        let cdf: Vec<f64> = {
            let mut acc = 0.0;
            let mut v = vec![0.0];
            for pair in grid.windows(2) {
                let mid = 0.5 * (pair[0] + pair[1]);
                acc += (-mid * mid / (2.0 * sigma * sigma)).exp();
                v.push(acc);
            }
            v.iter().map(|c| c / acc).collect()
        };
        for i in 0..n {
            let u = (i as f64 + 0.5) / n as f64;
            let idx = cdf.iter().position(|&c| c >= u).unwrap_or(grid.len() - 1);
            out.push(grid[idx]);
        }
        Array1::from_vec(out)
    }

    #[test]
    fn test_halfnormal_recovers_scale() {
        let d = halfnormal_distances(0.4, 1.0, 400);
        let ddf = DetectionFunction::fit(KeyFunction::HalfNormal, Transect::Line, 1.0, d, Frame::new(), vec![])
            .unwrap();
        assert!(ddf.converged());
        assert_eq!(ddf.n_par(), 1);
        assert_abs_diff_eq!(ddf.par()[0].exp(), 0.4, epsilon = 0.02);
    }

    #[test]
    fn test_average_probability_halfnormal_line() {
        let d = halfnormal_distances(0.5, 1.0, 50);
        let ddf = DetectionFunction::fit(KeyFunction::HalfNormal, Transect::Line, 1.0, d, Frame::new(), vec![])
            .unwrap();
        // ∫₀¹ exp(-x²/2σ²) dx with σ = 0.5 is σ√(π/2) erf(1/(σ√2))
        let p = ddf.average_probability(0.5, 0.0);
        assert_abs_diff_eq!(p, 0.5 * (std::f64::consts::PI / 2.0).sqrt() * 0.954_499_736, epsilon = 1e-7);
    }

    #[test]
    fn test_hazard_rate_has_two_parameters_and_pd_hessian() {
        let d = halfnormal_distances(0.5, 1.0, 200);
        let ddf = DetectionFunction::fit(KeyFunction::HazardRate, Transect::Line, 1.0, d, Frame::new(), vec![])
            .unwrap();
        assert_eq!(ddf.n_par(), 2);
        let h = ddf.hessian(1e-4).unwrap();
        assert_eq!(h.dim(), (2, 2));
        assert!(h[[0, 0]] > 0.0 && h[[1, 1]] > 0.0);
        assert!(h[[0, 0]] * h[[1, 1]] - h[[0, 1]] * h[[1, 0]] > 0.0);
    }

    #[test]
    fn test_factor_scale_design() {
        let obs = Frame::new()
            .with_column("observer", Array1::from_vec(vec![1.0, 2.0, 3.0, 1.0]))
            .unwrap();
        let covs = vec![Covariate::Factor { name: "observer".to_string(), levels: vec![1.0, 2.0, 3.0] }];
        let design = build_scale_design(&covs, &obs, 4).unwrap();
        assert_eq!(design.dim(), (4, 3));
        assert_eq!(design.row(1).to_vec(), vec![1.0, 1.0, 0.0]);
        assert_eq!(design.row(3).to_vec(), vec![1.0, 0.0, 0.0]);

        let bad = Frame::new()
            .with_column("observer", Array1::from_vec(vec![7.0]))
            .unwrap();
        assert!(build_scale_design(&covs, &bad, 1).is_err());
    }

    #[test]
    fn test_offset_jacobian_constant_without_covariates() {
        let d = halfnormal_distances(0.3, 1.0, 100);
        let ddf = DetectionFunction::fit(KeyFunction::HalfNormal, Transect::Point, 1.0, d, Frame::new(), vec![])
            .unwrap();
        let model = DetectionModel::Single(ddf);
        let data = Frame::new().with_column("x", Array1::linspace(0.0, 1.0, 5)).unwrap();
        let segments = Segments::new(data, Array1::ones(5), Array1::zeros(5)).unwrap();

        let jac = model.offset_jacobian(&segments, 1e-5).unwrap();
        assert_eq!(jac.dim(), (5, 1));
        for i in 1..5 {
            assert_abs_diff_eq!(jac[[i, 0]], jac[[0, 0]], epsilon = 1e-10);
        }
        // p increases with σ
        assert!(jac[[0, 0]] > 0.0);
    }
}
