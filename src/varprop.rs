//! Variance propagation: entry points, configuration and results
//!
//! [`dsm_varprop`] runs the whole procedure for a fitted spatial model:
//!
//! 1. numerical Hessian of the detection function(s),
//! 2. one refit of the spatial model with the detection random effect,
//! 3. one stacked prediction matrix and a sandwich variance per grid,
//! 4. a check that the refit kept the detection probabilities plausible.

use std::fmt;
use std::str::FromStr;

use ndarray::Array1;
use statrs::distribution::{ContinuousCDF, Normal};
use crate::data::{Frame, PredictionGrid};
use crate::diagnostics::DetectionCheck;
use crate::gam::FittedSpatialModel;
use crate::hessian::{detection_hessian, HessianEstimate};
use crate::refit::AugmentedModel;
use crate::variance::{propagated_variance, stacked_gam_variance, stacked_lp_matrix, GridEstimate};
use crate::{DsmError, DsmWarning, Result};

/// Which coefficient covariance the sandwich uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarianceType {
    /// Conditional on the smoothing parameters
    Vp,
    /// Corrected for smoothing parameter uncertainty
    Vc,
}

impl FromStr for VarianceType {
    type Err = DsmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Vp" => Ok(VarianceType::Vp),
            "Vc" => Ok(VarianceType::Vc),
            other => Err(DsmError::InvalidParameter(format!(
                "variance type must be \"Vp\" or \"Vc\", got {:?}", other
            ))),
        }
    }
}

impl fmt::Display for VarianceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarianceType::Vp => write!(f, "Vp"),
            VarianceType::Vc => write!(f, "Vc"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VarPropConfig {
    pub var_type: VarianceType,
    /// Report refit iterations at info level instead of debug
    pub trace: bool,
    /// Relative finite-difference step for the Hessian and offset derivatives
    pub hessian_step: f64,
    /// Maximum scale iterations of the refit
    pub refit_max_iter: usize,
    /// Tolerance on the change in log scale between refit iterations
    pub refit_tolerance: f64,
}

impl Default for VarPropConfig {
    fn default() -> Self {
        Self {
            var_type: VarianceType::Vp,
            trace: false,
            hessian_step: 1e-4,
            refit_max_iter: 50,
            refit_tolerance: 1e-6,
        }
    }
}

impl VarPropConfig {
    /// Build a configuration from string key/value pairs.
    ///
    /// Keys: `var_type`, `trace`, `hessian_step`, `refit_max_iter`,
    /// `refit_tolerance`. Unknown keys are rejected.
    pub fn from_options<'a, I>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in options {
            match key {
                "var_type" => config.var_type = value.parse()?,
                "trace" => config.trace = parse_value(key, value)?,
                "hessian_step" => config.hessian_step = parse_value(key, value)?,
                "refit_max_iter" => config.refit_max_iter = parse_value(key, value)?,
                "refit_tolerance" => config.refit_tolerance = parse_value(key, value)?,
                "var.type" => {
                    return Err(DsmError::Validation(
                        "option \"var.type\" has been renamed; use \"var_type\"".to_string(),
                    ))
                }
                other => {
                    return Err(DsmError::Validation(format!("unknown option {:?}", other)));
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.hessian_step > 0.0 && self.hessian_step < 1.0) {
            return Err(DsmError::InvalidParameter(format!(
                "hessian_step must lie in (0, 1), got {}", self.hessian_step
            )));
        }
        if self.refit_max_iter == 0 {
            return Err(DsmError::InvalidParameter("refit_max_iter must be positive".to_string()));
        }
        if !(self.refit_tolerance > 0.0) {
            return Err(DsmError::InvalidParameter(format!(
                "refit_tolerance must be positive, got {}", self.refit_tolerance
            )));
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| DsmError::InvalidParameter(format!("cannot parse {:?} for option {}", value, key)))
}

/// Outcome of variance propagation
#[derive(Debug, Clone)]
pub struct VarPropResult<'a> {
    pub model: &'a FittedSpatialModel,
    pub refit: AugmentedModel,
    pub hessian: HessianEstimate,
    /// Propagated estimates, one per grid; `None` when no grid was given
    pub grids: Option<Vec<GridEstimate>>,
    /// Spatial-model-only estimates for the same grids
    pub gam_only: Option<Vec<GridEstimate>>,
    pub check: DetectionCheck,
    pub var_type: VarianceType,
    pub warnings: Vec<DsmWarning>,
}

impl<'a> VarPropResult<'a> {
    /// False when an iterative step failed to converge
    pub fn reliable(&self) -> bool {
        !self.warnings.iter().any(|w| matches!(w, DsmWarning::Convergence(_)))
    }

    /// Per-grid abundance with 95% log-normal confidence intervals and the
    /// detection check table
    pub fn summary(&self) -> Result<VarPropSummary> {
        let z = Normal::new(0.0, 1.0)
            .map_err(|e| DsmError::InvalidParameter(e.to_string()))?
            .inverse_cdf(0.975);

        let lines = self
            .grids
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .enumerate()
            .map(|(i, est)| {
                let gam_se = self
                    .gam_only
                    .as_ref()
                    .and_then(|g| g.get(i))
                    .map(|g| g.se)
                    .unwrap_or(f64::NAN);
                let (lower, upper) = lognormal_interval(est.total, est.cv, z);
                SummaryLine {
                    grid: i,
                    total: est.total,
                    se: est.se,
                    cv: est.cv,
                    lower,
                    upper,
                    gam_se,
                }
            })
            .collect();

        Ok(VarPropSummary {
            var_type: self.var_type,
            lines,
            check: self.check.clone(),
            reliable: self.reliable(),
            warnings: self.warnings.clone(),
        })
    }
}

/// `N / C` to `N · C` with `C = exp(z √log(1 + cv²))`
fn lognormal_interval(total: f64, cv: f64, z: f64) -> (f64, f64) {
    if !cv.is_finite() {
        return (f64::NAN, f64::NAN);
    }
    let c = (z * (1.0 + cv * cv).ln().sqrt()).exp();
    (total / c, total * c)
}

#[derive(Debug, Clone)]
pub struct SummaryLine {
    pub grid: usize,
    pub total: f64,
    pub se: f64,
    pub cv: f64,
    pub lower: f64,
    pub upper: f64,
    /// SE without detection uncertainty
    pub gam_se: f64,
}

#[derive(Debug, Clone)]
pub struct VarPropSummary {
    pub var_type: VarianceType,
    pub lines: Vec<SummaryLine>,
    pub check: DetectionCheck,
    pub reliable: bool,
    pub warnings: Vec<DsmWarning>,
}

impl fmt::Display for VarPropSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Summary of uncertainty in a density surface model")?;
        writeln!(f, "Variance propagated from the detection function ({})", self.var_type)?;
        writeln!(f)?;
        writeln!(f, "Detection probability check:")?;
        write!(f, "{}", self.check)?;
        writeln!(f)?;
        if self.lines.is_empty() {
            writeln!(f, "No prediction grid supplied.")?;
        } else {
            writeln!(
                f,
                "{:>4} {:>12} {:>12} {:>8} {:>12} {:>12} {:>12}",
                "grid", "abundance", "se", "cv", "2.5%", "97.5%", "gam se"
            )?;
            for line in &self.lines {
                writeln!(
                    f,
                    "{:>4} {:>12.3} {:>12.3} {:>8.4} {:>12.3} {:>12.3} {:>12.3}",
                    line.grid, line.total, line.se, line.cv, line.lower, line.upper, line.gam_se
                )?;
            }
        }
        for warning in &self.warnings {
            writeln!(f, "{}", warning)?;
        }
        if !self.reliable {
            writeln!(f, "Results are unreliable: an iterative fit did not converge.")?;
        }
        Ok(())
    }
}

/// Propagate detection-function uncertainty into the abundance variance of
/// each grid.
///
/// All grids share one refit. Passing `None` performs the refit and the
/// detection check only.
pub fn dsm_varprop<'a>(
    model: &'a FittedSpatialModel,
    newdata: Option<&[PredictionGrid]>,
    config: &VarPropConfig,
) -> Result<VarPropResult<'a>> {
    config.validate()?;
    AugmentedModel::check_refit(model)?;

    // grids missing a model covariate fail here, before any refitting
    let stacked = newdata.map(|grids| stacked_lp_matrix(model, grids)).transpose()?;

    log::info!("computing detection function Hessian");
    let hessian = detection_hessian(model.detection(), config.hessian_step)?;

    log::info!("refitting spatial model with detection random effect");
    let refit = AugmentedModel::refit(model, &hessian, config)?;

    let mut warnings: Vec<DsmWarning> = model.warnings().to_vec();
    warnings.extend(hessian.warnings.iter().cloned());
    warnings.extend(refit.warnings().iter().cloned());

    let (grids, gam_only) = match (newdata, stacked.as_ref()) {
        (Some(grids), Some(stacked)) => {
            log::info!("computing variance for {} prediction grid(s)", grids.len());
            let propagated = propagated_variance(model, &refit, stacked, grids, config.var_type)?;
            let plain = stacked_gam_variance(model, stacked, grids, config.var_type)?;
            warnings.extend(
                propagated
                    .iter()
                    .enumerate()
                    .filter_map(|(i, est)| est.numerical_warning(i)),
            );
            (Some(propagated), Some(plain))
        }
        _ => (None, None),
    };
    let mut unique: Vec<DsmWarning> = Vec::with_capacity(warnings.len());
    for w in warnings {
        if !unique.contains(&w) {
            unique.push(w);
        }
    }
    let warnings = unique;

    let covariance = refit.loading().dot(&refit.loading().t());
    let check = DetectionCheck::compute(model.detection(), &covariance, refit.delta(), config.hessian_step)?;

    Ok(VarPropResult {
        model,
        refit,
        hessian,
        grids,
        gam_only,
        check,
        var_type: config.var_type,
        warnings,
    })
}

/// Variant taking prediction data and offsets as parallel lists
pub fn dsm_var_prop<'a>(
    model: &'a FittedSpatialModel,
    pred_data: &[Frame],
    pred_offsets: &[Array1<f64>],
    config: &VarPropConfig,
) -> Result<VarPropResult<'a>> {
    if pred_data.len() != pred_offsets.len() {
        return Err(DsmError::Validation(format!(
            "{} prediction data sets but {} offsets", pred_data.len(), pred_offsets.len()
        )));
    }
    AugmentedModel::check_refit(model)?;
    let grids = pred_data
        .iter()
        .zip(pred_offsets.iter())
        .map(|(data, offset)| PredictionGrid::new(data.clone(), offset.clone()))
        .collect::<Result<Vec<_>>>()?;
    dsm_varprop(model, Some(&grids), config)
}
