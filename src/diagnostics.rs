//! Check that the refit did not move the detection function too far
//!
//! The random effect implies a shifted parameter vector θ̂ + δ̂. For each
//! detection function and covariate, the average detection probability is
//! compared under θ̂ and θ̂ + δ̂ at factor levels or at the 5%, 50% and 95%
//! quantiles of continuous covariates. The delta-method standard error of
//! the original probability gives the yardstick.

use std::fmt;

use ndarray::{s, Array1, Array2};
use crate::data::Frame;
use crate::detection::{Covariate, DetectionFunction, DetectionModel};
use crate::hessian;
use crate::{DsmError, Result};

const QUANTILES: [f64; 3] = [0.05, 0.5, 0.95];

/// One line of the detection check
#[derive(Debug, Clone, PartialEq)]
pub struct CheckRow {
    pub stratum: usize,
    /// Covariate name, or `None` for a detection function without covariates
    pub covariate: Option<String>,
    /// Factor level or quantile value the probability is evaluated at
    pub value: Option<f64>,
    pub original: f64,
    pub refit: f64,
    pub se: f64,
}

impl CheckRow {
    /// |refit - original| in units of the original SE
    pub fn discrepancy(&self) -> f64 {
        let diff = (self.refit - self.original).abs();
        if self.se > 0.0 {
            diff / self.se
        } else if diff > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DetectionCheck {
    pub rows: Vec<CheckRow>,
}

impl DetectionCheck {
    /// Build the check table.
    ///
    /// `covariance` is the detection parameter covariance `V_θ` and `delta`
    /// the refit shift, both over the concatenated parameter vector.
    pub fn compute(
        detection: &DetectionModel,
        covariance: &Array2<f64>,
        delta: &Array1<f64>,
        step: f64,
    ) -> Result<Self> {
        let n_par = detection.n_par();
        if covariance.nrows() != n_par || delta.len() != n_par {
            return Err(DsmError::DimensionMismatch(format!(
                "{} detection parameters, covariance {}x{}, shift of length {}",
                n_par, covariance.nrows(), covariance.ncols(), delta.len()
            )));
        }

        let mut rows = Vec::new();
        let offsets = detection.par_offsets();
        for (stratum, ddf) in detection.functions().into_iter().enumerate() {
            let range = offsets[stratum]..offsets[stratum] + ddf.n_par();
            let v = covariance.slice(s![range.clone(), range.clone()]).to_owned();
            let shifted = ddf.par() + &delta.slice(s![range]);

            for (covariate, value, frame) in evaluation_points(ddf)? {
                let n = ddf.n_observations();
                let design = ddf.scale_design(&frame, n)?;
                let mean_p = |par: &Array1<f64>| -> Result<f64> {
                    Ok(ddf.probabilities(par, &design)?.mean().unwrap_or(f64::NAN))
                };
                let original = mean_p(ddf.par())?;
                let refit = mean_p(&shifted)?;
                let grad = hessian::gradient(mean_p, ddf.par(), step)?;
                let se = grad.dot(&v.dot(&grad)).max(0.0).sqrt();
                rows.push(CheckRow { stratum, covariate, value, original, refit, se });
            }
        }

        let check = Self { rows };
        for row in check.flagged() {
            log::warn!(
                "detection probability moved by {:.1} SE in the refit (stratum {}, {}): {:.4} -> {:.4}",
                row.discrepancy(),
                row.stratum,
                describe(row),
                row.original,
                row.refit
            );
        }
        Ok(check)
    }

    /// Rows whose discrepancy exceeds two standard errors
    pub fn flagged(&self) -> impl Iterator<Item = &CheckRow> {
        self.rows.iter().filter(|r| r.discrepancy() > 2.0)
    }

    pub fn max_discrepancy(&self) -> f64 {
        self.rows.iter().map(|r| r.discrepancy()).fold(0.0, f64::max)
    }
}

/// Covariate settings to evaluate: the observations with one covariate
/// overwritten, or the observations as they are when there are no covariates.
fn evaluation_points(ddf: &DetectionFunction) -> Result<Vec<(Option<String>, Option<f64>, Frame)>> {
    let observations = ddf.observations();
    if ddf.covariates().is_empty() {
        return Ok(vec![(None, None, observations.clone())]);
    }

    let n = ddf.n_observations();
    let mut points = Vec::new();
    for cov in ddf.covariates() {
        let values: Vec<f64> = match cov {
            Covariate::Factor { levels, .. } => levels.clone(),
            Covariate::Continuous(name) => {
                let observed = observations.column(name)?.to_vec();
                QUANTILES.iter().map(|&q| quantile(&observed, q)).collect()
            }
        };
        for value in values {
            let mut frame = observations.clone();
            frame.insert(cov.name(), Array1::from_elem(n, value))?;
            points.push((Some(cov.name().to_string()), Some(value), frame));
        }
    }
    Ok(points)
}

/// Sample quantile with linear interpolation between order statistics
fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
}

fn describe(row: &CheckRow) -> String {
    match (&row.covariate, row.value) {
        (Some(name), Some(value)) => format!("{} = {:.4}", name, value),
        _ => "all".to_string(),
    }
}

impl fmt::Display for DetectionCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>7}  {:<24} {:>10} {:>10} {:>10}",
            "stratum", "covariate", "original", "refit", "se"
        )?;
        for row in &self.rows {
            let flag = if row.discrepancy() > 2.0 { " *" } else { "" };
            writeln!(
                f,
                "{:>7}  {:<24} {:>10.4} {:>10.4} {:>10.4}{}",
                row.stratum,
                describe(row),
                row.original,
                row.refit,
                row.se,
                flag
            )?;
        }
        if !self.rows.is_empty() {
            writeln!(f, "largest shift: {:.2} SE", self.max_discrepancy())?;
        }
        Ok(())
    }
}
