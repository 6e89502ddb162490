//! PiRLS (Penalized Iteratively Reweighted Least Squares) for fixed smoothing parameters

use ndarray::{Array1, Array2};
use crate::family::{Family, Link};
use crate::linalg::{cholesky, cholesky_solve, compute_xtwx, solve};
use crate::penalty::{total_penalty, PenaltyBlock};
use crate::{DsmError, Result};

/// Response, model matrix, offset and prior weights of one fit
#[derive(Debug, Clone, Copy)]
pub struct PirlsData<'a> {
    pub y: &'a Array1<f64>,
    pub x: &'a Array2<f64>,
    pub offset: &'a Array1<f64>,
    pub prior_weights: &'a Array1<f64>,
}

impl<'a> PirlsData<'a> {
    pub fn check(&self) -> Result<()> {
        let n = self.y.len();
        if self.x.nrows() != n || self.offset.len() != n || self.prior_weights.len() != n {
            return Err(DsmError::DimensionMismatch(format!(
                "y has {} rows, X {}, offset {}, weights {}",
                n, self.x.nrows(), self.offset.len(), self.prior_weights.len()
            )));
        }
        Ok(())
    }
}

/// PiRLS fitting result
#[derive(Debug, Clone)]
pub struct PirlsResult {
    pub coefficients: Array1<f64>,
    pub fitted_values: Array1<f64>,
    /// η = Xβ + offset
    pub linear_predictor: Array1<f64>,
    /// Working weights at convergence
    pub weights: Array1<f64>,
    pub deviance: f64,
    /// β̂ᵀ S_λ β̂
    pub penalty: f64,
    /// XᵀWX + S_λ
    pub penalized_hessian: Array2<f64>,
    pub iterations: usize,
    pub converged: bool,
}

impl PirlsResult {
    pub fn penalized_deviance(&self) -> f64 {
        self.deviance + self.penalty
    }

    /// Effective degrees of freedom tr((XᵀWX + S)⁻¹ XᵀWX)
    pub fn edf(&self, x: &Array2<f64>) -> Result<f64> {
        let xtwx = compute_xtwx(x, &self.weights);
        let l = cholesky(&self.penalized_hessian)?;
        let mut trace = 0.0;
        for j in 0..xtwx.ncols() {
            let col = cholesky_solve(&l, &xtwx.column(j));
            trace += col[j];
        }
        Ok(trace)
    }
}

/// Solve the penalized normal equations, preferring Cholesky
fn penalized_solve(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
    match cholesky(a) {
        Ok(l) => Ok(cholesky_solve(&l, &b.view())),
        Err(_) => solve(a.clone(), b.clone()),
    }
}

/// Working weights for the IRLS step
fn working_weights(eta: &Array1<f64>, prior_weights: &Array1<f64>, family: Family) -> Array1<f64> {
    let link = family.link();
    eta.iter()
        .zip(prior_weights.iter())
        .map(|(&e, &pw)| {
            let mu = link.inverse_link(e);
            let dmu_deta = link.d_inverse_link(e);
            (pw * dmu_deta * dmu_deta / family.variance(mu).max(1e-10)).max(1e-10)
        })
        .collect()
}

/// Fit a GAM with fixed smoothing parameters
///
/// # Arguments
/// * `data` - response, model matrix, offset, prior weights
/// * `lambda` - Smoothing parameters (one per penalty)
/// * `penalties` - Penalty blocks
/// * `family` - Distribution family
/// * `max_iter` - Maximum number of iterations
/// * `tolerance` - Relative coefficient-change tolerance
pub fn fit_pirls(
    data: PirlsData<'_>,
    lambda: &[f64],
    penalties: &[PenaltyBlock],
    family: Family,
    max_iter: usize,
    tolerance: f64,
) -> Result<PirlsResult> {
    data.check()?;
    if lambda.len() != penalties.len() {
        return Err(DsmError::DimensionMismatch(
            "Number of lambdas must match number of penalty matrices".to_string(),
        ));
    }

    let n = data.y.len();
    let p = data.x.ncols();
    let link = family.link();
    let penalty_total = total_penalty(penalties, lambda, p);

    // Identity link: one weighted least squares step is exact
    if link == Link::Identity {
        let w = data.prior_weights.clone();
        let z = data.y - data.offset;
        let a = compute_xtwx(data.x, &w) + &penalty_total;
        let beta = penalized_solve(&a, &data.x.t().dot(&(&w * &z)))?;
        return Ok(finish(data, beta, &penalty_total, family, 1, true));
    }

    let mut eta: Array1<f64> = data.y.iter().map(|&yi| link.link(family.initial_mu(yi))).collect();
    let mut beta = Array1::<f64>::zeros(p);
    let mut pdev_old = f64::INFINITY;
    let mut converged = false;
    let mut iter = 0;

    for iteration in 0..max_iter {
        iter = iteration + 1;

        let mu: Array1<f64> = eta.iter().map(|&e| link.inverse_link(e)).collect();
        let w = working_weights(&eta, data.prior_weights, family);
        let mut z = Array1::zeros(n);
        for i in 0..n {
            let dmu_deta = link.d_inverse_link(eta[i]);
            let eta_free = eta[i] - data.offset[i];
            z[i] = if dmu_deta.abs() < 1e-10 {
                eta_free
            } else {
                eta_free + (data.y[i] - mu[i]) / dmu_deta
            };
        }

        let a = compute_xtwx(data.x, &w) + &penalty_total;
        let wz = &w * &z;
        let mut beta_new = penalized_solve(&a, &data.x.t().dot(&wz))?;

        // Step halving when the penalized deviance increases
        let mut pdev_new = f64::INFINITY;
        for halving in 0..30 {
            let eta_try = data.x.dot(&beta_new) + data.offset;
            let mu_try = eta_try.mapv(|e| link.inverse_link(e));
            let dev = family.deviance(&data.y.view(), &mu_try.view(), &data.prior_weights.view());
            pdev_new = dev + beta_new.dot(&penalty_total.dot(&beta_new));
            if pdev_new.is_finite() && pdev_new <= pdev_old * (1.0 + 1e-12) + 1e-12 {
                break;
            }
            if !pdev_old.is_finite() && pdev_new.is_finite() {
                break;
            }
            log::debug!("PiRLS iteration {}: step halving {} (pdev {:.6e})", iter, halving + 1, pdev_new);
            beta_new = (&beta_new + &beta) * 0.5;
        }

        if !pdev_new.is_finite() {
            return Err(DsmError::OptimizationFailed(format!(
                "non-finite penalized deviance at PiRLS iteration {}", iter
            )));
        }

        let max_change = beta_new
            .iter()
            .zip(beta.iter())
            .map(|(b, b_old)| (b - b_old).abs() / (1.0 + b.abs()))
            .fold(0.0f64, f64::max);

        log::debug!("PiRLS iteration {}: pdev = {:.8e}, max rel change = {:.3e}", iter, pdev_new, max_change);

        beta = beta_new;
        eta = data.x.dot(&beta) + data.offset;
        pdev_old = pdev_new;

        if iteration > 0 && max_change < tolerance {
            converged = true;
            break;
        }
    }

    Ok(finish(data, beta, &penalty_total, family, iter, converged))
}

fn finish(
    data: PirlsData<'_>,
    beta: Array1<f64>,
    penalty_total: &Array2<f64>,
    family: Family,
    iterations: usize,
    converged: bool,
) -> PirlsResult {
    let link = family.link();
    let eta = data.x.dot(&beta) + data.offset;
    let fitted_values: Array1<f64> = eta.iter().map(|&e| link.inverse_link(e)).collect();
    let deviance = family.deviance(&data.y.view(), &fitted_values.view(), &data.prior_weights.view());
    let weights = working_weights(&eta, data.prior_weights, family);
    let penalized_hessian = compute_xtwx(data.x, &weights) + penalty_total;
    let penalty = beta.dot(&penalty_total.dot(&beta));

    PirlsResult {
        coefficients: beta,
        fitted_values,
        linear_predictor: eta,
        weights,
        deviance,
        penalty,
        penalized_hessian,
        iterations,
        converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pirls_gaussian() {
        let n = 20;
        let p = 5;

        let x = Array2::from_shape_fn((n, p), |(i, j)| ((i as f64) * 0.1).powi(j as i32));
        let y: Array1<f64> = (0..n)
            .map(|i| {
                let xi = i as f64 * 0.1;
                xi + xi.powi(2) + 0.1 * (i as f64).sin()
            })
            .collect();
        let offset = Array1::zeros(n);
        let weights = Array1::ones(n);

        let penalties = vec![PenaltyBlock::new(Array2::eye(p), 0, p).unwrap()];
        let data = PirlsData { y: &y, x: &x, offset: &offset, prior_weights: &weights };

        let result = fit_pirls(data, &[0.01], &penalties, Family::Gaussian, 100, 1e-8).unwrap();
        assert!(result.converged);
        assert_eq!(result.coefficients.len(), p);
    }

    #[test]
    fn test_pirls_poisson_matches_glm_with_offset() {
        // Intercept-only Poisson with offset: exp(β0) = Σy / Σexp(offset)
        let n = 30;
        let x = Array2::ones((n, 1));
        let y = Array1::from_iter((0..n).map(|i| (i % 4) as f64));
        let area = Array1::from_iter((0..n).map(|i| 1.0 + 0.1 * i as f64));
        let offset = area.mapv(f64::ln);
        let weights = Array1::ones(n);
        let data = PirlsData { y: &y, x: &x, offset: &offset, prior_weights: &weights };

        let result = fit_pirls(data, &[], &[], Family::Poisson, 100, 1e-10).unwrap();
        assert!(result.converged);
        let expected = (y.sum() / area.sum()).ln();
        assert!((result.coefficients[0] - expected).abs() < 1e-8);
        assert!((result.fitted_values.sum() - y.sum()).abs() < 1e-6);
    }
}
