//! Refit of the spatial model with a detection random effect
//!
//! The offset `log(area · p(θ))` is linearised around θ̂:
//! `log p_j(θ̂ + δ) ≈ log p_j(θ̂) + X_δ[j, :] δ`. With `V_θ = H⁺ = L Lᵀ` and
//! `δ = L u`, `u ~ N(0, I)`, the shift enters the model as extra columns
//! `X_u = X_δ L` with an identity penalty. Refitting estimates the smooth
//! coefficients and û jointly, so the coefficient covariance carries the
//! detection uncertainty.

use ndarray::{concatenate, Array1, Array2, Axis};
use crate::family::Link;
use crate::gam::{covariances, estimate_scale, FittedSpatialModel, ModelKind, ResponseKind};
use crate::hessian::HessianEstimate;
use crate::linalg::pseudo_inverse_factor;
use crate::penalty::PenaltyBlock;
use crate::pirls::{fit_pirls, PirlsData};
use crate::varprop::{VarPropConfig, VarianceType};
use crate::{DsmError, DsmWarning, Result};

const MAX_PIRLS_ITER: usize = 200;
const PIRLS_TOLERANCE: f64 = 1e-10;

/// Spatial model refitted with the detection random effect
#[derive(Debug, Clone)]
pub struct AugmentedModel {
    coefficients: Array1<f64>,
    vp: Array2<f64>,
    vc: Array2<f64>,
    scale: f64,
    fitted_values: Array1<f64>,
    /// Columns of the original model
    n_original: usize,
    /// `L`, with `L Lᵀ = V_θ`
    loading: Array2<f64>,
    /// δ̂ = L û
    delta: Array1<f64>,
    scale_iterations: usize,
    converged: bool,
    warnings: Vec<DsmWarning>,
}

impl AugmentedModel {
    /// Check that `model` can be refitted. Performs no numerical work.
    pub fn check_refit(model: &FittedSpatialModel) -> Result<()> {
        if model.response() != ResponseKind::Count {
            return Err(DsmError::Validation(format!(
                "variance propagation needs raw counts as the response, model has {:?}",
                model.response()
            )));
        }
        if model.kind() != ModelKind::Gam {
            return Err(DsmError::UnsupportedModel(
                "mixed-model (gamm) fits cannot be refitted; refit the spatial model as a GAM".to_string(),
            ));
        }
        if model.detection().is_placeholder() || model.detection().n_par() == 0 {
            return Err(DsmError::UnsupportedModel(
                "the model offset was built without a fitted detection function".to_string(),
            ));
        }
        if model.family().link() != Link::Log {
            return Err(DsmError::UnsupportedModel(format!(
                "variance propagation requires a log link, model uses {}",
                model.family().link().name()
            )));
        }
        Ok(())
    }

    /// Refit `model` with the random effect implied by `hessian`
    pub fn refit(model: &FittedSpatialModel, hessian: &HessianEstimate, config: &VarPropConfig) -> Result<Self> {
        Self::check_refit(model)?;
        let n_par = model.detection().n_par();
        if hessian.dim() != n_par {
            return Err(DsmError::DimensionMismatch(format!(
                "Hessian is {}x{} but the detection model has {} parameters",
                hessian.dim(), hessian.dim(), n_par
            )));
        }

        let mut warnings = hessian.warnings.clone();

        let (loading, _) = pseudo_inverse_factor(&hessian.matrix)?;
        let r = loading.ncols();
        if r < n_par {
            log::debug!("detection covariance has rank {} of {}", r, n_par);
        }

        let segments = model.segments();
        let x = model.model_matrix();
        let p = x.ncols();
        let x_aug = if r > 0 {
            let x_delta = model.detection().offset_jacobian(segments, config.hessian_step)?;
            let x_u = x_delta.dot(&loading);
            concatenate(Axis(1), &[x.view(), x_u.view()])
                .map_err(|e| DsmError::DimensionMismatch(e.to_string()))?
        } else {
            x.clone()
        };
        let total = p + r;

        let mut penalties: Vec<PenaltyBlock> = model
            .penalties()
            .iter()
            .map(|s| s.widen(total))
            .collect::<Result<_>>()?;
        let m = penalties.len();
        if r > 0 {
            penalties.push(PenaltyBlock::new(Array2::eye(r), p, total)?);
        }

        let family = model.family();
        let mut lambda: Vec<f64> = model.lambda().to_vec();
        let mut scale = if family.scale_known() { 1.0 } else { model.scale() };
        if r > 0 {
            lambda.push(scale);
        }

        let data = PirlsData {
            y: &segments.response,
            x: &x_aug,
            offset: model.offset(),
            prior_weights: model.prior_weights(),
        };

        let mut iterations = 0;
        let mut scale_converged = family.scale_known();
        let fit = loop {
            iterations += 1;
            let fit = fit_pirls(data, &lambda, &penalties, family, MAX_PIRLS_ITER, PIRLS_TOLERANCE)?;
            if family.scale_known() {
                break fit;
            }

            let edf = fit.edf(&x_aug)?;
            let new_scale = estimate_scale(family, &segments.response, &fit, model.prior_weights(), edf);
            let change = (new_scale.ln() - scale.ln()).abs();
            if config.trace {
                log::info!("refit iteration {}: scale {:.6} -> {:.6}", iterations, scale, new_scale);
            } else {
                log::debug!("refit iteration {}: scale {:.6} -> {:.6}", iterations, scale, new_scale);
            }
            scale = new_scale;
            if r > 0 {
                lambda[m] = scale;
            }

            if change < config.refit_tolerance || r == 0 {
                scale_converged = true;
                break fit;
            }
            if iterations >= config.refit_max_iter {
                break fit;
            }
        };

        if !fit.converged {
            let msg = format!("augmented PiRLS fit did not converge in {} iterations", fit.iterations);
            log::warn!("{}", msg);
            warnings.push(DsmWarning::Convergence(msg));
        }
        if !scale_converged {
            let msg = format!("scale iteration did not converge in {} iterations", iterations);
            log::warn!("{}", msg);
            warnings.push(DsmWarning::Convergence(msg));
        }

        let (vp, vc) = covariances(&fit, &penalties, &lambda, model.rho_covariance(), scale)?;
        let u_hat = fit.coefficients.slice(ndarray::s![p..]).to_owned();
        let delta = if r > 0 { loading.dot(&u_hat) } else { Array1::zeros(n_par) };

        if config.trace {
            log::info!("refit done: scale {:.6}, delta = {:?}", scale, delta.to_vec());
        }

        Ok(Self {
            coefficients: fit.coefficients,
            vp,
            vc,
            scale,
            fitted_values: fit.fitted_values,
            n_original: p,
            loading,
            delta,
            scale_iterations: iterations,
            converged: fit.converged && scale_converged,
            warnings,
        })
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

    pub fn covariance(&self, var_type: VarianceType) -> &Array2<f64> {
        match var_type {
            VarianceType::Vp => &self.vp,
            VarianceType::Vc => &self.vc,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn fitted_values(&self) -> &Array1<f64> {
        &self.fitted_values
    }

    pub fn n_original(&self) -> usize {
        self.n_original
    }

    /// Number of random-effect columns
    pub fn n_random(&self) -> usize {
        self.loading.ncols()
    }

    pub fn loading(&self) -> &Array2<f64> {
        &self.loading
    }

    /// Estimated shift of the detection parameters
    pub fn delta(&self) -> &Array1<f64> {
        &self.delta
    }

    pub fn scale_iterations(&self) -> usize {
        self.scale_iterations
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn warnings(&self) -> &[DsmWarning] {
        &self.warnings
    }
}
