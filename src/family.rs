//! Response distributions and link functions for count models

use ndarray::ArrayView1;
use crate::{DsmError, Result};

/// Link function g(μ) = η
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Identity,
    Log,
}

impl Link {
    pub fn link(&self, mu: f64) -> f64 {
        match self {
            Link::Identity => mu,
            Link::Log => mu.ln(),
        }
    }

    pub fn inverse_link(&self, eta: f64) -> f64 {
        match self {
            Link::Identity => eta,
            // Clamp to avoid overflow in exp
            Link::Log => eta.min(700.0).exp(),
        }
    }

    /// dμ/dη
    pub fn d_inverse_link(&self, eta: f64) -> f64 {
        match self {
            Link::Identity => 1.0,
            Link::Log => eta.min(700.0).exp(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Link::Identity => "identity",
            Link::Log => "log",
        }
    }
}

/// Distribution family for the segment-level response
///
/// Density surface models use count families with a log link; `Gaussian` is
/// kept for completeness but cannot be used for variance propagation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Family {
    Gaussian,
    Poisson,
    Quasipoisson,
    /// Negative binomial with known size parameter θ (Var = μ + μ²/θ)
    NegativeBinomial { theta: f64 },
    /// Tweedie with power parameter 1 < p < 2 (Var = φ μᵖ)
    Tweedie { power: f64 },
}

impl Family {
    pub fn link(&self) -> Link {
        match self {
            Family::Gaussian => Link::Identity,
            _ => Link::Log,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Family::Gaussian => "gaussian".to_string(),
            Family::Poisson => "poisson".to_string(),
            Family::Quasipoisson => "quasipoisson".to_string(),
            Family::NegativeBinomial { theta } => format!("negative binomial(theta = {:.4})", theta),
            Family::Tweedie { power } => format!("tweedie(p = {:.3})", power),
        }
    }

    /// Check family parameters are in range
    pub fn validate(&self) -> Result<()> {
        match *self {
            Family::NegativeBinomial { theta } if !(theta > 0.0 && theta.is_finite()) => {
                Err(DsmError::InvalidParameter(format!(
                    "negative binomial theta must be positive, got {}", theta
                )))
            }
            Family::Tweedie { power } if !(power > 1.0 && power < 2.0) => {
                Err(DsmError::InvalidParameter(format!(
                    "tweedie power must lie in (1, 2), got {}", power
                )))
            }
            _ => Ok(()),
        }
    }

    /// Whether the scale parameter φ is fixed at 1.
    ///
    /// Families with a free scale need the extra scale iterations during the
    /// augmented refit.
    pub fn scale_known(&self) -> bool {
        matches!(self, Family::Poisson | Family::NegativeBinomial { .. })
    }

    /// Variance function V(μ)
    pub fn variance(&self, mu: f64) -> f64 {
        match *self {
            Family::Gaussian => 1.0,
            Family::Poisson | Family::Quasipoisson => mu,
            Family::NegativeBinomial { theta } => mu + mu * mu / theta,
            Family::Tweedie { power } => mu.powf(power),
        }
    }

    /// Starting value of μ for the iterative fit
    pub fn initial_mu(&self, y: f64) -> f64 {
        match self {
            Family::Gaussian => y,
            _ => y.max(0.0) + 0.1,
        }
    }

    /// Unit deviance contribution of a single observation
    pub fn unit_deviance(&self, y: f64, mu: f64) -> f64 {
        let mu = match self {
            Family::Gaussian => mu,
            _ => mu.max(1e-10),
        };
        match *self {
            Family::Gaussian => (y - mu).powi(2),
            Family::Poisson | Family::Quasipoisson => {
                if y > 0.0 {
                    2.0 * (y * (y / mu).ln() - (y - mu))
                } else {
                    2.0 * mu
                }
            }
            Family::NegativeBinomial { theta } => {
                let first = if y > 0.0 { y * (y / mu).ln() } else { 0.0 };
                2.0 * (first - (y + theta) * ((y + theta) / (mu + theta)).ln())
            }
            Family::Tweedie { power: p } => {
                let first = if y > 0.0 {
                    y.powf(2.0 - p) / ((1.0 - p) * (2.0 - p))
                } else {
                    0.0
                };
                2.0 * (first - y * mu.powf(1.0 - p) / (1.0 - p) + mu.powf(2.0 - p) / (2.0 - p))
            }
        }
    }

    /// Total (prior-weighted) deviance
    pub fn deviance(&self, y: &ArrayView1<f64>, mu: &ArrayView1<f64>, prior_weights: &ArrayView1<f64>) -> f64 {
        y.iter()
            .zip(mu.iter())
            .zip(prior_weights.iter())
            .map(|((&yi, &mui), &wi)| wi * self.unit_deviance(yi, mui))
            .sum()
    }

    /// Pearson statistic Σ w (y - μ)² / V(μ)
    pub fn pearson(&self, y: &ArrayView1<f64>, mu: &ArrayView1<f64>, prior_weights: &ArrayView1<f64>) -> f64 {
        y.iter()
            .zip(mu.iter())
            .zip(prior_weights.iter())
            .map(|((&yi, &mui), &wi)| wi * (yi - mui).powi(2) / self.variance(mui).max(1e-10))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_functions() {
        let family = Family::Gaussian;
        assert!((family.variance(1.0) - 1.0).abs() < 1e-10);
        assert!((family.link().link(5.0) - 5.0).abs() < 1e-10);
        assert!((family.link().inverse_link(3.0) - 3.0).abs() < 1e-10);

        let family = Family::Poisson;
        assert!((family.variance(2.0) - 2.0).abs() < 1e-10);
        assert!((family.link().inverse_link(0.0) - 1.0).abs() < 1e-10);
        assert_eq!(family.link(), Link::Log);
    }

    #[test]
    fn test_scale_known() {
        assert!(Family::Poisson.scale_known());
        assert!(Family::NegativeBinomial { theta: 2.0 }.scale_known());
        assert!(!Family::Quasipoisson.scale_known());
        assert!(!Family::Tweedie { power: 1.3 }.scale_known());
    }

    #[test]
    fn test_deviance_zero_at_saturation() {
        let families = [
            Family::Poisson,
            Family::NegativeBinomial { theta: 1.5 },
            Family::Tweedie { power: 1.4 },
        ];
        for family in families {
            assert!(family.unit_deviance(3.0, 3.0).abs() < 1e-10, "{}", family.name());
            assert!(family.unit_deviance(3.0, 2.0) > 0.0);
            assert!(family.unit_deviance(0.0, 0.5) > 0.0);
        }
    }

    #[test]
    fn test_validate() {
        assert!(Family::Tweedie { power: 2.5 }.validate().is_err());
        assert!(Family::NegativeBinomial { theta: 0.0 }.validate().is_err());
        assert!(Family::Quasipoisson.validate().is_ok());
    }
}
