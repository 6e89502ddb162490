//! dsm_rust: density surface models for distance-sampling surveys
//!
//! This library fits spatial Generalized Additive Models to segment-level
//! counts, using a fitted detection function to build the model offset, and
//! propagates the detection-function uncertainty into the variance of
//! predicted abundance (the "variance propagation" method of Bravington,
//! Miller & Hedley, 2021).
//!
//! The pipeline is:
//!
//! 1. fit a [`DetectionFunction`] to observed distances,
//! 2. fit a [`SpatialModel`] to segment counts with [`DetectionModel`] offsets,
//! 3. call [`dsm_varprop`] with one or more [`PredictionGrid`]s.
//!
//! ```rust,no_run
//! use dsm_rust::prelude::*;
//! # fn run(segments: Segments, grid: PredictionGrid, ddf: DetectionFunction) -> dsm_rust::Result<()> {
//! let mut spec = SpatialModel::new(Family::Quasipoisson);
//! spec.add_smooth(SmoothTerm::tensor("x", "y", 5, 5)?);
//! let model = spec.fit(segments, DetectionModel::Single(ddf), &FitOptions::default())?;
//!
//! let result = dsm_varprop(&model, Some(&[grid]), &VarPropConfig::default())?;
//! println!("{}", result.summary()?);
//! # Ok(())
//! # }
//! ```

pub mod linalg;
pub mod family;
pub mod data;
pub mod basis;
pub mod penalty;
pub mod pirls;
pub mod reml;
pub mod gam;
pub mod detection;
pub mod hessian;
pub mod refit;
pub mod variance;
pub mod diagnostics;
pub mod varprop;

pub use data::{Frame, PredictionGrid, Segments};
pub use detection::{Covariate, DetectionFunction, DetectionModel, KeyFunction, Transect};
pub use family::{Family, Link};
pub use gam::{FitOptions, FittedSpatialModel, ModelKind, ResponseKind, SmoothingSelection, SpatialModel};
pub use basis::SmoothTerm;
pub use refit::AugmentedModel;
pub use variance::GridEstimate;
pub use diagnostics::{CheckRow, DetectionCheck};
pub use varprop::{dsm_var_prop, dsm_varprop, VarPropConfig, VarPropResult, VarPropSummary, VarianceType};

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DsmError {
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Matrix dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Optimization failed: {0}")]
    OptimizationFailed(String),

    #[error("Singular matrix encountered")]
    SingularMatrix,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Linear algebra error: {0}")]
    LinAlgError(String),
}

pub type Result<T> = std::result::Result<T, DsmError>;

/// Non-fatal problems attached to fitted objects and results.
///
/// Point estimates remain usable when one of these is present, but variance
/// estimates should be treated as unreliable.
#[derive(Debug, Clone, PartialEq)]
pub enum DsmWarning {
    /// An iterative fit stopped before meeting its tolerance.
    Convergence(String),
    /// A numerical derivative or decomposition produced suspect values.
    Numerical(String),
}

impl fmt::Display for DsmWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DsmWarning::Convergence(msg) => write!(f, "convergence warning: {}", msg),
            DsmWarning::Numerical(msg) => write!(f, "numerical warning: {}", msg),
        }
    }
}

pub mod prelude {
    pub use crate::{DsmError, DsmWarning, Result};
    pub use crate::data::{Frame, PredictionGrid, Segments};
    pub use crate::detection::{Covariate, DetectionFunction, DetectionModel, KeyFunction, Transect};
    pub use crate::family::{Family, Link};
    pub use crate::gam::{FitOptions, FittedSpatialModel, ModelKind, ResponseKind, SmoothingSelection, SpatialModel};
    pub use crate::basis::SmoothTerm;
    pub use crate::variance::gam_variance;
    pub use crate::varprop::{dsm_var_prop, dsm_varprop, VarPropConfig, VarPropResult, VarianceType};
}
