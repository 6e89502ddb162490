//! Finite-difference derivatives and the detection-function Hessian
//!
//! Steps are relative to parameter magnitude: `h_i = step * max(|x_i|, 1)`.
//! Second derivatives are central differences of central-difference
//! gradients, symmetrized afterwards.

use ndarray::{s, Array1, Array2};
use crate::detection::DetectionModel;
use crate::linalg::{symmetric_eigen, symmetrize};
use crate::{DsmError, DsmWarning, Result};

#[inline]
fn step_size(x: f64, step: f64) -> f64 {
    step * x.abs().max(1.0)
}

/// Central-difference gradient of a scalar function
pub fn gradient<F>(f: F, x: &Array1<f64>, step: f64) -> Result<Array1<f64>>
where
    F: Fn(&Array1<f64>) -> Result<f64>,
{
    let n = x.len();
    let mut grad = Array1::zeros(n);
    let mut probe = x.clone();
    for i in 0..n {
        let h = step_size(x[i], step);
        probe[i] = x[i] + h;
        let f_plus = f(&probe)?;
        probe[i] = x[i] - h;
        let f_minus = f(&probe)?;
        probe[i] = x[i];
        grad[i] = (f_plus - f_minus) / (2.0 * h);
    }
    Ok(grad)
}

/// Hessian of a scalar function from differences of numerical gradients
pub fn hessian<F>(f: F, x: &Array1<f64>, step: f64) -> Result<Array2<f64>>
where
    F: Fn(&Array1<f64>) -> Result<f64>,
{
    let n = x.len();
    let mut h_mat = Array2::zeros((n, n));
    let mut probe = x.clone();
    for i in 0..n {
        let h = step_size(x[i], step);
        probe[i] = x[i] + h;
        let g_plus = gradient(&f, &probe, step)?;
        probe[i] = x[i] - h;
        let g_minus = gradient(&f, &probe, step)?;
        probe[i] = x[i];
        let column = (g_plus - g_minus) / (2.0 * h);
        h_mat.column_mut(i).assign(&column);
    }
    Ok(symmetrize(&h_mat))
}

/// Jacobian (m × n) of a vector-valued function
pub fn jacobian<F>(f: F, x: &Array1<f64>, step: f64) -> Result<Array2<f64>>
where
    F: Fn(&Array1<f64>) -> Result<Array1<f64>>,
{
    let n = x.len();
    let mut probe = x.clone();
    let mut columns = Vec::with_capacity(n);
    for i in 0..n {
        let h = step_size(x[i], step);
        probe[i] = x[i] + h;
        let f_plus = f(&probe)?;
        probe[i] = x[i] - h;
        let f_minus = f(&probe)?;
        probe[i] = x[i];
        columns.push((f_plus - f_minus) / (2.0 * h));
    }

    let m = columns.first().map(|c| c.len()).unwrap_or(0);
    let mut jac = Array2::zeros((m, n));
    for (i, column) in columns.iter().enumerate() {
        if column.len() != m {
            return Err(DsmError::DimensionMismatch(format!(
                "jacobian column {} has length {}, expected {}", i, column.len(), m
            )));
        }
        jac.column_mut(i).assign(column);
    }
    Ok(jac)
}

/// Hessian of the detection negative log-likelihood at the fitted parameters
#[derive(Debug, Clone)]
pub struct HessianEstimate {
    pub matrix: Array2<f64>,
    pub warnings: Vec<DsmWarning>,
}

impl HessianEstimate {
    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn is_zero(&self) -> bool {
        self.matrix.iter().all(|&v| v == 0.0)
    }
}

/// Assemble the Hessian over all detection functions of the model.
///
/// Stratum-specific detection functions are fitted to disjoint data, so the
/// stratified Hessian is block diagonal in stratum order.
pub fn detection_hessian(model: &DetectionModel, step: f64) -> Result<HessianEstimate> {
    let functions = match model {
        DetectionModel::Placeholder { .. } => {
            return Err(DsmError::UnsupportedModel(
                "variance propagation needs a fitted detection function, not a fixed detection probability"
                    .to_string(),
            ))
        }
        DetectionModel::Single(ddf) => vec![ddf],
        DetectionModel::Stratified(ddfs) => ddfs.iter().collect(),
    };

    let n_par = model.n_par();
    if n_par == 0 {
        return Err(DsmError::UnsupportedModel(
            "detection function has no estimated parameters".to_string(),
        ));
    }

    let mut matrix = Array2::<f64>::zeros((n_par, n_par));
    let mut offset = 0;
    for ddf in functions {
        let k = ddf.n_par();
        let block = ddf.hessian(step)?;
        matrix.slice_mut(s![offset..offset + k, offset..offset + k]).assign(&block);
        offset += k;
    }

    screen(matrix)
}

/// Zero non-finite rows and columns and warn about negative curvature
fn screen(mut matrix: Array2<f64>) -> Result<HessianEstimate> {
    let n_par = matrix.nrows();
    let mut warnings = Vec::new();

    let bad: Vec<usize> = (0..n_par)
        .filter(|&i| matrix.row(i).iter().any(|v| !v.is_finite()))
        .collect();
    if !bad.is_empty() {
        for &i in &bad {
            matrix.row_mut(i).fill(0.0);
            matrix.column_mut(i).fill(0.0);
        }
        let msg = format!("non-finite Hessian entries for parameters {:?}; zeroed", bad);
        log::warn!("{}", msg);
        warnings.push(DsmWarning::Numerical(msg));
    }

    let (eigenvalues, _) = symmetric_eigen(&matrix)?;
    let scale = eigenvalues.iter().fold(0.0f64, |a, &v| a.max(v.abs()));
    let negative = eigenvalues.iter().filter(|&&v| v < -1e-8 * scale.max(1e-300)).count();
    if negative > 0 {
        let msg = format!(
            "detection Hessian has {} negative eigenvalue(s); those directions are dropped",
            negative
        );
        log::warn!("{}", msg);
        warnings.push(DsmWarning::Numerical(msg));
    }

    Ok(HessianEstimate { matrix, warnings })
}
