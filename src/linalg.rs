//! Dense linear algebra used by the fitting and propagation code
//!
//! Everything here works on small to moderate matrices (model coefficients,
//! detection parameters), so plain `ndarray` loops are adequate. With the
//! `blas` feature the symmetric eigensolver is delegated to LAPACK.

use ndarray::{s, Array1, Array2, ArrayView1};
use crate::{DsmError, Result};

#[cfg(feature = "blas")]
use ndarray_linalg::{Eigh, UPLO};

/// Relative threshold below which eigenvalues are treated as zero.
pub const EIGEN_TOL: f64 = 1e-10;

/// Solve linear system Ax = b using Gaussian elimination with partial pivoting
pub fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Result<Array1<f64>> {
    let n = a.nrows();

    if a.ncols() != n || b.len() != n {
        return Err(DsmError::DimensionMismatch(
            "Matrix must be square and match RHS".to_string()
        ));
    }

    for k in 0..n {
        let mut max_idx = k;
        let mut max_val = a[[k, k]].abs();
        for i in (k + 1)..n {
            let val = a[[i, k]].abs();
            if val > max_val {
                max_val = val;
                max_idx = i;
            }
        }

        if max_val < 1e-14 {
            return Err(DsmError::SingularMatrix);
        }

        if max_idx != k {
            for j in 0..n {
                a.swap([k, j], [max_idx, j]);
            }
            b.swap(k, max_idx);
        }

        for i in (k + 1)..n {
            let factor = a[[i, k]] / a[[k, k]];
            for j in (k + 1)..n {
                a[[i, j]] -= factor * a[[k, j]];
            }
            b[i] -= factor * b[k];
        }
    }

    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        let mut sum = 0.0;
        for j in (i + 1)..n {
            sum += a[[i, j]] * x[j];
        }
        x[i] = (b[i] - sum) / a[[i, i]];
    }

    Ok(x)
}

/// Cholesky factor `L` (lower triangular) with `A = L Lᵀ`.
///
/// Fails with [`DsmError::SingularMatrix`] when `A` is not numerically
/// positive definite.
pub fn cholesky(a: &Array2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(DsmError::DimensionMismatch(
            format!("Cholesky needs a square matrix, got {}x{}", n, a.ncols())
        ));
    }

    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if !(sum > 0.0) {
                    return Err(DsmError::SingularMatrix);
                }
                l[[i, i]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Ok(l)
}

/// Solve `L Lᵀ x = b` given the Cholesky factor `L`.
pub fn cholesky_solve(l: &Array2<f64>, b: &ArrayView1<f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[[i, k]] * y[k];
        }
        y[i] = sum / l[[i, i]];
    }

    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = y[i];
        for k in (i + 1)..n {
            sum -= l[[k, i]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// Inverse of a symmetric positive definite matrix via its Cholesky factor.
pub fn spd_inverse(a: &Array2<f64>) -> Result<Array2<f64>> {
    let l = cholesky(a)?;
    let n = a.nrows();
    let mut inv = Array2::<f64>::zeros((n, n));
    let mut e = Array1::<f64>::zeros(n);
    for j in 0..n {
        e.fill(0.0);
        e[j] = 1.0;
        let col = cholesky_solve(&l, &e.view());
        inv.column_mut(j).assign(&col);
    }
    // Clean up asymmetry from round-off.
    Ok(symmetrize(&inv))
}

/// log|A| for symmetric positive definite `A`.
pub fn log_det_spd(a: &Array2<f64>) -> Result<f64> {
    let l = cholesky(a)?;
    Ok(2.0 * l.diag().iter().map(|d| d.ln()).sum::<f64>())
}

/// `(A + Aᵀ) / 2`
pub fn symmetrize(a: &Array2<f64>) -> Array2<f64> {
    (a + &a.t()) * 0.5
}

/// Eigen-decomposition of a symmetric matrix.
///
/// Returns eigenvalues in ascending order and the matching eigenvectors as
/// columns.
#[cfg(not(feature = "blas"))]
pub fn symmetric_eigen(a: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(DsmError::DimensionMismatch(
            format!("Eigen-decomposition needs a square matrix, got {}x{}", n, a.ncols())
        ));
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(DsmError::LinAlgError("non-finite entry in symmetric matrix".to_string()));
    }

    // Cyclic Jacobi rotations
    let mut m = symmetrize(a);
    let mut v = Array2::<f64>::eye(n);
    let scale = m.iter().map(|x| x * x).sum::<f64>().sqrt().max(f64::MIN_POSITIVE);
    let max_sweeps = 100;
    let mut converged = n < 2;

    for _ in 0..max_sweeps {
        let mut off = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off += m[[p, q]] * m[[p, q]];
            }
        }
        if off.sqrt() <= 1e-13 * scale {
            converged = true;
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = m[[p, q]];
                if apq.abs() <= f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (m[[q, q]] - m[[p, p]]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let mkp = m[[k, p]];
                    let mkq = m[[k, q]];
                    m[[k, p]] = c * mkp - s * mkq;
                    m[[k, q]] = s * mkp + c * mkq;
                }
                for k in 0..n {
                    let mpk = m[[p, k]];
                    let mqk = m[[q, k]];
                    m[[p, k]] = c * mpk - s * mqk;
                    m[[q, k]] = s * mpk + c * mqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    if !converged {
        return Err(DsmError::LinAlgError(
            format!("Jacobi eigensolver did not converge in {} sweeps", max_sweeps)
        ));
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| m[[i, i]].total_cmp(&m[[j, j]]));

    let values = Array1::from_iter(order.iter().map(|&i| m[[i, i]]));
    let mut vectors = Array2::<f64>::zeros((n, n));
    for (dst, &src) in order.iter().enumerate() {
        vectors.column_mut(dst).assign(&v.column(src));
    }
    Ok((values, vectors))
}

#[cfg(feature = "blas")]
pub fn symmetric_eigen(a: &Array2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    symmetrize(a)
        .eigh(UPLO::Lower)
        .map_err(|e| DsmError::LinAlgError(format!("eigh failed: {:?}", e)))
}

/// Factor `L` with `L Lᵀ = A⁺` for symmetric `A`.
///
/// Eigen-directions with eigenvalue at or below `EIGEN_TOL * max|λ|` carry
/// no information and are dropped, so `L` has one column per retained
/// direction. The second value counts dropped directions whose eigenvalue was
/// clearly negative (as opposed to merely zero).
pub fn pseudo_inverse_factor(a: &Array2<f64>) -> Result<(Array2<f64>, usize)> {
    let n = a.nrows();
    let (values, vectors) = symmetric_eigen(a)?;
    let max_abs = values.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    let tol = EIGEN_TOL * max_abs;

    let keep: Vec<usize> = (0..n).filter(|&k| max_abs > 0.0 && values[k] > tol).collect();
    let negative = (0..n).filter(|&k| values[k] < -tol).count();

    let mut factor = Array2::<f64>::zeros((n, keep.len()));
    for (col, &k) in keep.iter().enumerate() {
        let scale = 1.0 / values[k].sqrt();
        for i in 0..n {
            factor[[i, col]] = vectors[[i, k]] * scale;
        }
    }
    Ok((factor, negative))
}

/// Moore-Penrose pseudo-inverse of a symmetric positive semi-definite matrix.
pub fn pseudo_inverse(a: &Array2<f64>) -> Result<Array2<f64>> {
    let (factor, _) = pseudo_inverse_factor(a)?;
    Ok(factor.dot(&factor.t()))
}

/// Numerical rank of a symmetric positive semi-definite matrix.
pub fn psd_rank(a: &Array2<f64>) -> Result<usize> {
    let (values, _) = symmetric_eigen(a)?;
    let max_abs = values.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    Ok(values.iter().filter(|&&v| max_abs > 0.0 && v > 1e-8 * max_abs).count())
}

/// Orthonormal basis for the null space of a single linear constraint `cᵀβ = 0`.
///
/// Uses a Householder reflection `H = I - 2vvᵀ/vᵀv` mapping `c` onto the
/// first axis; the remaining `k - 1` columns of `H` span the constraint's
/// null space. Absorbing the constraint turns a basis `X` into `X Z` and a
/// penalty `S` into `Zᵀ S Z`.
pub fn constraint_null_space(c: &ArrayView1<f64>) -> Result<Array2<f64>> {
    let k = c.len();
    let norm = c.dot(c).sqrt();
    if k < 2 || norm < 1e-12 {
        return Err(DsmError::InvalidParameter(
            "constraint vector must be non-zero with at least two entries".to_string()
        ));
    }

    let mut v = c.to_owned();
    v[0] += c[0].signum() * norm;
    let vtv = v.dot(&v);

    let mut h = Array2::<f64>::eye(k);
    for i in 0..k {
        for j in 0..k {
            h[[i, j]] -= 2.0 * v[i] * v[j] / vtv;
        }
    }
    Ok(h.slice(s![.., 1..]).to_owned())
}

/// Row-wise Kronecker product: row `i` of the result is `a[i,:] ⊗ b[i,:]`.
pub fn row_kronecker(a: &Array2<f64>, b: &Array2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    if b.nrows() != n {
        return Err(DsmError::DimensionMismatch(
            format!("row Kronecker of {} and {} rows", n, b.nrows())
        ));
    }
    let (ka, kb) = (a.ncols(), b.ncols());
    let mut out = Array2::<f64>::zeros((n, ka * kb));
    for i in 0..n {
        for p in 0..ka {
            let ap = a[[i, p]];
            if ap == 0.0 {
                continue;
            }
            for q in 0..kb {
                out[[i, p * kb + q]] = ap * b[[i, q]];
            }
        }
    }
    Ok(out)
}

/// Kronecker product of two dense matrices.
pub fn kronecker(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    let (ar, ac) = a.dim();
    let (br, bc) = b.dim();
    let mut out = Array2::<f64>::zeros((ar * br, ac * bc));
    for i in 0..ar {
        for j in 0..ac {
            let aij = a[[i, j]];
            if aij == 0.0 {
                continue;
            }
            out.slice_mut(s![i * br..(i + 1) * br, j * bc..(j + 1) * bc])
                .assign(&(b * aij));
        }
    }
    out
}

/// `Xᵀ diag(w) X`
pub fn compute_xtwx(x: &Array2<f64>, w: &Array1<f64>) -> Array2<f64> {
    let mut xw = x.clone();
    for (mut row, &wi) in xw.rows_mut().into_iter().zip(w.iter()) {
        row *= wi;
    }
    x.t().dot(&xw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn spd3() -> Array2<f64> {
        Array2::from_shape_vec((3, 3), vec![
            4.0, 1.0, 0.5,
            1.0, 3.0, 0.2,
            0.5, 0.2, 2.0,
        ]).unwrap()
    }

    #[test]
    fn test_solve() {
        let a = Array2::from_shape_vec((3, 3), vec![
            2.0, 1.0, 1.0,
            1.0, 3.0, 2.0,
            1.0, 2.0, 2.0,
        ]).unwrap();
        let b = Array1::from_vec(vec![4.0, 6.0, 5.0]);

        let x = solve(a.clone(), b.clone()).unwrap();
        let ax = a.dot(&x);
        for i in 0..3 {
            assert_abs_diff_eq!(ax[i], b[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_spd_inverse_and_log_det() {
        let a = spd3();
        let inv = spd_inverse(&a).unwrap();
        let product = a.dot(&inv);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(product[[i, j]], expected, epsilon = 1e-10);
            }
        }

        // det = 4(6 - 0.04) - 1(2 - 0.1) + 0.5(0.2 - 1.5)
        let det: f64 = 4.0 * (6.0 - 0.04) - (2.0 - 0.1) + 0.5 * (0.2 - 1.5);
        assert_abs_diff_eq!(log_det_spd(&a).unwrap(), det.ln(), epsilon = 1e-10);
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let a = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 2.0, 1.0]).unwrap();
        assert!(matches!(cholesky(&a), Err(DsmError::SingularMatrix)));
    }

    #[test]
    fn test_symmetric_eigen_reconstructs() {
        let a = spd3();
        let (values, vectors) = symmetric_eigen(&a).unwrap();
        assert!(values[0] <= values[1] && values[1] <= values[2]);

        let rebuilt = vectors.dot(&Array2::from_diag(&values)).dot(&vectors.t());
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(rebuilt[[i, j]], a[[i, j]], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_pseudo_inverse_of_singular() {
        // rank one: [1 1; 1 1] has pseudo-inverse [1 1; 1 1] / 4
        let a = Array2::from_elem((2, 2), 1.0);
        let (factor, negative) = pseudo_inverse_factor(&a).unwrap();
        assert_eq!(factor.ncols(), 1);
        assert_eq!(negative, 0);

        let pinv = pseudo_inverse(&a).unwrap();
        for v in pinv.iter() {
            assert_abs_diff_eq!(*v, 0.25, epsilon = 1e-10);
        }

        let zero = Array2::<f64>::zeros((3, 3));
        let (factor, _) = pseudo_inverse_factor(&zero).unwrap();
        assert_eq!(factor.ncols(), 0);
    }

    #[test]
    fn test_constraint_null_space() {
        let c = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let z = constraint_null_space(&c.view()).unwrap();
        assert_eq!(z.dim(), (4, 3));

        let cz = c.dot(&z);
        for v in cz.iter() {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-12);
        }
        let ztz = z.t().dot(&z);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(ztz[[i, j]], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_row_kronecker() {
        let a = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Array2::from_shape_vec((2, 3), vec![1.0, 0.0, 1.0, 2.0, 1.0, 0.0]).unwrap();
        let k = row_kronecker(&a, &b).unwrap();
        assert_eq!(k.dim(), (2, 6));
        assert_eq!(k.row(0).to_vec(), vec![1.0, 0.0, 1.0, 2.0, 0.0, 2.0]);
        assert_eq!(k.row(1).to_vec(), vec![6.0, 3.0, 0.0, 8.0, 4.0, 0.0]);
    }
}
