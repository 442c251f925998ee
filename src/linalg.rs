// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Dense solvers used when finalizing merged statistics
//!
//! Merged statistics travel as `ndarray` arrays; the factorizations run on
//! `nalgebra` matrices. Every tolerance is relative to the matrix it is
//! applied to, so results do not depend on the units of the input features.

use std::cmp::Ordering;

use nalgebra::{Cholesky, DMatrix, Dyn, SymmetricEigen};
use ndarray::{Array1, Array2};

use crate::error::{Code, SpmdError, SpmdResult};

/// Smallest accepted `L[i,i]² / A[i,i]` before Cholesky gives up
const CHOLESKY_RTOL: f64 = 1e-12;
const EIGEN_MAX_ITERATIONS: usize = 10_000;

fn singular(what: &str) -> SpmdError {
    SpmdError::new(Code::ExecutionError, format!("{} is singular", what))
}

fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn to_array2(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

fn check_system(a: &Array2<f64>, b: &Array2<f64>) -> SpmdResult<()> {
    if a.ncols() != a.nrows() || b.nrows() != a.nrows() {
        return Err(SpmdError::Invalid(format!(
            "cannot solve {}x{} system with {} right-hand rows",
            a.nrows(),
            a.ncols(),
            b.nrows()
        )));
    }
    Ok(())
}

fn checked_cholesky(a: &Array2<f64>) -> Option<Cholesky<f64, Dyn>> {
    if a.nrows() != a.ncols() {
        return None;
    }
    let chol = to_dmatrix(a).cholesky()?;
    let l = chol.l_dirty();
    for i in 0..a.nrows() {
        let pivot = l[(i, i)] * l[(i, i)];
        if !pivot.is_finite() || pivot <= CHOLESKY_RTOL * a[[i, i]].abs() {
            return None;
        }
    }
    Some(chol)
}

/// Lower-triangular `L` with `a = L Lᵀ`, or `None` if `a` is not
/// numerically positive definite
pub fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    checked_cholesky(a).map(|chol| to_array2(&chol.l()))
}

/// Solve `a x = b` by LU decomposition with partial pivoting
pub fn lu_solve(a: &Array2<f64>, b: &Array2<f64>) -> SpmdResult<Array2<f64>> {
    check_system(a, b)?;
    let n = a.nrows();
    let scale = a.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 {
        return Err(singular("normal equation system"));
    }

    let lu = to_dmatrix(a).lu();
    let u = lu.u();
    let threshold = n as f64 * f64::EPSILON * scale;
    if (0..n).any(|i| u[(i, i)].abs() <= threshold) {
        return Err(singular("normal equation system"));
    }

    let x = lu
        .solve(&to_dmatrix(b))
        .ok_or_else(|| singular("normal equation system"))?;
    Ok(to_array2(&x))
}

/// Solve a symmetric system, trying Cholesky before LU
pub fn solve_symmetric(a: &Array2<f64>, b: &Array2<f64>) -> SpmdResult<Array2<f64>> {
    check_system(a, b)?;
    match checked_cholesky(a) {
        Some(chol) => Ok(to_array2(&chol.solve(&to_dmatrix(b)))),
        None => {
            log::debug!("system not positive definite, falling back to LU");
            lu_solve(a, b)
        }
    }
}

/// Eigen-decomposition of a symmetric matrix.
///
/// Eigenvalues are sorted in descending order; column `i` of the returned
/// matrix is the eigenvector for eigenvalue `i`, signed so that its largest
/// component is positive.
pub fn symmetric_eigen(a: &Array2<f64>) -> SpmdResult<(Array1<f64>, Array2<f64>)> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(SpmdError::Invalid(format!(
            "eigen-decomposition needs a square matrix, got {}x{}",
            n,
            a.ncols()
        )));
    }

    let eigen = SymmetricEigen::try_new(to_dmatrix(a), f64::EPSILON, EIGEN_MAX_ITERATIONS)
        .ok_or_else(|| {
            SpmdError::new(
                Code::ExecutionError,
                "symmetric eigen-decomposition did not converge",
            )
        })?;

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| {
        eigen.eigenvalues[j]
            .partial_cmp(&eigen.eigenvalues[i])
            .unwrap_or(Ordering::Equal)
    });

    let values = Array1::from_iter(order.iter().map(|&i| eigen.eigenvalues[i]));
    let mut vectors = Array2::<f64>::zeros((n, n));
    for (dst, &src) in order.iter().enumerate() {
        let col = eigen.eigenvectors.column(src);
        let flip = col
            .iter()
            .copied()
            .max_by(|a, b| a.abs().total_cmp(&b.abs()))
            .map(|x| x < 0.0)
            .unwrap_or(false);
        for k in 0..n {
            vectors[[k, dst]] = if flip { -col[k] } else { col[k] };
        }
    }
    Ok((values, vectors))
}
