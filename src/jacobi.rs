//! One-sided (Hestenes) Jacobi SVD.
//!
//! The routine only accepts tall or square input (`nrows >= ncols`); wide
//! matrices are the caller's job to transpose.
//!
//! References
//! * J. Demmel and K. Veselic, "Jacobi's Method is More Accurate than QR", 1989.
//! * LAPACK Working Note 15.

use ndarray::{Array1, Array2, Axis, Zip};
use thiserror::Error;

const TOL_CNV1_SQ: f64 = f64::EPSILON * f64::EPSILON * 4.0;
const TOL_CNV2_SQ: f64 = f64::EPSILON * f64::EPSILON;
const TOL_DIV0: f64 = f64::MIN_POSITIVE;
// Fraction of a column that must survive re-orthogonalisation to count as its own direction.
const NULL_DIRECTION_TOL: f64 = 1e-6;

/// Result of [`one_sided_jacobi`]: `a = u · diag(s) · vᵀ` with `s` descending.
#[derive(Debug)]
pub struct JacobiOutput {
    /// Shape `(nrows, ncols)`, orthonormal columns. Columns of zero singular values
    /// complete the basis.
    pub u: Array2<f64>,
    pub s: Array1<f64>,
    /// Shape `(ncols, ncols)`, orthogonal.
    pub v: Array2<f64>,
    pub sweeps: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum JacobiError {
    /// Input has more columns than rows.
    #[error("one-sided Jacobi requires nrows >= ncols, got {nrows}x{ncols}")]
    Wide { nrows: usize, ncols: usize },
    /// Off-diagonal mass did not vanish within the sweep budget.
    #[error("one-sided Jacobi did not converge in {sweeps} sweeps")]
    NotConverged { sweeps: usize },
}

/// Applies one plane rotation to columns `c1`, `c2` of `u` (and `v`).
/// Returns `true` when the pair was already orthogonal.
fn apply_jacobi_rot(u: &mut Array2<f64>, v: &mut Array2<f64>, c1: usize, c2: usize) -> bool {
    let (a, b, d) = {
        let col1 = u.column(c1);
        let col2 = u.column(c2);
        (col1.dot(&col1), col2.dot(&col2), col1.dot(&col2))
    };

    if d * d <= TOL_CNV1_SQ * a * b || d * d <= TOL_CNV2_SQ {
        return true;
    }

    let zeta = (b - a) / (2.0 * d);
    let t = if zeta > 0.0 {
        1.0 / (zeta + (1.0 + zeta * zeta).sqrt())
    } else {
        -1.0 / (-zeta + (1.0 + zeta * zeta).sqrt())
    };
    let c = 1.0 / (1.0 + t * t).sqrt();
    let s = c * t;

    rotate_columns(u, c1, c2, c, s);
    rotate_columns(v, c1, c2, c, s);
    false
}

fn rotate_columns(m: &mut Array2<f64>, c1: usize, c2: usize, c: f64, s: f64) {
    let (mut left, mut right) = m.multi_slice_mut((ndarray::s![.., c1], ndarray::s![.., c2]));
    Zip::from(&mut left).and(&mut right).for_each(|x, y| {
        let xi = *x;
        let yi = *y;
        *x = c * xi - s * yi;
        *y = s * xi + c * yi;
    });
}

/// Decomposes a tall or square matrix, sweeping until every column pair is
/// orthogonal or `max_sweeps` is exhausted.
pub fn one_sided_jacobi(a: Array2<f64>, max_sweeps: usize) -> Result<JacobiOutput, JacobiError> {
    let (nrows, ncols) = a.dim();
    if nrows < ncols {
        return Err(JacobiError::Wide { nrows, ncols });
    }

    let mut u = a;
    let mut v = Array2::<f64>::eye(ncols);

    let mut sweeps = 0;
    let mut converged_all = ncols < 2;
    while !converged_all {
        if sweeps == max_sweeps {
            return Err(JacobiError::NotConverged { sweeps });
        }
        sweeps += 1;
        converged_all = true;
        for i in 0..ncols - 1 {
            for j in i + 1..ncols {
                if !apply_jacobi_rot(&mut u, &mut v, i, j) {
                    converged_all = false;
                }
            }
        }
    }

    // Column norms are the singular values.
    let s: Array1<f64> = u.axis_iter(Axis(1)).map(|col| col.dot(&col).sqrt()).collect();
    let mut order: Vec<usize> = (0..ncols).collect();
    order.sort_by(|&x, &y| s[y].partial_cmp(&s[x]).unwrap_or(std::cmp::Ordering::Equal));

    let mut u = u.select(Axis(1), &order);
    orthonormalize_columns(&mut u);

    Ok(JacobiOutput {
        u,
        s: s.select(Axis(0), &order),
        v: v.select(Axis(1), &order),
        sweeps,
    })
}

/// Normalises the columns of `u` in order, re-orthogonalising each against its
/// predecessors. A column left with no direction of its own (a zero or
/// numerically null singular value) is replaced by a unit vector from the
/// orthogonal complement, so `u` always has orthonormal columns.
fn orthonormalize_columns(u: &mut Array2<f64>) {
    for i in 0..u.ncols() {
        let mut col = u.column(i).to_owned();
        let original = col.dot(&col).sqrt();
        project_out_leading(u, i, &mut col);
        let residual = col.dot(&col).sqrt();
        let col = if original < TOL_DIV0 || residual <= NULL_DIRECTION_TOL * original {
            complement_vector(u, i)
        } else {
            col / residual
        };
        u.column_mut(i).assign(&col);
    }
}

/// Removes from `col` its components along the first `done` columns of `u`
/// (classical Gram-Schmidt, applied twice).
fn project_out_leading(u: &Array2<f64>, done: usize, col: &mut Array1<f64>) {
    for _ in 0..2 {
        for j in 0..done {
            let q = u.column(j);
            let coefficient = q.dot(&*col);
            col.scaled_add(-coefficient, &q);
        }
    }
}

/// Unit vector orthogonal to the first `done` columns of `u`: the canonical
/// basis vector with the largest component outside their span, orthogonalised.
fn complement_vector(u: &Array2<f64>, done: usize) -> Array1<f64> {
    let nrows = u.nrows();
    let mut best = Array1::<f64>::zeros(nrows);
    let mut best_norm = 0.0;
    for k in 0..nrows {
        let mut candidate = Array1::<f64>::zeros(nrows);
        candidate[k] = 1.0;
        project_out_leading(u, done, &mut candidate);
        let norm = candidate.dot(&candidate).sqrt();
        if norm > best_norm {
            best_norm = norm;
            best = candidate;
        }
    }
    // done < nrows, so some basis vector keeps a norm of at least sqrt(1 / nrows).
    best / best_norm
}
