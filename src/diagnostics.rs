// src/diagnostics.rs

//! Numerical sanity metrics for decomposition results.
//!
//! All helpers use the crate's public orientation: a matrix is
//! `(n_columns, n_rows)`, and singular vectors are stored one per first-axis index.

use crate::svd::SvdOutput;
use ndarray::{Array2, ArrayView1, ArrayView2};

/// Frobenius norm.
pub fn frob_norm(matrix: &ArrayView2<f64>) -> f64 {
    if matrix.is_empty() {
        return 0.0;
    }
    matrix.iter().map(|&x| x * x).sum::<f64>().sqrt()
}

/// Orthonormality error `||I - Q·Qᵀ||_F` for a matrix whose first-axis vectors
/// should be orthonormal (e.g. `u`, `v` or a rotation).
pub fn row_orthogonality_error(q_matrix: &ArrayView2<f64>) -> Option<f64> {
    if q_matrix.nrows() == 0 || q_matrix.ncols() == 0 {
        return None;
    }
    let qqt = q_matrix.dot(&q_matrix.t());
    let identity = Array2::<f64>::eye(qqt.nrows());
    let diff = identity - qqt;
    Some(frob_norm(&diff.view()))
}

/// Rebuilds `M[[c, r]] = Σ_k s[k]·u[[k, r]]·v[[k, c]]` from the first `rank` components.
pub fn reconstruct(
    u: &ArrayView2<f64>,
    s: &ArrayView1<f64>,
    v: &ArrayView2<f64>,
    rank: usize,
) -> Array2<f64> {
    let rank = rank.min(s.len()).min(u.nrows()).min(v.nrows());
    let mut out = Array2::<f64>::zeros((v.ncols(), u.ncols()));
    for k in 0..rank {
        let vk = v.row(k);
        let uk = u.row(k);
        for (c, &vc) in vk.iter().enumerate() {
            let weight = s[k] * vc;
            let mut row = out.row_mut(c);
            row.scaled_add(weight, &uk);
        }
    }
    out
}

/// Relative reconstruction error `||M - rebuild||_F / ||M||_F`.
/// `None` when the output lacks either side's vectors or dimensions do not line up.
pub fn svd_reconstruction_error(original: &ArrayView2<f64>, output: &SvdOutput) -> Option<f64> {
    if original.is_empty() {
        return None;
    }
    let u = output.u()?;
    let v = output.v()?;
    if u.ncols() != original.ncols() || v.ncols() != original.nrows() {
        return None;
    }
    let rebuilt = reconstruct(&u.view(), &output.singular_values().view(), &v.view(), output.rank());
    let diff = original - &rebuilt;

    let norm_diff = frob_norm(&diff.view());
    let norm_original = frob_norm(original);
    if norm_original < 1e-12 {
        if norm_diff < 1e-12 {
            Some(0.0)
        } else {
            Some(f64::INFINITY)
        }
    } else {
        Some(norm_diff / norm_original)
    }
}

/// Problems found by [`check_svd_output`].
#[derive(Debug, Clone, PartialEq)]
pub enum SvdSanityIssue {
    NonFiniteSingularValue(usize),
    NegativeSingularValue(usize),
    NotDescending(usize),
    NonFiniteVector { side: &'static str },
    UnexpectedRank { expected: usize, got: usize },
}

/// Downstream validation for callers that need a clean result: expected rank,
/// no NaN or infinity, non-negative descending singular values.
pub fn check_svd_output(output: &SvdOutput, expected_rank: Option<usize>) -> Vec<SvdSanityIssue> {
    let mut issues = Vec::new();
    let s = output.singular_values();
    if let Some(expected) = expected_rank {
        if output.rank() != expected {
            issues.push(SvdSanityIssue::UnexpectedRank { expected, got: output.rank() });
        }
    }
    for (i, &value) in s.iter().enumerate() {
        if !value.is_finite() {
            issues.push(SvdSanityIssue::NonFiniteSingularValue(i));
        } else if value < 0.0 {
            issues.push(SvdSanityIssue::NegativeSingularValue(i));
        }
        if i > 0 && s[i - 1].is_finite() && value.is_finite() && value > s[i - 1] {
            issues.push(SvdSanityIssue::NotDescending(i));
        }
    }
    if output.u().map_or(false, |u| u.iter().any(|x| !x.is_finite())) {
        issues.push(SvdSanityIssue::NonFiniteVector { side: "u" });
    }
    if output.v().map_or(false, |v| v.iter().any(|x| !x.is_finite())) {
        issues.push(SvdSanityIssue::NonFiniteVector { side: "v" });
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    #[test]
    fn identity_rows_are_orthonormal() {
        let q = Array2::<f64>::eye(3);
        assert_eq!(row_orthogonality_error(&q.view()), Some(0.0));
    }

    #[test]
    fn reconstruct_rank_one() {
        let u = array![[1.0, 0.0, 0.0]];
        let v = array![[0.0, 1.0]];
        let s = Array1::from(vec![2.0]);
        let m = reconstruct(&u.view(), &s.view(), &v.view(), 1);
        assert_eq!(m, array![[0.0, 0.0, 0.0], [2.0, 0.0, 0.0]]);
    }

    #[test]
    fn flags_unsorted_and_nan_values() {
        let output = SvdOutput::new(Array1::from(vec![1.0, 2.0, f64::NAN]), None, None);
        let issues = check_svd_output(&output, Some(2));
        assert!(issues.contains(&SvdSanityIssue::UnexpectedRank { expected: 2, got: 3 }));
        assert!(issues.contains(&SvdSanityIssue::NotDescending(1)));
        assert!(issues.contains(&SvdSanityIssue::NonFiniteSingularValue(2)));
    }
}
