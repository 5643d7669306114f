// src/linalg_backends.rs

//! Dense LAPACK kernels (symmetric eigendecomposition, QR, SVD) behind small traits,
//! so the decomposition backends and the embedded engine do not call
//! ndarray-linalg directly.

use ndarray::{Array1, Array2};
use ndarray_linalg::{Eigh as NdLinalgEigh, QR as NdLinalgQR, SVDInto as NdLinalgSVDInto, UPLO};
use std::error::Error;

/// Boxed error type returned by the kernels.
pub type KernelError = Box<dyn Error + Send + Sync>;

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput {
    /// Eigenvalues, in ascending order.
    pub eigenvalues: Array1<f64>,
    /// Eigenvectors as columns; `eigenvectors.column(i)` belongs to `eigenvalues[i]`.
    pub eigenvectors: Array2<f64>,
}

/// Symmetric eigendecomposition reading the upper triangle.
pub trait BackendEigh {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput, KernelError>;
}

/// QR decomposition, returning the Q factor.
pub trait BackendQR {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, KernelError>;
}

/// Output of a native SVD in LAPACK orientation: `matrix = u · diag(s) · vt`.
#[derive(Debug)]
pub struct SVDOutput {
    /// Shape `(nrows, nrows)` when requested.
    pub u: Option<Array2<f64>>,
    /// Singular values, descending.
    pub s: Array1<f64>,
    /// Shape `(ncols, ncols)` when requested.
    pub vt: Option<Array2<f64>>,
}

/// Native singular value decomposition.
pub trait BackendSVD {
    fn svd_into(&self, matrix: Array2<f64>, compute_u: bool, compute_v: bool) -> Result<SVDOutput, KernelError>;
}

/// ndarray-linalg (LAPACK) implementation of the kernels.
#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_dyn_error<E: Error + Send + Sync + 'static>(e: E) -> KernelError {
    Box::new(e)
}

impl BackendEigh for NdarrayLinAlgBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput, KernelError> {
        if matrix.nrows() != matrix.ncols() {
            return Err(format!(
                "Matrix must be square for eigendecomposition, got {}x{}",
                matrix.nrows(),
                matrix.ncols()
            )
            .into());
        }
        if matrix.is_empty() {
            return Ok(EighOutput { eigenvalues: Array1::zeros(0), eigenvectors: Array2::zeros((0, 0)) });
        }
        let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_dyn_error)?;
        Ok(EighOutput { eigenvalues, eigenvectors })
    }
}

impl BackendQR for NdarrayLinAlgBackend {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, KernelError> {
        let (nrows, ncols) = matrix.dim();
        if nrows == 0 || ncols == 0 {
            return Ok(Array2::zeros((nrows, nrows.min(ncols))));
        }
        let (q_factor, _r) = matrix.qr().map_err(to_dyn_error)?;
        Ok(q_factor)
    }
}

impl BackendSVD for NdarrayLinAlgBackend {
    fn svd_into(&self, matrix: Array2<f64>, compute_u: bool, compute_v: bool) -> Result<SVDOutput, KernelError> {
        let (nrows, ncols) = matrix.dim();
        if matrix.is_empty() {
            return Ok(SVDOutput {
                u: if compute_u { Some(Array2::zeros((nrows, nrows))) } else { None },
                s: Array1::zeros(0),
                vt: if compute_v { Some(Array2::zeros((ncols, ncols))) } else { None },
            });
        }
        let (u, s, vt) = matrix.svd_into(compute_u, compute_v).map_err(to_dyn_error)?;
        Ok(SVDOutput { u, s, vt })
    }
}

/// Dispatches to the LAPACK provider selected by the crate's `backend_*` features.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider;

impl LinAlgBackendProvider {
    pub fn new() -> Self {
        Self
    }
}

impl BackendEigh for LinAlgBackendProvider {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput, KernelError> {
        NdarrayLinAlgBackend.eigh_upper(matrix)
    }
}

impl BackendQR for LinAlgBackendProvider {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, KernelError> {
        NdarrayLinAlgBackend.qr_q_factor(matrix)
    }
}

impl BackendSVD for LinAlgBackendProvider {
    fn svd_into(&self, matrix: Array2<f64>, compute_u: bool, compute_v: bool) -> Result<SVDOutput, KernelError> {
        NdarrayLinAlgBackend.svd_into(matrix, compute_u, compute_v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn svd_of_small_matrix_has_known_singular_values() {
        let m = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let out = LinAlgBackendProvider::new().svd_into(m, false, false).unwrap();
        assert_abs_diff_eq!(out.s[0], 9.508032, epsilon = 1e-5);
        assert_abs_diff_eq!(out.s[1], 0.772869, epsilon = 1e-5);
        assert!(out.u.is_none() && out.vt.is_none());
    }

    #[test]
    fn qr_factor_is_orthonormal() {
        let m = array![[1.0, 2.0], [3.0, 4.0], [5.0, 7.0]];
        let q = LinAlgBackendProvider::new().qr_q_factor(&m).unwrap();
        let qtq = q.t().dot(&q);
        let identity = Array2::<f64>::eye(q.ncols());
        for (got, want) in qtq.iter().zip(identity.iter()) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-10);
        }
    }

    #[test]
    fn eigh_rejects_non_square() {
        let m = Array2::<f64>::zeros((2, 3));
        assert!(LinAlgBackendProvider::new().eigh_upper(&m).is_err());
    }
}
