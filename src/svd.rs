//! Singular value decomposition behind one contract, several numeric backends.
//!
//! # Orientation
//!
//! Input matrices are `(n_columns, n_rows)`: the first axis is the logical column
//! (feature), the second the logical row (sample). The logical matrix being
//! decomposed is therefore `A = matrixᵀ`, of shape `(n_rows, n_columns)`, and
//! every backend reports
//!
//! * `s`: singular values of `A`, descending;
//! * `u`: shape `(num_u, n_rows)`, one left singular vector (over samples) per row;
//! * `v`: shape `(num_v, n_columns)`, one right singular vector (over features) per row.
//!
//! so that `matrix[[c, r]] ≈ Σ_k s[k]·u[[k, r]]·v[[k, c]]`. Each backend maps its
//! native solver's orientation onto this before returning.

use crate::engine::{EngineConnection, EnginePool, EngineRequest, SvdPart};
use crate::error::{EngineError, SvdError};
use crate::jacobi::one_sided_jacobi;
use crate::linalg_backends::{BackendQR, BackendSVD, LinAlgBackendProvider};
use log::{debug, trace, warn};
use ndarray::{s, Array1, Array2, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::sync::{Arc, Mutex, PoisonError};

/// Singular values plus optional left/right singular vectors.
#[derive(Debug, Clone)]
pub struct SvdOutput {
    s: Array1<f64>,
    u: Option<Array2<f64>>,
    v: Option<Array2<f64>>,
}

impl SvdOutput {
    pub fn new(s: Array1<f64>, u: Option<Array2<f64>>, v: Option<Array2<f64>>) -> Self {
        Self { s, u, v }
    }

    /// Number of singular values retained.
    pub fn rank(&self) -> usize {
        self.s.len()
    }

    pub fn singular_values(&self) -> &Array1<f64> {
        &self.s
    }

    /// Left singular vectors, `(num_u, n_rows)`; `None` when `num_u` was 0.
    pub fn u(&self) -> Option<&Array2<f64>> {
        self.u.as_ref()
    }

    /// Right singular vectors, `(num_v, n_columns)`; `None` when `num_v` was 0.
    pub fn v(&self) -> Option<&Array2<f64>> {
        self.v.as_ref()
    }

    pub fn into_parts(self) -> (Array1<f64>, Option<Array2<f64>>, Option<Array2<f64>>) {
        (self.s, self.u, self.v)
    }
}

/// The decomposition contract shared by every backend.
pub trait SingularValueDecomposition: Send {
    fn backend_name(&self) -> &'static str;

    /// Full thin decomposition: `min(n_rows, n_columns)` vectors on both sides.
    fn svd(&self, matrix: ArrayView2<f64>) -> Result<SvdOutput, SvdError> {
        let k = matrix.nrows().min(matrix.ncols());
        self.svd_vectors(matrix, k, k)
    }

    /// Top-`k` singular triplets. Only partial solvers implement this.
    fn svd_top_k(&self, _matrix: ArrayView2<f64>, _k: usize) -> Result<SvdOutput, SvdError> {
        Err(SvdError::Unsupported { backend: self.backend_name(), operation: "svd_top_k" })
    }

    /// Decomposition with exactly `num_u` left and `num_v` right vectors; 0 skips that side.
    fn svd_vectors(&self, matrix: ArrayView2<f64>, num_u: usize, num_v: usize) -> Result<SvdOutput, SvdError>;
}

/// Rejects non-finite input and clamps vector counts to `min(n_rows, n_columns)`.
fn prepare(
    backend: &'static str,
    matrix: &ArrayView2<f64>,
    num_u: usize,
    num_v: usize,
) -> Result<(usize, usize, usize), SvdError> {
    if let Some(pos) = matrix.iter().position(|x| !x.is_finite()) {
        return Err(SvdError::InvalidInput {
            reason: format!("non-finite value at flat index {} of a {:?} matrix", pos, matrix.dim()),
        });
    }
    let min_dim = matrix.nrows().min(matrix.ncols());
    if num_u > min_dim || num_v > min_dim {
        debug!(
            "{}: clamping requested vectors (num_u={}, num_v={}) to {}",
            backend, num_u, num_v, min_dim
        );
    }
    Ok((min_dim, num_u.min(min_dim), num_v.min(min_dim)))
}

fn empty_output() -> SvdOutput {
    SvdOutput::new(Array1::zeros(0), None, None)
}

/// LAPACK `gesdd` through ndarray-linalg. Calls are serialised through `native_lock`.
#[derive(Debug, Clone)]
pub struct LapackSvd {
    native_lock: Arc<Mutex<()>>,
}

impl LapackSvd {
    pub fn new(native_lock: Arc<Mutex<()>>) -> Self {
        Self { native_lock }
    }
}

impl SingularValueDecomposition for LapackSvd {
    fn backend_name(&self) -> &'static str {
        "LAPACK"
    }

    fn svd_vectors(&self, matrix: ArrayView2<f64>, num_u: usize, num_v: usize) -> Result<SvdOutput, SvdError> {
        let (min_dim, num_u, num_v) = prepare(self.backend_name(), &matrix, num_u, num_v)?;
        if min_dim == 0 {
            return Ok(empty_output());
        }
        let a = matrix.t().to_owned();
        let native = {
            let _guard = self.native_lock.lock().unwrap_or_else(PoisonError::into_inner);
            LinAlgBackendProvider::new()
                .svd_into(a, num_u > 0, num_v > 0)
                .map_err(|e| SvdError::Failed { backend: self.backend_name(), reason: e.to_string() })?
        };
        let u = match native.u {
            Some(u) if num_u > 0 => Some(u.slice(s![.., ..num_u]).t().to_owned()),
            _ => None,
        };
        let v = match native.vt {
            Some(vt) if num_v > 0 => Some(vt.slice(s![..num_v, ..]).to_owned()),
            _ => None,
        };
        Ok(SvdOutput::new(native.s.slice(s![..min_dim]).to_owned(), u, v))
    }
}

/// Pure-Rust one-sided Jacobi solver. The kernel only takes tall input, so a wide
/// logical matrix is decomposed transposed and the two sides swapped.
#[derive(Debug, Clone)]
pub struct JacobiSvd {
    max_sweeps: usize,
}

impl JacobiSvd {
    pub const DEFAULT_MAX_SWEEPS: usize = 60;

    pub fn new(max_sweeps: usize) -> Self {
        Self { max_sweeps }
    }
}

impl Default for JacobiSvd {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_SWEEPS)
    }
}

impl SingularValueDecomposition for JacobiSvd {
    fn backend_name(&self) -> &'static str {
        "JACOBI"
    }

    fn svd_vectors(&self, matrix: ArrayView2<f64>, num_u: usize, num_v: usize) -> Result<SvdOutput, SvdError> {
        let (min_dim, num_u, num_v) = prepare(self.backend_name(), &matrix, num_u, num_v)?;
        if min_dim == 0 {
            return Ok(empty_output());
        }
        let (n_columns, n_rows) = matrix.dim();
        let wide = n_rows < n_columns;
        // Tall logical A = matrixᵀ goes in as is; wide A goes in as Aᵀ = matrix.
        let native_input = if wide { matrix.to_owned() } else { matrix.t().to_owned() };
        let native = one_sided_jacobi(native_input, self.max_sweeps)
            .map_err(|e| SvdError::Failed { backend: self.backend_name(), reason: e.to_string() })?;
        trace!("Jacobi converged after {} sweeps (wide input: {})", native.sweeps, wide);

        // Columns of `left` span samples, columns of `right` span features.
        let (left, right) = if wide { (native.v, native.u) } else { (native.u, native.v) };
        let u = (num_u > 0).then(|| left.slice(s![.., ..num_u]).t().to_owned());
        let v = (num_v > 0).then(|| right.slice(s![.., ..num_v]).t().to_owned());
        Ok(SvdOutput::new(native.s.slice(s![..min_dim]).to_owned(), u, v))
    }
}

/// Settings for [`RandomizedSvd`].
#[derive(Debug, Clone)]
pub struct RandomizedSvdConfig {
    /// Extra sketch columns beyond the target rank.
    pub oversampling: usize,
    pub max_power_iterations: usize,
    /// Converged once no tracked singular value moves by more than `tol * s[0]`
    /// between power iterations.
    pub convergence_tolerance: f64,
    pub seed: u64,
}

impl Default for RandomizedSvdConfig {
    fn default() -> Self {
        Self {
            oversampling: 10,
            max_power_iterations: 20,
            convergence_tolerance: 1e-10,
            seed: 42,
        }
    }
}

/// Partial solver: Gaussian range finder refined by power iterations until the
/// top singular values stop moving. Non-convergence is logged and the best
/// estimate returned.
#[derive(Debug, Clone)]
pub struct RandomizedSvd {
    config: RandomizedSvdConfig,
    native_lock: Arc<Mutex<()>>,
}

impl RandomizedSvd {
    pub fn new(config: RandomizedSvdConfig, native_lock: Arc<Mutex<()>>) -> Self {
        Self { config, native_lock }
    }

    fn failed(&self, reason: impl ToString) -> SvdError {
        SvdError::Failed { backend: self.backend_name(), reason: reason.to_string() }
    }

    fn decompose(&self, matrix: ArrayView2<f64>, k: usize, num_u: usize, num_v: usize) -> Result<SvdOutput, SvdError> {
        let a = matrix.t();
        let (m, n) = a.dim();
        let sketch_width = (k + self.config.oversampling).min(m.min(n));

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let normal = Normal::new(0.0, 1.0).map_err(|e| self.failed(e))?;
        let omega = Array2::from_shape_fn((n, sketch_width), |_| normal.sample(&mut rng));

        let backend = LinAlgBackendProvider::new();
        let _guard = self.native_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut q = backend.qr_q_factor(&a.dot(&omega)).map_err(|e| self.failed(e))?;
        let mut previous: Option<Array1<f64>> = None;
        let mut iterations = 0;
        let mut converged = false;
        loop {
            let b = q.t().dot(&a);
            let estimate = backend.svd_into(b, false, false).map_err(|e| self.failed(e))?;
            let current = estimate.s.slice(s![..k]).to_owned();
            if let Some(prev) = &previous {
                let change = current
                    .iter()
                    .zip(prev.iter())
                    .map(|(x, y)| (x - y).abs())
                    .fold(0.0_f64, f64::max);
                let scale = current.first().copied().unwrap_or(0.0);
                converged = change <= self.config.convergence_tolerance * scale;
            }
            if converged || iterations == self.config.max_power_iterations {
                break;
            }
            previous = Some(current);
            iterations += 1;
            let w = backend.qr_q_factor(&a.t().dot(&q)).map_err(|e| self.failed(e))?;
            q = backend.qr_q_factor(&a.dot(&w)).map_err(|e| self.failed(e))?;
        }
        if !converged && self.config.max_power_iterations > 0 {
            warn!(
                "Randomized SVD did not converge within {} power iterations (k={}, {}x{}); returning best estimate",
                self.config.max_power_iterations, k, m, n
            );
        } else {
            debug!("Randomized SVD finished after {} power iterations", iterations);
        }

        let b = q.t().dot(&a);
        let small = backend.svd_into(b, num_u > 0, num_v > 0).map_err(|e| self.failed(e))?;
        let u = match small.u {
            Some(ub) if num_u > 0 => Some(q.dot(&ub.slice(s![.., ..num_u])).t().to_owned()),
            _ => None,
        };
        let v = match small.vt {
            Some(vt) if num_v > 0 => Some(vt.slice(s![..num_v, ..]).to_owned()),
            _ => None,
        };
        Ok(SvdOutput::new(small.s.slice(s![..k]).to_owned(), u, v))
    }
}

impl SingularValueDecomposition for RandomizedSvd {
    fn backend_name(&self) -> &'static str {
        "RANDOMIZED"
    }

    fn svd_top_k(&self, matrix: ArrayView2<f64>, k: usize) -> Result<SvdOutput, SvdError> {
        let (min_dim, k, _) = prepare(self.backend_name(), &matrix, k, k)?;
        if min_dim == 0 || k == 0 {
            return Ok(empty_output());
        }
        self.decompose(matrix, k, k, k)
    }

    fn svd_vectors(&self, matrix: ArrayView2<f64>, num_u: usize, num_v: usize) -> Result<SvdOutput, SvdError> {
        let (min_dim, num_u, num_v) = prepare(self.backend_name(), &matrix, num_u, num_v)?;
        if min_dim == 0 {
            return Ok(empty_output());
        }
        let k = match num_u.max(num_v) {
            0 => min_dim,
            k => k,
        };
        self.decompose(matrix, k, num_u, num_v)
    }
}

/// Decomposition delegated to a statistical engine's `svd(x, nu, nv)`.
#[derive(Debug, Clone)]
pub struct EngineSvd {
    pool: Arc<EnginePool>,
}

impl EngineSvd {
    const VARIABLE: &'static str = "svd_input";

    pub fn new(pool: Arc<EnginePool>) -> Self {
        Self { pool }
    }

    fn evaluate(
        conn: &mut dyn EngineConnection,
        matrix: &ArrayView2<f64>,
        min_dim: usize,
        num_u: usize,
        num_v: usize,
    ) -> Result<SvdOutput, EngineError> {
        let var = Self::VARIABLE;
        let (n_columns, n_rows) = matrix.dim();
        conn.create_matrix(var, n_rows, n_columns)?;
        for (r, sample) in matrix.columns().into_iter().enumerate() {
            conn.assign_row(var, r, &sample.to_vec())?;
        }
        let request = |nu, nv, part| EngineRequest::Svd { var: var.to_string(), nu, nv, part };

        let d = conn.eval(&request(0, 0, SvdPart::D))?.into_vector()?;
        if d.len() < min_dim {
            return Err(EngineError::MalformedReply(format!(
                "expected {} singular values, got {}",
                min_dim,
                d.len()
            )));
        }
        let u = if num_u > 0 {
            let native = conn.eval(&request(num_u, 0, SvdPart::U))?.into_matrix()?;
            check_shape(&native, (n_rows, num_u), "u")?;
            Some(native.t().to_owned())
        } else {
            None
        };
        let v = if num_v > 0 {
            let native = conn.eval(&request(0, num_v, SvdPart::V))?.into_matrix()?;
            check_shape(&native, (n_columns, num_v), "v")?;
            Some(native.t().to_owned())
        } else {
            None
        };
        conn.remove(var)?;
        Ok(SvdOutput::new(Array1::from(d[..min_dim].to_vec()), u, v))
    }
}

fn check_shape(matrix: &Array2<f64>, expected: (usize, usize), side: &str) -> Result<(), EngineError> {
    if matrix.dim() != expected {
        return Err(EngineError::MalformedReply(format!(
            "{} has shape {:?}, expected {:?}",
            side,
            matrix.dim(),
            expected
        )));
    }
    Ok(())
}

impl SingularValueDecomposition for EngineSvd {
    fn backend_name(&self) -> &'static str {
        "R"
    }

    fn svd_vectors(&self, matrix: ArrayView2<f64>, num_u: usize, num_v: usize) -> Result<SvdOutput, SvdError> {
        let (min_dim, num_u, num_v) = prepare(self.backend_name(), &matrix, num_u, num_v)?;
        if min_dim == 0 {
            return Ok(empty_output());
        }
        let mut conn = self
            .pool
            .borrow_connection()
            .map_err(|e| SvdError::Failed { backend: self.backend_name(), reason: e.to_string() })?;
        match Self::evaluate(&mut *conn, &matrix, min_dim, num_u, num_v) {
            Ok(output) => Ok(output),
            Err(e) => {
                conn.invalidate();
                Err(SvdError::Failed { backend: self.backend_name(), reason: e.to_string() })
            }
        }
    }
}

/// Closed set of backends, as produced by [`crate::svd_factory::SvdFactory`].
#[derive(Debug, Clone)]
pub enum SvdBackend {
    Lapack(LapackSvd),
    Jacobi(JacobiSvd),
    Randomized(RandomizedSvd),
    Engine(EngineSvd),
}

impl SvdBackend {
    fn inner(&self) -> &dyn SingularValueDecomposition {
        match self {
            SvdBackend::Lapack(b) => b,
            SvdBackend::Jacobi(b) => b,
            SvdBackend::Randomized(b) => b,
            SvdBackend::Engine(b) => b,
        }
    }
}

impl SingularValueDecomposition for SvdBackend {
    fn backend_name(&self) -> &'static str {
        self.inner().backend_name()
    }

    fn svd(&self, matrix: ArrayView2<f64>) -> Result<SvdOutput, SvdError> {
        self.inner().svd(matrix)
    }

    fn svd_top_k(&self, matrix: ArrayView2<f64>, k: usize) -> Result<SvdOutput, SvdError> {
        self.inner().svd_top_k(matrix, k)
    }

    fn svd_vectors(&self, matrix: ArrayView2<f64>, num_u: usize, num_v: usize) -> Result<SvdOutput, SvdError> {
        self.inner().svd_vectors(matrix, num_u, num_v)
    }
}
