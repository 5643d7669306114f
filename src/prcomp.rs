//! Exact principal components of a samples × features matrix, with the
//! center/scale/tol knobs of a statistical engine's `prcomp`.
//!
//! Uses an eigendecomposition of the covariance matrix when there are at most as
//! many features as samples, and of the Gram matrix otherwise (the "Gram trick").

use crate::linalg_backends::{BackendEigh, KernelError, LinAlgBackendProvider};
use log::{debug, trace};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};

const SCALE_SANITIZATION_THRESHOLD: f64 = 1e-9;

/// Options mirroring `prcomp(x, center=, scale.=, tol=)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrcompOptions {
    pub center: bool,
    pub scale: bool,
    /// Components whose standard deviation is `<= tol * sdev[0]` are dropped.
    pub tol: Option<f64>,
}

impl Default for PrcompOptions {
    fn default() -> Self {
        Self { center: true, scale: false, tol: None }
    }
}

/// Principal axes and their standard deviations.
#[derive(Debug, Clone)]
pub struct PrcompOutput {
    /// Shape: `(n_features, k_components)`, unit-length columns.
    pub rotation: Array2<f64>,
    /// Shape: `(k_components)`, descending.
    pub sdev: Array1<f64>,
}

/// Computes the principal axes of `data` (shape `(n_samples, n_features)`).
pub fn prcomp(data: ArrayView2<f64>, options: &PrcompOptions) -> Result<PrcompOutput, KernelError> {
    let n_samples = data.nrows();
    let n_features = data.ncols();
    if n_samples == 0 || n_features == 0 {
        return Err("Input data has zero samples or zero features.".into());
    }
    if n_samples < 2 {
        return Err("Input matrix must have at least 2 samples.".into());
    }

    let mut work = data.to_owned();
    if options.center {
        let mean_vector = work.mean_axis(Axis(0)).ok_or("Failed to compute mean of the data.")?;
        work -= &mean_vector;
    }
    if options.scale {
        // Sample standard deviation about the (possibly uncentered) column values.
        let scale_vector = work.map_axis(Axis(0), |column| {
            let ss: f64 = column.iter().map(|x| x * x).sum();
            let sd = (ss / (n_samples as f64 - 1.0)).sqrt();
            if sd.is_finite() && sd > SCALE_SANITIZATION_THRESHOLD { sd } else { 1.0 }
        });
        work /= &scale_vector;
    }

    let backend = LinAlgBackendProvider::new();
    let denominator = (n_samples - 1) as f64;

    let (eigenvalues_desc, axes) = if n_features <= n_samples {
        let mut cov_matrix = work.t().dot(&work);
        cov_matrix /= denominator;
        let eig = backend
            .eigh_upper(&cov_matrix)
            .map_err(|e| format!("Eigen decomposition of covariance matrix failed: {}", e))?;
        let order = descending_order(&eig.eigenvalues);
        let values: Vec<f64> = order.iter().map(|&i| eig.eigenvalues[i].max(0.0)).collect();
        let axes = eig.eigenvectors.select(Axis(1), &order);
        trace!("prcomp covariance path: {} features, {} samples", n_features, n_samples);
        (values, axes)
    } else {
        let mut gram_matrix = work.dot(&work.t());
        gram_matrix /= denominator;
        let eig = backend
            .eigh_upper(&gram_matrix)
            .map_err(|e| format!("Eigen decomposition of Gram matrix failed: {}", e))?;
        let order = descending_order(&eig.eigenvalues);
        let values: Vec<f64> = order.iter().map(|&i| eig.eigenvalues[i].max(0.0)).collect();
        // Feature-space axis for each sample-space eigenvector: Xᵀu, normalised.
        let mut axes = Array2::<f64>::zeros((n_features, order.len()));
        for (k, &i) in order.iter().enumerate() {
            let mut axis = work.t().dot(&eig.eigenvectors.column(i));
            let norm = axis.dot(&axis).sqrt();
            if norm > SCALE_SANITIZATION_THRESHOLD {
                axis.mapv_inplace(|x| x / norm);
            } else {
                axis.fill(0.0);
            }
            axes.slice_mut(s![.., k]).assign(&axis);
        }
        trace!("prcomp Gram path: {} features, {} samples", n_features, n_samples);
        (values, axes)
    };

    let sdev_all: Vec<f64> = eigenvalues_desc.iter().map(|v| v.sqrt()).collect();
    let max_rank = n_features.min(n_samples);
    let rank = match options.tol {
        Some(tol) => {
            let first = sdev_all.first().copied().unwrap_or(0.0);
            sdev_all.iter().take(max_rank).take_while(|&&sd| sd > first * tol).count()
        }
        None => max_rank.min(sdev_all.len()),
    };
    debug!(
        "prcomp kept {} of {} components (tol={:?})",
        rank,
        sdev_all.len(),
        options.tol
    );

    let mut rotation = axes.slice(s![.., ..rank]).to_owned();
    for mut column in rotation.columns_mut() {
        let norm = column.dot(&column).sqrt();
        if norm > SCALE_SANITIZATION_THRESHOLD {
            column.mapv_inplace(|x| x / norm);
        }
    }
    Ok(PrcompOutput {
        rotation,
        sdev: Array1::from(sdev_all[..rank].to_vec()),
    })
}

fn descending_order(values: &Array1<f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap_or(std::cmp::Ordering::Equal));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn covariance_and_gram_paths_agree_on_sdev() {
        let tall = array![
            [2.5, 2.4, 0.5],
            [0.5, 0.7, 1.1],
            [2.2, 2.9, 0.2],
            [1.9, 2.2, 0.9],
            [3.1, 3.0, 0.4],
        ];
        let tall_out = prcomp(tall.view(), &PrcompOptions::default()).unwrap();

        // Same samples with a duplicated feature block makes the Gram path kick in.
        let wide = ndarray::concatenate(Axis(1), &[tall.view(), tall.view()]).unwrap();
        let wide_out = prcomp(wide.view(), &PrcompOptions::default()).unwrap();

        // Duplicating every feature doubles each covariance eigenvalue.
        assert_abs_diff_eq!(wide_out.sdev[0], tall_out.sdev[0] * 2f64.sqrt(), epsilon = 1e-9);
        assert_eq!(tall_out.rotation.nrows(), 3);
        assert_eq!(wide_out.rotation.nrows(), 6);
    }

    #[test]
    fn tolerance_drops_minor_components() {
        // Second feature is nearly a copy of the first; third is constant.
        let data = array![
            [1.0, 1.01, 5.0],
            [2.0, 1.99, 5.0],
            [3.0, 3.02, 5.0],
            [4.0, 3.98, 5.0],
        ];
        let all = prcomp(data.view(), &PrcompOptions { tol: None, ..Default::default() }).unwrap();
        assert_eq!(all.rotation.ncols(), 3);
        let pruned = prcomp(data.view(), &PrcompOptions { tol: Some(0.05), ..Default::default() }).unwrap();
        assert_eq!(pruned.rotation.ncols(), 1);
        let axis = pruned.rotation.column(0);
        assert_abs_diff_eq!(axis[0].abs(), std::f64::consts::FRAC_1_SQRT_2, epsilon = 1e-2);
        assert_abs_diff_eq!(axis[2], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn single_sample_is_rejected() {
        let data = array![[1.0, 2.0]];
        assert!(prcomp(data.view(), &PrcompOptions::default()).is_err());
    }
}
