// Principal component analysis on a statistical engine

use crate::engine::{EngineConnection, EnginePool, EngineRequest, NameAxis, PrcompPart};
use crate::error::{EngineError, PcaError};
use crate::prcomp::PrcompOptions;
use log::{debug, warn};
use ndarray::{Array2, ArrayView2, Axis};
use std::collections::HashMap;
use std::sync::Arc;

/// Projects `slice` through `rotation`.
///
/// * `slice` - shape `(n_features, n_samples)`.
/// * `rotation` - shape `(n_components, n_features)`.
///
/// Returns `(n_components, n_samples)`: one projected column per component, one
/// value per sample.
///
/// # Errors
/// `PcaError::DimensionMismatch` when the feature counts disagree.
pub fn product(slice: &ArrayView2<f64>, rotation: &ArrayView2<f64>) -> Result<Array2<f64>, PcaError> {
    if slice.nrows() != rotation.ncols() {
        return Err(PcaError::DimensionMismatch {
            left_features: slice.nrows(),
            right_features: rotation.ncols(),
        });
    }
    Ok(rotation.dot(slice))
}

/// PCA computed by a statistical engine borrowed from a shared pool.
///
/// A failed [`RemotePca::pca`] leaves no rotation behind; callers test
/// [`RemotePca::rotation`] for `None`.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use ndarray::array;
/// use pathway_pca::engine::{EnginePool, EnginePoolConfig};
/// use pathway_pca::pca::RemotePca;
///
/// let pool = Arc::new(EnginePool::embedded(EnginePoolConfig::default()));
/// let mut pca = RemotePca::new(pool);
/// // 2 features x 4 samples
/// let slice = array![[1.0, 2.0, 3.0, 4.0], [2.0, 4.1, 5.9, 8.0]];
/// let features = vec!["f1".to_string(), "f2".to_string()];
/// let samples: Vec<String> = (1..=4).map(|i| format!("s{}", i)).collect();
/// assert!(pca.pca(slice.view(), &features, &samples).is_some());
/// let projected = pca.rotate(slice.view()).unwrap().unwrap();
/// assert_eq!(projected.ncols(), 4);
/// ```
#[derive(Debug)]
pub struct RemotePca {
    pool: Arc<EnginePool>,
    tolerance: f64,
    do_scaling: bool,
    collect_rotation_row_names: bool,
    /// Shape: `(n_components, n_features)`.
    rotation: Option<Array2<f64>>,
    rotation_row_names: Option<Vec<String>>,
}

impl RemotePca {
    const VARIABLE: &'static str = "pca_input";
    pub const DEFAULT_TOLERANCE: f64 = 0.05;

    pub fn new(pool: Arc<EnginePool>) -> Self {
        Self {
            pool,
            tolerance: Self::DEFAULT_TOLERANCE,
            do_scaling: false,
            collect_rotation_row_names: true,
            rotation: None,
            rotation_row_names: None,
        }
    }

    pub fn set_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }

    pub fn set_do_scaling(&mut self, do_scaling: bool) {
        self.do_scaling = do_scaling;
    }

    pub fn set_collect_rotation_row_names(&mut self, collect: bool) {
        self.collect_rotation_row_names = collect;
    }

    /// Injects a previously computed rotation, `(n_components, n_features)`.
    pub fn set_rotation(&mut self, rotation: Option<Array2<f64>>) {
        self.rotation = rotation;
        self.rotation_row_names = None;
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn rotation(&self) -> Option<&Array2<f64>> {
        self.rotation.as_ref()
    }

    /// Feature ids of the rotation's columns, when collected.
    pub fn rotation_row_names(&self) -> Option<&[String]> {
        self.rotation_row_names.as_deref()
    }

    /// Computes the rotation of `matrix` (shape `(n_features, n_samples)`).
    ///
    /// * `column_ids` - one id per feature (first axis).
    /// * `row_ids` - one id per sample (second axis).
    ///
    /// Any failure (unreachable engine, malformed reply, bad dimensions, no
    /// component above tolerance) clears the rotation, logs a warning and
    /// returns `None`. A connection that failed mid-request is invalidated.
    pub fn pca(&mut self, matrix: ArrayView2<f64>, column_ids: &[String], row_ids: &[String]) -> Option<&Array2<f64>> {
        self.rotation = None;
        self.rotation_row_names = None;

        let (n_features, n_samples) = matrix.dim();
        if column_ids.len() != n_features || row_ids.len() != n_samples {
            warn!(
                "PCA input is {}x{} but {} feature ids and {} sample ids were given",
                n_features,
                n_samples,
                column_ids.len(),
                row_ids.len()
            );
            return None;
        }

        let options = PrcompOptions {
            center: true,
            scale: self.do_scaling,
            tol: Some(self.tolerance),
        };
        let mut conn = match self.pool.borrow_connection() {
            Ok(conn) => conn,
            Err(e) => {
                warn!("PCA could not borrow an engine connection: {}", e);
                return None;
            }
        };
        let result = Self::compute(
            &mut *conn,
            &matrix,
            column_ids,
            row_ids,
            &options,
            self.collect_rotation_row_names,
        );
        match result {
            Ok((rotation, names)) if rotation.nrows() > 0 => {
                debug!(
                    "PCA kept {} of {} components (tol={})",
                    rotation.nrows(),
                    n_features.min(n_samples),
                    self.tolerance
                );
                self.rotation = Some(rotation);
                self.rotation_row_names = names;
            }
            Ok(_) => {
                warn!("PCA kept no component above tolerance {}", self.tolerance);
            }
            Err(e) => {
                warn!("PCA on the statistical engine failed: {}", e);
                conn.invalidate();
            }
        }
        self.rotation.as_ref()
    }

    fn compute(
        conn: &mut dyn EngineConnection,
        matrix: &ArrayView2<f64>,
        column_ids: &[String],
        row_ids: &[String],
        options: &PrcompOptions,
        collect_names: bool,
    ) -> Result<(Array2<f64>, Option<Vec<String>>), EngineError> {
        let var = Self::VARIABLE;
        let (n_features, n_samples) = matrix.dim();

        // One assignment per sample keeps each transfer small.
        conn.create_matrix(var, n_samples, n_features)?;
        for (r, sample) in matrix.axis_iter(Axis(1)).enumerate() {
            conn.assign_row(var, r, &sample.to_vec())?;
        }
        conn.assign_names(var, NameAxis::Rows, row_ids)?;
        conn.assign_names(var, NameAxis::Columns, column_ids)?;

        let request = |part| EngineRequest::Prcomp { var: var.to_string(), options: *options, part };
        // (n_features, k), rows in the engine's order
        let native = conn.eval(&request(PrcompPart::Rotation))?.into_matrix()?;
        if native.nrows() != n_features {
            return Err(EngineError::MalformedReply(format!(
                "rotation has {} rows for {} features",
                native.nrows(),
                n_features
            )));
        }

        let (aligned, names) = if collect_names {
            let returned = conn.eval(&request(PrcompPart::RotationRowNames))?.into_strings()?;
            let order = match_order(&returned, column_ids)?;
            (native.select(Axis(0), &order), Some(column_ids.to_vec()))
        } else {
            (native, None)
        };
        conn.remove(var)?;
        Ok((aligned.t().as_standard_layout().into_owned(), names))
    }

    /// Projects `slice` (shape `(n_features, n_samples)`) through the stored
    /// rotation. `Ok(None)` when no rotation is set.
    pub fn rotate(&self, slice: ArrayView2<f64>) -> Result<Option<Array2<f64>>, PcaError> {
        match &self.rotation {
            Some(rotation) => product(&slice, &rotation.view()).map(Some),
            None => Ok(None),
        }
    }
}

/// Position in `returned` of each id of `expected`; the two must hold the same ids.
fn match_order(returned: &[String], expected: &[String]) -> Result<Vec<usize>, EngineError> {
    if returned.len() != expected.len() {
        return Err(EngineError::MalformedReply(format!(
            "engine returned {} rotation row names for {} features",
            returned.len(),
            expected.len()
        )));
    }
    let positions: HashMap<&str, usize> = returned.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    expected
        .iter()
        .map(|id| {
            positions.get(id.as_str()).copied().ok_or_else(|| {
                EngineError::MalformedReply(format!("feature '{}' missing from returned rotation row names", id))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EmbeddedEngine, EngineConnector, EnginePoolConfig, EngineValue, Layout};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    /// Returns rotation rows and their names in reverse order.
    struct ReversingEngine(EmbeddedEngine);

    impl EngineConnection for ReversingEngine {
        fn create_matrix(&mut self, var: &str, nrow: usize, ncol: usize) -> Result<(), EngineError> {
            self.0.create_matrix(var, nrow, ncol)
        }
        fn assign_row(&mut self, var: &str, row: usize, values: &[f64]) -> Result<(), EngineError> {
            self.0.assign_row(var, row, values)
        }
        fn assign_names(&mut self, var: &str, axis: NameAxis, names: &[String]) -> Result<(), EngineError> {
            self.0.assign_names(var, axis, names)
        }
        fn eval(&mut self, request: &EngineRequest) -> Result<EngineValue, EngineError> {
            let value = self.0.eval(request)?;
            match request {
                EngineRequest::Prcomp { part: PrcompPart::RotationRowNames, .. } => {
                    let mut names = value.into_strings()?;
                    names.reverse();
                    Ok(EngineValue::Strings(names))
                }
                EngineRequest::Prcomp { part: PrcompPart::Rotation, .. } => {
                    let rotation = value.into_matrix()?;
                    let reversed = rotation.slice(ndarray::s![..;-1, ..]).to_owned();
                    Ok(EngineValue::Numeric {
                        values: reversed.iter().copied().collect(),
                        nrow: reversed.nrows(),
                        ncol: reversed.ncols(),
                        layout: Layout::RowMajor,
                    })
                }
                _ => Ok(value),
            }
        }
        fn remove(&mut self, var: &str) -> Result<(), EngineError> {
            self.0.remove(var)
        }
    }

    struct ReversingConnector;

    impl EngineConnector for ReversingConnector {
        fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError> {
            Ok(Box::new(ReversingEngine(EmbeddedEngine::new())))
        }
    }

    struct RefusingConnector;

    impl EngineConnector for RefusingConnector {
        fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError> {
            Err(EngineError::Connection("connection refused".to_string()))
        }
    }

    fn slice() -> Array2<f64> {
        // 3 features x 5 samples
        array![
            [2.5, 0.5, 2.2, 1.9, 3.1],
            [2.4, 0.7, 2.9, 2.2, 3.0],
            [0.5, 1.1, 0.2, 0.9, 0.4],
        ]
    }

    #[test]
    fn rotation_has_one_row_per_component() {
        let pool = Arc::new(EnginePool::embedded(EnginePoolConfig::default()));
        let mut pca = RemotePca::new(pool);
        pca.set_tolerance(0.0);
        let rotation = pca.pca(slice().view(), &ids("f", 3), &ids("s", 5)).unwrap();
        assert_eq!(rotation.dim(), (3, 3));
        assert_eq!(pca.rotation_row_names().unwrap(), ids("f", 3).as_slice());

        let projected = pca.rotate(slice().view()).unwrap().unwrap();
        assert_eq!(projected.dim(), (3, 5));
    }

    #[test]
    fn permuted_row_names_are_realigned() {
        let plain_pool = Arc::new(EnginePool::embedded(EnginePoolConfig::default()));
        let reversing_pool = Arc::new(EnginePool::new(Arc::new(ReversingConnector), EnginePoolConfig::default()));
        let mut plain = RemotePca::new(plain_pool);
        let mut reversed = RemotePca::new(reversing_pool);

        let expected = plain.pca(slice().view(), &ids("f", 3), &ids("s", 5)).unwrap().clone();
        let got = reversed.pca(slice().view(), &ids("f", 3), &ids("s", 5)).unwrap();
        assert_eq!(got.dim(), expected.dim());
        for (x, y) in got.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
        }
    }

    #[test]
    fn engine_failure_leaves_no_rotation() {
        let pool = Arc::new(EnginePool::new(Arc::new(RefusingConnector), EnginePoolConfig::default()));
        let mut pca = RemotePca::new(pool);
        pca.set_rotation(Some(Array2::eye(3)));
        assert!(pca.pca(slice().view(), &ids("f", 3), &ids("s", 5)).is_none());
        assert!(pca.rotation().is_none());
        assert!(pca.rotate(slice().view()).unwrap().is_none());
    }

    #[test]
    fn mismatched_ids_fail_without_touching_the_engine() {
        let pool = Arc::new(EnginePool::embedded(EnginePoolConfig::default()));
        let mut pca = RemotePca::new(Arc::clone(&pool));
        assert!(pca.pca(slice().view(), &ids("f", 2), &ids("s", 5)).is_none());
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn product_checks_feature_count() {
        let rotation = Array2::<f64>::zeros((2, 4));
        let err = product(&slice().view(), &rotation.view()).unwrap_err();
        assert!(matches!(err, PcaError::DimensionMismatch { left_features: 3, right_features: 4 }));
    }
}
