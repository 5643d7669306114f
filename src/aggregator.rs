//! Replaces each pathway's probeset columns with its principal components, and
//! averages per-split rotations into the split-0 rotation.

use crate::diagnostics::check_svd_output;
use crate::engine::EnginePool;
use crate::error::{AggregationError, CacheError, CompoundFileError, SvdError};
use crate::pca::RemotePca;
use crate::rotation_cache::{split_id_from_compound_filename, MapKind, RotationCache};
use crate::scaling::{scale_features, MissingFeature, ScalingMap, ScalingMode};
use crate::svd::SingularValueDecomposition;
use crate::svd_factory::{SvdBackendKind, SvdFactory};
use log::{debug, error, info, warn};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use std::sync::Arc;

/// Sample rows by feature columns, stored `(n_columns, n_rows)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    row_ids: Vec<String>,
    column_ids: Vec<String>,
    values: Array2<f64>,
}

impl FeatureTable {
    pub fn new(row_ids: Vec<String>, column_ids: Vec<String>, values: Array2<f64>) -> Result<Self, AggregationError> {
        if values.dim() != (column_ids.len(), row_ids.len()) {
            return Err(AggregationError::DimensionMismatch {
                context: "feature table".to_string(),
                expected: format!("{}x{} (columns x rows)", column_ids.len(), row_ids.len()),
                got: format!("{}x{}", values.nrows(), values.ncols()),
            });
        }
        Ok(Self { row_ids, column_ids, values })
    }

    /// A table with the given rows and no columns.
    pub fn with_rows(row_ids: Vec<String>) -> Self {
        let n_rows = row_ids.len();
        Self { row_ids, column_ids: Vec::new(), values: Array2::zeros((0, n_rows)) }
    }

    pub fn row_ids(&self) -> &[String] {
        &self.row_ids
    }

    pub fn column_ids(&self) -> &[String] {
        &self.column_ids
    }

    /// Shape `(n_columns, n_rows)`.
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn n_rows(&self) -> usize {
        self.row_ids.len()
    }

    pub fn n_columns(&self) -> usize {
        self.column_ids.len()
    }

    pub fn column(&self, id: &str) -> Option<ArrayView1<f64>> {
        self.column_ids
            .iter()
            .position(|c| c == id)
            .map(|i| self.values.row(i))
    }

    /// Appends a column holding one value per row.
    pub fn push_column(&mut self, id: String, values: ArrayView1<f64>) -> Result<(), AggregationError> {
        self.values.push_row(values).map_err(|_| AggregationError::DimensionMismatch {
            context: format!("column '{}'", id),
            expected: format!("{} values", self.row_ids.len()),
            got: format!("{} values", values.len()),
        })?;
        self.column_ids.push(id);
        Ok(())
    }
}

/// A pathway: an id plus the table column indices of its probesets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathwayInfo {
    pub id: String,
    pub probeset_indices: Vec<usize>,
}

impl PathwayInfo {
    pub fn new(id: impl Into<String>, probeset_indices: Vec<usize>) -> Self {
        Self { id: id.into(), probeset_indices }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Dataset endpoint, the first part of every cache key.
    pub endpoint: String,
    /// Engine `prcomp` tolerance; components with `sdev <= tolerance * sdev[0]` are dropped.
    pub tolerance: f64,
    /// Ask the engine to scale features to unit variance before PCA.
    pub do_scaling: bool,
    pub collect_rotation_row_names: bool,
    /// Backend for the re-orthogonalising SVD of cross-split averaging.
    pub averaging_backend: SvdBackendKind,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            endpoint: "default".to_string(),
            tolerance: RemotePca::DEFAULT_TOLERANCE,
            do_scaling: false,
            collect_rotation_row_names: true,
            averaging_backend: SvdBackendKind::Lapack,
        }
    }
}

impl AggregatorConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), ..Self::default() }
    }
}

/// Per-split PCA feature aggregator. The split is the rotation cache's split.
///
/// One aggregator per worker thread; the engine pool and the rotation cache are
/// shared between them.
#[derive(Debug)]
pub struct PcaFeatureAggregator {
    config: AggregatorConfig,
    cache: Arc<RotationCache>,
    pca: RemotePca,
    factory: SvdFactory,
}

impl PcaFeatureAggregator {
    pub fn new(config: AggregatorConfig, cache: Arc<RotationCache>, pool: Arc<EnginePool>, factory: SvdFactory) -> Self {
        let mut pca = RemotePca::new(pool);
        pca.set_tolerance(config.tolerance);
        pca.set_do_scaling(config.do_scaling);
        pca.set_collect_rotation_row_names(config.collect_rotation_row_names);
        Self { config, cache, pca, factory }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn split_id(&self) -> u32 {
        self.cache.split_id()
    }

    /// Aggregates `table` pathway by pathway.
    ///
    /// The output holds one `<pathway>_svd<k>` column per retained component,
    /// pathways in the given order, followed by every column no aggregated
    /// pathway consumed, in their original order. A pathway whose PCA fails is
    /// left unaggregated.
    ///
    /// # Errors
    /// Cache inconsistencies, identifier mismatches and out-of-range probesets
    /// stop the whole task.
    pub fn aggregate(&mut self, table: &FeatureTable, pathways: &[PathwayInfo]) -> Result<FeatureTable, AggregationError> {
        let mut output = FeatureTable::with_rows(table.row_ids().to_vec());
        let mut consumed = vec![false; table.n_columns()];

        for pathway in pathways {
            if let Some(&index) = pathway.probeset_indices.iter().find(|&&i| i >= table.n_columns()) {
                return Err(AggregationError::ProbesetOutOfRange {
                    pathway: pathway.id.clone(),
                    index,
                    n_columns: table.n_columns(),
                });
            }
            if pathway.probeset_indices.len() <= 1 {
                debug!("Pathway {} has {} probesets; nothing to aggregate", pathway.id, pathway.probeset_indices.len());
                continue;
            }

            let slice = table.values().select(Axis(0), &pathway.probeset_indices);
            let probe_ids: Vec<String> = pathway
                .probeset_indices
                .iter()
                .map(|&i| table.column_ids()[i].clone())
                .collect();

            let Some(projected) = self.project_pathway(&pathway.id, slice.view(), &probe_ids, table.row_ids())? else {
                continue;
            };
            for (k, component) in projected.outer_iter().enumerate() {
                output.push_column(format!("{}_svd{}", pathway.id, k + 1), component)?;
            }
            for &i in &pathway.probeset_indices {
                consumed[i] = true;
            }
        }

        let mut passthrough = 0;
        for (i, id) in table.column_ids().iter().enumerate() {
            if !consumed[i] {
                output.push_column(id.clone(), table.values().row(i))?;
                passthrough += 1;
            }
        }
        info!(
            "Split {}: {} columns in, {} aggregated columns and {} passed through",
            self.split_id(),
            table.n_columns(),
            output.n_columns() - passthrough,
            passthrough
        );
        Ok(output)
    }

    /// Projected components `(k, n_samples)` of one pathway slice, or `None` when
    /// the pathway must stay unaggregated.
    fn project_pathway(
        &mut self,
        pathway: &str,
        slice: ArrayView2<f64>,
        probe_ids: &[String],
        sample_ids: &[String],
    ) -> Result<Option<Array2<f64>>, AggregationError> {
        let endpoint = self.config.endpoint.clone();
        if self.cache.is_table_cached(&endpoint, pathway) {
            let mut cached_ids = Vec::new();
            match self.cache.get_rotation_matrix(&endpoint, pathway, &mut cached_ids) {
                Some(rotation) => return self.project_cached(pathway, slice, probe_ids, rotation, &cached_ids).map(Some),
                None => {
                    warn!("Cached rotation for {} is unreadable; recomputing", pathway);
                    self.cache.delete_rotation(&endpoint, pathway)?;
                }
            }
        }

        let mut mean = ScalingMap::new();
        let mut range = ScalingMap::new();
        let scaled = scale_features(slice, probe_ids, ScalingMode::Training { mean: &mut mean, range: &mut range })
            .map_err(|e| missing_feature(pathway, e))?;

        if self.pca.pca(scaled.view(), probe_ids, sample_ids).is_none() {
            error!(
                "PCA failed for pathway {}; leaving its {} probesets unaggregated",
                pathway,
                probe_ids.len()
            );
            return Ok(None);
        }
        let projected = self.pca.rotate(scaled.view())?;
        if let Some(rotation) = self.pca.rotation() {
            let row_ids = self.pca.rotation_row_names().unwrap_or(probe_ids);
            self.store(&endpoint, pathway, row_ids, rotation, &mean, &range)?;
        }
        Ok(projected)
    }

    fn project_cached(
        &mut self,
        pathway: &str,
        slice: ArrayView2<f64>,
        probe_ids: &[String],
        rotation: Array2<f64>,
        cached_ids: &[String],
    ) -> Result<Array2<f64>, AggregationError> {
        check_identifiers(pathway, cached_ids, probe_ids)?;

        let endpoint = &self.config.endpoint;
        let (mean, range) = match (
            self.cache.load_map(endpoint, pathway, MapKind::Mean),
            self.cache.load_map(endpoint, pathway, MapKind::Range),
        ) {
            (Some(mean), Some(range)) => (mean, range),
            _ => {
                return Err(AggregationError::InconsistentCache {
                    pathway: pathway.to_string(),
                    reason: "rotation is cached without its mean/range maps".to_string(),
                })
            }
        };
        let scaled = scale_features(slice, probe_ids, ScalingMode::Testing { mean: &mean, range: &range })
            .map_err(|e| missing_feature(pathway, e))?;

        debug!("Projecting {} through cached {}x{} rotation", pathway, rotation.nrows(), rotation.ncols());
        self.pca.set_rotation(Some(rotation));
        self.pca
            .rotate(scaled.view())?
            .ok_or_else(|| AggregationError::InconsistentCache {
                pathway: pathway.to_string(),
                reason: "rotation vanished before projection".to_string(),
            })
    }

    /// Persists a fresh rotation and its maps. The maps go first so that a cached
    /// rotation always has them. A concurrent writer that got there first wins;
    /// any other failure removes the partial entry and is logged, leaving the
    /// pathway to be recomputed.
    fn store(
        &self,
        endpoint: &str,
        pathway: &str,
        row_ids: &[String],
        rotation: &Array2<f64>,
        mean: &ScalingMap,
        range: &ScalingMap,
    ) -> Result<(), AggregationError> {
        let result = self
            .cache
            .save_map(endpoint, pathway, MapKind::Mean, mean)
            .and_then(|()| self.cache.save_map(endpoint, pathway, MapKind::Range, range))
            .and_then(|()| self.cache.save_rotation_matrix(endpoint, pathway, row_ids, rotation));
        let err = match result {
            Ok(()) => return Ok(()),
            Err(CacheError::CompoundFile(CompoundFileError::EntryExists { name })) => {
                warn!("{} was cached by another writer first", name);
                return Ok(());
            }
            Err(e) => e,
        };
        if let Err(cleanup) = self.cache.delete_rotation(endpoint, pathway) {
            error!("Could not remove partial cache entry for pathway {}: {}", pathway, cleanup);
        }
        match err {
            CacheError::RotationLengthMismatch { .. } => Err(err.into()),
            _ => {
                error!("Could not cache rotation for pathway {}: {}", pathway, err);
                Ok(())
            }
        }
    }

    /// Averages the rotations every other split cached for `pathway` and stores
    /// the result as this (split-0) aggregator's rotation.
    ///
    /// The element-wise sum `R` (`(k, n_features)`) is re-orthogonalised through
    /// its SVD: with `Rᵀ = P·Σ·Qᵀ`, the averaged rotation is `(P·Qᵀ)ᵀ`.
    /// Returns `Ok(None)`, logging an error, when no split has a rotation.
    pub fn average_rotations(&self, pathway: &str) -> Result<Option<Array2<f64>>, AggregationError> {
        if self.split_id() != 0 {
            return Err(AggregationError::RequiresCompleteSplit { split: self.split_id() });
        }
        let endpoint = &self.config.endpoint;
        let mut sum: Option<Array2<f64>> = None;
        let mut reference_ids: Option<Vec<String>> = None;
        let mut count = 0usize;

        for (path, entries) in self.cache.get_rotation_files(endpoint, pathway) {
            match path.to_str().and_then(split_id_from_compound_filename) {
                Some(0) | None => continue,
                Some(_) => {}
            }
            for entry in entries {
                let mut ids = Vec::new();
                let Some(rotation) = self.cache.get_rotation_matrix_from(&path, &entry, &mut ids) else {
                    continue;
                };
                match &reference_ids {
                    Some(reference) => check_identifiers(pathway, reference, &ids)?,
                    None => reference_ids = Some(ids),
                }
                match &mut sum {
                    Some(total) => {
                        if total.dim() != rotation.dim() {
                            return Err(AggregationError::DimensionMismatch {
                                context: format!("rotation {} in {}", entry, path.display()),
                                expected: format!("{:?}", total.dim()),
                                got: format!("{:?}", rotation.dim()),
                            });
                        }
                        *total += &rotation;
                    }
                    None => sum = Some(rotation),
                }
                count += 1;
            }
        }

        let (Some(total), Some(row_ids)) = (sum, reference_ids) else {
            error!("No per-split rotations found for endpoint {} pathway {}", endpoint, pathway);
            return Ok(None);
        };

        let backend = self.factory.create(self.config.averaging_backend)?;
        let k = total.nrows().min(total.ncols());
        let decomposition = backend.svd_vectors(total.view(), k, k)?;
        for issue in check_svd_output(&decomposition, Some(k)) {
            warn!("Averaging SVD for {}: {:?}", pathway, issue);
        }
        let missing = || SvdError::Failed {
            backend: backend.backend_name(),
            reason: "decomposition returned no singular vectors".to_string(),
        };
        let u = decomposition.u().ok_or_else(missing)?;
        let v = decomposition.v().ok_or_else(missing)?;
        let averaged = v.t().dot(u);

        self.cache.delete_rotation_matrix(endpoint, pathway)?;
        self.cache.save_rotation_matrix(endpoint, pathway, &row_ids, &averaged)?;
        info!(
            "Averaged {} split rotations for {} into a {}x{} rotation",
            count,
            pathway,
            averaged.nrows(),
            averaged.ncols()
        );
        Ok(Some(averaged))
    }

    /// [`Self::average_rotations`] for several pathways in parallel.
    pub fn average_all(&self, pathways: &[String]) -> Vec<(String, Result<Option<Array2<f64>>, AggregationError>)> {
        pathways
            .par_iter()
            .map(|pathway| (pathway.clone(), self.average_rotations(pathway)))
            .collect()
    }
}

fn missing_feature(pathway: &str, e: MissingFeature) -> AggregationError {
    AggregationError::InconsistentCache {
        pathway: pathway.to_string(),
        reason: format!("feature '{}' missing from the {} map", e.feature, e.map),
    }
}

/// Cached and current feature ids must agree position by position.
fn check_identifiers(pathway: &str, cached: &[String], current: &[String]) -> Result<(), AggregationError> {
    let positions = cached.len().max(current.len());
    for position in 0..positions {
        let c = cached.get(position);
        let s = current.get(position);
        if c != s {
            return Err(AggregationError::IdentifierMismatch {
                pathway: pathway.to_string(),
                position,
                cached: c.cloned().unwrap_or_default(),
                current: s.cloned().unwrap_or_default(),
            });
        }
    }
    Ok(())
}
