//! Per-feature mean/range scaling with explicit training and testing modes.

use log::trace;
use ndarray::{Array2, ArrayView2, ArrayViewMut1, Axis};
use std::collections::BTreeMap;

/// Feature id to scalar (mean or range).
pub type ScalingMap = BTreeMap<String, f64>;

const MIN_RANGE: f64 = 1e-12;

/// Where the scaling statistics come from.
#[derive(Debug)]
pub enum ScalingMode<'a> {
    /// Observe mean and range per feature, record them, then scale.
    Training {
        mean: &'a mut ScalingMap,
        range: &'a mut ScalingMap,
    },
    /// Scale with previously recorded statistics.
    Testing {
        mean: &'a ScalingMap,
        range: &'a ScalingMap,
    },
}

/// Returned when testing-mode maps lack a feature of the slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingFeature {
    pub feature: String,
    pub map: &'static str,
}

/// Mean and max - min of one feature's values.
fn observe(values: &ArrayViewMut1<f64>) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.sum() / values.len() as f64;
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
    (mean, max - min)
}

/// Scales `slice` (shape `(n_features, n_samples)`) to `(x - mean) / range`,
/// one feature id per first-axis index.
///
/// Ranges below `1e-12` (constant features) divide by 1.
pub fn scale_features(
    slice: ArrayView2<f64>,
    feature_ids: &[String],
    mut mode: ScalingMode<'_>,
) -> Result<Array2<f64>, MissingFeature> {
    debug_assert_eq!(slice.nrows(), feature_ids.len());
    let mut scaled = slice.to_owned();
    for (mut values, id) in scaled.axis_iter_mut(Axis(0)).zip(feature_ids) {
        let (mean, range) = match &mut mode {
            ScalingMode::Training { mean, range } => {
                let (m, r) = observe(&values);
                trace!("feature {}: mean={} range={}", id, m, r);
                mean.insert(id.clone(), m);
                range.insert(id.clone(), r);
                (m, r)
            }
            ScalingMode::Testing { mean, range } => {
                let m = mean
                    .get(id)
                    .copied()
                    .ok_or_else(|| MissingFeature { feature: id.clone(), map: "mean" })?;
                let r = range
                    .get(id)
                    .copied()
                    .ok_or_else(|| MissingFeature { feature: id.clone(), map: "range" })?;
                (m, r)
            }
        };
        let divisor = if range.abs() < MIN_RANGE { 1.0 } else { range };
        values.mapv_inplace(|x| (x - mean) / divisor);
    }
    Ok(scaled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use ndarray::array;

    fn ids() -> Vec<String> {
        vec!["g1".to_string(), "g2".to_string()]
    }

    #[test]
    fn training_records_statistics_and_testing_reuses_them() {
        let train = array![[1.0, 2.0, 3.0], [5.0, 5.0, 5.0]];
        let mut mean = ScalingMap::new();
        let mut range = ScalingMap::new();
        let scaled = scale_features(
            train.view(),
            &ids(),
            ScalingMode::Training { mean: &mut mean, range: &mut range },
        )
        .unwrap();
        assert!(approx_eq!(f64, mean["g1"], 2.0, ulps = 2));
        assert!(approx_eq!(f64, range["g1"], 2.0, ulps = 2));
        assert_eq!(range["g2"], 0.0);
        assert_eq!(scaled, array![[-0.5, 0.0, 0.5], [0.0, 0.0, 0.0]]);

        // Test data is scaled with the training statistics, not its own.
        let test = array![[4.0], [6.0]];
        let scaled = scale_features(test.view(), &ids(), ScalingMode::Testing { mean: &mean, range: &range }).unwrap();
        assert_eq!(scaled, array![[1.0], [1.0]]);
    }

    #[test]
    fn testing_mode_requires_every_feature() {
        let mean: ScalingMap = [("g1".to_string(), 0.0)].into_iter().collect();
        let range = mean.clone();
        let err = scale_features(
            array![[1.0], [2.0]].view(),
            &ids(),
            ScalingMode::Testing { mean: &mean, range: &range },
        )
        .unwrap_err();
        assert_eq!(err, MissingFeature { feature: "g2".to_string(), map: "mean" });
    }
}
