use std::fmt;

use ndarray::{ArrayD, ArrayView2, ArrayViewD, Axis, Slice};
use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    dataset::DatasetType,
    error::{EngineError, EngineResult},
    tensor::{accuracy, head, predict_batched, score, Predictor},
};

/// How importance scores were obtained.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ImportanceMethod {
    /// Accuracy drop after shuffling one feature across samples.
    Permutation,
    /// Accuracy drop after zeroing one image patch.
    Occlusion,
    /// L1 norm of the first dense kernel's rows.
    DenseWeights,
}

impl fmt::Display for ImportanceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Permutation => "permutation",
            Self::Occlusion => "occlusion",
            Self::DenseWeights => "dense_weights",
        })
    }
}

/// One ranked feature (or image patch).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureScore {
    /// Feature or patch index.
    pub index: usize,
    /// Display name.
    pub name: String,
    /// Normalized importance in `[0, 1]`.
    pub importance: f64,
}

/// Ranked feature importance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureImportanceReport {
    /// Scoring method.
    pub method: ImportanceMethod,
    /// Unperturbed accuracy; absent for weight-based scores.
    pub baseline_accuracy: Option<f64>,
    /// Features (or patches) scored before truncation.
    pub total_features: usize,
    /// Requested cut-off.
    pub top_k: usize,
    /// Highest first, ties by index.
    pub features: Vec<FeatureScore>,
}

/// Knobs for [`compute_feature_importance`].
#[derive(Debug, Clone, PartialEq)]
pub struct ImportanceOptions {
    /// Picks permutation (tabular, sequence) or occlusion (image).
    pub dataset_type: DatasetType,
    /// Features kept in the report.
    pub top_k: usize,
    /// Leading rows used.
    pub max_samples: Option<usize>,
    /// Rows per predict call.
    pub batch_size: usize,
    /// Occlusion grid side, clamped to the image size.
    pub grid: usize,
    /// Permutation RNG seed.
    pub seed: u64,
    /// Feature names; defaults to `feature_{index}`.
    pub feature_names: Option<Vec<String>>,
}

impl Default for ImportanceOptions {
    fn default() -> Self {
        Self {
            dataset_type: DatasetType::Tabular,
            top_k: 10,
            max_samples: Some(500),
            batch_size: 256,
            grid: 6,
            seed: 42,
            feature_names: None,
        }
    }
}

/// Scores every feature by the accuracy lost when it is perturbed.
pub fn compute_feature_importance<P>(
    predictor: &P,
    x: &ArrayViewD<'_, f32>,
    y: &ArrayViewD<'_, f32>,
    options: &ImportanceOptions,
) -> EngineResult<FeatureImportanceReport>
where
    P: Predictor + ?Sized,
{
    let rank = x.ndim();
    let method = match (options.dataset_type, rank) {
        (DatasetType::Tabular, 2) | (DatasetType::Sequence, 3) => ImportanceMethod::Permutation,
        (DatasetType::Image, 3 | 4) => ImportanceMethod::Occlusion,
        (DatasetType::Tabular, _) => {
            return Err(EngineError::rank("tabular importance", "2", rank))
        }
        (DatasetType::Sequence, _) => {
            return Err(EngineError::rank("sequence importance", "3", rank))
        }
        (DatasetType::Image, _) => {
            return Err(EngineError::rank("image occlusion", "3 or 4", rank))
        }
    };

    let scored = score(predictor, x, y, options.max_samples, options.batch_size)?;
    let baseline = accuracy(&scored.probabilities, &scored.labels);
    let mut work: ArrayD<f32> = head(x, options.max_samples).to_owned();

    let (drops, names) = match method {
        ImportanceMethod::Permutation => {
            let drops = permutation_drops(predictor, &mut work, &scored.labels, baseline, options)?;
            let names = feature_names(options.feature_names.as_deref(), drops.len());
            (drops, names)
        }
        _ => occlusion_drops(predictor, &mut work, &scored.labels, baseline, options)?,
    };

    Ok(rank_features(
        method,
        Some(baseline),
        &drops,
        names,
        options.top_k,
    ))
}

fn permutation_drops<P>(
    predictor: &P,
    work: &mut ArrayD<f32>,
    labels: &[usize],
    baseline: f64,
    options: &ImportanceOptions,
) -> EngineResult<Vec<f64>>
where
    P: Predictor + ?Sized,
{
    let feature_axis = Axis(work.ndim() - 1);
    let samples = work.len_of(Axis(0));
    let mut rng = SmallRng::seed_from_u64(options.seed);
    let mut order: Vec<usize> = (0..samples).collect();
    let mut drops = Vec::with_capacity(work.len_of(feature_axis));

    for feature in 0..work.len_of(feature_axis) {
        let original = work.index_axis(feature_axis, feature).to_owned();
        order.shuffle(&mut rng);
        {
            let mut lane = work.index_axis_mut(feature_axis, feature);
            for (dst, src) in order.iter().enumerate() {
                lane.index_axis_mut(Axis(0), dst)
                    .assign(&original.index_axis(Axis(0), *src));
            }
        }
        let probabilities = predict_batched(predictor, &work.view(), options.batch_size)?;
        drops.push((baseline - accuracy(&probabilities, labels)).max(0.0));
        work.index_axis_mut(feature_axis, feature).assign(&original);
    }
    Ok(drops)
}

fn patch_bounds(extent: usize, cells: usize, index: usize) -> Slice {
    let start = index * extent / cells;
    let end = (index + 1) * extent / cells;
    Slice::from(start..end)
}

fn occlusion_drops<P>(
    predictor: &P,
    work: &mut ArrayD<f32>,
    labels: &[usize],
    baseline: f64,
    options: &ImportanceOptions,
) -> EngineResult<(Vec<f64>, Vec<String>)>
where
    P: Predictor + ?Sized,
{
    let height = work.len_of(Axis(1));
    let width = work.len_of(Axis(2));
    let rows = options.grid.max(1).min(height.max(1));
    let cols = options.grid.max(1).min(width.max(1));
    let mut drops = Vec::with_capacity(rows * cols);
    let mut names = Vec::with_capacity(rows * cols);

    for row in 0..rows {
        for col in 0..cols {
            let mut patch = work.view_mut();
            patch.slice_axis_inplace(Axis(1), patch_bounds(height, rows, row));
            patch.slice_axis_inplace(Axis(2), patch_bounds(width, cols, col));
            let original = patch.to_owned();
            patch.fill(0.0);

            let probabilities = predict_batched(predictor, &work.view(), options.batch_size);

            let mut patch = work.view_mut();
            patch.slice_axis_inplace(Axis(1), patch_bounds(height, rows, row));
            patch.slice_axis_inplace(Axis(2), patch_bounds(width, cols, col));
            patch.assign(&original);

            drops.push((baseline - accuracy(&probabilities?, labels)).max(0.0));
            names.push(format!("patch_{row}_{col}"));
        }
    }
    Ok((drops, names))
}

fn feature_names(names: Option<&[String]>, count: usize) -> Vec<String> {
    (0..count)
        .map(|idx| {
            names
                .and_then(|names| names.get(idx))
                .cloned()
                .unwrap_or_else(|| format!("feature_{idx}"))
        })
        .collect()
}

fn rank_features(
    method: ImportanceMethod,
    baseline_accuracy: Option<f64>,
    raw: &[f64],
    names: Vec<String>,
    top_k: usize,
) -> FeatureImportanceReport {
    let peak = raw.iter().copied().fold(0.0_f64, f64::max);
    let mut features: Vec<FeatureScore> = raw
        .iter()
        .zip(names)
        .enumerate()
        .map(|(index, (value, name))| FeatureScore {
            index,
            name,
            importance: if peak > 0.0 {
                (value / peak).clamp(0.0, 1.0)
            } else {
                0.0
            },
        })
        .collect();
    features.sort_by(|a, b| {
        b.importance
            .total_cmp(&a.importance)
            .then(a.index.cmp(&b.index))
    });
    features.truncate(top_k);
    FeatureImportanceReport {
        method,
        baseline_accuracy,
        total_features: raw.len(),
        top_k,
        features,
    }
}

/// Ranks input features by the L1 norm of their row in a dense kernel `[inputs, units]`.
#[must_use]
pub fn dense_weight_importance(
    kernel: ArrayView2<'_, f32>,
    names: Option<&[String]>,
    top_k: usize,
) -> FeatureImportanceReport {
    let norms: Vec<f64> = kernel
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|w| f64::from(w.abs())).sum())
        .collect();
    let names = feature_names(names, norms.len());
    rank_features(ImportanceMethod::DenseWeights, None, &norms, names, top_k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, IxDyn};

    /// Classifies on the sign of column 0 only.
    fn first_column(x: ArrayViewD<'_, f32>) -> anyhow::Result<Array2<f32>> {
        let rows = x.len_of(Axis(0));
        let flat = x.to_shape((rows, x.len() / rows.max(1)))?;
        Ok(Array2::from_shape_fn((rows, 2), |(row, col)| {
            let positive = flat[[row, 0]] > 0.0;
            if positive == (col == 1) {
                0.9
            } else {
                0.1
            }
        }))
    }

    fn tabular(rows: usize) -> (ArrayD<f32>, ArrayD<f32>) {
        let x = ArrayD::from_shape_fn(IxDyn(&[rows, 3]), |idx| {
            let sign = if idx[0] % 2 == 0 { -1.0 } else { 1.0 };
            #[allow(clippy::cast_precision_loss)]
            let noise = (idx[0] * 7 + idx[1]) as f32 * 0.01;
            if idx[1] == 0 {
                sign
            } else {
                noise
            }
        });
        #[allow(clippy::cast_precision_loss)]
        let y = ArrayD::from_shape_fn(IxDyn(&[rows]), |idx| (idx[0] % 2) as f32);
        (x, y)
    }

    #[test]
    fn informative_feature_ranks_first() {
        let (x, y) = tabular(40);
        let options = ImportanceOptions {
            top_k: 2,
            ..ImportanceOptions::default()
        };
        let report = compute_feature_importance(&first_column, &x.view(), &y.view(), &options)
            .unwrap();
        assert_eq!(report.method, ImportanceMethod::Permutation);
        assert_eq!(report.baseline_accuracy, Some(1.0));
        assert_eq!(report.total_features, 3);
        assert_eq!(report.features.len(), 2);
        assert_eq!(report.features[0].index, 0);
        assert_eq!(report.features[0].name, "feature_0");
        assert!((report.features[0].importance - 1.0).abs() < 1e-12);
        assert!(report.features[1].importance.abs() < 1e-12);
    }

    #[test]
    fn same_seed_gives_same_report() {
        let (x, y) = tabular(30);
        let options = ImportanceOptions::default();
        let a = compute_feature_importance(&first_column, &x.view(), &y.view(), &options).unwrap();
        let b = compute_feature_importance(&first_column, &x.view(), &y.view(), &options).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn uninformative_model_scores_all_zero() {
        let (x, y) = tabular(10);
        fn constant(x: ArrayViewD<'_, f32>) -> anyhow::Result<Array2<f32>> {
            Ok(Array2::from_elem((x.len_of(Axis(0)), 2), 0.5))
        }
        let options = ImportanceOptions::default();
        let report = compute_feature_importance(&constant, &x.view(), &y.view(), &options).unwrap();
        assert!(report.features.iter().all(|f| f.importance == 0.0));
        assert_eq!(report.features.len(), 3);
        assert_eq!(
            report.features.iter().map(|f| f.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn image_occlusion_flags_the_informative_patch() {
        // Top-left pixel decides the class; everything else is zero.
        let rows = 8;
        let x = ArrayD::from_shape_fn(IxDyn(&[rows, 4, 4]), |idx| {
            if idx[1] == 0 && idx[2] == 0 {
                if idx[0] % 2 == 0 {
                    -1.0
                } else {
                    1.0
                }
            } else {
                0.0
            }
        });
        #[allow(clippy::cast_precision_loss)]
        let y = ArrayD::from_shape_fn(IxDyn(&[rows]), |idx| (idx[0] % 2) as f32);
        let options = ImportanceOptions {
            dataset_type: DatasetType::Image,
            grid: 10,
            top_k: 100,
            ..ImportanceOptions::default()
        };
        let report =
            compute_feature_importance(&first_column, &x.view(), &y.view(), &options).unwrap();
        assert_eq!(report.method, ImportanceMethod::Occlusion);
        // Grid is clamped to the 4x4 image.
        assert_eq!(report.total_features, 16);
        assert_eq!(report.features[0].name, "patch_0_0");
        assert!((report.features[0].importance - 1.0).abs() < 1e-12);
    }

    #[test]
    fn sequence_lanes_are_permuted_per_feature() {
        // First feature of the first step decides the class.
        let rows = 40;
        let x = ArrayD::from_shape_fn(IxDyn(&[rows, 3, 2]), |idx| {
            let sign = if idx[0] % 2 == 0 { -1.0 } else { 1.0 };
            if idx[2] == 0 {
                sign
            } else {
                0.3
            }
        });
        #[allow(clippy::cast_precision_loss)]
        let y = ArrayD::from_shape_fn(IxDyn(&[rows]), |idx| (idx[0] % 2) as f32);
        let options = ImportanceOptions {
            dataset_type: DatasetType::Sequence,
            ..ImportanceOptions::default()
        };
        let report =
            compute_feature_importance(&first_column, &x.view(), &y.view(), &options).unwrap();
        assert_eq!(report.method, ImportanceMethod::Permutation);
        assert_eq!(report.total_features, 2);
        assert_eq!(report.features[0].name, "feature_0");
        assert!((report.features[0].importance - 1.0).abs() < 1e-12);
        assert_eq!(report.features[1].name, "feature_1");
        assert!(report.features[1].importance.abs() < 1e-12);
    }

    #[test]
    fn channel_images_are_occluded_by_patch() {
        let rows = 8;
        let x = ArrayD::from_shape_fn(IxDyn(&[rows, 4, 4, 1]), |idx| {
            if idx[1] == 0 && idx[2] == 0 {
                if idx[0] % 2 == 0 {
                    -1.0
                } else {
                    1.0
                }
            } else {
                0.0
            }
        });
        #[allow(clippy::cast_precision_loss)]
        let y = ArrayD::from_shape_fn(IxDyn(&[rows]), |idx| (idx[0] % 2) as f32);
        let options = ImportanceOptions {
            dataset_type: DatasetType::Image,
            grid: 2,
            ..ImportanceOptions::default()
        };
        let report =
            compute_feature_importance(&first_column, &x.view(), &y.view(), &options).unwrap();
        assert_eq!(report.method, ImportanceMethod::Occlusion);
        assert_eq!(report.total_features, 4);
        assert_eq!(report.features[0].name, "patch_0_0");
        assert!((report.features[0].importance - 1.0).abs() < 1e-12);
        assert!(report.features[1..].iter().all(|f| f.importance == 0.0));
    }

    #[test]
    fn unexpected_rank_is_rejected() {
        let x = ArrayD::<f32>::zeros(IxDyn(&[4, 2, 2, 2, 2]));
        let y = ArrayD::<f32>::zeros(IxDyn(&[4]));
        let options = ImportanceOptions {
            dataset_type: DatasetType::Image,
            ..ImportanceOptions::default()
        };
        let err = compute_feature_importance(&first_column, &x.view(), &y.view(), &options)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedTensorRank { actual: 5, .. }));
    }

    #[test]
    fn dense_weights_normalize_row_norms() {
        let kernel = array![[0.5_f32, -0.5], [2.0, 0.0], [0.0, 0.0]];
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let report = dense_weight_importance(kernel.view(), Some(&names), 2);
        assert_eq!(report.method, ImportanceMethod::DenseWeights);
        assert_eq!(report.baseline_accuracy, None);
        assert_eq!(report.total_features, 3);
        assert_eq!(report.features.len(), 2);
        assert_eq!(report.features[0].name, "b");
        assert!((report.features[0].importance - 1.0).abs() < 1e-12);
        assert!((report.features[1].importance - 0.5).abs() < 1e-12);
    }
}
