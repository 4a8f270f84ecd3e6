use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use ndarray::{ArrayD, ArrayViewD, Axis};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{EngineError, EngineResult},
    tensor::label_indices,
};

/// Structural family of a dataset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DatasetType {
    /// Rows of features, `[n, features]`.
    Tabular,
    /// Time series, `[n, steps, features]`.
    Sequence,
    /// Images, `[n, h, w]` or `[n, h, w, c]`.
    Image,
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tabular => "tabular",
            Self::Sequence => "sequence",
            Self::Image => "image",
        })
    }
}

/// Label encoding of the `y` tensors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LabelFormat {
    /// One probability column per class.
    OneHot,
    /// One class index per sample.
    Sparse,
    /// Not declared.
    #[default]
    Unknown,
}

impl fmt::Display for LabelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OneHot => "one_hot",
            Self::Sparse => "sparse",
            Self::Unknown => "unknown",
        })
    }
}

/// Which held-out split an evaluation runs against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    /// Test split.
    #[default]
    Test,
    /// Validation split.
    Val,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Test => "test",
            Self::Val => "val",
        })
    }
}

/// Summary the dataset provider publishes alongside its tensors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetStats {
    /// Structural family.
    pub dataset_type: DatasetType,
    /// Feature count (columns, per-step features, or pixels × channels).
    pub features: usize,
    /// Class count.
    pub classes: usize,
    /// Label encoding.
    pub label_format: LabelFormat,
    /// Per-sample input shape.
    pub input_shape: Vec<usize>,
    /// Training rows.
    pub train_size: usize,
    /// Test rows.
    pub test_size: usize,
    /// Validation rows.
    pub val_size: usize,
}

/// Features and labels for one split; both carry samples on axis 0.
#[derive(Debug, Clone)]
pub struct TensorPair {
    /// Feature tensor.
    pub x: ArrayD<f32>,
    /// Label tensor (rank 2 one-hot or rank 1 sparse).
    pub y: ArrayD<f32>,
}

impl TensorPair {
    /// Pairs features and labels, checking the sample axis lines up.
    pub fn new(x: ArrayD<f32>, y: ArrayD<f32>) -> EngineResult<Self> {
        if x.ndim() == 0 || y.ndim() == 0 {
            return Err(EngineError::invalid("tensors need a sample axis"));
        }
        if x.len_of(Axis(0)) != y.len_of(Axis(0)) {
            return Err(EngineError::invalid(format!(
                "x has {} samples, y has {}",
                x.len_of(Axis(0)),
                y.len_of(Axis(0))
            )));
        }
        Ok(Self { x, y })
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.x.len_of(Axis(0))
    }

    /// Whether the split holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrowed feature view.
    #[must_use]
    pub fn x(&self) -> ArrayViewD<'_, f32> {
        self.x.view()
    }

    /// Borrowed label view.
    #[must_use]
    pub fn y(&self) -> ArrayViewD<'_, f32> {
        self.y.view()
    }
}

/// Already-split tensors for one dataset plus the stats used for fingerprinting.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    /// Dataset identifier.
    pub dataset_id: String,
    /// Published stats.
    pub stats: DatasetStats,
    /// SHA-256 over every tensor's shape and values; changes whenever the data does.
    pub revision: String,
    /// Training split.
    pub train: Option<TensorPair>,
    /// Test split.
    pub test: Option<TensorPair>,
    /// Validation split.
    pub val: Option<TensorPair>,
}

impl DatasetSplits {
    /// Builds splits and derives stats from the tensors themselves.
    pub fn from_tensors(
        dataset_id: impl Into<String>,
        dataset_type: DatasetType,
        train: TensorPair,
        test: Option<TensorPair>,
        val: Option<TensorPair>,
    ) -> EngineResult<Self> {
        let stats = infer_stats(dataset_type, &train, test.as_ref(), val.as_ref())?;
        let revision = content_revision([Some(&train), test.as_ref(), val.as_ref()]);
        Ok(Self {
            dataset_id: dataset_id.into(),
            stats,
            revision,
            train: Some(train),
            test,
            val,
        })
    }

    /// Training tensors or `DatasetNotLoaded`.
    pub fn train(&self) -> EngineResult<&TensorPair> {
        self.train
            .as_ref()
            .filter(|pair| !pair.is_empty())
            .ok_or_else(|| self.not_loaded("train tensors missing"))
    }

    /// Held-out tensors for `split` or `DatasetNotLoaded`.
    pub fn split(&self, split: Split) -> EngineResult<&TensorPair> {
        let pair = match split {
            Split::Test => self.test.as_ref(),
            Split::Val => self.val.as_ref(),
        };
        pair.filter(|pair| !pair.is_empty())
            .ok_or_else(|| self.not_loaded(&format!("{split} tensors missing")))
    }

    fn not_loaded(&self, detail: &str) -> EngineError {
        EngineError::DatasetNotLoaded {
            dataset_id: self.dataset_id.clone(),
            detail: detail.into(),
        }
    }
}

fn content_revision(splits: [Option<&TensorPair>; 3]) -> String {
    let mut hasher = Sha256::new();
    for (tag, pair) in ["train", "test", "val"].into_iter().zip(splits) {
        hasher.update(tag.as_bytes());
        let Some(pair) = pair else {
            hasher.update([0_u8]);
            continue;
        };
        for tensor in [&pair.x, &pair.y] {
            for dim in tensor.shape() {
                hasher.update((*dim as u64).to_le_bytes());
            }
            let bytes: Vec<u8> = tensor.iter().flat_map(|value| value.to_le_bytes()).collect();
            hasher.update(&bytes);
        }
    }
    format!("{:x}", hasher.finalize())
}

fn infer_stats(
    dataset_type: DatasetType,
    train: &TensorPair,
    test: Option<&TensorPair>,
    val: Option<&TensorPair>,
) -> EngineResult<DatasetStats> {
    let shape = train.x.shape();
    let input_shape = shape[1..].to_vec();
    let features = match (dataset_type, input_shape.as_slice()) {
        (DatasetType::Tabular, [features]) | (DatasetType::Sequence, [_, features]) => *features,
        (DatasetType::Image, [h, w]) => h * w,
        (DatasetType::Image, [h, w, c]) => h * w * c,
        (kind, _) => {
            return Err(EngineError::rank(
                &format!("{kind} features"),
                match kind {
                    DatasetType::Tabular => "2",
                    DatasetType::Sequence => "3",
                    DatasetType::Image => "3 or 4",
                },
                shape.len(),
            ))
        }
    };
    let (label_format, classes) = if train.y.ndim() == 2 {
        (LabelFormat::OneHot, train.y.len_of(Axis(1)))
    } else {
        let max = label_indices(&train.y())?.into_iter().max().unwrap_or(0);
        (LabelFormat::Sparse, max + 1)
    };
    Ok(DatasetStats {
        dataset_type,
        features,
        classes,
        label_format,
        input_shape,
        train_size: train.len(),
        test_size: test.map_or(0, TensorPair::len),
        val_size: val.map_or(0, TensorPair::len),
    })
}

/// Supplies materialized tensors by dataset id.
pub trait DatasetProvider: Send + Sync {
    /// Resolves the dataset or fails with `DatasetNotLoaded`.
    fn dataset(&self, dataset_id: &str) -> EngineResult<Arc<DatasetSplits>>;
}

/// Provider backed by an in-process map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatasetProvider {
    inner: Arc<RwLock<IndexMap<String, Arc<DatasetSplits>>>>,
}

impl InMemoryDatasetProvider {
    /// Registers or replaces a dataset.
    pub fn insert(&self, splits: DatasetSplits) {
        self.inner
            .write()
            .insert(splits.dataset_id.clone(), Arc::new(splits));
    }

    /// Drops a dataset, returning whether it existed.
    pub fn remove(&self, dataset_id: &str) -> bool {
        self.inner.write().shift_remove(dataset_id).is_some()
    }

    /// Registered dataset ids in insertion order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}

impl DatasetProvider for InMemoryDatasetProvider {
    fn dataset(&self, dataset_id: &str) -> EngineResult<Arc<DatasetSplits>> {
        self.inner
            .read()
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| EngineError::DatasetNotLoaded {
                dataset_id: dataset_id.into(),
                detail: "no tensors registered".into(),
            })
    }
}
