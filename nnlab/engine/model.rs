//! Model runtime seam and the model registry collaborator.

use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::{Array2, ArrayViewD};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    dataset::LabelFormat,
    error::{EngineError, EngineResult},
    fingerprint::FingerprintPolicy,
    tensor::Predictor,
};

/// Loss/optimizer settings captured when the model was built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompileConfig {
    /// Optimizer name (e.g. `adam`, `sgd`).
    pub optimizer: String,
    /// Base learning rate.
    pub learning_rate: f32,
    /// Loss function name.
    pub loss_kind: String,
    /// Label encoding the loss expects.
    pub label_format: LabelFormat,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            optimizer: "sgd".into(),
            learning_rate: 0.01,
            loss_kind: "categorical_crossentropy".into(),
            label_format: LabelFormat::OneHot,
        }
    }
}

/// Registry entry describing a built model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelRecord {
    /// Model identifier.
    pub model_id: String,
    /// Architecture label.
    pub architecture: String,
    /// Per-sample input shape.
    pub input_shape: Vec<usize>,
    /// Output classes.
    pub num_classes: usize,
    /// Dataset expectations captured at build time.
    pub expected_fingerprint: FingerprintPolicy,
    /// Compile settings.
    pub compile: CompileConfig,
}

/// Metrics reported at the end of an epoch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct EpochMetrics {
    /// Training loss.
    pub loss: f32,
    /// Training accuracy.
    pub acc: f32,
    /// Validation loss, when a validation set was used.
    pub val_loss: Option<f32>,
    /// Validation accuracy, when a validation set was used.
    pub val_acc: Option<f32>,
}

/// Per-epoch metric arrays returned by a fit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TrainingHistory {
    /// Loss per epoch.
    pub loss: Vec<f32>,
    /// Accuracy per epoch.
    pub accuracy: Vec<f32>,
    /// Validation loss per epoch (empty without validation).
    pub val_loss: Vec<f32>,
    /// Validation accuracy per epoch (empty without validation).
    pub val_accuracy: Vec<f32>,
}

impl TrainingHistory {
    /// Appends one epoch's metrics.
    pub fn record(&mut self, metrics: &EpochMetrics) {
        self.loss.push(metrics.loss);
        self.accuracy.push(metrics.acc);
        if let Some(val_loss) = metrics.val_loss {
            self.val_loss.push(val_loss);
        }
        if let Some(val_acc) = metrics.val_acc {
            self.val_accuracy.push(val_acc);
        }
    }

    /// Number of recorded epochs.
    #[must_use]
    pub fn epochs(&self) -> usize {
        self.loss.len()
    }

    /// First epoch (1-based) whose loss is NaN or infinite.
    #[must_use]
    pub fn first_non_finite_loss(&self) -> Option<usize> {
        let non_finite = |losses: &[f32]| losses.iter().position(|loss| !loss.is_finite());
        non_finite(&self.loss)
            .or_else(|| non_finite(&self.val_loss))
            .map(|idx| idx + 1)
    }
}

/// Held-out data used during fit.
#[derive(Debug, Clone)]
pub enum ValidationData<'a> {
    /// No validation.
    None,
    /// Let the runtime carve off this fraction of the training rows.
    Split(f32),
    /// Explicit validation tensors.
    Data {
        /// Features.
        x: ArrayViewD<'a, f32>,
        /// Labels.
        y: ArrayViewD<'a, f32>,
    },
}

/// Options forwarded to [`TrainableModel::fit`].
#[derive(Debug, Clone)]
pub struct FitOptions<'a> {
    /// Epochs to run.
    pub epochs: usize,
    /// Mini-batch size.
    pub batch_size: usize,
    /// Learning rate override.
    pub learning_rate: Option<f32>,
    /// Validation source.
    pub validation: ValidationData<'a>,
}

/// Epoch-end hook: receives the zero-based epoch index and its metrics.
pub type EpochCallback<'a> = dyn FnMut(usize, &EpochMetrics) + 'a;

/// Trainable model supplied by the external tensor runtime.
pub trait TrainableModel: Send {
    /// Runs the fit loop, invoking `on_epoch_end` after every epoch.
    fn fit(
        &mut self,
        x: ArrayViewD<'_, f32>,
        y: ArrayViewD<'_, f32>,
        options: &FitOptions<'_>,
        on_epoch_end: &mut EpochCallback<'_>,
    ) -> anyhow::Result<TrainingHistory>;

    /// Class probabilities `[n, classes]`.
    fn predict(&self, x: ArrayViewD<'_, f32>) -> anyhow::Result<Array2<f32>>;

    /// `(loss, accuracy)` over the given tensors.
    fn evaluate(&self, x: ArrayViewD<'_, f32>, y: ArrayViewD<'_, f32>)
        -> anyhow::Result<(f32, f32)>;

    /// Kernel of the first dense layer `[inputs, units]`, when the model has one.
    fn dense_kernel(&self) -> Option<Array2<f32>> {
        None
    }

    /// Short architecture description for logs.
    fn summary(&self) -> String {
        "model".into()
    }
}

/// Borrowing adapter so a trainable model can feed the metrics engine.
pub struct ModelPredictor<'a>(pub &'a dyn TrainableModel);

impl Predictor for ModelPredictor<'_> {
    fn predict(&self, x: ArrayViewD<'_, f32>) -> anyhow::Result<Array2<f32>> {
        self.0.predict(x)
    }
}

/// Trainable object shared between the orchestrator worker and evaluators.
pub type SharedModel = Arc<Mutex<Box<dyn TrainableModel>>>;

/// Resolves model records and materializes their trainable objects.
pub trait ModelRegistry: Send + Sync {
    /// Record for the id, if registered.
    fn record(&self, model_id: &str) -> Option<ModelRecord>;

    /// Trainable object for the id.
    fn materialize(&self, model_id: &str) -> EngineResult<SharedModel>;
}

#[derive(Clone)]
struct RegistryEntry {
    record: ModelRecord,
    model: SharedModel,
}

/// Registry keeping records and models in process.
#[derive(Clone, Default)]
pub struct InMemoryModelRegistry {
    inner: Arc<RwLock<IndexMap<String, RegistryEntry>>>,
}

impl std::fmt::Debug for InMemoryModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryModelRegistry")
            .field("models", &self.ids())
            .finish()
    }
}

impl InMemoryModelRegistry {
    /// Registers or replaces a model.
    pub fn register(&self, record: ModelRecord, model: Box<dyn TrainableModel>) {
        self.inner.write().insert(
            record.model_id.clone(),
            RegistryEntry {
                record,
                model: Arc::new(Mutex::new(model)),
            },
        );
    }

    /// Registered ids in insertion order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}

impl ModelRegistry for InMemoryModelRegistry {
    fn record(&self, model_id: &str) -> Option<ModelRecord> {
        self.inner
            .read()
            .get(model_id)
            .map(|entry| entry.record.clone())
    }

    fn materialize(&self, model_id: &str) -> EngineResult<SharedModel> {
        self.inner
            .read()
            .get(model_id)
            .map(|entry| Arc::clone(&entry.model))
            .ok_or_else(|| EngineError::ModelNotFound {
                model_id: model_id.into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_records_optional_validation() {
        let mut history = TrainingHistory::default();
        history.record(&EpochMetrics {
            loss: 0.9,
            acc: 0.5,
            val_loss: None,
            val_acc: None,
        });
        history.record(&EpochMetrics {
            loss: 0.4,
            acc: 0.8,
            val_loss: Some(0.5),
            val_acc: Some(0.7),
        });
        assert_eq!(history.epochs(), 2);
        assert_eq!(history.val_loss, vec![0.5]);
        assert_eq!(history.first_non_finite_loss(), None);
    }

    #[test]
    fn detects_nan_loss_epoch() {
        let history = TrainingHistory {
            loss: vec![0.7, f32::NAN, 0.2],
            ..TrainingHistory::default()
        };
        assert_eq!(history.first_non_finite_loss(), Some(2));
    }

    #[test]
    fn registry_reports_missing_models() {
        let registry = InMemoryModelRegistry::default();
        assert!(registry.record("ghost").is_none());
        let err = registry.materialize("ghost").err().unwrap();
        assert_eq!(err.kind(), "model_not_found");
    }
}
