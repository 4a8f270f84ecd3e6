//! Model-id keyed evaluation: confusion matrix, ROC and feature importance,
//! each behind a fresh compatibility check.

use std::{collections::HashMap, sync::Arc};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use shared_logging::LogLevel;

use crate::{
    config::EngineConfig,
    dataset::{DatasetProvider, DatasetSplits, Split},
    error::{EngineError, EngineResult, Purpose},
    fingerprint::{assert_compatible, build_fingerprint},
    metrics::{
        compute_confusion_matrix, compute_feature_importance, compute_roc_micro,
        dense_weight_importance, EvaluationResult, FeatureImportanceReport, ImportanceOptions,
        RocCurve,
    },
    model::{ModelPredictor, ModelRecord, ModelRegistry},
    telemetry::{self, EngineTelemetry},
};

/// Model id, dataset id, split and dataset revision.
type CacheKey = (String, String, Split, String);

#[derive(Debug, Default)]
struct CacheState {
    entries: IndexMap<CacheKey, EvaluationResult>,
    /// Bumped on every invalidation of a model.
    generations: HashMap<String, u64>,
}

/// Evaluation results keyed by model, dataset, split and dataset revision.
///
/// Writers read [`EvaluationCache::generation`] before computing and hand it
/// back to [`EvaluationCache::insert`], so a result computed against weights
/// that have since been retrained is never stored.
#[derive(Debug, Clone, Default)]
pub struct EvaluationCache {
    state: Arc<RwLock<CacheState>>,
}

impl EvaluationCache {
    /// Cached result for the key, if any.
    #[must_use]
    pub fn get(
        &self,
        model_id: &str,
        dataset_id: &str,
        split: Split,
        revision: &str,
    ) -> Option<EvaluationResult> {
        let key = (
            model_id.to_string(),
            dataset_id.to_string(),
            split,
            revision.to_string(),
        );
        self.state.read().entries.get(&key).cloned()
    }

    /// Current invalidation generation of a model.
    #[must_use]
    pub fn generation(&self, model_id: &str) -> u64 {
        self.state
            .read()
            .generations
            .get(model_id)
            .copied()
            .unwrap_or(0)
    }

    /// Stores a result computed while the model was at `generation`.
    /// Returns `false` and stores nothing when the model was invalidated since.
    pub fn insert(
        &self,
        dataset_id: &str,
        revision: &str,
        generation: u64,
        result: EvaluationResult,
    ) -> bool {
        let mut state = self.state.write();
        let current = state
            .generations
            .get(&result.model_id)
            .copied()
            .unwrap_or(0);
        if current != generation {
            return false;
        }
        let key = (
            result.model_id.clone(),
            dataset_id.to_string(),
            result.dataset,
            revision.to_string(),
        );
        state.entries.insert(key, result);
        true
    }

    /// Drops every entry for the model, bumps its generation and returns how
    /// many entries were removed.
    pub fn invalidate_model(&self, model_id: &str) -> usize {
        let mut state = self.state.write();
        *state.generations.entry(model_id.to_string()).or_insert(0) += 1;
        let before = state.entries.len();
        state.entries.retain(|(id, _, _, _), _| id != model_id);
        before - state.entries.len()
    }

    /// Cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }
}

struct Resolved {
    record: ModelRecord,
    dataset: Arc<DatasetSplits>,
}

/// Post-hoc evaluation entry point shared by hosts and the comparison service.
#[derive(Clone)]
pub struct EvaluationService {
    registry: Arc<dyn ModelRegistry>,
    datasets: Arc<dyn DatasetProvider>,
    config: EngineConfig,
    cache: EvaluationCache,
    telemetry: Option<EngineTelemetry>,
}

impl EvaluationService {
    /// Creates the service with an empty cache.
    #[must_use]
    pub fn new(
        registry: Arc<dyn ModelRegistry>,
        datasets: Arc<dyn DatasetProvider>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            datasets,
            config,
            cache: EvaluationCache::default(),
            telemetry: None,
        }
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: EngineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Shares an existing cache (the orchestrator invalidates through it).
    #[must_use]
    pub fn with_cache(mut self, cache: EvaluationCache) -> Self {
        self.cache = cache;
        self
    }

    /// Cache handle.
    #[must_use]
    pub const fn cache(&self) -> &EvaluationCache {
        &self.cache
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Confusion matrix and derived scores for one split, served from cache when possible.
    pub fn confusion_matrix(
        &self,
        model_id: &str,
        dataset_id: &str,
        split: Split,
    ) -> EngineResult<EvaluationResult> {
        let resolved = self.resolve(model_id, dataset_id, Purpose::Evaluation)?;
        let revision = &resolved.dataset.revision;
        let generation = self.cache.generation(model_id);
        if let Some(hit) = self.cache.get(model_id, dataset_id, split, revision) {
            self.log(
                LogLevel::Debug,
                "evaluation.cache_hit",
                json!({ "model_id": model_id, "dataset_id": dataset_id, "split": split }),
            );
            return Ok(hit);
        }

        let pair = resolved.dataset.split(split)?;
        let model = self.registry.materialize(model_id)?;
        let summary = {
            let guard = model.lock();
            compute_confusion_matrix(
                &ModelPredictor(&**guard),
                &pair.x(),
                &pair.y(),
                Some(self.config.eval_max_samples),
                self.config.predict_batch_size,
            )?
        };
        let result = EvaluationResult::from_summary(model_id, split, summary);
        if !self
            .cache
            .insert(dataset_id, revision, generation, result.clone())
        {
            self.log(
                LogLevel::Debug,
                "evaluation.cache_skipped",
                json!({ "model_id": model_id, "reason": "model retrained during evaluation" }),
            );
        }

        let payload = json!({
            "model_id": model_id,
            "dataset_id": dataset_id,
            "split": split,
            "accuracy": result.accuracy,
            "f1": result.f1,
            "samples": result.sample_count,
        });
        self.log(LogLevel::Info, "evaluation.completed", payload.clone());
        self.event("evaluation.completed", payload);
        Ok(result)
    }

    /// Micro-averaged ROC; `steps` defaults to the configured threshold count.
    pub fn roc_curve(
        &self,
        model_id: &str,
        dataset_id: &str,
        split: Split,
        steps: Option<usize>,
    ) -> EngineResult<RocCurve> {
        let resolved = self.resolve(model_id, dataset_id, Purpose::Roc)?;
        let pair = resolved.dataset.split(split)?;
        let model = self.registry.materialize(model_id)?;
        let curve = {
            let guard = model.lock();
            compute_roc_micro(
                &ModelPredictor(&**guard),
                &pair.x(),
                &pair.y(),
                Some(self.config.eval_max_samples),
                steps.unwrap_or(self.config.roc_steps),
                self.config.predict_batch_size,
            )?
        };
        self.log(
            LogLevel::Info,
            "evaluation.roc",
            json!({
                "model_id": model_id,
                "split": split,
                "auc": curve.auc,
                "points": curve.points.len(),
            }),
        );
        Ok(curve.with_dataset(split))
    }

    /// Feature importance on the test split, falling back to dense weights
    /// only when no test tensors exist.
    pub fn feature_importance(
        &self,
        model_id: &str,
        dataset_id: &str,
        top_k: Option<usize>,
    ) -> EngineResult<FeatureImportanceReport> {
        let top_k = top_k.unwrap_or(self.config.importance_top_k);
        if top_k == 0 {
            return Err(EngineError::invalid("top_k must be greater than zero"));
        }
        let resolved = self.resolve(model_id, dataset_id, Purpose::FeatureImportance)?;
        let model = self.registry.materialize(model_id)?;

        let report = match resolved.dataset.split(Split::Test) {
            Ok(pair) => {
                let options = ImportanceOptions {
                    dataset_type: resolved.dataset.stats.dataset_type,
                    top_k,
                    max_samples: Some(self.config.importance_max_samples),
                    batch_size: self.config.predict_batch_size,
                    grid: self.config.occlusion_grid,
                    seed: self.config.permutation_seed,
                    feature_names: None,
                };
                let guard = model.lock();
                compute_feature_importance(
                    &ModelPredictor(&**guard),
                    &pair.x(),
                    &pair.y(),
                    &options,
                )?
            }
            Err(missing) => {
                let kernel = model.lock().dense_kernel();
                let Some(kernel) = kernel else {
                    return Err(missing);
                };
                self.log(
                    LogLevel::Warn,
                    "evaluation.importance.dense_fallback",
                    json!({ "model_id": model_id, "dataset_id": dataset_id }),
                );
                dense_weight_importance(kernel.view(), None, top_k)
            }
        };

        self.log(
            LogLevel::Info,
            "evaluation.importance",
            json!({
                "model_id": model_id,
                "architecture": resolved.record.architecture,
                "method": report.method,
                "total_features": report.total_features,
            }),
        );
        Ok(report)
    }

    fn resolve(
        &self,
        model_id: &str,
        dataset_id: &str,
        purpose: Purpose,
    ) -> EngineResult<Resolved> {
        let record = self
            .registry
            .record(model_id)
            .ok_or_else(|| EngineError::ModelNotFound {
                model_id: model_id.into(),
            })?;
        let dataset = self.datasets.dataset(dataset_id)?;
        let fingerprint = build_fingerprint(&dataset.stats);
        if !record.expected_fingerprint.is_enforced() {
            self.log(
                LogLevel::Warn,
                "compatibility.unchecked",
                json!({ "model_id": model_id, "purpose": purpose }),
            );
        }
        assert_compatible(&record, &fingerprint, purpose)?;
        Ok(Resolved { record, dataset })
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        telemetry::log(self.telemetry.as_ref(), level, message, metadata);
    }

    fn event(&self, event_type: &str, payload: Value) {
        telemetry::event(self.telemetry.as_ref(), event_type, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{DatasetType, InMemoryDatasetProvider, TensorPair},
        fingerprint::FingerprintPolicy,
        metrics::ImportanceMethod,
        model::{
            CompileConfig, EpochCallback, FitOptions, InMemoryModelRegistry, TrainableModel,
            TrainingHistory,
        },
    };
    use ndarray::{Array2, ArrayD, ArrayViewD, Axis, IxDyn};

    /// Predicts class 1 when the first feature is positive.
    struct SignModel;

    impl TrainableModel for SignModel {
        fn fit(
            &mut self,
            _x: ArrayViewD<'_, f32>,
            _y: ArrayViewD<'_, f32>,
            _options: &FitOptions<'_>,
            _on_epoch_end: &mut EpochCallback<'_>,
        ) -> anyhow::Result<TrainingHistory> {
            Ok(TrainingHistory::default())
        }

        fn predict(&self, x: ArrayViewD<'_, f32>) -> anyhow::Result<Array2<f32>> {
            let rows = x.len_of(Axis(0));
            Ok(Array2::from_shape_fn((rows, 2), |(row, col)| {
                let positive = x[[row, 0]] > 0.0;
                if positive == (col == 1) {
                    1.0
                } else {
                    0.0
                }
            }))
        }

        fn evaluate(
            &self,
            _x: ArrayViewD<'_, f32>,
            _y: ArrayViewD<'_, f32>,
        ) -> anyhow::Result<(f32, f32)> {
            Ok((0.0, 1.0))
        }

        fn dense_kernel(&self) -> Option<Array2<f32>> {
            Some(ndarray::array![[1.0, -1.0], [0.1, 0.0], [0.0, 0.0]])
        }
    }

    fn pair(rows: usize) -> TensorPair {
        labelled_pair(rows, false)
    }

    /// Sign-separable rows; `flipped` inverts every label.
    fn labelled_pair(rows: usize, flipped: bool) -> TensorPair {
        let x = ArrayD::from_shape_fn(IxDyn(&[rows, 3]), |idx| {
            if idx[1] == 0 {
                if idx[0] % 2 == 0 {
                    -1.0
                } else {
                    1.0
                }
            } else {
                0.25
            }
        });
        let y = ArrayD::from_shape_fn(IxDyn(&[rows]), |idx| {
            if (idx[0] % 2 == 1) == flipped {
                0.0
            } else {
                1.0
            }
        });
        TensorPair::new(x, y).unwrap()
    }

    fn flipped_splits(dataset_id: &str) -> DatasetSplits {
        DatasetSplits::from_tensors(
            dataset_id,
            DatasetType::Tabular,
            labelled_pair(12, true),
            Some(labelled_pair(8, true)),
            None,
        )
        .unwrap()
    }

    fn build_service(with_test: bool, features: usize) -> (EvaluationService, InMemoryDatasetProvider) {
        let datasets = InMemoryDatasetProvider::default();
        let splits = DatasetSplits::from_tensors(
            "parity",
            DatasetType::Tabular,
            pair(12),
            with_test.then(|| pair(8)),
            None,
        )
        .unwrap();
        let mut expected = build_fingerprint(&splits.stats);
        expected.feature_count = features;
        datasets.insert(splits);

        let registry = InMemoryModelRegistry::default();
        registry.register(
            ModelRecord {
                model_id: "sign".into(),
                architecture: "dense".into(),
                input_shape: vec![3],
                num_classes: 2,
                expected_fingerprint: FingerprintPolicy::Enforced(expected),
                compile: CompileConfig::default(),
            },
            Box::new(SignModel),
        );
        let service = EvaluationService::new(
            Arc::new(registry),
            Arc::new(datasets.clone()),
            EngineConfig::default(),
        );
        (service, datasets)
    }

    #[test]
    fn confusion_matrix_is_cached_per_dataset_revision() {
        let (service, _) = build_service(true, 3);
        let first = service.confusion_matrix("sign", "parity", Split::Test).unwrap();
        assert_eq!(first.sample_count, 8);
        assert!((first.accuracy - 1.0).abs() < 1e-12);
        assert_eq!(service.cache().len(), 1);
        let second = service.confusion_matrix("sign", "parity", Split::Test).unwrap();
        assert_eq!(first, second);
        assert_eq!(service.cache().invalidate_model("sign"), 1);
        assert!(service.cache().is_empty());
    }

    #[test]
    fn same_shaped_datasets_keep_separate_results() {
        let (service, datasets) = build_service(true, 3);
        datasets.insert(flipped_splits("flipped"));

        let parity = service.confusion_matrix("sign", "parity", Split::Test).unwrap();
        let flipped = service.confusion_matrix("sign", "flipped", Split::Test).unwrap();
        assert!((parity.accuracy - 1.0).abs() < 1e-12);
        assert!(flipped.accuracy.abs() < 1e-12);
        assert_eq!(service.cache().len(), 2);

        // Replacing the tensors behind an id changes its revision.
        datasets.insert(flipped_splits("parity"));
        let replaced = service.confusion_matrix("sign", "parity", Split::Test).unwrap();
        assert!(replaced.accuracy.abs() < 1e-12);
    }

    #[test]
    fn results_computed_before_invalidation_are_not_stored() {
        let (service, _) = build_service(true, 3);
        let result = service.confusion_matrix("sign", "parity", Split::Test).unwrap();
        let cache = service.cache();
        let stale = cache.generation("sign");
        assert_eq!(cache.invalidate_model("sign"), 1);

        assert!(!cache.insert("parity", "rev", stale, result.clone()));
        assert!(cache.is_empty());
        assert!(cache.insert("parity", "rev", cache.generation("sign"), result));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn every_operation_rechecks_compatibility() {
        let (service, _) = build_service(true, 5);
        let purposes = [
            service
                .confusion_matrix("sign", "parity", Split::Test)
                .unwrap_err(),
            service
                .roc_curve("sign", "parity", Split::Test, None)
                .unwrap_err(),
            service.feature_importance("sign", "parity", None).unwrap_err(),
        ];
        for err in purposes {
            assert_eq!(err.kind(), "incompatible_dataset");
            assert!(err.to_string().contains("feature_count"));
        }
    }

    #[test]
    fn missing_split_is_not_synthesized() {
        let (service, _) = build_service(true, 3);
        let err = service
            .confusion_matrix("sign", "parity", Split::Val)
            .unwrap_err();
        assert_eq!(err.kind(), "dataset_not_loaded");
        let err = service
            .roc_curve("sign", "parity", Split::Val, Some(11))
            .unwrap_err();
        assert_eq!(err.kind(), "dataset_not_loaded");
    }

    #[test]
    fn roc_curve_uses_requested_steps() {
        let (service, _) = build_service(true, 3);
        let curve = service
            .roc_curve("sign", "parity", Split::Test, Some(11))
            .unwrap();
        assert_eq!(curve.points.len(), 11);
        assert!(curve.auc > 0.9);
    }

    #[test]
    fn importance_prefers_permutation_then_dense_weights() {
        let (service, _) = build_service(true, 3);
        let report = service.feature_importance("sign", "parity", Some(2)).unwrap();
        assert_eq!(report.method, ImportanceMethod::Permutation);
        assert_eq!(report.features[0].index, 0);

        let (service, _) = build_service(false, 3);
        let report = service.feature_importance("sign", "parity", Some(2)).unwrap();
        assert_eq!(report.method, ImportanceMethod::DenseWeights);
        assert_eq!(report.baseline_accuracy, None);
        assert_eq!(report.features.len(), 2);
        assert_eq!(report.features[0].index, 0);
    }

    #[test]
    fn unknown_model_is_reported() {
        let (service, _) = build_service(true, 3);
        let err = service
            .confusion_matrix("ghost", "parity", Split::Test)
            .unwrap_err();
        assert_eq!(err.kind(), "model_not_found");
    }
}
