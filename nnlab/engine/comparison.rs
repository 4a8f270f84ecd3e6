use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    dataset::Split,
    evaluation::EvaluationService,
    metrics::EvaluationResult,
    telemetry::{self, EngineTelemetry},
};

/// Outcome of one model's evaluation inside a comparison.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    /// Evaluated successfully.
    Ok,
    /// Evaluation failed; metrics are zero.
    Error,
}

/// One row of a model comparison table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonRow {
    /// Model id as requested.
    pub model_id: String,
    /// Row status.
    pub status: RowStatus,
    /// Samples evaluated.
    pub sample_count: usize,
    /// Accuracy.
    pub accuracy: f64,
    /// Macro precision.
    pub precision: f64,
    /// Macro recall.
    pub recall: f64,
    /// F1 score.
    pub f1: f64,
    /// Failure message for error rows.
    pub error: Option<String>,
}

impl ComparisonRow {
    fn ok(result: &EvaluationResult) -> Self {
        Self {
            model_id: result.model_id.clone(),
            status: RowStatus::Ok,
            sample_count: result.sample_count,
            accuracy: result.accuracy,
            precision: result.macro_precision,
            recall: result.macro_recall,
            f1: result.f1,
            error: None,
        }
    }

    fn failed(model_id: &str, message: String) -> Self {
        Self {
            model_id: model_id.into(),
            status: RowStatus::Error,
            sample_count: 0,
            accuracy: 0.0,
            precision: 0.0,
            recall: 0.0,
            f1: 0.0,
            error: Some(message),
        }
    }
}

/// Builds side-by-side evaluation tables.
#[derive(Clone)]
pub struct ComparisonService {
    evaluation: EvaluationService,
    telemetry: Option<EngineTelemetry>,
}

impl ComparisonService {
    /// Wraps an evaluation service.
    #[must_use]
    pub const fn new(evaluation: EvaluationService) -> Self {
        Self {
            evaluation,
            telemetry: None,
        }
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: EngineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// One row per requested id, in input order; failures become zero-filled error rows.
    #[must_use]
    pub fn compare(
        &self,
        model_ids: &[String],
        dataset_id: &str,
        split: Split,
    ) -> Vec<ComparisonRow> {
        let rows: Vec<ComparisonRow> = model_ids
            .iter()
            .map(
                |model_id| match self.evaluation.confusion_matrix(model_id, dataset_id, split) {
                    Ok(result) => ComparisonRow::ok(&result),
                    Err(err) => {
                        telemetry::log(
                            self.telemetry.as_ref(),
                            LogLevel::Warn,
                            "comparison.row_failed",
                            json!({ "model_id": model_id, "error": err.report() }),
                        );
                        ComparisonRow::failed(model_id, err.to_string())
                    }
                },
            )
            .collect();

        let failed = rows
            .iter()
            .filter(|row| row.status == RowStatus::Error)
            .count();
        telemetry::event(
            self.telemetry.as_ref(),
            "comparison.completed",
            json!({
                "dataset_id": dataset_id,
                "split": split,
                "models": rows.len(),
                "failed": failed,
            }),
        );
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::{
        config::EngineConfig,
        dataset::{DatasetSplits, DatasetType, InMemoryDatasetProvider, TensorPair},
        fingerprint::FingerprintPolicy,
        model::{CompileConfig, InMemoryModelRegistry, ModelRecord},
        reference::SoftmaxRegression,
    };
    use ndarray::{ArrayD, IxDyn};
    use serde_json::Value;
    use shared_event_bus::MemoryEventBus;

    fn dataset() -> DatasetSplits {
        let make = |rows: usize| {
            #[allow(clippy::cast_precision_loss)]
            let x = ArrayD::from_shape_fn(IxDyn(&[rows, 2]), |idx| (idx[0] + idx[1]) as f32);
            #[allow(clippy::cast_precision_loss)]
            let y = ArrayD::from_shape_fn(IxDyn(&[rows]), |idx| (idx[0] % 2) as f32);
            TensorPair::new(x, y).unwrap()
        };
        DatasetSplits::from_tensors("toy", DatasetType::Tabular, make(10), Some(make(6)), None)
            .unwrap()
    }

    #[test]
    fn failures_become_zero_rows_in_input_order() {
        let datasets = InMemoryDatasetProvider::default();
        datasets.insert(dataset());
        let registry = InMemoryModelRegistry::default();
        registry.register(
            ModelRecord {
                model_id: "valid".into(),
                architecture: "softmax".into(),
                input_shape: vec![2],
                num_classes: 2,
                expected_fingerprint: FingerprintPolicy::Unchecked,
                compile: CompileConfig::default(),
            },
            Box::new(SoftmaxRegression::new(2, 2, 7)),
        );
        let bus = Arc::new(MemoryEventBus::new(8));
        let telemetry = EngineTelemetry::builder("comparison")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let evaluation = EvaluationService::new(
            Arc::new(registry),
            Arc::new(datasets),
            EngineConfig::default(),
        );
        let service = ComparisonService::new(evaluation).with_telemetry(telemetry);

        let ids = vec!["valid".to_string(), "missing".to_string()];
        let rows = service.compare(&ids, "toy", Split::Test);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].model_id, "valid");
        assert_eq!(rows[0].status, RowStatus::Ok);
        assert_eq!(rows[0].sample_count, 6);
        assert_eq!(rows[1].model_id, "missing");
        assert_eq!(rows[1].status, RowStatus::Error);
        assert_eq!(rows[1].sample_count, 0);
        assert_eq!(rows[1].accuracy, 0.0);
        assert!(rows[1].error.as_deref().unwrap_or_default().contains("not found"));

        let events = bus.snapshot_matching("comparison.");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["failed"], Value::from(1));
    }
}
