#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! NNLab training and evaluation engine: dataset fingerprints, metrics,
//! background training runs and model comparison.

/// Error taxonomy.
#[path = "../error.rs"]
pub mod error;

/// Engine limits loaded from TOML.
#[path = "../config.rs"]
pub mod config;

/// Telemetry helpers for logging/event emission.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Predictor seam, label decoding and batched prediction.
#[path = "../tensor.rs"]
pub mod tensor;

/// Dataset splits, stats and the dataset provider.
#[path = "../dataset.rs"]
pub mod dataset;

/// Dataset fingerprints and compatibility checks.
#[path = "../fingerprint.rs"]
pub mod fingerprint;

/// Trainable model seam and registry.
#[path = "../model.rs"]
pub mod model;

/// Confusion matrix, ROC and feature importance.
#[path = "../metrics/main.rs"]
pub mod metrics;

/// Model-id keyed evaluation with caching.
#[path = "../evaluation.rs"]
pub mod evaluation;

/// Side-by-side model comparison.
#[path = "../comparison.rs"]
pub mod comparison;

/// Training orchestrator.
#[path = "../training/main.rs"]
pub mod training;

/// Run persistence.
#[path = "../store.rs"]
pub mod store;

/// Reference softmax classifier.
#[path = "../reference.rs"]
pub mod reference;

pub use comparison::{ComparisonRow, ComparisonService, RowStatus};
pub use config::EngineConfig;
pub use dataset::{
    DatasetProvider, DatasetSplits, DatasetStats, DatasetType, InMemoryDatasetProvider,
    LabelFormat, Split, TensorPair,
};
pub use error::{EngineError, EngineResult, ErrorReport, FieldMismatch, Purpose};
pub use evaluation::{EvaluationCache, EvaluationService};
pub use fingerprint::{
    assert_compatible, build_fingerprint, DatasetFingerprint, FingerprintPolicy, SplitSizes,
};
pub use metrics::{
    EvaluationResult, FeatureImportanceReport, FeatureScore, ImportanceMethod, RocCurve,
};
pub use model::{
    CompileConfig, EpochMetrics, FitOptions, InMemoryModelRegistry, ModelRecord, ModelRegistry,
    SharedModel, TrainableModel, TrainingHistory, ValidationData,
};
pub use reference::SoftmaxRegression;
pub use store::{JsonlRunRecorder, RunArchive, RunSink};
pub use telemetry::{EngineTelemetry, EngineTelemetryBuilder};
pub use training::{
    ProgressEvent, RunState, TrainingConfig, TrainingOrchestrator, TrainingOrchestratorBuilder,
    TrainingRun, TrainingStatus,
};
