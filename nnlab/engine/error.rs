//! Error taxonomy shared by every engine component.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What the caller was trying to do when a compatibility check ran.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    /// Starting a training run.
    Training,
    /// Computing a confusion matrix / evaluation record.
    Evaluation,
    /// Computing a ROC curve.
    Roc,
    /// Computing feature importance.
    FeatureImportance,
    /// Building a comparison row.
    Comparison,
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Training => "training",
            Self::Evaluation => "evaluation",
            Self::Roc => "roc",
            Self::FeatureImportance => "feature_importance",
            Self::Comparison => "comparison",
        };
        f.write_str(label)
    }
}

/// A single field that differs between a model's expected fingerprint and a dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldMismatch {
    /// Fingerprint field name.
    pub field: String,
    /// Value the model was created for.
    pub expected: String,
    /// Value found on the dataset.
    pub actual: String,
}

impl fmt::Display for FieldMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: model expects {}, dataset has {}",
            self.field, self.expected, self.actual
        )
    }
}

/// Errors surfaced by the engine.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum EngineError {
    /// Dataset fingerprint does not match the model's expectations.
    #[error("dataset incompatible with model {model_id} for {purpose}: {}", join_mismatches(.mismatches))]
    IncompatibleDataset {
        /// Model being validated.
        model_id: String,
        /// Requested operation.
        purpose: Purpose,
        /// Every mismatched field.
        mismatches: Vec<FieldMismatch>,
    },
    /// A run for this model is already pending or running.
    #[error("training already in progress for model {model_id}")]
    TrainingAlreadyInProgress {
        /// Locked model id.
        model_id: String,
    },
    /// Registry has no record for the id.
    #[error("model {model_id} not found")]
    ModelNotFound {
        /// Requested model id.
        model_id: String,
    },
    /// No real tensors are available for the requested dataset/split.
    #[error("dataset {dataset_id} not loaded: {detail}")]
    DatasetNotLoaded {
        /// Requested dataset id.
        dataset_id: String,
        /// Which tensors are missing.
        detail: String,
    },
    /// Tensor rank is not one the operation knows how to slice.
    #[error("unsupported tensor rank {actual} for {context} (expected {expected})")]
    UnsupportedTensorRank {
        /// Operation that inspected the tensor.
        context: String,
        /// Accepted ranks, human readable.
        expected: String,
        /// Rank encountered.
        actual: usize,
    },
    /// Malformed arguments or tensors.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Failure raised by the model runtime (fit/predict/evaluate).
    #[error("model runtime failure: {0}")]
    Model(String),
    /// Worker/runtime infrastructure failure.
    #[error("runtime failure: {0}")]
    Runtime(String),
}

fn join_mismatches(mismatches: &[FieldMismatch]) -> String {
    mismatches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Machine-readable error payload handed to hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    /// Stable error code.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl EngineError {
    /// Stable, machine-readable error code.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::IncompatibleDataset { .. } => "incompatible_dataset",
            Self::TrainingAlreadyInProgress { .. } => "training_already_in_progress",
            Self::ModelNotFound { .. } => "model_not_found",
            Self::DatasetNotLoaded { .. } => "dataset_not_loaded",
            Self::UnsupportedTensorRank { .. } => "unsupported_tensor_rank",
            Self::InvalidInput(_) => "invalid_input",
            Self::Model(_) => "model_runtime",
            Self::Runtime(_) => "runtime",
        }
    }

    /// Kind + message pair.
    #[must_use]
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind().into(),
            message: self.to_string(),
        }
    }

    /// Wraps a model runtime error, keeping its context chain.
    #[must_use]
    pub fn model(err: &anyhow::Error) -> Self {
        Self::Model(format!("{err:#}"))
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub(crate) fn rank(context: &str, expected: &str, actual: usize) -> Self {
        Self::UnsupportedTensorRank {
            context: context.into(),
            expected: expected.into(),
            actual,
        }
    }
}

impl From<ndarray::ShapeError> for EngineError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::InvalidInput(format!("tensor shape: {err}"))
    }
}

/// Engine result alias.
pub type EngineResult<T> = Result<T, EngineError>;
