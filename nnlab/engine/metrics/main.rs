//! Metrics engine: pure functions over a predictor, features and ground truth.

/// Confusion matrix and derived precision/recall.
pub mod confusion;
/// Permutation, occlusion and dense-weight feature importance.
pub mod importance;
/// Micro-averaged ROC curve and AUC.
pub mod roc;

pub use confusion::{
    compute_confusion_matrix, confusion_from_indices, f1_score, ClassStats, ConfusionSummary,
    EvaluationResult,
};
pub use importance::{
    compute_feature_importance, dense_weight_importance, FeatureImportanceReport, FeatureScore,
    ImportanceMethod, ImportanceOptions,
};
pub use roc::{compute_roc_micro, RocCurve, MAX_ROC_STEPS, MIN_ROC_STEPS};
