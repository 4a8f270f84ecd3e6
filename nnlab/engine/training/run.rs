use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    metrics::EvaluationResult,
    model::{EpochMetrics, TrainingHistory},
};

/// Lifecycle of a model's training run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No run recorded.
    #[default]
    Idle,
    /// Accepted, waiting for a worker.
    Pending,
    /// Fit loop executing.
    Running,
    /// Fit and post-fit evaluation finished.
    Completed,
    /// Stopped with an error.
    Failed,
}

impl RunState {
    /// Pending or running.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Completed or failed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Caller-supplied training request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    /// Dataset to train on.
    pub dataset_id: String,
    /// Requested epochs, clamped by the engine.
    pub epochs: usize,
    /// Mini-batch size; the engine default applies when unset.
    pub batch_size: Option<usize>,
    /// Learning-rate override.
    pub learning_rate: Option<f32>,
    /// Fraction of training rows held out for validation, in `[0, 1)`.
    pub validation_split: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            dataset_id: String::new(),
            epochs: 10,
            batch_size: None,
            learning_rate: None,
            validation_split: 0.0,
        }
    }
}

/// One training run and everything it produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingRun {
    /// Run identifier.
    pub run_id: Uuid,
    /// Trained model.
    pub model_id: String,
    /// Dataset used.
    pub dataset_id: String,
    /// Epochs asked for.
    pub epochs_requested: usize,
    /// Epochs after clamping.
    pub epochs_effective: usize,
    /// Mini-batch size.
    pub batch_size: usize,
    /// Learning-rate override, if any.
    pub learning_rate: Option<f32>,
    /// Validation fraction.
    pub validation_split: f32,
    /// Lifecycle state.
    pub state: RunState,
    /// 0..=100.
    pub progress_percent: u8,
    /// Epochs finished so far.
    pub current_epoch: usize,
    /// Metrics of the latest finished epoch.
    pub last_epoch_metrics: Option<EpochMetrics>,
    /// Per-epoch history once the fit returns.
    pub history: Option<TrainingHistory>,
    /// Test-split evaluation after a successful fit.
    pub evaluation: Option<EvaluationResult>,
    /// Acceptance time.
    pub started_at: DateTime<Utc>,
    /// Time the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure message.
    pub error: Option<String>,
}

impl TrainingRun {
    /// Fresh pending run.
    #[must_use]
    pub fn pending(
        run_id: Uuid,
        model_id: impl Into<String>,
        config: &TrainingConfig,
        epochs_effective: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            run_id,
            model_id: model_id.into(),
            dataset_id: config.dataset_id.clone(),
            epochs_requested: config.epochs,
            epochs_effective,
            batch_size,
            learning_rate: config.learning_rate,
            validation_split: config.validation_split,
            state: RunState::Pending,
            progress_percent: 0,
            current_epoch: 0,
            last_epoch_metrics: None,
            history: None,
            evaluation: None,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub(crate) fn mark_running(&mut self) {
        self.state = RunState::Running;
    }

    /// Records a finished epoch (`completed` is 1-based) and returns the new progress.
    pub(crate) fn record_epoch(&mut self, completed: usize, metrics: EpochMetrics) -> u8 {
        self.current_epoch = completed;
        self.progress_percent = progress_percent(completed, self.epochs_effective);
        self.last_epoch_metrics = Some(metrics);
        self.progress_percent
    }

    pub(crate) fn complete(&mut self, history: TrainingHistory, evaluation: EvaluationResult) {
        self.state = RunState::Completed;
        self.progress_percent = 100;
        self.current_epoch = self.current_epoch.max(history.epochs());
        self.history = Some(history);
        self.evaluation = Some(evaluation);
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, message: String) {
        self.state = RunState::Failed;
        self.error = Some(message);
        self.completed_at = Some(Utc::now());
    }
}

/// `round(completed / total * 100)`, capped at 100.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (completed as f64 / total as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingStatus {
    /// Queried model.
    pub model_id: String,
    /// Current state; `idle` when no run exists.
    pub state: RunState,
    /// 0..=100.
    pub progress_percent: u8,
    /// Latest run, if any.
    pub run: Option<TrainingRun>,
}

impl TrainingStatus {
    /// Status for a model that never trained.
    #[must_use]
    pub fn idle(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            state: RunState::Idle,
            progress_percent: 0,
            run: None,
        }
    }

    /// Status mirroring a run.
    #[must_use]
    pub fn from_run(run: &TrainingRun) -> Self {
        Self {
            model_id: run.model_id.clone(),
            state: run.state,
            progress_percent: run.progress_percent,
            run: Some(run.clone()),
        }
    }
}
