//! Training orchestrator: per-model run lock, background fit, progress fan-out
//! and post-fit evaluation.

/// Progress events and their broadcast hub.
pub mod progress;
/// Run records, request config and status snapshots.
pub mod run;

use std::{
    any::Any,
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shared_logging::LogLevel;
use tokio::{runtime::Handle, sync::broadcast};
use uuid::Uuid;

pub use progress::{ProgressEvent, ProgressHub};
pub use run::{progress_percent, RunState, TrainingConfig, TrainingRun, TrainingStatus};

use crate::{
    config::EngineConfig,
    dataset::{DatasetProvider, DatasetSplits, Split},
    error::{EngineError, EngineResult, Purpose},
    evaluation::EvaluationCache,
    fingerprint::{assert_compatible, build_fingerprint},
    metrics::{compute_confusion_matrix, EvaluationResult},
    model::{
        EpochMetrics, FitOptions, ModelPredictor, ModelRegistry, SharedModel, TrainingHistory,
        ValidationData,
    },
    store::RunSink,
    telemetry::{self, EngineTelemetry},
};

#[derive(Default)]
struct RunTable {
    /// Model id to the run id holding its lock.
    active: HashMap<String, Uuid>,
    /// Latest run per model.
    runs: IndexMap<String, TrainingRun>,
}

impl RunTable {
    fn release(&mut self, model_id: &str, run_id: Uuid) {
        if self.active.get(model_id) == Some(&run_id) {
            self.active.remove(model_id);
        }
    }

    fn run_mut(&mut self, model_id: &str, run_id: Uuid) -> Option<&mut TrainingRun> {
        self.runs
            .get_mut(model_id)
            .filter(|run| run.run_id == run_id)
    }
}

struct Shared {
    registry: Arc<dyn ModelRegistry>,
    datasets: Arc<dyn DatasetProvider>,
    config: EngineConfig,
    cache: EvaluationCache,
    progress: ProgressHub,
    sink: Option<Arc<dyn RunSink>>,
    telemetry: Option<EngineTelemetry>,
    table: Mutex<RunTable>,
}

impl Shared {
    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        telemetry::log(self.telemetry.as_ref(), level, message, metadata);
    }

    fn event(&self, event_type: &str, payload: Value) {
        telemetry::event(self.telemetry.as_ref(), event_type, payload);
    }
}

/// Holds a model's training lock until dropped.
struct ActiveRunGuard {
    shared: Arc<Shared>,
    model_id: String,
    run_id: Uuid,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.shared
            .table
            .lock()
            .release(&self.model_id, self.run_id);
    }
}

/// Everything the worker needs, moved onto the blocking pool.
struct TrainingJob {
    run_id: Uuid,
    model_id: String,
    dataset: Arc<DatasetSplits>,
    model: SharedModel,
    epochs: usize,
    batch_size: usize,
    learning_rate: Option<f32>,
    validation_split: f32,
}

/// Builder for [`TrainingOrchestrator`].
pub struct TrainingOrchestratorBuilder {
    registry: Arc<dyn ModelRegistry>,
    datasets: Arc<dyn DatasetProvider>,
    config: EngineConfig,
    cache: EvaluationCache,
    sink: Option<Arc<dyn RunSink>>,
    telemetry: Option<EngineTelemetry>,
}

impl TrainingOrchestratorBuilder {
    /// Sets engine limits.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares the evaluation cache invalidated on completion.
    #[must_use]
    pub fn cache(mut self, cache: EvaluationCache) -> Self {
        self.cache = cache;
        self
    }

    /// Persists terminal runs.
    #[must_use]
    pub fn run_sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn telemetry(mut self, telemetry: EngineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Validates the config and builds the orchestrator.
    pub fn build(self) -> anyhow::Result<TrainingOrchestrator> {
        self.config.validate()?;
        Ok(TrainingOrchestrator {
            shared: Arc::new(Shared {
                registry: self.registry,
                datasets: self.datasets,
                progress: ProgressHub::new(self.config.progress_capacity),
                config: self.config,
                cache: self.cache,
                sink: self.sink,
                telemetry: self.telemetry,
                table: Mutex::new(RunTable::default()),
            }),
        })
    }
}

/// Accepts training requests and runs them on tokio's blocking pool.
#[derive(Clone)]
pub struct TrainingOrchestrator {
    shared: Arc<Shared>,
}

impl TrainingOrchestrator {
    /// Starts a builder over the two collaborators.
    #[must_use]
    pub fn builder(
        registry: Arc<dyn ModelRegistry>,
        datasets: Arc<dyn DatasetProvider>,
    ) -> TrainingOrchestratorBuilder {
        TrainingOrchestratorBuilder {
            registry,
            datasets,
            config: EngineConfig::default(),
            cache: EvaluationCache::default(),
            sink: None,
            telemetry: None,
        }
    }

    /// Validates the request, records a pending run and hands the fit to a worker.
    ///
    /// Must be called from within a tokio runtime. Validation failures leave no
    /// run behind and release the model's lock.
    pub fn start(&self, model_id: &str, config: TrainingConfig) -> EngineResult<TrainingRun> {
        let handle = Handle::try_current()
            .map_err(|_| EngineError::Runtime("training requires a tokio runtime".into()))?;
        let guard = self.acquire(model_id)?;
        let shared = &self.shared;

        let record = shared
            .registry
            .record(model_id)
            .ok_or_else(|| EngineError::ModelNotFound {
                model_id: model_id.into(),
            })?;
        let dataset = shared.datasets.dataset(&config.dataset_id)?;
        dataset.train()?;
        dataset.split(Split::Test)?;
        let fingerprint = build_fingerprint(&dataset.stats);
        if !record.expected_fingerprint.is_enforced() {
            shared.log(
                LogLevel::Warn,
                "compatibility.unchecked",
                json!({ "model_id": model_id, "purpose": Purpose::Training }),
            );
        }
        assert_compatible(&record, &fingerprint, Purpose::Training)?;

        let epochs = shared.config.effective_epochs(config.epochs);
        let batch_size = config
            .batch_size
            .unwrap_or(shared.config.default_batch_size);
        if batch_size == 0 {
            return Err(EngineError::invalid("batch_size must be greater than zero"));
        }
        if !(0.0..1.0).contains(&config.validation_split) {
            return Err(EngineError::invalid(format!(
                "validation_split must be in [0, 1), got {}",
                config.validation_split
            )));
        }
        if let Some(lr) = config.learning_rate {
            if !lr.is_finite() || lr <= 0.0 {
                return Err(EngineError::invalid(format!(
                    "learning_rate must be positive, got {lr}"
                )));
            }
        }
        let model = shared.registry.materialize(model_id)?;

        let run = TrainingRun::pending(guard.run_id, model_id, &config, epochs, batch_size);
        shared
            .table
            .lock()
            .runs
            .insert(model_id.to_string(), run.clone());
        let payload = json!({
            "run_id": run.run_id,
            "model_id": model_id,
            "dataset_id": config.dataset_id,
            "digest": fingerprint.digest,
            "epochs_requested": config.epochs,
            "epochs": epochs,
            "batch_size": batch_size,
        });
        shared.log(LogLevel::Info, "training.run.accepted", payload.clone());
        shared.event("training.run.accepted", payload);

        let job = TrainingJob {
            run_id: run.run_id,
            model_id: model_id.to_string(),
            dataset,
            model,
            epochs,
            batch_size,
            learning_rate: config.learning_rate,
            validation_split: config.validation_split,
        };
        let worker_shared = Arc::clone(shared);
        handle.spawn_blocking(move || {
            let _guard = guard;
            execute(&worker_shared, &job);
        });
        Ok(run)
    }

    /// Current status; `idle` when the model never trained.
    #[must_use]
    pub fn get_status(&self, model_id: &str) -> TrainingStatus {
        self.shared
            .table
            .lock()
            .runs
            .get(model_id)
            .map_or_else(|| TrainingStatus::idle(model_id), TrainingStatus::from_run)
    }

    /// Latest run of every model, in first-trained order.
    #[must_use]
    pub fn runs(&self) -> Vec<TrainingRun> {
        self.shared.table.lock().runs.values().cloned().collect()
    }

    /// Receiver for epoch-end progress events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.progress.subscribe()
    }

    /// Cache invalidated whenever a run completes.
    #[must_use]
    pub fn cache(&self) -> &EvaluationCache {
        &self.shared.cache
    }

    /// Polls until the model's run is terminal (or no run exists).
    pub async fn wait_for(&self, model_id: &str, poll: Duration) -> TrainingStatus {
        loop {
            let status = self.get_status(model_id);
            if !status.state.is_active() {
                return status;
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn acquire(&self, model_id: &str) -> EngineResult<ActiveRunGuard> {
        let mut table = self.shared.table.lock();
        if table.active.contains_key(model_id) {
            return Err(EngineError::TrainingAlreadyInProgress {
                model_id: model_id.into(),
            });
        }
        let run_id = Uuid::new_v4();
        table.active.insert(model_id.to_string(), run_id);
        Ok(ActiveRunGuard {
            shared: Arc::clone(&self.shared),
            model_id: model_id.to_string(),
            run_id,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

fn execute(shared: &Shared, job: &TrainingJob) {
    let outcome = catch_unwind(AssertUnwindSafe(|| fit_and_evaluate(shared, job)))
        .unwrap_or_else(|panic| {
            Err(EngineError::Runtime(format!(
                "training worker panicked: {}",
                panic_message(panic.as_ref())
            )))
        });

    // Cache is cleared before the run turns terminal.
    let dropped = match &outcome {
        Ok(_) => shared.cache.invalidate_model(&job.model_id),
        Err(_) => 0,
    };
    let finished = {
        let mut table = shared.table.lock();
        let snapshot = table.run_mut(&job.model_id, job.run_id).map(|run| {
            match &outcome {
                Ok((history, evaluation)) => run.complete(history.clone(), evaluation.clone()),
                Err(err) => run.fail(err.to_string()),
            }
            run.clone()
        });
        table.release(&job.model_id, job.run_id);
        snapshot
    };

    match &outcome {
        Ok((history, evaluation)) => {
            let payload = json!({
                "run_id": job.run_id,
                "model_id": job.model_id,
                "epochs": history.epochs(),
                "final_loss": history.loss.last(),
                "accuracy": evaluation.accuracy,
                "f1": evaluation.f1,
                "cache_invalidated": dropped,
            });
            shared.log(LogLevel::Info, "training.run.completed", payload.clone());
            shared.event("training.run.completed", payload);
        }
        Err(err) => {
            let payload = json!({
                "run_id": job.run_id,
                "model_id": job.model_id,
                "error": err.report(),
            });
            shared.log(LogLevel::Error, "training.run.failed", payload.clone());
            shared.event("training.run.failed", payload);
        }
    }

    if let (Some(sink), Some(run)) = (&shared.sink, finished) {
        if let Err(err) = sink.persist(&run) {
            shared.log(
                LogLevel::Warn,
                "training.run.persist_failed",
                json!({ "run_id": job.run_id, "error": format!("{err:#}") }),
            );
        }
    }
}

fn fit_and_evaluate(
    shared: &Shared,
    job: &TrainingJob,
) -> EngineResult<(TrainingHistory, EvaluationResult)> {
    if let Some(run) = shared.table.lock().run_mut(&job.model_id, job.run_id) {
        run.mark_running();
    }
    shared.event(
        "training.run.started",
        json!({ "run_id": job.run_id, "model_id": job.model_id }),
    );

    let train = job.dataset.train()?;
    let test = job.dataset.split(Split::Test)?;
    let validation = if job.validation_split > 0.0 {
        ValidationData::Split(job.validation_split)
    } else {
        match job.dataset.split(Split::Val) {
            Ok(val) => ValidationData::Data {
                x: val.x(),
                y: val.y(),
            },
            Err(_) => ValidationData::None,
        }
    };
    let options = FitOptions {
        epochs: job.epochs,
        batch_size: job.batch_size,
        learning_rate: job.learning_rate,
        validation,
    };

    let mut model = job.model.lock();
    shared.log(
        LogLevel::Debug,
        "training.fit.begin",
        json!({ "run_id": job.run_id, "model": model.summary() }),
    );
    let mut on_epoch_end = |epoch: usize, metrics: &EpochMetrics| {
        record_epoch(shared, job, epoch + 1, *metrics);
    };
    let history = model
        .fit(train.x(), train.y(), &options, &mut on_epoch_end)
        .map_err(|err| EngineError::model(&err))?;
    if let Some(epoch) = history.first_non_finite_loss() {
        return Err(EngineError::Model(format!(
            "loss became non-finite at epoch {epoch}"
        )));
    }

    let summary = compute_confusion_matrix(
        &ModelPredictor(&**model),
        &test.x(),
        &test.y(),
        Some(shared.config.post_train_eval_samples),
        shared.config.predict_batch_size,
    )?;
    drop(model);
    Ok((
        history,
        EvaluationResult::from_summary(&job.model_id, Split::Test, summary),
    ))
}

fn record_epoch(shared: &Shared, job: &TrainingJob, completed: usize, metrics: EpochMetrics) {
    let progress = shared
        .table
        .lock()
        .run_mut(&job.model_id, job.run_id)
        .map(|run| run.record_epoch(completed, metrics));
    let Some(progress_percent) = progress else {
        return;
    };
    shared.progress.publish(ProgressEvent {
        run_id: job.run_id,
        model_id: job.model_id.clone(),
        epoch: completed,
        epochs: job.epochs,
        progress_percent,
        metrics,
        timestamp: Utc::now(),
    });
    shared.event(
        "training.epoch.completed",
        json!({
            "run_id": job.run_id,
            "model_id": job.model_id,
            "epoch": completed,
            "progress_percent": progress_percent,
            "loss": metrics.loss,
            "accuracy": metrics.acc,
            "val_loss": metrics.val_loss,
            "val_accuracy": metrics.val_acc,
        }),
    );
}
