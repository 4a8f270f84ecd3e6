use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{Datelike, Local, Utc};
use clap::{Parser, Subcommand};
use ndarray::{ArrayD, IxDyn};
use nnlab_engine::{
    build_fingerprint, CompileConfig, DatasetSplits, DatasetStats, DatasetType, EngineConfig,
    EngineTelemetry, EvaluationService, FingerprintPolicy, InMemoryDatasetProvider,
    InMemoryModelRegistry, JsonlRunRecorder, ModelRecord, RunArchive, RunState, SoftmaxRegression,
    Split, TensorPair, TrainingConfig, TrainingOrchestrator,
};
use serde::Deserialize;
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;
use tokio::runtime::Runtime;

const POLL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(name = "trn", version, about = "NNLab training and evaluation runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Prints the fingerprint for a dataset stats file.
    Fingerprint {
        /// JSON file holding dataset stats.
        #[arg(long)]
        stats: PathBuf,
    },
    /// Trains the reference classifier on a dataset bundle.
    Train(TrainArgs),
    /// Lists recorded runs.
    Runs {
        /// Number of entries to display.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Only runs of this model.
        #[arg(long)]
        model: Option<String>,
        /// Run recorder file to read.
        #[arg(long, default_value = "nnlab/logs/runs.jsonl")]
        runs: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct TrainArgs {
    /// JSON dataset bundle with train/test (and optional val) tensors.
    #[arg(long)]
    dataset: PathBuf,
    /// Engine config (TOML); defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Id the model is registered under.
    #[arg(long, default_value = "model-1")]
    model_id: String,
    /// Requested epochs; clamped to the configured maximum.
    #[arg(long, default_value_t = 10)]
    epochs: usize,
    /// Mini-batch size; the config default applies when omitted.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Learning rate override.
    #[arg(long)]
    learning_rate: Option<f32>,
    /// Fraction of training rows held out for validation, in [0, 1).
    #[arg(long, default_value_t = 0.0)]
    validation_split: f32,
    /// Seed for the model's initial weights.
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Register the model without a dataset fingerprint.
    #[arg(long)]
    unchecked: bool,
    /// Also print ROC and feature importance after training.
    #[arg(long)]
    report: bool,
    /// Base directory for dated JSON-lines logs.
    #[arg(long, default_value = "nnlab/logs")]
    log_dir: PathBuf,
    /// Run recorder file finished runs are appended to.
    #[arg(long, default_value = "nnlab/logs/runs.jsonl")]
    runs: PathBuf,
    /// Optional JSON-lines file receiving engine events.
    #[arg(long)]
    event_log: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct TensorFile {
    x_shape: Vec<usize>,
    x: Vec<f32>,
    y_shape: Vec<usize>,
    y: Vec<f32>,
}

impl TensorFile {
    fn into_pair(self) -> Result<TensorPair> {
        let x = ArrayD::from_shape_vec(IxDyn(&self.x_shape), self.x).context("x tensor shape")?;
        let y = ArrayD::from_shape_vec(IxDyn(&self.y_shape), self.y).context("y tensor shape")?;
        Ok(TensorPair::new(x, y)?)
    }
}

#[derive(Debug, Deserialize)]
struct DatasetBundle {
    dataset_id: String,
    dataset_type: DatasetType,
    train: TensorFile,
    test: Option<TensorFile>,
    val: Option<TensorFile>,
}

impl DatasetBundle {
    fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading dataset bundle {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn into_splits(self) -> Result<DatasetSplits> {
        let test = self.test.map(TensorFile::into_pair).transpose()?;
        let val = self.val.map(TensorFile::into_pair).transpose()?;
        Ok(DatasetSplits::from_tensors(
            self.dataset_id,
            self.dataset_type,
            self.train.into_pair()?,
            test,
            val,
        )?)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Fingerprint { stats } => {
            let raw = fs::read_to_string(&stats)
                .with_context(|| format!("reading stats {}", stats.display()))?;
            let stats: DatasetStats = serde_json::from_str(&raw).context("parsing dataset stats")?;
            println!("{}", serde_json::to_string_pretty(&build_fingerprint(&stats))?);
            Ok(())
        }
        Commands::Train(args) => handle_train(args),
        Commands::Runs { limit, model, runs } => {
            let archive = RunArchive::new(runs);
            let entries = match model {
                Some(model_id) => archive.for_model(&model_id)?,
                None => archive.tail(limit)?,
            };
            for run in entries.iter().rev().take(limit) {
                println!(
                    "{} | {} | {:?} | {}% | {} | {}",
                    run.run_id,
                    run.model_id,
                    run.state,
                    run.progress_percent,
                    run.started_at,
                    run.error.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
    }
}

fn handle_train(args: TrainArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let splits = DatasetBundle::load(&args.dataset)?.into_splits()?;
    let dataset_id = splits.dataset_id.clone();
    let policy = if args.unchecked {
        FingerprintPolicy::Unchecked
    } else {
        FingerprintPolicy::Enforced(build_fingerprint(&splits.stats))
    };
    let record = ModelRecord {
        model_id: args.model_id.clone(),
        architecture: "softmax_regression".into(),
        input_shape: splits.stats.input_shape.clone(),
        num_classes: splits.stats.classes,
        expected_fingerprint: policy,
        compile: CompileConfig {
            label_format: splits.stats.label_format,
            ..CompileConfig::default()
        },
    };
    let model = SoftmaxRegression::from_record(&record, args.seed);

    let datasets = InMemoryDatasetProvider::default();
    datasets.insert(splits);
    let registry = InMemoryModelRegistry::default();
    registry.register(record, Box::new(model));
    let registry = Arc::new(registry);
    let datasets = Arc::new(datasets);

    let runtime = Runtime::new()?;
    let mut telemetry = EngineTelemetry::builder("trn").log_path(compute_log_path(&args.log_dir)?);
    if let Some(path) = &args.event_log {
        telemetry = telemetry.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }
    let telemetry = telemetry.build()?;
    let recorder = Arc::new(JsonlRunRecorder::new(&args.runs)?);

    let evaluation = EvaluationService::new(registry.clone(), datasets.clone(), config.clone())
        .with_telemetry(telemetry.clone());
    let orchestrator = TrainingOrchestrator::builder(registry, datasets)
        .config(config)
        .cache(evaluation.cache().clone())
        .run_sink(recorder)
        .telemetry(telemetry.clone())
        .build()?;

    let request = TrainingConfig {
        dataset_id: dataset_id.clone(),
        epochs: args.epochs,
        batch_size: args.batch_size,
        learning_rate: args.learning_rate,
        validation_split: args.validation_split,
    };
    let status = runtime.block_on(async {
        let mut progress = orchestrator.subscribe();
        let printer = tokio::spawn(async move {
            while let Ok(event) = progress.recv().await {
                println!(
                    "epoch {}/{} ({}%) loss={:.4} acc={:.4}",
                    event.epoch,
                    event.epochs,
                    event.progress_percent,
                    event.metrics.loss,
                    event.metrics.acc
                );
            }
        });
        let accepted = orchestrator.start(&args.model_id, request)?;
        println!("run {} accepted for {}", accepted.run_id, accepted.model_id);
        let status = orchestrator.wait_for(&args.model_id, POLL).await;
        printer.abort();
        anyhow::Ok(status)
    })?;

    let _ = telemetry.log(
        LogLevel::Info,
        "trn.train.finished",
        json!({ "model_id": args.model_id, "state": status.state, "finished_at": Utc::now() }),
    );
    println!("{}", serde_json::to_string_pretty(&status)?);
    if status.state != RunState::Completed {
        anyhow::bail!("training run for {} did not complete", args.model_id);
    }

    if args.report {
        let roc = evaluation.roc_curve(&args.model_id, &dataset_id, Split::Test, None)?;
        println!("roc auc={:.4} ({} points)", roc.auc, roc.points.len());
        let importance = evaluation.feature_importance(&args.model_id, &dataset_id, None)?;
        println!("{}", serde_json::to_string_pretty(&importance)?);
    }
    Ok(())
}

fn compute_log_path(base: &Path) -> Result<PathBuf> {
    let now = Local::now();
    let dir = base
        .join(format!("{:04}", now.year()))
        .join(format!("{:02}", now.month()))
        .join(format!("{:02}", now.day()));
    fs::create_dir_all(&dir).with_context(|| format!("creating log dir {}", dir.display()))?;
    Ok(dir.join(format!(
        "train-{}.log.jsonl",
        Utc::now().format("%Y%m%d-%H%M%S")
    )))
}
