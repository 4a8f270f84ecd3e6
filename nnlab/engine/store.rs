use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::training::TrainingRun;

/// Persistence collaborator for finished runs.
pub trait RunSink: Send + Sync {
    /// Stores a terminal run snapshot.
    fn persist(&self, run: &TrainingRun) -> Result<()>;
}

/// Append-only JSON-lines run recorder.
#[derive(Debug)]
pub struct JsonlRunRecorder {
    path: PathBuf,
    writer: Mutex<File>,
}

impl JsonlRunRecorder {
    /// Opens or creates the recorder file, creating parent directories.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating run recorder dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening run recorder {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Recorder path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RunSink for JsonlRunRecorder {
    fn persist(&self, run: &TrainingRun) -> Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, run)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Reader over a run recorder file.
#[derive(Debug, Clone)]
pub struct RunArchive {
    path: PathBuf,
}

impl RunArchive {
    /// Archive reader for the path; a missing file reads as empty.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Latest `limit` runs, oldest first.
    pub fn tail(&self, limit: usize) -> Result<Vec<TrainingRun>> {
        let mut runs = self.read_all()?;
        if runs.len() > limit {
            runs.drain(..runs.len() - limit);
        }
        Ok(runs)
    }

    /// Every recorded run of one model, oldest first.
    pub fn for_model(&self, model_id: &str) -> Result<Vec<TrainingRun>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|run| run.model_id == model_id)
            .collect())
    }

    fn read_all(&self) -> Result<Vec<TrainingRun>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)
            .with_context(|| format!("opening run archive {}", self.path.display()))?;
        let mut runs = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let run = serde_json::from_str::<TrainingRun>(&line).with_context(|| {
                format!("decoding run at {}:{}", self.path.display(), idx + 1)
            })?;
            runs.push(run);
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::{RunState, TrainingConfig};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn run(model_id: &str) -> TrainingRun {
        let mut run = TrainingRun::pending(
            Uuid::new_v4(),
            model_id,
            &TrainingConfig {
                dataset_id: "iris".into(),
                epochs: 3,
                ..TrainingConfig::default()
            },
            3,
            16,
        );
        run.state = RunState::Completed;
        run.progress_percent = 100;
        run
    }

    #[test]
    fn recorder_round_trips_through_archive() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("runs/history.jsonl");
        let recorder = JsonlRunRecorder::new(&path).unwrap();
        recorder.persist(&run("a")).unwrap();
        recorder.persist(&run("b")).unwrap();
        recorder.persist(&run("a")).unwrap();

        let archive = RunArchive::new(recorder.path());
        assert_eq!(archive.for_model("a").unwrap().len(), 2);
        let tail = archive.tail(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].model_id, "b");
        assert_eq!(tail[1].state, RunState::Completed);
    }

    #[test]
    fn missing_archive_reads_empty() {
        let tmp = tempdir().unwrap();
        let archive = RunArchive::new(tmp.path().join("none.jsonl"));
        assert!(archive.tail(5).unwrap().is_empty());
    }
}
