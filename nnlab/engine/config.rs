use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Tunables for the orchestrator and metrics engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Ceiling applied to requested epochs.
    pub max_epochs: usize,
    /// Batch size used when a training request does not set one.
    pub default_batch_size: usize,
    /// Sample cap for the one-shot evaluation after a fit completes.
    pub post_train_eval_samples: usize,
    /// Sample cap for post-hoc confusion matrix and ROC requests.
    pub eval_max_samples: usize,
    /// Threshold count for ROC curves.
    pub roc_steps: usize,
    /// Sample cap for permutation/occlusion importance.
    pub importance_max_samples: usize,
    /// Default number of features reported by importance requests.
    pub importance_top_k: usize,
    /// Patch grid used for image occlusion.
    pub occlusion_grid: usize,
    /// Rows per `predict` call.
    pub predict_batch_size: usize,
    /// RNG seed for column permutation.
    pub permutation_seed: u64,
    /// Buffered progress events per subscriber.
    pub progress_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_epochs: 200,
            default_batch_size: 32,
            post_train_eval_samples: 1_000,
            eval_max_samples: 2_000,
            roc_steps: 101,
            importance_max_samples: 500,
            importance_top_k: 10,
            occlusion_grid: 6,
            predict_batch_size: 256,
            permutation_seed: 42,
            progress_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a TOML file; missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero-sized limits.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("max_epochs", self.max_epochs),
            ("default_batch_size", self.default_batch_size),
            ("post_train_eval_samples", self.post_train_eval_samples),
            ("eval_max_samples", self.eval_max_samples),
            ("importance_max_samples", self.importance_max_samples),
            ("occlusion_grid", self.occlusion_grid),
            ("predict_batch_size", self.predict_batch_size),
            ("progress_capacity", self.progress_capacity),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            bail!("{name} must be greater than zero");
        }
        Ok(())
    }

    /// Clamps a requested epoch count into `[1, max_epochs]`.
    #[must_use]
    pub fn effective_epochs(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_epochs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml("max_epochs = 5\nroc_steps = 11\n").unwrap();
        assert_eq!(config.max_epochs, 5);
        assert_eq!(config.roc_steps, 11);
        assert_eq!(config.occlusion_grid, 6);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = EngineConfig::from_toml("predict_batch_size = 0").unwrap_err();
        assert!(err.to_string().contains("predict_batch_size"));
    }

    #[test]
    fn epochs_are_clamped() {
        let config = EngineConfig {
            max_epochs: 10,
            ..EngineConfig::default()
        };
        assert_eq!(config.effective_epochs(0), 1);
        assert_eq!(config.effective_epochs(4), 4);
        assert_eq!(config.effective_epochs(50), 10);
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(&path, "importance_top_k = 3\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.importance_top_k, 3);
    }
}
