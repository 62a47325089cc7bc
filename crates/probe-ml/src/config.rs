use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, ensure};
use serde::{Deserialize, Serialize};

/// Checkpoint saving policy of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SaveConfig {
    pub enabled: bool,
    /// Save every N epochs regardless of rollout performance.
    pub every_n_epochs: Option<usize>,
    pub on_best_rollout_return: bool,
    pub on_best_rollout_success_rate: bool,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_n_epochs: Some(50),
            on_best_rollout_return: false,
            on_best_rollout_success_rate: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RolloutConfig {
    pub enabled: bool,
    /// Episodes per environment per rollout batch.
    pub n: usize,
    pub horizon: usize,
    /// Roll out every N epochs.
    pub rate: usize,
    /// Skip rollouts before this epoch.
    pub warmstart: usize,
    pub terminate_on_success: bool,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            n: 10,
            horizon: 200,
            rate: 10,
            warmstart: 0,
            terminate_on_success: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExperimentSection {
    pub name: String,
    pub validate: bool,
    pub save: SaveConfig,
    pub rollout: RolloutConfig,
    pub render_video: bool,
    /// Capture a render frame every N steps.
    pub video_skip: usize,
    pub keep_all_videos: bool,
}

impl Default for ExperimentSection {
    fn default() -> Self {
        Self {
            name: "reach_bc".to_string(),
            validate: false,
            save: SaveConfig::default(),
            rollout: RolloutConfig::default(),
            render_video: true,
            video_skip: 5,
            keep_all_videos: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainSection {
    pub output_dir: PathBuf,
    pub num_epochs: usize,
    /// Batches per epoch; `None` means one full pass over the data.
    pub epoch_num_steps: Option<usize>,
    pub batch_size: usize,
    pub seed: u64,
    pub learning_rate: f64,
    /// Expert demonstrations collected for behaviour cloning.
    pub num_demos: usize,
    pub normalize_obs: bool,
}

impl Default for TrainSection {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("trained_models"),
            num_epochs: 100,
            epoch_num_steps: Some(100),
            batch_size: 100,
            seed: 1,
            learning_rate: 1e-4,
            num_demos: 50,
            normalize_obs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassifierSection {
    pub num_past: usize,
    pub num_future: usize,
    pub threshold: f64,
    /// Load frozen weights from here instead of retraining online.
    pub checkpoint: Option<PathBuf>,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            num_past: 5,
            num_future: 5,
            threshold: 0.5,
            checkpoint: None,
        }
    }
}

/// Full experiment configuration, serialized into every checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExperimentConfig {
    pub algo_name: String,
    pub experiment: ExperimentSection,
    pub train: TrainSection,
    pub classifier: ClassifierSection,
}

impl ExperimentConfig {
    /// Reads a JSON config; omitted fields take their defaults.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config {path:?}: {e}"))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("failed to parse config JSON at {path:?}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.classifier.threshold > 0.0 && self.classifier.threshold < 1.0,
            "classifier.threshold must lie in (0, 1)"
        );
        ensure!(
            self.train.batch_size > 0,
            "train.batch_size must be positive"
        );
        ensure!(
            self.experiment.video_skip > 0,
            "experiment.video_skip must be positive"
        );
        ensure!(
            self.experiment.rollout.rate > 0,
            "experiment.rollout.rate must be positive"
        );
        if let Some(n) = self.experiment.save.every_n_epochs {
            ensure!(n > 0, "experiment.save.every_n_epochs must be positive");
        }
        Ok(())
    }
}

/// Whether `step` falls on `interval`. A missing interval never fires;
/// `skip_zero` suppresses the trivial hit at step 0.
pub fn is_every_n_steps(interval: Option<usize>, step: usize, skip_zero: bool) -> Result<bool> {
    let Some(interval) = interval else {
        return Ok(false);
    };
    ensure!(interval > 0, "interval must be positive");
    if skip_zero && step == 0 {
        return Ok(false);
    }
    Ok(step.is_multiple_of(interval))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_helper() -> Result<()> {
        assert!(!is_every_n_steps(None, 10, false)?);
        assert!(is_every_n_steps(Some(5), 10, false)?);
        assert!(!is_every_n_steps(Some(5), 11, false)?);
        assert!(is_every_n_steps(Some(5), 0, false)?);
        assert!(!is_every_n_steps(Some(5), 0, true)?);
        assert!(is_every_n_steps(Some(0), 3, false).is_err());
        Ok(())
    }

    #[test]
    fn partial_json_fills_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"algo_name": "bc", "classifier": {"num_past": 3}, "train": {"num_epochs": 7}}"#,
        )?;
        let config = ExperimentConfig::from_path(&path)?;
        assert_eq!(config.algo_name, "bc");
        assert_eq!(config.classifier.num_past, 3);
        assert_eq!(config.classifier.num_future, 5);
        assert_eq!(config.train.num_epochs, 7);
        assert_eq!(config.experiment, ExperimentSection::default());
        Ok(())
    }

    #[test]
    fn json_round_trip() -> Result<()> {
        let config = ExperimentConfig::default();
        let back: ExperimentConfig = serde_json::from_str(&config.to_json()?)?;
        assert_eq!(back, config);
        Ok(())
    }

    #[test]
    fn invalid_threshold_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"classifier": {"threshold": 1.5}}"#)?;
        assert!(ExperimentConfig::from_path(&path).is_err());
        Ok(())
    }
}
