use anyhow::Result;
use candle_nn::VarMap;
use probe_env::EnvMeta;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

use crate::{
    config::ExperimentConfig,
    record::{ObsNormalizationStats, ShapeMeta, save_model},
};

const EXTENSION: &str = ".safetensors";

/// Writes model checkpoints into one directory for a training run.
///
/// Periodic checkpoints are named `{run_name}_epoch_{epoch:08}[.{suffix}].safetensors`
/// and pruned to the newest `max_checkpoints` unless `keep_all` is set.
/// Named checkpoints (e.g. best-rollout saves) are never pruned.
pub struct Checkpointer {
    save_every: Option<usize>,
    checkpoint_dir: PathBuf,
    run_name: String,
    keep_all: bool,
    max_checkpoints: usize,
}

impl Checkpointer {
    /// Keeps the 3 most recent periodic checkpoints.
    ///
    /// # Errors
    /// Returns an error if the checkpoint directory cannot be created.
    pub fn new(
        save_every: Option<usize>,
        checkpoint_dir: PathBuf,
        run_name: String,
    ) -> Result<Self> {
        Self::new_with_options(save_every, checkpoint_dir, run_name, false, 3)
    }

    pub fn new_with_options(
        save_every: Option<usize>,
        checkpoint_dir: PathBuf,
        run_name: String,
        keep_all: bool,
        max_checkpoints: usize,
    ) -> Result<Self> {
        fs::create_dir_all(&checkpoint_dir)?;
        Ok(Self {
            save_every,
            checkpoint_dir,
            run_name,
            keep_all,
            max_checkpoints,
        })
    }

    pub fn checkpoint_path(&self, epoch: usize, suffix: Option<&str>) -> PathBuf {
        let mut name = format!("{}_epoch_{:08}", self.run_name, epoch);
        if let Some(s) = suffix
            && !s.is_empty()
        {
            name.push('.');
            name.push_str(s);
        }
        name.push_str(EXTENSION);
        self.checkpoint_dir.join(name)
    }

    /// Path for a free-form checkpoint name such as `model_epoch_20_Reach_success_1.0`.
    pub fn named_path(&self, name: &str) -> PathBuf {
        self.checkpoint_dir.join(format!("{name}{EXTENSION}"))
    }

    /// Saves when `epoch` is a positive multiple of the save interval.
    ///
    /// # Returns
    /// `true` if a checkpoint was written.
    pub fn checkpoint_item<T: Checkpointable + ?Sized>(
        &self,
        epoch: usize,
        item: &T,
        suffix: Option<&str>,
    ) -> Result<bool> {
        let Some(every) = self.save_every else {
            return Ok(false);
        };
        if epoch == 0 || !epoch.is_multiple_of(every) {
            return Ok(false);
        }
        let path = self.checkpoint_path(epoch, suffix);
        item.save_to_path(&path)?;
        info!("Saved checkpoint at epoch {} to {:?}", epoch, path);
        if !self.keep_all {
            self.cleanup_old_checkpoints()?;
        }
        Ok(true)
    }

    /// Saves unconditionally under `name`.
    pub fn save_named<T: Checkpointable + ?Sized>(&self, name: &str, item: &T) -> Result<PathBuf> {
        let path = self.named_path(name);
        item.save_to_path(&path)?;
        info!("Saved checkpoint {:?}", path);
        Ok(path)
    }

    /// Periodic checkpoints of this run as `(epoch, path)`, newest first.
    /// A `suffix` filter keeps only files saved with that suffix.
    pub fn periodic_checkpoints(&self, suffix: Option<&str>) -> Result<Vec<(usize, PathBuf)>> {
        let mut found = Vec::new();
        if !self.checkpoint_dir.exists() {
            return Ok(found);
        }
        let prefix = format!("{}_epoch_", self.run_name);
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = filename
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(EXTENSION))
            else {
                continue;
            };
            let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
            let rest = &stem[digits.len()..];
            let matches_suffix = match suffix {
                Some(s) => rest.strip_prefix('.') == Some(s),
                None => true,
            };
            if matches_suffix && let Ok(epoch) = digits.parse::<usize>() {
                found.push((epoch, path.clone()));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found)
    }

    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let stale = self.periodic_checkpoints(None)?;
        for (_, path) in stale.iter().skip(self.max_checkpoints) {
            if let Err(e) = fs::remove_file(path) {
                warn!("Failed to remove old checkpoint {:?}: {}", path, e);
            }
        }
        Ok(())
    }
}

/// State that can be written to and restored from a checkpoint file.
pub trait Checkpointable {
    fn save_to_path(&self, path: &Path) -> Result<()>;
}

impl Checkpointable for VarMap {
    fn save_to_path(&self, path: &Path) -> Result<()> {
        Ok(self.save(path)?)
    }
}

/// Parameters bundled with the metadata written by [`save_model`].
pub struct ModelRecord<'a> {
    pub params: VarMap,
    pub config: &'a ExperimentConfig,
    pub env_meta: &'a EnvMeta,
    pub shape_meta: &'a ShapeMeta,
    pub obs_normalization_stats: Option<&'a ObsNormalizationStats>,
}

impl Checkpointable for ModelRecord<'_> {
    fn save_to_path(&self, path: &Path) -> Result<()> {
        save_model(
            &self.params,
            self.config,
            self.env_meta,
            self.shape_meta,
            path,
            self.obs_normalization_stats,
        )
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, linear};

    use super::*;

    fn varmap() -> Result<VarMap> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        linear(2, 2, vb.pp("l"))?;
        Ok(varmap)
    }

    #[test]
    fn checkpoint_path_format() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ckpt = Checkpointer::new(Some(10), dir.path().to_path_buf(), "run".to_string())?;
        assert_eq!(
            ckpt.checkpoint_path(1000, None),
            dir.path().join("run_epoch_00001000.safetensors")
        );
        assert_eq!(
            ckpt.checkpoint_path(5, Some("classifier")),
            dir.path().join("run_epoch_00000005.classifier.safetensors")
        );
        assert_eq!(
            ckpt.named_path("model_epoch_3_Reach_success_1.0"),
            dir.path().join("model_epoch_3_Reach_success_1.0.safetensors")
        );
        Ok(())
    }

    #[test]
    fn saves_on_interval_and_prunes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ckpt = Checkpointer::new_with_options(
            Some(2),
            dir.path().to_path_buf(),
            "run".to_string(),
            false,
            2,
        )?;
        let params = varmap()?;
        let saved: Vec<bool> = (0..=8)
            .map(|e| ckpt.checkpoint_item(e, &params, None))
            .collect::<Result<_>>()?;
        assert_eq!(
            saved,
            vec![false, false, true, false, true, false, true, false, true]
        );
        let epochs: Vec<usize> = ckpt
            .periodic_checkpoints(None)?
            .into_iter()
            .map(|(e, _)| e)
            .collect();
        assert_eq!(epochs, vec![8, 6]);
        Ok(())
    }

    #[test]
    fn no_interval_never_saves() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ckpt = Checkpointer::new(None, dir.path().to_path_buf(), "run".to_string())?;
        assert!(!ckpt.checkpoint_item(10, &varmap()?, None)?);
        assert!(ckpt.periodic_checkpoints(None)?.is_empty());
        Ok(())
    }

    #[test]
    fn suffix_filter_and_named_saves() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ckpt = Checkpointer::new_with_options(
            Some(1),
            dir.path().to_path_buf(),
            "run".to_string(),
            true,
            0,
        )?;
        let params = varmap()?;
        ckpt.checkpoint_item(1, &params, None)?;
        ckpt.checkpoint_item(2, &params, Some("classifier"))?;
        ckpt.checkpoint_item(3, &params, None)?;
        ckpt.save_named("model_epoch_3_Reach_success_1.0", &params)?;

        let suffixed = ckpt.periodic_checkpoints(Some("classifier"))?;
        assert_eq!(suffixed.iter().map(|c| c.0).collect::<Vec<_>>(), vec![2]);
        let all = ckpt.periodic_checkpoints(None)?;
        assert_eq!(all.iter().map(|c| c.0).collect::<Vec<_>>(), vec![3, 2, 1]);
        assert!(ckpt.named_path("model_epoch_3_Reach_success_1.0").exists());
        Ok(())
    }
}
