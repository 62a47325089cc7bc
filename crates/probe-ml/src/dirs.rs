use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};
use tracing::{info, warn};

use crate::config::ExperimentConfig;

const RUN_TIMESTAMP: &[FormatItem<'static>] = format_description!(
    "[year][month][day][hour][minute][second][subsecond digits:3]"
);

/// Directories created for one experiment run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentDirs {
    pub run_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Present only when checkpoint saving is enabled.
    pub model_dir: Option<PathBuf>,
    pub video_dir: PathBuf,
}

/// Creates `<output_dir>/<name>/<timestamp>/{logs,models,videos}`.
///
/// An existing experiment directory is wiped first when `auto_remove` is set;
/// otherwise the new run lands beside the old ones. Two runs that resolve to
/// the same timestamp directory fail rather than share it.
pub fn experiment_dirs(config: &ExperimentConfig, auto_remove: bool) -> Result<ExperimentDirs> {
    let stamp = OffsetDateTime::now_utc()
        .format(RUN_TIMESTAMP)
        .map_err(|e| anyhow!("failed to format run timestamp: {e}"))?;

    let base = config.train.output_dir.join(&config.experiment.name);
    if base.exists() {
        if auto_remove {
            warn!("removing existing experiment directory {:?}", base);
            fs::remove_dir_all(&base)?;
        } else {
            info!(
                "experiment directory {:?} exists, adding run {}",
                base, stamp
            );
        }
    }

    let run_dir = create_run_dir(&base, &stamp)?;
    let model_dir = if config.experiment.save.enabled {
        let dir = run_dir.join("models");
        fs::create_dir_all(&dir)?;
        Some(dir)
    } else {
        None
    };
    let log_dir = run_dir.join("logs");
    fs::create_dir_all(&log_dir)?;
    let video_dir = run_dir.join("videos");
    fs::create_dir_all(&video_dir)?;

    Ok(ExperimentDirs {
        run_dir,
        log_dir,
        model_dir,
        video_dir,
    })
}

fn create_run_dir(base: &Path, stamp: &str) -> Result<PathBuf> {
    fs::create_dir_all(base)?;
    let run_dir = base.join(stamp);
    fs::create_dir(&run_dir)
        .with_context(|| format!("cannot create run directory {run_dir:?}"))?;
    Ok(run_dir)
}
