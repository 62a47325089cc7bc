use std::{collections::BTreeMap, path::Path, str::FromStr};

use anyhow::{Result, anyhow};
use tensorboard_rs::summary_writer::SummaryWriter;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

/// Installs the fmt subscriber. `-v` counts map to `verbosity = v + 2`,
/// clamped to `0..=5`.
pub fn init_tracing(verbose: u8) -> Result<Level> {
    let verbosity = verbose.saturating_add(2).clamp(0, 5);
    let level = Level::from_str(verbosity.to_string().as_str())
        .map_err(|e| anyhow!("invalid verbosity {verbosity}: {e}"))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(tracing_subscriber::filter::LevelFilter::from_level(level))
        .init();
    info!("Logging initialized at level: {}", level);
    Ok(level)
}

/// Writes scalar metrics to TensorBoard when a log directory is configured.
pub struct ScalarLog {
    writer: Option<SummaryWriter>,
}

impl ScalarLog {
    pub fn new(logdir: Option<&Path>) -> Self {
        Self {
            writer: logdir.map(SummaryWriter::new),
        }
    }

    pub fn scalar(&mut self, tag: &str, value: f64, step: usize) {
        if let Some(writer) = self.writer.as_mut() {
            writer.add_scalar(tag, value as f32, step);
        }
    }

    /// Logs every entry as `<prefix>/<key>`.
    pub fn scalars(&mut self, prefix: &str, values: &BTreeMap<String, f64>, step: usize) {
        if let Some(writer) = self.writer.as_mut() {
            for (k, v) in values {
                writer.add_scalar(&format!("{prefix}/{k}"), *v as f32, step);
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush();
        }
    }
}
