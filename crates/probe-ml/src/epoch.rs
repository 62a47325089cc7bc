use std::{collections::BTreeMap, time::Instant};

use anyhow::{Result, bail};
use tracing::debug;

use crate::record::ObsNormalizationStats;

/// A restartable stream of training batches.
pub trait BatchSource {
    type Batch;

    /// Batches in one full pass.
    fn num_batches(&self) -> usize;

    /// Begins a new pass. Sources that shuffle reshuffle here.
    fn restart(&mut self);

    /// Next batch of the current pass, `None` once the pass is exhausted.
    fn next_batch(&mut self) -> Result<Option<Self::Batch>>;
}

/// What the epoch runner needs from a trainable model.
///
/// Switching between training and evaluation behaviour is the caller's job;
/// `validate` only tells the model whether to take gradient steps.
pub trait EpochModel {
    type Batch;
    type Input;
    type Info;

    fn process_batch_for_training(&self, batch: Self::Batch) -> Result<Self::Input>;

    fn postprocess_batch_for_training(
        &self,
        input: Self::Input,
        _obs_normalization_stats: Option<&ObsNormalizationStats>,
    ) -> Result<Self::Input> {
        Ok(input)
    }

    fn train_on_batch(
        &mut self,
        input: &Self::Input,
        epoch: usize,
        validate: bool,
    ) -> Result<Self::Info>;

    /// Scalar metrics for one batch; averaged across the epoch by the runner.
    fn log_info(&self, info: &Self::Info) -> BTreeMap<String, f64>;
}

/// Pulls batches forever, starting a new pass whenever the source runs dry.
pub struct BatchCursor<'a, S: BatchSource> {
    source: &'a mut S,
    restarts: usize,
}

impl<'a, S: BatchSource> BatchCursor<'a, S> {
    pub fn new(source: &'a mut S) -> Self {
        source.restart();
        Self {
            source,
            restarts: 0,
        }
    }

    /// Number of times the source has been restarted after running dry.
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// # Errors
    /// Fails if the source yields nothing even right after a restart.
    pub fn next_batch(&mut self) -> Result<S::Batch> {
        if let Some(batch) = self.source.next_batch()? {
            return Ok(batch);
        }
        self.source.restart();
        self.restarts += 1;
        match self.source.next_batch()? {
            Some(batch) => Ok(batch),
            None => bail!("batch source yielded no batches after restart"),
        }
    }
}

/// Averaged metrics and per-phase timing (minutes) of one epoch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingLog {
    pub metrics: BTreeMap<String, f64>,
    pub num_batches: usize,
    pub time_data_loading: f64,
    pub time_process_batch: f64,
    pub time_train_batch: f64,
    pub time_log_info: f64,
    pub time_epoch: f64,
}

impl TrainingLog {
    /// Metrics plus `Time_*` entries, as written to the event log.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut out = self.metrics.clone();
        out.insert("Time_Data_Loading".to_string(), self.time_data_loading);
        out.insert("Time_Process_Batch".to_string(), self.time_process_batch);
        out.insert("Time_Train_Batch".to_string(), self.time_train_batch);
        out.insert("Time_Log_Info".to_string(), self.time_log_info);
        out.insert("Time_Epoch".to_string(), self.time_epoch);
        out
    }
}

/// Runs one training or validation epoch.
///
/// Exactly `num_steps` batches are processed (default: one full pass). A
/// source shorter than that is restarted transparently, as often as needed.
pub fn run_epoch<M, S>(
    model: &mut M,
    source: &mut S,
    epoch: usize,
    validate: bool,
    num_steps: Option<usize>,
    obs_normalization_stats: Option<&ObsNormalizationStats>,
) -> Result<TrainingLog>
where
    M: EpochModel,
    S: BatchSource<Batch = M::Batch>,
{
    let epoch_start = Instant::now();
    let num_steps = num_steps.unwrap_or_else(|| source.num_batches());

    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    let mut timing = [0f64; 4];
    let mut cursor = BatchCursor::new(source);

    for _ in 0..num_steps {
        let t = Instant::now();
        let batch = cursor.next_batch()?;
        timing[0] += t.elapsed().as_secs_f64();

        let t = Instant::now();
        let input = model.process_batch_for_training(batch)?;
        let input = model.postprocess_batch_for_training(input, obs_normalization_stats)?;
        timing[1] += t.elapsed().as_secs_f64();

        let t = Instant::now();
        let info = model.train_on_batch(&input, epoch, validate)?;
        timing[2] += t.elapsed().as_secs_f64();

        let t = Instant::now();
        for (k, v) in model.log_info(&info) {
            let entry = sums.entry(k).or_insert((0.0, 0));
            entry.0 += v;
            entry.1 += 1;
        }
        timing[3] += t.elapsed().as_secs_f64();
    }
    debug!(
        "epoch {} ran {} batches with {} restarts",
        epoch,
        num_steps,
        cursor.restarts()
    );

    Ok(TrainingLog {
        metrics: sums
            .into_iter()
            .map(|(k, (sum, n))| (k, sum / n as f64))
            .collect(),
        num_batches: num_steps,
        time_data_loading: timing[0] / 60.0,
        time_process_batch: timing[1] / 60.0,
        time_train_batch: timing[2] / 60.0,
        time_log_info: timing[3] / 60.0,
        time_epoch: epoch_start.elapsed().as_secs_f64() / 60.0,
    })
}
