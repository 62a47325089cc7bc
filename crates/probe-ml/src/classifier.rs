//! Success classifier over trajectory windows and its supervised trainer.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Result, anyhow, ensure};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap, linear};
use tracing::{info, warn};

use crate::{
    checkpointer::Checkpointable,
    epoch::{EpochModel, TrainingLog, run_epoch},
    loader::{WindowBatch, WindowLoader},
    tensor::{binary_cross_entropy_with_logits_stable, count_correct},
};

/// Hidden widths of the fixed feed-forward topology.
pub const CLASSIFIER_HIDDEN: [usize; 3] = [256, 128, 64];
/// Retraining schedule applied after every rollout batch.
pub const CLASSIFIER_EPOCHS: usize = 3;
pub const CLASSIFIER_BATCH_SIZE: usize = 8;
pub const CLASSIFIER_LEARNING_RATE: f64 = 1e-3;

/// `input → 256 → 128 → 64 → 1` MLP with ReLU activations and a sigmoid output.
pub struct TrajectoryClassifier {
    varmap: VarMap,
    fc1: Linear,
    fc2: Linear,
    fc3: Linear,
    fc4: Linear,
    state_dim: usize,
    num_past: usize,
    num_future: usize,
    /// Decision threshold: a window is predicted successful when `p > threshold`.
    pub threshold: f64,
    /// Frozen classifiers are scored but never retrained by the orchestrator.
    pub checkpoint: bool,
    training: bool,
    device: Device,
    span: tracing::Span,
}

impl TrajectoryClassifier {
    /// Flattened window width for a state width and horizon pair: the state
    /// slice spans `num_past + 1` steps, the padded action slice
    /// `num_past + num_future + 1`.
    pub fn input_dim(state_dim: usize, num_past: usize, num_future: usize) -> usize {
        (num_past + 1) * state_dim + (num_past + num_future + 1) * state_dim
    }

    pub fn new(
        state_dim: usize,
        num_past: usize,
        num_future: usize,
        threshold: f64,
        device: &Device,
    ) -> Result<Self> {
        ensure!(
            threshold > 0.0 && threshold < 1.0,
            "classifier threshold must lie in (0, 1), got {}",
            threshold
        );
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let input_dim = Self::input_dim(state_dim, num_past, num_future);
        info!("classifier input dim: {}", input_dim);

        let [h1, h2, h3] = CLASSIFIER_HIDDEN;
        let fc1 = linear(input_dim, h1, vb.pp("fc1"))?;
        let fc2 = linear(h1, h2, vb.pp("fc2"))?;
        let fc3 = linear(h2, h3, vb.pp("fc3"))?;
        let fc4 = linear(h3, 1, vb.pp("fc4"))?;
        Ok(Self {
            varmap,
            fc1,
            fc2,
            fc3,
            fc4,
            state_dim,
            num_past,
            num_future,
            threshold,
            checkpoint: false,
            training: false,
            device: device.clone(),
            span: tracing::span!(tracing::Level::TRACE, "classifier"),
        })
    }

    /// Builds the network and loads its weights from a safetensors file. The
    /// result is marked as a checkpoint, so rollouts leave it untouched.
    pub fn load(
        path: &Path,
        state_dim: usize,
        num_past: usize,
        num_future: usize,
        threshold: f64,
        device: &Device,
    ) -> Result<Self> {
        let mut classifier = Self::new(state_dim, num_past, num_future, threshold, device)?;
        classifier.varmap.load(path)?;
        classifier.checkpoint = true;
        info!("loaded classifier checkpoint from {:?}", path);
        Ok(classifier)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap.save_to_path(path)?;
        info!("saved classifier to {:?}", path);
        Ok(())
    }

    pub fn num_past(&self) -> usize {
        self.num_past
    }

    pub fn num_future(&self) -> usize {
        self.num_future
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn set_train(&mut self) {
        self.training = true;
    }

    pub fn set_eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Pre-sigmoid scores `[B]` for windows `[B, ...]`.
    pub fn forward_logits(&self, windows: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let x = windows.flatten_from(1)?;
        let expected = Self::input_dim(self.state_dim, self.num_past, self.num_future);
        ensure!(
            x.dim(1)? == expected,
            "window of {} values does not match classifier input dim {}",
            x.dim(1)?,
            expected
        );
        let x = self.fc1.forward(&x)?.relu()?;
        let x = self.fc2.forward(&x)?.relu()?;
        let x = self.fc3.forward(&x)?.relu()?;
        Ok(self.fc4.forward(&x)?.squeeze(1)?)
    }

    /// Success probabilities `[B]` in `[0, 1]`.
    pub fn forward(&self, windows: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::ops::sigmoid(&self.forward_logits(windows)?)?)
    }

    /// Probability for a single unbatched window.
    pub fn predict(&self, window: &Tensor) -> Result<f32> {
        let p = self.forward(&window.unsqueeze(0)?)?;
        Ok(p.to_dtype(DType::F32)?.to_vec1::<f32>()?[0])
    }

    /// Thresholded decision for one probability.
    pub fn predicts_success(&self, probability: f32) -> bool {
        probability as f64 > self.threshold
    }

    /// Every parameter flattened, sorted by name.
    pub fn parameters(&self) -> Result<Vec<(String, Vec<f32>)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| anyhow!("classifier varmap lock poisoned: {e}"))?;
        let mut params = data
            .iter()
            .map(|(name, var)| {
                let values = var
                    .as_tensor()
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?;
                Ok((name.clone(), values))
            })
            .collect::<Result<Vec<_>>>()?;
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }
}

struct ClassifierStep<'c> {
    classifier: &'c TrajectoryClassifier,
    optimizer: AdamW,
}

struct StepStats {
    loss: f64,
    correct: usize,
    count: usize,
}

impl EpochModel for ClassifierStep<'_> {
    type Batch = WindowBatch;
    type Input = WindowBatch;
    type Info = StepStats;

    fn process_batch_for_training(&self, batch: WindowBatch) -> Result<WindowBatch> {
        Ok(batch)
    }

    fn train_on_batch(
        &mut self,
        input: &WindowBatch,
        _epoch: usize,
        validate: bool,
    ) -> Result<StepStats> {
        let logits = self.classifier.forward_logits(&input.inputs)?;
        let loss = binary_cross_entropy_with_logits_stable(&logits, &input.labels)?;
        if !validate {
            self.optimizer.backward_step(&loss)?;
        }
        let probs = candle_nn::ops::sigmoid(&logits)?;
        Ok(StepStats {
            loss: loss.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64,
            correct: count_correct(&probs, &input.labels, self.classifier.threshold)?,
            count: input.batch_size(),
        })
    }

    fn log_info(&self, info: &StepStats) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("Loss".to_string(), info.loss),
            ("Correct".to_string(), info.correct as f64),
            ("Count".to_string(), info.count as f64),
        ])
    }
}

/// Fits the classifier for `num_epochs` passes over `loader` with Adam and
/// binary cross-entropy. A fresh optimizer is created on every call.
///
/// Returns one log per epoch; `Accuracy` is `correct / total` over the epoch.
pub fn train_classifier(
    classifier: &mut TrajectoryClassifier,
    num_epochs: usize,
    loader: &mut WindowLoader<'_>,
) -> Result<Vec<TrainingLog>> {
    if loader.dataset().is_empty() {
        warn!("classifier training skipped: no windows in dataset");
        return Ok(Vec::new());
    }
    classifier.set_train();
    let optimizer = AdamW::new(
        classifier.varmap.all_vars(),
        ParamsAdamW {
            lr: CLASSIFIER_LEARNING_RATE,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;
    let mut step = ClassifierStep {
        classifier,
        optimizer,
    };

    let mut logs = Vec::with_capacity(num_epochs);
    for epoch in 1..=num_epochs {
        let mut log = run_epoch(&mut step, loader, epoch, false, None, None)?;
        let correct = log.metrics.remove("Correct").unwrap_or(0.0);
        let count = log.metrics.remove("Count").unwrap_or(0.0);
        let accuracy = if count > 0.0 { correct / count } else { 0.0 };
        log.metrics.insert("Accuracy".to_string(), accuracy);
        info!(
            "Epoch [{}/{}], Train Loss: {:.4}, Accuracy {:.4}",
            epoch,
            num_epochs,
            log.metrics.get("Loss").copied().unwrap_or_default(),
            accuracy
        );
        logs.push(log);
    }
    Ok(logs)
}
