//! Behaviour-cloning MLP trained on expert demonstrations.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow, ensure};
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap, linear};
use probe_env::{EnvMeta, Observation, RolloutPolicy};
use probe_ml::{
    EpochModel, ExperimentConfig, LoadedCheckpoint, ModelRecord, ObsNormalizationStats, ShapeMeta,
};
use tracing::info;

use crate::demos::DemoBatch;

pub const BC_ALGO_NAME: &str = "bc";
pub const BC_HIDDEN: [usize; 2] = [256, 256];

/// `obs → 256 → 256 → action` with ReLU hidden layers and a tanh head.
pub struct BcPolicy {
    varmap: VarMap,
    layers: Vec<Linear>,
    shape_meta: ShapeMeta,
    obs_normalization_stats: Option<ObsNormalizationStats>,
    optimizer: AdamW,
    device: Device,
}

impl BcPolicy {
    pub fn new(
        shape_meta: ShapeMeta,
        obs_normalization_stats: Option<ObsNormalizationStats>,
        learning_rate: f64,
        device: &Device,
    ) -> Result<Self> {
        ensure!(
            shape_meta.ac_dim > 0,
            "policy needs a non-empty action space"
        );
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let mut widths = vec![shape_meta.obs_dim()];
        widths.extend(BC_HIDDEN);
        widths.push(shape_meta.ac_dim);
        let layers = widths
            .windows(2)
            .enumerate()
            .map(|(i, w)| linear(w[0], w[1], vb.pp(format!("mlp.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        info!(
            "bc policy: obs dim {}, action dim {}",
            shape_meta.obs_dim(),
            shape_meta.ac_dim
        );

        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;
        Ok(Self {
            varmap,
            layers,
            shape_meta,
            obs_normalization_stats,
            optimizer,
            device: device.clone(),
        })
    }

    /// Rebuilds the policy described by a checkpoint and loads its weights.
    pub fn from_checkpoint(ckpt: &LoadedCheckpoint, device: &Device) -> Result<Self> {
        ensure!(
            ckpt.meta.algo_name == BC_ALGO_NAME,
            "checkpoint holds a {} policy, expected {}",
            ckpt.meta.algo_name,
            BC_ALGO_NAME
        );
        let mut policy = Self::new(
            ckpt.meta.shape_meta.clone(),
            ckpt.meta.obs_normalization_stats.clone(),
            ckpt.meta.config.train.learning_rate,
            device,
        )?;
        ckpt.load_into(&mut policy.varmap)?;
        Ok(policy)
    }

    /// Parameters and metadata for the checkpointer.
    pub fn record<'a>(
        &'a self,
        config: &'a ExperimentConfig,
        env_meta: &'a EnvMeta,
    ) -> ModelRecord<'a> {
        ModelRecord {
            params: self.varmap.clone(),
            config,
            env_meta,
            shape_meta: &self.shape_meta,
            obs_normalization_stats: self.obs_normalization_stats.as_ref(),
        }
    }

    pub fn shape_meta(&self) -> &ShapeMeta {
        &self.shape_meta
    }

    fn forward(&self, observations: &Tensor) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut x = observations.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(&x)?;
            x = if i == last { x.tanh()? } else { x.relu()? };
        }
        Ok(x)
    }

    /// Observation values concatenated in `all_obs_keys` order.
    fn obs_vector(&self, obs: &Observation, out: &mut Vec<f32>) -> Result<()> {
        for key in &self.shape_meta.all_obs_keys {
            let values = obs
                .get(key)
                .ok_or_else(|| anyhow!("observation is missing policy input {key}"))?;
            out.extend_from_slice(values);
        }
        Ok(())
    }

    fn obs_tensor(&self, observations: &[Observation]) -> Result<Tensor> {
        let dim = self.shape_meta.obs_dim();
        let mut flat = Vec::with_capacity(observations.len() * dim);
        for obs in observations {
            self.obs_vector(obs, &mut flat)?;
        }
        ensure!(
            flat.len() == observations.len() * dim,
            "observations do not match policy input dim {}",
            dim
        );
        let shape = (observations.len(), dim);
        Ok(Tensor::from_vec(flat, shape, &self.device)?)
    }
}

impl EpochModel for BcPolicy {
    type Batch = DemoBatch;
    type Input = DemoBatch;
    type Info = f64;

    fn process_batch_for_training(&self, batch: DemoBatch) -> Result<DemoBatch> {
        Ok(batch)
    }

    fn postprocess_batch_for_training(
        &self,
        input: DemoBatch,
        obs_normalization_stats: Option<&ObsNormalizationStats>,
    ) -> Result<DemoBatch> {
        let Some(stats) = obs_normalization_stats else {
            return Ok(input);
        };
        Ok(DemoBatch {
            observations: input
                .observations
                .iter()
                .map(|o| stats.normalize(o))
                .collect(),
            actions: input.actions,
        })
    }

    fn train_on_batch(&mut self, input: &DemoBatch, _epoch: usize, validate: bool) -> Result<f64> {
        let n = input.actions.len();
        let ac_dim = self.shape_meta.ac_dim;
        let flat: Vec<f32> = input.actions.iter().flatten().copied().collect();
        ensure!(flat.len() == n * ac_dim, "demo actions are not {ac_dim}-d");
        let target = Tensor::from_vec(flat, (n, ac_dim), &self.device)?;

        let predicted = self.forward(&self.obs_tensor(&input.observations)?)?;
        let loss = candle_nn::loss::mse(&predicted, &target)?;
        if !validate {
            self.optimizer.backward_step(&loss)?;
        }
        Ok(loss.to_scalar::<f32>()? as f64)
    }

    fn log_info(&self, info: &f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("Loss".to_string(), *info)])
    }
}

impl RolloutPolicy for BcPolicy {
    fn start_episode(&mut self) {}

    fn act(&mut self, observation: &Observation, _goal: Option<&Observation>) -> Result<Vec<f32>> {
        let obs = match &self.obs_normalization_stats {
            Some(stats) => stats.normalize(observation),
            None => observation.clone(),
        };
        let x = self.obs_tensor(std::slice::from_ref(&obs))?;
        Ok(self.forward(&x)?.squeeze(0)?.to_vec1::<f32>()?)
    }
}
