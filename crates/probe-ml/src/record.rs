//! Self-describing checkpoint records: model parameters plus the run
//! metadata needed to rebuild the policy, stored in one safetensors file.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
};

use anyhow::{Context, Result, anyhow, ensure};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use probe_env::{EnvMeta, Observation};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ExperimentConfig;

const STD_FLOOR: f32 = 1e-3;

/// Mean/std of one observation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsStats {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

/// Per-key normalization statistics applied to policy inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObsNormalizationStats {
    pub keys: BTreeMap<String, ObsStats>,
}

impl ObsNormalizationStats {
    /// Computes per-key statistics across `observations`. Keys missing from
    /// some observations are averaged over the ones that carry them.
    pub fn compute<'a>(observations: impl IntoIterator<Item = &'a Observation>) -> Result<Self> {
        let mut sums: BTreeMap<String, (Vec<f64>, Vec<f64>, usize)> = BTreeMap::new();
        for obs in observations {
            for (key, values) in obs.iter() {
                let entry = sums
                    .entry(key.to_string())
                    .or_insert_with(|| (vec![0.0; values.len()], vec![0.0; values.len()], 0));
                ensure!(
                    entry.0.len() == values.len(),
                    "observation key {} changes width from {} to {}",
                    key,
                    entry.0.len(),
                    values.len()
                );
                for (j, &v) in values.iter().enumerate() {
                    entry.0[j] += v as f64;
                    entry.1[j] += (v as f64) * (v as f64);
                }
                entry.2 += 1;
            }
        }
        let keys = sums
            .into_iter()
            .map(|(key, (sum, sum_sq, n))| {
                let n = n as f64;
                let mean: Vec<f32> = sum.iter().map(|s| (s / n) as f32).collect();
                let std = sum_sq
                    .iter()
                    .zip(&sum)
                    .map(|(sq, s)| {
                        let var = (sq / n - (s / n) * (s / n)).max(0.0);
                        (var.sqrt() as f32).max(STD_FLOOR)
                    })
                    .collect();
                (key, ObsStats { mean, std })
            })
            .collect();
        Ok(Self { keys })
    }

    /// `(x - mean) / std` for every key with statistics; other keys pass through.
    pub fn normalize(&self, obs: &Observation) -> Observation {
        let mut out = Observation::new();
        for (key, values) in obs.iter() {
            let normalized = match self.keys.get(key) {
                Some(stats) if stats.mean.len() == values.len() => values
                    .iter()
                    .zip(stats.mean.iter().zip(&stats.std))
                    .map(|(v, (m, s))| (v - m) / s)
                    .collect(),
                _ => values.to_vec(),
            };
            out.insert(key, normalized);
        }
        out
    }
}

/// Input/output shapes a policy was built for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapeMeta {
    pub ac_dim: usize,
    pub all_obs_keys: Vec<String>,
    pub all_shapes: BTreeMap<String, Vec<usize>>,
    pub use_images: bool,
}

impl ShapeMeta {
    pub fn from_observation(obs: &Observation, ac_dim: usize) -> Self {
        Self {
            ac_dim,
            all_obs_keys: obs.keys().map(str::to_string).collect(),
            all_shapes: obs
                .iter()
                .map(|(k, v)| (k.to_string(), vec![v.len()]))
                .collect(),
            use_images: false,
        }
    }

    pub fn obs_dim(&self) -> usize {
        self.all_shapes
            .values()
            .map(|s| s.iter().product::<usize>())
            .sum()
    }
}

/// Metadata stored alongside the parameters of a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub config: ExperimentConfig,
    pub algo_name: String,
    pub env_meta: EnvMeta,
    pub shape_meta: ShapeMeta,
    pub obs_normalization_stats: Option<ObsNormalizationStats>,
}

/// A checkpoint read back from disk.
pub struct LoadedCheckpoint {
    pub tensors: HashMap<String, Tensor>,
    pub meta: CheckpointMeta,
}

impl LoadedCheckpoint {
    /// Copies the stored weights into an already-built `VarMap`.
    pub fn load_into(&self, varmap: &mut VarMap) -> Result<()> {
        let data = varmap
            .data()
            .lock()
            .map_err(|e| anyhow!("varmap lock poisoned: {e}"))?;
        for (name, var) in data.iter() {
            let stored = self
                .tensors
                .get(name)
                .ok_or_else(|| anyhow!("checkpoint has no tensor for {}", name))?;
            var.set(&stored.to_dtype(var.dtype())?.to_device(var.device())?)?;
        }
        Ok(())
    }
}

/// Writes the parameters in `params` and the run metadata to `ckpt_path`.
///
/// # Errors
/// Fails when normalization stats are passed but the config has observation
/// normalization disabled, or when the file cannot be written.
pub fn save_model(
    params: &VarMap,
    config: &ExperimentConfig,
    env_meta: &EnvMeta,
    shape_meta: &ShapeMeta,
    ckpt_path: &Path,
    obs_normalization_stats: Option<&ObsNormalizationStats>,
) -> Result<()> {
    let mut metadata = HashMap::from([
        ("config".to_string(), serde_json::to_string(config)?),
        ("algo_name".to_string(), config.algo_name.clone()),
        ("env_metadata".to_string(), serde_json::to_string(env_meta)?),
        ("shape_metadata".to_string(), serde_json::to_string(shape_meta)?),
    ]);
    if let Some(stats) = obs_normalization_stats {
        ensure!(
            config.train.normalize_obs,
            "observation normalization stats given but train.normalize_obs is disabled"
        );
        metadata.insert(
            "obs_normalization_stats".to_string(),
            serde_json::to_string(stats)?,
        );
    }

    let raw = {
        let data = params
            .data()
            .lock()
            .map_err(|e| anyhow!("varmap lock poisoned: {e}"))?;
        data.iter()
            .map(|(name, var)| {
                let t = var.as_tensor().to_dtype(DType::F32)?;
                let shape = t.dims().to_vec();
                let bytes: Vec<u8> = t
                    .flatten_all()?
                    .to_vec1::<f32>()?
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect();
                Ok((name.clone(), shape, bytes))
            })
            .collect::<Result<Vec<_>>>()?
    };
    let views = raw
        .iter()
        .map(|(name, shape, bytes)| {
            let view = TensorView::new(Dtype::F32, shape.clone(), bytes)?;
            Ok((name.as_str(), view))
        })
        .collect::<Result<Vec<_>>>()?;

    safetensors::serialize_to_file(views, &Some(metadata), ckpt_path)?;
    info!("save checkpoint to {:?}", ckpt_path);
    Ok(())
}

/// Reads a checkpoint written by [`save_model`].
pub fn load_model(ckpt_path: &Path, device: &Device) -> Result<LoadedCheckpoint> {
    let bytes = fs::read(ckpt_path)
        .with_context(|| format!("reading checkpoint {ckpt_path:?}"))?;
    let (_, header) = SafeTensors::read_metadata(&bytes)?;
    let metadata = header
        .metadata()
        .as_ref()
        .ok_or_else(|| anyhow!("checkpoint {:?} carries no metadata", ckpt_path))?;
    let field = |key: &str| {
        metadata
            .get(key)
            .ok_or_else(|| anyhow!("checkpoint {:?} is missing {}", ckpt_path, key))
    };

    let meta = CheckpointMeta {
        config: serde_json::from_str(field("config")?)?,
        algo_name: field("algo_name")?.clone(),
        env_meta: serde_json::from_str(field("env_metadata")?)?,
        shape_meta: serde_json::from_str(field("shape_metadata")?)?,
        obs_normalization_stats: metadata
            .get("obs_normalization_stats")
            .map(|s| serde_json::from_str(s))
            .transpose()?,
    };
    let tensors = candle_core::safetensors::load(ckpt_path, device)?;
    info!("loaded {} tensors from {:?}", tensors.len(), ckpt_path);
    Ok(LoadedCheckpoint { tensors, meta })
}
