use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{layout::StateLayout, observation::Observation};

/// Key every environment must report in [`Environment::is_success`].
pub const TASK_SUCCESS_KEY: &str = "task";

/// Errors raised by an environment while it is being driven.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    /// A fault the rollout may survive; the episode is truncated at this step.
    #[error("rollout fault: {0}")]
    Rollout(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result of applying one action.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub observation: Observation,
    pub reward: f64,
    pub done: bool,
    pub info: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// On-screen rendering; environments without a display may ignore it.
    Human,
    RgbArray { height: u32, width: u32 },
}

/// Packed RGB8 raster, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        if x < self.width && y < self.height {
            let i = ((y * self.width + x) * 3) as usize;
            self.data[i..i + 3].copy_from_slice(&rgb);
        }
    }
}

/// Static description of an environment instance, stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvMeta {
    pub env_name: String,
    pub env_type: String,
    pub env_kwargs: serde_json::Value,
}

/// The simulation environment as seen by the rollout orchestrator.
pub trait Environment {
    /// Task name, used in logs, video file names and rollout statistics.
    fn name(&self) -> &str;

    fn reset(&mut self) -> Result<Observation, EnvError>;

    fn step(&mut self, action: &[f32]) -> Result<StepOutcome, EnvError>;

    /// Success flags for the current state. Always contains [`TASK_SUCCESS_KEY`].
    fn is_success(&self) -> BTreeMap<String, bool>;

    /// Goal observation for goal-conditioned policies.
    fn goal(&self) -> Option<Observation> {
        None
    }

    fn render(&mut self, mode: RenderMode) -> Result<Option<Frame>, EnvError>;

    /// Whether `err` truncates the episode instead of aborting the run.
    fn is_recoverable(&self, err: &EnvError) -> bool {
        matches!(err, EnvError::Rollout(_))
    }

    /// How to compress a flattened observation into the classifier state.
    fn state_layout(&self) -> &StateLayout;

    fn meta(&self) -> EnvMeta;
}

/// Policy queried once per step during rollouts.
pub trait RolloutPolicy {
    fn start_episode(&mut self);

    fn act(
        &mut self,
        observation: &Observation,
        goal: Option<&Observation>,
    ) -> anyhow::Result<Vec<f32>>;
}
