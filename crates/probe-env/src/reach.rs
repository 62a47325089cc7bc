//! A point mass that has to reach a goal on the unit square while a random
//! per-episode drift pushes it off course. Strong drift makes the scripted
//! expert fail some episodes, so rollouts carry both outcome labels.

use std::collections::BTreeMap;

use anyhow::anyhow;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    env::{EnvError, EnvMeta, Environment, Frame, RenderMode, RolloutPolicy, StepOutcome},
    layout::StateLayout,
    observation::Observation,
};

pub const REACH_ACTION_DIM: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReachConfig {
    pub max_steps: usize,
    /// Distance under which the task counts as solved.
    pub tolerance: f32,
    pub max_speed: f32,
    /// Upper bound on the per-episode drift speed.
    pub max_drift: f32,
    pub dt: f32,
    pub seed: u64,
}

impl Default for ReachConfig {
    fn default() -> Self {
        Self {
            max_steps: 200,
            tolerance: 0.05,
            max_speed: 1.0,
            max_drift: 0.6,
            dt: 0.05,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReachEnv {
    name: String,
    config: ReachConfig,
    layout: StateLayout,
    rng: StdRng,
    pos: [f32; 2],
    vel: [f32; 2],
    goal: [f32; 2],
    drift: [f32; 2],
    steps: usize,
}

impl ReachEnv {
    pub fn new(name: impl Into<String>, config: ReachConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            name: name.into(),
            // robot_pos, robot_vel, goal_pos; progress is dropped
            layout: StateLayout::new(vec![0..4, 4..6]),
            config,
            rng,
            pos: [0.0; 2],
            vel: [0.0; 2],
            goal: [0.0; 2],
            drift: [0.0; 2],
            steps: 0,
        }
    }

    pub fn config(&self) -> &ReachConfig {
        &self.config
    }

    fn distance_to_goal(&self) -> f32 {
        let dx = self.pos[0] - self.goal[0];
        let dy = self.pos[1] - self.goal[1];
        (dx * dx + dy * dy).sqrt()
    }

    fn observation(&self) -> Observation {
        Observation::new()
            .with("robot_pos", self.pos.to_vec())
            .with("robot_vel", self.vel.to_vec())
            .with("goal_pos", self.goal.to_vec())
            .with(
                "progress",
                vec![self.steps as f32 / self.config.max_steps.max(1) as f32],
            )
    }

    fn to_pixel(v: f32, extent: u32) -> i64 {
        let scaled = (v + 1.0) * 0.5 * extent.saturating_sub(1) as f32;
        scaled.round() as i64
    }

    fn draw_square(frame: &mut Frame, cx: i64, cy: i64, half: i64, rgb: [u8; 3]) {
        for y in (cy - half)..=(cy + half) {
            for x in (cx - half)..=(cx + half) {
                if x >= 0 && y >= 0 {
                    frame.put_pixel(x as u32, y as u32, rgb);
                }
            }
        }
    }

    fn draw_disc(frame: &mut Frame, cx: i64, cy: i64, radius: i64, rgb: [u8; 3]) {
        for y in (cy - radius)..=(cy + radius) {
            for x in (cx - radius)..=(cx + radius) {
                let (dx, dy) = (x - cx, y - cy);
                if x >= 0 && y >= 0 && dx * dx + dy * dy <= radius * radius {
                    frame.put_pixel(x as u32, y as u32, rgb);
                }
            }
        }
    }
}

impl Environment for ReachEnv {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) -> Result<Observation, EnvError> {
        let mut sample = || self.rng.random_range(-0.9f32..0.9);
        self.pos = [sample(), sample()];
        self.goal = [sample(), sample()];
        let angle = self.rng.random_range(0.0f32..std::f32::consts::TAU);
        let speed = self.rng.random_range(0.0f32..=self.config.max_drift);
        self.drift = [speed * angle.cos(), speed * angle.sin()];
        self.vel = [0.0; 2];
        self.steps = 0;
        Ok(self.observation())
    }

    fn step(&mut self, action: &[f32]) -> Result<StepOutcome, EnvError> {
        if action.len() != REACH_ACTION_DIM {
            return Err(EnvError::Other(anyhow!(
                "reach expects a {}-d action, got {}",
                REACH_ACTION_DIM,
                action.len()
            )));
        }
        for i in 0..2 {
            let command = action[i].clamp(-1.0, 1.0) * self.config.max_speed;
            self.vel[i] = command + self.drift[i];
            self.pos[i] = (self.pos[i] + self.vel[i] * self.config.dt).clamp(-1.0, 1.0);
        }
        self.steps += 1;

        let reward = if self.distance_to_goal() < self.config.tolerance {
            1.0
        } else {
            0.0
        };
        Ok(StepOutcome {
            observation: self.observation(),
            reward,
            done: self.steps >= self.config.max_steps,
            info: serde_json::json!({ "distance": self.distance_to_goal() }),
        })
    }

    fn is_success(&self) -> BTreeMap<String, bool> {
        let d = self.distance_to_goal();
        BTreeMap::from([
            ("task".to_string(), d < self.config.tolerance),
            ("near_goal".to_string(), d < 3.0 * self.config.tolerance),
        ])
    }

    fn goal(&self) -> Option<Observation> {
        Some(Observation::new().with("goal_pos", self.goal.to_vec()))
    }

    fn render(&mut self, mode: RenderMode) -> Result<Option<Frame>, EnvError> {
        match mode {
            RenderMode::Human => {
                debug!(
                    "{}: pos=({:.3}, {:.3}) goal=({:.3}, {:.3})",
                    self.name, self.pos[0], self.pos[1], self.goal[0], self.goal[1]
                );
                Ok(None)
            }
            RenderMode::RgbArray { height, width } => {
                let mut frame = Frame::filled(width, height, [255, 255, 255]);
                let half = (width.min(height) / 64).max(1) as i64;
                Self::draw_square(
                    &mut frame,
                    Self::to_pixel(self.goal[0], width),
                    Self::to_pixel(-self.goal[1], height),
                    half,
                    [40, 180, 60],
                );
                Self::draw_disc(
                    &mut frame,
                    Self::to_pixel(self.pos[0], width),
                    Self::to_pixel(-self.pos[1], height),
                    half + 2,
                    [30, 60, 200],
                );
                Ok(Some(frame))
            }
        }
    }

    fn state_layout(&self) -> &StateLayout {
        &self.layout
    }

    fn meta(&self) -> EnvMeta {
        EnvMeta {
            env_name: self.name.clone(),
            env_type: "reach".to_string(),
            env_kwargs: serde_json::to_value(&self.config).unwrap_or_default(),
        }
    }
}

/// Proportional controller towards the goal, with optional uniform action noise.
#[derive(Debug, Clone)]
pub struct ReachExpert {
    gain: f32,
    noise: f32,
    rng: StdRng,
}

impl ReachExpert {
    pub fn new(gain: f32, noise: f32, seed: u64) -> Self {
        Self {
            gain,
            noise,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RolloutPolicy for ReachExpert {
    fn start_episode(&mut self) {}

    fn act(
        &mut self,
        observation: &Observation,
        goal: Option<&Observation>,
    ) -> anyhow::Result<Vec<f32>> {
        let pos = observation
            .get("robot_pos")
            .ok_or_else(|| anyhow!("observation is missing robot_pos"))?;
        let target = goal
            .and_then(|g| g.get("goal_pos"))
            .or_else(|| observation.get("goal_pos"))
            .ok_or_else(|| anyhow!("no goal_pos in observation or goal"))?;
        let mut action = Vec::with_capacity(REACH_ACTION_DIM);
        for i in 0..REACH_ACTION_DIM {
            let jitter = if self.noise > 0.0 {
                self.rng.random_range(-self.noise..=self.noise)
            } else {
                0.0
            };
            action.push((self.gain * (target[i] - pos[i]) + jitter).clamp(-1.0, 1.0));
        }
        Ok(action)
    }
}
