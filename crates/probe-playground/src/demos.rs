use anyhow::{Result, ensure};
use probe_env::{Environment, Observation, RolloutPolicy, TASK_SUCCESS_KEY};
use probe_ml::BatchSource;
use rand::{rngs::StdRng, seq::SliceRandom};
use tracing::{info, warn};

/// Observation/action pairs recorded from an expert.
#[derive(Debug, Clone, Default)]
pub struct DemoSet {
    pub observations: Vec<Observation>,
    pub actions: Vec<Vec<f32>>,
    pub successes: usize,
    pub episodes: usize,
}

impl DemoSet {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Moves the trailing `fraction` of transitions into a validation set.
    pub fn split_validation(mut self, fraction: f64) -> Result<(DemoSet, DemoSet)> {
        ensure!(
            (0.0..1.0).contains(&fraction),
            "validation fraction must lie in [0, 1), got {}",
            fraction
        );
        let keep = self.len() - (self.len() as f64 * fraction).round() as usize;
        let valid = DemoSet {
            observations: self.observations.split_off(keep),
            actions: self.actions.split_off(keep),
            successes: 0,
            episodes: 0,
        };
        Ok((self, valid))
    }
}

/// Records `num_demos` expert episodes of at most `horizon` steps. Each
/// episode stops at task success or when the environment is done.
pub fn collect_demos(
    env: &mut dyn Environment,
    expert: &mut dyn RolloutPolicy,
    num_demos: usize,
    horizon: usize,
) -> Result<DemoSet> {
    let mut demos = DemoSet::default();
    for _ in 0..num_demos {
        expert.start_episode();
        let mut obs = env.reset()?;
        let goal = env.goal();
        for _ in 0..horizon {
            let action = expert.act(&obs, goal.as_ref())?;
            let outcome = match env.step(&action) {
                Ok(outcome) => outcome,
                Err(e) if env.is_recoverable(&e) => {
                    warn!("demo truncated: {}", e);
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            demos.observations.push(obs);
            demos.actions.push(action);
            obs = outcome.observation;
            let flags = env.is_success();
            let success = flags.get(TASK_SUCCESS_KEY).copied().unwrap_or(false);
            if success {
                demos.successes += 1;
            }
            if outcome.done || success {
                break;
            }
        }
        demos.episodes += 1;
    }
    info!(
        "collected {} transitions from {} demos ({} successful)",
        demos.len(),
        demos.episodes,
        demos.successes
    );
    Ok(demos)
}

#[derive(Debug, Clone)]
pub struct DemoBatch {
    pub observations: Vec<Observation>,
    pub actions: Vec<Vec<f32>>,
}

/// Shuffled minibatches over a [`DemoSet`].
pub struct DemoLoader<'a> {
    demos: &'a DemoSet,
    batch_size: usize,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
}

impl<'a> DemoLoader<'a> {
    pub fn new(demos: &'a DemoSet, batch_size: usize, rng: StdRng) -> Result<Self> {
        ensure!(batch_size > 0, "batch size must be positive");
        Ok(Self {
            demos,
            batch_size,
            rng,
            order: (0..demos.len()).collect(),
            cursor: 0,
        })
    }
}

impl BatchSource for DemoLoader<'_> {
    type Batch = DemoBatch;

    fn num_batches(&self) -> usize {
        self.demos.len().div_ceil(self.batch_size)
    }

    fn restart(&mut self) {
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Result<Option<DemoBatch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let picked = &self.order[self.cursor..end];
        let batch = DemoBatch {
            observations: picked
                .iter()
                .map(|&i| self.demos.observations[i].clone())
                .collect(),
            actions: picked
                .iter()
                .map(|&i| self.demos.actions[i].clone())
                .collect(),
        };
        self.cursor = end;
        Ok(Some(batch))
    }
}
