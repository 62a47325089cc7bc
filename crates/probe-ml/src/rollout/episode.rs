use std::collections::BTreeMap;

use anyhow::Result;
use probe_env::{
    EnvError, Environment, Frame, Observation, RenderMode, RolloutPolicy, TASK_SUCCESS_KEY,
};
use tracing::{debug, warn};

use super::{
    RolloutResult,
    plot::{DIAGNOSTIC_FRAME_SIZE, compose_panels, frame_to_image, probability_panel, scatter_panel},
    video::VideoSink,
};
use crate::{
    classifier::TrajectoryClassifier,
    loader::WindowLoader,
    window::{Trajectory, TrajectoryWindowDataset, WindowMode},
};

/// Windows consumed per diagnostic video frame.
pub const WINDOWS_PER_FRAME: usize = 5;
const SCORING_BATCH: usize = 64;

/// Per-episode knobs of [`run_rollout`].
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeOptions {
    pub horizon: usize,
    pub use_goals: bool,
    /// Render to screen every step.
    pub render: bool,
    /// Capture a render frame every N steps for the diagnostic video.
    pub video_skip: usize,
    pub terminate_on_success: bool,
}

impl Default for EpisodeOptions {
    fn default() -> Self {
        Self {
            horizon: 200,
            use_goals: false,
            render: false,
            video_skip: 5,
            terminate_on_success: false,
        }
    }
}

/// Online classifier output for every window of one episode, in window order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeScores {
    pub probabilities: Vec<f32>,
    pub true_labels: Vec<bool>,
    pub predicted_labels: Vec<bool>,
}

/// Recoverable faults end the episode; anything else aborts the rollout.
fn recover<T>(env: &dyn Environment, result: Result<T, EnvError>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if env.is_recoverable(&e) => {
            warn!("got rollout exception {}", e);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Runs one episode with `policy`, scores it with the current `classifier`
/// and, when `video` is given, writes the diagnostic video for it.
///
/// The classifier is put in evaluation mode and never updated here. The
/// returned trajectory holds the compressed post-step states and actions of
/// every non-terminal step, labelled with the episode's task success.
pub fn run_rollout(
    policy: &mut dyn RolloutPolicy,
    env: &mut dyn Environment,
    classifier: &mut TrajectoryClassifier,
    options: &EpisodeOptions,
    video: Option<&mut VideoSink>,
) -> Result<(RolloutResult, Trajectory)> {
    policy.start_episode();
    let mut obs = env.reset()?;
    let goal: Option<Observation> = if options.use_goals { env.goal() } else { None };

    let mut success: BTreeMap<String, bool> =
        env.is_success().into_keys().map(|k| (k, false)).collect();
    let mut total_reward = 0.0;
    let mut horizon_reached = 0;
    let mut trajectory = Trajectory::default();
    let mut saved_frames: Vec<Frame> = Vec::new();
    let mut video_count = 0usize;
    let capture = video.is_some();

    classifier.set_eval();

    for step_i in 0..options.horizon {
        horizon_reached = step_i + 1;
        let action = policy.act(&obs, goal.as_ref())?;
        let stepped = env.step(&action);
        let Some(outcome) = recover(&*env, stepped)? else {
            break;
        };
        obs = outcome.observation;

        if options.render {
            let rendered = env.render(RenderMode::Human);
            if recover(&*env, rendered)?.is_none() {
                break;
            }
        }

        total_reward += outcome.reward;
        let current = env.is_success();
        for (k, v) in success.iter_mut() {
            *v = *v || current.get(k).copied().unwrap_or(false);
        }

        if capture {
            if video_count.is_multiple_of(options.video_skip.max(1)) {
                let mode = RenderMode::RgbArray {
                    height: DIAGNOSTIC_FRAME_SIZE,
                    width: DIAGNOSTIC_FRAME_SIZE,
                };
                let rendered = env.render(mode);
                match recover(&*env, rendered)? {
                    Some(Some(frame)) => saved_frames.push(frame),
                    Some(None) => {}
                    None => break,
                }
            }
            video_count += 1;
        }

        let task_success = success.get(TASK_SUCCESS_KEY).copied().unwrap_or(false);
        if outcome.done || (options.terminate_on_success && task_success) {
            break;
        }

        let state = env.state_layout().compress(&obs.flatten())?;
        trajectory.states.push(state);
        trajectory.actions.push(action);
    }

    trajectory.success = success.get(TASK_SUCCESS_KEY).copied().unwrap_or(false);
    let dataset = TrajectoryWindowDataset::from_trajectories(
        [trajectory.clone()],
        classifier.num_past(),
        classifier.num_future(),
        WindowMode::Train,
    )?;
    let scores = score_trajectory(classifier, &dataset, 0)?;
    if let Some(sink) = video {
        write_diagnostic_video(sink, &saved_frames, &scores)?;
    }
    debug!(
        "{}: {} steps recorded, {} windows scored, success={}",
        env.name(),
        trajectory.len(),
        scores.probabilities.len(),
        trajectory.success
    );

    Ok((
        RolloutResult {
            ret: total_reward,
            horizon: horizon_reached,
            success,
            true_labels: scores.true_labels,
            predicted_labels: scores.predicted_labels,
        },
        trajectory,
    ))
}

/// Scores every window of `trajectory` in `dataset` without updating the
/// classifier.
pub fn score_trajectory(
    classifier: &TrajectoryClassifier,
    dataset: &TrajectoryWindowDataset,
    trajectory: usize,
) -> Result<EpisodeScores> {
    let windows: Vec<usize> = dataset.trajectory_windows(trajectory).collect();
    let loader = WindowLoader::new(dataset, SCORING_BATCH, classifier.device());
    let mut scores = EpisodeScores::default();
    for chunk in windows.chunks(SCORING_BATCH) {
        let batch = loader.collate(chunk)?;
        let probs = classifier.forward(&batch.inputs)?.to_vec1::<f32>()?;
        let labels = batch.labels.to_vec1::<f32>()?;
        for (p, label) in probs.into_iter().zip(labels) {
            scores.predicted_labels.push(classifier.predicts_success(p));
            scores.true_labels.push(label > 0.5);
            scores.probabilities.push(p);
        }
    }
    Ok(scores)
}

/// Emits frame `i` only while windows `5i..5i+5` exist, each showing the
/// predictions made up to that point.
fn write_diagnostic_video(
    sink: &mut VideoSink,
    frames: &[Frame],
    scores: &EpisodeScores,
) -> Result<()> {
    let n = scores.probabilities.len();
    for (i, frame) in frames.iter().enumerate() {
        let seen = WINDOWS_PER_FRAME * (i + 1);
        if seen > n {
            break;
        }
        let correct: Vec<bool> = scores.true_labels[..seen]
            .iter()
            .zip(&scores.predicted_labels[..seen])
            .map(|(t, p)| t == p)
            .collect();
        let env_frame = frame_to_image(frame)?;
        let scatter = scatter_panel(&correct, DIAGNOSTIC_FRAME_SIZE);
        let probability = probability_panel(&scores.probabilities[..seen], DIAGNOSTIC_FRAME_SIZE);
        sink.write_frame(&compose_panels(
            &[&env_frame, &scatter, &probability],
            DIAGNOSTIC_FRAME_SIZE,
        ))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use probe_env::{EnvMeta, ReachConfig, ReachEnv, ReachExpert, StateLayout, StepOutcome};

    use super::*;

    /// Never done; `near_goal` holds only at step 2 and `task` only at step 3.
    struct Flicker {
        t: usize,
        layout: StateLayout,
    }

    impl Flicker {
        fn new() -> Self {
            Self {
                t: 0,
                layout: StateLayout::identity(2),
            }
        }

        fn observation(&self) -> Observation {
            Observation::new().with("x", vec![self.t as f32, 0.0])
        }
    }

    impl Environment for Flicker {
        fn name(&self) -> &str {
            "Flicker"
        }

        fn reset(&mut self) -> Result<Observation, EnvError> {
            self.t = 0;
            Ok(self.observation())
        }

        fn step(&mut self, _action: &[f32]) -> Result<StepOutcome, EnvError> {
            self.t += 1;
            Ok(StepOutcome {
                observation: self.observation(),
                reward: 0.0,
                done: false,
                info: serde_json::Value::Null,
            })
        }

        fn is_success(&self) -> BTreeMap<String, bool> {
            BTreeMap::from([
                (TASK_SUCCESS_KEY.to_string(), self.t == 3),
                ("near_goal".to_string(), self.t == 2),
            ])
        }

        fn render(&mut self, _mode: RenderMode) -> Result<Option<Frame>, EnvError> {
            Ok(None)
        }

        fn state_layout(&self) -> &StateLayout {
            &self.layout
        }

        fn meta(&self) -> EnvMeta {
            EnvMeta {
                env_name: "Flicker".into(),
                env_type: "flicker".into(),
                env_kwargs: serde_json::json!({}),
            }
        }
    }

    struct Idle;

    impl RolloutPolicy for Idle {
        fn start_episode(&mut self) {}

        fn act(
            &mut self,
            _observation: &Observation,
            _goal: Option<&Observation>,
        ) -> Result<Vec<f32>> {
            Ok(vec![0.0])
        }
    }

    fn classifier(state_dim: usize) -> Result<TrajectoryClassifier> {
        TrajectoryClassifier::new(state_dim, 2, 2, 0.5, &Device::Cpu)
    }

    fn env(max_steps: usize) -> ReachEnv {
        ReachEnv::new(
            "Reach",
            ReachConfig {
                max_steps,
                max_drift: 0.0,
                seed: 11,
                ..Default::default()
            },
        )
    }

    #[test]
    fn done_step_is_not_recorded() -> Result<()> {
        let mut env = env(12);
        let mut policy = ReachExpert::new(0.0, 0.0, 0);
        let mut clf = classifier(env.state_layout().state_dim())?;
        let opts = EpisodeOptions {
            horizon: 50,
            ..Default::default()
        };
        let (result, trajectory) = run_rollout(&mut policy, &mut env, &mut clf, &opts, None)?;
        assert_eq!(result.horizon, 12);
        assert_eq!(trajectory.len(), 11);
        assert_eq!(trajectory.actions.len(), 11);
        assert_eq!(trajectory.states[0].len(), 6);
        // 11 steps, p = f = 2
        assert_eq!(result.true_labels.len(), 7);
        assert_eq!(result.predicted_labels.len(), 7);
        assert!(result.true_labels.iter().all(|&t| t == trajectory.success));
        Ok(())
    }

    #[test]
    fn task_success_ends_the_episode_before_recording() -> Result<()> {
        let mut env = Flicker::new();
        let mut clf = classifier(2)?;
        let opts = EpisodeOptions {
            horizon: 10,
            terminate_on_success: true,
            ..Default::default()
        };
        let (result, trajectory) = run_rollout(&mut Idle, &mut env, &mut clf, &opts, None)?;
        assert_eq!(result.horizon, 3);
        assert_eq!(trajectory.len(), 2);
        assert_eq!(trajectory.states, vec![vec![1.0, 0.0], vec![2.0, 0.0]]);
        assert!(trajectory.success);
        assert!(result.success[TASK_SUCCESS_KEY]);
        assert!(result.success["near_goal"]);
        Ok(())
    }

    #[test]
    fn success_flags_latch_once_seen() -> Result<()> {
        let mut env = Flicker::new();
        let mut clf = classifier(2)?;
        let opts = EpisodeOptions {
            horizon: 10,
            ..Default::default()
        };
        let (result, trajectory) = run_rollout(&mut Idle, &mut env, &mut clf, &opts, None)?;
        assert_eq!(result.horizon, 10);
        assert_eq!(trajectory.len(), 10);
        assert!(trajectory.success);
        assert!(result.success.values().all(|&v| v));
        // 10 steps, p = f = 2
        assert!(result.true_labels.iter().all(|&t| t));
        assert_eq!(result.true_labels.len(), 6);
        Ok(())
    }

    #[test]
    fn horizon_caps_the_episode() -> Result<()> {
        let mut env = env(1000);
        let mut policy = ReachExpert::new(0.0, 0.0, 0);
        let mut clf = classifier(6)?;
        let opts = EpisodeOptions {
            horizon: 8,
            ..Default::default()
        };
        let (result, trajectory) = run_rollout(&mut policy, &mut env, &mut clf, &opts, None)?;
        assert_eq!(result.horizon, 8);
        assert_eq!(trajectory.len(), 8);
        assert!(result.success.contains_key("near_goal"));
        Ok(())
    }

    #[test]
    fn zero_horizon_records_nothing() -> Result<()> {
        let mut env = env(10);
        let mut policy = ReachExpert::new(1.0, 0.0, 0);
        let mut clf = classifier(6)?;
        let opts = EpisodeOptions {
            horizon: 0,
            ..Default::default()
        };
        let (result, trajectory) = run_rollout(&mut policy, &mut env, &mut clf, &opts, None)?;
        assert_eq!(result.horizon, 0);
        assert!(trajectory.is_empty());
        assert!(result.true_labels.is_empty());
        Ok(())
    }

    #[test]
    fn diagnostic_video_has_one_frame_per_five_windows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut env = env(1000);
        let mut policy = ReachExpert::new(0.0, 0.0, 0);
        let mut clf = classifier(6)?;
        let opts = EpisodeOptions {
            horizon: 30,
            video_skip: 5,
            ..Default::default()
        };
        let mut sink = VideoSink::new(dir.path().join("diag.gif"));
        let (result, _) = run_rollout(&mut policy, &mut env, &mut clf, &opts, Some(&mut sink))?;
        // 30 recorded steps give 26 windows; 6 frames captured, 5 fully covered
        assert_eq!(result.true_labels.len(), 26);
        assert_eq!(sink.frames(), 5);
        Ok(())
    }

    #[test]
    fn scoring_matches_single_window_prediction() -> Result<()> {
        let clf = classifier(3)?;
        let t = Trajectory {
            states: (0..9).map(|i| vec![i as f32 * 0.1, 0.0, 1.0]).collect(),
            actions: (0..9).map(|_| vec![0.2, -0.2]).collect(),
            success: false,
        };
        let ds = TrajectoryWindowDataset::from_trajectories([t], 2, 2, WindowMode::Train)?;
        let scores = score_trajectory(&clf, &ds, 0)?;
        assert_eq!(scores.probabilities.len(), 5);
        let (x, _) = ds.get(3, &Device::Cpu)?;
        let single = clf.predict(&x)?;
        assert!((scores.probabilities[3] - single).abs() < 1e-5);
        assert!(scores.true_labels.iter().all(|&t| !t));
        Ok(())
    }
}
