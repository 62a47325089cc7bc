use std::{collections::BTreeMap, path::PathBuf, time::Instant};

use anyhow::{Result, ensure};
use probe_env::{Environment, RolloutPolicy, TASK_SUCCESS_KEY};
use rand::{SeedableRng, rngs::StdRng};
use tracing::{debug, info};

use super::{
    RolloutResult, RolloutSummary,
    episode::{EpisodeOptions, run_rollout},
    video::{VideoSink, VideoTarget},
};
use crate::{
    classifier::{CLASSIFIER_BATCH_SIZE, CLASSIFIER_EPOCHS, TrajectoryClassifier, train_classifier},
    loader::WindowLoader,
    metrics::ClassificationReport,
    window::{TrajectorySet, WindowMode},
};

/// How [`rollout_with_stats`] drives each environment.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutSettings {
    pub episode: EpisodeOptions,
    pub num_episodes: usize,
    /// Used in video file names.
    pub epoch: Option<usize>,
    pub video: VideoTarget,
    /// Seeds the classifier's batch shuffling.
    pub seed: u64,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            episode: EpisodeOptions::default(),
            num_episodes: 1,
            epoch: None,
            video: VideoTarget::None,
            seed: 0,
        }
    }
}

/// Per-environment summaries and video files of one rollout batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RolloutOutput {
    pub logs: BTreeMap<String, RolloutSummary>,
    pub video_paths: BTreeMap<String, PathBuf>,
}

/// Rolls `policy` out `num_episodes` times in every environment.
///
/// Each episode is scored online by `classifier`; the final episode of each
/// environment also writes its diagnostic video. After an environment's
/// episodes, the classifier is retrained on all of them unless it is a
/// checkpoint. The reported classifier metrics come from the scores taken
/// before that retraining.
pub fn rollout_with_stats(
    policy: &mut dyn RolloutPolicy,
    classifier: &mut TrajectoryClassifier,
    envs: &mut BTreeMap<String, Box<dyn Environment>>,
    settings: &RolloutSettings,
) -> Result<RolloutOutput> {
    ensure!(
        settings.num_episodes > 0,
        "rollout needs at least one episode"
    );
    let mut output = RolloutOutput::default();
    let mut shared_sink = match &settings.video {
        VideoTarget::Shared(path) => Some(VideoSink::new(path)),
        _ => None,
    };

    for (env_key, env) in envs.iter_mut() {
        let env_name = env.name().to_string();
        let mut env_sink = match &settings.video {
            VideoTarget::PerEnv(_) => settings
                .video
                .path_for(&env_name, settings.epoch)
                .map(VideoSink::new),
            _ => None,
        };
        if let Some(path) = settings.video.path_for(&env_name, settings.epoch) {
            output.video_paths.insert(env_key.clone(), path);
        }
        info!(
            "rollout: env={}, horizon={}, use_goals={}, num_episodes={}",
            env_name, settings.episode.horizon, settings.episode.use_goals, settings.num_episodes
        );

        let mut trajectories = TrajectorySet::new();
        let mut results: Vec<RolloutResult> = Vec::with_capacity(settings.num_episodes);
        let mut episode_seconds = 0.0;
        let mut true_labels = Vec::new();
        let mut predicted_labels = Vec::new();

        for ep_i in 0..settings.num_episodes {
            let at_end = ep_i + 1 == settings.num_episodes;
            let video = if at_end {
                env_sink.as_mut().or(shared_sink.as_mut())
            } else {
                None
            };
            let start = Instant::now();
            let (mut result, trajectory) =
                run_rollout(policy, env.as_mut(), classifier, &settings.episode, video)?;
            episode_seconds += start.elapsed().as_secs_f64();

            true_labels.append(&mut result.true_labels);
            predicted_labels.append(&mut result.predicted_labels);
            trajectories.push(trajectory);
            debug!(
                "episode {}, horizon={}, return={}, success={}",
                ep_i + 1,
                result.horizon,
                result.ret,
                result.task_success()
            );
            results.push(result);
        }
        // the diagnostic stream of a per-environment target ends with its environment
        drop(env_sink);

        let dataset = trajectories.into_dataset(
            classifier.num_past(),
            classifier.num_future(),
            WindowMode::Train,
        )?;
        if classifier.checkpoint {
            info!("using checkpointed classifier, not training");
        } else {
            let device = classifier.device().clone();
            let mut loader = WindowLoader::new(&dataset, CLASSIFIER_BATCH_SIZE, &device)
                .shuffled(StdRng::seed_from_u64(settings.seed));
            train_classifier(classifier, CLASSIFIER_EPOCHS, &mut loader)?;
        }
        drop(dataset);

        let summary = summarize(
            &results,
            episode_seconds / 60.0,
            ClassificationReport::from_labels(&true_labels, &predicted_labels),
        );
        info!(
            "{}: return {:.3}, success rate {:.3}, classifier accuracy {:.3}",
            env_name, summary.ret, summary.success_rate, summary.classifier.accuracy
        );
        output.logs.insert(env_key.clone(), summary);
    }
    Ok(output)
}

fn summarize(
    results: &[RolloutResult],
    time_episode: f64,
    classifier: ClassificationReport,
) -> RolloutSummary {
    let n = results.len().max(1) as f64;
    let mean = |f: &dyn Fn(&RolloutResult) -> f64| results.iter().map(f).sum::<f64>() / n;

    let mut criteria = BTreeMap::new();
    for key in results.iter().flat_map(|r| r.success.keys()) {
        if key != TASK_SUCCESS_KEY && !criteria.contains_key(key) {
            let rate = mean(&|r| r.success.get(key).is_some_and(|&v| v) as u8 as f64);
            criteria.insert(key.clone(), rate);
        }
    }

    RolloutSummary {
        ret: mean(&|r| r.ret),
        horizon: mean(&|r| r.horizon as f64),
        success_rate: mean(&|r| r.task_success() as u8 as f64),
        criteria,
        time_episode,
        classifier,
        num_episodes: results.len(),
    }
}
