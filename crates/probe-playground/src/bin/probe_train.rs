use std::{collections::BTreeMap, fs, path::PathBuf};

use anyhow::{Result, ensure};
use clap::Parser;
use probe_env::{Environment, REACH_ACTION_DIM, ReachConfig, ReachEnv, ReachExpert};
use probe_ml::{
    BestMetrics, Checkpointer, ExperimentConfig, ObsNormalizationStats, ShapeMeta,
    TrajectoryClassifier, experiment_dirs, is_every_n_steps, run_epoch,
    rollout::{EpisodeOptions, RolloutSettings, VideoTarget, rollout_with_stats},
    should_save_from_rollout_logs,
};
use probe_playground::{
    bc_policy::{BC_ALGO_NAME, BcPolicy},
    demos::{DemoLoader, collect_demos},
    logging::{ScalarLog, init_tracing},
};
use rand::{SeedableRng, rngs::StdRng};
use tracing::{info, warn};

const VALIDATION_FRACTION: f64 = 0.1;
const EXPERT_GAIN: f32 = 2.0;
const EXPERT_NOISE: f32 = 0.05;

fn train(config: ExperimentConfig, auto_remove: bool) -> Result<()> {
    let device = probe_ml::device();
    let dirs = experiment_dirs(&config, auto_remove)?;
    fs::write(dirs.run_dir.join("config.json"), config.to_json()?)?;

    let run_name = format!("{}_{}", config.experiment.name, ulid::Ulid::new());
    info!("run {} writing to {:?}", run_name, dirs.run_dir);
    let mut scalars = ScalarLog::new(Some(&dirs.log_dir));

    let seed = config.train.seed;
    let env_config = ReachConfig {
        max_steps: config.experiment.rollout.horizon,
        seed,
        ..Default::default()
    };
    let mut demo_env = ReachEnv::new("Reach", env_config.clone());
    let mut expert = ReachExpert::new(EXPERT_GAIN, EXPERT_NOISE, seed);
    let demos = collect_demos(
        &mut demo_env,
        &mut expert,
        config.train.num_demos,
        config.experiment.rollout.horizon,
    )?;
    ensure!(!demos.is_empty(), "no expert transitions collected");
    let shape_meta = ShapeMeta::from_observation(&demos.observations[0], REACH_ACTION_DIM);
    let (train_demos, valid_demos) = if config.experiment.validate {
        demos.split_validation(VALIDATION_FRACTION)?
    } else {
        (demos, Default::default())
    };

    let obs_stats = if config.train.normalize_obs {
        let observations = train_demos.observations.iter();
        Some(ObsNormalizationStats::compute(observations)?)
    } else {
        None
    };
    let mut policy = BcPolicy::new(
        shape_meta,
        obs_stats.clone(),
        config.train.learning_rate,
        &device,
    )?;

    let mut envs: BTreeMap<String, Box<dyn Environment>> = BTreeMap::new();
    let rollout_env = ReachEnv::new(
        "Reach",
        ReachConfig {
            seed: seed.wrapping_add(1),
            ..env_config
        },
    );
    let env_meta = rollout_env.meta();
    let state_dim = rollout_env.state_layout().state_dim();
    envs.insert(env_meta.env_name.clone(), Box::new(rollout_env));

    let cc = &config.classifier;
    let mut classifier = match &cc.checkpoint {
        Some(path) => TrajectoryClassifier::load(
            path,
            state_dim,
            cc.num_past,
            cc.num_future,
            cc.threshold,
            &device,
        )?,
        None => TrajectoryClassifier::new(
            state_dim,
            cc.num_past,
            cc.num_future,
            cc.threshold,
            &device,
        )?,
    };

    let checkpointer = dirs
        .model_dir
        .clone()
        .map(|dir| Checkpointer::new(config.experiment.save.every_n_epochs, dir, run_name.clone()))
        .transpose()?;
    let mut best = BestMetrics::default();

    let mut train_loader = DemoLoader::new(
        &train_demos,
        config.train.batch_size,
        StdRng::seed_from_u64(seed),
    )?;
    let mut valid_loader = DemoLoader::new(
        &valid_demos,
        config.train.batch_size,
        StdRng::seed_from_u64(seed),
    )?;

    let rollout_cfg = &config.experiment.rollout;
    for epoch in 1..=config.train.num_epochs {
        let log = run_epoch(
            &mut policy,
            &mut train_loader,
            epoch,
            false,
            config.train.epoch_num_steps,
            obs_stats.as_ref(),
        )?;
        info!(
            "Train Epoch {}: loss {:.5}, {:.3} min",
            epoch,
            log.metrics.get("Loss").copied().unwrap_or_default(),
            log.time_epoch
        );
        scalars.scalars("Train", &log.to_map(), epoch);

        if config.experiment.validate && !valid_demos.is_empty() {
            let log = run_epoch(
                &mut policy,
                &mut valid_loader,
                epoch,
                true,
                None,
                obs_stats.as_ref(),
            )?;
            info!(
                "Validation Epoch {}: loss {:.5}",
                epoch,
                log.metrics.get("Loss").copied().unwrap_or_default()
            );
            scalars.scalars("Valid", &log.to_map(), epoch);
        }

        let mut should_save = false;
        let mut video_paths = BTreeMap::new();
        if rollout_cfg.enabled
            && epoch >= rollout_cfg.warmstart
            && is_every_n_steps(Some(rollout_cfg.rate), epoch, true)?
        {
            let settings = RolloutSettings {
                episode: EpisodeOptions {
                    horizon: rollout_cfg.horizon,
                    use_goals: false,
                    render: false,
                    video_skip: config.experiment.video_skip,
                    terminate_on_success: rollout_cfg.terminate_on_success,
                },
                num_episodes: rollout_cfg.n,
                epoch: Some(epoch),
                video: if config.experiment.render_video {
                    VideoTarget::PerEnv(dirs.video_dir.clone())
                } else {
                    VideoTarget::None
                },
                seed: seed.wrapping_add(epoch as u64),
            };
            let output = rollout_with_stats(&mut policy, &mut classifier, &mut envs, &settings)?;
            for (env_name, summary) in &output.logs {
                for (k, v) in summary.to_map() {
                    scalars.scalar(&format!("Rollout/{k}/{env_name}"), v, epoch);
                }
            }

            let decision = should_save_from_rollout_logs(
                &output.logs,
                &mut best,
                &format!("model_epoch_{epoch}"),
                config.experiment.save.on_best_rollout_return,
                config.experiment.save.on_best_rollout_success_rate,
            );
            if decision.should_save_ckpt
                && let Some(ckpt) = &checkpointer
            {
                ckpt.save_named(
                    &decision.epoch_ckpt_name,
                    &policy.record(&config, &env_meta),
                )?;
                let classifier_name = format!("{}_classifier", decision.epoch_ckpt_name);
                classifier.save(&ckpt.named_path(&classifier_name))?;
                should_save = true;
            }
            video_paths = output.video_paths;
        }

        if let Some(ckpt) = &checkpointer
            && ckpt.checkpoint_item(epoch, &policy.record(&config, &env_meta), None)?
        {
            should_save = true;
        }

        if !config.experiment.keep_all_videos && !should_save {
            for path in video_paths.values().filter(|p| p.exists()) {
                if let Err(e) = fs::remove_file(path) {
                    warn!("failed to remove video {:?}: {}", path, e);
                }
            }
        }
        scalars.flush();
    }

    if let Some(ckpt) = &checkpointer {
        ckpt.save_named("model_last", &policy.record(&config, &env_meta))?;
    }
    info!("finished training run {}", run_name);
    Ok(())
}

#[derive(Parser)]
#[command(author, version, long_about = None)]
#[command(about = "Behaviour cloning on the reach task with online success classification")]
struct Cli {
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count, help = "Increase verbosity level (-v = ERROR, -vv = WARN, -vvv = INFO, -vvvv = DEBUG, -vvvvv = TRACE)")]
    verbose: u8,

    #[arg(long, help = "Path to a JSON experiment config")]
    config: Option<PathBuf>,

    #[arg(long, help = "Override the experiment name")]
    name: Option<String>,

    #[arg(long, help = "Override the output directory")]
    output_dir: Option<PathBuf>,

    #[arg(long, help = "Remove an existing experiment directory without asking")]
    auto_remove: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::from_path(path)?,
        None => ExperimentConfig::default(),
    };
    if config.algo_name.is_empty() {
        config.algo_name = BC_ALGO_NAME.to_string();
    }
    if let Some(name) = cli.name {
        config.experiment.name = name;
    }
    if let Some(dir) = cli.output_dir {
        config.train.output_dir = dir;
    }
    config.validate()?;

    train(config, cli.auto_remove)
}
