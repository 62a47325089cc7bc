use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{Result, bail};
use clap::Parser;
use probe_env::{EnvMeta, Environment, ReachConfig, ReachEnv};
use probe_ml::{
    TrajectoryClassifier, load_model,
    rollout::{EpisodeOptions, RolloutSettings, VideoTarget, rollout_with_stats},
};
use probe_playground::{bc_policy::BcPolicy, logging::init_tracing};
use tracing::info;

fn build_env(meta: &EnvMeta, seed: Option<u64>) -> Result<ReachEnv> {
    if meta.env_type != "reach" {
        bail!("unsupported environment type {}", meta.env_type);
    }
    let mut config: ReachConfig = serde_json::from_value(meta.env_kwargs.clone())?;
    if let Some(seed) = seed {
        config.seed = seed;
    }
    Ok(ReachEnv::new(meta.env_name.clone(), config))
}

#[derive(Parser)]
#[command(author, version, long_about = None)]
#[command(about = "Roll out a trained policy and score it with the success classifier")]
struct Cli {
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count, help = "Increase verbosity level (-v = ERROR, -vv = WARN, -vvv = INFO, -vvvv = DEBUG, -vvvvv = TRACE)")]
    verbose: u8,

    #[arg(long, help = "Policy checkpoint written by probe_train")]
    checkpoint: PathBuf,

    #[arg(long, help = "Frozen classifier weights; a fresh classifier is trained online otherwise")]
    classifier: Option<PathBuf>,

    #[arg(long, default_value_t = 10, help = "Episodes per environment")]
    n: usize,

    #[arg(long, help = "Maximum steps per episode (defaults to the training horizon)")]
    horizon: Option<usize>,

    #[arg(long, conflicts_with = "video_dir", help = "Write every environment into one GIF")]
    video_path: Option<PathBuf>,

    #[arg(long, help = "Write one GIF per environment into this directory")]
    video_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 5, help = "Capture a frame every N steps")]
    video_skip: usize,

    #[arg(long, help = "Stop an episode as soon as the task succeeds")]
    terminate_on_success: bool,

    #[arg(long, help = "Override the environment seed stored in the checkpoint")]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    let device = probe_ml::device();

    let ckpt = load_model(&cli.checkpoint, &device)?;
    let mut policy = BcPolicy::from_checkpoint(&ckpt, &device)?;
    let env = build_env(&ckpt.meta.env_meta, cli.seed)?;
    let state_dim = env.state_layout().state_dim();
    info!(
        "rolling out {} from {:?}",
        ckpt.meta.algo_name, cli.checkpoint
    );

    let cc = &ckpt.meta.config.classifier;
    let mut classifier = match cli.classifier.as_ref().or(cc.checkpoint.as_ref()) {
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

    let video = match (cli.video_path, cli.video_dir) {
        (Some(path), _) => VideoTarget::Shared(path),
        (None, Some(dir)) => {
            std::fs::create_dir_all(&dir)?;
            VideoTarget::PerEnv(dir)
        }
        (None, None) => VideoTarget::None,
    };
    let settings = RolloutSettings {
        episode: EpisodeOptions {
            horizon: cli
                .horizon
                .unwrap_or(ckpt.meta.config.experiment.rollout.horizon),
            use_goals: false,
            render: false,
            video_skip: cli.video_skip,
            terminate_on_success: cli.terminate_on_success,
        },
        num_episodes: cli.n,
        epoch: None,
        video,
        seed: cli.seed.unwrap_or(ckpt.meta.config.train.seed),
    };

    let mut envs: BTreeMap<String, Box<dyn Environment>> = BTreeMap::new();
    envs.insert(ckpt.meta.env_meta.env_name.clone(), Box::new(env));
    let output = rollout_with_stats(&mut policy, &mut classifier, &mut envs, &settings)?;

    let report: BTreeMap<&String, BTreeMap<String, f64>> = output
        .logs
        .iter()
        .map(|(name, summary)| (name, summary.to_map()))
        .collect();
    println!("{}", serde_json::to_string_pretty(&report)?);
    for (name, path) in &output.video_paths {
        info!("{} video: {:?}", name, path);
    }
    Ok(())
}
