//! # Mill GNS CLI
//!
//! Train the learned mill simulator, validate it, or roll out test
//! trajectories.
//!
//! ## Usage
//!
//! ```bash
//! # Train from scratch (or resume from the latest checkpoint pair)
//! cargo run --release --bin gns -- --mode train --data-path data/ --model-path models/
//!
//! # Data-parallel training on four ranks
//! cargo run --release --bin gns -- --mode train --world-size 4
//!
//! # Roll out the test split with a specific checkpoint
//! cargo run --release --bin gns -- --mode rollout --model-file test-model-20000.pt
//!
//! # Read the whole training setup from JSON
//! cargo run --release --bin gns -- --mode train --config train.json
//! ```
//!
//! Ctrl-C stops training cleanly: every rank finishes its step, a final
//! checkpoint pair is written and the process exits.

use candle_core::Device;
use clap::Parser;
use std::path::PathBuf;
use std::thread;

use mill_gns::{
    checkpoint::CheckpointSelector,
    config::{Mode, SimulatorConfig, TrainConfig},
    dataset::{TrajectoryDataset, WindowLoader, TRAIN_SPLIT, VALID_SPLIT},
    distributed::{CancellationToken, Collective, SingleProcess, ThreadGroup},
    metadata::Metadata,
    simulator::LearnedCylinderSimulator,
    training::{predict, StopReason, Trainer},
    GnsError, GnsResult,
};

/// Learned particle simulator for a cylindrical mill
#[derive(Parser, Debug)]
#[command(name = "gns", about = "Graph network simulator for granular flow in a mill", version)]
struct Args {
    /// What to do
    #[arg(long, value_enum, default_value = "train")]
    mode: Mode,

    /// Training configuration JSON; replaces the flags below when given
    #[arg(long)]
    config: Option<PathBuf>,

    /// Simulator configuration JSON (network sizes, feature layout)
    #[arg(long)]
    simulator_config: Option<PathBuf>,

    /// Directory holding metadata.json and the dataset splits
    #[arg(long, default_value = "data")]
    data_path: PathBuf,

    /// Directory for checkpoints and loss history
    #[arg(long, default_value = "models")]
    model_path: PathBuf,

    /// Directory for rollout records
    #[arg(long, default_value = "rollouts")]
    output_path: PathBuf,

    /// Model checkpoint to load, or "latest"
    #[arg(long, default_value = "latest")]
    model_file: CheckpointSelector,

    /// Train state to load, or "latest"
    #[arg(long, default_value = "latest")]
    train_state_file: CheckpointSelector,

    /// Experiment id used in checkpoint names
    #[arg(long, default_value = "test")]
    exp_id: String,

    #[arg(long, default_value = "1")]
    batch_size: usize,

    /// Std of the random-walk input noise
    #[arg(long, default_value = "0.00067")]
    noise_std: f64,

    #[arg(long, default_value = "20000000")]
    ntraining_steps: usize,

    #[arg(long, default_value = "2000")]
    nvalid_steps: usize,

    #[arg(long, default_value = "2000")]
    nsave_steps: usize,

    #[arg(long, default_value = "100")]
    nlog_steps: usize,

    #[arg(long, default_value = "0.01")]
    lr_init: f64,

    #[arg(long, default_value = "0.001")]
    lr_decay: f64,

    #[arg(long, default_value = "5000000")]
    lr_decay_steps: usize,

    /// Share of train trajectories kept for training when there is no valid split
    #[arg(long, default_value = "0.8")]
    train_ratio: f64,

    #[arg(long, default_value = "42")]
    seed: u64,

    /// Number of data-parallel ranks (threads)
    #[arg(long, default_value = "1")]
    world_size: usize,

    /// Run on the first CUDA device when available
    #[arg(long)]
    cuda: bool,
}

impl Args {
    fn train_config(&self) -> GnsResult<TrainConfig> {
        if let Some(path) = &self.config {
            log::info!("Reading training configuration from {:?}", path);
            return TrainConfig::from_json_file(path);
        }
        let config = TrainConfig {
            batch_size: self.batch_size,
            noise_std: self.noise_std,
            data_path: self.data_path.clone(),
            model_path: self.model_path.clone(),
            output_path: self.output_path.clone(),
            model_file: self.model_file.clone(),
            train_state_file: self.train_state_file.clone(),
            exp_id: self.exp_id.clone(),
            ntraining_steps: self.ntraining_steps,
            nvalid_steps: self.nvalid_steps,
            nsave_steps: self.nsave_steps,
            nlog_steps: self.nlog_steps,
            lr_init: self.lr_init,
            lr_decay: self.lr_decay,
            lr_decay_steps: self.lr_decay_steps,
            train_ratio: self.train_ratio,
            seed: self.seed,
        };
        config.validate()?;
        Ok(config)
    }

    fn simulator_config(&self) -> GnsResult<SimulatorConfig> {
        match &self.simulator_config {
            Some(path) => SimulatorConfig::from_json_file(path),
            None => Ok(SimulatorConfig::default()),
        }
    }
}

fn select_device(cuda: bool) -> Device {
    if cuda || cfg!(feature = "cuda") {
        match Device::cuda_if_available(0) {
            Ok(d) => {
                log::info!("Using device {:?}", d);
                d
            }
            Err(e) => {
                log::warn!("CUDA not available ({}), using CPU", e);
                Device::Cpu
            }
        }
    } else {
        log::info!("Using CPU device");
        Device::Cpu
    }
}

/// Cancel `token` on the first Ctrl-C.
fn install_interrupt_handler(token: CancellationToken) {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                log::warn!("Ctrl-C handling disabled: {}", e);
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupt received, stopping after the current step");
                token.cancel();
            }
        });
    });
}

struct Splits {
    train: TrajectoryDataset,
    valid: Option<TrajectoryDataset>,
}

fn load_splits(config: &TrainConfig, device: &Device) -> GnsResult<Splits> {
    let train = TrajectoryDataset::load_split(&config.data_path, TRAIN_SPLIT, device)?;
    let valid_file = config.data_path.join(format!("{}.safetensors", VALID_SPLIT));
    if valid_file.exists() {
        let valid = TrajectoryDataset::load_split(&config.data_path, VALID_SPLIT, device)?;
        return Ok(Splits {
            train,
            valid: Some(valid),
        });
    }
    if config.train_ratio < 1.0 && train.len() > 1 {
        let (train, valid) = train.split(config.train_ratio);
        log::info!(
            "No {} split, holding out {} of {} train trajectories",
            VALID_SPLIT,
            valid.len(),
            train.len() + valid.len()
        );
        let valid = (!valid.is_empty()).then_some(valid);
        return Ok(Splits { train, valid });
    }
    Ok(Splits { train, valid: None })
}

#[allow(clippy::too_many_arguments)]
fn run_rank(
    collective: Box<dyn Collective>,
    metadata: &Metadata,
    simulator_config: &SimulatorConfig,
    config: &TrainConfig,
    splits: &Splits,
    cancel: CancellationToken,
    device: &Device,
) -> GnsResult<(usize, StopReason)> {
    let rank = collective.rank();
    let world_size = collective.world_size();

    let (simulator, _varmap) =
        LearnedCylinderSimulator::new_random(metadata, simulator_config, config.noise_std, device)?;
    if collective.is_root() {
        log::info!("Simulator has {} parameters", simulator.num_parameters());
    }
    let window = simulator.input_sequence_length();

    let mut trainer = Trainer::new(simulator, config.clone(), collective, cancel)?;
    trainer.resume()?;

    let seed = config.seed.wrapping_add(rank as u64);
    let mut loader = WindowLoader::new(
        &splits.train,
        window,
        config.batch_size,
        true,
        seed,
        rank,
        world_size,
        device.clone(),
    )?;
    let mut valid_loader = match &splits.valid {
        Some(valid) => Some(WindowLoader::new(
            valid,
            window,
            config.batch_size,
            false,
            seed,
            rank,
            world_size,
            device.clone(),
        )?),
        None => None,
    };

    let outcome = match valid_loader.as_mut() {
        Some(valid) => trainer.train(&mut loader, Some(valid))?,
        None => trainer.train(&mut loader, None)?,
    };
    Ok((outcome.final_step, outcome.stop_reason))
}

fn train(args: &Args, device: &Device) -> GnsResult<()> {
    let config = args.train_config()?;
    let simulator_config = args.simulator_config()?;
    let metadata = Metadata::read(&config.data_path)?;
    simulator_config.validate(metadata.dim)?;
    let splits = load_splits(&config, device)?;
    log::info!(
        "Training on {} trajectories ({} windows)",
        splits.train.len(),
        splits.train.num_windows(simulator_config.input_sequence_length)
    );

    let cancel = CancellationToken::new();
    install_interrupt_handler(cancel.clone());

    let handles: Vec<Box<dyn Collective>> = if args.world_size <= 1 {
        vec![Box::new(SingleProcess)]
    } else {
        ThreadGroup::new(args.world_size)?
            .into_iter()
            .map(|c| Box::new(c) as Box<dyn Collective>)
            .collect()
    };

    let results: Vec<GnsResult<(usize, StopReason)>> = thread::scope(|scope| {
        let workers: Vec<_> = handles
            .into_iter()
            .map(|collective| {
                let cancel = cancel.clone();
                let (metadata, simulator_config, config, splits) =
                    (&metadata, &simulator_config, &config, &splits);
                scope.spawn(move || {
                    run_rank(collective, metadata, simulator_config, config, splits, cancel, device)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| {
                worker.join().unwrap_or_else(|_| {
                    Err(GnsError::Collective("rank thread panicked".to_string()))
                })
            })
            .collect()
    });

    for (rank, result) in results.into_iter().enumerate() {
        let (step, reason) = result?;
        if rank == 0 {
            match reason {
                StopReason::Completed => log::info!("Training finished at step {}", step),
                StopReason::Cancelled => log::info!("Training cancelled at step {}", step),
            }
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::info!("mill-gns {} ({:?} mode)", mill_gns::VERSION, args.mode);
    let device = select_device(args.cuda);

    match args.mode {
        Mode::Train => train(&args, &device)?,
        Mode::Valid | Mode::Rollout => {
            let config = args.train_config()?;
            let simulator_config = args.simulator_config()?;
            let loss = predict(&config, &simulator_config, args.mode, &device)?;
            println!("Mean rollout loss: {:.6}", loss);
        }
    }
    Ok(())
}
