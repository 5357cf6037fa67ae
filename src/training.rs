//! # Training Infrastructure
//!
//! One-step training of the learned simulator, plus the validation and
//! rollout evaluation entry points.
//!
//! ## Training step
//!
//! ```text
//! batch ──► random-walk noise (kinematic rows zeroed)
//!       ──► predict_accelerations(noisy window) ──► (predicted, target)
//!       ──► masked MSE over non-kinematic particles
//!       ──► backward ──► all-reduce mean of gradients ──► Adam step
//! ```
//!
//! The learning rate follows `lr_init · lr_decay^(step / lr_decay_steps)`,
//! scaled by the world size. Rank 0 alone writes checkpoints and the loss
//! history. Every rank checks the shared cancellation token at the start
//! and at the end of each step; the decision is agreed collectively, so all
//! ranks stop after the same step.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::checkpoint::{latest_step, model_file_name, pair_for_step, resolve_pair, write_atomic, CheckpointSelector};
use crate::config::{Mode, TrainConfig};
use crate::dataset::{TrajectoryDataset, TEST_SPLIT, VALID_SPLIT};
use crate::distributed::{any_rank, broadcast_parameters, mean_over_ranks, sync_gradients, CancellationToken, Collective};
use crate::error::GnsError;
use crate::features::non_kinematic_weights;
use crate::graph::EdgeIndex;
use crate::metadata::Metadata;
use crate::noise::RandomWalkNoise;
use crate::optimizer::{Adam, LRScheduler, ParamsAdam};
use crate::rollout::{rollout_many, RolloutExample};
use crate::simulator::LearnedCylinderSimulator;
use crate::GnsResult;

// ═══════════════════════════════════════════════════════════════════════════
// BATCHES
// ═══════════════════════════════════════════════════════════════════════════

/// Collated training examples
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[N, C, D]` over all examples
    pub positions: Tensor,
    /// `[N]`
    pub particle_types: Tensor,
    pub n_particles_per_example: Vec<usize>,
    pub edges: EdgeIndex,
    /// `[N, D]`
    pub next_positions: Tensor,
}

/// Anything that yields batches pass after pass
pub trait BatchSource {
    /// Next batch of the current pass, `None` at its end
    fn next_batch(&mut self) -> Option<GnsResult<Batch>>;

    /// Start a new pass
    fn reset(&mut self);
}

// ═══════════════════════════════════════════════════════════════════════════
// LOSS
// ═══════════════════════════════════════════════════════════════════════════

/// `Σ_non-kinematic ‖pred − target‖² / count`; zero when every particle is
/// kinematic.
pub fn masked_acceleration_loss(
    predicted: &Tensor,
    target: &Tensor,
    particle_types: &Tensor,
    kinematic_id: i64,
) -> GnsResult<Tensor> {
    let weights = non_kinematic_weights(particle_types, kinematic_id)?.to_dtype(predicted.dtype())?;
    let count = weights.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
    let per_particle = (predicted - target)?.sqr()?.sum(1)?;
    let total = (per_particle * weights)?.sum_all()?;
    if count == 0.0 {
        return Ok(total.zeros_like()?);
    }
    Ok((total / count)?)
}

// ═══════════════════════════════════════════════════════════════════════════
// LOSS HISTORY
// ═══════════════════════════════════════════════════════════════════════════

/// `(step, loss)` records kept by rank 0
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossHistory {
    pub train: Vec<(usize, f64)>,
    pub valid: Vec<(usize, f64)>,
}

impl LossHistory {
    pub fn file_name(exp_id: &str) -> String {
        format!("{}-loss.json", exp_id)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> GnsResult<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| GnsError::SerializationError(e.to_string()))?;
        write_atomic(path.as_ref(), |tmp| Ok(std::fs::write(tmp, json.as_bytes())?))
    }

    /// Empty history when the file does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> GnsResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| GnsError::Io(format!("Failed to read {:?}: {}", path, e)))?;
        serde_json::from_str(&content).map_err(|e| GnsError::SerializationError(e.to_string()))
    }

    /// Drop records past `step` (after resuming from an older checkpoint)
    pub fn truncate_after(&mut self, step: usize) {
        self.train.retain(|(s, _)| *s <= step);
        self.valid.retain(|(s, _)| *s <= step);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TRAINER
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Reached `ntraining_steps`
    Completed,
    /// Cancellation token raised on some rank
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    pub final_step: usize,
    pub stop_reason: StopReason,
    pub last_loss: Option<f64>,
}

/// Training loop of one rank
pub struct Trainer {
    simulator: LearnedCylinderSimulator,
    optimizer: Adam,
    scheduler: LRScheduler,
    noise: RandomWalkNoise,
    config: TrainConfig,
    collective: Box<dyn Collective>,
    cancel: CancellationToken,
    history: LossHistory,
    global_step: usize,
}

impl Trainer {
    /// Parameters are broadcast from rank 0 so all replicas start equal.
    pub fn new(
        simulator: LearnedCylinderSimulator,
        config: TrainConfig,
        collective: Box<dyn Collective>,
        cancel: CancellationToken,
    ) -> GnsResult<Self> {
        config.validate()?;
        let optimizer = Adam::from_varmap(
            simulator.varmap(),
            ParamsAdam {
                lr: config.lr_init,
                ..Default::default()
            },
        )?;
        broadcast_parameters(collective.as_ref(), optimizer.vars())?;

        let scheduler = LRScheduler::new(
            config.lr_init,
            config.lr_decay,
            config.lr_decay_steps,
            collective.world_size(),
        );
        let noise = RandomWalkNoise::new(config.seed.wrapping_add(collective.rank() as u64));

        Ok(Self {
            simulator,
            optimizer,
            scheduler,
            noise,
            config,
            collective,
            cancel,
            history: LossHistory::default(),
            global_step: 0,
        })
    }

    pub fn simulator(&self) -> &LearnedCylinderSimulator {
        &self.simulator
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn history(&self) -> &LossHistory {
        &self.history
    }

    pub fn learning_rate(&self) -> f64 {
        self.scheduler.get_lr()
    }

    fn history_path(&self) -> PathBuf {
        self.config.model_path.join(LossHistory::file_name(&self.config.exp_id))
    }

    /// Restore the configured checkpoint pair; `Ok(None)` starts from scratch.
    pub fn resume(&mut self) -> GnsResult<Option<usize>> {
        let Some(pair) = resolve_pair(
            &self.config.model_path,
            &self.config.exp_id,
            &self.config.model_file,
            &self.config.train_state_file,
        )?
        else {
            log::info!("No checkpoint in {:?}, training from scratch", self.config.model_path);
            return Ok(None);
        };

        self.simulator.load(&pair.model)?;
        let step = self.optimizer.load_state(&pair.train_state)?;
        if step != pair.step {
            return Err(GnsError::CheckpointMismatch(format!(
                "{:?} records step {} but its name says {}",
                pair.train_state, step, pair.step
            )));
        }
        self.global_step = step;
        self.scheduler.set_step(step);
        self.history = LossHistory::load_or_default(self.history_path())?;
        self.history.truncate_after(step);

        log::info!("Resumed from step {} ({:?})", step, pair.model);
        Ok(Some(step))
    }

    /// Forward pass and loss of one batch with fresh noise
    fn batch_loss(&mut self, batch: &Batch) -> GnsResult<Tensor> {
        let kinematic_id = self.simulator.kinematic_particle_id();
        let noise = self.noise.sample_for(
            &batch.positions,
            &batch.particle_types,
            self.config.noise_std,
            kinematic_id,
        )?;
        let (predicted, target) = self.simulator.predict_accelerations(
            &batch.next_positions,
            &batch.positions,
            &noise,
            &batch.particle_types,
            &batch.edges,
        )?;
        masked_acceleration_loss(&predicted, &target, &batch.particle_types, kinematic_id)
    }

    /// One optimizer step; returns this rank's loss
    pub fn train_step(&mut self, batch: &Batch) -> GnsResult<f64> {
        let loss = self.batch_loss(batch)?;
        let loss_value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;

        let mut grads = loss.backward()?;
        sync_gradients(self.collective.as_ref(), self.optimizer.vars(), &mut grads)?;

        let lr = self.scheduler.get_lr();
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(&grads)?;

        self.scheduler.step();
        self.global_step += 1;
        Ok(loss_value)
    }

    /// Mean noisy one-step loss over a validation source, averaged over ranks
    pub fn validate(&mut self, source: &mut dyn BatchSource) -> GnsResult<f64> {
        source.reset();
        let mut sums = [0.0f32, 0.0];
        while let Some(batch) = source.next_batch() {
            let loss = self.batch_loss(&batch?)?;
            sums[0] += loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            sums[1] += 1.0;
        }
        self.collective.all_reduce_sum(&mut sums)?;
        if sums[1] == 0.0 {
            return Err(GnsError::InvalidConfig("validation split produced no batches".to_string()));
        }
        Ok((sums[0] / sums[1]) as f64)
    }

    fn should_stop(&self) -> GnsResult<bool> {
        any_rank(self.collective.as_ref(), self.cancel.is_cancelled())
    }

    /// Write the checkpoint pair and loss history for the current step (rank 0)
    pub fn save_checkpoint(&self) -> GnsResult<()> {
        if !self.collective.is_root() {
            return Ok(());
        }
        let pair = pair_for_step(&self.config.model_path, &self.config.exp_id, self.global_step);
        self.simulator.save(&pair.model)?;
        self.optimizer.save_state(&pair.train_state, self.global_step)?;
        self.history.save(self.history_path())?;
        Ok(())
    }

    /// Train until `ntraining_steps` or cancellation.
    pub fn train(
        &mut self,
        source: &mut dyn BatchSource,
        mut valid: Option<&mut dyn BatchSource>,
    ) -> GnsResult<TrainOutcome> {
        let mut last_loss = None;
        let mut stop_reason = StopReason::Completed;
        let start = Instant::now();

        log::info!(
            "rank {}/{}: training from step {} to {}",
            self.collective.rank(),
            self.collective.world_size(),
            self.global_step,
            self.config.ntraining_steps
        );

        'passes: while self.global_step < self.config.ntraining_steps {
            source.reset();
            let mut batches = 0usize;

            while let Some(batch) = source.next_batch() {
                if self.should_stop()? {
                    stop_reason = StopReason::Cancelled;
                    break 'passes;
                }
                if self.global_step >= self.config.ntraining_steps {
                    break;
                }
                let batch = batch?;
                batches += 1;

                let loss = self.train_step(&batch)?;
                let step = self.global_step;

                if step % self.config.nlog_steps == 0 {
                    let mean = mean_over_ranks(self.collective.as_ref(), loss)?;
                    last_loss = Some(mean);
                    if self.collective.is_root() {
                        log::info!(
                            "step {}/{}: loss={:.6}, lr={:.3e}, {:.1} steps/s",
                            step,
                            self.config.ntraining_steps,
                            mean,
                            self.scheduler.get_lr(),
                            step as f64 / start.elapsed().as_secs_f64().max(1e-9)
                        );
                        self.history.train.push((step, mean));
                    }
                }

                if let Some(ref mut valid_source) = valid {
                    if step % self.config.nvalid_steps == 0 {
                        let valid_loss = self.validate(&mut **valid_source)?;
                        if self.collective.is_root() {
                            log::info!("step {}: validation loss={:.6}", step, valid_loss);
                            self.history.valid.push((step, valid_loss));
                        }
                    }
                }

                if step % self.config.nsave_steps == 0 {
                    self.save_checkpoint()?;
                }

                if self.should_stop()? {
                    stop_reason = StopReason::Cancelled;
                    break 'passes;
                }
            }

            self.collective.barrier()?;
            if batches == 0 && self.global_step < self.config.ntraining_steps {
                return Err(GnsError::InvalidConfig(
                    "training split produced no batches".to_string(),
                ));
            }
        }

        match stop_reason {
            StopReason::Cancelled => log::warn!("Training interrupted at step {}", self.global_step),
            StopReason::Completed => log::info!("Training finished at step {}", self.global_step),
        }
        self.save_checkpoint()?;

        Ok(TrainOutcome {
            final_step: self.global_step,
            stop_reason,
            last_loss,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// EVALUATION
// ═══════════════════════════════════════════════════════════════════════════

/// Model file named by `selector`, or the latest one for `Latest`
pub fn resolve_model_file(model_path: &Path, exp_id: &str, selector: &CheckpointSelector) -> GnsResult<PathBuf> {
    let path = match selector {
        CheckpointSelector::File(name) => model_path.join(name),
        CheckpointSelector::Latest => match latest_step(model_path, exp_id)? {
            Some(step) => model_path.join(model_file_name(exp_id, step)),
            None => model_path.join(model_file_name(exp_id, 0)),
        },
    };
    if !path.exists() {
        return Err(GnsError::ModelNotFound(path));
    }
    Ok(path)
}

/// Roll out every trajectory of `dataset`; returns the mean final-step loss.
///
/// With `output_path` set, example `i` is written to `rollout_<i>.json`.
pub fn evaluate_rollouts(
    simulator: &LearnedCylinderSimulator,
    dataset: &TrajectoryDataset,
    metadata: &Metadata,
    output_path: Option<&Path>,
) -> GnsResult<f64> {
    let window = simulator.input_sequence_length();
    let nsteps = metadata.sequence_length.saturating_sub(window);
    let examples: Vec<RolloutExample> = dataset
        .rollout_examples(window, Some(nsteps))?
        .into_iter()
        .map(|(example, _)| example)
        .collect();

    let results = rollout_many(simulator, &examples, nsteps)?;
    let mut total = 0.0;
    for (i, (output, loss)) in results.into_iter().enumerate() {
        log::info!("Predicting example {} loss: {:.6}", i, loss);
        total += loss;
        if let Some(dir) = output_path {
            output
                .with_metadata(metadata)
                .save_json(dir.join(format!("rollout_{}.json", i)))?;
        }
    }
    if examples.is_empty() {
        return Err(GnsError::InvalidConfig("no trajectories to roll out".to_string()));
    }
    let mean = total / examples.len() as f64;
    log::info!("Mean loss on rollout prediction: {:.6}", mean);
    Ok(mean)
}

/// `valid` or `rollout` mode: load the model, roll out the split, report
pub fn predict(
    config: &TrainConfig,
    simulator_config: &crate::config::SimulatorConfig,
    mode: Mode,
    device: &Device,
) -> GnsResult<f64> {
    let model_file = resolve_model_file(&config.model_path, &config.exp_id, &config.model_file)?;
    let metadata = Metadata::read(&config.data_path)?;
    let (simulator, _varmap) =
        LearnedCylinderSimulator::new_random(&metadata, simulator_config, config.noise_std, device)?;
    simulator.load(&model_file)?;

    let (split, output) = match mode {
        Mode::Rollout => (TEST_SPLIT, Some(config.output_path.as_path())),
        Mode::Valid => (VALID_SPLIT, None),
        Mode::Train => {
            return Err(GnsError::InvalidConfig("predict runs in valid or rollout mode".to_string()))
        }
    };
    let dataset = TrajectoryDataset::load_split(&config.data_path, split, device)?;
    evaluate_rollouts(&simulator, &dataset, &metadata, output)
}
