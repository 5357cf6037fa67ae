//! # Configuration
//!
//! Immutable configuration structs built once and passed by reference into
//! the simulator, the trainer and the rollout driver.
//!
//! - [`SimulatorConfig`] - network sizes and node feature layout
//! - [`FeatureLayout`] - which node feature groups are concatenated
//! - [`TrainConfig`] - training loop schedule, paths and noise level
//!
//! Defaults reproduce the reference mill setup: latent width 128, five
//! message-passing rounds, two hidden layers of 128 per MLP, a six-step
//! position window and a 16-wide particle type embedding.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::checkpoint::CheckpointSelector;
use crate::error::GnsError;
use crate::GnsResult;

/// Number of positions in the input window (gives five velocities).
pub const INPUT_SEQUENCE_LENGTH: usize = 6;

/// Number of values contributed by the cylinder features.
pub const CYLINDER_FEATURES: usize = 3;

/// Node feature groups concatenated after the velocity history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureLayout {
    /// Clamped distances to the lower and upper wall of every axis
    pub boundaries: bool,
    /// Clamped distances to the cylinder lateral wall and end caps
    pub cylinder: bool,
    /// Learned particle type embedding
    pub type_embedding: bool,
}

impl FeatureLayout {
    /// Velocities, domain walls and type embedding (2D: 30 features).
    pub fn planar() -> Self {
        Self {
            boundaries: true,
            cylinder: false,
            type_embedding: true,
        }
    }

    /// Velocities and cylinder distances (3D: 18 features).
    pub fn cylinder() -> Self {
        Self {
            boundaries: false,
            cylinder: true,
            type_embedding: false,
        }
    }

    /// Velocities, domain walls and type embedding (3D: 37 features).
    pub fn boxed() -> Self {
        Self::planar()
    }

    /// Width of the node feature vector produced by this layout.
    pub fn width(&self, dim: usize, sequence_length: usize, embedding_size: usize) -> usize {
        let mut width = sequence_length.saturating_sub(1) * dim;
        if self.boundaries {
            width += 2 * dim;
        }
        if self.cylinder {
            width += CYLINDER_FEATURES;
        }
        if self.type_embedding {
            width += embedding_size;
        }
        width
    }
}

/// Network and feature configuration of the learned simulator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Latent width of node and edge representations
    pub latent_dim: usize,
    /// Number of message-passing rounds in the processor
    pub nmessage_passing_steps: usize,
    /// Hidden layers per MLP
    pub nmlp_layers: usize,
    /// Width of every hidden layer
    pub mlp_hidden_dim: usize,
    /// Reuse a single interaction block for every round
    pub share_processor_weights: bool,
    /// Rows of the particle type embedding table
    pub nparticle_types: usize,
    /// Width of the particle type embedding
    pub particle_type_embedding_size: usize,
    /// Particle type whose motion is prescribed, never learned
    pub kinematic_particle_id: i64,
    /// Positions per input window
    pub input_sequence_length: usize,
    /// Node input width for 2D data
    pub nnode_in_2d: usize,
    /// Node input width for 3D data
    pub nnode_in_3d: usize,
    /// Feature groups for 2D data
    pub layout_2d: FeatureLayout,
    /// Feature groups for 3D data
    pub layout_3d: FeatureLayout,
    /// LayerNorm epsilon
    pub layer_norm_eps: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            latent_dim: 128,
            nmessage_passing_steps: 5,
            nmlp_layers: 2,
            mlp_hidden_dim: 128,
            share_processor_weights: false,
            nparticle_types: 1,
            particle_type_embedding_size: 16,
            kinematic_particle_id: -1,
            input_sequence_length: INPUT_SEQUENCE_LENGTH,
            nnode_in_2d: 30,
            nnode_in_3d: 18,
            layout_2d: FeatureLayout::planar(),
            layout_3d: FeatureLayout::cylinder(),
            layer_norm_eps: 1e-5,
        }
    }
}

impl SimulatorConfig {
    /// Small network for tests and benchmarks
    pub fn tiny() -> Self {
        Self {
            latent_dim: 16,
            nmessage_passing_steps: 2,
            nmlp_layers: 1,
            mlp_hidden_dim: 16,
            particle_type_embedding_size: 4,
            nnode_in_2d: 18,
            ..Self::default()
        }
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> GnsResult<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| GnsError::Io(format!("Failed to read simulator config: {}", e)))?;
        serde_json::from_str(&content).map_err(|e| GnsError::SerializationError(e.to_string()))
    }

    /// 3D layout with domain walls and embedding instead of the cylinder.
    pub fn boxed_3d() -> Self {
        Self {
            nnode_in_3d: 37,
            layout_3d: FeatureLayout::boxed(),
            ..Self::default()
        }
    }

    /// Feature layout for the given particle dimension
    pub fn layout(&self, dim: usize) -> GnsResult<FeatureLayout> {
        match dim {
            2 => Ok(self.layout_2d),
            3 => Ok(self.layout_3d),
            other => Err(GnsError::InvalidConfig(format!(
                "particle dimension must be 2 or 3, got {}",
                other
            ))),
        }
    }

    /// Configured node input width for the given particle dimension
    pub fn nnode_in(&self, dim: usize) -> GnsResult<usize> {
        match dim {
            2 => Ok(self.nnode_in_2d),
            3 => Ok(self.nnode_in_3d),
            other => Err(GnsError::InvalidConfig(format!(
                "particle dimension must be 2 or 3, got {}",
                other
            ))),
        }
    }

    /// Check that the configuration is self-consistent for `dim`.
    pub fn validate(&self, dim: usize) -> GnsResult<()> {
        if self.input_sequence_length < 3 {
            return Err(GnsError::InvalidConfig(format!(
                "input sequence length must be at least 3, got {}",
                self.input_sequence_length
            )));
        }
        if self.nmlp_layers == 0 {
            return Err(GnsError::InvalidConfig(
                "nmlp_layers must be at least 1".to_string(),
            ));
        }
        if self.nmessage_passing_steps == 0 {
            return Err(GnsError::InvalidConfig(
                "nmessage_passing_steps must be at least 1".to_string(),
            ));
        }
        let layout = self.layout(dim)?;
        if layout.type_embedding && self.nparticle_types == 0 {
            return Err(GnsError::InvalidConfig(
                "type embedding enabled with zero particle types".to_string(),
            ));
        }
        let produced = layout.width(
            dim,
            self.input_sequence_length,
            self.particle_type_embedding_size,
        );
        let expected = self.nnode_in(dim)?;
        if produced != expected {
            return Err(GnsError::InvalidConfig(format!(
                "{}D feature layout produces {} node features but nnode_in is {}",
                dim, produced, expected
            )));
        }
        Ok(())
    }

    /// Hidden layer sizes shared by every MLP
    pub fn hidden_sizes(&self) -> Vec<usize> {
        vec![self.mlp_hidden_dim; self.nmlp_layers]
    }
}

/// What the training binary should do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Valid,
    Rollout,
}

/// Training loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Examples per batch
    pub batch_size: usize,
    /// Std of the random-walk noise at the last window step
    pub noise_std: f64,
    /// Directory holding metadata and dataset splits
    pub data_path: PathBuf,
    /// Directory for checkpoints and loss history
    pub model_path: PathBuf,
    /// Directory for rollout records
    pub output_path: PathBuf,
    /// Model checkpoint to resume from
    pub model_file: CheckpointSelector,
    /// Train state to resume from
    pub train_state_file: CheckpointSelector,
    /// Experiment id used in checkpoint names
    pub exp_id: String,
    /// Stop after this many steps
    pub ntraining_steps: usize,
    /// Steps between validation passes
    pub nvalid_steps: usize,
    /// Steps between checkpoint saves
    pub nsave_steps: usize,
    /// Steps between loss logs
    pub nlog_steps: usize,
    /// Initial learning rate
    pub lr_init: f64,
    /// Learning rate decay factor
    pub lr_decay: f64,
    /// Steps over which the rate decays by `lr_decay`
    pub lr_decay_steps: usize,
    /// Fraction of each trajectory used for training
    pub train_ratio: f64,
    /// Seed for noise and shuffling
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            noise_std: 6.7e-4,
            data_path: PathBuf::from("data"),
            model_path: PathBuf::from("models"),
            output_path: PathBuf::from("rollouts"),
            model_file: CheckpointSelector::Latest,
            train_state_file: CheckpointSelector::Latest,
            exp_id: "test".to_string(),
            ntraining_steps: 20_000_000,
            nvalid_steps: 2000,
            nsave_steps: 2000,
            nlog_steps: 100,
            lr_init: 0.01,
            lr_decay: 0.001,
            lr_decay_steps: 5_000_000,
            train_ratio: 0.8,
            seed: 42,
        }
    }
}

impl TrainConfig {
    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> GnsResult<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| GnsError::Io(format!("Failed to read train config: {}", e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| GnsError::SerializationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GnsResult<()> {
        if self.batch_size == 0 {
            return Err(GnsError::InvalidConfig("batch_size must be positive".to_string()));
        }
        if self.noise_std < 0.0 {
            return Err(GnsError::InvalidConfig(format!(
                "noise_std must be non-negative, got {}",
                self.noise_std
            )));
        }
        if self.nlog_steps == 0 || self.nsave_steps == 0 || self.nvalid_steps == 0 {
            return Err(GnsError::InvalidConfig(
                "log, save and validation intervals must be positive".to_string(),
            ));
        }
        if self.lr_decay_steps == 0 {
            return Err(GnsError::InvalidConfig(
                "lr_decay_steps must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.train_ratio) {
            return Err(GnsError::InvalidConfig(format!(
                "train_ratio must be in [0, 1], got {}",
                self.train_ratio
            )));
        }
        if self.exp_id.is_empty() || self.exp_id.contains('/') {
            return Err(GnsError::InvalidConfig(format!(
                "invalid experiment id {:?}",
                self.exp_id
            )));
        }
        Ok(())
    }
}
