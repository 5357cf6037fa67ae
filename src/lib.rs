//! # Mill GNS
//!
//! A learned particle simulator for granular flow inside a cylindrical mill.
//! A graph network predicts per-particle accelerations from a short history
//! of positions; semi-implicit Euler integration turns them into the next
//! positions, and rollouts chain those steps into trajectories.
//!
//! ## Features
//! - Encode-process-decode graph network on candle
//! - Cylinder and wall distance features, particle-type embeddings
//! - Normalized acceleration targets with noise-aware statistics
//! - Random-walk input noise during training
//! - Kinematic particles driven outside the learned dynamics
//! - Data-parallel training through an injected collective
//! - Atomic, fingerprinted checkpoints
//!
//! ## Architecture
//!
//! ```text
//! window [N, C, D] ──► Feature Builder ──► Encoder ──► Processor (M rounds) ──► Decoder
//!                                                                                  │
//!                                            normalized acceleration [N, D] ◄──────┘
//!                                                          │
//!                                          denormalize ──► Euler ──► p[t+1]
//!                                                                       │
//!                                                 rollout: slide window ┘
//! ```

// Core modules
pub mod config;
pub mod error;
pub mod geometry;
pub mod graph;
pub mod metadata;
pub mod normalization;

// Network
pub mod decoder;
pub mod encoder;
pub mod features;
pub mod mlp;
pub mod norm;
pub mod processor;
pub mod simulator;

// Training and inference
pub mod checkpoint;
pub mod dataset;
pub mod distributed;
pub mod noise;
pub mod optimizer;
pub mod rollout;
pub mod training;

// Integration tests
#[cfg(test)]
mod tests;

// Re-exports
pub use checkpoint::{CheckpointPair, CheckpointSelector};
pub use config::{FeatureLayout, Mode, SimulatorConfig, TrainConfig, INPUT_SEQUENCE_LENGTH};
pub use dataset::{Trajectory, TrajectoryDataset, WindowLoader};
pub use distributed::{CancellationToken, Collective, SingleProcess, ThreadCollective, ThreadGroup};
pub use error::GnsError;
pub use geometry::{Cylinder, DomainBounds};
pub use graph::EdgeIndex;
pub use metadata::{GeometryMetadata, Metadata};
pub use noise::RandomWalkNoise;
pub use normalization::{NormalizationStats, Stats};
pub use rollout::{rollout, rollout_many, KinematicMotion, RolloutExample, RolloutOutput};
pub use simulator::LearnedCylinderSimulator;
pub use training::{
    evaluate_rollouts,
    masked_acceleration_loss,
    predict,
    Batch,
    BatchSource,
    LossHistory,
    StopReason,
    TrainOutcome,
    Trainer,
};

/// Result type for simulator operations
pub type GnsResult<T> = Result<T, GnsError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        // Simulator
        LearnedCylinderSimulator,
        SimulatorConfig,
        Metadata,
        EdgeIndex,
        KinematicMotion,

        // Training
        TrainConfig,
        Trainer,
        TrajectoryDataset,
        WindowLoader,
        CancellationToken,
        SingleProcess,

        // Result type
        GnsResult,
        GnsError,
    };
}
