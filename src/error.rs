//! Error types for the learned simulator

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GnsError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Near-zero standard deviation {std:e} in {quantity} statistics")]
    DegenerateStd { quantity: &'static str, std: f64 },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Particle type {id} outside embedding table of size {table_size}")]
    InvalidParticleType { id: i64, table_size: usize },

    #[error("Model not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("Checkpoint mismatch: {0}")]
    CheckpointMismatch(String),

    #[error("Collective communication failed: {0}")]
    Collective(String),

    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
