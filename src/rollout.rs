//! # Rollout
//!
//! Chains single-step predictions into a trajectory. After every step the
//! oldest window entry is dropped and the new position appended, so the
//! window handed to the simulator always has exactly `C` entries.
//!
//! Kinematic particles never take a network prediction; their next position
//! comes from [`KinematicMotion`].

use candle_core::{DType, Tensor};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::checkpoint::write_atomic;
use crate::error::GnsError;
use crate::features::kinematic_mask;
use crate::graph::EdgeIndex;
use crate::metadata::Metadata;
use crate::simulator::LearnedCylinderSimulator;
use crate::GnsResult;

/// How kinematic particles move during a rollout
#[derive(Debug, Clone)]
pub enum KinematicMotion {
    /// Held at their last window position
    Stationary,
    /// Positions `[S, N, D]` for every rollout step
    Prescribed(Tensor),
}

/// Dense tensor as plain JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorRecord {
    pub fn from_tensor(tensor: &Tensor) -> GnsResult<Self> {
        Ok(Self {
            shape: tensor.dims().to_vec(),
            data: tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?,
        })
    }

    pub fn to_tensor(&self, device: &candle_core::Device) -> GnsResult<Tensor> {
        Ok(Tensor::from_vec(self.data.clone(), self.shape.as_slice(), device)?)
    }
}

/// One rolled-out example, written as `rollout_<i>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutOutput {
    /// `[C, N, D]`
    pub initial_positions: TensorRecord,
    /// `[S, N, D]`
    pub predicted_rollout: TensorRecord,
    /// Final ground-truth positions `[N, D]`
    pub ground_truth_rollout: TensorRecord,
    pub particle_types: Vec<i64>,
    pub metadata: Option<Metadata>,
}

impl RolloutOutput {
    pub fn with_metadata(mut self, metadata: &Metadata) -> Self {
        self.metadata = Some(metadata.clone());
        self
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> GnsResult<()> {
        let json = serde_json::to_string(self).map_err(|e| GnsError::SerializationError(e.to_string()))?;
        write_atomic(path.as_ref(), |tmp| Ok(std::fs::write(tmp, json.as_bytes())?))?;
        log::debug!("Wrote rollout to {:?}", path.as_ref());
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> GnsResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| GnsError::Io(format!("Failed to read {:?}: {}", path.as_ref(), e)))?;
        serde_json::from_str(&content).map_err(|e| GnsError::SerializationError(e.to_string()))
    }
}

/// Inputs of one rollout
#[derive(Debug, Clone)]
pub struct RolloutExample {
    /// `[N, C, D]`
    pub initial_window: Tensor,
    /// `[N, D]`
    pub ground_truth: Tensor,
    pub particle_types: Tensor,
    pub edges: EdgeIndex,
    pub kinematic: KinematicMotion,
}

/// Roll out `nsteps` predictions.
///
/// Returns the output record and the per-coordinate squared error `[N, D]`
/// of the final position against `ground_truth`. With `nsteps == 0` the
/// final position is the last window entry.
pub fn rollout(
    simulator: &LearnedCylinderSimulator,
    initial_window: &Tensor,
    ground_truth: &Tensor,
    particle_types: &Tensor,
    edges: &EdgeIndex,
    nsteps: usize,
    kinematic: &KinematicMotion,
) -> GnsResult<(RolloutOutput, Tensor)> {
    let (n, c, d) = initial_window.dims3()?;
    if c != simulator.input_sequence_length() {
        return Err(GnsError::DimensionMismatch {
            expected: simulator.input_sequence_length(),
            got: c,
        });
    }
    if let KinematicMotion::Prescribed(prescribed) = kinematic {
        let (steps, pn, pd) = prescribed.dims3()?;
        if steps < nsteps || pn != n || pd != d {
            return Err(GnsError::InvalidConfig(format!(
                "prescribed kinematic trajectory {:?} does not cover {} steps of [{}, {}]",
                prescribed.dims(),
                nsteps,
                n,
                d
            )));
        }
    }

    let mask = kinematic_mask(particle_types, simulator.kinematic_particle_id())?
        .unsqueeze(1)?
        .broadcast_as((n, d))?;

    let mut window = initial_window.detach();
    let mut predictions = Vec::with_capacity(nsteps);
    for step in 0..nsteps {
        let predicted = simulator.predict_positions(&window, particle_types, edges)?;
        let driven = match kinematic {
            KinematicMotion::Stationary => window.narrow(1, c - 1, 1)?.squeeze(1)?,
            KinematicMotion::Prescribed(prescribed) => prescribed.get(step)?,
        };
        let next = mask.where_cond(&driven, &predicted)?.detach();

        window = Tensor::cat(&[&window.narrow(1, 1, c - 1)?, &next.unsqueeze(1)?], 1)?;
        predictions.push(next);
    }

    let predicted_rollout = if predictions.is_empty() {
        Tensor::zeros((0, n, d), DType::F32, initial_window.device())?
    } else {
        Tensor::stack(&predictions, 0)?
    };
    let final_position = match predictions.last() {
        Some(last) => last.clone(),
        None => initial_window.narrow(1, c - 1, 1)?.squeeze(1)?,
    };
    let loss = (final_position - ground_truth)?.sqr()?;

    let output = RolloutOutput {
        initial_positions: TensorRecord::from_tensor(&initial_window.transpose(0, 1)?)?,
        predicted_rollout: TensorRecord::from_tensor(&predicted_rollout)?,
        ground_truth_rollout: TensorRecord::from_tensor(ground_truth)?,
        particle_types: particle_types.to_dtype(DType::I64)?.to_vec1()?,
        metadata: None,
    };
    Ok((output, loss))
}

/// Roll out many examples in parallel; returns each output with its mean loss
pub fn rollout_many(
    simulator: &LearnedCylinderSimulator,
    examples: &[RolloutExample],
    nsteps: usize,
) -> GnsResult<Vec<(RolloutOutput, f64)>> {
    examples
        .par_iter()
        .map(|example| {
            let (output, loss) = rollout(
                simulator,
                &example.initial_window,
                &example.ground_truth,
                &example.particle_types,
                &example.edges,
                nsteps,
                &example.kinematic,
            )?;
            let mean = loss.mean_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            Ok((output, mean))
        })
        .collect()
}
