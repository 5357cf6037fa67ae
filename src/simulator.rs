//! # Learned Cylinder Simulator
//!
//! Encode-process-decode graph network wrapped with the physics around it:
//! feature construction, normalization and semi-implicit Euler integration.
//!
//! ## Architecture
//!
//! ```text
//! window [N, C, D] ──► FeatureBuilder ──► Encoder ──► Processor ×M ──► Decoder
//!                                                                        │
//!                         normalized acceleration [N, D] ◄───────────────┘
//!                                    │ denormalize
//!                                    ▼
//!         v = (p[-1] - p[-2]) / dt;  v' = v + a·dt;  p' = p[-1] + v'·dt
//! ```
//!
//! Training compares predicted and target accelerations in normalized space
//! only. Parameters live in the simulator's [`VarMap`]; a checkpoint also
//! records a fingerprint of the metadata the simulator was built from, so a
//! checkpoint cannot be loaded into a simulator with different statistics
//! or geometry.

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;
use std::path::Path;

use crate::checkpoint::write_atomic;
use crate::config::SimulatorConfig;
use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::error::GnsError;
use crate::features::{FeatureBuilder, GraphFeatures};
use crate::geometry::{Cylinder, DomainBounds};
use crate::graph::EdgeIndex;
use crate::metadata::Metadata;
use crate::normalization::NormalizationStats;
use crate::processor::Processor;
use crate::GnsResult;

const FINGERPRINT_PREFIX: &str = "__fingerprint__.";

/// Graph network simulator for particles in a cylindrical vessel
pub struct LearnedCylinderSimulator {
    config: SimulatorConfig,
    dim: usize,
    dt: f64,
    features: FeatureBuilder,
    encoder: Encoder,
    processor: Processor,
    decoder: Decoder,
    stats: NormalizationStats,
    varmap: VarMap,
    device: Device,
}

impl std::fmt::Debug for LearnedCylinderSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearnedCylinderSimulator")
            .field("dim", &self.dim)
            .field("dt", &self.dt)
            .field("config", &self.config)
            .field("stats", &self.stats)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl LearnedCylinderSimulator {
    /// Build the simulator, registering its parameters in `varmap`.
    pub fn new(
        metadata: &Metadata,
        config: &SimulatorConfig,
        acc_noise_std: f64,
        vel_noise_std: f64,
        varmap: &VarMap,
        device: &Device,
    ) -> GnsResult<Self> {
        metadata.validate()?;
        let dim = metadata.dim;
        config.validate(dim)?;

        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let stats = NormalizationStats::from_metadata(metadata, acc_noise_std, vel_noise_std, device)?;
        let cylinder = Cylinder::from_metadata(&metadata.geometry, device)?;
        let bounds = DomainBounds::from_metadata(metadata, device)?;
        let hidden = config.hidden_sizes();

        let features = FeatureBuilder::new(
            dim,
            config.input_sequence_length,
            config.layout(dim)?,
            metadata.dt,
            metadata.clamp_radius(),
            bounds,
            cylinder,
            stats.velocity.clone(),
            config.nparticle_types,
            config.particle_type_embedding_size,
            vb.pp("particle_type_embedding"),
        )?;
        let encoder = Encoder::new(
            config.nnode_in(dim)?,
            dim + 1,
            config.latent_dim,
            &hidden,
            config.layer_norm_eps,
            vb.pp("encoder"),
        )?;
        let processor = Processor::new(
            config.latent_dim,
            config.nmessage_passing_steps,
            &hidden,
            config.share_processor_weights,
            config.layer_norm_eps,
            vb.pp("processor"),
        )?;
        let decoder = Decoder::new(config.latent_dim, dim, &hidden, vb.pp("decoder"))?;

        log::debug!(
            "Built {}D simulator: latent={}, rounds={}, parameters={}",
            dim,
            config.latent_dim,
            config.nmessage_passing_steps,
            count_parameters(varmap)
        );

        Ok(Self {
            config: config.clone(),
            dim,
            dt: metadata.dt,
            features,
            encoder,
            processor,
            decoder,
            stats,
            varmap: varmap.clone(),
            device: device.clone(),
        })
    }

    /// Build with a fresh VarMap (for training from scratch)
    pub fn new_random(
        metadata: &Metadata,
        config: &SimulatorConfig,
        noise_std: f64,
        device: &Device,
    ) -> GnsResult<(Self, VarMap)> {
        let varmap = VarMap::new();
        let simulator = Self::new(metadata, config, noise_std, noise_std, &varmap, device)?;
        Ok((simulator, varmap))
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn stats(&self) -> &NormalizationStats {
        &self.stats
    }

    pub fn cylinder(&self) -> &Cylinder {
        self.features.cylinder()
    }

    pub fn kinematic_particle_id(&self) -> i64 {
        self.config.kinematic_particle_id
    }

    pub fn input_sequence_length(&self) -> usize {
        self.config.input_sequence_length
    }

    pub fn num_parameters(&self) -> usize {
        count_parameters(&self.varmap)
    }

    /// Node and edge features for a window
    pub fn build_features(
        &self,
        position_sequence: &Tensor,
        particle_types: &Tensor,
        edges: &EdgeIndex,
    ) -> GnsResult<GraphFeatures> {
        self.features.build(position_sequence, particle_types, edges)
    }

    /// Encoder → Processor → Decoder on prepared features
    pub fn forward(&self, features: &GraphFeatures, edges: &EdgeIndex) -> GnsResult<Tensor> {
        let (nodes, edge_latents) = self
            .encoder
            .forward(&features.node_features, &features.edge_features)?;
        let nodes = self.processor.forward(&nodes, &edge_latents, edges)?;
        self.decoder.forward(&nodes)
    }

    /// Normalized acceleration `[N, D]` predicted from a window
    pub fn predict_normalized_acceleration(
        &self,
        position_sequence: &Tensor,
        particle_types: &Tensor,
        edges: &EdgeIndex,
    ) -> GnsResult<Tensor> {
        let features = self.build_features(position_sequence, particle_types, edges)?;
        self.forward(&features, edges)
    }

    /// Predicted and target accelerations, both normalized, for training.
    ///
    /// The target is the finite-difference acceleration that takes the noisy
    /// window to `next_positions` shifted by the noise of the last entry.
    pub fn predict_accelerations(
        &self,
        next_positions: &Tensor,
        position_sequence: &Tensor,
        position_sequence_noise: &Tensor,
        particle_types: &Tensor,
        edges: &EdgeIndex,
    ) -> GnsResult<(Tensor, Tensor)> {
        if position_sequence.dims() != position_sequence_noise.dims() {
            return Err(GnsError::InvalidConfig(format!(
                "noise shape {:?} does not match window shape {:?}",
                position_sequence_noise.dims(),
                position_sequence.dims()
            )));
        }
        let n = self.features.check_window(position_sequence)?;
        let (next_n, next_d) = next_positions.dims2()?;
        if next_n != n || next_d != self.dim {
            return Err(GnsError::DimensionMismatch {
                expected: n * self.dim,
                got: next_n * next_d,
            });
        }

        let noisy_sequence = (position_sequence + position_sequence_noise)?;
        let predicted = self.predict_normalized_acceleration(&noisy_sequence, particle_types, edges)?;

        let last_noise = position_sequence_noise.i((.., self.input_sequence_length() - 1))?;
        let next_adjusted = (next_positions + last_noise)?;
        let target = self.inverse_decoder_postprocessor(&next_adjusted, &noisy_sequence)?;

        Ok((predicted, target))
    }

    /// Next position `[N, D]` for a window, without noise
    pub fn predict_positions(
        &self,
        current_positions: &Tensor,
        particle_types: &Tensor,
        edges: &EdgeIndex,
    ) -> GnsResult<Tensor> {
        let normalized = self.predict_normalized_acceleration(current_positions, particle_types, edges)?;
        self.decoder_postprocessor(&normalized, current_positions)
    }

    /// Normalized acceleration → next position by semi-implicit Euler
    pub fn decoder_postprocessor(
        &self,
        normalized_acceleration: &Tensor,
        position_sequence: &Tensor,
    ) -> GnsResult<Tensor> {
        let acceleration = self.stats.acceleration.denormalize(normalized_acceleration)?;
        let (latest, previous) = last_two(position_sequence)?;

        let last_velocity = (&latest - previous)?.affine(1.0 / self.dt, 0.0)?;
        let next_velocity = (last_velocity + acceleration.affine(self.dt, 0.0)?)?;
        Ok((latest + next_velocity.affine(self.dt, 0.0)?)?)
    }

    /// Next position → normalized acceleration (inverse of the integrator)
    pub fn inverse_decoder_postprocessor(
        &self,
        next_position: &Tensor,
        position_sequence: &Tensor,
    ) -> GnsResult<Tensor> {
        let (latest, previous) = last_two(position_sequence)?;
        let previous_velocity = (&latest - previous)?.affine(1.0 / self.dt, 0.0)?;
        let next_velocity = (next_position - &latest)?.affine(1.0 / self.dt, 0.0)?;
        let acceleration = (next_velocity - previous_velocity)?.affine(1.0 / self.dt, 0.0)?;
        self.stats.acceleration.normalize(&acceleration)
    }

    /// Metadata-derived values stored next to the parameters
    fn fingerprint(&self) -> GnsResult<HashMap<String, Tensor>> {
        let entries: [(&str, Vec<f64>); 5] = [
            ("dim", vec![self.dim as f64]),
            ("dt", vec![self.dt]),
            ("acceleration", self.stats.acceleration.as_flat()),
            ("velocity", self.stats.velocity.as_flat()),
            ("cylinder", self.cylinder().as_flat()),
        ];
        let mut map = HashMap::new();
        for (name, values) in entries {
            let len = values.len();
            map.insert(
                format!("{}{}", FINGERPRINT_PREFIX, name),
                Tensor::from_vec(values, len, &Device::Cpu)?,
            );
        }
        Ok(map)
    }

    /// Write parameters and fingerprint to `path` atomically
    pub fn save(&self, path: impl AsRef<Path>) -> GnsResult<()> {
        let mut tensors = self.fingerprint()?;
        {
            let data = self
                .varmap
                .data()
                .lock()
                .map_err(|_| GnsError::SerializationError("parameter map lock poisoned".to_string()))?;
            for (name, var) in data.iter() {
                tensors.insert(name.clone(), var.as_tensor().to_device(&Device::Cpu)?);
            }
        }
        write_atomic(path.as_ref(), |tmp| {
            candle_core::safetensors::save(&tensors, tmp)?;
            Ok(())
        })?;
        log::info!("Saved model parameters to {:?}", path.as_ref());
        Ok(())
    }

    /// Load parameters from `path`, checking the fingerprint first
    pub fn load(&self, path: impl AsRef<Path>) -> GnsResult<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(GnsError::ModelNotFound(path.to_path_buf()));
        }
        let mut stored = candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(|e| GnsError::SerializationError(format!("Failed to read {:?}: {}", path, e)))?;

        for (name, expected) in self.fingerprint()? {
            let found = stored.remove(&name).ok_or_else(|| {
                GnsError::CheckpointMismatch(format!("{:?} has no {} record", path, name))
            })?;
            let expected: Vec<f64> = expected.to_vec1()?;
            let found: Vec<f64> = found.to_dtype(DType::F64)?.to_vec1()?;
            let same = expected.len() == found.len()
                && expected
                    .iter()
                    .zip(found.iter())
                    .all(|(a, b)| (a - b).abs() <= 1e-9 * a.abs().max(1.0));
            if !same {
                return Err(GnsError::CheckpointMismatch(format!(
                    "{} differs: checkpoint has {:?}, simulator has {:?}",
                    name.trim_start_matches(FINGERPRINT_PREFIX),
                    found,
                    expected
                )));
            }
        }

        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| GnsError::SerializationError("parameter map lock poisoned".to_string()))?;
        for (name, var) in data.iter() {
            let tensor = stored.remove(name).ok_or_else(|| {
                GnsError::CheckpointMismatch(format!("{:?} is missing parameter {}", path, name))
            })?;
            if tensor.dims() != var.dims() {
                return Err(GnsError::CheckpointMismatch(format!(
                    "parameter {} has shape {:?} in checkpoint, {:?} in model",
                    name,
                    tensor.dims(),
                    var.dims()
                )));
            }
            var.set(&tensor.to_dtype(var.dtype())?.to_device(&self.device)?)?;
        }
        if let Some(extra) = stored.keys().next() {
            return Err(GnsError::CheckpointMismatch(format!(
                "{:?} has unexpected parameter {}",
                path, extra
            )));
        }
        log::info!("Loaded model parameters from {:?}", path);
        Ok(())
    }
}

fn last_two(position_sequence: &Tensor) -> GnsResult<(Tensor, Tensor)> {
    let (_, steps, _) = position_sequence.dims3()?;
    if steps < 2 {
        return Err(GnsError::InvalidConfig(
            "position window needs at least 2 entries".to_string(),
        ));
    }
    let latest = position_sequence.i((.., steps - 1))?;
    let previous = position_sequence.i((.., steps - 2))?;
    Ok((latest, previous))
}

fn count_parameters(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}
