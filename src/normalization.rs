//! # Normalization statistics
//!
//! Per-dimension `(mean, std)` pairs that move physical accelerations and
//! velocities into the network's normalized space and back.
//!
//! ```text
//! normalize(x)   = (x - mean) / std
//! denormalize(x) = x * std + mean
//! std            = sqrt(std_data² + noise_std²)
//! ```
//!
//! The training noise std is added in quadrature at construction so the
//! normalized targets keep unit scale once noise is injected.

use candle_core::{Device, Tensor};

use crate::error::GnsError;
use crate::metadata::Metadata;
use crate::GnsResult;

/// Smallest std accepted; anything below is a configuration error.
pub const MIN_STD: f64 = 1e-12;

/// Mean and standard deviation of one physical quantity
#[derive(Debug, Clone)]
pub struct Stats {
    mean: Vec<f64>,
    std: Vec<f64>,
    mean_t: Tensor,
    std_t: Tensor,
}

impl Stats {
    pub fn new(
        quantity: &'static str,
        mean: Vec<f64>,
        std: Vec<f64>,
        device: &Device,
    ) -> GnsResult<Self> {
        if mean.len() != std.len() {
            return Err(GnsError::DimensionMismatch {
                expected: mean.len(),
                got: std.len(),
            });
        }
        if let Some(&bad) = std.iter().find(|s| !(s.is_finite() && **s >= MIN_STD)) {
            return Err(GnsError::DegenerateStd { quantity, std: bad });
        }
        let mean_f: Vec<f32> = mean.iter().map(|v| *v as f32).collect();
        let std_f: Vec<f32> = std.iter().map(|v| *v as f32).collect();
        let mean_t = Tensor::from_vec(mean_f, mean.len(), device)?;
        let std_t = Tensor::from_vec(std_f, std.len(), device)?;
        Ok(Self {
            mean,
            std,
            mean_t,
            std_t,
        })
    }

    /// Stats with the noise std added in quadrature
    pub fn with_noise(
        quantity: &'static str,
        mean: &[f64],
        std: &[f64],
        noise_std: f64,
        device: &Device,
    ) -> GnsResult<Self> {
        let adjusted = std
            .iter()
            .map(|s| (s * s + noise_std * noise_std).sqrt())
            .collect();
        Self::new(quantity, mean.to_vec(), adjusted, device)
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn std(&self) -> &[f64] {
        &self.std
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// `(x - mean) / std`, broadcast over the last axis
    pub fn normalize(&self, x: &Tensor) -> GnsResult<Tensor> {
        Ok(x.broadcast_sub(&self.mean_t)?.broadcast_div(&self.std_t)?)
    }

    /// `x * std + mean`, broadcast over the last axis
    pub fn denormalize(&self, x: &Tensor) -> GnsResult<Tensor> {
        Ok(x.broadcast_mul(&self.std_t)?.broadcast_add(&self.mean_t)?)
    }

    /// Move the cached tensors to another device
    pub fn to_device(&self, device: &Device) -> GnsResult<Self> {
        Ok(Self {
            mean: self.mean.clone(),
            std: self.std.clone(),
            mean_t: self.mean_t.to_device(device)?,
            std_t: self.std_t.to_device(device)?,
        })
    }

    /// `[mean..., std...]`, used to fingerprint checkpoints
    pub fn as_flat(&self) -> Vec<f64> {
        self.mean.iter().chain(self.std.iter()).copied().collect()
    }
}

/// Acceleration and velocity statistics of a simulator
#[derive(Debug, Clone)]
pub struct NormalizationStats {
    pub acceleration: Stats,
    pub velocity: Stats,
}

impl NormalizationStats {
    /// Build from metadata, adding the noise stds in quadrature.
    pub fn from_metadata(
        metadata: &Metadata,
        acc_noise_std: f64,
        vel_noise_std: f64,
        device: &Device,
    ) -> GnsResult<Self> {
        let acceleration = Stats::with_noise(
            "acceleration",
            &metadata.acc_mean,
            &metadata.acc_std,
            acc_noise_std,
            device,
        )?;
        let velocity = Stats::with_noise(
            "velocity",
            &metadata.vel_mean,
            &metadata.vel_std,
            vel_noise_std,
            device,
        )?;
        for stats in [&acceleration, &velocity] {
            if stats.dim() != metadata.dim {
                return Err(GnsError::DimensionMismatch {
                    expected: metadata.dim,
                    got: stats.dim(),
                });
            }
        }
        Ok(Self {
            acceleration,
            velocity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::tests::metadata_3d;

    #[test]
    fn test_round_trip() {
        let device = Device::Cpu;
        let stats = Stats::new("acceleration", vec![1.5, -2.0], vec![0.25, 3.0], &device).unwrap();
        let x = Tensor::randn(0f32, 4.0, (32, 2), &device).unwrap();

        let back = stats.normalize(&stats.denormalize(&x).unwrap()).unwrap();
        let diff: f32 = (back - &x)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5, "round trip error {}", diff);
    }

    #[test]
    fn test_normalize_values() {
        let device = Device::Cpu;
        let stats = Stats::new("velocity", vec![1.0, 2.0], vec![2.0, 4.0], &device).unwrap();
        let x = Tensor::new(&[[3.0f32, 10.0]], &device).unwrap();
        let y: Vec<Vec<f32>> = stats.normalize(&x).unwrap().to_vec2().unwrap();
        assert_eq!(y, vec![vec![1.0, 2.0]]);
    }

    #[test]
    fn test_near_zero_std_rejected() {
        let result = Stats::new("acceleration", vec![0.0], vec![0.0], &Device::Cpu);
        assert!(matches!(
            result,
            Err(GnsError::DegenerateStd { quantity: "acceleration", .. })
        ));
    }

    #[test]
    fn test_noise_added_in_quadrature() {
        let metadata = metadata_3d();
        let stats = NormalizationStats::from_metadata(&metadata, 1.5, 1.2, &Device::Cpu).unwrap();
        // sqrt(2^2 + 1.5^2) = 2.5, sqrt(0.5^2 + 1.2^2) = 1.3
        assert!((stats.acceleration.std()[0] - 2.5).abs() < 1e-12);
        assert!((stats.velocity.std()[2] - 1.3).abs() < 1e-12);
        assert_eq!(stats.acceleration.mean()[2], -9.8);
    }

    #[test]
    fn test_zero_data_std_rescued_by_noise() {
        let mut metadata = metadata_3d();
        metadata.acc_std = vec![0.0, 0.0, 0.0];
        assert!(NormalizationStats::from_metadata(&metadata, 0.0, 0.0, &Device::Cpu).is_err());
        assert!(NormalizationStats::from_metadata(&metadata, 1e-3, 0.0, &Device::Cpu).is_ok());
    }
}
