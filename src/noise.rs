//! # Random-walk noise
//!
//! Training-time perturbation of the input window. The noise is a random
//! walk along the window axis: the first entry is zero and each later entry
//! adds an independent Gaussian increment of std `σ / sqrt(C - 1)`, so the
//! accumulated noise on the most recent position has std exactly `σ`.
//! Kinematic particles are never perturbed.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::error::GnsError;
use crate::features::non_kinematic_weights;
use crate::GnsResult;

/// Seeded generator of random-walk position noise
#[derive(Debug, Clone)]
pub struct RandomWalkNoise {
    rng: StdRng,
}

impl RandomWalkNoise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Unmasked noise of shape `[n, steps, dim]`
    pub fn sample(
        &mut self,
        n: usize,
        steps: usize,
        dim: usize,
        noise_std_last_step: f64,
        device: &Device,
    ) -> GnsResult<Tensor> {
        if steps < 2 || noise_std_last_step == 0.0 {
            return Ok(Tensor::zeros((n, steps, dim), candle_core::DType::F32, device)?);
        }
        let increment_std = noise_std_last_step / ((steps - 1) as f64).sqrt();
        let normal = Normal::new(0.0, increment_std).map_err(|e| {
            GnsError::InvalidConfig(format!("invalid noise std {}: {}", noise_std_last_step, e))
        })?;

        let mut data = Vec::with_capacity(n * steps * dim);
        let mut walk = vec![0.0f64; dim];
        for _ in 0..n {
            walk.iter_mut().for_each(|w| *w = 0.0);
            for step in 0..steps {
                if step > 0 {
                    for w in walk.iter_mut() {
                        *w += normal.sample(&mut self.rng);
                    }
                }
                data.extend(walk.iter().map(|w| *w as f32));
            }
        }
        Ok(Tensor::from_vec(data, (n, steps, dim), device)?)
    }

    /// Noise for `position_sequence` `[N, C, D]`, zero on kinematic particles
    pub fn sample_for(
        &mut self,
        position_sequence: &Tensor,
        particle_types: &Tensor,
        noise_std_last_step: f64,
        kinematic_id: i64,
    ) -> GnsResult<Tensor> {
        let (n, steps, dim) = position_sequence.dims3()?;
        let noise = self.sample(n, steps, dim, noise_std_last_step, position_sequence.device())?;
        let weights = non_kinematic_weights(particle_types, kinematic_id)?.reshape((n, 1, 1))?;
        Ok(noise.broadcast_mul(&weights)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;

    #[test]
    fn test_last_step_std_matches_request() {
        let mut noise = RandomWalkNoise::new(7);
        let sigma = 0.5;
        let sample = noise.sample(4000, 6, 1, sigma, &Device::Cpu).unwrap();
        let last: Vec<f32> = sample.i((.., 5, 0)).unwrap().to_vec1().unwrap();

        let n = last.len() as f64;
        let mean = last.iter().map(|v| *v as f64).sum::<f64>() / n;
        let var = last.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std = var.sqrt();
        assert!((std - sigma).abs() / sigma < 0.05, "empirical std {}", std);
    }

    #[test]
    fn test_walk_grows_along_window() {
        let mut noise = RandomWalkNoise::new(3);
        let sample = noise.sample(2000, 6, 2, 1.0, &Device::Cpu).unwrap();
        let first: Vec<Vec<f32>> = sample.i((.., 0)).unwrap().to_vec2().unwrap();
        assert!(first.iter().flatten().all(|v| *v == 0.0));

        let spread = |step: usize| -> f64 {
            let v: Vec<f32> = sample.i((.., step, 0)).unwrap().to_vec1().unwrap();
            v.iter().map(|x| (*x as f64).powi(2)).sum::<f64>() / v.len() as f64
        };
        assert!(spread(1) < spread(3));
        assert!(spread(3) < spread(5));
    }

    #[test]
    fn test_kinematic_particles_get_zero_noise() {
        let mut noise = RandomWalkNoise::new(11);
        let window = Tensor::zeros((4, 6, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let types = Tensor::new(&[0i64, -1, 0, -1], &Device::Cpu).unwrap();
        for sigma in [1e-3, 0.1, 10.0] {
            let sampled = noise.sample_for(&window, &types, sigma, -1).unwrap();
            for kinematic in [1usize, 3] {
                let rows: Vec<Vec<f32>> = sampled.i(kinematic).unwrap().to_vec2().unwrap();
                assert!(rows.iter().flatten().all(|v| *v == 0.0));
            }
            let moving: Vec<Vec<f32>> = sampled.i(0).unwrap().to_vec2().unwrap();
            assert!(moving.iter().flatten().any(|v| *v != 0.0));
        }
    }

    #[test]
    fn test_seeded_generator_is_reproducible() {
        let a = RandomWalkNoise::new(5).sample(3, 6, 2, 0.1, &Device::Cpu).unwrap();
        let b = RandomWalkNoise::new(5).sample(3, 6, 2, 0.1, &Device::Cpu).unwrap();
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }
}
