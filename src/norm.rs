//! # LayerNorm
//!
//! Normalizes every row of a latent matrix to zero mean and unit variance
//! across its features, then applies a learned scale and shift. Built from
//! basic tensor operations (mean, sub, sqrt, div) so it runs on every candle
//! backend, Metal included.
//!
//! ## Formula
//! ```text
//! LayerNorm(x) = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
//! ```

use candle_core::{DType, Result as CandleResult, Tensor, D};
use candle_nn::{Init, Module, VarBuilder, VarMap};

/// Learned per-feature normalization
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> CandleResult<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    /// LayerNorm with a fresh VarMap (for testing)
    #[allow(dead_code)]
    pub fn new_random(size: usize, eps: f64, device: &candle_core::Device) -> CandleResult<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        Self::new(size, eps, vb)
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = (var + self.eps)?.sqrt()?;
        centered
            .broadcast_div(&denom)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Helper mirroring `candle_nn::layer_norm`
pub fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> CandleResult<LayerNorm> {
    LayerNorm::new(size, eps, vb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_layer_norm_statistics() {
        let device = Device::Cpu;
        let norm = LayerNorm::new_random(8, 1e-5, &device).unwrap();

        let x = Tensor::randn(3f32, 5.0, (4, 8), &device).unwrap();
        let y = norm.forward(&x).unwrap();
        assert_eq!(y.dims(), x.dims());

        let rows: Vec<Vec<f32>> = y.to_vec2().unwrap();
        for row in rows {
            let mean: f32 = row.iter().sum::<f32>() / row.len() as f32;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / row.len() as f32;
            assert!(mean.abs() < 1e-4, "row mean {}", mean);
            assert!((var - 1.0).abs() < 1e-2, "row var {}", var);
        }
    }

    #[test]
    fn test_layer_norm_vs_manual() {
        let device = Device::Cpu;
        let norm = LayerNorm::new_random(4, 1e-5, &device).unwrap();
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &device).unwrap();

        // mean 2.5, var 1.25
        let expected_std = (1.25f32 + 1e-5).sqrt();
        let expected: Vec<f32> = [1.0f32, 2.0, 3.0, 4.0]
            .iter()
            .map(|v| (v - 2.5) / expected_std)
            .collect();

        let got: Vec<f32> = norm.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (g, e) in got.iter().zip(expected.iter()) {
            assert!((g - e).abs() < 1e-4, "got {} expected {}", g, e);
        }
    }
}
