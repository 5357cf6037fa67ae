//! # Decoder
//!
//! Reads the dynamics out of the final node latents: one MLP with identity
//! output and no normalization, giving a normalized acceleration per
//! particle.

use candle_core::Tensor;
use candle_nn::{Module, VarBuilder};

use crate::mlp::{Mlp, MlpConfig};
use crate::GnsResult;

#[derive(Debug, Clone)]
pub struct Decoder {
    node_fn: Mlp,
}

impl Decoder {
    pub fn new(latent_dim: usize, output_dim: usize, hidden_sizes: &[usize], vb: VarBuilder) -> GnsResult<Self> {
        let config = MlpConfig::new(latent_dim, hidden_sizes.to_vec()).with_output(output_dim);
        Ok(Self {
            node_fn: config.build(vb.pp("node_fn"))?,
        })
    }

    /// `[N, latent] -> [N, D]`
    pub fn forward(&self, x: &Tensor) -> GnsResult<Tensor> {
        Ok(self.node_fn.forward(x)?)
    }
}
