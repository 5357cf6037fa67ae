//! # Encoder
//!
//! Embeds raw node and edge features into the latent graph `G⁰`. Nodes and
//! edges go through independent MLP + LayerNorm stacks, so a node's initial
//! latent depends on its own features only and an edge's on its own
//! displacement only.

use candle_core::{DType, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::mlp::{Mlp, MlpConfig};
use crate::norm::{layer_norm, LayerNorm};
use crate::GnsResult;

/// MLP followed by LayerNorm
#[derive(Debug, Clone)]
pub struct NormedMlp {
    mlp: Mlp,
    norm: LayerNorm,
}

impl NormedMlp {
    pub fn new(config: &MlpConfig, eps: f64, vb: VarBuilder) -> GnsResult<Self> {
        let mlp = config.build(vb.pp("mlp"))?;
        let norm = layer_norm(config.out_size(), eps, vb.pp("norm"))?;
        Ok(Self { mlp, norm })
    }

    /// Applies the block; an input with zero rows maps to zero rows.
    pub fn forward(&self, x: &Tensor, out_dim: usize) -> GnsResult<Tensor> {
        let rows = x.dim(0)?;
        if rows == 0 {
            return Ok(Tensor::zeros((0, out_dim), DType::F32, x.device())?);
        }
        let hidden = self.mlp.forward(x)?;
        Ok(self.norm.forward(&hidden)?)
    }
}

/// Node and edge encoders
#[derive(Debug, Clone)]
pub struct Encoder {
    node_fn: NormedMlp,
    edge_fn: NormedMlp,
    latent_dim: usize,
}

impl Encoder {
    pub fn new(
        nnode_in: usize,
        nedge_in: usize,
        latent_dim: usize,
        hidden_sizes: &[usize],
        eps: f64,
        vb: VarBuilder,
    ) -> GnsResult<Self> {
        let node_config = MlpConfig::new(nnode_in, hidden_sizes.to_vec()).with_output(latent_dim);
        let edge_config = MlpConfig::new(nedge_in, hidden_sizes.to_vec()).with_output(latent_dim);
        Ok(Self {
            node_fn: NormedMlp::new(&node_config, eps, vb.pp("node_fn"))?,
            edge_fn: NormedMlp::new(&edge_config, eps, vb.pp("edge_fn"))?,
            latent_dim,
        })
    }

    /// `([N, nnode_in], [E, nedge_in]) -> ([N, latent], [E, latent])`
    pub fn forward(&self, node_features: &Tensor, edge_features: &Tensor) -> GnsResult<(Tensor, Tensor)> {
        let nodes = self.node_fn.forward(node_features, self.latent_dim)?;
        let edges = self.edge_fn.forward(edge_features, self.latent_dim)?;
        Ok((nodes, edges))
    }
}
