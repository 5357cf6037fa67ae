//! # Processor
//!
//! A stack of interaction networks that refines node and edge latents by
//! message passing. One round:
//!
//! ```text
//! e'_ij = LN(MLP_e([x_i, x_j, e_ij]))          for every edge i → j
//! m_j   = Σ_i e'_ij                            sum at the receiver
//! x'_j  = LN(MLP_x([x_j, m_j]))                for every node
//! x_j  ← x_j + x'_j,   e_ij ← e_ij + e'_ij      residual
//! ```
//!
//! Every edge update of a round is computed before any node reads it.
//! Rounds have their own weights unless the processor is built shared.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::encoder::NormedMlp;
use crate::graph::{aggregate_incoming, EdgeIndex};
use crate::mlp::MlpConfig;
use crate::GnsResult;

/// One message-passing round
#[derive(Debug, Clone)]
pub struct InteractionNetwork {
    edge_fn: NormedMlp,
    node_fn: NormedMlp,
    latent_dim: usize,
}

impl InteractionNetwork {
    pub fn new(latent_dim: usize, hidden_sizes: &[usize], eps: f64, vb: VarBuilder) -> GnsResult<Self> {
        let edge_config =
            MlpConfig::new(3 * latent_dim, hidden_sizes.to_vec()).with_output(latent_dim);
        let node_config =
            MlpConfig::new(2 * latent_dim, hidden_sizes.to_vec()).with_output(latent_dim);
        Ok(Self {
            edge_fn: NormedMlp::new(&edge_config, eps, vb.pp("edge_fn"))?,
            node_fn: NormedMlp::new(&node_config, eps, vb.pp("node_fn"))?,
            latent_dim,
        })
    }

    /// Updated latents before the residual is added: `(x', e')`.
    pub fn updates(&self, x: &Tensor, e: &Tensor, edges: &EdgeIndex) -> GnsResult<(Tensor, Tensor)> {
        let num_nodes = x.dim(0)?;

        let edge_update = if edges.is_empty() {
            e.clone()
        } else {
            let x_src = x.index_select(edges.senders_tensor(), 0)?;
            let x_dst = x.index_select(edges.receivers_tensor(), 0)?;
            let edge_input = Tensor::cat(&[&x_src, &x_dst, e], 1)?;
            self.edge_fn.forward(&edge_input, self.latent_dim)?
        };

        let aggregated = aggregate_incoming(&edge_update, edges, num_nodes)?;
        let node_input = Tensor::cat(&[x, &aggregated], 1)?;
        let node_update = self.node_fn.forward(&node_input, self.latent_dim)?;

        Ok((node_update, edge_update))
    }

    /// One full round with residual connections
    pub fn forward(&self, x: &Tensor, e: &Tensor, edges: &EdgeIndex) -> GnsResult<(Tensor, Tensor)> {
        let (node_update, edge_update) = self.updates(x, e, edges)?;
        let x = (x + node_update)?;
        let e = (e + edge_update)?;
        Ok((x, e))
    }
}

/// Message-passing stack
#[derive(Debug, Clone)]
pub struct Processor {
    blocks: Vec<InteractionNetwork>,
    rounds: usize,
}

impl Processor {
    pub fn new(
        latent_dim: usize,
        rounds: usize,
        hidden_sizes: &[usize],
        shared_weights: bool,
        eps: f64,
        vb: VarBuilder,
    ) -> GnsResult<Self> {
        let distinct = if shared_weights { 1 } else { rounds };
        let blocks = (0..distinct)
            .map(|i| InteractionNetwork::new(latent_dim, hidden_sizes, eps, vb.pp(format!("gn_{}", i))))
            .collect::<GnsResult<Vec<_>>>()?;
        Ok(Self { blocks, rounds })
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn blocks(&self) -> &[InteractionNetwork] {
        &self.blocks
    }

    /// Runs every round and returns the final node latents
    pub fn forward(&self, x: &Tensor, e: &Tensor, edges: &EdgeIndex) -> GnsResult<Tensor> {
        let mut x = x.clone();
        let mut e = e.clone();
        for round in 0..self.rounds {
            let block = &self.blocks[round % self.blocks.len()];
            let (next_x, next_e) = block.forward(&x, &e, edges)?;
            x = next_x;
            e = next_e;
        }
        Ok(x)
    }
}
