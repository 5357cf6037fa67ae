//! # Feature Builder
//!
//! Turns a position window `[N, C, D]`, particle types and the edge list into
//! the raw node and edge feature matrices consumed by the encoder.
//!
//! ```text
//! node: [ normalized velocities (C-1)·D | walls 2·D | cylinder 3 | embedding ]
//! edge: [ p_receiver - p_sender (D)     | distance 1 ]
//! ```
//!
//! Wall and cylinder groups are optional (see [`FeatureLayout`]); distances
//! are divided by the clamp radius and clamped to `[-1, 1]`. Features are
//! rebuilt from the current window on every call.

use candle_core::{DType, IndexOp, Tensor};
use candle_nn::{embedding, Embedding, Module, VarBuilder};

use crate::config::FeatureLayout;
use crate::error::GnsError;
use crate::geometry::{clamp_to_radius, Cylinder, DomainBounds};
use crate::graph::EdgeIndex;
use crate::normalization::Stats;
use crate::GnsResult;

/// Raw graph inputs for the encoder
#[derive(Debug, Clone)]
pub struct GraphFeatures {
    /// `[N, nnode_in]`
    pub node_features: Tensor,
    /// `[E, D + 1]`
    pub edge_features: Tensor,
}

/// `(p[t] - p[t-1]) / dt` along the window axis: `[N, C, D] -> [N, C-1, D]`
pub fn velocity_sequence(position_sequence: &Tensor, dt: f64) -> GnsResult<Tensor> {
    let (_, steps, _) = position_sequence.dims3()?;
    if steps < 2 {
        return Err(GnsError::InvalidConfig(format!(
            "position window needs at least 2 entries, got {}",
            steps
        )));
    }
    let later = position_sequence.narrow(1, 1, steps - 1)?;
    let earlier = position_sequence.narrow(1, 0, steps - 1)?;
    Ok((later - earlier)?.affine(1.0 / dt, 0.0)?)
}

/// Latest position of every particle: `[N, C, D] -> [N, D]`
pub fn most_recent_position(position_sequence: &Tensor) -> GnsResult<Tensor> {
    let (_, steps, _) = position_sequence.dims3()?;
    Ok(position_sequence.i((.., steps - 1))?.contiguous()?)
}

/// `[p_receiver - p_sender, |p_receiver - p_sender|]` for every edge
pub fn edge_features(positions: &Tensor, edges: &EdgeIndex) -> GnsResult<Tensor> {
    let (num_nodes, dim) = positions.dims2()?;
    edges.validate(num_nodes)?;
    if edges.is_empty() {
        return Ok(Tensor::zeros((0, dim + 1), positions.dtype(), positions.device())?);
    }
    let senders = positions.index_select(edges.senders_tensor(), 0)?;
    let receivers = positions.index_select(edges.receivers_tensor(), 0)?;
    let displacement = (receivers - senders)?;
    let distance = displacement.sqr()?.sum_keepdim(1)?.sqrt()?;
    Ok(Tensor::cat(&[&displacement, &distance], 1)?)
}

/// U8 mask, 1 where the particle is kinematic
pub fn kinematic_mask(particle_types: &Tensor, kinematic_id: i64) -> GnsResult<Tensor> {
    Ok(particle_types.to_dtype(DType::I64)?.eq(kinematic_id)?)
}

/// F32 weights, 1 for particles driven by the learned dynamics
pub fn non_kinematic_weights(particle_types: &Tensor, kinematic_id: i64) -> GnsResult<Tensor> {
    Ok(particle_types
        .to_dtype(DType::I64)?
        .ne(kinematic_id)?
        .to_dtype(DType::F32)?)
}

/// Builds node and edge features for one simulator
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    dim: usize,
    sequence_length: usize,
    layout: FeatureLayout,
    dt: f64,
    clamp_radius: f64,
    bounds: DomainBounds,
    cylinder: Cylinder,
    velocity_stats: Stats,
    embedding: Option<Embedding>,
    nparticle_types: usize,
}

impl FeatureBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dim: usize,
        sequence_length: usize,
        layout: FeatureLayout,
        dt: f64,
        clamp_radius: f64,
        bounds: DomainBounds,
        cylinder: Cylinder,
        velocity_stats: Stats,
        nparticle_types: usize,
        embedding_size: usize,
        vb: VarBuilder,
    ) -> GnsResult<Self> {
        for got in [bounds.dim(), cylinder.dim(), velocity_stats.dim()] {
            if got != dim {
                return Err(GnsError::DimensionMismatch { expected: dim, got });
            }
        }
        let embedding = if layout.type_embedding {
            Some(embedding(nparticle_types, embedding_size, vb)?)
        } else {
            None
        };
        Ok(Self {
            dim,
            sequence_length,
            layout,
            dt,
            clamp_radius,
            bounds,
            cylinder,
            velocity_stats,
            embedding,
            nparticle_types,
        })
    }

    pub fn layout(&self) -> FeatureLayout {
        self.layout
    }

    pub fn cylinder(&self) -> &Cylinder {
        &self.cylinder
    }

    /// Check window shape `[N, C, D]` and return `N`
    pub fn check_window(&self, position_sequence: &Tensor) -> GnsResult<usize> {
        let (n, c, d) = position_sequence.dims3()?;
        if c != self.sequence_length {
            return Err(GnsError::DimensionMismatch {
                expected: self.sequence_length,
                got: c,
            });
        }
        if d != self.dim {
            return Err(GnsError::DimensionMismatch {
                expected: self.dim,
                got: d,
            });
        }
        Ok(n)
    }

    /// Node features `[N, nnode_in]`
    pub fn node_features(
        &self,
        position_sequence: &Tensor,
        particle_types: &Tensor,
    ) -> GnsResult<Tensor> {
        let n = self.check_window(position_sequence)?;
        let latest = most_recent_position(position_sequence)?;

        let velocities = velocity_sequence(position_sequence, self.dt)?;
        let normalized = self.velocity_stats.normalize(&velocities)?;
        let mut groups = vec![normalized.reshape((n, (self.sequence_length - 1) * self.dim))?];

        if self.layout.boundaries {
            let walls = self.bounds.distances(&latest)?;
            groups.push(clamp_to_radius(&walls, self.clamp_radius)?);
        }
        if self.layout.cylinder {
            let cylinder = self.cylinder.distances(&latest)?;
            groups.push(clamp_to_radius(&cylinder, self.clamp_radius)?);
        }
        if let Some(ref table) = self.embedding {
            let types = particle_types.to_dtype(DType::I64)?;
            let ids: Vec<i64> = types.to_vec1()?;
            if ids.len() != n {
                return Err(GnsError::DimensionMismatch {
                    expected: n,
                    got: ids.len(),
                });
            }
            if let Some(&bad) = ids
                .iter()
                .find(|&&id| id < 0 || id as usize >= self.nparticle_types)
            {
                return Err(GnsError::InvalidParticleType {
                    id: bad,
                    table_size: self.nparticle_types,
                });
            }
            groups.push(table.forward(&types)?);
        }

        Ok(Tensor::cat(&groups, 1)?)
    }

    pub fn build(
        &self,
        position_sequence: &Tensor,
        particle_types: &Tensor,
        edges: &EdgeIndex,
    ) -> GnsResult<GraphFeatures> {
        let node_features = self.node_features(position_sequence, particle_types)?;
        let latest = most_recent_position(position_sequence)?;
        let edge_features = edge_features(&latest, edges)?;
        Ok(GraphFeatures {
            node_features,
            edge_features,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatorConfig;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn builder(layout: FeatureLayout, dim: usize, varmap: &VarMap) -> FeatureBuilder {
        let device = Device::Cpu;
        let bounds = DomainBounds::new(vec![[0.0, 1.0]; dim], &device).unwrap();
        let mut axis_end = vec![0.5; dim];
        axis_end[dim - 1] = 1.0;
        let mut axis_start = vec![0.5; dim];
        axis_start[dim - 1] = 0.0;
        let cylinder = Cylinder::new(axis_start, axis_end, 0.5, &device).unwrap();
        let stats = Stats::new("velocity", vec![0.0; dim], vec![1.0; dim], &device).unwrap();
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &device);
        FeatureBuilder::new(dim, 6, layout, 0.1, 0.1, bounds, cylinder, stats, 2, 16, vb).unwrap()
    }

    fn window(n: usize, dim: usize) -> Tensor {
        Tensor::rand(0.2f32, 0.8, (n, 6, dim), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_two_particle_edge_feature_exact() {
        let device = Device::Cpu;
        let positions = Tensor::new(&[[0.25f32, 0.5], [1.0, 0.75]], &device).unwrap();
        let edges = EdgeIndex::from_pairs(&[(0, 1)], &device).unwrap();
        let features: Vec<Vec<f32>> = edge_features(&positions, &edges).unwrap().to_vec2().unwrap();

        let dx = 1.0f32 - 0.25;
        let dy = 0.75f32 - 0.5;
        assert_eq!(features, vec![vec![dx, dy, (dx * dx + dy * dy).sqrt()]]);
    }

    #[test]
    fn test_node_feature_widths_match_config() {
        let config = SimulatorConfig::default();
        let varmap = VarMap::new();
        let planar = builder(FeatureLayout::planar(), 2, &varmap);
        let types = Tensor::new(&[0i64, 1, 0], &Device::Cpu).unwrap();
        let nodes = planar.node_features(&window(3, 2), &types).unwrap();
        assert_eq!(nodes.dims(), &[3, config.nnode_in_2d]);

        let varmap = VarMap::new();
        let cyl = builder(FeatureLayout::cylinder(), 3, &varmap);
        let nodes = cyl.node_features(&window(4, 3), &Tensor::zeros(4, DType::I64, &Device::Cpu).unwrap()).unwrap();
        assert_eq!(nodes.dims(), &[4, config.nnode_in_3d]);
    }

    #[test]
    fn test_velocity_features_use_dt() {
        let device = Device::Cpu;
        // x advances by 0.01 per step, dt = 0.1 -> velocity 0.1
        let steps: Vec<f32> = (0..6).flat_map(|t| [0.5 + 0.01 * t as f32, 0.5]).collect();
        let window = Tensor::from_vec(steps, (1, 6, 2), &device).unwrap();
        let varmap = VarMap::new();
        let layout = FeatureLayout {
            boundaries: false,
            cylinder: false,
            type_embedding: false,
        };
        let builder = builder(layout, 2, &varmap);
        let nodes: Vec<Vec<f32>> = builder
            .node_features(&window, &Tensor::zeros(1, DType::I64, &device).unwrap())
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(nodes[0].len(), 10);
        for pair in nodes[0].chunks(2) {
            assert!((pair[0] - 0.1).abs() < 1e-4);
            assert!(pair[1].abs() < 1e-6);
        }
    }

    #[test]
    fn test_out_of_range_particle_type_rejected() {
        let varmap = VarMap::new();
        let planar = builder(FeatureLayout::planar(), 2, &varmap);
        let types = Tensor::new(&[0i64, -1], &Device::Cpu).unwrap();
        let result = planar.node_features(&window(2, 2), &types);
        assert!(matches!(
            result,
            Err(GnsError::InvalidParticleType { id: -1, .. })
        ));
    }

    #[test]
    fn test_wrong_window_length_rejected() {
        let varmap = VarMap::new();
        let planar = builder(FeatureLayout::planar(), 2, &varmap);
        let short = Tensor::zeros((2, 4, 2), DType::F32, &Device::Cpu).unwrap();
        let types = Tensor::zeros(2, DType::I64, &Device::Cpu).unwrap();
        assert!(matches!(
            planar.node_features(&short, &types),
            Err(GnsError::DimensionMismatch { expected: 6, got: 4 })
        ));
    }

    #[test]
    fn test_kinematic_masks() {
        let types = Tensor::new(&[0i64, -1, 0, -1], &Device::Cpu).unwrap();
        let mask: Vec<u8> = kinematic_mask(&types, -1).unwrap().to_vec1().unwrap();
        let weights: Vec<f32> = non_kinematic_weights(&types, -1).unwrap().to_vec1().unwrap();
        assert_eq!(mask, vec![0, 1, 0, 1]);
        assert_eq!(weights, vec![1.0, 0.0, 1.0, 0.0]);
    }
}
