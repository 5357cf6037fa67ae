//! # Trajectory Datasets
//!
//! Loads particle trajectories and cuts them into training windows.
//!
//! ## File Format
//!
//! Each split is one safetensors file in the data directory
//! (`train.safetensors`, `valid.safetensors`, `test.safetensors`). Trajectory
//! `i` is stored under three keys:
//!
//! ```text
//! <i>.positions       f32  [N, T, D]
//! <i>.particle_type   i64  [N]
//! <i>.edge_index      i64  [2, E]
//! ```
//!
//! A file holding a single trajectory may use the bare key names instead.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mill_gns::dataset::{TrajectoryDataset, WindowLoader};
//!
//! let dataset = TrajectoryDataset::load("data/train.safetensors", &device)?;
//! let mut loader = WindowLoader::new(&dataset, 6, 2, true, 42, 0, 1, device.clone())?;
//! while let Some(batch) = loader.next_batch() {
//!     // batch.positions: [sum N, 6, D]
//!     // batch.next_positions: [sum N, D]
//! }
//! ```

use candle_core::{DType, Device, IndexOp, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::checkpoint::write_atomic;
use crate::error::GnsError;
use crate::graph::EdgeIndex;
use crate::rollout::{KinematicMotion, RolloutExample};
use crate::training::{Batch, BatchSource};
use crate::GnsResult;

/// Names of the split files
pub const TRAIN_SPLIT: &str = "train";
pub const VALID_SPLIT: &str = "valid";
pub const TEST_SPLIT: &str = "test";

/// One simulated trajectory with fixed connectivity
#[derive(Debug, Clone)]
pub struct Trajectory {
    /// `[N, T, D]`
    pub positions: Tensor,
    /// `[N]`, i64
    pub particle_types: Tensor,
    pub edges: EdgeIndex,
}

impl Trajectory {
    pub fn new(positions: Tensor, particle_types: Tensor, edges: EdgeIndex) -> GnsResult<Self> {
        let (n, _, _) = positions.dims3()?;
        let types_n = particle_types.dims1()?;
        if types_n != n {
            return Err(GnsError::DimensionMismatch { expected: n, got: types_n });
        }
        edges.validate(n)?;
        Ok(Self {
            positions: positions.to_dtype(DType::F32)?,
            particle_types: particle_types.to_dtype(DType::I64)?,
            edges,
        })
    }

    pub fn num_particles(&self) -> usize {
        self.positions.dims()[0]
    }

    pub fn num_steps(&self) -> usize {
        self.positions.dims()[1]
    }

    pub fn dim(&self) -> usize {
        self.positions.dims()[2]
    }

    /// Windows of `window` positions that still have a following label
    pub fn num_windows(&self, window: usize) -> usize {
        self.num_steps().saturating_sub(window)
    }

    /// Positions `start..start+window` and the position right after
    pub fn window(&self, start: usize, window: usize) -> GnsResult<(Tensor, Tensor)> {
        if start + window >= self.num_steps() {
            return Err(GnsError::InvalidConfig(format!(
                "window {}..{} has no label in a trajectory of {} steps",
                start,
                start + window,
                self.num_steps()
            )));
        }
        let positions = self.positions.narrow(1, start, window)?.contiguous()?;
        let next = self.positions.i((.., start + window))?.contiguous()?;
        Ok((positions, next))
    }

    /// Rollout of `nsteps` from the first window (all remaining steps for
    /// `None`). The ground truth is the position after the last predicted
    /// step; kinematic particles follow the recorded trajectory.
    pub fn rollout_example(
        &self,
        window: usize,
        nsteps: Option<usize>,
    ) -> GnsResult<(RolloutExample, usize)> {
        let steps = self.num_steps();
        if steps <= window {
            return Err(GnsError::InvalidConfig(format!(
                "trajectory of {} steps is too short for a window of {}",
                steps, window
            )));
        }
        let available = steps - window;
        let nsteps = nsteps.unwrap_or(available);
        if nsteps > available {
            return Err(GnsError::InvalidConfig(format!(
                "trajectory has {} steps after the window, rollout asks for {}",
                available, nsteps
            )));
        }
        let initial_window = self.positions.narrow(1, 0, window)?.contiguous()?;
        let last = (window + nsteps).saturating_sub(1);
        let ground_truth = self.positions.i((.., last))?.contiguous()?;
        let prescribed = self
            .positions
            .narrow(1, window, nsteps)?
            .transpose(0, 1)?
            .contiguous()?;
        let example = RolloutExample {
            initial_window,
            ground_truth,
            particle_types: self.particle_types.clone(),
            edges: self.edges.clone(),
            kinematic: KinematicMotion::Prescribed(prescribed),
        };
        Ok((example, nsteps))
    }

    fn to_device(&self, device: &Device) -> GnsResult<Self> {
        Ok(Self {
            positions: self.positions.to_device(device)?,
            particle_types: self.particle_types.to_device(device)?,
            edges: self.edges.to_device(device)?,
        })
    }
}

/// Trajectories of one split
#[derive(Debug, Clone, Default)]
pub struct TrajectoryDataset {
    trajectories: Vec<Trajectory>,
}

impl TrajectoryDataset {
    pub fn from_trajectories(trajectories: Vec<Trajectory>) -> Self {
        Self { trajectories }
    }

    /// Read a split file
    pub fn load(path: impl AsRef<Path>, device: &Device) -> GnsResult<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, device)
            .map_err(|e| GnsError::Io(format!("Failed to read dataset {:?}: {}", path, e)))?;
        let dataset = Self::from_tensors(tensors, device)?;
        log::info!(
            "Loaded {} trajectories ({} windows) from {:?}",
            dataset.len(),
            dataset.num_windows(crate::config::INPUT_SEQUENCE_LENGTH),
            path
        );
        Ok(dataset)
    }

    /// Read split `name` from a data directory
    pub fn load_split(data_path: impl AsRef<Path>, name: &str, device: &Device) -> GnsResult<Self> {
        Self::load(data_path.as_ref().join(format!("{}.safetensors", name)), device)
    }

    fn from_tensors(mut tensors: HashMap<String, Tensor>, device: &Device) -> GnsResult<Self> {
        if tensors.contains_key("positions") {
            let trajectory = take_trajectory(&mut tensors, "", device)?;
            return Ok(Self::from_trajectories(vec![trajectory]));
        }

        let mut prefixes = BTreeMap::new();
        for key in tensors.keys() {
            if let Some(prefix) = key.strip_suffix(".positions") {
                let index: usize = prefix.parse().map_err(|_| {
                    GnsError::SerializationError(format!("unexpected trajectory key {}", key))
                })?;
                prefixes.insert(index, prefix.to_string());
            }
        }
        let trajectories = prefixes
            .values()
            .map(|prefix| take_trajectory(&mut tensors, &format!("{}.", prefix), device))
            .collect::<GnsResult<Vec<_>>>()?;
        Ok(Self::from_trajectories(trajectories))
    }

    /// Write the split atomically
    pub fn save(&self, path: impl AsRef<Path>) -> GnsResult<()> {
        let mut tensors = HashMap::new();
        for (i, trajectory) in self.trajectories.iter().enumerate() {
            let cpu = trajectory.to_device(&Device::Cpu)?;
            tensors.insert(format!("{}.positions", i), cpu.positions);
            tensors.insert(format!("{}.particle_type", i), cpu.particle_types);
            tensors.insert(format!("{}.edge_index", i), cpu.edges.to_tensor(&Device::Cpu)?);
        }
        write_atomic(path.as_ref(), |tmp| {
            candle_core::safetensors::save(&tensors, tmp)?;
            Ok(())
        })
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Trajectory> {
        self.trajectories.get(idx)
    }

    pub fn trajectories(&self) -> &[Trajectory] {
        &self.trajectories
    }

    pub fn num_windows(&self, window: usize) -> usize {
        self.trajectories.iter().map(|t| t.num_windows(window)).sum()
    }

    /// First `ratio` of the trajectories, then the rest
    pub fn split(self, ratio: f64) -> (Self, Self) {
        let mut trajectories = self.trajectories;
        let head = ((trajectories.len() as f64) * ratio).round() as usize;
        let tail = trajectories.split_off(head.min(trajectories.len()));
        (Self::from_trajectories(trajectories), Self::from_trajectories(tail))
    }

    /// One rollout per trajectory
    pub fn rollout_examples(
        &self,
        window: usize,
        nsteps: Option<usize>,
    ) -> GnsResult<Vec<(RolloutExample, usize)>> {
        self.trajectories.iter().map(|t| t.rollout_example(window, nsteps)).collect()
    }
}

fn take_trajectory(
    tensors: &mut HashMap<String, Tensor>,
    prefix: &str,
    device: &Device,
) -> GnsResult<Trajectory> {
    let mut take = |name: &str| {
        let key = format!("{}{}", prefix, name);
        tensors
            .remove(&key)
            .ok_or_else(|| GnsError::SerializationError(format!("dataset has no {}", key)))
    };
    let positions = take("positions")?;
    let particle_types = take("particle_type")?;
    let edges = EdgeIndex::from_tensor(&take("edge_index")?, device)?;
    Trajectory::new(positions, particle_types, edges)
}

/// Merge single examples into one disjoint graph.
///
/// Particles are concatenated in order and every example's edge indices are
/// shifted by the particles that precede it.
pub fn collate(examples: &[(Tensor, Tensor, EdgeIndex, Tensor)], device: &Device) -> GnsResult<Batch> {
    if examples.is_empty() {
        return Err(GnsError::InvalidConfig("cannot collate an empty batch".to_string()));
    }
    let mut windows = Vec::with_capacity(examples.len());
    let mut types = Vec::with_capacity(examples.len());
    let mut nexts = Vec::with_capacity(examples.len());
    let mut edges = Vec::with_capacity(examples.len());
    let mut counts = Vec::with_capacity(examples.len());
    let mut offset = 0;
    for (window, particle_types, edge_index, next) in examples {
        let n = window.dims()[0];
        windows.push(window.clone());
        types.push(particle_types.clone());
        nexts.push(next.clone());
        edges.push(edge_index.offset(offset, device)?);
        counts.push(n);
        offset += n;
    }
    Ok(Batch {
        positions: Tensor::cat(&windows, 0)?.to_device(device)?,
        particle_types: Tensor::cat(&types, 0)?.to_device(device)?,
        n_particles_per_example: counts,
        edges: EdgeIndex::concat(&edges, device)?,
        next_positions: Tensor::cat(&nexts, 0)?.to_device(device)?,
    })
}

/// Shuffled batches of windows for one rank
#[derive(Debug)]
pub struct WindowLoader<'a> {
    dataset: &'a TrajectoryDataset,
    window: usize,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    /// `(trajectory, start)` pairs owned by this rank
    indices: Vec<(usize, usize)>,
    position: usize,
    device: Device,
}

impl<'a> WindowLoader<'a> {
    /// Rank `rank` of `world_size` takes every `world_size`-th window; all
    /// ranks get the same number of windows.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dataset: &'a TrajectoryDataset,
        window: usize,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        rank: usize,
        world_size: usize,
        device: Device,
    ) -> GnsResult<Self> {
        if batch_size == 0 || world_size == 0 || rank >= world_size {
            return Err(GnsError::InvalidConfig(format!(
                "invalid loader setup: batch_size={}, rank={}, world_size={}",
                batch_size, rank, world_size
            )));
        }
        let all: Vec<(usize, usize)> = dataset
            .trajectories()
            .iter()
            .enumerate()
            .flat_map(|(t, traj)| (0..traj.num_windows(window)).map(move |s| (t, s)))
            .collect();
        let per_rank = all.len() / world_size;
        let indices: Vec<(usize, usize)> = all
            .into_iter()
            .skip(rank)
            .step_by(world_size)
            .take(per_rank)
            .collect();

        let mut loader = Self {
            dataset,
            window,
            batch_size,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            indices,
            position: 0,
            device,
        };
        loader.reset();
        Ok(loader)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    fn create_batch(&self, indices: &[(usize, usize)]) -> GnsResult<Batch> {
        let mut examples = Vec::with_capacity(indices.len());
        for &(t, start) in indices {
            let trajectory = self
                .dataset
                .get(t)
                .ok_or_else(|| GnsError::InvalidConfig(format!("no trajectory {}", t)))?;
            let (window, next) = trajectory.window(start, self.window)?;
            examples.push((window, trajectory.particle_types.clone(), trajectory.edges.clone(), next));
        }
        collate(&examples, &self.device)
    }
}

impl BatchSource for WindowLoader<'_> {
    fn next_batch(&mut self) -> Option<GnsResult<Batch>> {
        if self.position >= self.indices.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.indices.len());
        let batch = self.create_batch(&self.indices[self.position..end]);
        self.position = end;
        Some(batch)
    }

    fn reset(&mut self) {
        self.position = 0;
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }
}
