//! Integration Tests for the mill simulator
//!
//! End-to-end scenarios across features, the network, checkpoints, training
//! and rollouts.

use crate::config::{SimulatorConfig, TrainConfig};
use crate::dataset::tests::synthetic_dataset;
use crate::dataset::{TrajectoryDataset, WindowLoader};
use crate::distributed::{CancellationToken, Collective, SingleProcess, ThreadGroup};
use crate::graph::EdgeIndex;
use crate::metadata::tests::{metadata_2d, metadata_3d};
use crate::rollout::{rollout, KinematicMotion, RolloutOutput};
use crate::simulator::LearnedCylinderSimulator;
use crate::training::{evaluate_rollouts, StopReason, Trainer};
use candle_core::{DType, Device, IndexOp, Tensor};
use std::path::Path;
use tempfile::TempDir;

fn train_config(dir: &Path, steps: usize) -> TrainConfig {
    TrainConfig {
        model_path: dir.to_path_buf(),
        output_path: dir.join("rollouts"),
        data_path: dir.to_path_buf(),
        ntraining_steps: steps,
        nlog_steps: 1,
        nsave_steps: 100,
        nvalid_steps: 100,
        lr_init: 1e-3,
        lr_decay_steps: 100,
        ..Default::default()
    }
}

/// Parameters as `(name, values)` sorted by name
fn parameters(simulator: &LearnedCylinderSimulator) -> Vec<(String, Vec<f32>)> {
    let data = simulator.varmap().data().lock().unwrap();
    let mut params: Vec<(String, Vec<f32>)> = data
        .iter()
        .map(|(name, var)| {
            let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            (name.clone(), values)
        })
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    params
}

// ═══════════════════════════════════════════════════════════════════════════
// SIMULATOR SCENARIOS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod simulator_tests {
    use super::*;

    #[test]
    fn test_still_particle_with_zero_decoder_stays_put() {
        let device = Device::Cpu;
        let metadata = metadata_2d();
        let (simulator, varmap) =
            LearnedCylinderSimulator::new_random(&metadata, &SimulatorConfig::tiny(), 0.0, &device).unwrap();
        {
            let data = varmap.data().lock().unwrap();
            for (name, var) in data.iter() {
                if name.starts_with("decoder.") {
                    var.set(&var.as_tensor().zeros_like().unwrap()).unwrap();
                }
            }
        }

        // one particle resting at (0.3, 0.7) for the whole window
        let window = Tensor::new(&[[0.3f32, 0.7]; 6], &device).unwrap().unsqueeze(0).unwrap();
        let types = Tensor::zeros(1, DType::I64, &device).unwrap();
        let edges = EdgeIndex::empty(&device).unwrap();

        let next = simulator.predict_positions(&window, &types, &edges).unwrap();
        assert_eq!(next.to_vec2::<f32>().unwrap(), vec![vec![0.3, 0.7]]);
    }

    #[test]
    fn test_single_edge_features() {
        let device = Device::Cpu;
        let metadata = metadata_2d();
        let (simulator, _varmap) =
            LearnedCylinderSimulator::new_random(&metadata, &SimulatorConfig::tiny(), 0.0, &device).unwrap();

        // a at (0.1, 0.1), b at (0.4, 0.5), edge a -> b
        let a = Tensor::new(&[[0.1f32, 0.1]; 6], &device).unwrap();
        let b = Tensor::new(&[[0.4f32, 0.5]; 6], &device).unwrap();
        let window = Tensor::stack(&[&a, &b], 0).unwrap();
        let types = Tensor::zeros(2, DType::I64, &device).unwrap();
        let edges = EdgeIndex::from_pairs(&[(0, 1)], &device).unwrap();

        let features = simulator.build_features(&window, &types, &edges).unwrap();
        assert_eq!(features.node_features.dims(), &[2, 18]);
        let edge: Vec<Vec<f32>> = features.edge_features.to_vec2().unwrap();
        assert_eq!(edge.len(), 1);
        assert!((edge[0][0] - 0.3).abs() < 1e-6);
        assert!((edge[0][1] - 0.4).abs() < 1e-6);
        assert!((edge[0][2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_checkpoint_round_trip_reproduces_predictions() {
        let dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let metadata = metadata_3d();
        let config = SimulatorConfig::tiny();
        let dataset = synthetic_dataset(1, 5, 10, 3);
        let trajectory = dataset.get(0).unwrap();
        let (window, _) = trajectory.window(0, 6).unwrap();

        let (first, _) = LearnedCylinderSimulator::new_random(&metadata, &config, 0.0, &device).unwrap();
        let expected = first
            .predict_positions(&window, &trajectory.particle_types, &trajectory.edges)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let path = dir.path().join("model.pt");
        first.save(&path).unwrap();

        let (second, _) = LearnedCylinderSimulator::new_random(&metadata, &config, 0.0, &device).unwrap();
        second.load(&path).unwrap();
        let restored = second
            .predict_positions(&window, &trajectory.particle_types, &trajectory.edges)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(restored, expected);
    }

    #[test]
    fn test_rollout_keeps_mill_wall_particles_on_track() {
        let device = Device::Cpu;
        let metadata = metadata_3d();
        let (simulator, _varmap) =
            LearnedCylinderSimulator::new_random(&metadata, &SimulatorConfig::tiny(), 0.0, &device).unwrap();
        let dataset = synthetic_dataset(1, 4, 12, 3);
        let (example, nsteps) = dataset.get(0).unwrap().rollout_example(6, None).unwrap();
        assert_eq!(nsteps, 6);

        let (output, loss) = rollout(
            &simulator,
            &example.initial_window,
            &example.ground_truth,
            &example.particle_types,
            &example.edges,
            nsteps,
            &example.kinematic,
        )
        .unwrap();
        assert_eq!(loss.dims(), &[4, 3]);

        // particle 0 is kinematic and follows the recorded positions
        let predicted = output.predicted_rollout.to_tensor(&device).unwrap();
        let recorded = dataset.get(0).unwrap().positions.narrow(1, 6, 6).unwrap();
        let ours: Vec<Vec<f32>> = predicted.i((.., 0)).unwrap().to_vec2().unwrap();
        let theirs: Vec<Vec<f32>> = recorded.i(0).unwrap().to_vec2().unwrap();
        assert_eq!(ours, theirs);
        assert!(matches!(example.kinematic, KinematicMotion::Prescribed(_)));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TRAINING SCENARIOS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod training_tests {
    use super::*;

    #[test]
    fn test_train_then_roll_out_test_split() {
        let dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let metadata = metadata_3d();
        let dataset = synthetic_dataset(2, 4, 10, 3);
        dataset.save(dir.path().join("test.safetensors")).unwrap();

        let (simulator, _varmap) =
            LearnedCylinderSimulator::new_random(&metadata, &SimulatorConfig::tiny(), 6.7e-4, &device).unwrap();
        let mut trainer = Trainer::new(
            simulator,
            train_config(dir.path(), 3),
            Box::new(SingleProcess),
            CancellationToken::new(),
        )
        .unwrap();
        let mut loader = WindowLoader::new(&dataset, 6, 2, true, 7, 0, 1, device.clone()).unwrap();
        let outcome = trainer.train(&mut loader, None).unwrap();
        assert_eq!(outcome.final_step, 3);
        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert!(dir.path().join("test-model-3.pt").exists());

        let test_split = TrajectoryDataset::load_split(dir.path(), "test", &device).unwrap();
        let output_dir = dir.path().join("rollouts");
        std::fs::create_dir_all(&output_dir).unwrap();
        let mean = evaluate_rollouts(trainer.simulator(), &test_split, &metadata, Some(&output_dir)).unwrap();
        assert!(mean.is_finite());

        let record = RolloutOutput::load_json(output_dir.join("rollout_1.json")).unwrap();
        assert_eq!(record.predicted_rollout.shape, vec![4, 4, 3]);
        assert_eq!(record.initial_positions.shape, vec![6, 4, 3]);
        assert_eq!(record.particle_types, vec![-1, 0, 0, 0]);
        assert_eq!(record.metadata, Some(metadata));
    }

    #[test]
    fn test_rollout_of_long_trajectory_scores_metadata_horizon() {
        let dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        // sequence_length 10 with a window of 6 gives 4 rollout steps
        let metadata = metadata_3d();
        let dataset = synthetic_dataset(1, 4, 14, 3);
        let (simulator, _varmap) =
            LearnedCylinderSimulator::new_random(&metadata, &SimulatorConfig::tiny(), 0.0, &device).unwrap();

        let mean = evaluate_rollouts(&simulator, &dataset, &metadata, Some(dir.path())).unwrap();
        assert!(mean.is_finite());

        let record = RolloutOutput::load_json(dir.path().join("rollout_0.json")).unwrap();
        assert_eq!(record.predicted_rollout.shape, vec![4, 4, 3]);
        let truth: Vec<Vec<f32>> = record.ground_truth_rollout.to_tensor(&device).unwrap().to_vec2().unwrap();
        let step_9: Vec<Vec<f32>> = dataset.get(0).unwrap().positions.i((.., 9)).unwrap().to_vec2().unwrap();
        assert_eq!(truth, step_9);
    }

    #[test]
    fn test_two_ranks_keep_replicas_equal() {
        let dir = TempDir::new().unwrap();
        let metadata = metadata_3d();
        let dataset = synthetic_dataset(2, 4, 10, 3);
        let handles = ThreadGroup::new(2).unwrap();

        let replicas: Vec<Vec<(String, Vec<f32>)>> = std::thread::scope(|scope| {
            let workers: Vec<_> = handles
                .into_iter()
                .map(|collective| {
                    let (dir, metadata, dataset) = (dir.path(), &metadata, &dataset);
                    scope.spawn(move || {
                        let rank = collective.rank();
                        // different initial weights per rank; broadcast fixes them
                        let (simulator, _varmap) = LearnedCylinderSimulator::new_random(
                            metadata,
                            &SimulatorConfig::tiny(),
                            6.7e-4,
                            &Device::Cpu,
                        )
                        .unwrap();
                        let mut trainer = Trainer::new(
                            simulator,
                            train_config(dir, 3),
                            Box::new(collective),
                            CancellationToken::new(),
                        )
                        .unwrap();
                        let mut loader =
                            WindowLoader::new(dataset, 6, 1, true, 11 + rank as u64, rank, 2, Device::Cpu)
                                .unwrap();
                        let outcome = trainer.train(&mut loader, None).unwrap();
                        assert_eq!(outcome.final_step, 3);
                        parameters(trainer.simulator())
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(replicas.len(), 2);
        for ((name_a, a), (name_b, b)) in replicas[0].iter().zip(replicas[1].iter()) {
            assert_eq!(name_a, name_b);
            for (x, y) in a.iter().zip(b.iter()) {
                assert!((x - y).abs() < 1e-6, "{} diverged: {} vs {}", name_a, x, y);
            }
        }
        // only rank 0 writes checkpoints
        assert!(dir.path().join("test-model-3.pt").exists());
    }

    #[test]
    fn test_cancel_before_start_saves_resumable_pair() {
        let dir = TempDir::new().unwrap();
        let metadata = metadata_3d();
        let dataset = synthetic_dataset(1, 4, 10, 3);
        let (simulator, _varmap) =
            LearnedCylinderSimulator::new_random(&metadata, &SimulatorConfig::tiny(), 0.0, &Device::Cpu).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut trainer =
            Trainer::new(simulator, train_config(dir.path(), 10), Box::new(SingleProcess), cancel).unwrap();
        let mut loader = WindowLoader::new(&dataset, 6, 1, false, 0, 0, 1, Device::Cpu).unwrap();
        let outcome = trainer.train(&mut loader, None).unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);

        let (fresh, _) =
            LearnedCylinderSimulator::new_random(&metadata, &SimulatorConfig::tiny(), 0.0, &Device::Cpu).unwrap();
        let mut resumed =
            Trainer::new(fresh, train_config(dir.path(), 10), Box::new(SingleProcess), CancellationToken::new())
                .unwrap();
        assert_eq!(resumed.resume().unwrap(), Some(outcome.final_step));
    }
}
