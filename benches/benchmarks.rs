//! Performance Benchmarks for the mill simulator
//!
//! Run with: cargo bench
//!
//! Benchmarks cover:
//! - Feature construction (velocities, cylinder distances, edge displacements)
//! - Full forward passes at several particle counts
//! - One rollout step including the window slide

use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mill_gns::{
    rollout, EdgeIndex, KinematicMotion, LearnedCylinderSimulator, Metadata, SimulatorConfig,
};

const METADATA: &str = r#"{
    "dim": 3,
    "sequence_length": 20,
    "dt": 0.005,
    "bounds": [[-1.0, 1.0], [-1.0, 1.0], [0.0, 2.0]],
    "geometry": {"axis_start": [0.0, 0.0, 0.0], "axis_end": [0.0, 0.0, 2.0], "radius": 1.0},
    "acc_mean": [0.0, 0.0, -9.8],
    "acc_std": [2.0, 2.0, 2.0],
    "vel_mean": [0.0, 0.0, 0.0],
    "vel_std": [0.5, 0.5, 0.5]
}"#;

// ═══════════════════════════════════════════════════════════════════════════
// SETUP
// ═══════════════════════════════════════════════════════════════════════════

fn simulator(config: &SimulatorConfig) -> LearnedCylinderSimulator {
    let metadata = Metadata::from_json(METADATA).unwrap();
    let (simulator, _varmap) =
        LearnedCylinderSimulator::new_random(&metadata, config, 0.0, &Device::Cpu).unwrap();
    simulator
}

/// Particles on a helix inside the cylinder, drifting slowly
fn window(n: usize, c: usize) -> Tensor {
    let mut data = Vec::with_capacity(n * c * 3);
    for p in 0..n {
        let angle = p as f32 * 0.37;
        let radius = 0.2 + 0.6 * (p % 7) as f32 / 7.0;
        for s in 0..c {
            data.push(radius * angle.cos() + 0.001 * s as f32);
            data.push(radius * angle.sin());
            data.push(0.1 + 1.8 * p as f32 / n as f32);
        }
    }
    Tensor::from_vec(data, (n, c, 3), &Device::Cpu).unwrap()
}

/// Each particle connected to its next eight neighbours in index order
fn edges(n: usize) -> EdgeIndex {
    let pairs: Vec<(usize, usize)> = (0..n)
        .flat_map(|i| (1..=8).map(move |k| (i, (i + k) % n)))
        .collect();
    EdgeIndex::from_pairs(&pairs, &Device::Cpu).unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════
// BENCHMARKS
// ═══════════════════════════════════════════════════════════════════════════

fn bench_features(c: &mut Criterion) {
    let config = SimulatorConfig::default();
    let simulator = simulator(&config);

    let mut group = c.benchmark_group("build_features");
    for n in [256, 1024, 4096].iter() {
        let window = window(*n, config.input_sequence_length);
        let types = Tensor::zeros(*n, DType::I64, &Device::Cpu).unwrap();
        let edges = edges(*n);
        group.throughput(Throughput::Elements(*n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), n, |b, _| {
            b.iter(|| {
                simulator
                    .build_features(black_box(&window), &types, &edges)
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_forward(c: &mut Criterion) {
    let config = SimulatorConfig {
        latent_dim: 64,
        mlp_hidden_dim: 64,
        ..SimulatorConfig::default()
    };
    let simulator = simulator(&config);

    let mut group = c.benchmark_group("forward");
    group.sample_size(20);
    for n in [256, 1024].iter() {
        let window = window(*n, config.input_sequence_length);
        let types = Tensor::zeros(*n, DType::I64, &Device::Cpu).unwrap();
        let edges = edges(*n);
        group.throughput(Throughput::Elements(*n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), n, |b, _| {
            b.iter(|| {
                simulator
                    .predict_positions(black_box(&window), &types, &edges)
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_rollout_step(c: &mut Criterion) {
    let config = SimulatorConfig::tiny();
    let simulator = simulator(&config);
    let n = 512;
    let window = window(n, config.input_sequence_length);
    let truth = window.narrow(1, config.input_sequence_length - 1, 1).unwrap().squeeze(1).unwrap();
    let types = Tensor::zeros(n, DType::I64, &Device::Cpu).unwrap();
    let edges = edges(n);

    c.bench_function("rollout_step_512", |b| {
        b.iter(|| {
            rollout(
                &simulator,
                black_box(&window),
                &truth,
                &types,
                &edges,
                1,
                &KinematicMotion::Stationary,
            )
            .unwrap()
        })
    });
}

criterion_group!(benches, bench_features, bench_forward, bench_rollout_step);
criterion_main!(benches);
