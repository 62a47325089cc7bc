use std::hint::black_box;

use candle_core::Device;
use criterion::{Criterion, criterion_group, criterion_main};
use probe_ml::{
    BatchSource, Trajectory, TrajectoryWindowDataset, WindowLoader, WindowMode, window_indices,
};

fn trajectories(count: usize, len: usize, state_dim: usize) -> Vec<Trajectory> {
    (0..count)
        .map(|t| Trajectory {
            states: (0..len)
                .map(|i| {
                    (0..state_dim)
                        .map(|d| (t * len + i + d) as f32 * 1e-3)
                        .collect()
                })
                .collect(),
            actions: (0..len).map(|i| vec![i as f32 * 1e-2; 7]).collect(),
            success: t % 2 == 0,
        })
        .collect()
}

fn criterion_benchmark(c: &mut Criterion) {
    let lengths: Vec<usize> = (0..1_000).map(|i| 50 + i % 200).collect();
    c.bench_function("window_indices", |b| {
        b.iter(|| window_indices(black_box(&lengths), 10, 10))
    });

    let dataset = TrajectoryWindowDataset::from_trajectories(
        trajectories(50, 200, 24),
        10,
        10,
        WindowMode::Train,
    )
    .expect("bench dataset");

    c.bench_function("window_materialise", |b| {
        b.iter(|| {
            (0..dataset.len())
                .step_by(7)
                .map(|k| dataset.window(k).map(|w| w.values.len()))
                .collect::<Vec<_>>()
        })
    });

    c.bench_function("collate_batch_64", |b| {
        let mut loader = WindowLoader::new(&dataset, 64, &Device::Cpu);
        loader.restart();
        b.iter(|| {
            if loader.next_batch().ok().flatten().is_none() {
                loader.restart();
            }
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
