//! End-to-end refinement benchmarks at the 320×720 export resolution.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rust_cv_stereo::core::{Tensor, TensorShape};
use rust_cv_stereo::stereo::{CorrImplementation, RaftStereo, StereoConfig};
use std::time::Duration;

/// Synthetic pair where the right view is the left view shifted by `disparity` columns.
fn stereo_pair(height: usize, width: usize, disparity: usize) -> (Tensor, Tensor) {
    let pattern = |y: usize, x: usize, c: usize| ((x / 6 + y / 9 + c) % 4) as f32 * 60.0;
    let left = Tensor::from_fn(TensorShape::nchw(1, 3, height, width), |i| {
        pattern(i[2], i[3], i[1])
    });
    let right = Tensor::from_fn(TensorShape::nchw(1, 3, height, width), |i| {
        pattern(i[2], i[3] + disparity, i[1])
    });
    (left, right)
}

fn benchmark_refinement(c: &mut Criterion) {
    let (left, right) = stereo_pair(320, 720, 12);

    let mut group = c.benchmark_group("refinement_320x720");
    group.measurement_time(Duration::from_secs(20));
    group.sample_size(10);

    for implementation in [CorrImplementation::Reg, CorrImplementation::AltFast] {
        let config = StereoConfig::default()
            .with_n_downsample(3)
            .with_iters(5)
            .with_corr_implementation(implementation);
        let model = RaftStereo::seeded(config, 0).unwrap();
        group.bench_with_input(
            BenchmarkId::new("forward_export", implementation),
            &model,
            |b, m| b.iter(|| m.forward_export(black_box(&left), black_box(&right)).unwrap()),
        );
    }
    group.finish();
}

criterion_group!(benches, benchmark_refinement);
criterion_main!(benches);
