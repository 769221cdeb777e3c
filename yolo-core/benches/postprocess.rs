use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ndarray::Array2;
use yolo_core::{PostprocessConfig, apply_postprocess};
use yolo_utils::LetterboxGeometry;

const ANCHORS: usize = 8400;
const CLASSES: usize = 80;

/// Head output with a few thousand overlapping boxes above threshold.
fn synthetic_head() -> Array2<f32> {
    Array2::from_shape_fn((4 + CLASSES, ANCHORS), |(row, anchor)| {
        let cell = (anchor % 80) as f32 * 8.0;
        match row {
            0 => cell + 4.0,
            1 => (anchor / 80) as f32 * 6.0 + 3.0,
            2 | 3 => 24.0 + (anchor % 7) as f32 * 4.0,
            r if (r - 4) == anchor % CLASSES => 0.2 + (anchor % 13) as f32 * 0.06,
            _ => 0.01,
        }
    })
}

fn benchmark_postprocess(c: &mut Criterion) {
    let head = synthetic_head();
    let letterbox = LetterboxGeometry::compute((1280, 720), (640, 640)).expect("letterbox");

    let configs = [
        ("class_aware", PostprocessConfig::default()),
        (
            "agnostic",
            PostprocessConfig {
                class_agnostic: true,
                ..Default::default()
            },
        ),
        (
            "low_threshold",
            PostprocessConfig {
                score_threshold: 0.05,
                ..Default::default()
            },
        ),
    ];

    let mut group = c.benchmark_group("apply_postprocess");
    for (label, config) in configs.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(label), config, |b, cfg| {
            b.iter(|| {
                apply_postprocess(black_box(head.view()), &letterbox, cfg)
                    .expect("postprocess should succeed")
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_postprocess);
criterion_main!(benches);
