use std::{hint::black_box, sync::Arc};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use yolo_core::{CpuExecutor, ExecutionPlan, GpuInferenceOps, Graph, ModelVariant, WeightStore};
use yolo_utils::gpu::{GpuAvailability, GpuContext, GpuContextOptions};

const CLASSES: usize = 80;

fn build_model(size: usize) -> (Arc<Graph>, Arc<Vec<yolo_core::LayerParams>>) {
    let graph = Arc::new(
        Graph::yolov8(ModelVariant::Nano, CLASSES, size, size).expect("graph should build"),
    );
    let specs = graph.required_tensors();
    let store = WeightStore::synthetic(specs.iter().map(|(n, d)| (n.as_str(), d.as_slice())), 7);
    let params = Arc::new(graph.fold_parameters(&store).expect("synthetic weights fold"));
    (graph, params)
}

fn synthetic_input(size: usize) -> Vec<f32> {
    (0..3 * size * size).map(|i| (i % 255) as f32 / 255.0).collect()
}

fn benchmark_cpu_executor(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_executor");
    group.sample_size(10);
    for size in [64usize, 160] {
        let (graph, params) = build_model(size);
        let executor = CpuExecutor::new(graph, params).expect("executor");
        let input = synthetic_input(size);
        group.bench_with_input(BenchmarkId::new("nano", size), &input, |b, input| {
            b.iter(|| executor.run(black_box(input)).expect("cpu run"));
        });
    }
    group.finish();
}

fn benchmark_gpu_plan(c: &mut Criterion) {
    let ctx = match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
        GpuAvailability::Available(ctx) => ctx,
        _ => {
            eprintln!("Skipping GPU plan benchmark (no adapter available)");
            return;
        }
    };
    let ops = GpuInferenceOps::new(ctx, None).expect("create ops");

    let mut group = c.benchmark_group("gpu_plan");
    for size in [160usize, 640] {
        let (graph, params) = build_model(size);
        let plan = ExecutionPlan::build(&ops, graph, &params).expect("plan");
        let input = synthetic_input(size);
        group.bench_with_input(BenchmarkId::new("nano", size), &input, |b, input| {
            b.iter(|| plan.run(&ops, black_box(input)).expect("plan run"));
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_cpu_executor, benchmark_gpu_plan);
criterion_main!(benches);
