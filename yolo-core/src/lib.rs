//! Core YOLOv8 inference primitives.
//!
//! This crate loads YOLOv8 weights from `.safetensors`, expands the network
//! into a static graph, and runs it either on the CPU reference executor or
//! on a pre-recorded WebGPU execution plan. Letterbox preprocessing and
//! NMS postprocessing turn images into detections.

/// CPU reference kernels and executor.
pub mod cpu;
/// High-level object detection runner.
pub mod detector;
/// WGSL kernels, GPU tensors and the execution plan.
pub mod gpu;
/// Static YOLOv8 computation graph.
pub mod graph;
/// Class name tables.
pub mod labels;
/// Model loading and inference backends.
pub mod model;
/// Detection post-processing (score filtering, NMS, reprojection).
pub mod postprocess;
/// Image pre-processing (letterboxing, tensor conversion).
pub mod preprocess;
/// Model scale variants.
pub mod variant;
/// Safetensors weight loading.
pub mod weights;

pub use cpu::CpuExecutor;
pub use detector::{BackendConfig, BackendPreference, DetectionOutput, YoloDetector};
pub use gpu::{ExecutionPlan, GpuInferenceOps, GpuYolo};
pub use graph::{Graph, KernelKind, LayerParams, Op};
pub use labels::{COCO_CLASSES, ClassLabels};
pub use model::{CpuYolo, DetectionBackend, YoloModel};
pub use postprocess::{BoundingBox, Detection, PostprocessConfig, apply_postprocess};
pub use preprocess::{
    CpuPreprocessor, InputSize, PreprocessConfig, PreprocessOutput, Preprocessor, WgpuPreprocessor,
    preprocess_dynamic_image, preprocess_image_with,
};
pub use variant::ModelVariant;
pub use weights::{WeightStore, WeightTensor};

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
