//! Command-line argument definitions for yolo-cli.

use clap::{ArgAction, Parser};
use std::path::PathBuf;
use yolo_core::{BackendPreference, ModelVariant};
use yolo_utils::config::ResizeQuality;

/// Run YOLOv8 object detection over images or directories.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct DetectArgs {
    /// Path to an image file or a directory containing images.
    #[arg(short, long, required_unless_present = "print_plan")]
    pub input: Option<PathBuf>,

    /// Path to the `.safetensors` weights (defaults to the settings file, then `models/yolov8n.safetensors`).
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Optional settings JSON (defaults to built-in parameters).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Model scale (n, s, m, l, x). Detected from the weights when omitted.
    #[arg(long, value_name = "SCALE")]
    pub variant: Option<ModelVariant>,

    /// Newline-separated class names (defaults to COCO).
    #[arg(long)]
    pub labels: Option<PathBuf>,

    /// Override input width (pixels, multiple of 32).
    #[arg(long)]
    pub width: Option<u32>,

    /// Override input height (pixels, multiple of 32).
    #[arg(long)]
    pub height: Option<u32>,

    /// Resize quality mode: `quality` (Triangle) or `speed` (fast Nearest).
    #[arg(long, value_name = "MODE")]
    pub resize_quality: Option<ResizeQuality>,

    /// Override score threshold.
    #[arg(long)]
    pub score_threshold: Option<f32>,

    /// Override NMS IoU threshold.
    #[arg(long)]
    pub iou_threshold: Option<f32>,

    /// Override the number of detections kept per image.
    #[arg(long)]
    pub max_detections: Option<usize>,

    /// Suppress overlapping boxes across classes.
    #[arg(long, action = ArgAction::SetTrue)]
    pub agnostic: bool,

    /// Keep only these classes (comma separated names or ids).
    #[arg(long, value_delimiter = ',')]
    pub classes: Vec<String>,

    /// Inference backend: auto, cpu or gpu.
    #[arg(long, default_value_t = BackendPreference::Auto)]
    pub backend: BackendPreference,

    /// Disable GPU acceleration entirely, even if supported.
    #[arg(long = "no-gpu", action = ArgAction::SetTrue)]
    pub no_gpu: bool,

    /// Letterbox on the GPU when the GPU backend is active.
    #[arg(long = "gpu-preprocess", action = ArgAction::SetTrue)]
    pub gpu_preprocess: bool,

    /// Ceiling in MiB for GPU plan buffers.
    #[arg(long = "gpu-memory-limit", value_name = "MIB")]
    pub gpu_memory_limit: Option<u64>,

    /// Write detections to a JSON file instead of stdout.
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Directory to write annotated images with bounding boxes overlaid.
    #[arg(long)]
    pub annotate: Option<PathBuf>,

    /// Enable telemetry timing logs (defaults to settings file).
    #[arg(long, action = ArgAction::SetTrue)]
    pub telemetry: bool,

    /// Override telemetry logging level (error, warn, info, debug, trace).
    #[arg(long, value_name = "LEVEL")]
    pub telemetry_level: Option<String>,

    /// Print the network graph (node, kernel, output shape) and exit.
    #[arg(long = "print-plan", action = ArgAction::SetTrue)]
    pub print_plan: bool,
}
