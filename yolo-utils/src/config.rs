//! Shared configuration types consumed across the YOLO workspace.
//!
//! Settings serialize to JSON so the CLI can persist and reload them; every
//! section uses `#[serde(default)]`, so partial files are accepted.

use crate::gpu::GpuContextOptions;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path, str::FromStr};

/// Default location of the YOLOv8 weight file.
pub const DEFAULT_MODEL_PATH: &str = "models/yolov8n.safetensors";

/// Post-processing parameters applied to the decoded head output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionSettings {
    /// Minimum class confidence for a candidate box.
    pub score_threshold: f32,
    /// IoU above which the lower-scoring box is suppressed.
    pub iou_threshold: f32,
    /// Maximum number of detections kept per image.
    pub max_detections: usize,
    /// Suppress overlapping boxes regardless of their class.
    pub class_agnostic: bool,
    /// Keep only these class ids; empty keeps every class.
    pub classes: Vec<usize>,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            score_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 300,
            class_agnostic: false,
            classes: Vec::new(),
        }
    }
}

/// Resampling strategy used while letterboxing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResizeQuality {
    /// Bilinear (Triangle) filtering.
    #[default]
    Quality,
    /// Nearest-neighbour filtering for throughput.
    Speed,
}

impl ResizeQuality {
    /// `image` filter matching this quality level.
    pub fn filter(self) -> FilterType {
        match self {
            ResizeQuality::Quality => FilterType::Triangle,
            ResizeQuality::Speed => FilterType::Nearest,
        }
    }
}

impl fmt::Display for ResizeQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResizeQuality::Quality => "quality",
            ResizeQuality::Speed => "speed",
        })
    }
}

impl FromStr for ResizeQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quality" => Ok(ResizeQuality::Quality),
            "speed" => Ok(ResizeQuality::Speed),
            other => Err(format!(
                "invalid resize quality '{other}'; expected 'quality' or 'speed'"
            )),
        }
    }
}

/// Model input resolution in pixels. Both sides must be multiples of 32.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InputDimensions {
    pub width: u32,
    pub height: u32,
    pub resize_quality: ResizeQuality,
}

impl Default for InputDimensions {
    fn default() -> Self {
        Self {
            width: 640,
            height: 640,
            resize_quality: ResizeQuality::Quality,
        }
    }
}

/// Settings controlling optional runtime telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Whether timing logs are enabled.
    pub enabled: bool,
    /// Level for telemetry output (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    /// Resolve the configured level string. Unknown values mean `Debug`.
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "warning" => LevelFilter::Warn,
            other => LevelFilter::from_str(other).unwrap_or(LevelFilter::Debug),
        }
    }

    pub fn set_level(&mut self, level: LevelFilter) {
        self.level = level.as_str().to_ascii_lowercase();
    }
}

/// GPU runtime preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSettings {
    /// Whether GPU acceleration should be attempted at all.
    pub enabled: bool,
    /// Respect `WGPU_*` environment overrides when initializing the backend.
    pub respect_env: bool,
    /// Run the network on the GPU execution plan.
    pub inference: bool,
    /// Letterbox on the GPU before inference.
    pub preprocessing: bool,
    /// Optional memory ceiling in MiB for plan buffers.
    pub memory_limit_mb: Option<u64>,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_env: true,
            inference: true,
            preprocessing: false,
            memory_limit_mb: None,
        }
    }
}

impl GpuSettings {
    /// Memory ceiling in bytes.
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

impl From<&GpuSettings> for GpuContextOptions {
    fn from(settings: &GpuSettings) -> Self {
        GpuContextOptions {
            enabled: settings.enabled,
            respect_env: settings.respect_env,
            ..Default::default()
        }
    }
}

/// Persistent application settings consumed by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Path to the `.safetensors` weight file.
    pub model_path: Option<String>,
    /// Model variant (`n`, `s`, `m`, `l`, `x`); detected from the weights when unset.
    pub variant: Option<String>,
    /// Optional newline-separated class label file.
    pub labels_path: Option<String>,
    pub input: InputDimensions,
    pub detection: DetectionSettings,
    pub telemetry: TelemetrySettings,
    pub gpu: GpuSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model_path: Some(DEFAULT_MODEL_PATH.to_string()),
            variant: None,
            labels_path: None,
            input: InputDimensions::default(),
            detection: DetectionSettings::default(),
            telemetry: TelemetrySettings::default(),
            gpu: GpuSettings::default(),
        }
    }
}

impl AppSettings {
    /// Load settings from a JSON file, filling a missing `model_path` with the default.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let mut settings: AppSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;

        settings
            .model_path
            .get_or_insert_with(|| DEFAULT_MODEL_PATH.to_string());
        Ok(settings)
    }

    /// Serialize settings to disk as pretty-printed JSON, overwriting the file.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }
}
