use std::{fmt, path::Path, str::FromStr, sync::Arc};

use anyhow::{Result, anyhow};
use image::DynamicImage;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use yolo_utils::{
    GPU_LOG_TARGET, LetterboxGeometry,
    config::GpuSettings,
    gpu::{GpuAvailability, GpuContext, GpuContextOptions, GpuStatusIndicator},
    timing_guard,
};

use crate::gpu::GpuYolo;
use crate::model::{CpuYolo, DetectionBackend, YoloModel};
use crate::postprocess::{Detection, PostprocessConfig, apply_postprocess};
use crate::preprocess::{
    CpuPreprocessor, PreprocessConfig, PreprocessOutput, Preprocessor, WgpuPreprocessor,
    preprocess_image_with,
};
use crate::variant::ModelVariant;

/// Result of running YOLOv8 on an image.
#[derive(Debug)]
pub struct DetectionOutput {
    /// Detections in source-image pixels, best first.
    pub detections: Vec<Detection>,
    /// Where the source image sat inside the network input.
    pub letterbox: LetterboxGeometry,
    /// Name of the backend that ran the network.
    pub backend: &'static str,
}

impl DetectionOutput {
    /// The original dimensions of the input image.
    pub fn original_size(&self) -> (u32, u32) {
        self.letterbox.source
    }
}

/// Which backend should run the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// GPU when an adapter is usable, CPU otherwise.
    #[default]
    Auto,
    Cpu,
    /// GPU or fail.
    Gpu,
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendPreference::Auto => "auto",
            BackendPreference::Cpu => "cpu",
            BackendPreference::Gpu => "gpu",
        })
    }
}

impl FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "cpu" => Ok(BackendPreference::Cpu),
            "gpu" | "wgpu" => Ok(BackendPreference::Gpu),
            other => Err(format!(
                "invalid backend '{other}'; expected 'auto', 'cpu' or 'gpu'"
            )),
        }
    }
}

/// Backend selection plus the GPU knobs it needs.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub preference: BackendPreference,
    pub gpu: GpuContextOptions,
    /// Buffer pool ceiling in bytes; estimated from the model when `None`.
    pub memory_limit: Option<u64>,
    /// Letterbox on the GPU when the GPU backend is active.
    pub gpu_preprocessing: bool,
}

impl BackendConfig {
    pub fn cpu() -> Self {
        Self {
            preference: BackendPreference::Cpu,
            ..Default::default()
        }
    }

    /// Build from persisted settings; disabled GPU settings force the CPU.
    pub fn from_settings(preference: BackendPreference, settings: &GpuSettings) -> Self {
        let preference = if !settings.enabled || !settings.inference {
            BackendPreference::Cpu
        } else {
            preference
        };
        Self {
            preference,
            gpu: settings.into(),
            memory_limit: settings.memory_limit_bytes(),
            gpu_preprocessing: settings.preprocessing,
        }
    }
}

/// Couples a loaded model and backend with preprocessing and postprocessing settings.
///
/// This is the main entry point for running object detection.
#[derive(Debug)]
pub struct YoloDetector {
    model: YoloModel,
    backend: Box<dyn DetectionBackend>,
    preprocessor: Box<dyn Preprocessor>,
    preprocess: PreprocessConfig,
    postprocess: PostprocessConfig,
    gpu_status: Option<GpuStatusIndicator>,
}

impl YoloDetector {
    /// Construct a detector from a weight file and configuration.
    ///
    /// # Arguments
    ///
    /// * `model_path` - The path to the `.safetensors` weights.
    /// * `variant` - Model scale, detected from the weights when `None`.
    /// * `preprocess` - The configuration for image preprocessing.
    /// * `postprocess` - The configuration for detection postprocessing.
    /// * `backend` - Backend preference and GPU options.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        variant: Option<ModelVariant>,
        preprocess: PreprocessConfig,
        postprocess: PostprocessConfig,
        backend: BackendConfig,
    ) -> Result<Self> {
        let _guard = timing_guard("yolo_core::load_detector", log::Level::Debug);
        let model = YoloModel::load(model_path, variant, preprocess.input_size)?;
        Self::from_model(model, preprocess, postprocess, backend)
    }

    /// Construct a detector around an already loaded model.
    pub fn from_model(
        model: YoloModel,
        preprocess: PreprocessConfig,
        postprocess: PostprocessConfig,
        backend: BackendConfig,
    ) -> Result<Self> {
        anyhow::ensure!(
            model.input_size() == preprocess.input_size,
            "model was built for {}x{} but preprocessing targets {}x{}",
            model.input_size().width,
            model.input_size().height,
            preprocess.input_size.width,
            preprocess.input_size.height
        );

        let ((backend, preprocessor), gpu_status) = select_backend(&model, &backend)?;
        info!(
            "{} ready on {} backend ({} classes, {}x{})",
            model.variant(),
            backend.name(),
            model.num_classes(),
            preprocess.input_size.width,
            preprocess.input_size.height
        );
        Ok(Self {
            model,
            backend,
            preprocessor,
            preprocess,
            postprocess,
            gpu_status,
        })
    }

    /// Run detection on an image file path.
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the image file.
    pub fn detect_path<P: AsRef<Path>>(&self, path: P) -> Result<DetectionOutput> {
        let _guard = timing_guard("yolo_core::detect_path", log::Level::Debug);
        let prep = preprocess_image_with(self.preprocessor.as_ref(), path, &self.preprocess)?;
        self.run_preprocessed(prep)
    }

    /// Run detection on an in-memory dynamic image.
    ///
    /// # Arguments
    ///
    /// * `image` - The dynamic image to process.
    pub fn detect_image(&self, image: &DynamicImage) -> Result<DetectionOutput> {
        let _guard = timing_guard("yolo_core::detect_image", log::Level::Debug);
        let prep = self.preprocessor.preprocess(image, &self.preprocess)?;
        self.run_preprocessed(prep)
    }

    pub fn model(&self) -> &YoloModel {
        &self.model
    }

    /// Name of the backend running the network.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Outcome of the GPU setup, or `None` when the CPU was requested outright.
    pub fn gpu_status(&self) -> Option<&GpuStatusIndicator> {
        self.gpu_status.as_ref()
    }

    /// Access the underlying postprocess configuration.
    pub fn postprocess_config(&self) -> &PostprocessConfig {
        &self.postprocess
    }

    /// Access the preprocessing configuration.
    pub fn preprocess_config(&self) -> &PreprocessConfig {
        &self.preprocess
    }

    /// Run the model on a preprocessed tensor and return the final detections.
    fn run_preprocessed(&self, prep: PreprocessOutput) -> Result<DetectionOutput> {
        let _guard = timing_guard("yolo_core::run_preprocessed", log::Level::Trace);

        let raw = {
            let _guard = timing_guard("yolo_core::inference", log::Level::Debug);
            self.backend.run(&prep.tensor)?
        };

        let detections = {
            let _guard = timing_guard("yolo_core::postprocess", log::Level::Debug);
            apply_postprocess(raw.view(), &prep.letterbox, &self.postprocess)?
        };

        Ok(DetectionOutput {
            detections,
            letterbox: prep.letterbox,
            backend: self.backend.name(),
        })
    }
}

type SelectedBackend = (Box<dyn DetectionBackend>, Box<dyn Preprocessor>);

/// GPU setup failure together with the status reported for it.
struct GpuSetupError {
    status: GpuStatusIndicator,
    error: anyhow::Error,
}

fn select_backend(
    model: &YoloModel,
    config: &BackendConfig,
) -> Result<(SelectedBackend, Option<GpuStatusIndicator>)> {
    let (gpu, status) = match config.preference {
        BackendPreference::Cpu => (None, None),
        BackendPreference::Gpu => match gpu_backend(model, config) {
            Ok((selected, status)) => (Some(selected), Some(status)),
            Err(failure) => return Err(failure.error),
        },
        BackendPreference::Auto => match gpu_backend(model, config) {
            Ok((selected, status)) => (Some(selected), Some(status)),
            Err(failure) => {
                warn!(
                    target: GPU_LOG_TARGET,
                    "GPU backend unavailable ({:#}); using CPU", failure.error
                );
                (None, Some(failure.status))
            }
        },
    };
    let selected: SelectedBackend = match gpu {
        Some(selected) => selected,
        None => (Box::new(CpuYolo::new(model)?), Box::new(CpuPreprocessor)),
    };
    Ok((selected, status))
}

/// Bring up the GPU runtime and report the outcome as a `gpu_status` event.
fn gpu_backend(
    model: &YoloModel,
    config: &BackendConfig,
) -> Result<(SelectedBackend, GpuStatusIndicator), GpuSetupError> {
    let availability = GpuContext::init_with_fallback(&config.gpu);
    let context = match &availability {
        GpuAvailability::Available(ctx) => ctx.clone(),
        GpuAvailability::Disabled { reason } => {
            return Err(report_failure(
                availability.status(),
                anyhow!("GPU backend disabled by configuration: {reason}"),
            ));
        }
        GpuAvailability::Unavailable { error } => {
            return Err(report_failure(
                availability.status(),
                anyhow!("GPU backend unavailable: {error}"),
            ));
        }
    };

    match build_gpu_backend(context.clone(), model, config) {
        Ok((selected, budget)) => {
            let status = context.status();
            status.emit_telemetry(Some(budget));
            Ok((selected, status))
        }
        Err(error) => {
            let status =
                GpuStatusIndicator::fallback(format!("{error:#}"), Some(context.adapter_info()));
            Err(report_failure(status, error))
        }
    }
}

fn build_gpu_backend(
    context: Arc<GpuContext>,
    model: &YoloModel,
    config: &BackendConfig,
) -> Result<(SelectedBackend, u64)> {
    let runtime = GpuYolo::with_context(context.clone(), model, config.memory_limit)?;
    let preprocessor: Box<dyn Preprocessor> = if config.gpu_preprocessing {
        Box::new(WgpuPreprocessor::new(context)?)
    } else {
        Box::new(CpuPreprocessor)
    };
    let budget = runtime.memory_budget();
    let selected: SelectedBackend = (Box::new(runtime), preprocessor);
    Ok((selected, budget))
}

fn report_failure(status: GpuStatusIndicator, error: anyhow::Error) -> GpuSetupError {
    status.emit_telemetry(None);
    GpuSetupError { status, error }
}
