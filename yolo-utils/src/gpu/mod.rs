//! GPU context management helpers built on top of `wgpu`.
//!
//! Device and queue creation lives here so the detector and the CLI share one
//! code path, with a CPU fallback whenever no compatible adapter exists.

pub mod buffer_pool;

pub use buffer_pool::{BufferPoolError, GpuBufferPool};

use std::sync::Arc;

use crate::{GPU_LOG_TARGET, TELEMETRY_LOG_TARGET, telemetry::telemetry_allows};
use log::{Level, debug, info, log, warn};
use pollster::block_on;
use serde::Serialize;
use thiserror::Error;
use wgpu::{
    Adapter, AdapterInfo, Backends, Device, DeviceDescriptor, Dx12Compiler, ExperimentalFeatures,
    Features, Instance, InstanceDescriptor, InstanceFlags, Limits, MemoryHints, PowerPreference,
    Queue, RequestAdapterError, RequestAdapterOptions, RequestDeviceError, Trace,
};

/// High-level configuration for creating a [`GpuContext`].
#[derive(Clone, Debug)]
pub struct GpuContextOptions {
    /// Whether GPU support is enabled at all.
    pub enabled: bool,
    /// Allow `WGPU_*` environment variables to override the defaults below.
    pub respect_env: bool,
    /// Backends considered when requesting an adapter.
    pub backends: Backends,
    /// Instance flags (debug/validation toggles).
    pub flags: InstanceFlags,
    /// Adapter preference.
    pub power_preference: PowerPreference,
    /// Force wgpu to pick its software fallback adapter.
    pub force_fallback_adapter: bool,
    /// Features the adapter must expose.
    pub required_features: Features,
    /// Features enabled only when supported.
    pub optional_features: Features,
    /// Limits to request. `None` takes the adapter limits.
    pub required_limits: Option<Limits>,
    /// DX12 shader compiler selection for Windows targets.
    pub dx12_shader_compiler: Dx12Compiler,
    /// Debug label for the logical device.
    pub label: Option<String>,
    /// Memory allocation hints forwarded to `wgpu`.
    pub memory_hints: Option<MemoryHints>,
}

impl Default for GpuContextOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            respect_env: true,
            backends: Backends::PRIMARY,
            flags: InstanceFlags::from_build_config(),
            power_preference: PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            required_features: Features::empty(),
            optional_features: Features::empty(),
            required_limits: None,
            dx12_shader_compiler: Dx12Compiler::default(),
            label: Some("YOLO GPU context".to_string()),
            memory_hints: Some(MemoryHints::Performance),
        }
    }
}

impl GpuContextOptions {
    /// Options that never touch the GPU.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn instance_descriptor(&self) -> InstanceDescriptor {
        let mut desc = if self.respect_env {
            InstanceDescriptor::from_env_or_default()
        } else {
            InstanceDescriptor::default()
        };
        desc.backends = self.effective_backends();
        desc.flags = if self.respect_env {
            self.flags.with_env()
        } else {
            self.flags
        };
        desc.backend_options.dx12.shader_compiler = self.dx12_shader_compiler.clone();
        desc
    }

    fn effective_backends(&self) -> Backends {
        if self.respect_env {
            self.backends.with_env()
        } else {
            self.backends
        }
    }
}

/// Result of attempting to initialize a GPU context while supporting CPU fallback.
#[derive(Debug)]
pub enum GpuAvailability {
    /// GPU resources are ready to use.
    Available(Arc<GpuContext>),
    /// GPU disabled by configuration (CLI flag, settings file).
    Disabled { reason: String },
    /// GPU initialization failed; callers should fall back to CPU.
    Unavailable { error: GpuInitError },
}

impl GpuAvailability {
    /// Status snapshot suitable for CLI messaging and telemetry.
    pub fn status(&self) -> GpuStatusIndicator {
        match self {
            Self::Available(ctx) => ctx.status(),
            Self::Disabled { reason } => GpuStatusIndicator::disabled(reason.clone()),
            Self::Unavailable { error } => GpuStatusIndicator::error(error.to_string()),
        }
    }
}

/// High-level GPU availability categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuStatusMode {
    /// GPU inference is active.
    Available,
    /// GPU explicitly disabled by configuration.
    Disabled,
    /// A GPU was found but the runtime fell back to the CPU executor.
    Fallback,
    /// GPU resources are unavailable due to driver/runtime errors.
    Error,
}

impl GpuStatusMode {
    /// Stable identifier for telemetry output.
    pub fn as_str(self) -> &'static str {
        match self {
            GpuStatusMode::Available => "available",
            GpuStatusMode::Disabled => "disabled",
            GpuStatusMode::Fallback => "fallback",
            GpuStatusMode::Error => "error",
        }
    }
}

/// User-facing snapshot of GPU availability and adapter metadata.
#[derive(Debug, Clone, Serialize)]
pub struct GpuStatusIndicator {
    pub mode: GpuStatusMode,
    pub summary: String,
    pub detail: Option<String>,
    pub adapter_name: Option<String>,
    /// Backend label (Vulkan, Metal, Dx12, ...).
    pub backend: Option<String>,
    pub driver: Option<String>,
}

impl GpuStatusIndicator {
    /// Successful GPU activation.
    pub fn available(info: &AdapterInfo) -> Self {
        Self {
            mode: GpuStatusMode::Available,
            summary: format!("Using {}", info.name),
            detail: None,
            adapter_name: Some(info.name.clone()),
            backend: Some(format!("{:?}", info.backend)),
            driver: (!info.driver.is_empty()).then(|| info.driver.clone()),
        }
    }

    /// GPU explicitly disabled.
    pub fn disabled(reason: impl Into<String>) -> Self {
        Self::without_adapter(GpuStatusMode::Disabled, "GPU disabled", reason)
    }

    /// GPU present but inference runs on the CPU.
    pub fn fallback(reason: impl Into<String>, info: Option<&AdapterInfo>) -> Self {
        let mut status =
            Self::without_adapter(GpuStatusMode::Fallback, "GPU fallback to CPU", reason);
        if let Some(info) = info {
            status.adapter_name = Some(info.name.clone());
            status.backend = Some(format!("{:?}", info.backend));
        }
        status
    }

    /// GPU entirely unavailable.
    pub fn error(reason: impl Into<String>) -> Self {
        Self::without_adapter(GpuStatusMode::Error, "GPU unavailable", reason)
    }

    fn without_adapter(mode: GpuStatusMode, summary: &str, reason: impl Into<String>) -> Self {
        Self {
            mode,
            summary: summary.to_string(),
            detail: Some(reason.into()),
            adapter_name: None,
            backend: None,
            driver: None,
        }
    }

    /// Emit a `gpu_status` telemetry event when telemetry allows info output.
    pub fn emit_telemetry(&self, memory_budget: Option<u64>) {
        if !telemetry_allows(Level::Info) {
            return;
        }

        #[derive(Serialize)]
        struct Payload<'a> {
            event: &'static str,
            #[serde(flatten)]
            status: &'a GpuStatusIndicator,
            memory_budget: Option<u64>,
        }

        let payload = Payload {
            event: "gpu_status",
            status: self,
            memory_budget,
        };
        match serde_json::to_string(&payload) {
            Ok(json) => log!(target: TELEMETRY_LOG_TARGET, Level::Info, "{json}"),
            Err(err) => warn!(
                target: TELEMETRY_LOG_TARGET,
                "failed to serialize GPU telemetry payload: {err}"
            ),
        }
    }
}

/// Shared GPU device/queue wrapper with adapter metadata.
#[derive(Debug)]
pub struct GpuContext {
    _instance: Instance,
    adapter: Adapter,
    device: Device,
    queue: Queue,
    info: AdapterInfo,
    features: Features,
    limits: Limits,
}

impl GpuContext {
    /// Initialize a new GPU context with the provided options.
    pub fn initialize(options: &GpuContextOptions) -> Result<Self, GpuInitError> {
        if !options.enabled {
            return Err(GpuInitError::Disabled);
        }

        let instance = Instance::new(&options.instance_descriptor());
        let backends = options.effective_backends();
        let adapter = block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference: options.power_preference,
            force_fallback_adapter: options.force_fallback_adapter,
            compatible_surface: None,
        }))
        .map_err(|source| GpuInitError::Adapter { backends, source })?;

        let info = adapter.get_info();
        let features = negotiate_features(options, adapter.features())?;
        let limits = options
            .required_limits
            .clone()
            .unwrap_or_else(|| adapter.limits());

        let (device, queue) = block_on(adapter.request_device(&DeviceDescriptor {
            label: options.label.as_deref(),
            required_features: features,
            required_limits: limits.clone(),
            experimental_features: ExperimentalFeatures::default(),
            memory_hints: options.memory_hints.clone().unwrap_or_default(),
            trace: Trace::default(),
        }))?;

        info!(
            target: GPU_LOG_TARGET,
            "Using GPU adapter '{}' ({:?}/{:?}), max storage binding {} bytes",
            info.name, info.backend, info.device_type, limits.max_storage_buffer_binding_size
        );

        Ok(Self {
            _instance: instance,
            adapter,
            device,
            queue,
            info,
            features,
            limits,
        })
    }

    /// Attempt to create a GPU context, reporting why it is not available otherwise.
    pub fn init_with_fallback(options: &GpuContextOptions) -> GpuAvailability {
        match Self::initialize(options) {
            Ok(ctx) => GpuAvailability::Available(Arc::new(ctx)),
            Err(GpuInitError::Disabled) => GpuAvailability::Disabled {
                reason: "GPU acceleration disabled via configuration".to_string(),
            },
            Err(err) => {
                warn!(
                    target: GPU_LOG_TARGET,
                    "GPU initialization failed ({err}); falling back to CPU."
                );
                GpuAvailability::Unavailable { error: err }
            }
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Adapter metadata for logging and status output.
    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }

    /// Features enabled on the logical device.
    pub fn features(&self) -> Features {
        self.features
    }

    /// Limits negotiated for the logical device.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Largest single storage buffer binding, in bytes.
    pub fn max_storage_binding(&self) -> u64 {
        u64::from(self.limits.max_storage_buffer_binding_size).min(self.limits.max_buffer_size)
    }

    /// Status snapshot for this context.
    pub fn status(&self) -> GpuStatusIndicator {
        GpuStatusIndicator::available(&self.info)
    }
}

/// Unmaps a `MAP_READ` buffer when a readback is abandoned.
///
/// Covers both a pending `map_async` and a completed one, so the buffer can
/// be mapped again. Disarm it when the map request itself failed, since the
/// buffer was never mapped.
pub struct ReadbackGuard<'a> {
    buffer: &'a wgpu::Buffer,
    armed: bool,
}

impl<'a> ReadbackGuard<'a> {
    pub fn new(buffer: &'a wgpu::Buffer) -> Self {
        Self {
            buffer,
            armed: true,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ReadbackGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.buffer.unmap();
        }
    }
}

fn negotiate_features(
    options: &GpuContextOptions,
    supported: Features,
) -> Result<Features, GpuInitError> {
    if !supported.contains(options.required_features) {
        return Err(GpuInitError::MissingFeatures {
            requested: options.required_features,
            supported,
        });
    }

    let optional = options.optional_features & supported;
    let missing = options.optional_features & !supported;
    if !optional.is_empty() {
        debug!(target: GPU_LOG_TARGET, "Enabling optional GPU features: {optional:?}");
    }
    if !missing.is_empty() {
        debug!(target: GPU_LOG_TARGET, "Skipping unsupported optional GPU features: {missing:?}");
    }
    Ok(options.required_features | optional)
}

/// Reasons a GPU context could not be created.
#[derive(Debug, Error)]
pub enum GpuInitError {
    #[error("GPU adapter request failed for {backends:?}: {source}")]
    Adapter {
        backends: Backends,
        #[source]
        source: RequestAdapterError,
    },
    #[error(
        "GPU adapter missing required features (requested={requested:?}, supported={supported:?})"
    )]
    MissingFeatures {
        requested: Features,
        supported: Features,
    },
    #[error("GPU device creation failed: {0}")]
    Device(#[from] RequestDeviceError),
    #[error("GPU acceleration disabled")]
    Disabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_options_skip_gpu_setup() {
        let availability = GpuContext::init_with_fallback(&GpuContextOptions::disabled());
        match &availability {
            GpuAvailability::Disabled { .. } => {}
            other => panic!("expected GPU to be disabled, got {other:?}"),
        }
        assert_eq!(availability.status().mode, GpuStatusMode::Disabled);
    }

    #[test]
    fn missing_required_features_are_reported() {
        let options = GpuContextOptions {
            required_features: Features::SHADER_F16,
            ..GpuContextOptions::default()
        };
        let err = negotiate_features(&options, Features::empty()).unwrap_err();
        assert!(matches!(err, GpuInitError::MissingFeatures { .. }));
    }

    #[test]
    fn init_failures_report_error_mode() {
        let availability = GpuAvailability::Unavailable {
            error: GpuInitError::MissingFeatures {
                requested: Features::SHADER_F16,
                supported: Features::empty(),
            },
        };
        let status = availability.status();
        assert_eq!(status.mode, GpuStatusMode::Error);
        assert!(status.detail.is_some_and(|d| d.contains("missing required features")));
    }

    #[test]
    fn abandoned_readback_can_be_mapped_again() {
        let context = match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
            GpuAvailability::Available(ctx) => ctx,
            other => {
                eprintln!("Skipping readback guard test: {:?}", other.status().summary);
                return;
            }
        };
        let buffer = context.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_guard_test"),
            size: 16,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        {
            let _guard = ReadbackGuard::new(&buffer);
            buffer.slice(..).map_async(wgpu::MapMode::Read, |_| {});
        }

        let values = crate::gpu_readback_f32!(buffer, context.device(), 4, "guard test").unwrap();
        assert_eq!(values, vec![0.0; 4]);
        // The successful readback unmapped the buffer as well.
        let again = crate::gpu_readback_f32!(buffer, context.device(), 4, "guard test").unwrap();
        assert_eq!(again, values);
    }

    #[test]
    fn optional_features_are_masked_by_support() {
        let options = GpuContextOptions {
            optional_features: Features::SHADER_F16 | Features::TIMESTAMP_QUERY,
            ..GpuContextOptions::default()
        };
        let features = negotiate_features(&options, Features::TIMESTAMP_QUERY).unwrap();
        assert_eq!(features, Features::TIMESTAMP_QUERY);
    }

    #[test]
    fn status_serializes_with_snake_case_mode() {
        let status = GpuStatusIndicator::fallback("plan exceeds memory budget", None);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["mode"], "fallback");
        assert_eq!(json["detail"], "plan exceeds memory budget");
    }
}
