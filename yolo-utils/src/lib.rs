//! Common helpers shared across the YOLO crates.

/// Application configuration and settings management.
pub mod config;
/// Shared GPU context initialization and buffer pooling helpers.
pub mod gpu;
/// Image loading and letterbox geometry.
pub mod image_utils;
/// Declarative helpers for WGSL pipeline boilerplate.
pub mod macros;
/// Instrumentation helpers for optional performance tracing.
pub mod telemetry;

use std::path::Path;

use anyhow::Result;
use log::LevelFilter;

pub use config::{
    AppSettings, DetectionSettings, GpuSettings, InputDimensions, ResizeQuality,
    TelemetrySettings,
};
pub use gpu::{
    BufferPoolError, GpuAvailability, GpuBufferPool, GpuContext, GpuContextOptions, GpuInitError,
    GpuStatusIndicator, GpuStatusMode,
};
pub use image_utils::{LetterboxGeometry, letterbox_rgb, load_image, rgb_to_chw_normalized};
pub use telemetry::{
    TimingGuard, configure as configure_telemetry, telemetry_allows, telemetry_enabled,
    telemetry_level, timing_guard, timing_guard_if,
};

/// Log target used for GPU plumbing messages.
pub const GPU_LOG_TARGET: &str = "yolo::gpu";
/// Log target used by the timing guards.
pub const TELEMETRY_LOG_TARGET: &str = "yolo::telemetry";

/// Initialize logging once for CLI and library consumers.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies. Telemetry
/// output is always routed so that guards can decide on their own.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.filter_module(TELEMETRY_LOG_TARGET, LevelFilter::Trace);

    if builder.try_init().is_err() {
        // Logger already initialized; nothing to do.
    }
    Ok(())
}

/// Validate that a path exists and resolve it to an absolute path.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> Result<std::path::PathBuf> {
    let path = path.as_ref();
    anyhow::ensure!(path.exists(), "path does not exist: {}", path.display());
    Ok(path.canonicalize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_rejects_missing_files() {
        let err = normalize_path("definitely/not/here.safetensors").unwrap_err();
        assert!(err.to_string().contains("path does not exist"));
    }

    #[test]
    fn normalize_path_resolves_existing_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resolved = normalize_path(dir.path()).expect("normalize");
        assert!(resolved.is_absolute());
    }
}
