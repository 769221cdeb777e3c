//! Configuration loading and CLI override logic.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use yolo_core::{BackendConfig, BackendPreference, ClassLabels, ModelVariant};
use yolo_utils::{
    config::{AppSettings, DEFAULT_MODEL_PATH},
    normalize_path,
};

use crate::args::DetectArgs;

/// Load application settings from a file or use defaults.
pub fn load_settings(config_path: Option<&PathBuf>) -> Result<AppSettings> {
    match config_path {
        Some(path) => {
            let resolved = normalize_path(path)?;
            let settings = AppSettings::load_from_path(&resolved)?;
            info!("Loaded settings from {}", resolved.display());
            Ok(settings)
        }
        None => Ok(AppSettings::default()),
    }
}

/// Apply command-line arguments to override loaded or default settings.
///
/// `--classes` is resolved later against the active label table.
pub fn apply_cli_overrides(settings: &mut AppSettings, args: &DetectArgs) {
    if let Some(model) = args.model.as_ref() {
        settings.model_path = Some(model.display().to_string());
    }
    if let Some(variant) = args.variant {
        settings.variant = Some(variant.suffix().to_string());
    }
    if let Some(labels) = args.labels.as_ref() {
        settings.labels_path = Some(labels.display().to_string());
    }

    if args.no_gpu {
        settings.gpu.enabled = false;
        settings.gpu.inference = false;
    }
    if args.gpu_preprocess {
        settings.gpu.preprocessing = true;
    }
    if let Some(limit) = args.gpu_memory_limit {
        settings.gpu.memory_limit_mb = Some(limit);
    }

    if args.telemetry {
        settings.telemetry.enabled = true;
    }
    if let Some(level) = args.telemetry_level.as_ref() {
        let normalized = level.trim();
        if !normalized.is_empty() {
            let lower = normalized.to_ascii_lowercase();
            if lower == "off" {
                settings.telemetry.enabled = false;
            }
            settings.telemetry.level = lower;
        }
    }

    if let Some(width) = args.width {
        settings.input.width = width;
    }
    if let Some(height) = args.height {
        settings.input.height = height;
    }
    if let Some(mode) = args.resize_quality {
        settings.input.resize_quality = mode;
    }
    if let Some(score) = args.score_threshold {
        settings.detection.score_threshold = score;
    }
    if let Some(iou) = args.iou_threshold {
        settings.detection.iou_threshold = iou;
    }
    if let Some(max) = args.max_detections {
        settings.detection.max_detections = max;
    }
    if args.agnostic {
        settings.detection.class_agnostic = true;
    }
}

/// Weight file from the settings, falling back to the bundled default path.
pub fn model_path(settings: &AppSettings) -> &Path {
    Path::new(
        settings
            .model_path
            .as_deref()
            .unwrap_or(DEFAULT_MODEL_PATH),
    )
}

pub fn model_variant(settings: &AppSettings) -> Result<Option<ModelVariant>> {
    settings
        .variant
        .as_deref()
        .map(|raw| raw.parse::<ModelVariant>().map_err(anyhow::Error::msg))
        .transpose()
        .context("invalid variant in settings")
}

pub fn load_labels(settings: &AppSettings) -> Result<ClassLabels> {
    match settings.labels_path.as_deref() {
        Some(path) => ClassLabels::from_file(path),
        None => Ok(ClassLabels::coco()),
    }
}

/// Resolve `--classes` entries (ids or names) into the detection settings.
pub fn apply_class_filter(
    settings: &mut AppSettings,
    classes: &[String],
    labels: &ClassLabels,
) -> Result<()> {
    let requested: Vec<&str> = classes
        .iter()
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .collect();
    if requested.is_empty() {
        return Ok(());
    }
    let mut ids = requested
        .into_iter()
        .map(|entry| labels.resolve(entry))
        .collect::<Result<Vec<_>>>()?;
    ids.sort_unstable();
    ids.dedup();
    settings.detection.classes = ids;
    Ok(())
}

pub fn backend_config(preference: BackendPreference, settings: &AppSettings) -> BackendConfig {
    BackendConfig::from_settings(preference, &settings.gpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> DetectArgs {
        DetectArgs::parse_from(std::iter::once("yolo-cli").chain(args.iter().copied()))
    }

    #[test]
    fn overrides_replace_settings() {
        let args = parse(&[
            "--input",
            "img.png",
            "--width",
            "320",
            "--iou-threshold",
            "0.6",
            "--agnostic",
            "--no-gpu",
            "--variant",
            "s",
        ]);
        let mut settings = AppSettings::default();
        apply_cli_overrides(&mut settings, &args);
        assert_eq!(settings.input.width, 320);
        assert_eq!(settings.input.height, 640);
        assert_eq!(settings.detection.iou_threshold, 0.6);
        assert!(settings.detection.class_agnostic);
        assert!(!settings.gpu.enabled);
        assert_eq!(model_variant(&settings).unwrap(), Some(ModelVariant::Small));

        let backend = backend_config(args.backend, &settings);
        assert_eq!(backend.preference, BackendPreference::Cpu);
    }

    #[test]
    fn class_filter_accepts_names_and_ids() {
        let args = parse(&["--input", "x.jpg", "--classes", "dog,0, car ,dog"]);
        let mut settings = AppSettings::default();
        apply_class_filter(&mut settings, &args.classes, &ClassLabels::coco()).unwrap();
        assert_eq!(settings.detection.classes, vec![0, 2, 16]);

        let err = apply_class_filter(
            &mut settings,
            &["unicorn".to_string()],
            &ClassLabels::coco(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn telemetry_level_off_disables_telemetry() {
        let args = parse(&["--input", "x.jpg", "--telemetry", "--telemetry-level", "OFF"]);
        let mut settings = AppSettings::default();
        apply_cli_overrides(&mut settings, &args);
        assert!(!settings.telemetry.enabled);
        assert_eq!(settings.telemetry.level, "off");
    }

    #[test]
    fn default_model_path_is_used() {
        let mut settings = AppSettings::default();
        settings.model_path = None;
        assert_eq!(model_path(&settings), Path::new(DEFAULT_MODEL_PATH));
    }
}
