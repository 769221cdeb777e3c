//! `yolo-cli`: run YOLOv8 over images and emit JSON detections.

mod annotate;
mod args;
mod config;
mod input;
mod types;

use std::{
    fs::{self, File},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use yolo_core::{Graph, PostprocessConfig, PreprocessConfig, YoloDetector, YoloModel};
use yolo_utils::{configure_telemetry, init_logging, normalize_path};

use crate::{
    annotate::annotate_image,
    args::DetectArgs,
    config::{
        apply_class_filter, apply_cli_overrides, backend_config, load_labels, load_settings,
        model_path, model_variant,
    },
    input::collect_images,
    types::{DetectionRecord, ImageDetections},
};

fn main() -> Result<()> {
    init_logging(log::LevelFilter::Info)?;
    let args = DetectArgs::parse();

    let mut settings = load_settings(args.config.as_ref())?;
    apply_cli_overrides(&mut settings, &args);
    configure_telemetry(
        settings.telemetry.enabled,
        settings.telemetry.level_filter(),
    );

    let labels = load_labels(&settings)?;
    apply_class_filter(&mut settings, &args.classes, &labels)?;

    let preprocess_config: PreprocessConfig = settings.input.into();
    let postprocess_config: PostprocessConfig = (&settings.detection).into();
    let input_size = preprocess_config.input_size;
    let model_path = normalize_path(model_path(&settings))?;
    let variant = model_variant(&settings)?;

    info!(
        "Loading YOLOv8 weights from {} at resolution {}x{}",
        model_path.display(),
        input_size.width,
        input_size.height
    );
    let model = YoloModel::load(&model_path, variant, input_size)?;
    if args.print_plan {
        print_plan(model.graph());
        return Ok(());
    }
    if model.num_classes() != labels.len() {
        warn!(
            "model predicts {} classes but {} labels are loaded",
            model.num_classes(),
            labels.len()
        );
    }

    let detector = YoloDetector::from_model(
        model,
        preprocess_config,
        postprocess_config,
        backend_config(args.backend, &settings),
    )?;
    if let Some(status) = detector.gpu_status() {
        match status.detail.as_deref() {
            Some(detail) => info!("{} ({detail})", status.summary),
            None => info!("{}", status.summary),
        }
    }

    let input_path = match args.input.as_ref() {
        Some(path) => normalize_path(path)?,
        None => anyhow::bail!("--input is required unless --print-plan is set"),
    };
    let annotate_dir = match args.annotate.as_ref() {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| {
                format!("failed to create annotation directory {}", dir.display())
            })?;
            Some(normalize_path(dir)?)
        }
        None => None,
    };

    let images = collect_images(&input_path)?;
    info!("Processing {} image(s)...", images.len());
    let mut results = Vec::with_capacity(images.len());
    for image_path in images {
        let output = match detector.detect_path(&image_path) {
            Ok(output) => output,
            Err(err) => {
                warn!("Failed to process {}: {err:#}", image_path.display());
                continue;
            }
        };
        info!(
            "{} -> {} detection(s)",
            image_path.display(),
            output.detections.len()
        );

        let annotated = annotate_dir.as_ref().and_then(|dir| {
            match annotate_image(&image_path, &output.detections, dir) {
                Ok(path) => {
                    info!("Annotated image saved to {}", path.display());
                    Some(path.display().to_string())
                }
                Err(err) => {
                    warn!("Failed to annotate {}: {err:#}", image_path.display());
                    None
                }
            }
        });

        results.push(ImageDetections {
            image: image_path.display().to_string(),
            backend: output.backend,
            detections: output
                .detections
                .iter()
                .map(|det| DetectionRecord::new(det, &labels))
                .collect(),
            annotated,
        });
    }

    if results.is_empty() {
        anyhow::bail!("all detections failed; cannot produce output");
    }
    write_results(args.json.as_ref(), &results)
}

fn print_plan(graph: &Graph) {
    print!("{}", graph.describe());
    println!(
        "output {:?} over {} anchors",
        graph.output_dims(),
        graph.anchor_count()
    );
}

fn write_results(json_path: Option<&PathBuf>, results: &[ImageDetections]) -> Result<()> {
    match json_path {
        Some(json_path) => {
            if let Some(dir) = json_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create directory {}", dir.display()))?;
            }
            let file = File::create(json_path)
                .with_context(|| format!("failed to create {}", json_path.display()))?;
            serde_json::to_writer_pretty(file, results).with_context(|| {
                format!("failed to write detection JSON to {}", json_path.display())
            })?;
            info!("Wrote detections to {}", json_path.display());
        }
        None => {
            let json =
                serde_json::to_string_pretty(results).context("failed to serialize detections")?;
            println!("{json}");
        }
    }
    Ok(())
}
