use std::path::Path;

use image::{DynamicImage, Rgb, RgbImage};
use tempfile::TempDir;
use yolo_core::{
    BackendConfig, BackendPreference, Graph, InputSize, ModelVariant, PostprocessConfig,
    PreprocessConfig, WeightStore, YoloDetector, YoloModel,
};
use yolo_utils::gpu::{GpuAvailability, GpuContext, GpuContextOptions};

const SIZE: u32 = 64;
const CLASSES: usize = 5;

fn write_synthetic_weights(dir: &Path) -> anyhow::Result<std::path::PathBuf> {
    let graph = Graph::yolov8(ModelVariant::Nano, CLASSES, SIZE as usize, SIZE as usize)?;
    let specs = graph.required_tensors();
    let store = WeightStore::synthetic(specs.iter().map(|(n, d)| (n.as_str(), d.as_slice())), 3);
    let path = dir.join("yolov8n-synthetic.safetensors");
    store.save(&path)?;
    Ok(path)
}

fn gradient_image(width: u32, height: u32) -> DynamicImage {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8])
    });
    DynamicImage::ImageRgb8(image)
}

fn permissive_postprocess() -> PostprocessConfig {
    PostprocessConfig {
        score_threshold: 0.0,
        max_detections: 5,
        ..Default::default()
    }
}

fn preprocess() -> PreprocessConfig {
    PreprocessConfig {
        input_size: InputSize::new(SIZE, SIZE),
        ..Default::default()
    }
}

#[test]
fn cpu_detector_runs_end_to_end() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let weights = write_synthetic_weights(dir.path())?;
    let image_path = dir.path().join("gradient.png");
    gradient_image(SIZE, SIZE).save(&image_path)?;

    let detector = YoloDetector::new(
        &weights,
        None,
        preprocess(),
        permissive_postprocess(),
        BackendConfig::cpu(),
    )?;
    assert_eq!(detector.backend_name(), "cpu");
    assert_eq!(detector.model().variant(), ModelVariant::Nano);
    assert_eq!(detector.model().num_classes(), CLASSES);

    let output = detector.detect_path(&image_path)?;
    assert_eq!(output.original_size(), (SIZE, SIZE));
    assert!(!output.detections.is_empty());
    assert!(output.detections.len() <= 5);
    for pair in output.detections.windows(2) {
        assert!(pair[0].score >= pair[1].score, "detections must be sorted");
    }
    for det in &output.detections {
        assert!(det.class_id < CLASSES);
        assert!(det.bbox.width > 0.0 && det.bbox.height > 0.0);
        assert!(det.bbox.x >= 0.0 && det.bbox.y >= 0.0);
        assert!(det.bbox.x + det.bbox.width <= SIZE as f32 + 1e-3);
        assert!(det.bbox.y + det.bbox.height <= SIZE as f32 + 1e-3);
    }
    Ok(())
}

#[test]
fn detections_map_back_to_wide_sources() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let weights = write_synthetic_weights(dir.path())?;
    let detector = YoloDetector::new(
        &weights,
        Some(ModelVariant::Nano),
        preprocess(),
        permissive_postprocess(),
        BackendConfig::cpu(),
    )?;

    let output = detector.detect_image(&gradient_image(200, 50))?;
    assert_eq!(output.original_size(), (200, 50));
    assert!(output.letterbox.pad_top > 0);
    for det in &output.detections {
        assert!(det.bbox.x + det.bbox.width <= 200.0 + 1e-3);
        assert!(det.bbox.y + det.bbox.height <= 50.0 + 1e-3);
    }
    Ok(())
}

#[test]
fn wrong_variant_is_rejected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let weights = write_synthetic_weights(dir.path())?;
    let result = YoloDetector::new(
        &weights,
        Some(ModelVariant::Small),
        preprocess(),
        PostprocessConfig::default(),
        BackendConfig::cpu(),
    );
    assert!(result.is_err());
    Ok(())
}

#[test]
fn gpu_detector_matches_cpu_detector() -> anyhow::Result<()> {
    if !matches!(
        GpuContext::init_with_fallback(&GpuContextOptions::default()),
        GpuAvailability::Available(_)
    ) {
        eprintln!("Skipping GPU pipeline test (no adapter)");
        return Ok(());
    }

    let dir = TempDir::new()?;
    let weights = write_synthetic_weights(dir.path())?;
    let model = YoloModel::load(&weights, None, InputSize::new(SIZE, SIZE))?;
    let image = gradient_image(96, 64);

    let cpu = YoloDetector::from_model(
        model.clone(),
        preprocess(),
        permissive_postprocess(),
        BackendConfig::cpu(),
    )?;
    let gpu = YoloDetector::from_model(
        model,
        preprocess(),
        permissive_postprocess(),
        BackendConfig {
            preference: BackendPreference::Gpu,
            ..Default::default()
        },
    )?;
    assert_eq!(gpu.backend_name(), "gpu");

    let expected = cpu.detect_image(&image)?;
    let actual = gpu.detect_image(&image)?;
    assert_eq!(expected.detections.len(), actual.detections.len());
    for (a, b) in expected.detections.iter().zip(&actual.detections) {
        assert!((a.score - b.score).abs() < 1e-2);
        assert!((a.bbox.x - b.bbox.x).abs() < 0.5);
        assert!((a.bbox.width - b.bbox.width).abs() < 0.5);
    }
    Ok(())
}

#[test]
fn bundled_model_detects_when_present() -> anyhow::Result<()> {
    let model_path = Path::new("models/yolov8n.safetensors");
    if !model_path.exists() {
        eprintln!(
            "skipping bundled model test; weights missing at {}",
            model_path.display()
        );
        return Ok(());
    }

    let detector = YoloDetector::new(
        model_path,
        None,
        PreprocessConfig::default(),
        PostprocessConfig::default(),
        BackendConfig::default(),
    )?;
    let output = detector.detect_image(&gradient_image(640, 480))?;
    assert_eq!(output.original_size(), (640, 480));
    Ok(())
}
