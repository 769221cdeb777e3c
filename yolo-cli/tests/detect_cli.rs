use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use image::{ImageBuffer, Rgb};
use serde::Deserialize;
use tempfile::{TempDir, tempdir};
use yolo_core::{Graph, ModelVariant, WeightStore};

const SIZE: usize = 64;
const CLASSES: usize = 3;

#[derive(Debug, Deserialize)]
struct CliImageRecord {
    image: String,
    backend: String,
    detections: Vec<CliDetection>,
    annotated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CliDetection {
    class_id: usize,
    label: String,
    score: f32,
    bbox: [f32; 4],
}

struct Workspace {
    dir: TempDir,
    model: PathBuf,
    image: PathBuf,
}

fn workspace() -> Result<Workspace, Box<dyn Error>> {
    let dir = tempdir()?;
    let graph = Graph::yolov8(ModelVariant::Nano, CLASSES, SIZE, SIZE)?;
    let specs = graph.required_tensors();
    let store = WeightStore::synthetic(specs.iter().map(|(n, d)| (n.as_str(), d.as_slice())), 11);
    let model = dir.path().join("yolov8n-test.safetensors");
    store.save(&model)?;

    let image = dir.path().join("sample.png");
    let img = ImageBuffer::from_fn(SIZE as u32, SIZE as u32, |x, y| {
        let r = ((x * 3 + y) % 255) as u8;
        Rgb([r, 128, 255u8.saturating_sub(r)])
    });
    img.save(&image)?;

    Ok(Workspace { dir, model, image })
}

fn run_cli_detection(
    ws: &Workspace,
    input: &Path,
    extra_args: &[&str],
) -> Result<Vec<CliImageRecord>, Box<dyn Error>> {
    let json_path = ws.dir.path().join("out.json");
    let mut cmd = cargo_bin_cmd!("yolo-cli");
    cmd.arg("--input")
        .arg(input)
        .arg("--model")
        .arg(&ws.model)
        .args(["--backend", "cpu", "--width", "64", "--height", "64"])
        .arg("--json")
        .arg(&json_path)
        .args(extra_args);

    cmd.assert().success();
    let payload = fs::read_to_string(&json_path)?;
    Ok(serde_json::from_str(&payload)?)
}

#[test]
fn detect_single_image_produces_json_output() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    let records = run_cli_detection(
        &ws,
        &ws.image,
        &["--score-threshold", "0.0", "--max-detections", "4"],
    )?;

    assert_eq!(records.len(), 1, "expected exactly one CLI output entry");
    let record = &records[0];
    assert_eq!(record.image, ws.image.canonicalize()?.display().to_string());
    assert_eq!(record.backend, "cpu");
    assert!(record.annotated.is_none());
    assert!(!record.detections.is_empty());
    assert!(record.detections.len() <= 4);
    for det in &record.detections {
        assert!(det.class_id < CLASSES);
        assert_eq!(det.label, yolo_core::COCO_CLASSES[det.class_id]);
        assert!((0.0..=1.0).contains(&det.score));
        assert!(det.bbox[2] > 0.0 && det.bbox[3] > 0.0);
    }
    Ok(())
}

#[test]
fn class_filter_and_custom_labels_apply() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    let labels = ws.dir.path().join("labels.txt");
    fs::write(&labels, "apple\nbanana\ncherry\n")?;

    let labels_arg = labels.display().to_string();
    let records = run_cli_detection(
        &ws,
        &ws.image,
        &[
            "--labels",
            &labels_arg,
            "--classes",
            "banana",
            "--score-threshold",
            "0.0",
        ],
    )?;
    for det in &records[0].detections {
        assert_eq!(det.class_id, 1);
        assert_eq!(det.label, "banana");
    }
    Ok(())
}

#[test]
fn directory_input_writes_annotations() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    let images = ws.dir.path().join("images");
    fs::create_dir_all(&images)?;
    fs::copy(&ws.image, images.join("a.png"))?;
    fs::copy(&ws.image, images.join("b.png"))?;
    fs::write(images.join("readme.txt"), "not an image")?;
    let annotate_dir = ws.dir.path().join("annotated");

    let annotate_arg = annotate_dir.display().to_string();
    let records = run_cli_detection(
        &ws,
        &images,
        &["--annotate", &annotate_arg, "--score-threshold", "0.0"],
    )?;
    assert_eq!(records.len(), 2);
    assert!(annotate_dir.join("a.png").exists());
    assert!(annotate_dir.join("b.png").exists());
    assert!(records.iter().all(|record| record.annotated.is_some()));
    Ok(())
}

#[test]
fn high_threshold_leaves_image_untouched() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    let annotate_dir = ws.dir.path().join("annotated");
    let annotate_arg = annotate_dir.display().to_string();
    let records = run_cli_detection(
        &ws,
        &ws.image,
        &["--annotate", &annotate_arg, "--score-threshold", "2.0"],
    )?;
    assert!(records[0].detections.is_empty());

    let original = image::open(&ws.image)?.into_rgba8();
    let annotated = image::open(annotate_dir.join("sample.png"))?.into_rgba8();
    assert_eq!(annotated.as_raw(), original.as_raw());
    Ok(())
}

#[test]
fn print_plan_lists_graph_nodes() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    let output = cargo_bin_cmd!("yolo-cli")
        .arg("--model")
        .arg(&ws.model)
        .args(["--width", "64", "--height", "64", "--print-plan"])
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.contains("yolov8n"));
    assert!(stdout.contains("conv2d"));
    assert!(stdout.contains("84 anchors"));
    Ok(())
}

#[test]
fn missing_model_fails() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    cargo_bin_cmd!("yolo-cli")
        .arg("--input")
        .arg(&ws.image)
        .arg("--model")
        .arg(ws.dir.path().join("missing.safetensors"))
        .assert()
        .failure();
    Ok(())
}

#[test]
fn unaligned_input_size_fails() -> Result<(), Box<dyn Error>> {
    let ws = workspace()?;
    cargo_bin_cmd!("yolo-cli")
        .arg("--input")
        .arg(&ws.image)
        .arg("--model")
        .arg(&ws.model)
        .args(["--backend", "cpu", "--width", "60", "--height", "64"])
        .assert()
        .failure();
    Ok(())
}
