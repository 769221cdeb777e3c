//! Serializable detection records written by yolo-cli.

use serde::Serialize;
use yolo_core::{ClassLabels, Detection};

/// A serializable representation of a single detection.
#[derive(Debug, Serialize)]
pub struct DetectionRecord {
    pub class_id: usize,
    pub label: String,
    pub score: f32,
    /// `[x, y, width, height]` in source-image pixels.
    pub bbox: [f32; 4],
}

/// A serializable representation of all detections for a single image.
#[derive(Debug, Serialize)]
pub struct ImageDetections {
    pub image: String,
    pub backend: &'static str,
    pub detections: Vec<DetectionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated: Option<String>,
}

impl DetectionRecord {
    pub fn new(detection: &Detection, labels: &ClassLabels) -> Self {
        Self {
            class_id: detection.class_id,
            label: labels.name(detection.class_id).into_owned(),
            score: detection.score,
            bbox: [
                detection.bbox.x,
                detection.bbox.y,
                detection.bbox.width,
                detection.bbox.height,
            ],
        }
    }
}
