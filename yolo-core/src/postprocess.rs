use anyhow::Result;
use ndarray::ArrayView2;
use serde::Serialize;
use std::cmp::Ordering;
use yolo_utils::{LetterboxGeometry, config::DetectionSettings};

/// Rows before the class scores in the head output: `cx, cy, w, h`.
pub const BOX_ROWS: usize = 4;

/// Detection filtering parameters.
#[derive(Debug, Clone)]
pub struct PostprocessConfig {
    /// A candidate survives only when its class confidence is strictly above this.
    pub score_threshold: f32,
    /// IoU above which the lower-scoring of two boxes is suppressed.
    pub iou_threshold: f32,
    /// Candidates kept (by score) before suppression.
    pub max_candidates: usize,
    /// Detections returned per image.
    pub max_detections: usize,
    /// Suppress overlaps across classes instead of per class.
    pub class_agnostic: bool,
    /// Keep only these class ids; empty keeps every class.
    pub allowed_classes: Vec<usize>,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.25,
            iou_threshold: 0.45,
            max_candidates: 30_000,
            max_detections: 300,
            class_agnostic: false,
            allowed_classes: Vec::new(),
        }
    }
}

/// Axis-aligned bounding box in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    /// The x-coordinate of the top-left corner.
    pub x: f32,
    /// The y-coordinate of the top-left corner.
    pub y: f32,
    /// The width of the box.
    pub width: f32,
    /// The height of the box.
    pub height: f32,
}

impl BoundingBox {
    /// Build a box from its corners.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    /// Calculates the area of the bounding box.
    pub fn area(&self) -> f32 {
        (self.width.max(0.0)) * (self.height.max(0.0))
    }

    /// Calculates the Intersection over Union (IoU) with another bounding box.
    pub fn iou(&self, other: &Self) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if intersection <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// A single detection: box, class and confidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    /// Box in source-image pixels.
    pub bbox: BoundingBox,
    /// Index of the winning class.
    pub class_id: usize,
    /// Sigmoid confidence of that class.
    pub score: f32,
}

/// Turn the decoded head output into final detections.
///
/// Each anchor keeps its best class. Candidates not above the score threshold
/// or outside `allowed_classes` are dropped, the rest are sorted by score,
/// capped at `max_candidates` and suppressed greedily. Survivors are mapped
/// from model-input pixels back onto the source image and clipped to it.
///
/// # Arguments
///
/// * `output` - `[4 + classes, anchors]` matrix of `cx, cy, w, h` and class scores.
/// * `letterbox` - Placement used when the image was preprocessed.
/// * `config` - The post-processing parameters.
pub fn apply_postprocess(
    output: ArrayView2<'_, f32>,
    letterbox: &LetterboxGeometry,
    config: &PostprocessConfig,
) -> Result<Vec<Detection>> {
    let (rows, anchors) = output.dim();
    anyhow::ensure!(
        rows > BOX_ROWS,
        "head output must have more than {BOX_ROWS} rows (got {rows})"
    );
    let num_classes = rows - BOX_ROWS;

    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let column = output.column(anchor);
        let mut best = (0usize, f32::NEG_INFINITY);
        for class_id in 0..num_classes {
            let score = column[BOX_ROWS + class_id];
            if score > best.1 {
                best = (class_id, score);
            }
        }
        let (class_id, score) = best;
        if !score.is_finite() || score <= config.score_threshold {
            continue;
        }
        if !config.allowed_classes.is_empty() && !config.allowed_classes.contains(&class_id) {
            continue;
        }

        let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
        candidates.push(Detection {
            bbox: BoundingBox::from_corners(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0),
            class_id,
            score,
        });
    }

    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    if config.max_candidates > 0 && candidates.len() > config.max_candidates {
        candidates.truncate(config.max_candidates);
    }

    let kept = non_max_suppression(
        candidates,
        config.iou_threshold,
        config.class_agnostic,
        config.max_detections,
    );

    Ok(kept
        .into_iter()
        .filter_map(|detection| reproject(detection, letterbox))
        .collect())
}

/// Greedy suppression over score-sorted detections.
fn non_max_suppression(
    detections: Vec<Detection>,
    threshold: f32,
    class_agnostic: bool,
    limit: usize,
) -> Vec<Detection> {
    let mut result: Vec<Detection> = Vec::with_capacity(detections.len().min(limit));
    for detection in detections {
        if limit > 0 && result.len() >= limit {
            break;
        }
        let suppressed = result.iter().any(|kept| {
            (class_agnostic || kept.class_id == detection.class_id)
                && detection.bbox.iou(&kept.bbox) > threshold
        });
        if !suppressed {
            result.push(detection);
        }
    }
    result
}

/// Map a box into source pixels; boxes clipped to nothing are dropped.
fn reproject(detection: Detection, letterbox: &LetterboxGeometry) -> Option<Detection> {
    let BoundingBox {
        x,
        y,
        width,
        height,
    } = detection.bbox;
    let (x1, y1) = letterbox.to_source(x, y);
    let (x2, y2) = letterbox.to_source(x + width, y + height);
    let bbox = BoundingBox::from_corners(x1, y1, x2, y2);
    (bbox.width > 0.0 && bbox.height > 0.0).then_some(Detection { bbox, ..detection })
}

impl From<&DetectionSettings> for PostprocessConfig {
    fn from(settings: &DetectionSettings) -> Self {
        PostprocessConfig {
            score_threshold: settings.score_threshold,
            iou_threshold: settings.iou_threshold,
            max_detections: settings.max_detections,
            class_agnostic: settings.class_agnostic,
            allowed_classes: settings.classes.clone(),
            ..Default::default()
        }
    }
}

impl From<DetectionSettings> for PostprocessConfig {
    fn from(settings: DetectionSettings) -> Self {
        (&settings).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Columns are anchors: `[cx, cy, w, h, scores...]`.
    fn head(columns: &[&[f32]]) -> Array2<f32> {
        let rows = columns[0].len();
        Array2::from_shape_fn((rows, columns.len()), |(r, c)| columns[c][r])
    }

    fn identity() -> LetterboxGeometry {
        LetterboxGeometry::compute((640, 640), (640, 640)).unwrap()
    }

    #[test]
    fn filters_by_score_and_picks_best_class() {
        let output = head(&[
            &[100.0, 100.0, 20.0, 40.0, 0.1, 0.9],
            &[300.0, 300.0, 10.0, 10.0, 0.2, 0.1],
        ]);
        let detections =
            apply_postprocess(output.view(), &identity(), &PostprocessConfig::default()).unwrap();

        assert_eq!(detections.len(), 1);
        let det = &detections[0];
        assert_eq!(det.class_id, 1);
        assert_eq!(det.score, 0.9);
        assert_eq!(det.bbox, BoundingBox::from_corners(90.0, 80.0, 110.0, 120.0));
    }

    #[test]
    fn score_equal_to_threshold_is_dropped() {
        let output = head(&[
            &[100.0, 100.0, 20.0, 20.0, 0.5],
            &[300.0, 300.0, 20.0, 20.0, 0.500_001],
        ]);
        let config = PostprocessConfig {
            score_threshold: 0.5,
            ..Default::default()
        };
        let detections = apply_postprocess(output.view(), &identity(), &config).unwrap();
        assert_eq!(detections.len(), 1);
        assert!(detections[0].score > 0.5);
        assert_eq!(detections[0].bbox.x, 290.0);
    }

    #[test]
    fn candidate_cap_drops_lowest_scores_before_suppression() {
        // Disjoint boxes, so suppression alone would keep all three.
        let output = head(&[
            &[50.0, 50.0, 20.0, 20.0, 0.6],
            &[150.0, 50.0, 20.0, 20.0, 0.9],
            &[250.0, 50.0, 20.0, 20.0, 0.4],
        ]);
        let uncapped =
            apply_postprocess(output.view(), &identity(), &PostprocessConfig::default()).unwrap();
        assert_eq!(uncapped.len(), 3);

        let capped = PostprocessConfig {
            max_candidates: 2,
            ..Default::default()
        };
        let detections = apply_postprocess(output.view(), &identity(), &capped).unwrap();
        let scores: Vec<f32> = detections.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.9, 0.6]);
        assert!(detections.iter().all(|d| d.bbox.x < 200.0));
    }

    #[test]
    fn suppression_is_class_aware_by_default() {
        let output = head(&[
            &[50.0, 50.0, 20.0, 20.0, 0.95, 0.0],
            &[51.0, 51.0, 20.0, 20.0, 0.90, 0.0],
            &[51.0, 51.0, 20.0, 20.0, 0.0, 0.85],
        ]);

        let aware =
            apply_postprocess(output.view(), &identity(), &PostprocessConfig::default()).unwrap();
        assert_eq!(aware.len(), 2);
        assert_eq!((aware[0].class_id, aware[1].class_id), (0, 1));

        let agnostic = PostprocessConfig {
            class_agnostic: true,
            ..Default::default()
        };
        let merged = apply_postprocess(output.view(), &identity(), &agnostic).unwrap();
        assert_eq!(merged.len(), 1);
        assert!((merged[0].score - 0.95).abs() < f32::EPSILON);
    }

    #[test]
    fn respects_detection_limit_and_class_filter() {
        let columns: Vec<Vec<f32>> = (0..10)
            .map(|i| vec![20.0 + 40.0 * i as f32, 20.0, 10.0, 10.0, 0.5 + 0.01 * i as f32, 0.3])
            .collect();
        let refs: Vec<&[f32]> = columns.iter().map(Vec::as_slice).collect();
        let output = head(&refs);

        let limited = PostprocessConfig {
            max_detections: 3,
            ..Default::default()
        };
        let detections = apply_postprocess(output.view(), &identity(), &limited).unwrap();
        assert_eq!(detections.len(), 3);
        assert!(detections.windows(2).all(|w| w[0].score >= w[1].score));

        let only_second = PostprocessConfig {
            allowed_classes: vec![1],
            ..Default::default()
        };
        assert!(
            apply_postprocess(output.view(), &identity(), &only_second)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn reprojects_through_letterbox_and_clips() {
        // 320x160 source letterboxed into 640x640: scale 2, 160 px bars top and bottom.
        let letterbox = LetterboxGeometry::compute((320, 160), (640, 640)).unwrap();
        assert_eq!(letterbox.pad_top, 160);
        let output = head(&[
            &[320.0, 320.0, 200.0, 100.0, 0.8],
            &[10.0, 170.0, 40.0, 40.0, 0.7],
        ]);
        let detections =
            apply_postprocess(output.view(), &letterbox, &PostprocessConfig::default()).unwrap();

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].bbox, BoundingBox::from_corners(110.0, 55.0, 210.0, 105.0));
        // Second box crosses the top-left corner of the image.
        assert_eq!(detections[1].bbox, BoundingBox::from_corners(0.0, 0.0, 15.0, 15.0));
    }

    #[test]
    fn rejects_headless_output() {
        let output = Array2::<f32>::zeros((4, 3));
        let result = apply_postprocess(output.view(), &identity(), &PostprocessConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn iou_of_disjoint_and_identical_boxes() {
        let a = BoundingBox::from_corners(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::from_corners(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        let half = BoundingBox::from_corners(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&half) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn converts_detection_settings_into_config() {
        let settings = DetectionSettings {
            score_threshold: 0.5,
            iou_threshold: 0.6,
            max_detections: 10,
            class_agnostic: true,
            classes: vec![0, 2],
        };
        let config: PostprocessConfig = settings.into();
        assert_eq!(config.score_threshold, 0.5);
        assert_eq!(config.iou_threshold, 0.6);
        assert_eq!(config.max_detections, 10);
        assert!(config.class_agnostic);
        assert_eq!(config.allowed_classes, vec![0, 2]);
        assert_eq!(config.max_candidates, 30_000);
    }
}
