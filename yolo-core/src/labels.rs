//! Class names for detections.

use std::{borrow::Cow, fs, path::Path};

use anyhow::{Context, Result};

/// The 80 COCO classes YOLOv8 checkpoints are trained on.
pub const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

/// Lookup table from class id to display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabels {
    names: Vec<String>,
}

impl Default for ClassLabels {
    fn default() -> Self {
        Self::coco()
    }
}

impl ClassLabels {
    pub fn coco() -> Self {
        Self::new(COCO_CLASSES.iter().map(|name| name.to_string()).collect())
    }

    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// One label per line; blank lines are skipped and names are trimmed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read label file {}", path.display()))?;
        let names: Vec<String> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        anyhow::ensure!(!names.is_empty(), "label file {} is empty", path.display());
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name of `class_id`, or `class{id}` when the table has no entry.
    pub fn name(&self, class_id: usize) -> Cow<'_, str> {
        match self.names.get(class_id) {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(format!("class{class_id}")),
        }
    }

    /// Resolve a class given either by id or by (case-insensitive) name.
    pub fn resolve(&self, query: &str) -> Result<usize> {
        let query = query.trim();
        if let Ok(id) = query.parse::<usize>() {
            return Ok(id);
        }
        self.names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(query))
            .with_context(|| format!("unknown class '{query}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn coco_names_and_fallback() {
        let labels = ClassLabels::coco();
        assert_eq!(labels.len(), 80);
        assert_eq!(labels.name(0), "person");
        assert_eq!(labels.name(79), "toothbrush");
        assert_eq!(labels.name(80), "class80");
    }

    #[test]
    fn resolves_ids_and_names() {
        let labels = ClassLabels::coco();
        assert_eq!(labels.resolve("2").unwrap(), 2);
        assert_eq!(labels.resolve(" Dog ").unwrap(), 16);
        assert_eq!(labels.resolve("traffic light").unwrap(), 9);
        assert!(labels.resolve("unicorn").is_err());
    }

    #[test]
    fn loads_label_files() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "widget\n\n  gadget  \n").unwrap();
        let labels = ClassLabels::from_file(file.path()).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.name(1), "gadget");

        let empty = NamedTempFile::new().unwrap();
        assert!(ClassLabels::from_file(empty.path()).is_err());
    }
}
