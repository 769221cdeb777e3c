//! YOLOv8 model scaling (depth, width and ratio multiples).

use std::{fmt, str::FromStr};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::weights::WeightStore;

/// Weight holding the stem convolution; its output channels identify the variant.
pub const STEM_WEIGHT: &str = "net.b1.0.conv.weight";
/// Final classification convolution of the first head level.
pub const CLASS_HEAD_WEIGHT: &str = "head.cv3.0.2.weight";

/// Published YOLOv8 scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    Nano,
    Small,
    Medium,
    Large,
    XLarge,
}

/// Depth, width and ratio multiples of a variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Multiples {
    pub depth: f64,
    pub width: f64,
    pub ratio: f64,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 5] = [
        ModelVariant::Nano,
        ModelVariant::Small,
        ModelVariant::Medium,
        ModelVariant::Large,
        ModelVariant::XLarge,
    ];

    pub fn multiples(self) -> Multiples {
        let (depth, width, ratio) = match self {
            ModelVariant::Nano => (0.33, 0.25, 2.0),
            ModelVariant::Small => (0.33, 0.50, 2.0),
            ModelVariant::Medium => (0.67, 0.75, 1.5),
            ModelVariant::Large => (1.0, 1.0, 1.0),
            ModelVariant::XLarge => (1.0, 1.25, 1.0),
        };
        Multiples {
            depth,
            width,
            ratio,
        }
    }

    /// Single-letter suffix used in model names (`yolov8n`).
    pub fn suffix(self) -> &'static str {
        match self {
            ModelVariant::Nano => "n",
            ModelVariant::Small => "s",
            ModelVariant::Medium => "m",
            ModelVariant::Large => "l",
            ModelVariant::XLarge => "x",
        }
    }

    /// `floor(base * width)`.
    pub fn channels(self, base: usize) -> usize {
        (base as f64 * self.multiples().width) as usize
    }

    /// `floor(base * width * ratio)`, the channel count of the deepest stage.
    pub fn ratio_channels(self, base: usize) -> usize {
        let m = self.multiples();
        (base as f64 * m.width * m.ratio) as usize
    }

    /// Number of bottleneck repeats: `max(round(n * depth), 1)`.
    pub fn repeats(self, n: usize) -> usize {
        ((n as f64 * self.multiples().depth).round() as usize).max(1)
    }

    /// Infer the variant from the stem convolution of a weight store.
    pub fn detect(store: &WeightStore) -> Result<Self> {
        let stem = store
            .tensor(STEM_WEIGHT)
            .context("cannot detect model variant")?;
        let out_channels = stem.dims().first().copied().unwrap_or(0);
        Self::ALL
            .into_iter()
            .find(|variant| variant.channels(64) == out_channels)
            .with_context(|| {
                format!("no YOLOv8 variant has a stem with {out_channels} output channels")
            })
    }
}

/// Read the class count from the first classification head.
pub fn detect_num_classes(store: &WeightStore) -> Result<usize> {
    let head = store
        .tensor(CLASS_HEAD_WEIGHT)
        .context("cannot detect number of classes")?;
    match head.dims().first() {
        Some(&classes) if classes > 0 => Ok(classes),
        _ => bail!("{CLASS_HEAD_WEIGHT} has unexpected shape {:?}", head.dims()),
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "yolov8{}", self.suffix())
    }
}

impl FromStr for ModelVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let key = lowered.strip_prefix("yolov8").unwrap_or(&lowered);
        match key {
            "n" | "nano" => Ok(ModelVariant::Nano),
            "s" | "small" => Ok(ModelVariant::Small),
            "m" | "medium" => Ok(ModelVariant::Medium),
            "l" | "large" => Ok(ModelVariant::Large),
            "x" | "xlarge" => Ok(ModelVariant::XLarge),
            other => Err(format!(
                "unknown model variant '{other}'; expected one of n, s, m, l, x"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::WeightTensor;

    #[test]
    fn channel_tables_match_published_models() {
        let stems: Vec<usize> = ModelVariant::ALL.iter().map(|v| v.channels(64)).collect();
        assert_eq!(stems, vec![16, 32, 48, 64, 80]);

        let deepest: Vec<usize> = ModelVariant::ALL
            .iter()
            .map(|v| v.ratio_channels(512))
            .collect();
        assert_eq!(deepest, vec![256, 512, 576, 512, 640]);
    }

    #[test]
    fn repeats_round_and_never_vanish() {
        assert_eq!(ModelVariant::Nano.repeats(3), 1);
        assert_eq!(ModelVariant::Nano.repeats(6), 2);
        assert_eq!(ModelVariant::Medium.repeats(3), 2);
        assert_eq!(ModelVariant::Medium.repeats(6), 4);
        assert_eq!(ModelVariant::XLarge.repeats(6), 6);
        assert_eq!(ModelVariant::Nano.repeats(1), 1);
    }

    #[test]
    fn parses_names_and_suffixes() {
        assert_eq!("n".parse::<ModelVariant>(), Ok(ModelVariant::Nano));
        assert_eq!("YOLOv8x".parse::<ModelVariant>(), Ok(ModelVariant::XLarge));
        assert_eq!(" medium ".parse::<ModelVariant>(), Ok(ModelVariant::Medium));
        assert!("q".parse::<ModelVariant>().is_err());
        assert_eq!(ModelVariant::Small.to_string(), "yolov8s");
    }

    #[test]
    fn detects_variant_and_classes_from_weights() {
        let mut store = WeightStore::default();
        store.insert(
            STEM_WEIGHT,
            WeightTensor::new(vec![48, 3, 3, 3], vec![0.0; 48 * 27]).unwrap(),
        );
        store.insert(
            CLASS_HEAD_WEIGHT,
            WeightTensor::new(vec![20, 96, 1, 1], vec![0.0; 20 * 96]).unwrap(),
        );
        assert_eq!(ModelVariant::detect(&store).unwrap(), ModelVariant::Medium);
        assert_eq!(detect_num_classes(&store).unwrap(), 20);
    }

    #[test]
    fn unknown_stem_width_is_an_error() {
        let mut store = WeightStore::default();
        store.insert(
            STEM_WEIGHT,
            WeightTensor::new(vec![24, 3, 3, 3], vec![0.0; 24 * 27]).unwrap(),
        );
        let err = ModelVariant::detect(&store).unwrap_err();
        assert!(err.to_string().contains("24 output channels"));
        assert!(detect_num_classes(&store).is_err());
    }
}
