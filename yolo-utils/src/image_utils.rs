use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, Rgb, RgbImage, imageops, imageops::FilterType};
use ndarray::Array3;

/// Grey level used to fill letterbox borders.
pub const LETTERBOX_FILL: u8 = 114;

/// Load an image from disk into memory.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path_ref = path.as_ref();
    image::open(path_ref).with_context(|| format!("failed to open image {}", path_ref.display()))
}

/// Placement of a source image inside a letterboxed model input.
///
/// The source is scaled uniformly by `scale`, rounded to `resized`, and
/// placed at (`pad_left`, `pad_top`); the remaining border is filled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxGeometry {
    pub source: (u32, u32),
    pub target: (u32, u32),
    pub resized: (u32, u32),
    pub scale: f32,
    pub pad_left: u32,
    pub pad_top: u32,
}

impl LetterboxGeometry {
    /// Compute the letterbox placement of `source` inside `target`.
    pub fn compute(source: (u32, u32), target: (u32, u32)) -> Result<Self> {
        let (src_w, src_h) = source;
        let (dst_w, dst_h) = target;
        anyhow::ensure!(
            src_w > 0 && src_h > 0,
            "source dimensions must be non-zero"
        );
        anyhow::ensure!(
            dst_w > 0 && dst_h > 0,
            "target dimensions must be non-zero"
        );

        let scale = (dst_w as f32 / src_w as f32).min(dst_h as f32 / src_h as f32);
        let new_w = ((src_w as f32 * scale).round() as u32).clamp(1, dst_w);
        let new_h = ((src_h as f32 * scale).round() as u32).clamp(1, dst_h);

        // Split the border evenly, giving the odd pixel to the bottom/right side.
        let half_w = (dst_w - new_w) as f32 / 2.0;
        let half_h = (dst_h - new_h) as f32 / 2.0;
        let pad_left = (half_w - 0.1).round().max(0.0) as u32;
        let pad_top = (half_h - 0.1).round().max(0.0) as u32;

        Ok(Self {
            source,
            target,
            resized: (new_w, new_h),
            scale,
            pad_left,
            pad_top,
        })
    }

    /// Map a point in model-input pixels back to source pixels, clipped to the source.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        let sx = (x - self.pad_left as f32) / self.scale;
        let sy = (y - self.pad_top as f32) / self.scale;
        (
            sx.clamp(0.0, self.source.0 as f32),
            sy.clamp(0.0, self.source.1 as f32),
        )
    }
}

/// Resize `image` into a letterboxed RGB canvas of the geometry's target size.
pub fn letterbox_rgb(
    image: &DynamicImage,
    geometry: &LetterboxGeometry,
    filter: FilterType,
) -> RgbImage {
    let (new_w, new_h) = geometry.resized;
    let resized = if (new_w, new_h) == geometry.source {
        image.to_rgb8()
    } else {
        image.resize_exact(new_w, new_h, filter).to_rgb8()
    };

    let (dst_w, dst_h) = geometry.target;
    let mut canvas = RgbImage::from_pixel(dst_w, dst_h, Rgb([LETTERBOX_FILL; 3]));
    imageops::replace(
        &mut canvas,
        &resized,
        i64::from(geometry.pad_left),
        i64::from(geometry.pad_top),
    );
    canvas
}

/// Convert an RGB image into a planar CHW array scaled to `[0, 1]`.
pub fn rgb_to_chw_normalized(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut array = Array3::<f32>::zeros((3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        let (xi, yi) = (x as usize, y as usize);
        for channel in 0..3 {
            array[(channel, yi, xi)] = f32::from(pixel[channel]) / 255.0;
        }
    }
    array
}
