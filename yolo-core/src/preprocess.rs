//! Preprocessing utilities for preparing images for YOLOv8 inference.
//!
//! Images are letterboxed: scaled uniformly to fit the model input, centred,
//! and padded with grey. The resulting geometry travels with the tensor so
//! detections can be mapped back onto the source image.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use bytemuck::bytes_of;
use image::{DynamicImage, GenericImageView};
use ndarray::{Array4, Axis};
use yolo_utils::{
    GPU_LOG_TARGET, LetterboxGeometry,
    config::{InputDimensions, ResizeQuality},
    gpu::GpuContext,
    gpu_readback_f32, gpu_uniforms, letterbox_rgb, load_image, rgb_to_chw_normalized,
    telemetry::timing_guard,
};

use crate::graph::MAX_STRIDE;

const LETTERBOX_WGSL: &str = include_str!("letterbox.wgsl");
const LETTERBOX_WORKGROUP: u32 = 8;

/// Model input resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSize {
    /// The width of the input tensor.
    pub width: u32,
    /// The height of the input tensor.
    pub height: u32,
}

impl InputSize {
    /// Creates a new `InputSize`.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both sides must be non-zero multiples of the largest head stride.
    pub fn validate(&self) -> Result<()> {
        let stride = MAX_STRIDE as u32;
        anyhow::ensure!(
            self.width > 0
                && self.height > 0
                && self.width.is_multiple_of(stride)
                && self.height.is_multiple_of(stride),
            "input size {}x{} must be a non-zero multiple of {stride}",
            self.width,
            self.height
        );
        Ok(())
    }
}

impl Default for InputSize {
    fn default() -> Self {
        Self {
            width: 640,
            height: 640,
        }
    }
}

/// Configuration for preprocessing an image before inference.
#[derive(Debug, Clone, Default)]
pub struct PreprocessConfig {
    /// The target input size for the model.
    pub input_size: InputSize,
    /// Resize filter preference controlling the quality vs speed trade-off.
    pub resize_quality: ResizeQuality,
}

/// Output of preprocessing: tensor plus the letterbox placement.
#[derive(Debug, Clone)]
pub struct PreprocessOutput {
    /// `[1, 3, H, W]` RGB tensor scaled to `[0, 1]`.
    pub tensor: Array4<f32>,
    /// Where the source image sits inside the tensor.
    pub letterbox: LetterboxGeometry,
}

impl PreprocessOutput {
    /// Dimensions of the source image.
    pub fn original_size(&self) -> (u32, u32) {
        self.letterbox.source
    }
}

/// Preprocess an image from disk using a specific preprocessor implementation.
pub fn preprocess_image_with<P, T>(
    preprocessor: &T,
    path: P,
    config: &PreprocessConfig,
) -> Result<PreprocessOutput>
where
    P: AsRef<Path>,
    T: Preprocessor + ?Sized,
{
    let _guard = timing_guard("yolo_core::preprocess_image", log::Level::Debug);
    let path_ref = path.as_ref();
    anyhow::ensure!(
        path_ref.exists(),
        "input image does not exist: {}",
        path_ref.display()
    );

    let image = load_image(path_ref)
        .with_context(|| format!("failed to load image from {}", path_ref.display()))?;
    preprocessor.preprocess(&image, config)
}

/// Preprocess an in-memory image on the CPU.
pub fn preprocess_dynamic_image(
    image: &DynamicImage,
    config: &PreprocessConfig,
) -> Result<PreprocessOutput> {
    CpuPreprocessor.preprocess(image, config)
}

impl From<InputDimensions> for InputSize {
    fn from(dimensions: InputDimensions) -> Self {
        InputSize::new(dimensions.width, dimensions.height)
    }
}

impl From<&InputDimensions> for PreprocessConfig {
    fn from(dimensions: &InputDimensions) -> Self {
        PreprocessConfig {
            input_size: (*dimensions).into(),
            resize_quality: dimensions.resize_quality,
        }
    }
}

impl From<InputDimensions> for PreprocessConfig {
    fn from(dimensions: InputDimensions) -> Self {
        (&dimensions).into()
    }
}

/// Abstraction over preprocessing backends (CPU, GPU).
pub trait Preprocessor: Send + Sync + std::fmt::Debug {
    /// Letterbox `image` into a model-ready tensor.
    fn preprocess(&self, image: &DynamicImage, config: &PreprocessConfig)
    -> Result<PreprocessOutput>;
}

/// Default CPU implementation backed by `image` + ndarray utilities.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuPreprocessor;

impl Preprocessor for CpuPreprocessor {
    fn preprocess(
        &self,
        image: &DynamicImage,
        config: &PreprocessConfig,
    ) -> Result<PreprocessOutput> {
        let _guard = timing_guard("yolo_core::preprocess_dynamic_image", log::Level::Trace);
        let target = (config.input_size.width, config.input_size.height);
        let letterbox = LetterboxGeometry::compute(image.dimensions(), target)?;
        let canvas = letterbox_rgb(image, &letterbox, config.resize_quality.filter());
        let tensor = rgb_to_chw_normalized(&canvas).insert_axis(Axis(0));
        Ok(PreprocessOutput { tensor, letterbox })
    }
}

/// GPU-backed preprocessor: uploads the image as a texture and letterboxes it
/// with a sampling compute shader.
#[derive(Clone)]
pub struct WgpuPreprocessor {
    context: Arc<GpuContext>,
    pipeline: Arc<LetterboxPipeline>,
    idle: Arc<Mutex<Vec<LetterboxBuffers>>>,
}

impl std::fmt::Debug for WgpuPreprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuPreprocessor")
            .field("adapter", &self.context.adapter_info().name)
            .finish()
    }
}

impl WgpuPreprocessor {
    /// Create a GPU preprocessor from an existing `GpuContext`.
    pub fn new(context: Arc<GpuContext>) -> Result<Self> {
        let pipeline = LetterboxPipeline::new(context.device());
        Ok(Self {
            context,
            pipeline: Arc::new(pipeline),
            idle: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn acquire(&self, extent: wgpu::Extent3d, output_bytes: u64) -> Result<LetterboxBuffers> {
        let device = self.context.device();
        let cached = self
            .idle
            .lock()
            .map_err(|_| anyhow::anyhow!("letterbox buffer cache poisoned"))?
            .pop();
        Ok(match cached {
            Some(mut buffers) => {
                buffers.ensure(device, extent, output_bytes);
                buffers
            }
            None => LetterboxBuffers::new(device, extent, output_bytes),
        })
    }

    fn recycle(&self, buffers: LetterboxBuffers) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(buffers);
        }
    }
}

impl Preprocessor for WgpuPreprocessor {
    fn preprocess(
        &self,
        image: &DynamicImage,
        config: &PreprocessConfig,
    ) -> Result<PreprocessOutput> {
        let _guard = timing_guard("yolo_core::gpu_preprocess", log::Level::Trace);
        let (dst_w, dst_h) = (config.input_size.width, config.input_size.height);
        let letterbox = LetterboxGeometry::compute(image.dimensions(), (dst_w, dst_h))?;
        let (src_w, src_h) = letterbox.source;

        let device = self.context.device();
        let max_side = device.limits().max_texture_dimension_2d;
        if src_w > max_side || src_h > max_side {
            log::debug!(
                target: GPU_LOG_TARGET,
                "{src_w}x{src_h} image exceeds the {max_side} px texture limit; letterboxing on the CPU"
            );
            return CpuPreprocessor.preprocess(image, config);
        }
        let queue = self.context.queue();
        let extent = wgpu::Extent3d {
            width: src_w,
            height: src_h,
            depth_or_array_layers: 1,
        };
        let output_len = 3 * dst_w as usize * dst_h as usize;
        let output_bytes = (output_len * std::mem::size_of::<f32>()) as u64;
        let buffers = self.acquire(extent, output_bytes)?;

        let rgba = image.to_rgba8();
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &buffers.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            rgba.as_raw(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(4 * src_w),
                rows_per_image: Some(src_h),
            },
            extent,
        );
        let uniforms = LetterboxUniforms {
            src_width: src_w,
            src_height: src_h,
            dst_width: dst_w,
            dst_height: dst_h,
            pad_left: letterbox.pad_left,
            pad_top: letterbox.pad_top,
            resized_width: letterbox.resized.0,
            resized_height: letterbox.resized.1,
            __padding: [],
        };
        queue.write_buffer(&buffers.uniforms, 0, bytes_of(&uniforms));

        let view = buffers
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = match config.resize_quality {
            ResizeQuality::Quality => &self.pipeline.linear,
            ResizeQuality::Speed => &self.pipeline.nearest,
        };
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("yolo_letterbox_bind_group"),
            layout: &self.pipeline.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: buffers.storage.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: buffers.uniforms.as_entire_binding(),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("yolo_letterbox_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("yolo_letterbox_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                dst_w.div_ceil(LETTERBOX_WORKGROUP),
                dst_h.div_ceil(LETTERBOX_WORKGROUP),
                1,
            );
        }
        encoder.copy_buffer_to_buffer(&buffers.storage, 0, &buffers.readback, 0, output_bytes);
        queue.submit(Some(encoder.finish()));

        let data = gpu_readback_f32!(buffers.readback, device, output_len, "letterbox");
        self.recycle(buffers);

        let tensor = Array4::from_shape_vec((1, 3, dst_h as usize, dst_w as usize), data?)
            .context("failed to shape letterbox output")?;
        Ok(PreprocessOutput { tensor, letterbox })
    }
}

struct LetterboxPipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    linear: wgpu::Sampler,
    nearest: wgpu::Sampler,
}

impl LetterboxPipeline {
    fn new(device: &wgpu::Device) -> Self {
        let (pipeline, bind_group_layout) = yolo_utils::create_gpu_pipeline!(
            device,
            "letterbox",
            LETTERBOX_WGSL,
            [
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                yolo_utils::storage_buffer_entry!(2, read_write),
                yolo_utils::uniform_buffer_entry!(3),
            ]
        );
        let sampler = |label: &str, filter: wgpu::FilterMode| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(label),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: filter,
                min_filter: filter,
                ..Default::default()
            })
        };
        Self {
            linear: sampler("yolo_letterbox_linear", wgpu::FilterMode::Linear),
            nearest: sampler("yolo_letterbox_nearest", wgpu::FilterMode::Nearest),
            pipeline,
            bind_group_layout,
        }
    }
}

gpu_uniforms!(LetterboxUniforms, 0, {
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
    pad_left: u32,
    pad_top: u32,
    resized_width: u32,
    resized_height: u32,
});

const UNIFORM_BUFFER_SIZE: u64 = std::mem::size_of::<LetterboxUniforms>() as u64;

struct LetterboxBuffers {
    texture: wgpu::Texture,
    extent: wgpu::Extent3d,
    storage: wgpu::Buffer,
    readback: wgpu::Buffer,
    output_bytes: u64,
    uniforms: wgpu::Buffer,
}

impl LetterboxBuffers {
    fn new(device: &wgpu::Device, extent: wgpu::Extent3d, output_bytes: u64) -> Self {
        Self {
            texture: create_texture(device, extent),
            extent,
            storage: create_storage(device, output_bytes),
            readback: create_readback(device, output_bytes),
            output_bytes,
            uniforms: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("yolo_letterbox_uniforms"),
                size: UNIFORM_BUFFER_SIZE,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
        }
    }

    /// Recreate whatever no longer fits the next frame.
    fn ensure(&mut self, device: &wgpu::Device, extent: wgpu::Extent3d, output_bytes: u64) {
        if self.extent != extent {
            self.texture = create_texture(device, extent);
            self.extent = extent;
        }
        if self.output_bytes < output_bytes {
            self.storage = create_storage(device, output_bytes);
            self.readback = create_readback(device, output_bytes);
            self.output_bytes = output_bytes;
        }
    }
}

fn create_texture(device: &wgpu::Device, extent: wgpu::Extent3d) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some("yolo_letterbox_source"),
        size: extent,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Unorm,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    })
}

fn create_storage(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("yolo_letterbox_output"),
        size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

fn create_readback(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("yolo_letterbox_readback"),
        size,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use yolo_utils::gpu::{GpuAvailability, GpuContextOptions};

    const FILL: f32 = 114.0 / 255.0;

    fn wide_red_image() -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_pixel(64, 32, Rgb([255u8, 0, 0])))
    }

    fn square_config() -> PreprocessConfig {
        PreprocessConfig {
            input_size: InputSize::new(64, 64),
            ..Default::default()
        }
    }

    #[test]
    fn letterbox_pads_with_grey() {
        let output = preprocess_dynamic_image(&wide_red_image(), &square_config())
            .expect("preprocess should succeed");

        assert_eq!(output.tensor.shape(), &[1, 3, 64, 64]);
        assert_eq!(output.original_size(), (64, 32));
        assert_eq!(output.letterbox.pad_top, 16);
        assert_eq!(output.letterbox.pad_left, 0);

        for channel in 0..3 {
            assert!((output.tensor[[0, channel, 0, 10]] - FILL).abs() < 1e-6);
            assert!((output.tensor[[0, channel, 63, 10]] - FILL).abs() < 1e-6);
        }
        assert_eq!(output.tensor[[0, 0, 32, 10]], 1.0);
        assert_eq!(output.tensor[[0, 1, 32, 10]], 0.0);
    }

    #[test]
    fn tensor_values_are_normalized() {
        let mut img = ImageBuffer::<Rgb<u8>, _>::new(40, 30);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = Rgb([(x * 6) as u8, (y * 8) as u8, 200]);
        }
        let output = preprocess_dynamic_image(&DynamicImage::ImageRgb8(img), &square_config())
            .expect("preprocess");
        assert!(output.tensor.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(output.letterbox.resized, (64, 48));
    }

    #[test]
    fn converts_dimensions_into_configs() {
        let dims = InputDimensions {
            width: 320,
            height: 256,
            resize_quality: ResizeQuality::Speed,
        };

        let size: InputSize = dims.into();
        assert_eq!(size, InputSize::new(320, 256));

        let config: PreprocessConfig = dims.into();
        assert_eq!(config.input_size, size);
        assert_eq!(config.resize_quality, ResizeQuality::Speed);
    }

    #[test]
    fn input_size_must_align_to_stride() {
        assert!(InputSize::new(640, 480).validate().is_ok());
        assert!(InputSize::new(100, 64).validate().is_err());
        assert!(InputSize::new(0, 64).validate().is_err());
    }

    #[test]
    fn gpu_letterbox_matches_cpu_without_rescale() {
        let context = match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
            GpuAvailability::Available(ctx) => ctx,
            other => {
                eprintln!("Skipping GPU letterbox test: {:?}", other.status().summary);
                return;
            }
        };
        let gpu = WgpuPreprocessor::new(context).expect("gpu preprocessor");
        let image = wide_red_image();
        let config = square_config();

        let cpu_out = preprocess_dynamic_image(&image, &config).expect("cpu preprocess");
        let gpu_out = gpu.preprocess(&image, &config).expect("gpu preprocess");

        assert_eq!(gpu_out.letterbox, cpu_out.letterbox);
        assert_eq!(gpu_out.tensor.shape(), cpu_out.tensor.shape());
        let max_diff = gpu_out
            .tensor
            .iter()
            .zip(cpu_out.tensor.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_diff < 1e-3, "letterbox mismatch (max diff {max_diff})");

        // A second frame reuses the cached buffers.
        let again = gpu.preprocess(&image, &config).expect("gpu preprocess again");
        assert_eq!(again.tensor, gpu_out.tensor);
    }

    #[test]
    fn oversized_images_letterbox_on_cpu() {
        let context = match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
            GpuAvailability::Available(ctx) => ctx,
            other => {
                eprintln!("Skipping GPU texture limit test: {:?}", other.status().summary);
                return;
            }
        };
        let too_wide = context.device().limits().max_texture_dimension_2d + 1;
        let gpu = WgpuPreprocessor::new(context).expect("gpu preprocessor");
        let image =
            DynamicImage::ImageRgb8(ImageBuffer::from_pixel(too_wide, 2, Rgb([10u8, 200, 30])));
        let config = square_config();

        let gpu_out = gpu.preprocess(&image, &config).expect("oversized preprocess");
        let cpu_out = preprocess_dynamic_image(&image, &config).expect("cpu preprocess");
        assert_eq!(gpu_out.letterbox, cpu_out.letterbox);
        assert_eq!(gpu_out.tensor, cpu_out.tensor);
    }
}
