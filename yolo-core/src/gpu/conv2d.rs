use super::utils::{ComputeKernel, KernelLaunch, compute_output_dim, to_u32};
use crate::graph::{Activation, ConvGeometry, KernelKind};

use anyhow::{Context, Result};
use yolo_utils::{create_gpu_pipeline, gpu_uniforms, storage_buffer_entry, uniform_buffer_entry};

const CONV_WORKGROUP_X: u32 = 8;
const CONV_WORKGROUP_Y: u32 = 8;
/// Must match `PIXELS_PER_THREAD` in `conv2d.wgsl`.
pub(crate) const PIXELS_PER_THREAD: u32 = 4;

pub(crate) fn pipeline(device: &wgpu::Device) -> ComputeKernel {
    ComputeKernel::new(
        KernelKind::Conv2d,
        create_gpu_pipeline!(
            device,
            "conv2d",
            super::CONV2D_WGSL,
            [
                storage_buffer_entry!(0, read_only),
                storage_buffer_entry!(1, read_only),
                storage_buffer_entry!(2, read_only),
                storage_buffer_entry!(3, read_write),
                uniform_buffer_entry!(4),
            ]
        ),
    )
}

#[derive(Debug, Clone, Copy)]
pub struct Conv2dChannels {
    pub input: u32,
    pub output: u32,
}

impl Conv2dChannels {
    pub const fn new(input: u32, output: u32) -> Self {
        Self { input, output }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpatialDims {
    pub width: u32,
    pub height: u32,
}

impl SpatialDims {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn square(size: u32) -> Self {
        Self::new(size, size)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Conv2dOptions {
    pub groups: u32,
    pub activation: Option<Activation>,
}

impl Conv2dOptions {
    pub const fn new(groups: u32, activation: Option<Activation>) -> Self {
        Self { groups, activation }
    }
}

/// Geometry for a convolution layer.
#[derive(Debug, Clone)]
pub struct Conv2dConfig {
    pub input_channels: u32,
    pub output_channels: u32,
    pub input_width: u32,
    pub input_height: u32,
    pub kernel_width: u32,
    pub kernel_height: u32,
    pub stride_x: u32,
    pub stride_y: u32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub groups: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub activation: Option<Activation>,
}

impl Conv2dConfig {
    /// Create a validated convolution configuration.
    pub fn new(
        channels: Conv2dChannels,
        input: SpatialDims,
        kernel: SpatialDims,
        stride: SpatialDims,
        pad: SpatialDims,
        options: Conv2dOptions,
    ) -> Result<Self> {
        let Conv2dOptions { groups, activation } = options;
        let Conv2dChannels {
            input: input_channels,
            output: output_channels,
        } = channels;
        anyhow::ensure!(input_channels > 0, "input channels must be > 0");
        anyhow::ensure!(output_channels > 0, "output channels must be > 0");
        anyhow::ensure!(
            kernel.width > 0 && kernel.height > 0,
            "kernel must be non-zero"
        );
        anyhow::ensure!(stride.width > 0 && stride.height > 0, "stride must be non-zero");
        anyhow::ensure!(groups > 0, "groups must be > 0");
        anyhow::ensure!(
            input_channels.is_multiple_of(groups),
            "input channels ({input_channels}) must be divisible by groups ({groups})"
        );
        anyhow::ensure!(
            output_channels.is_multiple_of(groups),
            "output channels ({output_channels}) must be divisible by groups ({groups})"
        );

        let output_width = compute_output_dim(input.width, pad.width, kernel.width, stride.width)
            .context("invalid convolution width configuration")?;
        let output_height =
            compute_output_dim(input.height, pad.height, kernel.height, stride.height)
                .context("invalid convolution height configuration")?;

        Ok(Self {
            input_channels,
            output_channels,
            input_width: input.width,
            input_height: input.height,
            kernel_width: kernel.width,
            kernel_height: kernel.height,
            stride_x: stride.width,
            stride_y: stride.height,
            pad_x: pad.width,
            pad_y: pad.height,
            groups,
            output_width,
            output_height,
            activation,
        })
    }

    /// Configuration for a graph convolution reading a value of `input_dims`.
    pub fn for_layer(
        input_dims: [usize; 4],
        output_channels: usize,
        geometry: ConvGeometry,
        activation: Option<Activation>,
    ) -> Result<Self> {
        let [batch, channels, height, width] = input_dims;
        anyhow::ensure!(batch == 1, "only batch size 1 is supported (got {batch})");
        Self::new(
            Conv2dChannels::new(
                to_u32(channels, "input channels")?,
                to_u32(output_channels, "output channels")?,
            ),
            SpatialDims::new(to_u32(width, "input width")?, to_u32(height, "input height")?),
            SpatialDims::square(to_u32(geometry.kernel, "kernel")?),
            SpatialDims::square(to_u32(geometry.stride, "stride")?),
            SpatialDims::square(to_u32(geometry.pad, "padding")?),
            Conv2dOptions::new(to_u32(geometry.groups, "groups")?, activation),
        )
    }

    pub fn input_shape_dims(&self) -> [usize; 4] {
        [
            1,
            self.input_channels as usize,
            self.input_height as usize,
            self.input_width as usize,
        ]
    }

    pub fn output_shape_dims(&self) -> [usize; 4] {
        [
            1,
            self.output_channels as usize,
            self.output_height as usize,
            self.output_width as usize,
        ]
    }

    pub fn weight_shape_dims(&self) -> [usize; 4] {
        [
            self.output_channels as usize,
            (self.input_channels / self.groups) as usize,
            self.kernel_height as usize,
            self.kernel_width as usize,
        ]
    }

    pub fn bias_shape_dims(&self) -> [usize; 1] {
        [self.output_channels as usize]
    }

    pub fn validate(&self, input_len: usize, weight_len: usize, bias_len: usize) -> Result<()> {
        let expected_input: usize = self.input_shape_dims().iter().product();
        anyhow::ensure!(
            input_len == expected_input,
            "conv input tensor expected {expected_input} elements, got {input_len}"
        );
        let expected_weights: usize = self.weight_shape_dims().iter().product();
        anyhow::ensure!(
            weight_len == expected_weights,
            "conv weights expected {expected_weights} elements, got {weight_len}"
        );
        anyhow::ensure!(
            bias_len == self.output_channels as usize,
            "conv bias expected {} elements, got {bias_len}",
            self.output_channels
        );
        Ok(())
    }
}

gpu_uniforms!(pub(crate) Conv2dUniforms, 2, {
    input_width: u32,
    input_height: u32,
    input_channels: u32,
    output_width: u32,
    output_height: u32,
    output_channels: u32,
    kernel_width: u32,
    kernel_height: u32,
    stride_x: u32,
    stride_y: u32,
    pad_x: u32,
    pad_y: u32,
    groups: u32,
    activation_mode: u32,
});

impl KernelLaunch for Conv2dConfig {
    type Uniforms = Conv2dUniforms;

    fn kind(&self) -> KernelKind {
        KernelKind::Conv2d
    }

    fn uniforms(&self) -> Conv2dUniforms {
        Conv2dUniforms {
            input_width: self.input_width,
            input_height: self.input_height,
            input_channels: self.input_channels,
            output_width: self.output_width,
            output_height: self.output_height,
            output_channels: self.output_channels,
            kernel_width: self.kernel_width,
            kernel_height: self.kernel_height,
            stride_x: self.stride_x,
            stride_y: self.stride_y,
            pad_x: self.pad_x,
            pad_y: self.pad_y,
            groups: self.groups,
            activation_mode: Activation::code(self.activation),
            __padding: [0; 2],
        }
    }

    fn workgroups(&self) -> [u32; 3] {
        [
            self.output_width
                .div_ceil(CONV_WORKGROUP_X * PIXELS_PER_THREAD),
            self.output_height.div_ceil(CONV_WORKGROUP_Y),
            self.output_channels,
        ]
    }
}
