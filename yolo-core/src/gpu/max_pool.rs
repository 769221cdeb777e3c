use super::utils::{ComputeKernel, KernelLaunch, compute_output_dim, to_u32};
use crate::graph::KernelKind;

use anyhow::{Context, Result};
use yolo_utils::{create_gpu_pipeline, gpu_uniforms, storage_buffer_entry, uniform_buffer_entry};

const POOL_WORKGROUP_X: u32 = 8;
const POOL_WORKGROUP_Y: u32 = 8;

pub(crate) fn pipeline(device: &wgpu::Device) -> ComputeKernel {
    ComputeKernel::new(
        KernelKind::MaxPool,
        create_gpu_pipeline!(
            device,
            "max_pool",
            super::MAX_POOL_WGSL,
            [
                storage_buffer_entry!(0, read_only),
                storage_buffer_entry!(1, read_write),
                uniform_buffer_entry!(2),
            ]
        ),
    )
}

#[derive(Debug, Clone)]
pub struct MaxPoolConfig {
    pub channels: u32,
    pub input_width: u32,
    pub input_height: u32,
    pub kernel: u32,
    pub stride: u32,
    pub pad: u32,
    pub output_width: u32,
    pub output_height: u32,
}

impl MaxPoolConfig {
    pub fn new(
        input_dims: [usize; 4],
        kernel: usize,
        stride: usize,
        pad: usize,
    ) -> Result<Self> {
        let [batch, channels, height, width] = input_dims;
        anyhow::ensure!(batch == 1, "only batch size 1 is supported (got {batch})");
        anyhow::ensure!(channels > 0, "channels must be > 0");
        anyhow::ensure!(width > 0 && height > 0, "spatial dims must be > 0");
        let (kernel, stride, pad) = (
            to_u32(kernel, "kernel")?,
            to_u32(stride, "stride")?,
            to_u32(pad, "padding")?,
        );
        let input_width = to_u32(width, "input width")?;
        let input_height = to_u32(height, "input height")?;
        let output_width = compute_output_dim(input_width, pad, kernel, stride)
            .context("pool width config invalid")?;
        let output_height = compute_output_dim(input_height, pad, kernel, stride)
            .context("pool height config invalid")?;
        Ok(Self {
            channels: to_u32(channels, "channels")?,
            input_width,
            input_height,
            kernel,
            stride,
            pad,
            output_width,
            output_height,
        })
    }

    pub fn output_dims(&self) -> [usize; 4] {
        [
            1,
            self.channels as usize,
            self.output_height as usize,
            self.output_width as usize,
        ]
    }
}

gpu_uniforms!(pub(crate) MaxPoolUniforms, 0, {
    input_width: u32,
    input_height: u32,
    channels: u32,
    output_width: u32,
    output_height: u32,
    kernel: u32,
    stride: u32,
    pad: u32,
});

impl KernelLaunch for MaxPoolConfig {
    type Uniforms = MaxPoolUniforms;

    fn kind(&self) -> KernelKind {
        KernelKind::MaxPool
    }

    fn uniforms(&self) -> MaxPoolUniforms {
        MaxPoolUniforms {
            input_width: self.input_width,
            input_height: self.input_height,
            channels: self.channels,
            output_width: self.output_width,
            output_height: self.output_height,
            kernel: self.kernel,
            stride: self.stride,
            pad: self.pad,
            __padding: [],
        }
    }

    fn workgroups(&self) -> [u32; 3] {
        [
            self.output_width.div_ceil(POOL_WORKGROUP_X),
            self.output_height.div_ceil(POOL_WORKGROUP_Y),
            self.channels,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sppf_pool_keeps_spatial_size() {
        let config = MaxPoolConfig::new([1, 128, 20, 20], 5, 1, 2).unwrap();
        assert_eq!(config.output_dims(), [1, 128, 20, 20]);
        assert_eq!(config.workgroups(), [3, 3, 128]);
        assert!(MaxPoolConfig::new([1, 1, 2, 2], 7, 1, 0).is_err());
    }
}
