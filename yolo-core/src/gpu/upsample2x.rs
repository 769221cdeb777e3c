use super::utils::{ComputeKernel, KernelLaunch, to_u32};
use crate::graph::KernelKind;

use anyhow::Result;
use yolo_utils::{create_gpu_pipeline, gpu_uniforms, storage_buffer_entry, uniform_buffer_entry};

const UPSAMPLE_WORKGROUP_X: u32 = 8;
const UPSAMPLE_WORKGROUP_Y: u32 = 8;

pub(crate) fn pipeline(device: &wgpu::Device) -> ComputeKernel {
    ComputeKernel::new(
        KernelKind::Upsample2x,
        create_gpu_pipeline!(
            device,
            "upsample2x",
            super::UPSAMPLE2X_WGSL,
            [
                storage_buffer_entry!(0, read_only),
                storage_buffer_entry!(1, read_write),
                uniform_buffer_entry!(2),
            ]
        ),
    )
}

#[derive(Debug, Clone, Copy)]
pub struct Upsample2xConfig {
    pub channels: u32,
    pub input_width: u32,
    pub input_height: u32,
}

impl Upsample2xConfig {
    pub fn new(input_dims: [usize; 4]) -> Result<Self> {
        let [batch, channels, height, width] = input_dims;
        anyhow::ensure!(batch == 1, "only batch size 1 is supported (got {batch})");
        Ok(Self {
            channels: to_u32(channels, "channels")?,
            input_width: to_u32(width, "input width")?,
            input_height: to_u32(height, "input height")?,
        })
    }

    pub fn output_dims(&self) -> [usize; 4] {
        [
            1,
            self.channels as usize,
            self.input_height as usize * 2,
            self.input_width as usize * 2,
        ]
    }
}

gpu_uniforms!(pub(crate) Upsample2xUniforms, 1, {
    input_width: u32,
    input_height: u32,
    channels: u32,
});

impl KernelLaunch for Upsample2xConfig {
    type Uniforms = Upsample2xUniforms;

    fn kind(&self) -> KernelKind {
        KernelKind::Upsample2x
    }

    fn uniforms(&self) -> Upsample2xUniforms {
        Upsample2xUniforms {
            input_width: self.input_width,
            input_height: self.input_height,
            channels: self.channels,
            __padding: [0],
        }
    }

    fn workgroups(&self) -> [u32; 3] {
        [
            (self.input_width * 2).div_ceil(UPSAMPLE_WORKGROUP_X),
            (self.input_height * 2).div_ceil(UPSAMPLE_WORKGROUP_Y),
            self.channels,
        ]
    }
}
