use super::utils::{ComputeKernel, KernelLaunch, linear_workgroups, to_u32};
use crate::graph::KernelKind;

use anyhow::Result;
use yolo_utils::{create_gpu_pipeline, gpu_uniforms, storage_buffer_entry, uniform_buffer_entry};

/// Must match `WORKGROUP_SIZE` in `decode.wgsl`.
const DECODE_WORKGROUP: u32 = 64;

pub(crate) fn pipeline(device: &wgpu::Device) -> ComputeKernel {
    ComputeKernel::new(
        KernelKind::Decode,
        create_gpu_pipeline!(
            device,
            "decode",
            super::DECODE_WGSL,
            [
                storage_buffer_entry!(0, read_only),
                storage_buffer_entry!(1, read_only),
                storage_buffer_entry!(2, read_write),
                uniform_buffer_entry!(3),
            ]
        ),
    )
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeConfig {
    pub width: u32,
    pub height: u32,
    pub num_classes: u32,
    pub reg_max: u32,
    pub stride: u32,
}

impl DecodeConfig {
    /// `box_dims` is the `[1, 4 * reg_max, H, W]` regression map of the level.
    pub fn new(
        box_dims: [usize; 4],
        stride: usize,
        reg_max: usize,
        num_classes: usize,
    ) -> Result<Self> {
        let [batch, channels, height, width] = box_dims;
        anyhow::ensure!(batch == 1, "only batch size 1 is supported (got {batch})");
        anyhow::ensure!(
            reg_max > 0 && channels == 4 * reg_max,
            "box map has {channels} channels, expected 4 x {reg_max}"
        );
        anyhow::ensure!(num_classes > 0, "num_classes must be > 0");
        Ok(Self {
            width: to_u32(width, "level width")?,
            height: to_u32(height, "level height")?,
            num_classes: to_u32(num_classes, "num_classes")?,
            reg_max: to_u32(reg_max, "reg_max")?,
            stride: to_u32(stride, "stride")?,
        })
    }

    pub fn output_dims(&self) -> [usize; 4] {
        [
            1,
            4 + self.num_classes as usize,
            (self.width * self.height) as usize,
            1,
        ]
    }
}

gpu_uniforms!(pub(crate) DecodeUniforms, 3, {
    width: u32,
    height: u32,
    num_classes: u32,
    reg_max: u32,
    stride: f32,
});

impl KernelLaunch for DecodeConfig {
    type Uniforms = DecodeUniforms;

    fn kind(&self) -> KernelKind {
        KernelKind::Decode
    }

    fn uniforms(&self) -> DecodeUniforms {
        DecodeUniforms {
            width: self.width,
            height: self.height,
            num_classes: self.num_classes,
            reg_max: self.reg_max,
            stride: self.stride as f32,
            __padding: [0; 3],
        }
    }

    fn workgroups(&self) -> [u32; 3] {
        linear_workgroups(self.width * self.height, DECODE_WORKGROUP)
    }
}
